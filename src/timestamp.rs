use std::time::Duration;

/// Formats a duration as `HH:MM:SS.mmm`. Hours widen past 99.
pub fn time_str(duration: Duration) -> String {
    let ms = duration.as_millis();
    let hours = ms / 3_600_000;
    let minutes = ms % 3_600_000 / 60_000;
    let seconds = ms % 60_000 / 1000;
    let milliseconds = ms % 1000;

    format!("{hours:02}:{minutes:02}:{seconds:02}.{milliseconds:03}")
}

/// Media duration of `bytes` at `byte_rate` bytes per second.
pub fn bytes_duration(bytes: u64, byte_rate: u64) -> Duration {
    if byte_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(bytes.saturating_mul(1_000_000) / byte_rate)
}
