//! Timestamp arithmetic in the pipeline's microsecond time base.

/// Ticks per second of every presentation timestamp handled by the pipeline.
pub const TIME_BASE: i64 = 1_000_000;

/// Advances `pts` by the playback duration of `bytes` at `bytes_per_second`.
///
/// A zero byte rate leaves the timestamp untouched.
#[inline]
pub fn advance_pts(pts: i64, bytes: usize, bytes_per_second: usize) -> i64 {
    if bytes_per_second == 0 {
        return pts;
    }
    pts + (bytes as i64 * TIME_BASE) / bytes_per_second as i64
}

/// Playback duration of `bytes` in seconds.
#[inline]
pub fn bytes_to_seconds(bytes: usize, bytes_per_second: usize) -> f32 {
    if bytes_per_second == 0 {
        return 0.0;
    }
    bytes as f32 / bytes_per_second as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_pts() {
        // 48 kHz stereo s16: 192000 bytes per second
        assert_eq!(advance_pts(0, 192_000, 192_000), TIME_BASE);
        assert_eq!(advance_pts(500, 6144, 192_000), 500 + 32_000);
        assert_eq!(advance_pts(42, 6144, 0), 42);
    }

    #[test]
    fn test_bytes_to_seconds() {
        assert_eq!(bytes_to_seconds(96_000, 192_000), 0.5);
        assert_eq!(bytes_to_seconds(96_000, 0), 0.0);
    }
}
