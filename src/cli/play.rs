use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use audiotunnel::process::session::AudioSession;
use audiotunnel::stage::soft::SoftBackend;
use audiotunnel::structs::stream::{Encoding, StreamParameters};
use audiotunnel::utils::errors::SessionError;
use audiotunnel::utils::timing::advance_pts;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info, warn};

use super::command::{Cli, PlayArgs};
use super::progress::create_progress_bar;
use crate::config::PlayConfig;
use crate::input::InputReader;
use crate::sink::{FileSink, SinkSummary};
use crate::timestamp::{bytes_duration, time_str};

/// Longest wait for queue space before playback is abandoned.
const STALL_LIMIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Feeds input through a session, keeping bytes the session did not take.
struct Player<'a> {
    session: &'a mut AudioSession,
    pending: Vec<u8>,
    consumed: u64,
    byte_rate: u64,
    timeouts: usize,
}

impl<'a> Player<'a> {
    fn new(session: &'a mut AudioSession, stream: &StreamParameters) -> Self {
        Self {
            session,
            pending: Vec::new(),
            consumed: 0,
            byte_rate: (stream.data_frame_bytes() * stream.sample_rate as usize) as u64,
            timeouts: 0,
        }
    }

    fn pts(&self) -> i64 {
        advance_pts(0, self.consumed as usize, self.byte_rate as usize)
    }

    fn wait_for_space(&self, wanted: usize) -> Result<()> {
        let wanted = wanted.min(self.session.get_chunk_len()).max(1);
        let deadline = Instant::now() + STALL_LIMIT;

        while self.session.get_space() < wanted {
            if Instant::now() > deadline {
                bail!(
                    "Pipeline stalled: {} bytes free after {STALL_LIMIT:?}, {wanted} needed",
                    self.session.get_space()
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(chunk);

        let mut offset = 0;
        while offset < self.pending.len() {
            self.wait_for_space(self.pending.len() - offset)?;

            let pts = self.pts();
            let taken = match self
                .session
                .add_packets(&self.pending[offset..], None, Some(pts))
            {
                // Less than a whole frame left.
                Ok(0) => break,
                Ok(taken) => taken,
                Err(SessionError::BufferTimeout { accepted }) => {
                    debug!("Buffer timeout after {accepted} bytes");
                    self.timeouts += 1;
                    accepted
                }
                Err(e) => return Err(e.into()),
            };

            offset += taken;
            self.consumed += taken as u64;
        }

        self.pending.drain(..offset);
        Ok(())
    }

    /// Waits until every queued buffer has left the decoder.
    fn drain(&self) -> Result<()> {
        let deadline = Instant::now() + STALL_LIMIT;
        while self.session.get_delay() > 0.0 {
            if Instant::now() > deadline {
                bail!(
                    "Pipeline did not drain: {:.3}s still queued",
                    self.session.get_delay()
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

pub fn cmd_play(args: &PlayArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    let config = PlayConfig::for_args(args)?;
    let session_config = config.session_config(args, cli.fail_level());
    let hints = config.stream_hints(args)?;

    let sink = Arc::new(Mutex::new(FileSink::new(args.output.clone())));
    let backend = Arc::new(SoftBackend::new(sink.clone()));
    let mut session = AudioSession::new(backend.clone(), session_config);
    session.initialize(&hints, None)?;

    let Some(stream) = session.stream().cloned() else {
        bail!("Session did not negotiate a stream");
    };
    info!(
        "Playing {}: {} ch, {} Hz, {} bit, {} on {}",
        args.input.display(),
        stream.data_channels,
        stream.sample_rate,
        stream.bits_per_sample,
        stream.encoding,
        session.config().device
    );
    if args.output.is_none() {
        warn!("No --output given, rendered audio is discarded");
    }

    let mut reader = InputReader::new(&args.input)?;
    if reader.is_pipe() {
        debug!("Reading from stdin");
    }
    let pb: Option<ProgressBar> = match multi {
        Some(multi) => Some(create_progress_bar(multi, reader.len(), "Playing...")?),
        None => None,
    };

    let chunk_len = session.get_chunk_len();
    let started = Instant::now();
    let mut player = Player::new(&mut session, &stream);

    reader.process_chunks(chunk_len, |chunk| {
        player.push(chunk)?;
        if let Some(pb) = &pb {
            pb.inc(chunk.len() as u64);
            pb.set_message(format!(
                "cache {:.2}s of {:.2}s",
                player.session.get_cache_time(),
                player.session.get_cache_total()
            ));
        }
        Ok(true)
    })?;
    player.drain()?;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    let report = PlayReport {
        consumed: player.consumed,
        leftover: player.pending.len(),
        timeouts: player.timeouts,
        duration: bytes_duration(player.consumed, player.byte_rate),
        elapsed: started.elapsed(),
    };
    if report.leftover > 0 {
        warn!("Dropped {} trailing bytes that do not fill a frame", report.leftover);
    }

    let sync = session.sync_state();
    let dropped = backend.renderer().map_or(0, |r| r.stats().dropped);
    session.deinitialize();

    let summary = sink
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish()?;

    display_summary(&report, &summary, dropped);
    if stream.encoding == Encoding::Dts {
        println!(
            "  DTS sync                  {} locks, {} losses, {} byte frames at {} Hz",
            sync.locks, sync.losses, sync.frame_size, sync.sample_rate
        );
    }

    Ok(())
}

struct PlayReport {
    consumed: u64,
    leftover: usize,
    timeouts: usize,
    duration: Duration,
    elapsed: Duration,
}

fn display_summary(report: &PlayReport, summary: &SinkSummary, dropped: usize) {
    println!("Playback Summary");
    println!("  Input consumed            {} bytes", report.consumed);
    println!("  Duration                  {}", time_str(report.duration));
    println!("  Elapsed                   {}", time_str(report.elapsed));

    match &summary.format {
        Some(format) => println!("  Output format             {format}"),
        None => println!("  Output format             none"),
    }
    println!(
        "  Rendered                  {} bytes in {} writes",
        summary.bytes, summary.writes
    );
    if summary.flushes > 0 {
        println!("  Output flushes            {}", summary.flushes);
    }
    if dropped > 0 {
        println!("  Dropped buffers           {dropped}");
    }
    if report.timeouts > 0 {
        println!("  Buffer timeouts           {}", report.timeouts);
    }
}
