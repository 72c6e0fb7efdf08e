use anyhow::Result;
use audiotunnel::process::sync::DtsSync;
use audiotunnel::structs::dts::{DtsFrameInfo, FrameType, SYNC_WINDOW};
use indicatif::{MultiProgress, ProgressBar};
use serde::Serialize;

use super::command::{Cli, ProbeArgs};
use super::progress::create_progress_bar;
use crate::input::InputReader;
use crate::timestamp::time_str;

const PROBE_CHUNK: usize = 64 * 1024;

/// Parameters of the first frame found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub variant: String,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub frame_type: String,
    pub dts_type: String,
    pub samples_per_frame: u32,
    pub channels: Option<u8>,
}

impl From<&DtsFrameInfo> for FrameSummary {
    fn from(info: &DtsFrameInfo) -> Self {
        Self {
            variant: info.variant.to_string(),
            sample_rate: info.sample_rate,
            frame_size: info.frame_size,
            frame_type: match info.header.frame_type {
                FrameType::Normal => "normal",
                FrameType::Termination => "termination",
            }
            .to_string(),
            dts_type: format!("{:?}", info.dts_type),
            samples_per_frame: info.header.samples_per_frame(),
            channels: info.channels(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub total_bytes: u64,
    pub frames: u64,
    pub first_frame: Option<FrameSummary>,
    /// Frames whose parameters differ from the previous frame.
    pub parameter_changes: u64,
    /// Frames found after skipping bytes that did not belong to a frame.
    pub resyncs: u64,
    pub skipped_bytes: u64,
    pub rejected_candidates: usize,
    pub duration_ms: u64,
}

/// Walks a byte stream frame by frame.
///
/// Bytes that cannot yet be judged are kept until more input arrives.
#[derive(Default)]
pub struct Prober {
    sync: DtsSync,
    pending: Vec<u8>,
    last: Option<DtsFrameInfo>,
    /// Bytes were skipped since the last frame.
    gap: bool,
    samples: u64,
    summary: ProbeSummary,
}

impl Prober {
    pub fn push(&mut self, chunk: &[u8]) {
        self.summary.total_bytes += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let mut offset = 0;
        while self.pending.len() - offset >= SYNC_WINDOW {
            let skip = self.sync.scan(&self.pending[offset..]);
            let Some(info) = self.sync.frame().copied().filter(|_| self.sync.is_locked()) else {
                // A header at the tail may still be incomplete.
                let keep = SYNC_WINDOW.min(self.pending.len() - offset);
                let dropped = self.pending.len() - offset - keep;
                self.summary.skipped_bytes += dropped as u64;
                self.gap |= dropped > 0;
                offset += dropped;
                break;
            };

            let wire = info.wire_size();
            if self.pending.len() - offset < skip + wire {
                self.summary.skipped_bytes += skip as u64;
                self.gap |= skip > 0;
                offset += skip;
                break;
            }

            self.record(&info, skip);
            offset += skip + wire;
        }

        self.pending.drain(..offset);
    }

    fn record(&mut self, info: &DtsFrameInfo, skip: usize) {
        self.summary.skipped_bytes += skip as u64;
        if (skip > 0 || self.gap) && self.summary.frames > 0 {
            self.summary.resyncs += 1;
        }
        self.gap = false;

        match &self.last {
            None => self.summary.first_frame = Some(FrameSummary::from(info)),
            Some(last) if last != info => {
                log::debug!(
                    "DTS parameters changed at frame {}: {} bytes, {} Hz",
                    self.summary.frames,
                    info.frame_size,
                    info.sample_rate
                );
                self.summary.parameter_changes += 1;
            }
            Some(_) => (),
        }

        if info.sample_rate > 0 {
            self.samples += u64::from(info.header.samples_per_frame());
            self.summary.duration_ms = self.samples * 1000 / u64::from(info.sample_rate);
        }
        self.last = Some(*info);
        self.summary.frames += 1;
    }

    pub fn finish(mut self) -> ProbeSummary {
        self.summary.skipped_bytes += self.pending.len() as u64;
        self.summary.rejected_candidates = self.sync.rejected();
        self.summary
    }
}

pub fn cmd_probe(args: &ProbeArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Probing DTS stream: {}", args.input.display());

    let mut reader = InputReader::new(&args.input)?;
    let pb: Option<ProgressBar> = match multi {
        Some(multi) => Some(create_progress_bar(multi, reader.len(), "Scanning frames...")?),
        None => None,
    };

    let mut prober = Prober::default();
    reader.process_chunks(PROBE_CHUNK, |chunk| {
        prober.push(chunk);
        if let Some(pb) = &pb {
            pb.inc(chunk.len() as u64);
        }
        Ok(true)
    })?;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    let summary = prober.finish();
    if summary.frames == 0 {
        if cli.strict {
            anyhow::bail!("No DTS frames found in {}", args.input.display());
        }
        log::warn!("No DTS frames found in {}", args.input.display());
    }

    if args.yaml {
        print!("{}", serde_yaml_ng::to_string(&summary)?);
    } else {
        display_summary(&summary);
    }

    Ok(())
}

fn display_summary(summary: &ProbeSummary) {
    println!();
    println!("DTS Stream Information");
    println!("======================");
    println!();

    if let Some(frame) = &summary.first_frame {
        println!("Packing                     {}", frame.variant);
        println!("Sample rate                 {} Hz", frame.sample_rate);
        println!("Frame size                  {} bytes", frame.frame_size);
        println!("Frame type                  {}", frame.frame_type);
        println!(
            "Transport                   {} ({} samples per frame)",
            frame.dts_type, frame.samples_per_frame
        );
        if let Some(channels) = frame.channels {
            println!("Channels                    {channels}");
        }
        println!();
    }

    println!("Probe Summary");
    println!("  Frames found              {}", summary.frames);
    println!(
        "  Duration                  {}",
        time_str(std::time::Duration::from_millis(summary.duration_ms))
    );
    println!("  Parameter changes         {}", summary.parameter_changes);
    println!("  Resyncs                   {}", summary.resyncs);
    println!(
        "  Skipped                   {} of {} bytes",
        summary.skipped_bytes, summary.total_bytes
    );
    println!("  Rejected candidates       {}", summary.rejected_candidates);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16-bit big-endian core header, normal frame, 16 blocks, 2013 bytes,
    /// 48 kHz.
    const HEADER: [u8; 12] = [
        0x7F, 0xFE, 0x80, 0x01, 0xFC, 0x3C, 0x7D, 0xC2, 0x74, 0x00, 0x00, 0x00,
    ];

    fn frame() -> Vec<u8> {
        let mut frame = HEADER.to_vec();
        frame.resize(2013, 0);
        frame
    }

    fn stream() -> Vec<u8> {
        let mut data = vec![0x55; 100];
        data.extend(frame());
        data.extend(frame());
        data.extend([0xAA; 40]);
        data.extend(frame());
        data
    }

    #[test]
    fn counts_frames_and_resyncs() {
        let mut prober = Prober::default();
        prober.push(&stream());
        let summary = prober.finish();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.resyncs, 1);
        assert_eq!(summary.skipped_bytes, 140);
        assert_eq!(summary.parameter_changes, 0);
        assert_eq!(summary.duration_ms, 3 * 512 * 1000 / 48_000);

        let first = summary.first_frame.unwrap();
        assert_eq!(first.frame_size, 2013);
        assert_eq!(first.sample_rate, 48_000);
        assert_eq!(first.frame_type, "normal");
        assert_eq!(first.dts_type, "Type1");
    }

    #[test]
    fn chunking_does_not_change_result() {
        let data = stream();
        let mut whole = Prober::default();
        whole.push(&data);
        let whole = whole.finish();

        for size in [1, 7, 500, 2013] {
            let mut chunked = Prober::default();
            for chunk in data.chunks(size) {
                chunked.push(chunk);
            }
            assert_eq!(chunked.finish(), whole, "chunk size {size}");
        }
    }

    #[test]
    fn yaml_summary() {
        let mut prober = Prober::default();
        prober.push(&frame());
        let yaml = serde_yaml_ng::to_string(&prober.finish()).unwrap();

        assert!(yaml.contains("frames: 1"));
        assert!(yaml.contains("frame_size: 2013"));
        assert!(yaml.contains("16-bit big-endian"));
    }

    #[test]
    fn garbage_only() {
        let mut prober = Prober::default();
        prober.push(&[0x11; 300]);
        let summary = prober.finish();

        assert_eq!(summary.frames, 0);
        assert_eq!(summary.first_frame, None);
        assert_eq!(summary.skipped_bytes, 300);
    }
}
