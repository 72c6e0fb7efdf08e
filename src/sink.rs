use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use audiotunnel::stage::soft::sink::{AudioSink, SinkFormat};
use audiotunnel::structs::wave::WaveFormatExtensible;
use log::{debug, info};

use crate::wav::WavWriter;

enum Output {
    Wav(WavWriter<File>),
    Raw(BufWriter<File>),
}

/// Totals reported once the sink is finished.
#[derive(Debug, Clone, Default)]
pub struct SinkSummary {
    pub format: Option<SinkFormat>,
    pub bytes: u64,
    pub writes: usize,
    pub flushes: usize,
}

/// Renderer sink that writes PCM to a WAV file and bitstreams as raw bytes.
///
/// Without a path everything is counted and discarded. A format change
/// restarts the file.
pub struct FileSink {
    path: Option<PathBuf>,
    output: Option<Output>,
    summary: SinkSummary,
}

impl FileSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            output: None,
            summary: SinkSummary::default(),
        }
    }

    fn open(&self, format: &SinkFormat) -> Result<Option<Output>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;

        let output = match format {
            SinkFormat::Pcm(pcm) => {
                let wave = WaveFormatExtensible::pcm(
                    pcm.channels as u16,
                    pcm.sample_rate,
                    pcm.bits_per_sample as u16,
                    pcm.channel_mapping.speaker_mask(),
                );
                Output::Wav(WavWriter::new(file, wave)?)
            }
            SinkFormat::Bitstream { .. } => Output::Raw(BufWriter::new(file)),
        };
        debug!("Writing {format} to {}", path.display());
        Ok(Some(output))
    }

    fn close(&mut self) -> Result<()> {
        match self.output.take() {
            Some(Output::Wav(writer)) => {
                writer.finish()?;
            }
            Some(Output::Raw(mut writer)) => writer.flush()?,
            None => (),
        }
        Ok(())
    }

    /// Closes the output file and returns the totals.
    pub fn finish(&mut self) -> Result<SinkSummary> {
        self.close()?;
        if let Some(path) = &self.path {
            info!("Wrote {} bytes to {}", self.summary.bytes, path.display());
        }
        Ok(self.summary.clone())
    }
}

impl AudioSink for FileSink {
    fn configure(&mut self, format: &SinkFormat) -> Result<()> {
        if self.summary.format.as_ref() == Some(format) {
            return Ok(());
        }
        if self.summary.bytes > 0 {
            log::warn!("Output format changed to {format}, restarting output");
        }

        self.close()?;
        self.output = self.open(format)?;
        self.summary.format = Some(format.clone());
        self.summary.bytes = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.output {
            Some(Output::Wav(writer)) => writer.write_data(data)?,
            Some(Output::Raw(writer)) => writer.write_all(data)?,
            None => (),
        }
        self.summary.bytes += data.len() as u64;
        self.summary.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.summary.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiotunnel::structs::port::PcmParams;
    use audiotunnel::structs::stream::Encoding;
    use std::fs;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("audiotunneld-{}-{name}", std::process::id()))
    }

    #[test]
    fn pcm_goes_to_wav() -> Result<()> {
        let path = scratch("pcm.wav");
        let mut sink = FileSink::new(Some(path.clone()));

        let format = SinkFormat::Pcm(PcmParams::default());
        sink.configure(&format)?;
        sink.write(&[0; 16])?;
        sink.configure(&format)?;
        sink.write(&[1; 16])?;

        let summary = sink.finish()?;
        assert_eq!(summary.bytes, 32);
        assert_eq!(summary.writes, 2);

        let written = fs::read(&path)?;
        fs::remove_file(&path)?;
        assert_eq!(written.len(), 68 + 32);
        assert_eq!(&written[0..4], b"RIFF");
        assert_eq!(&written[84..], &[1; 16]);
        Ok(())
    }

    #[test]
    fn bitstream_is_raw() -> Result<()> {
        let path = scratch("dts.bin");
        let mut sink = FileSink::new(Some(path.clone()));

        sink.configure(&SinkFormat::Bitstream {
            encoding: Encoding::Dts,
            sample_rate: 48_000,
            channels: 8,
        })?;
        sink.write(&[0x7F, 0xFE, 0x80, 0x01])?;
        sink.finish()?;

        let written = fs::read(&path)?;
        fs::remove_file(&path)?;
        assert_eq!(written, [0x7F, 0xFE, 0x80, 0x01]);
        Ok(())
    }

    #[test]
    fn discards_without_path() -> Result<()> {
        let mut sink = FileSink::new(None);
        sink.configure(&SinkFormat::Pcm(PcmParams::default()))?;
        sink.write(&[0; 8])?;
        sink.flush()?;

        let summary = sink.finish()?;
        assert_eq!(summary.bytes, 8);
        assert_eq!(summary.flushes, 1);
        Ok(())
    }
}
