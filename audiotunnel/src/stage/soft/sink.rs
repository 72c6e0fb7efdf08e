use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::structs::port::PcmParams;
use crate::structs::stream::Encoding;

/// Format announced to a sink before the first write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFormat {
    Pcm(PcmParams),
    Bitstream {
        encoding: Encoding,
        sample_rate: u32,
        channels: u32,
    },
}

impl fmt::Display for SinkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkFormat::Pcm(pcm) => write!(
                f,
                "PCM {} ch, {} Hz, {} bit [{}]",
                pcm.channels, pcm.sample_rate, pcm.bits_per_sample, pcm.channel_mapping
            ),
            SinkFormat::Bitstream {
                encoding,
                sample_rate,
                channels,
            } => write!(f, "{encoding} bitstream, {channels} ch, {sample_rate} Hz"),
        }
    }
}

/// Final destination of rendered audio.
pub trait AudioSink: Send {
    /// Called before the first write and again whenever the format changes.
    fn configure(&mut self, format: &SinkFormat) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Drops anything the sink has buffered but not yet played.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type SharedSink = Arc<Mutex<dyn AudioSink>>;

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn shared() -> SharedSink {
        Arc::new(Mutex::new(NullSink))
    }
}

impl AudioSink for NullSink {
    fn configure(&mut self, _format: &SinkFormat) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Keeps everything written to it in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    pub formats: Vec<SinkFormat>,
    pub data: Vec<u8>,
    pub writes: usize,
    pub flushes: usize,
}

impl AudioSink for CaptureSink {
    fn configure(&mut self, format: &SinkFormat) -> Result<()> {
        self.formats.push(format.clone());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
