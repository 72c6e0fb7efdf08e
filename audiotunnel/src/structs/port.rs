use std::fmt::{self, Display};

use crate::structs::channel::ChannelLayout;
use crate::structs::stream::Encoding;

/// Port number on a stage, unique within that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortIndex(pub u32);

impl Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Buffer requirements and state of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDefinition {
    pub port: PortIndex,
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub encoding: Encoding,
    pub enabled: bool,
}

/// Interleaved PCM sample format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmParams {
    pub channels: u32,
    pub bits_per_sample: u32,
    pub sample_rate: u32,
    pub signed: bool,
    pub little_endian: bool,
    pub interleaved: bool,
    pub channel_mapping: ChannelLayout,
}

impl Default for PcmParams {
    fn default() -> Self {
        Self {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 48_000,
            signed: true,
            little_endian: true,
            interleaved: true,
            channel_mapping: ChannelLayout::canonical(2),
        }
    }
}

impl PcmParams {
    pub fn frame_bytes(&self) -> usize {
        (self.bits_per_sample / 8 * self.channels) as usize
    }
}

/// DTS passthrough descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtsParams {
    pub channels: u32,
    pub bit_rate: u32,
    pub sample_rate: u32,
    /// Bit 0 set for 16-bit words, bit 1 set for little-endian bytes.
    pub format: u32,
    pub dts_type: u8,
    pub frame_size: usize,
    pub channel_mapping: ChannelLayout,
}

/// Dolby Digital / Dolby Digital Plus passthrough descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdpParams {
    pub channels: u32,
    pub bit_rate: u32,
    pub sample_rate: u32,
    pub bitstream_id: DdpBitstreamId,
    pub channel_mapping: ChannelLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdpBitstreamId {
    #[default]
    Ac3,
    Eac3,
}

/// Parameter exchanged through a stage port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    PortDefinition(PortDefinition),
    Pcm(PcmParams),
    PortFormat(Encoding),
    Dts(DtsParams),
    Ddp(DdpParams),
    DecoderPassthrough(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    PortDefinition,
    Pcm,
    PortFormat,
    Dts,
    Ddp,
    DecoderPassthrough,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::PortDefinition => "port definition",
            ParamKind::Pcm => "PCM format",
            ParamKind::PortFormat => "port format",
            ParamKind::Dts => "DTS descriptor",
            ParamKind::Ddp => "DDP descriptor",
            ParamKind::DecoderPassthrough => "decoder passthrough",
        }
    }
}

impl Param {
    pub fn kind(&self) -> ParamKind {
        match self {
            Param::PortDefinition(_) => ParamKind::PortDefinition,
            Param::Pcm(_) => ParamKind::Pcm,
            Param::PortFormat(_) => ParamKind::PortFormat,
            Param::Dts(_) => ParamKind::Dts,
            Param::Ddp(_) => ParamKind::Ddp,
            Param::DecoderPassthrough(_) => ParamKind::DecoderPassthrough,
        }
    }

    pub fn into_port_definition(self) -> Option<PortDefinition> {
        match self {
            Param::PortDefinition(def) => Some(def),
            _ => None,
        }
    }

    pub fn into_pcm(self) -> Option<PcmParams> {
        match self {
            Param::Pcm(pcm) => Some(pcm),
            _ => None,
        }
    }
}

/// Stage-wide configuration that is not tied to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageConfig {
    /// Output device name, `"hdmi"` or `"local"`.
    AudioDestination(String),
    /// Output gain in millibels.
    Volume(i32),
}
