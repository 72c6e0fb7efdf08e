use std::fmt::{self, Display};

use crate::structs::channel::ChannelLayout;

/// Codec of the elementary stream handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Pcm,
    Dts,
    Ac3,
    Eac3,
    Other,
}

/// Wire encoding negotiated with the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Pcm,
    Dts,
    DolbyDigitalPlus,
}

impl Encoding {
    /// Bitstream encodings are only carried in passthrough; everything else
    /// arrives as PCM.
    pub fn select(codec: Codec, passthrough: bool) -> Self {
        if !passthrough {
            return Self::Pcm;
        }
        match codec {
            Codec::Dts => Self::Dts,
            Codec::Ac3 | Codec::Eac3 => Self::DolbyDigitalPlus,
            Codec::Pcm | Codec::Other => Self::Pcm,
        }
    }

    pub fn is_bitstream(self) -> bool {
        self != Self::Pcm
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Pcm => write!(f, "PCM"),
            Encoding::Dts => write!(f, "DTS"),
            Encoding::DolbyDigitalPlus => write!(f, "DDP"),
        }
    }
}

/// What the caller knows about the stream it is about to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHints {
    pub channels: u32,
    /// Role of each interleaved input channel, if known.
    pub layout: Option<ChannelLayout>,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub codec: Codec,
    /// Opaque codec configuration from the container.
    pub extra_data: Vec<u8>,
}

impl Default for StreamHints {
    fn default() -> Self {
        Self {
            channels: 2,
            layout: None,
            sample_rate: 48_000,
            bits_per_sample: 16,
            codec: Codec::Pcm,
            extra_data: Vec::new(),
        }
    }
}

/// Format fixed for the lifetime of one initialized session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParameters {
    /// Channels as delivered to the decoder, after any remapping.
    pub channels: u32,
    /// Channels as supplied by the caller.
    pub data_channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub encoding: Encoding,
    pub passthrough: bool,
    /// Role of each channel delivered to the decoder.
    pub channel_map: ChannelLayout,
    pub extra_data: Vec<u8>,
}

impl StreamParameters {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Bytes per interleaved frame as delivered to the decoder.
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Bytes per interleaved frame as supplied by the caller.
    pub fn data_frame_bytes(&self) -> usize {
        self.bytes_per_sample() * self.data_channels as usize
    }

    /// Byte rate of the decoder-side stream.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_bytes() * self.sample_rate as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_select() {
        assert_eq!(Encoding::select(Codec::Dts, true), Encoding::Dts);
        assert_eq!(Encoding::select(Codec::Eac3, true), Encoding::DolbyDigitalPlus);
        assert_eq!(Encoding::select(Codec::Ac3, true), Encoding::DolbyDigitalPlus);
        assert_eq!(Encoding::select(Codec::Other, true), Encoding::Pcm);
        assert_eq!(Encoding::select(Codec::Dts, false), Encoding::Pcm);
    }
}
