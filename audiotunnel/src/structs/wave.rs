//! In-band PCM format descriptor.
//!
//! Before the first PCM payload the decoder receives one codec-config buffer
//! holding a `WAVEFORMATEXTENSIBLE` block that describes the interleaved
//! samples that follow.

use audiotunneld_macros::ToBytes;

use crate::structs::channel::ChannelLayout;
use crate::structs::stream::StreamParameters;
use crate::utils::byteorder::{LeCursor, WriteBytesLe};

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// `KSDATAFORMAT_SUBTYPE_PCM` in its on-disk byte order.
pub const KSDATAFORMAT_SUBTYPE_PCM: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// Serialised size of [`WaveFormatExtensible`].
pub const WAVE_FORMAT_LEN: usize = 40;

/// Bytes following the basic `WAVEFORMATEX` fields.
const EXTENSION_LEN: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ToBytes)]
pub struct WaveFormatExtensible {
    pub format_tag: u16,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub extension_size: u16,
    pub valid_bits_per_sample: u16,
    pub channel_mask: u32,
    pub sub_format: [u8; 16],
}

impl WaveFormatExtensible {
    pub fn pcm(channels: u16, sample_rate: u32, bits_per_sample: u16, channel_mask: u32) -> Self {
        let block_align = channels * (bits_per_sample / 8);
        Self {
            format_tag: WAVE_FORMAT_EXTENSIBLE,
            channels,
            samples_per_sec: sample_rate,
            avg_bytes_per_sec: sample_rate * block_align as u32,
            block_align,
            bits_per_sample,
            extension_size: EXTENSION_LEN,
            valid_bits_per_sample: bits_per_sample,
            channel_mask,
            sub_format: KSDATAFORMAT_SUBTYPE_PCM,
        }
    }

    /// Descriptor for the decoder-side stream of an initialized session.
    pub fn for_stream(stream: &StreamParameters) -> Self {
        Self::pcm(
            stream.channels as u16,
            stream.sample_rate,
            stream.bits_per_sample as u16,
            stream.channel_map.speaker_mask(),
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WAVE_FORMAT_LEN);
        self.write_le(&mut out);
        out
    }

    /// Reads a descriptor, accepting both the extensible and the plain PCM
    /// tag. Returns `None` if `data` is too short or not PCM.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = LeCursor::new(data);

        let format = Self {
            format_tag: cursor.read_u16()?,
            channels: cursor.read_u16()?,
            samples_per_sec: cursor.read_u32()?,
            avg_bytes_per_sec: cursor.read_u32()?,
            block_align: cursor.read_u16()?,
            bits_per_sample: cursor.read_u16()?,
            extension_size: cursor.read_u16()?,
            valid_bits_per_sample: cursor.read_u16()?,
            channel_mask: cursor.read_u32()?,
            sub_format: cursor.read_array()?,
        };

        match format.format_tag {
            WAVE_FORMAT_EXTENSIBLE if format.sub_format == KSDATAFORMAT_SUBTYPE_PCM => Some(format),
            WAVE_FORMAT_PCM => Some(format),
            _ => None,
        }
    }

    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout::from_speaker_mask(self.channel_mask, self.channels as usize)
    }
}
