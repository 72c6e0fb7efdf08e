//! DTS core frame headers.
//!
//! ## Transport variants
//!
//! A DTS core stream is carried either as 16-bit words or as 14-bit words
//! padded into 16-bit containers, in either byte order:
//!
//! | Variant | Sync bytes            |
//! |---------|-----------------------|
//! | `Be16`  | `7F FE 80 01`         |
//! | `Be14`  | `1F FF E8 00 07 Fx`   |
//! | `Le16`  | `FE 7F 01 80`         |
//! | `Le14`  | `FF 1F 00 E8 Fx 07`   |
//!
//! Every variant is first normalised to the 16-bit big-endian bitstream, so
//! the header fields are read at one set of bit offsets.
//!
//! ## Header fields (after the 32-bit sync word)
//!
//! FTYPE (1), SHORT (5), CPF (1), NBLKS (7), FSIZE (14), AMODE (6), SFREQ (4).

use std::fmt::{self, Display};

use log::trace;

use crate::utils::bitstream_io::{BsIoSliceReader, pack_14bit_words, swap_16bit_words};
use crate::utils::errors::HeaderError;

/// Sample rate for each SFREQ code, zero where the code is reserved.
pub const DTS_SAMPLE_RATES: [u32; 16] = [
    0, 8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0,
];

/// Channel count for each AMODE code below 16.
pub const DTS_AMODE_CHANNELS: [u8; 16] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 6, 6, 6, 7, 8, 8];

pub const MIN_FRAME_SIZE: usize = 96;
pub const MAX_FRAME_SIZE: usize = 16384;

/// Bytes a candidate offset must have behind it before it is examined.
pub const SYNC_WINDOW: usize = 9;

/// Samples carried by one NBLKS block.
pub const SAMPLES_PER_BLOCK: u32 = 32;

/// Normal frames always report a deficit sample count of 31.
const NORMAL_FRAME_DEFICIT: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtsVariant {
    Be16,
    Be14,
    Le16,
    Le14,
}

impl DtsVariant {
    /// Order in which variants are tried at each offset.
    pub const SEARCH_ORDER: [DtsVariant; 4] = [Self::Be16, Self::Be14, Self::Le16, Self::Le14];

    /// Checks the variant's sync bytes at the start of `data`.
    ///
    /// Missing bytes count as a mismatch.
    pub fn matches(self, data: &[u8]) -> bool {
        let at = |i: usize| data.get(i).copied();

        match self {
            Self::Be16 => data.starts_with(&[0x7F, 0xFE, 0x80, 0x01]),
            Self::Be14 => {
                data.starts_with(&[0x1F, 0xFF, 0xE8, 0x00, 0x07])
                    && at(5).is_some_and(|b| b & 0xF0 == 0xF0)
            }
            Self::Le16 => data.starts_with(&[0xFE, 0x7F, 0x01, 0x80]),
            Self::Le14 => {
                data.starts_with(&[0xFF, 0x1F, 0x00, 0xE8])
                    && at(4).is_some_and(|b| b & 0xF0 == 0xF0)
                    && at(5) == Some(0x07)
            }
        }
    }

    pub fn is_14bit(self) -> bool {
        matches!(self, Self::Be14 | Self::Le14)
    }

    pub fn is_little_endian(self) -> bool {
        matches!(self, Self::Le16 | Self::Le14)
    }

    /// Raw bytes needed to recover the full core header.
    pub fn header_len(self) -> usize {
        match self {
            Self::Be16 => 9,
            Self::Be14 | Self::Le16 | Self::Le14 => 10,
        }
    }

    /// Format word reported to the renderer: bit 0 set for 16-bit words,
    /// bit 1 set for little-endian byte order.
    pub fn format_flags(self) -> u32 {
        let mut flags = 0;
        if !self.is_14bit() {
            flags |= 0b01;
        }
        if self.is_little_endian() {
            flags |= 0b10;
        }
        flags
    }

    /// Bytes a frame of `frame_size` occupies in this transport.
    pub fn wire_size(self, frame_size: usize) -> usize {
        if self.is_14bit() {
            frame_size * 8 / 7
        } else {
            frame_size
        }
    }

    /// Converts the header bytes at the start of `data` to the 16-bit
    /// big-endian bitstream.
    pub fn normalize(self, data: &[u8]) -> Result<Vec<u8>, HeaderError> {
        let needed = self.header_len();
        let raw = data.get(..needed).ok_or(HeaderError::Truncated {
            needed,
            available: data.len(),
        })?;

        let truncated = |_| HeaderError::Truncated {
            needed,
            available: data.len(),
        };

        Ok(match self {
            Self::Be16 => raw.to_vec(),
            Self::Le16 => swap_16bit_words(raw),
            Self::Be14 => pack_14bit_words(raw).map_err(truncated)?,
            Self::Le14 => pack_14bit_words(&swap_16bit_words(raw)).map_err(truncated)?,
        })
    }
}

impl Display for DtsVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtsVariant::Be16 => write!(f, "16-bit big-endian"),
            DtsVariant::Be14 => write!(f, "14-bit big-endian"),
            DtsVariant::Le16 => write!(f, "16-bit little-endian"),
            DtsVariant::Le14 => write!(f, "14-bit little-endian"),
        }
    }
}

/// Transport type derived from samples per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DtsType {
    #[default]
    Unknown = 0,
    Type1 = 1,
    Type2 = 2,
    Type3 = 3,
}

impl DtsType {
    pub fn from_samples(samples: u32) -> Self {
        match samples {
            512 => Self::Type1,
            1024 => Self::Type2,
            2048 => Self::Type3,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Termination,
    Normal,
}

/// Fixed part of the DTS core header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtsCoreHeader {
    pub frame_type: FrameType,
    pub deficit_samples: u8,
    pub crc_present: bool,
    /// NBLKS field, one less than the number of blocks.
    pub nblks: u8,
    /// FSIZE field, one less than the frame size in bytes.
    pub fsize: u16,
    pub amode: u8,
    pub sfreq: u8,
}

impl DtsCoreHeader {
    /// Reads the header from a normalised bitstream positioned at the sync
    /// word.
    pub fn read(reader: &mut BsIoSliceReader) -> std::io::Result<Self> {
        reader.skip_n(32)?;

        Ok(Self {
            frame_type: if reader.get()? {
                FrameType::Normal
            } else {
                FrameType::Termination
            },
            deficit_samples: reader.get_n(5)?,
            crc_present: reader.get()?,
            nblks: reader.get_n(7)?,
            fsize: reader.get_n(14)?,
            amode: reader.get_n(6)?,
            sfreq: reader.get_n(4)?,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.fsize as usize + 1
    }

    pub fn blocks(&self) -> u32 {
        self.nblks as u32 + 1
    }

    pub fn samples_per_frame(&self) -> u32 {
        self.blocks() * SAMPLES_PER_BLOCK
    }

    /// Structural checks that separate a real header from a sync word that
    /// happens to appear inside payload data.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.frame_type == FrameType::Normal && self.deficit_samples != NORMAL_FRAME_DEFICIT {
            return Err(HeaderError::DeficitInconsistent(self.deficit_samples));
        }

        let frame_size = self.frame_size();
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&frame_size) {
            return Err(HeaderError::FrameSizeOutOfRange(frame_size));
        }

        if DTS_SAMPLE_RATES[self.sfreq as usize & 0xF] == 0 {
            return Err(HeaderError::ReservedSampleRate(self.sfreq));
        }

        Ok(())
    }
}

/// A validated core header and the values derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtsFrameInfo {
    pub variant: DtsVariant,
    pub header: DtsCoreHeader,
    pub frame_size: usize,
    pub sample_rate: u32,
    pub dts_type: DtsType,
}

impl DtsFrameInfo {
    /// Parses and validates the header of `variant` at the start of `data`.
    pub fn parse(variant: DtsVariant, data: &[u8]) -> Result<Self, HeaderError> {
        let normalized = variant.normalize(data)?;
        let mut reader = BsIoSliceReader::from_slice(&normalized);

        let header = DtsCoreHeader::read(&mut reader).map_err(|_| HeaderError::Truncated {
            needed: variant.header_len(),
            available: data.len(),
        })?;
        header.validate()?;

        let info = Self {
            variant,
            header,
            frame_size: header.frame_size(),
            sample_rate: DTS_SAMPLE_RATES[header.sfreq as usize],
            dts_type: DtsType::from_samples(header.samples_per_frame()),
        };

        trace!(
            "DTS header: {} frame_size={} rate={} blocks={} type={:?}",
            variant,
            info.frame_size,
            info.sample_rate,
            header.blocks(),
            info.dts_type
        );

        Ok(info)
    }

    /// Bytes the frame occupies in the input stream.
    pub fn wire_size(&self) -> usize {
        self.variant.wire_size(self.frame_size)
    }

    pub fn channels(&self) -> Option<u8> {
        DTS_AMODE_CHANNELS.get(self.header.amode as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

    fn core_header(nblks: u8, fsize: u16, sfreq: u8) -> Vec<u8> {
        let mut bw = BitWriter::endian(Vec::new(), BigEndian);
        bw.write_unsigned_var::<u32>(32, 0x7FFE_8001).unwrap();
        bw.write_bit(true).unwrap();
        bw.write_unsigned_var::<u8>(5, 31).unwrap();
        bw.write_bit(false).unwrap();
        bw.write_unsigned_var::<u8>(7, nblks).unwrap();
        bw.write_unsigned_var::<u16>(14, fsize).unwrap();
        bw.write_unsigned_var::<u8>(6, 9).unwrap();
        bw.write_unsigned_var::<u8>(4, sfreq).unwrap();
        bw.byte_align().unwrap();
        let mut out = bw.into_writer();
        out.resize(12, 0);
        out
    }

    fn to_14bit(be16: &[u8]) -> Vec<u8> {
        let mut reader = BitReader::endian(std::io::Cursor::new(be16), BigEndian);
        let mut out = Vec::new();
        while let Ok(word) = reader.read_unsigned_var::<u16>(14) {
            // Containers sign-extend bit 13 into the top two bits
            let word = if word & 0x2000 != 0 { word | 0xC000 } else { word };
            out.extend_from_slice(&word.to_be_bytes());
        }
        out
    }

    #[test]
    fn parse_every_variant() {
        let be16 = core_header(15, 2012, 13);
        let be14 = to_14bit(&be16);
        let le16 = swap_16bit_words(&be16);
        let le14 = swap_16bit_words(&be14);

        for (variant, data) in [
            (DtsVariant::Be16, &be16),
            (DtsVariant::Be14, &be14),
            (DtsVariant::Le16, &le16),
            (DtsVariant::Le14, &le14),
        ] {
            assert!(variant.matches(data), "{variant} sync");
            let info = DtsFrameInfo::parse(variant, data).unwrap();
            assert_eq!(info.frame_size, 2013);
            assert_eq!(info.sample_rate, 48000);
            assert_eq!(info.header.blocks(), 16);
            assert_eq!(info.dts_type, DtsType::Type1);
            assert_eq!(info.channels(), Some(5));
        }
    }

    #[test]
    fn variants_do_not_cross_match() {
        let be16 = core_header(31, 4000, 13);
        assert!(!DtsVariant::Be14.matches(&be16));
        assert!(!DtsVariant::Le16.matches(&be16));
        assert!(!DtsVariant::Le14.matches(&be16));
        assert!(!DtsVariant::Be16.matches(&be16[..3]));
    }

    #[test]
    fn rejects_structural_errors() {
        assert_eq!(
            DtsFrameInfo::parse(DtsVariant::Be16, &core_header(15, 50, 13)),
            Err(HeaderError::FrameSizeOutOfRange(51))
        );
        assert_eq!(
            DtsFrameInfo::parse(DtsVariant::Be16, &core_header(15, 2012, 4)),
            Err(HeaderError::ReservedSampleRate(4))
        );

        let mut short = core_header(15, 2012, 13);
        short[4] &= !0x7C;
        assert_eq!(
            DtsFrameInfo::parse(DtsVariant::Be16, &short),
            Err(HeaderError::DeficitInconsistent(0))
        );

        assert_eq!(
            DtsFrameInfo::parse(DtsVariant::Le16, &core_header(15, 2012, 13)[..9]),
            Err(HeaderError::Truncated {
                needed: 10,
                available: 9
            })
        );
    }

    #[test]
    fn dts_type_and_flags() {
        assert_eq!(DtsType::from_samples(1024), DtsType::Type2);
        assert_eq!(DtsType::from_samples(2048), DtsType::Type3);
        assert_eq!(DtsType::from_samples(256), DtsType::Unknown);

        assert_eq!(DtsVariant::Be16.format_flags(), 0b01);
        assert_eq!(DtsVariant::Le16.format_flags(), 0b11);
        assert_eq!(DtsVariant::Be14.format_flags(), 0b00);
        assert_eq!(DtsVariant::Le14.format_flags(), 0b10);
        assert_eq!(DtsVariant::Be14.wire_size(2016), 2304);
    }
}
