//! Bitstream I/O utilities for header parsing.
//!
//! Provides an MSB-first bit reader over byte slices and the word repacking
//! needed to bring 14-bit transport words back to a contiguous bitstream.

use std::io;

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter, UnsignedInteger};

#[derive(Debug)]
pub struct BitstreamIoReader<R: io::Read + io::Seek> {
    bs: BitReader<R, BigEndian>,
    len: u64,
}

pub type BsIoSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>>;

impl<R> BitstreamIoReader<R>
where
    R: io::Read + io::Seek,
{
    pub fn new(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: len_bytes << 3,
        }
    }

    #[inline(always)]
    pub fn get(&mut self) -> io::Result<bool> {
        self.bs.read_bit()
    }

    #[inline(always)]
    pub fn get_n<I: UnsignedInteger>(&mut self, n: u32) -> io::Result<I> {
        match self.bs.read_unsigned_var(n) {
            Ok(val) => Ok(val),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "get_n({}): out of bounds bits at {}",
                    n,
                    self.bs.position_in_bits().unwrap_or(0)
                ),
            )),
            Err(e) => Err(e),
        }
    }

    #[inline(always)]
    pub fn skip_n(&mut self, n: u32) -> io::Result<()> {
        if n as u64 > self.available()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "skip_n: out of bounds bits",
            ));
        }
        self.bs.skip(n)
    }

    #[inline(always)]
    pub fn available(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits().map(|pos| self.len - pos)
    }

    #[inline(always)]
    pub fn position(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits()
    }
}

impl<'a> BsIoSliceReader<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        let len = buf.len() as u64;
        let read = io::Cursor::new(buf);

        Self::new(read, len)
    }
}

impl Default for BsIoSliceReader<'_> {
    fn default() -> Self {
        Self::from_slice(&[])
    }
}

/// Concatenates the low 14 bits of each big-endian 16-bit word in `words`.
///
/// The result is padded with zero bits to a byte boundary. A trailing odd
/// byte is ignored.
pub fn pack_14bit_words(words: &[u8]) -> io::Result<Vec<u8>> {
    let mut bw = BitWriter::endian(Vec::with_capacity(words.len()), BigEndian);

    for pair in words.chunks_exact(2) {
        let word = u16::from_be_bytes([pair[0], pair[1]]) & 0x3FFF;
        bw.write_unsigned_var::<u16>(14, word)?;
    }
    bw.byte_align()?;

    Ok(bw.into_writer())
}

/// Swaps every pair of bytes, turning little-endian 16-bit words into
/// big-endian ones. A trailing odd byte is dropped.
pub fn swap_16bit_words(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .flat_map(|pair| [pair[1], pair[0]])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_fields() {
        let data = [0b1010_0000, 0xFF];
        let mut reader = BsIoSliceReader::from_slice(&data);

        assert!(reader.get().unwrap());
        assert_eq!(reader.get_n::<u8>(3).unwrap(), 0b010);
        reader.skip_n(4).unwrap();
        assert_eq!(reader.available().unwrap(), 8);
        assert_eq!(reader.get_n::<u16>(8).unwrap(), 0xFF);
        assert!(reader.get().is_err());
        assert!(reader.skip_n(1).is_err());
    }

    #[test]
    fn test_pack_14bit_words() {
        // 1F FF E8 00 is the 14-bit form of 7F FE 80 01 followed by 0b00_00
        let packed = pack_14bit_words(&[0x1F, 0xFF, 0xE8, 0x00]).unwrap();
        assert_eq!(packed, vec![0x7F, 0xFE, 0x80, 0x00]);

        assert_eq!(swap_16bit_words(&[0xFE, 0x7F, 0x01, 0x80, 0xAA]), vec![
            0x7F, 0xFE, 0x80, 0x01
        ]);
    }
}
