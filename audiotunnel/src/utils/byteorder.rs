//! Fixed-width little-endian serialisation used for in-band format blocks.
//!
//! Structs deriving [`ToBytes`](audiotunneld_macros::ToBytes) get a
//! [`WriteBytesLe`] impl; fields are emitted in declaration order with no
//! padding.

pub trait WriteBytesLe {
    fn write_le(&self, dst: &mut Vec<u8>);
}

macro_rules! impl_num_le {
    ($($t:ty),+) => { $(
        impl WriteBytesLe for $t { #[inline] fn write_le(&self, dst: &mut Vec<u8>) { dst.extend_from_slice(&self.to_le_bytes()); }}
    )+ }
}

impl_num_le!(u8, i8, u16, i16, u32, i32, u64, i64);

impl<T: WriteBytesLe, const N: usize> WriteBytesLe for [T; N] {
    #[inline]
    fn write_le(&self, dst: &mut Vec<u8>) {
        self.iter().for_each(|item| item.write_le(dst));
    }
}

/// Cursor over a byte slice reading little-endian integers.
///
/// Every read is bounds checked; `None` means the slice ended early.
#[derive(Debug)]
pub struct LeCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

macro_rules! impl_le_read {
    ($($name:ident => $t:ty),+) => { $(
        #[inline]
        pub fn $name(&mut self) -> Option<$t> {
            const N: usize = std::mem::size_of::<$t>();
            let bytes = self.data.get(self.pos..self.pos + N)?;
            self.pos += N;
            let mut raw = [0u8; N];
            raw.copy_from_slice(bytes);
            Some(<$t>::from_le_bytes(raw))
        }
    )+ }
}

impl<'a> LeCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    impl_le_read!(read_u16 => u16, read_u32 => u32);

    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.data.get(self.pos..self.pos + N)?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}
