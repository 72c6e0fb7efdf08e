use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::utils::errors::PoolError;

/// Per-buffer flags understood by every stage.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// Buffer carries codec configuration rather than media.
    pub const CODEC_CONFIG: Self = Self(1 << 0);
    /// Last buffer of a caller-visible frame.
    pub const END_OF_FRAME: Self = Self(1 << 1);
    /// Timestamp is absent and must not be used.
    pub const TIME_UNKNOWN: Self = Self(1 << 2);
    /// First buffer after initialization or flush; anchors the clock.
    pub const START_TIME: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BufferFlags, &str); 4] = [
            (BufferFlags::CODEC_CONFIG, "CODEC_CONFIG"),
            (BufferFlags::END_OF_FRAME, "END_OF_FRAME"),
            (BufferFlags::TIME_UNKNOWN, "TIME_UNKNOWN"),
            (BufferFlags::START_TIME, "START_TIME"),
        ];

        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if set.is_empty() {
            write!(f, "BufferFlags(empty)")
        } else {
            write!(f, "BufferFlags({})", set.join(" | "))
        }
    }
}

/// Fixed-capacity byte region handed from the producer to a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBuffer {
    index: usize,
    data: Box<[u8]>,
    filled: usize,
    pub flags: BufferFlags,
    /// Presentation time in microseconds, `None` when unknown.
    pub timestamp: Option<i64>,
}

impl TransferBuffer {
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            data: vec![0; capacity].into_boxed_slice(),
            filled: 0,
            flags: BufferFlags::empty(),
            timestamp: None,
        }
    }

    /// Slot number within the owning pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Replaces the payload with all of `src`, refusing anything larger than
    /// the buffer.
    pub fn fill(&mut self, src: &[u8]) -> Result<(), PoolError> {
        if src.len() > self.capacity() {
            return Err(PoolError::Overrun {
                len: src.len(),
                capacity: self.capacity(),
            });
        }
        self.data[..src.len()].copy_from_slice(src);
        self.filled = src.len();
        Ok(())
    }

    /// Replaces the payload with as much of `src` as fits and returns the
    /// number of bytes taken.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.capacity());
        self.data[..n].copy_from_slice(&src[..n]);
        self.filled = n;
        n
    }

    pub fn reset(&mut self) {
        self.filled = 0;
        self.flags = BufferFlags::empty();
        self.timestamp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let mut flags = BufferFlags::CODEC_CONFIG | BufferFlags::END_OF_FRAME;
        assert!(flags.contains(BufferFlags::CODEC_CONFIG));
        assert!(!flags.contains(BufferFlags::START_TIME));

        flags |= BufferFlags::START_TIME;
        assert!(flags.contains(BufferFlags::START_TIME | BufferFlags::END_OF_FRAME));
        assert_eq!(
            format!("{flags:?}"),
            "BufferFlags(CODEC_CONFIG | END_OF_FRAME | START_TIME)"
        );
    }

    #[test]
    fn fill_respects_capacity() {
        let mut buffer = TransferBuffer::new(3, 4);

        assert_eq!(
            buffer.fill(&[1, 2, 3, 4, 5]),
            Err(PoolError::Overrun {
                len: 5,
                capacity: 4
            })
        );
        assert_eq!(buffer.filled(), 0);

        assert_eq!(buffer.fill_from(&[1, 2, 3, 4, 5]), 4);
        assert_eq!(buffer.payload(), &[1, 2, 3, 4]);

        buffer.fill(&[9]).unwrap();
        assert_eq!(buffer.payload(), &[9]);

        buffer.flags = BufferFlags::START_TIME;
        buffer.reset();
        assert_eq!(buffer.filled(), 0);
        assert_eq!(buffer.flags, BufferFlags::empty());
    }
}
