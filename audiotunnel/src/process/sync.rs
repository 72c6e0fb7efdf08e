use log::{debug, trace};

use crate::structs::dts::{DtsFrameInfo, DtsType, DtsVariant, SYNC_WINDOW};
use crate::utils::errors::HeaderError;

/// Snapshot of the detector for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub locked: bool,
    pub frame_size: usize,
    pub sample_rate: u32,
    pub dts_type: DtsType,
    pub locks: usize,
    pub losses: usize,
}

/// Locates DTS core frame boundaries in a passthrough byte stream.
///
/// The detector is either searching or locked. A successful
/// [`scan`](Self::scan) locks it and records the frame parameters; a scan
/// that finds nothing drops the lock.
#[derive(Debug, Clone, Default)]
pub struct DtsSync {
    locked: bool,
    frame: Option<DtsFrameInfo>,
    locks: usize,
    losses: usize,
    rejected: usize,
}

impl DtsSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Searches `data` for the first structurally valid header.
    ///
    /// Returns the header's offset when one is found. Otherwise the detector
    /// is unlocked and the whole length is returned. Offsets with fewer than
    /// [`SYNC_WINDOW`] bytes behind them are not examined.
    pub fn scan(&mut self, data: &[u8]) -> usize {
        let mut skip = 0;

        while skip + SYNC_WINDOW <= data.len() {
            if let Some(info) = self.candidate(&data[skip..]) {
                if !self.locked || self.frame != Some(info) {
                    debug!(
                        "DTS sync at offset {skip}: {} frame_size={} rate={} type={:?}",
                        info.variant, info.frame_size, info.sample_rate, info.dts_type
                    );
                }
                if !self.locked {
                    self.locks += 1;
                }
                self.locked = true;
                self.frame = Some(info);
                return skip;
            }
            skip += 1;
        }

        if self.locked {
            debug!("DTS sync lost");
            self.losses += 1;
        }
        self.locked = false;
        data.len()
    }

    fn candidate(&mut self, window: &[u8]) -> Option<DtsFrameInfo> {
        let variant = DtsVariant::SEARCH_ORDER
            .into_iter()
            .find(|variant| variant.matches(window))?;

        match DtsFrameInfo::parse(variant, window) {
            Ok(info) => Some(info),
            // Not judged yet; the rest of the header may arrive later
            Err(HeaderError::Truncated { .. }) => {
                trace!("{variant} DTS candidate needs more bytes");
                None
            }
            Err(e) => {
                trace!("Rejected {variant} DTS candidate: {e}");
                self.rejected += 1;
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Parameters of the most recently found header. Kept after the lock is
    /// lost, cleared by [`reset`](Self::reset).
    pub fn frame(&self) -> Option<&DtsFrameInfo> {
        self.frame.as_ref()
    }

    /// Sync words that failed header validation.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            locked: self.locked,
            frame_size: self.frame.map_or(0, |f| f.frame_size),
            sample_rate: self.frame.map_or(0, |f| f.sample_rate),
            dts_type: self.frame.map_or(DtsType::Unknown, |f| f.dts_type),
            locks: self.locks,
            losses: self.losses,
        }
    }

    pub fn reset(&mut self) {
        self.locked = false;
        self.frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::swap_16bit_words;

    const HEADER: [u8; 12] = [
        0x7F, 0xFE, 0x80, 0x01, 0xFC, 0x3C, 0x7D, 0xC2, 0x74, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn finds_header_after_garbage() {
        let mut data = vec![0x55; 37];
        data.extend_from_slice(&HEADER);

        let mut sync = DtsSync::new();
        assert_eq!(sync.scan(&data), 37);
        assert!(sync.is_locked());

        let frame = sync.frame().unwrap();
        assert_eq!(frame.frame_size, 0x7DC + 1);
        assert_eq!(frame.sample_rate, 48000);
        assert_eq!(sync.status().locks, 1);
    }

    #[test]
    fn nothing_found_unlocks() {
        let mut sync = DtsSync::new();
        assert_eq!(sync.scan(&HEADER), 0);

        let garbage = [0x11; 100];
        assert_eq!(sync.scan(&garbage), 100);
        assert!(!sync.is_locked());
        assert_eq!(sync.status().losses, 1);
        assert!(sync.frame().is_some());

        sync.reset();
        assert!(sync.frame().is_none());
    }

    #[test]
    fn header_too_close_to_end_is_skipped() {
        let mut data = vec![0x00; 8];
        data.extend_from_slice(&HEADER[..8]);

        let mut sync = DtsSync::new();
        assert_eq!(sync.scan(&data), data.len());
        assert!(!sync.is_locked());
        assert_eq!(sync.scan(&[]), 0);
    }

    #[test]
    fn truncated_candidate_is_not_rejected() {
        let swapped = swap_16bit_words(&HEADER);

        // Little-endian headers need 10 bytes, one more than the search window
        let mut sync = DtsSync::new();
        assert_eq!(sync.scan(&swapped[..SYNC_WINDOW]), SYNC_WINDOW);
        assert!(!sync.is_locked());
        assert_eq!(sync.rejected(), 0);

        assert_eq!(sync.scan(&swapped), 0);
        assert_eq!(sync.frame().unwrap().variant, DtsVariant::Le16);
        assert_eq!(sync.rejected(), 0);
    }

    #[test]
    fn invalid_header_is_not_a_lock() {
        let mut bad = HEADER;
        // Normal frame with a deficit count other than 31
        bad[4] = 0x80;

        let mut sync = DtsSync::new();
        assert_eq!(sync.scan(&bad), bad.len());
        assert_eq!(sync.rejected(), 1);
    }
}
