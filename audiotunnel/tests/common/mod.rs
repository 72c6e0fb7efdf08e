#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use audiotunnel::process::session::{AudioSession, SessionConfig};
use audiotunnel::stage::soft::SoftBackend;
use audiotunnel::stage::soft::sink::CaptureSink;

/// DTS core header, 16-bit big-endian: normal frame, 16 blocks,
/// frame size 2013, 48 kHz.
pub const DTS_HEADER: [u8; 12] = [
    0x7F, 0xFE, 0x80, 0x01, 0xFC, 0x3C, 0x7D, 0xC2, 0x74, 0x00, 0x00, 0x00,
];

pub struct Rig {
    pub backend: Arc<SoftBackend>,
    pub sink: Arc<Mutex<CaptureSink>>,
    pub session: AudioSession,
}

pub fn rig(config: SessionConfig) -> Rig {
    let sink = Arc::new(Mutex::new(CaptureSink::default()));
    let backend = Arc::new(SoftBackend::new(sink.clone()));
    let session = AudioSession::new(backend.clone(), config);
    Rig {
        backend,
        sink,
        session,
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn swap_words(data: &[u8]) -> Vec<u8> {
    data.chunks(2)
        .flat_map(|pair| pair.iter().rev().copied())
        .collect()
}

/// Repacks a 16-bit big-endian stream into 14 data bits per word, sign
/// extended to 16.
pub fn to_14bit(data: &[u8]) -> Vec<u8> {
    let bits: Vec<u16> = data
        .iter()
        .flat_map(|byte| (0..8).rev().map(move |i| ((byte >> i) & 1) as u16))
        .collect();

    bits.chunks(14)
        .flat_map(|chunk| {
            let mut word = (0..14).fold(0u16, |word, i| (word << 1) | chunk.get(i).copied().unwrap_or(0));
            if word & 0x2000 != 0 {
                word |= 0xC000;
            }
            word.to_be_bytes()
        })
        .collect()
}
