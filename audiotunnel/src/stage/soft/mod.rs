//! In-process implementations of the decoder, renderer and clock stages.
//!
//! The decoder runs a worker thread that forwards queued transfer buffers
//! through its output tunnel. The renderer writes what it receives to an
//! [`AudioSink`]. The clock derives media time from the wall clock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::stage::{Stage, StageFactory, StageKind};
use crate::utils::errors::StageError;

pub mod clock;
pub mod decoder;
pub mod renderer;
pub mod sink;

use clock::SoftClock;
use decoder::{DecoderHandle, SoftDecoder};
use renderer::{RendererHandle, SoftRenderer};
use sink::{NullSink, SharedSink};

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory for software stages.
///
/// Every renderer it creates writes to the same sink. Handles to the most
/// recently created decoder and renderer stay available for inspection after
/// the pipeline has taken ownership of the stages.
pub struct SoftBackend {
    sink: SharedSink,
    unavailable: Option<StageKind>,
    decoder: Mutex<Option<DecoderHandle>>,
    renderer: Mutex<Option<RendererHandle>>,
    created: Mutex<Vec<StageKind>>,
}

impl SoftBackend {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            unavailable: None,
            decoder: Mutex::new(None),
            renderer: Mutex::new(None),
            created: Mutex::new(Vec::new()),
        }
    }

    /// A backend that refuses to create stages of `kind`.
    pub fn without(mut self, kind: StageKind) -> Self {
        self.unavailable = Some(kind);
        self
    }

    pub fn sink(&self) -> SharedSink {
        self.sink.clone()
    }

    pub fn decoder(&self) -> Option<DecoderHandle> {
        lock(&self.decoder).clone()
    }

    pub fn renderer(&self) -> Option<RendererHandle> {
        lock(&self.renderer).clone()
    }

    /// Kinds of every stage created so far, in creation order.
    pub fn created(&self) -> Vec<StageKind> {
        lock(&self.created).clone()
    }
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new(NullSink::shared())
    }
}

impl StageFactory for SoftBackend {
    fn create(&self, kind: StageKind) -> Result<Box<dyn Stage>, StageError> {
        if self.unavailable == Some(kind) {
            return Err(StageError::Unavailable { stage: kind });
        }

        let stage: Box<dyn Stage> = match kind {
            StageKind::Decoder => {
                let decoder = SoftDecoder::new();
                *lock(&self.decoder) = Some(decoder.handle());
                Box::new(decoder)
            }
            StageKind::Renderer => {
                let renderer = SoftRenderer::new(self.sink.clone());
                *lock(&self.renderer) = Some(renderer.handle());
                Box::new(renderer)
            }
            StageKind::Clock => Box::new(SoftClock::new()),
        };

        debug!("Created software stage {kind}");
        lock(&self.created).push(kind);
        Ok(stage)
    }
}
