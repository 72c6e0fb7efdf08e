//! Client-facing audio output session.
//!
//! An [`AudioSession`] negotiates the stream format, builds a
//! [`PipelineGraph`] and pushes caller data through it in pool-sized
//! transfers.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::process::graph::{BufferGeometry, DEFAULT_HANDSHAKE_TIMEOUT, PipelineGraph};
use crate::process::remap::{ChannelRemapper, output_channel_count};
use crate::process::sync::{DtsSync, SyncStatus};
use crate::stage::{SharedStage, StageFactory};
use crate::structs::buffer::BufferFlags;
use crate::structs::channel::{CANONICAL_ROLES, ChannelLayout, MAX_CHANNELS};
use crate::structs::stream::{Encoding, StreamHints, StreamParameters};
use crate::structs::wave::WaveFormatExtensible;
use crate::utils::errors::{GraphError, PoolError, SessionError};
use crate::utils::timing::{advance_pts, bytes_to_seconds};

/// Lowest volume level in millibels, used as mute.
pub const VOLUME_MINIMUM: i32 = -6000;

/// Bytes of an unsynchronised chunk kept for the next header search.
pub const SYNC_CARRY_BYTES: usize = 9;

pub const DEFAULT_CHUNK_BYTES: usize = 6144;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Output device; `"hdmi"` selects the HDMI destination.
    pub device: String,
    pub passthrough: bool,
    /// Seconds of audio the decoder input queue can hold.
    pub buffer_seconds: u32,
    pub chunk_bytes: usize,
    pub handshake_timeout: Duration,
    /// Longest wait for a free transfer buffer.
    pub buffer_timeout: Duration,
    /// Carry the tail of an unsynchronised chunk into the next DTS search.
    pub sync_carry_over: bool,
    /// Initial volume in millibels.
    pub volume: i32,
    /// Gain in millibels applied to remapped 16-bit PCM; zero leaves samples untouched.
    pub drc: i32,
    pub fail_level: log::Level,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: "local".to_string(),
            passthrough: false,
            buffer_seconds: 3,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            buffer_timeout: Duration::from_millis(200),
            sync_carry_over: true,
            volume: 0,
            drc: 0,
            fail_level: log::Level::Error,
        }
    }
}

/// How submitted payload bytes map back onto the caller's input.
#[derive(Debug, Clone, Copy)]
enum Consumption {
    Direct,
    Remapped {
        input_frame: usize,
        output_frame: usize,
    },
    Resynced {
        skip: usize,
        carried: usize,
    },
}

impl Consumption {
    fn caller_bytes(self, sent: usize, len: usize) -> usize {
        match self {
            Consumption::Direct => sent,
            Consumption::Remapped {
                input_frame,
                output_frame,
            } => sent / output_frame * input_frame,
            Consumption::Resynced { skip, carried } => (skip + sent).saturating_sub(carried).min(len),
        }
    }
}

fn destination(device: &str) -> &'static str {
    if device == "hdmi" { "hdmi" } else { "local" }
}

fn invalid(reason: String) -> SessionError {
    SessionError::InvalidStream(reason)
}

/// One audio output stream.
///
/// Dropping the session deinitializes it.
pub struct AudioSession {
    config: SessionConfig,
    factory: Arc<dyn StageFactory>,
    graph: PipelineGraph,
    stream: Option<StreamParameters>,
    buffer_len: usize,
    remapper: ChannelRemapper,
    remap_active: bool,
    sync: DtsSync,
    carry: Vec<u8>,
    start_pending: bool,
    paused: bool,
    volume: i32,
    muted: bool,
}

impl AudioSession {
    pub fn new(factory: Arc<dyn StageFactory>, config: SessionConfig) -> Self {
        let graph = PipelineGraph::new(
            destination(&config.device),
            config.handshake_timeout,
            config.fail_level,
        );
        Self {
            volume: config.volume,
            config,
            factory,
            graph,
            stream: None,
            buffer_len: 0,
            remapper: ChannelRemapper::new(),
            remap_active: false,
            sync: DtsSync::new(),
            carry: Vec::new(),
            start_pending: false,
            paused: false,
            muted: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Parameters negotiated by the last successful initialize.
    pub fn stream(&self) -> Option<&StreamParameters> {
        self.stream.as_ref()
    }

    pub fn sync_state(&self) -> SyncStatus {
        self.sync.status()
    }

    /// Negotiates the stream format and builds the pipeline.
    ///
    /// `clock` attaches a caller-owned clock stage; without one the session
    /// creates its own. Re-initializing tears down the previous pipeline.
    pub fn initialize(
        &mut self,
        hints: &StreamHints,
        clock: Option<SharedStage>,
    ) -> Result<(), SessionError> {
        self.deinitialize();

        let stream = self.negotiate(hints)?;
        let bytes_per_second = stream.bytes_per_second();
        let buffer_len = bytes_per_second * self.config.buffer_seconds as usize;
        let geometry = BufferGeometry {
            chunk_bytes: self.config.chunk_bytes,
            total_bytes: buffer_len,
        };

        let header = (stream.encoding == Encoding::Pcm)
            .then(|| WaveFormatExtensible::for_stream(&stream).to_bytes());

        self.graph = PipelineGraph::new(
            destination(&self.config.device),
            self.config.handshake_timeout,
            self.config.fail_level,
        );
        if let Err(e) = self.graph.build(
            self.factory.as_ref(),
            &stream,
            geometry,
            clock,
            header.as_deref(),
        ) {
            error!("Failed to initialize audio output: {e}");
            self.remapper.reset();
            self.remap_active = false;
            return Err(e.into());
        }

        if !stream.passthrough {
            self.muted = false;
            if let Err(e) = self.graph.set_volume(self.volume) {
                error!("Failed to apply initial volume: {e}");
                self.graph.teardown();
                return Err(e.into());
            }
        }

        info!(
            "Audio output initialized: {} {} ch ({} from source) @ {} Hz, {} bit, {} ms buffered, device {}{}",
            stream.encoding,
            stream.channels,
            stream.data_channels,
            stream.sample_rate,
            stream.bits_per_sample,
            self.config.buffer_seconds * 1000,
            destination(&self.config.device),
            if self.remap_active { ", remapped" } else { "" }
        );

        self.buffer_len = buffer_len;
        self.stream = Some(stream);
        self.start_pending = true;
        self.paused = false;
        Ok(())
    }

    fn negotiate(&mut self, hints: &StreamHints) -> Result<StreamParameters, SessionError> {
        if hints.channels == 0 || hints.channels as usize > MAX_CHANNELS {
            return Err(invalid(format!("{} channels", hints.channels)));
        }
        if hints.sample_rate == 0 {
            return Err(invalid("sample rate 0".to_string()));
        }
        if ![8, 16, 24, 32].contains(&hints.bits_per_sample) {
            return Err(invalid(format!("{} bits per sample", hints.bits_per_sample)));
        }

        let encoding = Encoding::select(hints.codec, self.config.passthrough);
        let passthrough = encoding.is_bitstream();
        let bytes_per_sample = (hints.bits_per_sample / 8) as usize;

        let mut channels = hints.channels;
        let mut channel_map = ChannelLayout::canonical(channels as usize);
        self.remapper.reset();
        self.remap_active = false;

        if let (false, Some(layout)) = (passthrough, &hints.layout) {
            if layout.len() != channels as usize {
                return Err(invalid(format!(
                    "layout [{layout}] has {} roles for {channels} channels",
                    layout.len()
                )));
            }

            let output = self.remapper.set_input_format(
                channels as usize,
                layout.roles(),
                bytes_per_sample,
                hints.sample_rate,
            );
            let output_channels = output_channel_count(&output);
            self.remapper
                .set_output_format(output_channels, &CANONICAL_ROLES);

            if self.remapper.can_remap() {
                channels = output_channels as u32;
                channel_map = ChannelLayout::canonical(output_channels);
                self.remap_active = !self.remapper.is_identity();
                debug!("Input layout [{layout}] -> output [{channel_map}]");
            } else {
                warn!("Channel layout [{layout}] cannot be remapped, sending as is");
                if layout.is_canonical() {
                    channel_map = layout.clone();
                }
            }
        }

        Ok(StreamParameters {
            channels,
            data_channels: hints.channels,
            sample_rate: hints.sample_rate,
            bits_per_sample: hints.bits_per_sample,
            encoding,
            passthrough,
            channel_map,
            extra_data: hints.extra_data.clone(),
        })
    }

    /// Tears down the pipeline. Does nothing when not initialized.
    pub fn deinitialize(&mut self) {
        if self.stream.take().is_none() {
            return;
        }
        self.graph.teardown();
        self.remapper.reset();
        self.remap_active = false;
        self.sync.reset();
        self.carry.clear();
        self.buffer_len = 0;
        self.start_pending = false;
        self.paused = false;
        info!("Audio output deinitialized");
    }

    /// Queues `data` for playback and returns how many of its bytes were
    /// consumed.
    ///
    /// Timestamps are in microseconds. Unsynchronised DTS input is consumed
    /// without being submitted. When remapping, only whole frames are taken.
    pub fn add_packets(
        &mut self,
        data: &[u8],
        dts: Option<i64>,
        pts: Option<i64>,
    ) -> Result<usize, SessionError> {
        let Some(stream) = &self.stream else {
            return Err(SessionError::NotInitialized);
        };
        trace!("add_packets: {} bytes dts={dts:?} pts={pts:?}", data.len());
        if data.is_empty() {
            return Ok(0);
        }

        let (payload, consumed, consumption) =
            if stream.encoding == Encoding::Dts && !self.sync.is_locked() {
                let carried = if self.config.sync_carry_over {
                    self.carry.len()
                } else {
                    0
                };
                let mut window = std::mem::take(&mut self.carry);
                window.truncate(carried);
                window.extend_from_slice(data);

                let skip = self.sync.scan(&window);
                if !self.sync.is_locked() {
                    if self.config.sync_carry_over {
                        let keep = window.len().min(SYNC_CARRY_BYTES);
                        window.drain(..window.len() - keep);
                        self.carry = window;
                    }
                    trace!("No DTS sync in {} bytes", data.len());
                    return Ok(data.len());
                }

                if skip > 0 {
                    debug!("Dropped {skip} bytes ahead of DTS sync");
                }
                window.drain(..skip);
                (
                    Cow::Owned(window),
                    data.len(),
                    Consumption::Resynced { skip, carried },
                )
            } else if self.remap_active {
                let input_frame = self.remapper.input_frame_bytes();
                let output_frame = self.remapper.output_frame_bytes();
                let frames = data.len() / input_frame;
                if frames == 0 {
                    return Ok(0);
                }

                let mut remapped = vec![0u8; frames * output_frame];
                let written = self.remapper.remap(data, &mut remapped, frames, self.config.drc);
                remapped.truncate(written * output_frame);
                (
                    Cow::Owned(remapped),
                    written * input_frame,
                    Consumption::Remapped {
                        input_frame,
                        output_frame,
                    },
                )
            } else {
                (Cow::Borrowed(data), data.len(), Consumption::Direct)
            };

        match self.transfer(&payload, pts) {
            Ok(()) => Ok(consumed),
            Err(SessionError::BufferTimeout { accepted }) => Err(SessionError::BufferTimeout {
                accepted: consumption.caller_bytes(accepted, data.len()),
            }),
            Err(e) => Err(e),
        }
    }

    /// Splits `payload` into transfer buffers and submits them in order.
    fn transfer(&mut self, payload: &[u8], mut pts: Option<i64>) -> Result<(), SessionError> {
        let bytes_per_second = self
            .stream
            .as_ref()
            .map_or(0, StreamParameters::bytes_per_second);

        let mut offset = 0;
        while offset < payload.len() {
            let mut buffer = match self.graph.acquire(self.config.buffer_timeout) {
                Ok(buffer) => buffer,
                Err(PoolError::Timeout(waited)) => {
                    warn!("No transfer buffer within {waited:?}, {offset} bytes submitted");
                    return Err(SessionError::BufferTimeout { accepted: offset });
                }
                Err(source) => {
                    return Err(GraphError::Pool {
                        step: "acquire transfer buffer",
                        source,
                    }
                    .into());
                }
            };

            let filled = buffer.fill_from(&payload[offset..]);
            offset += filled;

            let mut flags = BufferFlags::empty();
            if self.start_pending {
                flags |= BufferFlags::START_TIME;
                self.start_pending = false;
            }
            if pts.is_none() {
                flags |= BufferFlags::TIME_UNKNOWN;
            }
            if offset == payload.len() {
                flags |= BufferFlags::END_OF_FRAME;
            }
            buffer.flags = flags;
            buffer.timestamp = pts;
            pts = pts.map(|pts| advance_pts(pts, filled, bytes_per_second));

            trace!("Submitting {filled} bytes {flags:?} pts={:?}", buffer.timestamp);
            if let Err(e) = self.graph.submit(buffer) {
                error!("Transfer to decoder failed: {e}");
                return Err(SessionError::Transfer(e));
            }

            if self.graph.first_frame_pending() {
                let stream = self.stream.as_ref().ok_or(SessionError::NotInitialized)?;
                if let Err(e) = self.graph.reconfigure(stream, self.sync.frame()) {
                    error!("Reconfiguration after first frame failed: {e}");
                    self.deinitialize();
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Pauses decoding. Pausing twice is a no-op.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.ensure_initialized()?;
        if self.paused {
            return Ok(());
        }
        self.graph.pause()?;
        self.paused = true;
        debug!("Audio output paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.ensure_initialized()?;
        if !self.paused {
            return Ok(());
        }
        self.graph.resume()?;
        self.paused = false;
        debug!("Audio output resumed");
        Ok(())
    }

    /// Drops queued audio and leaves the pause state.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.flush()?;
        self.resume()
    }

    /// Drops queued audio. The next transfer starts a new timeline and DTS
    /// input is searched for sync again.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        self.ensure_initialized()?;
        self.graph.flush()?;
        self.start_pending = true;
        self.sync.reset();
        self.carry.clear();
        Ok(())
    }

    /// Sets the volume in millibels, clamped at [`VOLUME_MINIMUM`]. While
    /// muted the level is stored and applied on unmute.
    pub fn set_volume(&mut self, millibels: i32) -> Result<(), SessionError> {
        self.ensure_volume_control()?;
        self.volume = millibels.max(VOLUME_MINIMUM);
        if !self.muted {
            self.graph.set_volume(self.volume)?;
        }
        Ok(())
    }

    pub fn mute(&mut self, mute: bool) -> Result<(), SessionError> {
        self.ensure_volume_control()?;
        let level = if mute { VOLUME_MINIMUM } else { self.volume };
        self.graph.set_volume(level)?;
        self.muted = mute;
        Ok(())
    }

    /// Stored volume level, unaffected by mute.
    pub fn current_volume(&self) -> i32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn ensure_initialized(&self) -> Result<&StreamParameters, SessionError> {
        self.stream.as_ref().ok_or(SessionError::NotInitialized)
    }

    fn ensure_volume_control(&self) -> Result<(), SessionError> {
        if self.ensure_initialized()?.passthrough {
            return Err(SessionError::PassthroughVolume);
        }
        Ok(())
    }

    /// Free queue space in caller bytes.
    pub fn get_space(&self) -> usize {
        let Some(stream) = &self.stream else {
            return 0;
        };
        self.graph.input_space() / stream.channels as usize * stream.data_channels as usize
    }

    /// Seconds of audio queued ahead of the decoder.
    pub fn get_delay(&self) -> f32 {
        let Some(stream) = &self.stream else {
            return 0.0;
        };
        let queued = self.graph.input_size() - self.graph.input_space();
        bytes_to_seconds(queued, stream.bytes_per_second())
    }

    /// Seconds of audio buffered, between zero and
    /// [`get_cache_total`](Self::get_cache_total).
    pub fn get_cache_time(&self) -> f32 {
        let Some(stream) = &self.stream else {
            return 0.0;
        };
        // Decoder-side bytes, so remapped layouts do not skew the result
        let used = self.buffer_len.saturating_sub(self.graph.input_space());
        bytes_to_seconds(used, stream.bytes_per_second()).clamp(0.0, self.get_cache_total())
    }

    pub fn get_cache_total(&self) -> f32 {
        self.stream.as_ref().map_or(0.0, |stream| {
            bytes_to_seconds(self.buffer_len, stream.bytes_per_second())
        })
    }

    /// Preferred size of one `add_packets` call in caller bytes.
    pub fn get_chunk_len(&self) -> usize {
        self.stream.as_ref().map_or(0, |stream| {
            self.config.chunk_bytes / stream.channels as usize * stream.data_channels as usize
        })
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::soft::SoftBackend;
    use crate::structs::channel::ChannelRole::{
        BackLeft as BL, BackRight as BR, FrontCenter as FC, FrontLeft as FL, FrontRight as FR,
        LowFrequency as LFE,
    };
    use crate::structs::stream::Codec;

    fn session(config: SessionConfig) -> (Arc<SoftBackend>, AudioSession) {
        let backend = Arc::new(SoftBackend::default());
        let session = AudioSession::new(backend.clone(), config);
        (backend, session)
    }

    fn wave_5_1() -> StreamHints {
        StreamHints {
            channels: 6,
            layout: Some(ChannelLayout::new(vec![FL, FR, FC, LFE, BL, BR]).unwrap()),
            ..StreamHints::default()
        }
    }

    #[test]
    fn uninitialized_session() {
        let (_, mut session) = session(SessionConfig::default());

        assert_eq!(session.add_packets(&[0; 16], None, None), Err(SessionError::NotInitialized));
        assert_eq!(session.set_volume(-100), Err(SessionError::NotInitialized));
        assert_eq!(session.flush(), Err(SessionError::NotInitialized));
        assert_eq!(session.get_space(), 0);
        assert_eq!(session.get_chunk_len(), 0);
        assert_eq!(session.get_cache_total(), 0.0);
        session.deinitialize();
    }

    #[test]
    fn rejects_invalid_hints() {
        let (_, mut session) = session(SessionConfig::default());

        for hints in [
            StreamHints { channels: 0, ..StreamHints::default() },
            StreamHints { channels: 9, ..StreamHints::default() },
            StreamHints { sample_rate: 0, ..StreamHints::default() },
            StreamHints { bits_per_sample: 12, ..StreamHints::default() },
        ] {
            assert!(matches!(
                session.initialize(&hints, None),
                Err(SessionError::InvalidStream(_))
            ));
        }
        assert!(!session.is_initialized());
    }

    #[test]
    fn remaps_whole_frames_only() {
        let (backend, mut session) = session(SessionConfig::default());
        session.initialize(&wave_5_1(), None).unwrap();

        let stream = session.stream().unwrap();
        assert_eq!(stream.channels, 6);
        assert_eq!(stream.data_channels, 6);
        assert_eq!(stream.channel_map, ChannelLayout::canonical(6));

        // 6 channels * 2 bytes per frame
        assert_eq!(session.add_packets(&[0; 11], None, None), Ok(0));
        assert_eq!(session.add_packets(&[0; 30], None, Some(0)), Ok(24));

        let history = backend.decoder().unwrap().history();
        assert_eq!(history.last().unwrap().filled, 24);
    }

    #[test]
    fn front_center_only_expands_to_slot() {
        let (_, mut session) = session(SessionConfig::default());
        let hints = StreamHints {
            channels: 1,
            layout: Some(ChannelLayout::new(vec![FC]).unwrap()),
            ..StreamHints::default()
        };
        session.initialize(&hints, None).unwrap();

        let stream = session.stream().unwrap();
        assert_eq!(stream.channels, 5);
        assert_eq!(stream.data_channels, 1);
        assert_eq!(session.get_chunk_len(), DEFAULT_CHUNK_BYTES / 5);
    }

    #[test]
    fn passthrough_selects_bitstream_encoding() {
        let config = SessionConfig {
            passthrough: true,
            device: "hdmi".to_string(),
            ..SessionConfig::default()
        };
        let (backend, mut session) = session(config);

        let hints = StreamHints {
            channels: 6,
            codec: Codec::Eac3,
            ..StreamHints::default()
        };
        session.initialize(&hints, None).unwrap();

        let stream = session.stream().unwrap();
        assert_eq!(stream.encoding, Encoding::DolbyDigitalPlus);
        assert!(stream.passthrough);
        assert_eq!(session.set_volume(-100), Err(SessionError::PassthroughVolume));
        assert_eq!(session.mute(true), Err(SessionError::PassthroughVolume));

        let renderer = backend.renderer().unwrap();
        assert_eq!(renderer.destination().as_deref(), Some("hdmi"));
        // No codec-config header in passthrough
        assert!(backend.decoder().unwrap().history().is_empty());
    }

    #[test]
    fn mute_keeps_stored_level() {
        let config = SessionConfig {
            volume: -300,
            ..SessionConfig::default()
        };
        let (backend, mut session) = session(config);
        session.initialize(&StreamHints::default(), None).unwrap();

        let renderer = backend.renderer().unwrap();
        assert_eq!(renderer.volume(), -300);

        session.mute(true).unwrap();
        assert_eq!(renderer.volume(), VOLUME_MINIMUM);
        assert_eq!(session.current_volume(), -300);

        session.set_volume(-9000).unwrap();
        assert_eq!(renderer.volume(), VOLUME_MINIMUM);
        assert_eq!(session.current_volume(), VOLUME_MINIMUM);

        session.set_volume(-1200).unwrap();
        session.mute(false).unwrap();
        assert_eq!(renderer.volume(), -1200);
    }

    #[test]
    fn pause_and_stop() {
        let (_, mut session) = session(SessionConfig::default());
        session.initialize(&StreamHints::default(), None).unwrap();

        session.pause().unwrap();
        session.pause().unwrap();
        assert!(session.is_paused());

        session.stop().unwrap();
        assert!(!session.is_paused());
        session.resume().unwrap();
    }

    #[test]
    fn queries_follow_geometry() {
        let (_, mut session) = session(SessionConfig::default());
        session.initialize(&StreamHints::default(), None).unwrap();

        // 48 kHz stereo s16: 192000 bytes per second, 3 s buffered
        assert_eq!(session.get_chunk_len(), DEFAULT_CHUNK_BYTES);
        assert_eq!(session.get_cache_total(), 3.0);

        let cache = session.get_cache_time();
        assert!((0.0..=session.get_cache_total()).contains(&cache));
        assert!(session.get_space() <= 576_000);
    }
}
