use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, trace, warn};

use super::lock;
use super::sink::{SharedSink, SinkFormat};
use crate::process::remap::{gain_from_millibels, scale_s16_le};
use crate::stage::{
    Command, MediaClock, Packet, PortIndex, PortSink, Stage, StageKind, StageState,
    check_transition,
};
use crate::structs::buffer::{BufferFlags, TransferBuffer};
use crate::structs::port::{
    DdpParams, DtsParams, Param, ParamKind, PcmParams, PortDefinition, StageConfig,
};
use crate::structs::stream::Encoding;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::StageError;

pub const RENDER_INPUT_PORT: PortIndex = PortIndex(100);
pub const RENDER_CLOCK_PORT: PortIndex = PortIndex(101);

const KIND: StageKind = StageKind::Renderer;

/// Counters kept by the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub buffers: usize,
    pub bytes: usize,
    pub dropped: usize,
    pub flushes: usize,
    pub start_time: Option<i64>,
    pub last_timestamp: Option<i64>,
}

struct RendererInner {
    state: StageState,
    input_enabled: bool,
    encoding: Encoding,
    pcm: PcmParams,
    dts: Option<DtsParams>,
    ddp: Option<DdpParams>,
    volume: i32,
    destination: Option<String>,
    configured: bool,
    clock: Option<Arc<dyn MediaClock>>,
    sink: SharedSink,
    stats: RenderStats,
}

impl RendererInner {
    fn sink_format(&self) -> SinkFormat {
        match self.encoding {
            Encoding::Pcm => SinkFormat::Pcm(self.pcm.clone()),
            Encoding::Dts => SinkFormat::Bitstream {
                encoding: Encoding::Dts,
                sample_rate: self.dts.as_ref().map_or(0, |d| d.sample_rate),
                channels: self.dts.as_ref().map_or(0, |d| d.channels),
            },
            Encoding::DolbyDigitalPlus => SinkFormat::Bitstream {
                encoding: Encoding::DolbyDigitalPlus,
                sample_rate: self.ddp.as_ref().map_or(0, |d| d.sample_rate),
                channels: self.ddp.as_ref().map_or(0, |d| d.channels),
            },
        }
    }

    fn render(
        &mut self,
        mut payload: Vec<u8>,
        flags: BufferFlags,
        timestamp: Option<i64>,
    ) -> Result<(), StageError> {
        let rejected = |reason: String| StageError::BufferRejected {
            stage: KIND,
            reason,
        };

        if !self.input_enabled || !self.state.is_loaded() {
            self.stats.dropped += 1;
            return Err(rejected(format!(
                "input port not accepting data in state {:?}",
                self.state
            )));
        }

        if flags.contains(BufferFlags::START_TIME) {
            self.stats.start_time = timestamp;
            if let (Some(clock), Some(pts)) = (&self.clock, timestamp) {
                clock.set_start_time(pts);
                trace!("{KIND}: clock anchored at {pts}");
            }
        }

        let mut sink = lock(&*self.sink);
        if !self.configured {
            let format = self.sink_format();
            sink.configure(&format).map_err(|e| rejected(e.to_string()))?;
            info!("{KIND}: output {format}");
            self.configured = true;
        }

        if self.encoding == Encoding::Pcm && self.pcm.bits_per_sample == 16 && self.volume != 0 {
            scale_s16_le(&mut payload, gain_from_millibels(self.volume));
        }

        sink.write(&payload).map_err(|e| rejected(e.to_string()))?;

        self.stats.buffers += 1;
        self.stats.bytes += payload.len();
        if !flags.contains(BufferFlags::TIME_UNKNOWN) && timestamp.is_some() {
            self.stats.last_timestamp = timestamp;
        }
        Ok(())
    }
}

struct RendererShared {
    inner: Mutex<RendererInner>,
}

impl RendererShared {
    fn lock(&self) -> MutexGuard<'_, RendererInner> {
        lock(&self.inner)
    }
}

struct RendererInput(Arc<RendererShared>);

impl PortSink for RendererInput {
    fn deliver(&self, packet: Packet) -> Result<(), StageError> {
        match packet {
            Packet::Data {
                payload,
                flags,
                timestamp,
            } => self.0.lock().render(payload, flags, timestamp),
            other => Err(StageError::BufferRejected {
                stage: KIND,
                reason: format!("unexpected {other:?} on input port"),
            }),
        }
    }
}

struct RendererClockInput(Arc<RendererShared>);

impl PortSink for RendererClockInput {
    fn deliver(&self, packet: Packet) -> Result<(), StageError> {
        match packet {
            Packet::ClockReference(clock) => {
                self.0.lock().clock = Some(clock);
                debug!("{KIND}: slaved to media clock");
                Ok(())
            }
            Packet::ClockDetached => {
                self.0.lock().clock = None;
                debug!("{KIND}: media clock detached");
                Ok(())
            }
            Packet::Data { .. } => Err(StageError::BufferRejected {
                stage: KIND,
                reason: "media data on clock port".to_string(),
            }),
        }
    }
}

/// Read-only view of a [`SoftRenderer`].
#[derive(Clone)]
pub struct RendererHandle(Arc<RendererShared>);

impl RendererHandle {
    pub fn state(&self) -> StageState {
        self.0.lock().state
    }

    pub fn stats(&self) -> RenderStats {
        self.0.lock().stats.clone()
    }

    pub fn volume(&self) -> i32 {
        self.0.lock().volume
    }

    pub fn encoding(&self) -> Encoding {
        self.0.lock().encoding
    }

    pub fn pcm(&self) -> PcmParams {
        self.0.lock().pcm.clone()
    }

    pub fn dts(&self) -> Option<DtsParams> {
        self.0.lock().dts.clone()
    }

    pub fn ddp(&self) -> Option<DdpParams> {
        self.0.lock().ddp.clone()
    }

    pub fn destination(&self) -> Option<String> {
        self.0.lock().destination.clone()
    }

    /// Media time of the clock the renderer is slaved to.
    pub fn media_time(&self) -> Option<i64> {
        self.0.lock().clock.as_ref().and_then(|c| c.media_time())
    }

    pub fn has_clock(&self) -> bool {
        self.0.lock().clock.is_some()
    }
}

/// Renderer stage writing to an [`AudioSink`](super::sink::AudioSink).
///
/// Input format parameters can only change while the stage is Idle or
/// Loaded, or while the input port is disabled. Volume is applied to 16-bit
/// PCM only.
pub struct SoftRenderer {
    shared: Arc<RendererShared>,
    sent: Vec<Command>,
}

impl SoftRenderer {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            shared: Arc::new(RendererShared {
                inner: Mutex::new(RendererInner {
                    state: StageState::Idle,
                    input_enabled: true,
                    encoding: Encoding::Pcm,
                    pcm: PcmParams::default(),
                    dts: None,
                    ddp: None,
                    volume: 0,
                    destination: None,
                    configured: false,
                    clock: None,
                    sink,
                    stats: RenderStats::default(),
                }),
            }),
            sent: Vec::new(),
        }
    }

    pub fn handle(&self) -> RendererHandle {
        RendererHandle(self.shared.clone())
    }

    fn rejected(port: PortIndex, kind: ParamKind) -> StageError {
        StageError::ParameterRejected {
            stage: KIND,
            port,
            name: kind.name(),
        }
    }
}

impl Stage for SoftRenderer {
    fn kind(&self) -> StageKind {
        KIND
    }

    fn state(&self) -> StageState {
        self.shared.lock().state
    }

    fn set_state(&mut self, state: StageState) -> Result<(), StageError> {
        let mut inner = self.shared.lock();
        check_transition(KIND, inner.state, state)?;

        match state {
            StageState::TearingDown => inner.clock = None,
            StageState::Idle => inner.configured = false,
            _ => (),
        }

        trace!("{KIND}: {:?} -> {:?}", inner.state, state);
        inner.state = state;
        Ok(())
    }

    fn input_port(&self) -> Option<PortIndex> {
        Some(RENDER_INPUT_PORT)
    }

    fn output_port(&self) -> Option<PortIndex> {
        None
    }

    fn clock_port(&self) -> Option<PortIndex> {
        Some(RENDER_CLOCK_PORT)
    }

    fn get_parameter(&self, port: PortIndex, kind: ParamKind) -> Result<Param, StageError> {
        if port != RENDER_INPUT_PORT {
            return Err(StageError::UnknownPort { stage: KIND, port });
        }

        let inner = self.shared.lock();
        match kind {
            ParamKind::Pcm => Ok(Param::Pcm(inner.pcm.clone())),
            ParamKind::PortFormat => Ok(Param::PortFormat(inner.encoding)),
            ParamKind::Dts => inner
                .dts
                .clone()
                .map(Param::Dts)
                .ok_or_else(|| Self::rejected(port, kind)),
            ParamKind::Ddp => inner
                .ddp
                .clone()
                .map(Param::Ddp)
                .ok_or_else(|| Self::rejected(port, kind)),
            ParamKind::PortDefinition => Ok(Param::PortDefinition(PortDefinition {
                port,
                buffer_size: 0,
                buffer_count: 0,
                encoding: inner.encoding,
                enabled: inner.input_enabled,
            })),
            ParamKind::DecoderPassthrough => Err(Self::rejected(port, kind)),
        }
    }

    fn set_parameter(&mut self, port: PortIndex, param: Param) -> Result<(), StageError> {
        if port != RENDER_INPUT_PORT {
            return Err(StageError::UnknownPort { stage: KIND, port });
        }

        let kind = param.kind();
        let mut inner = self.shared.lock();
        if !inner.state.accepts_parameters() && inner.input_enabled {
            return Err(StageError::PortEnabled {
                stage: KIND,
                port,
                name: kind.name(),
            });
        }

        match param {
            Param::Pcm(pcm) => inner.pcm = pcm,
            Param::PortFormat(encoding) => inner.encoding = encoding,
            Param::Dts(dts) if inner.encoding == Encoding::Dts => inner.dts = Some(dts),
            Param::Ddp(ddp) if inner.encoding == Encoding::DolbyDigitalPlus => {
                inner.ddp = Some(ddp)
            }
            _ => return Err(Self::rejected(port, kind)),
        }

        inner.configured = false;
        Ok(())
    }

    fn set_config(&mut self, config: StageConfig) -> Result<(), StageError> {
        let mut inner = self.shared.lock();
        match config {
            StageConfig::AudioDestination(destination) => {
                debug!("{KIND}: destination {destination}");
                inner.destination = Some(destination);
            }
            StageConfig::Volume(volume) => {
                trace!("{KIND}: volume {volume} mB");
                inner.volume = volume;
            }
        }
        Ok(())
    }

    fn send_command(&mut self, command: Command) -> Result<(), StageError> {
        match command {
            Command::PortDisable(RENDER_INPUT_PORT) => self.shared.lock().input_enabled = false,
            Command::PortEnable(RENDER_INPUT_PORT) => self.shared.lock().input_enabled = true,
            Command::PortDisable(RENDER_CLOCK_PORT) | Command::PortEnable(RENDER_CLOCK_PORT) => (),
            Command::Flush(port) => self.flush_port(port)?,
            Command::PortDisable(port) | Command::PortEnable(port) => {
                return Err(StageError::UnknownPort { stage: KIND, port });
            }
        }

        self.sent.push(command);
        Ok(())
    }

    fn wait_for_command(&mut self, command: Command, timeout: Duration) -> Result<(), StageError> {
        // Commands complete synchronously under the stage lock
        match self.sent.iter().position(|sent| *sent == command) {
            Some(pos) => {
                self.sent.remove(pos);
                Ok(())
            }
            None => Err(StageError::CommandTimeout {
                stage: KIND,
                command,
                timeout,
            }),
        }
    }

    fn allocate_input_buffers(&mut self) -> Result<Arc<BufferPool>, StageError> {
        Err(StageError::IncorrectState {
            stage: KIND,
            state: self.state(),
        })
    }

    fn empty_buffer(&mut self, buffer: TransferBuffer) -> Result<(), StageError> {
        self.shared
            .lock()
            .render(buffer.payload().to_vec(), buffer.flags, buffer.timestamp)
    }

    fn flush_port(&mut self, port: PortIndex) -> Result<(), StageError> {
        match port {
            RENDER_INPUT_PORT => {
                let mut inner = self.shared.lock();
                inner.stats.flushes += 1;
                inner.stats.last_timestamp = None;
                if let Err(e) = lock(&*inner.sink).flush() {
                    warn!("{KIND}: sink flush failed: {e}");
                }
                Ok(())
            }
            RENDER_CLOCK_PORT => Ok(()),
            _ => Err(StageError::UnknownPort { stage: KIND, port }),
        }
    }

    fn port_sink(&self, port: PortIndex) -> Result<Arc<dyn PortSink>, StageError> {
        match port {
            RENDER_INPUT_PORT => Ok(Arc::new(RendererInput(self.shared.clone()))),
            RENDER_CLOCK_PORT => Ok(Arc::new(RendererClockInput(self.shared.clone()))),
            _ => Err(StageError::UnknownPort { stage: KIND, port }),
        }
    }

    fn attach(&mut self, port: PortIndex, _peer: Option<Arc<dyn PortSink>>) -> Result<(), StageError> {
        Err(StageError::UnknownPort { stage: KIND, port })
    }
}
