//! Construction, reconfiguration and teardown of the decoder, renderer and
//! clock stages and the tunnels between them.
//!
//! ```text
//!  client --buffers--> [decoder] ==tunnel==> [renderer] <==tunnel== [clock]
//! ```

use std::sync::Arc;
use std::time::Duration;

use log::Level::Warn;
use log::{debug, info, trace, warn};

use crate::log_or_err;
use crate::stage::tunnel::{Tunnel, TunnelState};
use crate::stage::{
    Command, PortIndex, SharedStage, Stage, StageFactory, StageKind, StageState,
};
use crate::structs::buffer::{BufferFlags, TransferBuffer};
use crate::structs::channel::ChannelLayout;
use crate::structs::dts::{DtsFrameInfo, DtsType};
use crate::structs::port::{
    DdpBitstreamId, DdpParams, DtsParams, Param, ParamKind, PcmParams, StageConfig,
};
use crate::structs::stream::{Encoding, StreamParameters};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::{GraphError, PoolError, StageError, TunnelError};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Size of each transfer buffer and of the whole input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub chunk_bytes: usize,
    pub total_bytes: usize,
}

impl BufferGeometry {
    pub fn buffer_count(&self) -> usize {
        self.total_bytes.checked_div(self.chunk_bytes).unwrap_or(0)
    }

    fn validate(&self) -> Result<(), GraphError> {
        if self.buffer_count() == 0 {
            return Err(GraphError::InvalidGeometry {
                chunk_bytes: self.chunk_bytes,
                total_bytes: self.total_bytes,
            });
        }
        Ok(())
    }
}

/// Where the renderer's media clock comes from.
pub enum ClockSource {
    /// Created for this pipeline; started and destroyed with it.
    Owned(Box<dyn Stage>),
    /// Supplied by the caller; only attached and detached.
    Shared(SharedStage),
}

impl ClockSource {
    pub fn is_owned(&self) -> bool {
        matches!(self, ClockSource::Owned(_))
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut dyn Stage) -> R) -> Result<R, GraphError> {
        match self {
            ClockSource::Owned(stage) => Ok(f(stage.as_mut())),
            ClockSource::Shared(stage) => {
                let mut guard = stage.lock().map_err(|_| GraphError::ClockPoisoned)?;
                Ok(f(&mut *guard))
            }
        }
    }
}

fn stage_step(step: &'static str) -> impl Fn(StageError) -> GraphError {
    move |source| GraphError::Stage { step, source }
}

fn tunnel_step(step: &'static str) -> impl Fn(TunnelError) -> GraphError {
    move |source| GraphError::Tunnel { step, source }
}

fn pool_step(step: &'static str) -> impl Fn(PoolError) -> GraphError {
    move |source| GraphError::Pool { step, source }
}

fn required(
    stage: &dyn Stage,
    port: Option<PortIndex>,
    role: &'static str,
) -> Result<PortIndex, GraphError> {
    port.ok_or(GraphError::MissingPort {
        stage: stage.kind(),
        role,
    })
}

fn pcm_params(stream: &StreamParameters) -> PcmParams {
    PcmParams {
        channels: stream.channels,
        bits_per_sample: stream.bits_per_sample,
        sample_rate: stream.sample_rate,
        signed: true,
        little_endian: true,
        interleaved: true,
        channel_mapping: stream.channel_map.clone(),
    }
}

/// Channel count announced in passthrough descriptors.
fn descriptor_channels(stream: &StreamParameters) -> u32 {
    if stream.data_channels == 6 {
        8
    } else {
        stream.data_channels
    }
}

fn dts_params(stream: &StreamParameters, frame: Option<&DtsFrameInfo>) -> DtsParams {
    let channels = descriptor_channels(stream);
    DtsParams {
        channels,
        bit_rate: 0,
        sample_rate: frame.map_or(stream.sample_rate, |f| f.sample_rate),
        format: frame.map_or(0, |f| f.variant.format_flags()),
        dts_type: frame.map_or(DtsType::Unknown, |f| f.dts_type) as u8,
        frame_size: frame.map_or(0, |f| f.frame_size),
        channel_mapping: ChannelLayout::canonical(channels as usize),
    }
}

fn ddp_params(stream: &StreamParameters) -> DdpParams {
    let channels = descriptor_channels(stream);
    DdpParams {
        channels,
        bit_rate: 0,
        sample_rate: stream.sample_rate,
        bitstream_id: DdpBitstreamId::Ac3,
        channel_mapping: ChannelLayout::canonical(channels as usize),
    }
}

/// Moves a stage through TearingDown back to Idle.
fn shutdown_stage(stage: &mut dyn Stage) {
    let kind = stage.kind();
    if stage.state() == StageState::Idle {
        return;
    }
    for next in [StageState::TearingDown, StageState::Idle] {
        if let Err(e) = stage.set_state(next) {
            warn!("{kind}: {e}");
            return;
        }
    }
}

/// The decoder, renderer and clock stages of one session.
pub struct PipelineGraph {
    pub(crate) fail_level: log::Level,
    destination: String,
    handshake_timeout: Duration,
    decoder: Option<Box<dyn Stage>>,
    renderer: Option<Box<dyn Stage>>,
    clock: Option<ClockSource>,
    clock_tunnel: Tunnel,
    decoder_tunnel: Tunnel,
    pool: Option<Arc<BufferPool>>,
    first_frame: bool,
}

impl PipelineGraph {
    pub fn new(destination: &str, handshake_timeout: Duration, fail_level: log::Level) -> Self {
        Self {
            fail_level,
            destination: destination.to_string(),
            handshake_timeout,
            decoder: None,
            renderer: None,
            clock: None,
            clock_tunnel: Tunnel::new("clock->render"),
            decoder_tunnel: Tunnel::new("decode->render"),
            pool: None,
            first_frame: false,
        }
    }

    pub fn is_built(&self) -> bool {
        self.pool.is_some()
    }

    /// True until the reconfiguration handshake has run.
    pub fn first_frame_pending(&self) -> bool {
        self.first_frame
    }

    pub fn has_owned_clock(&self) -> bool {
        self.clock.as_ref().is_some_and(ClockSource::is_owned)
    }

    pub fn tunnel_states(&self) -> (TunnelState, TunnelState) {
        (self.clock_tunnel.state(), self.decoder_tunnel.state())
    }

    /// Creates, configures and starts every stage.
    ///
    /// Any failure tears down whatever was already created. `clock` supplies
    /// a shared clock; without one the factory creates an owned clock.
    /// `format_header` is submitted as the first, codec-config buffer.
    pub fn build(
        &mut self,
        factory: &dyn StageFactory,
        stream: &StreamParameters,
        geometry: BufferGeometry,
        clock: Option<SharedStage>,
        format_header: Option<&[u8]>,
    ) -> Result<(), GraphError> {
        if self.renderer.is_some() || self.decoder.is_some() || self.clock.is_some() {
            self.teardown();
        }
        geometry.validate()?;

        let result = self.try_build(factory, stream, geometry, clock, format_header);
        if let Err(e) = &result {
            warn!("Pipeline construction failed: {e}");
            self.teardown();
        }
        result
    }

    fn try_build(
        &mut self,
        factory: &dyn StageFactory,
        stream: &StreamParameters,
        geometry: BufferGeometry,
        clock: Option<SharedStage>,
        format_header: Option<&[u8]>,
    ) -> Result<(), GraphError> {
        // Renderer
        let renderer = self.renderer.insert(
            factory
                .create(StageKind::Renderer)
                .map_err(stage_step("create renderer"))?,
        );
        let r_in = required(renderer.as_ref(), renderer.input_port(), "input")?;
        let r_clock = required(renderer.as_ref(), renderer.clock_port(), "clock")?;

        renderer
            .set_config(StageConfig::AudioDestination(self.destination.clone()))
            .map_err(stage_step("set audio destination"))?;
        let input_format = match stream.encoding {
            Encoding::Pcm => Param::Pcm(pcm_params(stream)),
            encoding => Param::PortFormat(encoding),
        };
        renderer
            .set_parameter(r_in, input_format)
            .map_err(stage_step("set renderer input format"))?;
        renderer
            .set_state(StageState::Loaded)
            .map_err(stage_step("load renderer"))?;

        // Decoder
        let decoder = self.decoder.insert(
            factory
                .create(StageKind::Decoder)
                .map_err(stage_step("create decoder"))?,
        );
        let d_in = required(decoder.as_ref(), decoder.input_port(), "input")?;
        if stream.passthrough {
            decoder
                .set_parameter(d_in, Param::DecoderPassthrough(true))
                .map_err(stage_step("enable decoder passthrough"))?;
        }

        // Clock
        let clock = match clock {
            Some(shared) => ClockSource::Shared(shared),
            None => {
                let mut owned = factory
                    .create(StageKind::Clock)
                    .map_err(stage_step("create clock"))?;
                owned
                    .set_state(StageState::Loaded)
                    .map_err(stage_step("load clock"))?;
                ClockSource::Owned(owned)
            }
        };
        let clock = self.clock.insert(clock);
        let renderer = self.renderer.as_deref_mut().ok_or(GraphError::NotBuilt)?;
        let clock_tunnel = &mut self.clock_tunnel;
        clock.with(|clock| {
            let out = required(clock, clock.output_port(), "output")?;
            clock_tunnel
                .establish(clock, out, renderer, r_clock)
                .map_err(tunnel_step("establish clock tunnel"))
        })??;
        if clock.is_owned() {
            clock
                .with(|clock| clock.set_state(StageState::Executing))?
                .map_err(stage_step("start clock"))?;
        }

        // Decoder input buffers
        let decoder = self.decoder.as_deref_mut().ok_or(GraphError::NotBuilt)?;
        let mut definition = decoder
            .get_parameter(d_in, ParamKind::PortDefinition)
            .map_err(stage_step("get decoder port definition"))?
            .into_port_definition()
            .ok_or(GraphError::Stage {
                step: "get decoder port definition",
                source: StageError::ParameterRejected {
                    stage: StageKind::Decoder,
                    port: d_in,
                    name: ParamKind::PortDefinition.name(),
                },
            })?;
        definition.buffer_size = geometry.chunk_bytes;
        definition.buffer_count = geometry.buffer_count();
        definition.encoding = stream.encoding;
        decoder
            .set_parameter(d_in, Param::PortDefinition(definition))
            .map_err(stage_step("set decoder port definition"))?;
        let pool = decoder
            .allocate_input_buffers()
            .map_err(stage_step("allocate decoder buffers"))?;
        self.pool = Some(pool.clone());
        decoder
            .set_state(StageState::Loaded)
            .map_err(stage_step("load decoder"))?;

        // Decoder tunnel and start
        let d_out = required(decoder, decoder.output_port(), "output")?;
        self.decoder_tunnel
            .establish(decoder, d_out, renderer, r_in)
            .map_err(tunnel_step("establish decoder tunnel"))?;
        decoder
            .set_state(StageState::Executing)
            .map_err(stage_step("start decoder"))?;
        renderer
            .set_state(StageState::Executing)
            .map_err(stage_step("start renderer"))?;

        if let Some(header) = format_header {
            let mut buffer = pool
                .acquire(self.handshake_timeout)
                .map_err(pool_step("acquire format header buffer"))?;
            buffer
                .fill(header)
                .map_err(pool_step("fill format header"))?;
            buffer.flags = BufferFlags::CODEC_CONFIG | BufferFlags::END_OF_FRAME;
            decoder
                .empty_buffer(buffer)
                .map_err(stage_step("submit format header"))?;
            debug!("Submitted {}-byte format header", header.len());
        }

        info!(
            "Pipeline ready: {} {} ch @ {} Hz, {} x {} byte buffers, {} clock",
            stream.encoding,
            stream.channels,
            stream.sample_rate,
            geometry.buffer_count(),
            geometry.chunk_bytes,
            if self.has_owned_clock() { "owned" } else { "shared" }
        );

        self.first_frame = true;
        Ok(())
    }

    /// Renegotiates the renderer input format from the decoder output.
    ///
    /// Runs once per build, right after the first media buffer has been
    /// submitted. Later calls do nothing.
    pub fn reconfigure(
        &mut self,
        stream: &StreamParameters,
        dts: Option<&DtsFrameInfo>,
    ) -> Result<(), GraphError> {
        if !self.first_frame {
            return Ok(());
        }
        self.first_frame = false;

        let timeout = self.handshake_timeout;
        let renderer = self.renderer.as_deref_mut().ok_or(GraphError::NotBuilt)?;
        let decoder = self.decoder.as_deref_mut().ok_or(GraphError::NotBuilt)?;
        let r_in = required(renderer, renderer.input_port(), "input")?;
        let d_out = required(decoder, decoder.output_port(), "output")?;

        // Upstream first so nothing is in flight when the renderer stops
        let disable_d = Command::PortDisable(d_out);
        let disable_r = Command::PortDisable(r_in);
        decoder
            .send_command(disable_d)
            .map_err(stage_step("disable decoder output"))?;
        decoder
            .wait_for_command(disable_d, timeout)
            .map_err(stage_step("disable decoder output"))?;
        renderer
            .send_command(disable_r)
            .map_err(stage_step("disable renderer input"))?;
        renderer
            .wait_for_command(disable_r, timeout)
            .map_err(stage_step("disable renderer input"))?;

        let decoded = decoder
            .get_parameter(d_out, ParamKind::Pcm)
            .map(Param::into_pcm);

        if !stream.passthrough {
            let Ok(Some(pcm)) = decoded else {
                return Err(GraphError::Stage {
                    step: "read decoder output format",
                    source: StageError::ParameterRejected {
                        stage: StageKind::Decoder,
                        port: d_out,
                        name: ParamKind::Pcm.name(),
                    },
                });
            };
            renderer
                .set_parameter(r_in, Param::Pcm(pcm))
                .map_err(stage_step("set renderer PCM format"))?;
            if let Ok(Param::Pcm(applied)) = renderer.get_parameter(r_in, ParamKind::Pcm) {
                debug!(
                    "Renderer input: {} ch, {} Hz, {} bit, mapping [{}]",
                    applied.channels,
                    applied.sample_rate,
                    applied.bits_per_sample,
                    applied.channel_mapping
                );
            }
        } else {
            if let Ok(Some(pcm)) = decoded {
                trace!("Decoder output in passthrough: {pcm:?}");
            }
            renderer
                .set_parameter(r_in, Param::PortFormat(stream.encoding))
                .map_err(stage_step("set renderer port format"))?;

            let descriptor = match stream.encoding {
                Encoding::Dts => {
                    if dts.is_none() {
                        warn!("DTS passthrough started without a detected frame header");
                    }
                    let params = dts_params(stream, dts);
                    debug!(
                        "DTS descriptor: {} ch, {} Hz, frame_size={} type={} format={:#04b}",
                        params.channels,
                        params.sample_rate,
                        params.frame_size,
                        params.dts_type,
                        params.format
                    );
                    Some(("set DTS descriptor", Param::Dts(params)))
                }
                Encoding::DolbyDigitalPlus => {
                    let params = ddp_params(stream);
                    debug!(
                        "DDP descriptor: {} ch, {} Hz",
                        params.channels, params.sample_rate
                    );
                    Some(("set DDP descriptor", Param::Ddp(params)))
                }
                Encoding::Pcm => None,
            };

            if let Some((step, param)) = descriptor {
                if let Err(source) = renderer.set_parameter(r_in, param) {
                    log_or_err!(self, Warn, GraphError::Stage { step, source });
                }
            }
        }

        let enable_r = Command::PortEnable(r_in);
        let enable_d = Command::PortEnable(d_out);
        renderer
            .send_command(enable_r)
            .map_err(stage_step("enable renderer input"))?;
        renderer
            .wait_for_command(enable_r, timeout)
            .map_err(stage_step("enable renderer input"))?;
        decoder
            .send_command(enable_d)
            .map_err(stage_step("enable decoder output"))?;
        decoder
            .wait_for_command(enable_d, timeout)
            .map_err(stage_step("enable decoder output"))?;

        debug!("Reconfiguration handshake complete");
        Ok(())
    }

    /// Takes a free transfer buffer from the decoder's input pool.
    pub fn acquire(&self, timeout: Duration) -> Result<TransferBuffer, PoolError> {
        match &self.pool {
            Some(pool) => pool.acquire(timeout),
            None => Err(PoolError::Closed),
        }
    }

    /// Hands a filled buffer to the decoder.
    pub fn submit(&mut self, buffer: TransferBuffer) -> Result<(), StageError> {
        match self.decoder.as_deref_mut() {
            Some(decoder) => decoder.empty_buffer(buffer),
            None => Err(StageError::Disconnected {
                stage: StageKind::Decoder,
            }),
        }
    }

    /// Discards everything queued in the pipeline.
    pub fn flush(&mut self) -> Result<(), GraphError> {
        let renderer = self.renderer.as_deref_mut().ok_or(GraphError::NotBuilt)?;
        let decoder = self.decoder.as_deref_mut().ok_or(GraphError::NotBuilt)?;
        let clock = self.clock.as_mut().ok_or(GraphError::NotBuilt)?;
        let r_in = required(renderer, renderer.input_port(), "input")?;
        let d_in = required(decoder, decoder.input_port(), "input")?;

        renderer
            .flush_port(r_in)
            .map_err(stage_step("flush renderer input"))?;
        decoder
            .flush_port(d_in)
            .map_err(stage_step("flush decoder input"))?;

        let clock_tunnel = &mut self.clock_tunnel;
        clock
            .with(|clock| clock_tunnel.flush(clock, renderer))?
            .map_err(tunnel_step("flush clock tunnel"))?;
        self.decoder_tunnel
            .flush(decoder, renderer)
            .map_err(tunnel_step("flush decoder tunnel"))?;

        debug!("Pipeline flushed");
        Ok(())
    }

    /// Pauses the decoder. The clock is left alone.
    pub fn pause(&mut self) -> Result<(), GraphError> {
        self.set_decoder_state(StageState::Paused, "pause decoder")
    }

    pub fn resume(&mut self) -> Result<(), GraphError> {
        self.set_decoder_state(StageState::Executing, "resume decoder")
    }

    fn set_decoder_state(&mut self, state: StageState, step: &'static str) -> Result<(), GraphError> {
        self.decoder
            .as_deref_mut()
            .ok_or(GraphError::NotBuilt)?
            .set_state(state)
            .map_err(stage_step(step))
    }

    /// Sets the renderer gain in millibels.
    pub fn set_volume(&mut self, millibels: i32) -> Result<(), GraphError> {
        self.renderer
            .as_deref_mut()
            .ok_or(GraphError::NotBuilt)?
            .set_config(StageConfig::Volume(millibels))
            .map_err(stage_step("set volume"))
    }

    /// Free bytes in the decoder's input queue.
    pub fn input_space(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.free_bytes())
    }

    /// Total bytes of the decoder's input queue.
    pub fn input_size(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.total_bytes())
    }

    /// Stops and releases every stage.
    ///
    /// An owned clock is paused first and destroyed last. A shared clock is
    /// only detached from the renderer.
    pub fn teardown(&mut self) {
        if let Some(ClockSource::Owned(clock)) = &mut self.clock {
            if clock.state() == StageState::Executing {
                if let Err(e) = clock.set_state(StageState::Paused) {
                    warn!("{e}");
                }
            }
        }

        if let Some(clock) = &mut self.clock {
            let clock_tunnel = &mut self.clock_tunnel;
            match clock.with(|clock| clock_tunnel.deestablish(clock)) {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("{e}"),
                Err(e) => warn!("{e}"),
            }
        }

        if let Some(decoder) = self.decoder.as_deref_mut() {
            if let Err(e) = self.decoder_tunnel.deestablish(decoder) {
                warn!("{e}");
            }
        }

        if let Some(mut decoder) = self.decoder.take() {
            shutdown_stage(decoder.as_mut());
        }
        if let Some(mut renderer) = self.renderer.take() {
            shutdown_stage(renderer.as_mut());
        }
        match self.clock.take() {
            Some(ClockSource::Owned(mut clock)) => shutdown_stage(clock.as_mut()),
            Some(ClockSource::Shared(_)) => debug!("Shared clock detached"),
            None => (),
        }

        if let Some(pool) = self.pool.take() {
            pool.close();
            debug!("Pipeline torn down");
        }
        self.first_frame = false;
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.teardown();
    }
}
