use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use super::lock;
use crate::stage::{
    Command, Packet, PortIndex, PortSink, Stage, StageKind, StageState, check_transition,
};
use crate::structs::buffer::{BufferFlags, TransferBuffer};
use crate::structs::port::{Param, ParamKind, PcmParams, PortDefinition, StageConfig};
use crate::structs::stream::Encoding;
use crate::structs::wave::WaveFormatExtensible;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::StageError;

pub const DECODER_INPUT_PORT: PortIndex = PortIndex(120);
pub const DECODER_OUTPUT_PORT: PortIndex = PortIndex(121);

const KIND: StageKind = StageKind::Decoder;
const HISTORY_LEN: usize = 256;

/// Summary of one buffer accepted on the input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRecord {
    pub flags: BufferFlags,
    pub filled: usize,
    pub timestamp: Option<i64>,
}

#[derive(Default)]
struct DecoderQueue {
    pending: VecDeque<TransferBuffer>,
    running: bool,
    output_enabled: bool,
    delivering: bool,
    shutdown: bool,
    downstream: Option<Arc<dyn PortSink>>,
    history: VecDeque<BufferRecord>,
    delivered: usize,
}

struct DecoderShared {
    queue: Mutex<DecoderQueue>,
    changed: Condvar,
}

impl DecoderShared {
    fn lock(&self) -> MutexGuard<'_, DecoderQueue> {
        lock(&self.queue)
    }

    fn update(&self, f: impl FnOnce(&mut DecoderQueue)) {
        f(&mut self.lock());
        self.changed.notify_all();
    }
}

/// Read-only view of a [`SoftDecoder`] that outlives the stage's ownership
/// by the pipeline.
#[derive(Clone)]
pub struct DecoderHandle(Arc<DecoderShared>);

impl DecoderHandle {
    /// Most recent buffers accepted on the input port, oldest first.
    pub fn history(&self) -> Vec<BufferRecord> {
        self.0.lock().history.iter().cloned().collect()
    }

    /// Buffers consumed by the worker so far.
    pub fn delivered(&self) -> usize {
        self.0.lock().delivered
    }

    pub fn pending(&self) -> usize {
        self.0.lock().pending.len()
    }
}

/// Pass-through decoder stage.
///
/// PCM and bitstream payloads are forwarded unchanged. A codec-config buffer
/// carrying a WAVE format block sets the output port's PCM format and is not
/// forwarded.
pub struct SoftDecoder {
    state: StageState,
    input: PortDefinition,
    output: PcmParams,
    passthrough: bool,
    input_enabled: bool,
    pool: Option<Arc<BufferPool>>,
    shared: Arc<DecoderShared>,
    worker: Option<JoinHandle<()>>,
    sent: Vec<Command>,
}

impl Default for SoftDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDecoder {
    pub fn new() -> Self {
        Self {
            state: StageState::Idle,
            input: PortDefinition {
                port: DECODER_INPUT_PORT,
                buffer_size: 0,
                buffer_count: 0,
                encoding: Encoding::Pcm,
                enabled: true,
            },
            output: PcmParams::default(),
            passthrough: false,
            input_enabled: true,
            pool: None,
            shared: Arc::new(DecoderShared {
                queue: Mutex::new(DecoderQueue {
                    output_enabled: true,
                    ..Default::default()
                }),
                changed: Condvar::new(),
            }),
            worker: None,
            sent: Vec::new(),
        }
    }

    pub fn handle(&self) -> DecoderHandle {
        DecoderHandle(self.shared.clone())
    }

    fn check_port(&self, port: PortIndex) -> Result<(), StageError> {
        if port == DECODER_INPUT_PORT || port == DECODER_OUTPUT_PORT {
            Ok(())
        } else {
            Err(StageError::UnknownPort { stage: KIND, port })
        }
    }

    fn port_enabled(&self, port: PortIndex) -> bool {
        if port == DECODER_INPUT_PORT {
            self.input_enabled
        } else {
            self.shared.lock().output_enabled
        }
    }

    fn check_mutable(&self, port: PortIndex, kind: ParamKind) -> Result<(), StageError> {
        if self.state.accepts_parameters() || !self.port_enabled(port) {
            Ok(())
        } else {
            Err(StageError::PortEnabled {
                stage: KIND,
                port,
                name: kind.name(),
            })
        }
    }

    fn release(&self, buffer: TransferBuffer) {
        if let Some(pool) = &self.pool {
            if let Err(e) = pool.release(buffer) {
                warn!("{KIND}: {e}");
            }
        }
    }

    fn drain_pending(&self) {
        let drained: Vec<TransferBuffer> = self.shared.lock().pending.drain(..).collect();
        if !drained.is_empty() {
            debug!("{KIND}: discarding {} queued buffers", drained.len());
        }
        drained.into_iter().for_each(|buffer| self.release(buffer));
    }

    fn stop_worker(&mut self) {
        self.shared.update(|q| q.shutdown = true);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("{KIND}: worker thread panicked");
            }
        }
    }

    fn apply_codec_config(&mut self, buffer: &TransferBuffer) -> Result<(), StageError> {
        let format = WaveFormatExtensible::parse(buffer.payload()).ok_or_else(|| {
            StageError::BufferRejected {
                stage: KIND,
                reason: format!("unrecognised codec config of {} bytes", buffer.filled()),
            }
        })?;

        self.output = PcmParams {
            channels: format.channels as u32,
            bits_per_sample: format.bits_per_sample as u32,
            sample_rate: format.samples_per_sec,
            channel_mapping: format.layout(),
            ..PcmParams::default()
        };

        debug!(
            "{KIND}: output format {} ch, {} Hz, {} bit [{}]",
            self.output.channels,
            self.output.sample_rate,
            self.output.bits_per_sample,
            self.output.channel_mapping
        );
        Ok(())
    }
}

fn run_worker(shared: Arc<DecoderShared>, pool: Arc<BufferPool>) {
    loop {
        let (buffer, downstream) = {
            let mut q = shared.lock();
            loop {
                if q.shutdown {
                    return;
                }
                if q.running && q.output_enabled && !q.pending.is_empty() {
                    break;
                }
                q = shared
                    .changed
                    .wait(q)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            let Some(buffer) = q.pending.pop_front() else {
                continue;
            };
            q.delivering = true;
            (buffer, q.downstream.clone())
        };

        if !buffer.flags.contains(BufferFlags::CODEC_CONFIG) {
            match downstream {
                Some(sink) => {
                    let packet = Packet::Data {
                        payload: buffer.payload().to_vec(),
                        flags: buffer.flags,
                        timestamp: buffer.timestamp,
                    };
                    if let Err(e) = sink.deliver(packet) {
                        warn!("{KIND}: output dropped: {e}");
                    }
                }
                None => trace!("{KIND}: no tunnel, dropping {} bytes", buffer.filled()),
            }
        }

        if let Err(e) = pool.release(buffer) {
            warn!("{KIND}: {e}");
        }

        shared.update(|q| {
            q.delivering = false;
            q.delivered += 1;
        });
    }
}

impl Drop for SoftDecoder {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl Stage for SoftDecoder {
    fn kind(&self) -> StageKind {
        KIND
    }

    fn state(&self) -> StageState {
        self.state
    }

    fn set_state(&mut self, state: StageState) -> Result<(), StageError> {
        check_transition(KIND, self.state, state)?;

        match state {
            StageState::Executing => self.shared.update(|q| q.running = true),
            StageState::Loaded | StageState::Paused => self.shared.update(|q| q.running = false),
            StageState::TearingDown => {
                self.shared.update(|q| q.running = false);
                self.stop_worker();
                self.drain_pending();
                if let Some(pool) = &self.pool {
                    pool.close();
                }
            }
            StageState::Idle => {
                self.pool = None;
                self.shared.update(|q| {
                    q.shutdown = false;
                    q.downstream = None;
                });
            }
        }

        trace!("{KIND}: {:?} -> {:?}", self.state, state);
        self.state = state;
        Ok(())
    }

    fn input_port(&self) -> Option<PortIndex> {
        Some(DECODER_INPUT_PORT)
    }

    fn output_port(&self) -> Option<PortIndex> {
        Some(DECODER_OUTPUT_PORT)
    }

    fn get_parameter(&self, port: PortIndex, kind: ParamKind) -> Result<Param, StageError> {
        self.check_port(port)?;

        match (port, kind) {
            (DECODER_INPUT_PORT, ParamKind::PortDefinition) => Ok(Param::PortDefinition(PortDefinition {
                enabled: self.input_enabled,
                ..self.input.clone()
            })),
            (DECODER_INPUT_PORT, ParamKind::DecoderPassthrough) => {
                Ok(Param::DecoderPassthrough(self.passthrough))
            }
            (DECODER_OUTPUT_PORT, ParamKind::Pcm) => Ok(Param::Pcm(self.output.clone())),
            (DECODER_OUTPUT_PORT, ParamKind::PortDefinition) => {
                Ok(Param::PortDefinition(PortDefinition {
                    port: DECODER_OUTPUT_PORT,
                    encoding: Encoding::Pcm,
                    enabled: self.port_enabled(port),
                    ..self.input.clone()
                }))
            }
            _ => Err(StageError::ParameterRejected {
                stage: KIND,
                port,
                name: kind.name(),
            }),
        }
    }

    fn set_parameter(&mut self, port: PortIndex, param: Param) -> Result<(), StageError> {
        self.check_port(port)?;
        let kind = param.kind();
        self.check_mutable(port, kind)?;

        match (port, param) {
            (DECODER_INPUT_PORT, Param::PortDefinition(def)) => {
                if def.buffer_size == 0 || def.buffer_count == 0 {
                    return Err(StageError::ParameterRejected {
                        stage: KIND,
                        port,
                        name: kind.name(),
                    });
                }
                self.input = PortDefinition {
                    port: DECODER_INPUT_PORT,
                    ..def
                };
            }
            (DECODER_INPUT_PORT, Param::DecoderPassthrough(passthrough)) => {
                self.passthrough = passthrough;
            }
            (DECODER_OUTPUT_PORT, Param::Pcm(pcm)) => self.output = pcm,
            _ => {
                return Err(StageError::ParameterRejected {
                    stage: KIND,
                    port,
                    name: kind.name(),
                });
            }
        }

        Ok(())
    }

    fn set_config(&mut self, _config: StageConfig) -> Result<(), StageError> {
        Err(StageError::ParameterRejected {
            stage: KIND,
            port: DECODER_INPUT_PORT,
            name: "stage config",
        })
    }

    fn send_command(&mut self, command: Command) -> Result<(), StageError> {
        match command {
            Command::PortDisable(port) | Command::PortEnable(port) => {
                self.check_port(port)?;
                let enable = matches!(command, Command::PortEnable(_));
                if port == DECODER_INPUT_PORT {
                    self.input_enabled = enable;
                } else {
                    self.shared.update(|q| q.output_enabled = enable);
                }
            }
            Command::Flush(port) => self.flush_port(port)?,
        }

        self.sent.push(command);
        Ok(())
    }

    fn wait_for_command(&mut self, command: Command, timeout: Duration) -> Result<(), StageError> {
        let timed_out = StageError::CommandTimeout {
            stage: KIND,
            command,
            timeout,
        };

        let Some(pos) = self.sent.iter().position(|sent| *sent == command) else {
            return Err(timed_out);
        };

        // The output port is only disabled once the buffer in flight is out
        if command == Command::PortDisable(DECODER_OUTPUT_PORT) {
            let (_q, result) = self
                .shared
                .changed
                .wait_timeout_while(self.shared.lock(), timeout, |q| q.delivering)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if result.timed_out() {
                return Err(timed_out);
            }
        }

        self.sent.remove(pos);
        Ok(())
    }

    fn allocate_input_buffers(&mut self) -> Result<Arc<BufferPool>, StageError> {
        if self.pool.is_some() || !self.state.accepts_parameters() {
            return Err(StageError::IncorrectState {
                stage: KIND,
                state: self.state,
            });
        }
        if self.input.buffer_count == 0 || self.input.buffer_size == 0 {
            return Err(StageError::NoBuffers { stage: KIND });
        }

        let pool = Arc::new(BufferPool::new(
            self.input.buffer_count,
            self.input.buffer_size,
        ));

        let worker = {
            let shared = self.shared.clone();
            let pool = pool.clone();
            thread::Builder::new()
                .name(KIND.to_string())
                .spawn(move || run_worker(shared, pool))
                .map_err(|_| StageError::Disconnected { stage: KIND })?
        };

        debug!(
            "{KIND}: allocated {} input buffers of {} bytes",
            self.input.buffer_count, self.input.buffer_size
        );

        self.worker = Some(worker);
        self.pool = Some(pool.clone());
        Ok(pool)
    }

    fn empty_buffer(&mut self, buffer: TransferBuffer) -> Result<(), StageError> {
        if !self.state.is_loaded() {
            return Err(StageError::IncorrectState {
                stage: KIND,
                state: self.state,
            });
        }
        if self.pool.is_none() {
            return Err(StageError::NoBuffers { stage: KIND });
        }
        if !self.input_enabled {
            self.release(buffer);
            return Err(StageError::BufferRejected {
                stage: KIND,
                reason: "input port is disabled".to_string(),
            });
        }

        if buffer.flags.contains(BufferFlags::CODEC_CONFIG) && !self.passthrough {
            if let Err(e) = self.apply_codec_config(&buffer) {
                self.release(buffer);
                return Err(e);
            }
        }

        let record = BufferRecord {
            flags: buffer.flags,
            filled: buffer.filled(),
            timestamp: buffer.timestamp,
        };

        self.shared.update(|q| {
            if q.history.len() == HISTORY_LEN {
                q.history.pop_front();
            }
            q.history.push_back(record);
            q.pending.push_back(buffer);
        });

        Ok(())
    }

    fn flush_port(&mut self, port: PortIndex) -> Result<(), StageError> {
        self.check_port(port)?;
        if port == DECODER_INPUT_PORT {
            self.drain_pending();
        }
        Ok(())
    }

    fn port_sink(&self, port: PortIndex) -> Result<Arc<dyn PortSink>, StageError> {
        Err(StageError::UnknownPort { stage: KIND, port })
    }

    fn attach(&mut self, port: PortIndex, peer: Option<Arc<dyn PortSink>>) -> Result<(), StageError> {
        if port != DECODER_OUTPUT_PORT {
            return Err(StageError::UnknownPort { stage: KIND, port });
        }
        self.shared.update(|q| q.downstream = peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::channel::ChannelLayout;
    use std::time::Instant;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl PortSink for Collect {
        fn deliver(&self, packet: Packet) -> Result<(), StageError> {
            if let Packet::Data { payload, .. } = packet {
                lock(&self.0).push(payload);
            }
            Ok(())
        }
    }

    fn loaded_decoder() -> (SoftDecoder, Arc<BufferPool>) {
        let mut decoder = SoftDecoder::new();
        decoder
            .set_parameter(
                DECODER_INPUT_PORT,
                Param::PortDefinition(PortDefinition {
                    port: DECODER_INPUT_PORT,
                    buffer_size: 64,
                    buffer_count: 4,
                    encoding: Encoding::Pcm,
                    enabled: true,
                }),
            )
            .unwrap();
        let pool = decoder.allocate_input_buffers().unwrap();
        decoder.set_state(StageState::Loaded).unwrap();
        (decoder, pool)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn forwards_only_while_executing() {
        let (mut decoder, pool) = loaded_decoder();
        let out = Arc::new(Collect::default());
        decoder
            .attach(DECODER_OUTPUT_PORT, Some(out.clone()))
            .unwrap();

        let mut buffer = pool.acquire(Duration::ZERO).unwrap();
        buffer.fill(&[1, 2, 3]).unwrap();
        decoder.empty_buffer(buffer).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(lock(&out.0).is_empty());
        assert_eq!(pool.free_count(), 3);

        decoder.set_state(StageState::Executing).unwrap();
        let handle = decoder.handle();
        wait_until(|| handle.delivered() == 1);

        assert_eq!(lock(&out.0).as_slice(), &[vec![1, 2, 3]]);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn codec_config_sets_output_format() {
        let (mut decoder, pool) = loaded_decoder();

        let mut buffer = pool.acquire(Duration::ZERO).unwrap();
        buffer
            .fill(&WaveFormatExtensible::pcm(6, 44100, 16, 0x3F).to_bytes())
            .unwrap();
        buffer.flags = BufferFlags::CODEC_CONFIG | BufferFlags::END_OF_FRAME;
        decoder.empty_buffer(buffer).unwrap();

        let pcm = decoder
            .get_parameter(DECODER_OUTPUT_PORT, ParamKind::Pcm)
            .unwrap()
            .into_pcm()
            .unwrap();
        assert_eq!(pcm.channels, 6);
        assert_eq!(pcm.sample_rate, 44100);
        assert_eq!(pcm.channel_mapping, ChannelLayout::canonical(6));

        let mut bogus = pool.acquire(Duration::ZERO).unwrap();
        bogus.fill(&[0; 8]).unwrap();
        bogus.flags = BufferFlags::CODEC_CONFIG;
        assert!(matches!(
            decoder.empty_buffer(bogus),
            Err(StageError::BufferRejected { .. })
        ));
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn port_definition_locked_while_enabled() {
        let (mut decoder, _pool) = loaded_decoder();
        decoder.set_state(StageState::Executing).unwrap();

        let def = decoder
            .get_parameter(DECODER_INPUT_PORT, ParamKind::PortDefinition)
            .unwrap();
        assert!(matches!(
            decoder.set_parameter(DECODER_INPUT_PORT, def.clone()),
            Err(StageError::PortEnabled { .. })
        ));

        decoder
            .send_command(Command::PortDisable(DECODER_INPUT_PORT))
            .unwrap();
        decoder
            .wait_for_command(
                Command::PortDisable(DECODER_INPUT_PORT),
                Duration::from_millis(100),
            )
            .unwrap();
        decoder.set_parameter(DECODER_INPUT_PORT, def).unwrap();
    }

    #[test]
    fn teardown_returns_queued_buffers() {
        let (mut decoder, pool) = loaded_decoder();
        for _ in 0..2 {
            let buffer = pool.acquire(Duration::ZERO).unwrap();
            decoder.empty_buffer(buffer).unwrap();
        }
        assert_eq!(decoder.handle().pending(), 2);

        decoder.set_state(StageState::TearingDown).unwrap();
        assert_eq!(pool.free_count(), 4);
        assert!(pool.is_closed());
        decoder.set_state(StageState::Idle).unwrap();
    }

    #[test]
    fn unsent_command_times_out() {
        let mut decoder = SoftDecoder::new();
        let command = Command::PortEnable(DECODER_OUTPUT_PORT);
        assert_eq!(
            decoder.wait_for_command(command, Duration::from_millis(1)),
            Err(StageError::CommandTimeout {
                stage: KIND,
                command,
                timeout: Duration::from_millis(1)
            })
        );
    }
}
