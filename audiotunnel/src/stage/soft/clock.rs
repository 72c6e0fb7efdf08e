use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, trace};

use super::lock;
use crate::stage::{
    Command, MediaClock, Packet, PortIndex, PortSink, Stage, StageKind, StageState,
    check_transition,
};
use crate::structs::buffer::TransferBuffer;
use crate::structs::port::{Param, ParamKind, StageConfig};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::StageError;

pub const CLOCK_OUTPUT_PORT: PortIndex = PortIndex(80);

const KIND: StageKind = StageKind::Clock;

#[derive(Debug, Default)]
struct ClockInner {
    running: bool,
    anchor: Option<(Instant, i64)>,
    frozen: Option<i64>,
}

/// Media time derived from the wall clock, anchored by the renderer on the
/// first buffer after a start or flush.
#[derive(Debug, Default)]
pub struct WallClock {
    inner: Mutex<ClockInner>,
}

impl WallClock {
    fn lock(&self) -> MutexGuard<'_, ClockInner> {
        lock(&self.inner)
    }

    fn now(inner: &ClockInner) -> Option<i64> {
        match (inner.frozen, inner.anchor) {
            (Some(frozen), _) => Some(frozen),
            (None, Some((at, base))) => Some(base + at.elapsed().as_micros() as i64),
            (None, None) => None,
        }
    }

    fn pause(&self) {
        let mut inner = self.lock();
        inner.frozen = Self::now(&inner);
        inner.running = false;
    }

    fn resume(&self) {
        let mut inner = self.lock();
        if let Some(frozen) = inner.frozen.take() {
            inner.anchor = Some((Instant::now(), frozen));
        }
        inner.running = true;
    }
}

impl MediaClock for WallClock {
    fn media_time(&self) -> Option<i64> {
        Self::now(&self.lock())
    }

    fn set_start_time(&self, pts: i64) {
        let mut inner = self.lock();
        inner.anchor = Some((Instant::now(), pts));
        inner.frozen = if inner.running { None } else { Some(pts) };
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }
}

/// Clock stage with a single output port.
///
/// Attaching the output port hands the peer a reference to the clock.
/// Executing runs the clock, Paused freezes it.
pub struct SoftClock {
    state: StageState,
    clock: Arc<WallClock>,
    peer: Option<Arc<dyn PortSink>>,
    sent: Vec<Command>,
}

impl Default for SoftClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftClock {
    pub fn new() -> Self {
        Self {
            state: StageState::Idle,
            clock: Arc::new(WallClock::default()),
            peer: None,
            sent: Vec::new(),
        }
    }

    /// A clock that is already Executing, for use as a shared clock owned by
    /// the caller.
    pub fn started() -> Result<Self, StageError> {
        let mut clock = Self::new();
        clock.set_state(StageState::Loaded)?;
        clock.set_state(StageState::Executing)?;
        Ok(clock)
    }

    pub fn clock(&self) -> Arc<WallClock> {
        self.clock.clone()
    }

    fn check_port(&self, port: PortIndex) -> Result<(), StageError> {
        if port == CLOCK_OUTPUT_PORT {
            Ok(())
        } else {
            Err(StageError::UnknownPort { stage: KIND, port })
        }
    }

    fn detach(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.deliver(Packet::ClockDetached) {
                debug!("{KIND}: {e}");
            }
        }
    }
}

impl Stage for SoftClock {
    fn kind(&self) -> StageKind {
        KIND
    }

    fn state(&self) -> StageState {
        self.state
    }

    fn set_state(&mut self, state: StageState) -> Result<(), StageError> {
        check_transition(KIND, self.state, state)?;

        match state {
            StageState::Executing => self.clock.resume(),
            StageState::Paused => self.clock.pause(),
            StageState::TearingDown => {
                self.clock.pause();
                self.detach();
            }
            StageState::Idle | StageState::Loaded => (),
        }

        trace!("{KIND}: {:?} -> {:?}", self.state, state);
        self.state = state;
        Ok(())
    }

    fn input_port(&self) -> Option<PortIndex> {
        None
    }

    fn output_port(&self) -> Option<PortIndex> {
        Some(CLOCK_OUTPUT_PORT)
    }

    fn get_parameter(&self, port: PortIndex, kind: ParamKind) -> Result<Param, StageError> {
        self.check_port(port)?;
        Err(StageError::ParameterRejected {
            stage: KIND,
            port,
            name: kind.name(),
        })
    }

    fn set_parameter(&mut self, port: PortIndex, param: Param) -> Result<(), StageError> {
        self.check_port(port)?;
        Err(StageError::ParameterRejected {
            stage: KIND,
            port,
            name: param.kind().name(),
        })
    }

    fn set_config(&mut self, _config: StageConfig) -> Result<(), StageError> {
        Err(StageError::ParameterRejected {
            stage: KIND,
            port: CLOCK_OUTPUT_PORT,
            name: "stage config",
        })
    }

    fn send_command(&mut self, command: Command) -> Result<(), StageError> {
        match command {
            Command::PortDisable(port) | Command::PortEnable(port) | Command::Flush(port) => {
                self.check_port(port)?
            }
        }
        self.sent.push(command);
        Ok(())
    }

    fn wait_for_command(&mut self, command: Command, timeout: Duration) -> Result<(), StageError> {
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
            state: self.state,
        })
    }

    fn empty_buffer(&mut self, _buffer: TransferBuffer) -> Result<(), StageError> {
        Err(StageError::IncorrectState {
            stage: KIND,
            state: self.state,
        })
    }

    fn flush_port(&mut self, port: PortIndex) -> Result<(), StageError> {
        self.check_port(port)
    }

    fn port_sink(&self, port: PortIndex) -> Result<Arc<dyn PortSink>, StageError> {
        Err(StageError::UnknownPort { stage: KIND, port })
    }

    fn attach(&mut self, port: PortIndex, peer: Option<Arc<dyn PortSink>>) -> Result<(), StageError> {
        self.check_port(port)?;
        self.detach();

        if let Some(peer) = peer {
            peer.deliver(Packet::ClockReference(self.clock.clone()))?;
            self.peer = Some(peer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pause_freezes_media_time() {
        let mut stage = SoftClock::started().unwrap();
        let clock = stage.clock();
        assert_eq!(clock.media_time(), None);

        clock.set_start_time(1_000);
        thread::sleep(Duration::from_millis(5));
        assert!(clock.media_time().unwrap() > 1_000);

        stage.set_state(StageState::Paused).unwrap();
        let frozen = clock.media_time().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.media_time(), Some(frozen));
        assert!(!clock.is_running());

        stage.set_state(StageState::Executing).unwrap();
        assert!(clock.is_running());
        assert!(clock.media_time().unwrap() >= frozen);
    }

    #[test]
    fn attach_hands_out_reference() {
        struct Probe(Mutex<Vec<&'static str>>);
        impl PortSink for Probe {
            fn deliver(&self, packet: Packet) -> Result<(), StageError> {
                let name = match packet {
                    Packet::ClockReference(_) => "reference",
                    Packet::ClockDetached => "detached",
                    Packet::Data { .. } => "data",
                };
                lock(&self.0).push(name);
                Ok(())
            }
        }

        let mut stage = SoftClock::started().unwrap();
        let probe = Arc::new(Probe(Mutex::new(Vec::new())));

        stage
            .attach(CLOCK_OUTPUT_PORT, Some(probe.clone()))
            .unwrap();
        stage.attach(CLOCK_OUTPUT_PORT, None).unwrap();

        assert_eq!(lock(&probe.0).as_slice(), &["reference", "detached"]);
        assert!(stage.attach(PortIndex(81), None).is_err());
    }
}
