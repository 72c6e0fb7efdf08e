//! Processing stages and the tunnels that connect them.
//!
//! A stage is a component with numbered ports, a lifecycle state, typed
//! parameters and an asynchronous command channel. The pipeline uses three
//! kinds: a decoder that accepts transfer buffers from the client, a
//! renderer that plays them and a media clock that the renderer slaves to.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Loaded -> Executing <-> Paused
//!           |          |            |
//!           +------> TearingDown <--+
//!                      |
//!                      v
//!                     Idle
//! ```
//!
//! Port parameters can only change while the stage is `Idle` or `Loaded`, or
//! while the port is disabled. Disabling and re-enabling a port mid-stream is
//! the reconfiguration handshake.

use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::structs::buffer::{BufferFlags, TransferBuffer};
use crate::structs::port::{Param, ParamKind, StageConfig};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::StageError;

pub use crate::structs::port::PortIndex;

/// Software implementations of every stage kind.
pub mod soft;

/// Tunnel bookkeeping between an output port and an input port.
pub mod tunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Decoder,
    Renderer,
    Clock,
}

impl Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Decoder => write!(f, "audio_decode"),
            StageKind::Renderer => write!(f, "audio_render"),
            StageKind::Clock => write!(f, "clock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageState {
    #[default]
    Idle,
    Loaded,
    Executing,
    Paused,
    TearingDown,
}

impl StageState {
    /// Whether `self -> next` is a legal lifecycle step. Staying in the same
    /// state is always allowed.
    pub fn can_transition_to(self, next: StageState) -> bool {
        use StageState::*;

        self == next
            || matches!(
                (self, next),
                (Idle, Loaded)
                    | (Loaded, Executing)
                    | (Executing, Paused)
                    | (Paused, Executing)
                    | (Loaded | Executing | Paused, TearingDown)
                    | (TearingDown, Idle)
            )
    }

    /// Loaded, Executing or Paused: resources exist and tunnels may attach.
    pub fn is_loaded(self) -> bool {
        matches!(
            self,
            StageState::Loaded | StageState::Executing | StageState::Paused
        )
    }

    /// Port parameters may be changed in this state regardless of port
    /// enablement.
    pub fn accepts_parameters(self) -> bool {
        matches!(self, StageState::Idle | StageState::Loaded)
    }
}

/// Asynchronous stage command. Completion is awaited with
/// [`Stage::wait_for_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    PortDisable(PortIndex),
    PortEnable(PortIndex),
    Flush(PortIndex),
}

/// Source of media time a renderer can slave to.
pub trait MediaClock: Send + Sync {
    /// Current media time in microseconds, `None` before the first anchor.
    fn media_time(&self) -> Option<i64>;

    /// Anchors media time to `pts` now.
    fn set_start_time(&self, pts: i64);

    fn is_running(&self) -> bool;
}

/// Unit of data travelling through a tunnel.
pub enum Packet {
    Data {
        payload: Vec<u8>,
        flags: BufferFlags,
        timestamp: Option<i64>,
    },
    ClockReference(Arc<dyn MediaClock>),
    ClockDetached,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Data {
                payload,
                flags,
                timestamp,
            } => f
                .debug_struct("Data")
                .field("len", &payload.len())
                .field("flags", flags)
                .field("timestamp", timestamp)
                .finish(),
            Packet::ClockReference(_) => write!(f, "ClockReference"),
            Packet::ClockDetached => write!(f, "ClockDetached"),
        }
    }
}

/// Receiving end of a tunnel, handed out by the stage that owns the input
/// port.
pub trait PortSink: Send + Sync {
    fn deliver(&self, packet: Packet) -> Result<(), StageError>;
}

/// A processing stage.
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    fn state(&self) -> StageState;

    /// Moves to `state`, rejecting steps outside the lifecycle graph.
    fn set_state(&mut self, state: StageState) -> Result<(), StageError>;

    fn input_port(&self) -> Option<PortIndex>;

    fn output_port(&self) -> Option<PortIndex>;

    /// Port that receives the media clock reference.
    fn clock_port(&self) -> Option<PortIndex> {
        None
    }

    fn get_parameter(&self, port: PortIndex, kind: ParamKind) -> Result<Param, StageError>;

    fn set_parameter(&mut self, port: PortIndex, param: Param) -> Result<(), StageError>;

    fn set_config(&mut self, config: StageConfig) -> Result<(), StageError>;

    fn send_command(&mut self, command: Command) -> Result<(), StageError>;

    /// Blocks until a previously sent command completes or `timeout` passes.
    fn wait_for_command(&mut self, command: Command, timeout: Duration)
    -> Result<(), StageError>;

    /// Allocates the transfer buffers described by the input port
    /// definition and returns the pool they live in.
    fn allocate_input_buffers(&mut self) -> Result<Arc<BufferPool>, StageError>;

    /// Submits a filled buffer to the input port. Ownership passes to the
    /// stage, which returns it to the pool once consumed.
    fn empty_buffer(&mut self, buffer: TransferBuffer) -> Result<(), StageError>;

    /// Discards everything queued on `port`.
    fn flush_port(&mut self, port: PortIndex) -> Result<(), StageError>;

    /// Receiving end of an input port, for use as a tunnel destination.
    fn port_sink(&self, port: PortIndex) -> Result<Arc<dyn PortSink>, StageError>;

    /// Connects an output port to a tunnel destination, or disconnects it
    /// with `None`.
    fn attach(&mut self, port: PortIndex, peer: Option<Arc<dyn PortSink>>)
    -> Result<(), StageError>;
}

/// A stage owned elsewhere and shared with the pipeline.
pub type SharedStage = Arc<Mutex<dyn Stage>>;

/// Creates stages of each kind for a pipeline.
pub trait StageFactory: Send + Sync {
    fn create(&self, kind: StageKind) -> Result<Box<dyn Stage>, StageError>;
}

/// Checks a transition against the lifecycle graph.
pub(crate) fn check_transition(
    kind: StageKind,
    from: StageState,
    to: StageState,
) -> Result<(), StageError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StageError::InvalidTransition {
            stage: kind,
            from,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use StageState::*;

        assert!(Idle.can_transition_to(Loaded));
        assert!(Loaded.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Executing));
        assert!(Paused.can_transition_to(TearingDown));
        assert!(TearingDown.can_transition_to(Idle));
        assert!(Executing.can_transition_to(Executing));

        assert!(!Idle.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Loaded));
        assert!(!TearingDown.can_transition_to(Executing));

        assert_eq!(
            check_transition(StageKind::Clock, Idle, Paused),
            Err(StageError::InvalidTransition {
                stage: StageKind::Clock,
                from: Idle,
                to: Paused
            })
        );
    }
}
