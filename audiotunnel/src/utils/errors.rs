use std::time::Duration;

use crate::stage::{Command, PortIndex, StageKind, StageState};
use crate::stage::tunnel::TunnelState;

#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err.into());
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage}: invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        stage: StageKind,
        from: StageState,
        to: StageState,
    },

    #[error("{stage}: operation not allowed in state {state:?}")]
    IncorrectState { stage: StageKind, state: StageState },

    #[error("{stage}: unknown port {port}")]
    UnknownPort { stage: StageKind, port: PortIndex },

    #[error("{stage}: parameter {name} rejected on port {port}")]
    ParameterRejected {
        stage: StageKind,
        port: PortIndex,
        name: &'static str,
    },

    #[error("{stage}: parameter {name} cannot be changed while port {port} is enabled")]
    PortEnabled {
        stage: StageKind,
        port: PortIndex,
        name: &'static str,
    },

    #[error("{stage}: {command:?} did not complete within {timeout:?}")]
    CommandTimeout {
        stage: StageKind,
        command: Command,
        timeout: Duration,
    },

    #[error("{stage}: input buffers are not allocated")]
    NoBuffers { stage: StageKind },

    #[error("{stage}: buffer rejected: {reason}")]
    BufferRejected { stage: StageKind, reason: String },

    #[error("{stage}: stage is no longer running")]
    Disconnected { stage: StageKind },

    #[error("{stage}: stage could not be created")]
    Unavailable { stage: StageKind },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel {name}: endpoint {stage} is {state:?}, must be Loaded or later")]
    EndpointNotReady {
        name: &'static str,
        stage: StageKind,
        state: StageState,
    },

    #[error("Tunnel {name}: operation invalid in state {state:?}")]
    InvalidState {
        name: &'static str,
        state: TunnelState,
    },

    #[error("Tunnel {name}: {source}")]
    Stage {
        name: &'static str,
        #[source]
        source: StageError,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("No transfer buffer became free within {0:?}")]
    Timeout(Duration),

    #[error("Buffer pool is closed")]
    Closed,

    #[error("Buffer capacity {actual} does not match pool capacity {expected}")]
    CapacityMismatch { expected: usize, actual: usize },

    #[error("Fill of {len} bytes exceeds buffer capacity {capacity}")]
    Overrun { len: usize, capacity: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Pipeline step `{step}` failed: {source}")]
    Stage {
        step: &'static str,
        #[source]
        source: StageError,
    },

    #[error("Pipeline step `{step}` failed: {source}")]
    Tunnel {
        step: &'static str,
        #[source]
        source: TunnelError,
    },

    #[error("Invalid buffer geometry: chunk {chunk_bytes} bytes, total {total_bytes} bytes")]
    InvalidGeometry {
        chunk_bytes: usize,
        total_bytes: usize,
    },

    #[error("{stage} exposes no {role} port")]
    MissingPort {
        stage: StageKind,
        role: &'static str,
    },

    #[error("Pipeline is not built")]
    NotBuilt,

    #[error("Shared clock lock was poisoned")]
    ClockPoisoned,

    #[error("Pipeline step `{step}` failed: {source}")]
    Pool {
        step: &'static str,
        #[source]
        source: PoolError,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Normal frame must carry a deficit sample count of 31, read {0}")]
    DeficitInconsistent(u8),

    #[error("Frame size {0} outside [96, 16384]")]
    FrameSizeOutOfRange(usize),

    #[error("Reserved sample rate code {0:#X}")]
    ReservedSampleRate(u8),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session is not initialized")]
    NotInitialized,

    #[error("Invalid stream parameters: {0}")]
    InvalidStream(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Transfer to decoder failed: {0}")]
    Transfer(#[source] StageError),

    #[error("Timed out waiting for a transfer buffer after accepting {accepted} bytes")]
    BufferTimeout { accepted: usize },

    #[error("Volume control is unavailable in passthrough mode")]
    PassthroughVolume,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Channel layout holds {0} roles, at most 8 are supported")]
    TooManyChannels(usize),

    #[error("Channel role {0} appears more than once")]
    DuplicateRole(crate::structs::channel::ChannelRole),

    #[error("Unknown channel role `{0}`")]
    UnknownRole(String),
}
