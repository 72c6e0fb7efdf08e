use log::debug;

use crate::stage::{PortIndex, Stage};
use crate::utils::errors::{StageError, TunnelError};

fn stage_err(name: &'static str) -> impl Fn(StageError) -> TunnelError {
    move |source| TunnelError::Stage { name, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Unestablished,
    Established,
    Flushing,
}

/// Directed connection from one stage's output port to another stage's
/// input port.
///
/// The tunnel does not own its endpoints; they are passed in for every
/// operation so that the pipeline can keep them in whatever container it
/// likes.
#[derive(Debug)]
pub struct Tunnel {
    name: &'static str,
    state: TunnelState,
    ports: Option<(PortIndex, PortIndex)>,
}

impl Tunnel {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: TunnelState::Unestablished,
            ports: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state != TunnelState::Unestablished
    }

    /// Connects `source_port` of `source` to `sink_port` of `sink`. Both
    /// endpoints must be Loaded or later.
    pub fn establish(
        &mut self,
        source: &mut dyn Stage,
        source_port: PortIndex,
        sink: &dyn Stage,
        sink_port: PortIndex,
    ) -> Result<(), TunnelError> {
        if self.state != TunnelState::Unestablished {
            return Err(TunnelError::InvalidState {
                name: self.name,
                state: self.state,
            });
        }

        for stage in [&*source, sink] {
            if !stage.state().is_loaded() {
                return Err(TunnelError::EndpointNotReady {
                    name: self.name,
                    stage: stage.kind(),
                    state: stage.state(),
                });
            }
        }

        let peer = sink.port_sink(sink_port).map_err(stage_err(self.name))?;
        source
            .attach(source_port, Some(peer))
            .map_err(stage_err(self.name))?;

        debug!(
            "Tunnel {} established: {}:{} -> {}:{}",
            self.name,
            source.kind(),
            source_port,
            sink.kind(),
            sink_port
        );

        self.ports = Some((source_port, sink_port));
        self.state = TunnelState::Established;
        Ok(())
    }

    /// Discards data in flight on both ends of the tunnel.
    pub fn flush(&mut self, source: &mut dyn Stage, sink: &mut dyn Stage) -> Result<(), TunnelError> {
        let Some((source_port, sink_port)) = self.ports.filter(|_| self.is_established()) else {
            return Err(TunnelError::InvalidState {
                name: self.name,
                state: self.state,
            });
        };

        self.state = TunnelState::Flushing;
        let result = source
            .flush_port(source_port)
            .and_then(|_| sink.flush_port(sink_port))
            .map_err(stage_err(self.name));
        self.state = TunnelState::Established;

        result
    }

    /// Disconnects the source. Tearing down an unestablished tunnel is a
    /// no-op.
    pub fn deestablish(&mut self, source: &mut dyn Stage) -> Result<(), TunnelError> {
        let Some((source_port, _)) = self.ports.take() else {
            self.state = TunnelState::Unestablished;
            return Ok(());
        };

        self.state = TunnelState::Unestablished;
        source.attach(source_port, None).map_err(stage_err(self.name))?;

        debug!("Tunnel {} torn down", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageState;
    use crate::stage::soft::clock::{CLOCK_OUTPUT_PORT, SoftClock};
    use crate::stage::soft::renderer::{RENDER_CLOCK_PORT, SoftRenderer};
    use crate::stage::soft::sink::NullSink;

    #[test]
    fn rejects_endpoint_before_loaded() {
        let mut clock = SoftClock::new();
        let mut renderer = SoftRenderer::new(NullSink::shared());
        clock.set_state(StageState::Loaded).unwrap();

        let mut tunnel = Tunnel::new("clock->render");
        let err = tunnel
            .establish(&mut clock, CLOCK_OUTPUT_PORT, &renderer, RENDER_CLOCK_PORT)
            .unwrap_err();
        assert_eq!(err, TunnelError::EndpointNotReady {
            name: "clock->render",
            stage: crate::stage::StageKind::Renderer,
            state: StageState::Idle,
        });
        assert_eq!(tunnel.state(), TunnelState::Unestablished);

        renderer.set_state(StageState::Loaded).unwrap();
        tunnel
            .establish(&mut clock, CLOCK_OUTPUT_PORT, &renderer, RENDER_CLOCK_PORT)
            .unwrap();
        assert!(renderer.handle().has_clock());

        // Already established
        assert!(matches!(
            tunnel.establish(&mut clock, CLOCK_OUTPUT_PORT, &renderer, RENDER_CLOCK_PORT),
            Err(TunnelError::InvalidState { .. })
        ));

        tunnel.flush(&mut clock, &mut renderer).unwrap();
        assert_eq!(tunnel.state(), TunnelState::Established);

        tunnel.deestablish(&mut clock).unwrap();
        assert!(!renderer.handle().has_clock());
        assert!(matches!(
            tunnel.flush(&mut clock, &mut renderer),
            Err(TunnelError::InvalidState { .. })
        ));
        // Idempotent
        tunnel.deestablish(&mut clock).unwrap();
    }
}
