mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use audiotunnel::process::session::{AudioSession, SessionConfig};
use audiotunnel::stage::soft::SoftBackend;
use audiotunnel::stage::soft::clock::SoftClock;
use audiotunnel::stage::{
    Command, PortIndex, PortSink, SharedStage, Stage, StageFactory, StageKind, StageState,
};
use audiotunnel::structs::buffer::{BufferFlags, TransferBuffer};
use audiotunnel::structs::port::{Param, ParamKind, StageConfig};
use audiotunnel::structs::stream::StreamHints;
use audiotunnel::utils::buffer_pool::BufferPool;
use audiotunnel::utils::errors::{GraphError, SessionError, StageError};

use common::{rig, wait_until};

#[test]
fn pcm_stereo_plays_through() {
    let mut rig = rig(SessionConfig::default());
    rig.session.initialize(&StreamHints::default(), None).unwrap();

    let chunk = rig.session.get_chunk_len();
    assert!(chunk > 0);

    let decoder = rig.backend.decoder().unwrap();
    let history = decoder.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].flags.contains(BufferFlags::CODEC_CONFIG));
    assert!(history[0].flags.contains(BufferFlags::END_OF_FRAME));

    let data: Vec<u8> = (0..chunk * 4).map(|i| i as u8).collect();
    let accepted = rig.session.add_packets(&data, None, Some(1_000)).unwrap();
    assert_eq!(accepted, data.len());

    let history = decoder.history();
    let transfers = &history[1..];
    assert_eq!(transfers.len(), 4);
    assert_eq!(transfers.iter().map(|r| r.filled).sum::<usize>(), accepted);

    assert!(transfers[0].flags.contains(BufferFlags::START_TIME));
    assert_eq!(transfers[0].timestamp, Some(1_000));
    // 6144 bytes at 192000 bytes per second
    assert_eq!(transfers[1].timestamp, Some(33_000));
    assert!(!transfers[1].flags.contains(BufferFlags::START_TIME));
    assert!(transfers[3].flags.contains(BufferFlags::END_OF_FRAME));
    assert!(!transfers[2].flags.contains(BufferFlags::END_OF_FRAME));

    assert!(wait_until(|| rig.sink.lock().unwrap().data.len() == data.len()));
    assert_eq!(rig.sink.lock().unwrap().data, data);

    let renderer = rig.backend.renderer().unwrap();
    assert_eq!(renderer.stats().start_time, Some(1_000));
    assert_eq!(renderer.pcm().channels, 2);
}

#[test]
fn missing_timestamps_are_flagged() {
    let mut rig = rig(SessionConfig::default());
    rig.session.initialize(&StreamHints::default(), None).unwrap();

    let data = vec![0u8; rig.session.get_chunk_len() * 2];
    rig.session.add_packets(&data, None, None).unwrap();

    let history = rig.backend.decoder().unwrap().history();
    assert!(history[1..]
        .iter()
        .all(|r| r.flags.contains(BufferFlags::TIME_UNKNOWN) && r.timestamp.is_none()));
}

#[test]
fn flush_restarts_timeline() {
    let mut rig = rig(SessionConfig::default());
    rig.session.initialize(&StreamHints::default(), None).unwrap();

    let data = vec![0u8; 1000];
    rig.session.add_packets(&data, None, Some(0)).unwrap();
    rig.session.add_packets(&data, None, Some(5_000)).unwrap();
    rig.session.flush().unwrap();
    rig.session.add_packets(&data, None, Some(90_000)).unwrap();

    let history = rig.backend.decoder().unwrap().history();
    let starts: Vec<_> = history
        .iter()
        .filter(|r| r.flags.contains(BufferFlags::START_TIME))
        .map(|r| r.timestamp)
        .collect();
    assert_eq!(starts, vec![Some(0), Some(90_000)]);
    assert!(rig.backend.renderer().unwrap().stats().flushes >= 1);
}

#[test]
fn cache_time_tracks_occupancy() {
    let mut rig = rig(SessionConfig::default());
    rig.session.initialize(&StreamHints::default(), None).unwrap();

    let decoder = rig.backend.decoder().unwrap();
    assert!(wait_until(|| decoder.pending() == 0));

    let total = rig.session.get_cache_total();
    assert_eq!(total, 3.0);
    let idle = rig.session.get_cache_time();
    assert!((0.0..=total).contains(&idle));
    let space = rig.session.get_space();

    rig.session.pause().unwrap();
    let chunk = rig.session.get_chunk_len();
    rig.session
        .add_packets(&vec![0u8; chunk * 10], None, Some(0))
        .unwrap();

    assert_eq!(rig.session.get_space(), space - chunk * 10);
    let busy = rig.session.get_cache_time();
    assert!(busy > idle);
    assert!(busy <= total);
    assert!(rig.session.get_delay() > 0.0);

    rig.session.resume().unwrap();
    assert!(wait_until(|| rig.session.get_space() == space));
}

#[test]
fn full_queue_times_out_with_partial_count() {
    let config = SessionConfig {
        buffer_seconds: 1,
        buffer_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let mut rig = rig(config);
    rig.session.initialize(&StreamHints::default(), None).unwrap();

    let decoder = rig.backend.decoder().unwrap();
    assert!(wait_until(|| decoder.pending() == 0));
    rig.session.pause().unwrap();

    // 192000 bytes per second, 31 buffers of 6144 bytes
    let err = rig
        .session
        .add_packets(&vec![0u8; 200_000], None, None)
        .unwrap_err();
    assert_eq!(err, SessionError::BufferTimeout { accepted: 31 * 6144 });
    assert_eq!(rig.session.get_space(), 0);

    rig.session.stop().unwrap();
    assert!(!rig.session.is_paused());
    assert_eq!(rig.session.get_space(), 31 * 6144);
}

#[test]
fn shared_clock_outlives_session() {
    let clock = Arc::new(Mutex::new(SoftClock::started().unwrap()));
    let media_clock = clock.lock().unwrap().clock();
    let shared: SharedStage = clock.clone();

    let mut rig = rig(SessionConfig::default());
    rig.session
        .initialize(&StreamHints::default(), Some(shared))
        .unwrap();
    assert!(!rig.backend.created().contains(&StageKind::Clock));

    let renderer = rig.backend.renderer().unwrap();
    assert!(renderer.has_clock());

    rig.session
        .add_packets(&[0u8; 4000], None, Some(250_000))
        .unwrap();
    assert!(wait_until(|| renderer.stats().buffers > 0));
    assert!(renderer.media_time().is_some_and(|t| t >= 250_000));

    rig.session.deinitialize();
    assert!(!renderer.has_clock());
    assert_eq!(Arc::strong_count(&clock), 1);
    assert_eq!(clock.lock().unwrap().state(), StageState::Executing);
    drop(media_clock);
}

#[test]
fn remapped_session_scales_queries() {
    let mut rig = rig(SessionConfig::default());
    let hints = StreamHints {
        channels: 6,
        layout: Some("fl,fr,fc,lfe,bl,br".parse().unwrap()),
        ..StreamHints::default()
    };
    rig.session.initialize(&hints, None).unwrap();

    // Caller and decoder both carry 6 channels, only the order changes
    assert_eq!(rig.session.get_chunk_len(), 6144);

    let frame: Vec<u8> = (1..=6u16).flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(rig.session.add_packets(&frame, None, Some(0)), Ok(12));

    assert!(wait_until(|| rig.sink.lock().unwrap().data.len() == 12));
    let rendered: Vec<u16> = rig.sink.lock().unwrap()
        .data
        .chunks(2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .collect();
    // FL FR BL BR FC LFE
    assert_eq!(rendered, vec![1, 2, 5, 6, 3, 4]);
}

/// Renderer wrapper that never completes port commands.
struct Unresponsive(Box<dyn Stage>);

impl Stage for Unresponsive {
    fn kind(&self) -> StageKind {
        self.0.kind()
    }
    fn state(&self) -> StageState {
        self.0.state()
    }
    fn set_state(&mut self, state: StageState) -> Result<(), StageError> {
        self.0.set_state(state)
    }
    fn input_port(&self) -> Option<PortIndex> {
        self.0.input_port()
    }
    fn output_port(&self) -> Option<PortIndex> {
        self.0.output_port()
    }
    fn clock_port(&self) -> Option<PortIndex> {
        self.0.clock_port()
    }
    fn get_parameter(&self, port: PortIndex, kind: ParamKind) -> Result<Param, StageError> {
        self.0.get_parameter(port, kind)
    }
    fn set_parameter(&mut self, port: PortIndex, param: Param) -> Result<(), StageError> {
        self.0.set_parameter(port, param)
    }
    fn set_config(&mut self, config: StageConfig) -> Result<(), StageError> {
        self.0.set_config(config)
    }
    fn send_command(&mut self, _command: Command) -> Result<(), StageError> {
        Ok(())
    }
    fn wait_for_command(&mut self, command: Command, timeout: Duration) -> Result<(), StageError> {
        Err(StageError::CommandTimeout {
            stage: self.kind(),
            command,
            timeout,
        })
    }
    fn allocate_input_buffers(&mut self) -> Result<Arc<BufferPool>, StageError> {
        self.0.allocate_input_buffers()
    }
    fn empty_buffer(&mut self, buffer: TransferBuffer) -> Result<(), StageError> {
        self.0.empty_buffer(buffer)
    }
    fn flush_port(&mut self, port: PortIndex) -> Result<(), StageError> {
        self.0.flush_port(port)
    }
    fn port_sink(&self, port: PortIndex) -> Result<Arc<dyn PortSink>, StageError> {
        self.0.port_sink(port)
    }
    fn attach(&mut self, port: PortIndex, peer: Option<Arc<dyn PortSink>>) -> Result<(), StageError> {
        self.0.attach(port, peer)
    }
}

struct StallingFactory(SoftBackend);

impl StageFactory for StallingFactory {
    fn create(&self, kind: StageKind) -> Result<Box<dyn Stage>, StageError> {
        let stage = self.0.create(kind)?;
        Ok(match kind {
            StageKind::Renderer => Box::new(Unresponsive(stage)),
            _ => stage,
        })
    }
}

#[test]
fn handshake_timeout_fails_first_packet() {
    let config = SessionConfig {
        handshake_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let mut session = AudioSession::new(Arc::new(StallingFactory(SoftBackend::default())), config);
    session.initialize(&StreamHints::default(), None).unwrap();

    let err = session.add_packets(&[0u8; 400], None, Some(0)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Graph(GraphError::Stage {
            source: StageError::CommandTimeout { .. },
            ..
        })
    ));
    assert!(!session.is_initialized());
    assert_eq!(
        session.add_packets(&[0u8; 400], None, None),
        Err(SessionError::NotInitialized)
    );
}

#[test]
fn missing_stage_fails_initialize() {
    let backend = Arc::new(SoftBackend::default().without(StageKind::Decoder));
    let mut session = AudioSession::new(backend.clone(), SessionConfig::default());

    let err = session.initialize(&StreamHints::default(), None).unwrap_err();
    assert_eq!(
        err,
        SessionError::Graph(GraphError::Stage {
            step: "create decoder",
            source: StageError::Unavailable {
                stage: StageKind::Decoder
            },
        })
    );
    assert!(!session.is_initialized());
    assert_eq!(backend.renderer().unwrap().state(), StageState::Idle);
}

#[test]
fn remapped_cache_time_tracks_queue() {
    let mut rig = rig(SessionConfig::default());
    let hints = StreamHints {
        channels: 1,
        layout: Some("fc".parse().unwrap()),
        ..StreamHints::default()
    };
    rig.session.initialize(&hints, None).unwrap();

    let decoder = rig.backend.decoder().unwrap();
    assert!(wait_until(|| decoder.pending() == 0));

    let total = rig.session.get_cache_total();
    let idle = rig.session.get_cache_time();
    assert!(idle < 0.1, "idle cache time {idle}");

    rig.session.pause().unwrap();
    let chunk = rig.session.get_chunk_len();
    rig.session
        .add_packets(&vec![0u8; chunk * 10], None, Some(0))
        .unwrap();

    let busy = rig.session.get_cache_time();
    assert!(busy > idle + 0.05, "busy cache time {busy}");
    assert!(busy <= total);

    rig.session.resume().unwrap();
    assert!(wait_until(|| rig.session.get_cache_time() < 0.1));
}

#[test]
fn drc_scales_remapped_samples() {
    let config = SessionConfig {
        drc: -600,
        ..SessionConfig::default()
    };
    let mut rig = rig(config);
    let hints = StreamHints {
        channels: 6,
        layout: Some("fl,fr,fc,lfe,bl,br".parse().unwrap()),
        ..StreamHints::default()
    };
    rig.session.initialize(&hints, None).unwrap();

    let frame: Vec<u8> = [1000i16, -1000, 2000, 0, 4000, -4000]
        .into_iter()
        .flat_map(i16::to_le_bytes)
        .collect();
    assert_eq!(rig.session.add_packets(&frame, None, Some(0)), Ok(12));

    assert!(wait_until(|| rig.sink.lock().unwrap().data.len() == 12));
    let rendered: Vec<i16> = rig.sink.lock().unwrap()
        .data
        .chunks(2)
        .map(|s| i16::from_le_bytes([s[0], s[1]]))
        .collect();
    // FL FR BL BR FC LFE at about half level
    assert_eq!(rendered, vec![501, -501, 2005, -2005, 1002, 0]);
}
