//! Network source driving the engine through the channel connector

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vcam::network::quality::QualityController;
use vcam::network::session::{ChannelConnector, IncomingFrame, RemotePeer, WireLayout};
use vcam::{
    CaptureTick, ConnectionState, DiagnosticEvent, Diagnostics, EngineConfig, FormatDescriptor,
    FrameSourceAdapter, FrameSourceState, NetworkConfig, NetworkStreamSource, PassReason,
    PixelFormat, PoolConfig, QualityPolicy, QualityPreset, Substitution, SubstitutionEngine,
};

fn rgb_frame(width: u32, height: u32, rgb: [u8; 3], sent_at: Duration) -> IncomingFrame {
    let payload: Vec<u8> = (0..width * height).flat_map(|_| rgb).collect();
    IncomingFrame {
        width,
        height,
        layout: WireLayout::Rgb24 {
            stride: width as usize * 3,
        },
        payload: Bytes::from(payload),
        timestamp: sent_at,
    }
}

struct Harness {
    network: Arc<NetworkStreamSource>,
    peers: flume::Receiver<RemotePeer>,
    engine: SubstitutionEngine,
    events: flume::Receiver<DiagnosticEvent>,
}

fn harness() -> Harness {
    let (diagnostics, events) = Diagnostics::channel(1024);
    let (connector, peers) = ChannelConnector::new();
    let network = NetworkStreamSource::new(
        NetworkConfig {
            room_id: "test-room".into(),
            ..NetworkConfig::default()
        },
        QualityPolicy::default(),
        Arc::new(connector),
        diagnostics.clone(),
    );
    let mut engine =
        SubstitutionEngine::new(EngineConfig::default(), PoolConfig::default(), diagnostics);
    engine.set_source(Some(FrameSourceAdapter::Network(network.clone())));
    Harness {
        network,
        peers,
        engine,
        events,
    }
}

fn tick(ms: u64) -> CaptureTick {
    CaptureTick::new(FormatDescriptor::new(64, 48, PixelFormat::Nv12), Duration::from_millis(ms))
}

#[test]
fn passes_through_until_the_first_frame_arrives() {
    let mut h = harness();
    h.network.connect().unwrap();
    let peer = h.peers.try_recv().unwrap();
    assert_eq!(peer.request.room_id, "test-room");
    assert_eq!(h.network.state(), ConnectionState::Connecting);

    for ms in 0..5 {
        assert!(matches!(
            h.engine.produce_frame(&tick(ms)),
            Substitution::PassThrough(PassReason::NoFrame)
        ));
    }

    peer.sink
        .deliver(rgb_frame(64, 48, [0, 0, 255], Duration::from_secs(999)))
        .unwrap();
    let Substitution::Replaced(frame) = h.engine.produce_frame(&tick(100)) else {
        panic!("expected the network frame");
    };
    assert_eq!(frame.format(), PixelFormat::Nv12);
    assert_eq!(frame.timestamp, Duration::from_millis(100));

    assert!(matches!(
        h.engine.source_state(),
        FrameSourceState::StreamingNetwork(Some(_))
    ));
    let events: Vec<_> = h.events.drain().collect();
    assert!(events.contains(&DiagnosticEvent::FirstFrame { width: 64, height: 48 }));
    assert!(events.contains(&DiagnosticEvent::ConnectionStateChanged {
        from: ConnectionState::Connecting,
        to: ConnectionState::Connected,
    }));
}

#[test]
fn disconnect_falls_back_to_the_camera() {
    let mut h = harness();
    h.network.connect().unwrap();
    let peer = h.peers.try_recv().unwrap();
    peer.sink.deliver(rgb_frame(32, 32, [9, 9, 9], Duration::ZERO)).unwrap();
    assert!(h.engine.produce_frame(&tick(0)).is_replaced());

    h.network.disconnect();
    assert_eq!(h.network.state(), ConnectionState::Disconnected);
    assert!(!peer.sink.is_current());
    assert!(matches!(
        h.engine.produce_frame(&tick(1)),
        Substitution::PassThrough(PassReason::NoFrame)
    ));
}

#[test]
fn resolution_changes_are_reported() {
    let h = harness();
    h.network.connect().unwrap();
    let peer = h.peers.try_recv().unwrap();
    peer.sink.deliver(rgb_frame(32, 32, [1, 1, 1], Duration::ZERO)).unwrap();
    peer.sink.deliver(rgb_frame(48, 32, [1, 1, 1], Duration::ZERO)).unwrap();

    assert_eq!(h.network.stats().current_resolution, Some((48, 32)));
    assert!(h
        .events
        .drain()
        .any(|e| e == DiagnosticEvent::ResolutionChanged { width: 48, height: 32 }));

    let report = h.network.current_statistics();
    assert_eq!(report.frames_received, 2);
    assert_eq!(report.slot_version, 2);
    assert_eq!(report.quality_level, QualityPreset::High);
}

#[test]
fn concurrent_delivery_never_yields_a_malformed_frame() {
    let mut h = harness();
    h.network.connect().unwrap();
    let peer = h.peers.try_recv().unwrap();
    peer.sink.established();

    let producer = std::thread::spawn(move || {
        for i in 0..300u32 {
            let shade = (i % 200) as u8 + 20;
            peer.sink
                .deliver(rgb_frame(80, 60, [shade, shade, shade], Duration::ZERO))
                .unwrap();
            if i % 16 == 0 {
                std::thread::yield_now();
            }
        }
    });

    let mut replaced = 0;
    for ms in 0..300 {
        match h.engine.produce_frame(&tick(ms)) {
            Substitution::Replaced(frame) => {
                replaced += 1;
                assert_eq!((frame.width(), frame.height()), (64, 48));
                // Gray input: every chroma sample sits at neutral
                assert!(frame.plane(1).iter().all(|&c| (126..=130).contains(&c)));
            }
            Substitution::PassThrough(PassReason::NoFrame) => {}
            Substitution::PassThrough(other) => panic!("unexpected pass-through: {other:?}"),
        }
    }
    producer.join().unwrap();
    assert!(h.engine.produce_frame(&tick(1_000)).is_replaced() || replaced > 0);
    assert_eq!(h.network.stats().frames_received, 300);
}

#[test]
fn error_state_requires_reset() {
    let h = harness();
    h.network.connect().unwrap();
    let peer = h.peers.try_recv().unwrap();
    peer.sink.fail("transport closed unexpectedly");
    assert_eq!(h.network.state(), ConnectionState::Error);
    assert!(h.network.connect().is_err());

    h.network.reconnect().unwrap();
    assert_eq!(h.network.state(), ConnectionState::Connecting);
    h.peers.try_recv().unwrap().sink.established();
    assert_eq!(h.network.state(), ConnectionState::Connected);
}

#[test]
fn sustained_low_fps_downgrades_once() {
    let mut controller =
        QualityController::new(QualityPolicy::default(), 30.0, QualityPreset::High);
    // Three windows under half the preferred rate, then hovering near the threshold
    let mut trace = vec![12.0, 11.0, 13.0];
    trace.extend((0..50).map(|i| if i % 2 == 0 { 11.5 } else { 12.5 }));

    let changes: Vec<_> = trace.into_iter().filter_map(|fps| controller.observe(fps)).collect();
    assert_eq!(changes, vec![QualityPreset::Medium]);
}
