//! vcam demo: drives the substitution engine from a simulated capture clock

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use vcam::network::session::{ChannelConnector, IncomingFrame, RemotePeer, WireLayout};
use vcam::{
    CaptureTick, Config, Diagnostics, FormatDescriptor, NetworkStreamSource, PixelFormat,
    SourceKind, Substitution, SubstitutionEngine,
};

const CAPTURE_FPS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vcam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;
    if config.source.kind == SourceKind::None {
        config.source.kind = SourceKind::Network;
    }
    info!(source = ?config.source.kind, "vcam launching");

    let (diagnostics, events) = Diagnostics::channel(config.diagnostics.channel_capacity);
    let _events = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            debug!(?event, "diagnostic record");
        }
    });

    let (connector, peers) = ChannelConnector::new();
    let network = NetworkStreamSource::new(
        config.network.clone(),
        config.quality,
        Arc::new(connector),
        diagnostics.clone(),
    );

    let mut engine = SubstitutionEngine::new(config.engine.clone(), config.pool, diagnostics)
        .with_stats_interval(config.diagnostics.frame_stats_interval);
    engine.open_source(&config.source, Some(network.clone()))?;

    if config.source.kind == SourceKind::Network {
        network.connect()?;
        let peer = peers
            .recv_async()
            .await
            .map_err(|_| eyre!("connector closed before a session was opened"))?;
        tokio::task::spawn_blocking(move || synthetic_peer(peer));
    }

    let expected = FormatDescriptor::new(1280, 720, PixelFormat::Nv12);
    let mut interval = tokio::time::interval(Duration::from_millis(1000 / CAPTURE_FPS));
    let started = tokio::time::Instant::now();
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }
        let tick = CaptureTick::new(expected, started.elapsed());
        match engine.produce_frame(&tick) {
            Substitution::Replaced(frame) => {
                debug!(sequence = frame.sequence, timestamp = ?frame.timestamp, "substituted")
            }
            Substitution::PassThrough(reason) => debug!(?reason, "pass-through"),
        }

        ticks += 1;
        if ticks % (CAPTURE_FPS * 5) == 0 {
            let stats = engine.stats();
            info!(
                substituted = stats.frame_count,
                passed = stats.pass_through_count,
                avg_ms = stats.average_processing_ms,
                "engine statistics"
            );
            network.log_diagnostic_info();
        }
    }

    network.disconnect();
    info!("vcam shutting down");
    Ok(())
}

/// Remote side of the demo session: a moving gradient in I420.
fn synthetic_peer(peer: RemotePeer) {
    let (width, height) = peer.request.resolution;
    let fps = peer.request.fps.max(1.0) as f64;
    let frame_interval = Duration::from_secs_f64(1.0 / fps);
    peer.sink.established();

    for n in 0u64.. {
        if let Ok(preset) = peer.quality.try_recv() {
            info!(?preset, "peer asked for a new quality preset");
        }

        let mut payload = vec![128u8; PixelFormat::I420.buffer_len(width, height)];
        let shift = (n * 4) as usize;
        for (y, row) in payload[..(width * height) as usize]
            .chunks_exact_mut(width as usize)
            .enumerate()
        {
            for (x, px) in row.iter_mut().enumerate() {
                *px = ((x + y + shift) % 256) as u8;
            }
        }

        let frame = IncomingFrame {
            width,
            height,
            layout: WireLayout::packed_i420(width),
            payload: Bytes::from(payload),
            timestamp: Duration::from_secs_f64(n as f64 / fps),
        };
        if let Err(err) = peer.sink.deliver(frame) {
            warn!(%err, "synthetic frame rejected");
        }
        if !peer.sink.is_current() {
            break;
        }
        std::thread::sleep(frame_interval);
    }
}
