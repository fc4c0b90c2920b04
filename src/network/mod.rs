//! Live network frame source.
//!
//! A [`NetworkStreamSource`] owns one session at a time and the
//! [`NetworkFrameSlot`] its frames land in. Frames arrive through a
//! [`FrameSink`] on whatever thread the transport uses, are normalized to I420
//! there, and are published with a single pointer swap. The capture tick reads
//! the slot without taking any lock.

mod normalize;
pub mod quality;
pub mod session;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::frame::FrameBuffer;
use crate::diagnostics::{DiagnosticEvent, Diagnostics, LogCategory, Severity};
use crate::error::{Result, VcamError};
use crate::pipeline::slot::NetworkFrameSlot;

use normalize::Normalizer;
use quality::{FpsWindow, QualityController, QualityPolicy, QualityPreset};
use session::{FrameSink, IncomingFrame, SessionConnector, SessionRequest, StreamSession};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Left only through [`NetworkStreamSource::reset`]
    Error,
}

impl ConnectionState {
    /// A session exists or is being negotiated
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    pub fn can_transition(self, to: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Connecting | Connected | Reconnecting, Disconnected)
                | (Disconnected | Connecting | Connected | Reconnecting, Error)
        )
    }
}

/// Identifies one established session; changes on every (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub server_url: String,
    pub room_id: String,
    pub preferred_width: u32,
    pub preferred_height: u32,
    pub preferred_fps: f32,
    pub automatic_quality_control: bool,
    pub initial_preset: QualityPreset,
    /// Frames older than this are not substituted
    pub stale_frame_timeout_ms: u64,
    /// Decay constant of the per-frame FPS moving average
    pub fps_ema_alpha: f32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            room_id: String::new(),
            preferred_width: 1280,
            preferred_height: 720,
            preferred_fps: 30.0,
            automatic_quality_control: true,
            initial_preset: QualityPreset::High,
            stale_frame_timeout_ms: 500,
            fps_ema_alpha: 0.1,
        }
    }
}

/// Read-only snapshot of connection health
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    pub paused: bool,
    pub session: Option<SessionId>,
    pub frames_received: u64,
    pub current_fps: f32,
    pub current_resolution: Option<(u32, u32)>,
    /// Sender timestamp of the last frame
    pub last_frame_timestamp: Option<Duration>,
    pub last_frame_age: Option<Duration>,
    pub quality_level: QualityPreset,
    pub automatic_quality_control: bool,
    pub connection_duration: Option<Duration>,
}

/// Flat, serializable statistics record for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsReport {
    pub state: ConnectionState,
    pub frames_received: u64,
    pub current_fps: f32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality_level: QualityPreset,
    pub automatic_quality_control: bool,
    pub paused: bool,
    pub connection_duration_ms: Option<u64>,
    pub slot_version: u64,
    pub frames_overwritten: u64,
}

struct Control {
    state: ConnectionState,
    session: Option<Arc<dyn StreamSession>>,
    active_preset: QualityPreset,
    /// Applied when the next frame is delivered; `bool` marks automatic changes
    pending_preset: Option<(QualityPreset, bool)>,
    automatic: bool,
    controller: QualityController,
    window: FpsWindow,
    frames_received: u64,
    fps: f32,
    resolution: Option<(u32, u32)>,
    last_frame_timestamp: Option<Duration>,
    last_frame_at: Option<Instant>,
    connected_since: Option<Instant>,
}

impl Control {
    /// Forget per-session measurements
    fn clear_session_stats(&mut self) {
        self.window.reset();
        self.controller.reset();
        self.fps = 0.0;
        self.resolution = None;
        self.last_frame_at = None;
    }
}

pub struct NetworkStreamSource {
    config: NetworkConfig,
    connector: Arc<dyn SessionConnector>,
    diagnostics: Diagnostics,
    slot: NetworkFrameSlot,
    control: Mutex<Control>,
    /// Conversion scratch, held only while a delivery converts
    scratch: Mutex<Normalizer>,

    /// Bumped on every teardown; sinks of older sessions are ignored
    generation: AtomicU64,
    paused: AtomicBool,
    epoch: Instant,
    last_publish_us: AtomicU64,
}

impl std::fmt::Debug for NetworkStreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStreamSource")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl NetworkStreamSource {
    pub fn new(
        config: NetworkConfig,
        quality: QualityPolicy,
        connector: Arc<dyn SessionConnector>,
        diagnostics: Diagnostics,
    ) -> Arc<Self> {
        let preset = config.initial_preset;
        let control = Control {
            state: ConnectionState::Disconnected,
            session: None,
            active_preset: preset,
            pending_preset: None,
            automatic: config.automatic_quality_control,
            controller: QualityController::new(quality, config.preferred_fps, preset),
            window: FpsWindow::new(Duration::from_millis(quality.window_ms)),
            frames_received: 0,
            fps: 0.0,
            resolution: None,
            last_frame_timestamp: None,
            last_frame_at: None,
            connected_since: None,
        };

        Arc::new(Self {
            config,
            connector,
            diagnostics,
            slot: NetworkFrameSlot::new(),
            control: Mutex::new(control),
            scratch: Mutex::new(Normalizer::default()),
            generation: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            epoch: Instant::now(),
            last_publish_us: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        let ctl = self.lock();
        ctl.state.is_active().then(|| SessionId(self.generation()))
    }

    /// Open a session. A no-op while one is already connecting or connected.
    #[instrument(skip(self), fields(server = %self.config.server_url, room = %self.config.room_id))]
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        let (generation, request) = {
            let mut ctl = self.lock();
            match ctl.state {
                state if state.is_active() => {
                    debug!(?state, "already connecting or connected");
                    return Ok(());
                }
                ConnectionState::Error => {
                    return Err(VcamError::InvalidTransition {
                        from: ConnectionState::Error,
                        operation: "connect",
                    })
                }
                _ => {}
            }
            self.teardown(&mut ctl);
            self.transition(&mut ctl, ConnectionState::Connecting);
            (self.generation(), self.request(&ctl))
        };
        self.open_session(generation, request)
    }

    /// Tear the session down and establish a new one with the same
    /// configuration. From `Error` this resets first.
    #[instrument(skip(self))]
    pub fn reconnect(self: &Arc<Self>) -> Result<()> {
        let (generation, request, old) = {
            let mut ctl = self.lock();
            let old = self.teardown(&mut ctl);
            match ctl.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.transition(&mut ctl, ConnectionState::Reconnecting)
                }
                ConnectionState::Reconnecting => {}
                ConnectionState::Error => {
                    self.reset_locked(&mut ctl);
                    self.transition(&mut ctl, ConnectionState::Connecting);
                }
                ConnectionState::Disconnected => {
                    self.transition(&mut ctl, ConnectionState::Connecting)
                }
            }
            (self.generation(), self.request(&ctl), old)
        };
        if let Some(session) = old {
            session.close();
        }
        self.open_session(generation, request)
    }

    /// Release the session. Always succeeds; an `Error` state is kept until
    /// [`reset`](Self::reset).
    #[instrument(skip(self))]
    pub fn disconnect(&self) {
        let old = {
            let mut ctl = self.lock();
            let old = self.teardown(&mut ctl);
            if ctl.state != ConnectionState::Error {
                self.transition(&mut ctl, ConnectionState::Disconnected);
            }
            old
        };
        if let Some(session) = old {
            session.close();
        }
    }

    /// Back to a clean `Disconnected` source, from any state.
    #[instrument(skip(self))]
    pub fn reset(&self) {
        let old = {
            let mut ctl = self.lock();
            let old = self.teardown(&mut ctl);
            self.reset_locked(&mut ctl);
            old
        };
        if let Some(session) = old {
            session.close();
        }
        self.paused.store(false, Ordering::Release);
    }

    /// Session-level failure: release everything and enter `Error`.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let old = {
            let mut ctl = self.lock();
            if ctl.state == ConnectionState::Error {
                return;
            }
            let old = self.teardown(&mut ctl);
            self.transition(&mut ctl, ConnectionState::Error);
            old
        };
        if let Some(session) = old {
            session.close();
        }
        warn!(%reason, "network session failed");
        self.diagnostics.issue(LogCategory::Session, Severity::Error, reason);
    }

    /// Drop incoming frames and report no frame until resumed.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("network stream paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("network stream resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Request a preset. With a live session it takes effect when the next
    /// frame is delivered; otherwise immediately.
    pub fn set_quality_preset(&self, preset: QualityPreset) {
        let mut ctl = self.lock();
        ctl.controller.set_preset(preset);
        if ctl.session.is_some() {
            ctl.pending_preset = Some((preset, false));
        } else {
            ctl.pending_preset = None;
            // No session, so nobody to notify
            let _ = self.apply_preset(&mut ctl, preset, false);
        }
    }

    pub fn set_automatic_quality_control(&self, enabled: bool) {
        let mut ctl = self.lock();
        ctl.automatic = enabled;
        ctl.controller.reset();
        ctl.window.reset();
        debug!(enabled, "automatic quality control");
    }

    /// Latest frame for the capture tick. Never blocks.
    ///
    /// `Ok(None)` before the first frame and while paused;
    /// [`VcamError::SlotReadTimeout`] when the latest frame is too old to use.
    pub fn fetch_latest(&self) -> Result<Option<Arc<FrameBuffer>>> {
        if self.is_paused() {
            return Ok(None);
        }
        let Some(snapshot) = self.slot.read() else {
            return Ok(None);
        };
        let age_ms = self.micros_since_epoch(Instant::now())
            .saturating_sub(self.last_publish_us.load(Ordering::Acquire))
            / 1000;
        if age_ms > self.config.stale_frame_timeout_ms {
            return Err(VcamError::SlotReadTimeout { waited_ms: age_ms });
        }
        Ok(Some(snapshot.frame))
    }

    /// The most recent frame regardless of age or pause state.
    pub fn last_received_frame(&self) -> Option<Arc<FrameBuffer>> {
        self.slot.read().map(|snapshot| snapshot.frame)
    }

    pub fn stats(&self) -> ConnectionStats {
        let ctl = self.lock();
        let now = Instant::now();
        ConnectionStats {
            state: ctl.state,
            connected: ctl.state == ConnectionState::Connected,
            connecting: matches!(
                ctl.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            ),
            paused: self.is_paused(),
            session: ctl.state.is_active().then(|| SessionId(self.generation())),
            frames_received: ctl.frames_received,
            current_fps: ctl.fps,
            current_resolution: ctl.resolution,
            last_frame_timestamp: ctl.last_frame_timestamp,
            last_frame_age: ctl.last_frame_at.map(|at| now.saturating_duration_since(at)),
            quality_level: ctl.active_preset,
            automatic_quality_control: ctl.automatic,
            connection_duration: ctl.connected_since.map(|at| now.saturating_duration_since(at)),
        }
    }

    pub fn current_statistics(&self) -> StatisticsReport {
        let stats = self.stats();
        let (_, _, frames_overwritten) = self.slot.stats();
        StatisticsReport {
            state: stats.state,
            frames_received: stats.frames_received,
            current_fps: stats.current_fps,
            width: stats.current_resolution.map(|(w, _)| w),
            height: stats.current_resolution.map(|(_, h)| h),
            quality_level: stats.quality_level,
            automatic_quality_control: stats.automatic_quality_control,
            paused: stats.paused,
            connection_duration_ms: stats.connection_duration.map(|d| d.as_millis() as u64),
            slot_version: self.slot.version(),
            frames_overwritten,
        }
    }

    pub fn log_diagnostic_info(&self) {
        self.diagnostics
            .emit(DiagnosticEvent::NetworkStatistics(self.current_statistics()));
    }

    fn request(&self, ctl: &Control) -> SessionRequest {
        let (w, h) = ctl.active_preset.resolution();
        SessionRequest {
            server_url: self.config.server_url.clone(),
            room_id: self.config.room_id.clone(),
            resolution: (w.min(self.config.preferred_width), h.min(self.config.preferred_height)),
            fps: self.config.preferred_fps.min(ctl.active_preset.max_fps()),
            preset: ctl.active_preset,
        }
    }

    fn open_session(self: &Arc<Self>, generation: u64, request: SessionRequest) -> Result<()> {
        // The connector may call back into the sink, so no lock is held here
        let opened = self.connector.open(&request, FrameSink::new(self, generation));

        let mut ctl = self.lock();
        if !self.is_current(generation) {
            drop(ctl);
            if let Ok(session) = opened {
                session.close();
            }
            debug!("session superseded while opening");
            return Ok(());
        }

        match opened {
            Ok(session) => {
                ctl.session = Some(Arc::from(session));
                info!(session = generation, preset = ?request.preset, "network session opened");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                self.teardown(&mut ctl);
                self.transition(&mut ctl, ConnectionState::Error);
                drop(ctl);
                warn!(%reason, "failed to open network session");
                self.diagnostics
                    .issue(LogCategory::Session, Severity::Error, reason.clone());
                Err(match err {
                    err @ VcamError::ConnectionError(_) => err,
                    _ => VcamError::ConnectionError(reason),
                })
            }
        }
    }

    /// Invalidate the current session and everything it published.
    fn teardown(&self, ctl: &mut Control) -> Option<Arc<dyn StreamSession>> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.slot.clear();
        self.last_publish_us.store(0, Ordering::Release);
        ctl.clear_session_stats();
        ctl.pending_preset = None;
        ctl.session.take()
    }

    fn reset_locked(&self, ctl: &mut Control) {
        ctl.frames_received = 0;
        ctl.last_frame_timestamp = None;
        ctl.automatic = self.config.automatic_quality_control;
        let from = ctl.state;
        ctl.state = ConnectionState::Disconnected;
        ctl.connected_since = None;
        if from != ConnectionState::Disconnected {
            self.diagnostics.emit(DiagnosticEvent::ConnectionStateChanged {
                from,
                to: ConnectionState::Disconnected,
            });
        }
    }

    fn transition(&self, ctl: &mut Control, to: ConnectionState) {
        let from = ctl.state;
        if from == to {
            return;
        }
        if !from.can_transition(to) {
            warn!(?from, ?to, "unexpected connection transition");
        }
        ctl.state = to;
        match to {
            ConnectionState::Connected => ctl.connected_since = Some(Instant::now()),
            ConnectionState::Disconnected | ConnectionState::Error => ctl.connected_since = None,
            _ => {}
        }
        self.diagnostics
            .emit(DiagnosticEvent::ConnectionStateChanged { from, to });
    }

    /// Make `preset` active. Returns the session to notify once the lock is
    /// released, since sessions may call back into the sink.
    fn apply_preset(
        &self,
        ctl: &mut Control,
        preset: QualityPreset,
        automatic: bool,
    ) -> Option<Arc<dyn StreamSession>> {
        let from = ctl.active_preset;
        if from == preset {
            return None;
        }
        ctl.active_preset = preset;
        self.diagnostics.emit(DiagnosticEvent::QualityPresetChanged {
            from,
            to: preset,
            automatic,
        });
        ctl.session.clone()
    }

    fn micros_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    // Sink entry points. Each ignores sessions that are no longer current.

    fn deliver(&self, generation: u64, frame: IncomingFrame) -> Result<Option<u64>> {
        if !self.is_current(generation) {
            trace!(generation, "frame from stale session dropped");
            return Ok(None);
        }
        if self.is_paused() {
            return Ok(None);
        }

        let (cap, notify) = {
            let mut ctl = self.lock();
            let notify = ctl
                .pending_preset
                .take()
                .and_then(|(preset, automatic)| {
                    self.apply_preset(&mut ctl, preset, automatic)
                        .map(|session| (session, preset))
                });
            let (w, h) = ctl.active_preset.resolution();
            let cap = (
                w.min(self.config.preferred_width.max(1)),
                h.min(self.config.preferred_height.max(1)),
            );
            (cap, notify)
        };
        if let Some((session, preset)) = notify {
            session.set_quality(preset);
        }

        // Conversion happens before any shared state is touched
        let converted = {
            let mut normalizer = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
            normalizer.to_i420(&frame, self.slot.take_recycled(), cap)
        };
        let mut normalized = match converted {
            Ok(normalized) => normalized,
            Err(err) => {
                warn!(%err, "dropping network frame");
                counter!("vcam_network_frames_dropped").increment(1);
                self.diagnostics.issue(
                    LogCategory::Video,
                    Severity::Warning,
                    format!("network frame dropped: {err}"),
                );
                return Err(err);
            }
        };
        normalized.timestamp = frame.timestamp;
        let resolution = (normalized.width(), normalized.height());

        let now = Instant::now();
        let mut ctl = self.lock();
        if !self.is_current(generation) {
            return Ok(None);
        }
        ctl.frames_received += 1;
        normalized.sequence = ctl.frames_received;
        self.last_publish_us
            .store(self.micros_since_epoch(now), Ordering::Release);
        let version = self.slot.publish(normalized);

        self.record_frame(&mut ctl, now, resolution, frame.timestamp);
        Ok(Some(version))
    }

    fn record_frame(
        &self,
        ctl: &mut Control,
        now: Instant,
        resolution: (u32, u32),
        timestamp: Duration,
    ) {
        if let Some(previous) = ctl.last_frame_at {
            let dt = now.saturating_duration_since(previous).as_secs_f32();
            if dt > 0.0 {
                let instant_fps = 1.0 / dt;
                let alpha = self.config.fps_ema_alpha;
                ctl.fps = if ctl.fps == 0.0 {
                    instant_fps
                } else {
                    alpha * instant_fps + (1.0 - alpha) * ctl.fps
                };
            }
        }
        ctl.last_frame_at = Some(now);
        ctl.last_frame_timestamp = Some(timestamp);

        let (width, height) = resolution;
        match ctl.resolution {
            None => self.diagnostics.emit(DiagnosticEvent::FirstFrame { width, height }),
            Some(previous) if previous != resolution => self
                .diagnostics
                .emit(DiagnosticEvent::ResolutionChanged { width, height }),
            _ => {}
        }
        ctl.resolution = Some(resolution);

        if matches!(ctl.state, ConnectionState::Connecting | ConnectionState::Reconnecting) {
            self.transition(ctl, ConnectionState::Connected);
        }

        counter!("vcam_network_frames_received").increment(1);
        if let Some(fps) = ctl.window.record(now) {
            gauge!("vcam_network_fps").set(fps as f64);
            self.diagnostics.emit(DiagnosticEvent::FrameRateUpdated { fps });
            if ctl.automatic {
                if let Some(next) = ctl.controller.observe(fps) {
                    ctl.pending_preset = Some((next, true));
                }
            }
        }
    }

    fn session_established(&self, generation: u64) {
        let mut ctl = self.lock();
        if self.is_current(generation)
            && matches!(ctl.state, ConnectionState::Connecting | ConnectionState::Reconnecting)
        {
            self.transition(&mut ctl, ConnectionState::Connected);
        }
    }

    fn session_interrupted(&self, generation: u64) {
        let mut ctl = self.lock();
        if self.is_current(generation) && ctl.state == ConnectionState::Connected {
            self.transition(&mut ctl, ConnectionState::Reconnecting);
        }
    }

    fn session_closed(&self, generation: u64) {
        let old = {
            let mut ctl = self.lock();
            if !self.is_current(generation) || !ctl.state.is_active() {
                return;
            }
            let old = self.teardown(&mut ctl);
            self.transition(&mut ctl, ConnectionState::Disconnected);
            old
        };
        if let Some(session) = old {
            session.close();
        }
    }

    fn session_failed(&self, generation: u64, reason: String) {
        if self.is_current(generation) {
            self.fail(reason);
        }
    }
}

impl Drop for NetworkStreamSource {
    fn drop(&mut self) {
        let control = self.control.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = control.session.take() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::session::{ChannelConnector, RemotePeer, WireLayout};
    use super::*;
    use crate::capture::frame::PixelFormat;

    fn source(config: NetworkConfig) -> (Arc<NetworkStreamSource>, flume::Receiver<RemotePeer>) {
        let (connector, peers) = ChannelConnector::new();
        let source = NetworkStreamSource::new(
            config,
            QualityPolicy::default(),
            Arc::new(connector),
            Diagnostics::tracing_only(),
        );
        (source, peers)
    }

    fn gray(width: u32, height: u32) -> IncomingFrame {
        IncomingFrame {
            width,
            height,
            layout: WireLayout::packed_i420(width),
            payload: Bytes::from(vec![128; PixelFormat::I420.buffer_len(width, height)]),
            timestamp: Duration::from_millis(5),
        }
    }

    struct Refuse;

    impl SessionConnector for Refuse {
        fn open(&self, _: &SessionRequest, _: FrameSink) -> Result<Box<dyn StreamSession>> {
            Err(VcamError::ConnectionError("refused".into()))
        }
    }

    #[test]
    fn connect_is_idempotent() {
        let (source, peers) = source(NetworkConfig::default());
        source.connect().unwrap();
        source.connect().unwrap();
        assert_eq!(source.state(), ConnectionState::Connecting);
        assert_eq!(peers.drain().count(), 1);
    }

    #[test]
    fn first_frame_connects_and_publishes() {
        let (source, peers) = source(NetworkConfig::default());
        source.connect().unwrap();
        assert!(source.fetch_latest().unwrap().is_none());

        let peer = peers.try_recv().unwrap();
        assert_eq!(peer.sink.deliver(gray(64, 48)).unwrap(), Some(1));

        let stats = source.stats();
        assert_eq!(stats.state, ConnectionState::Connected);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.current_resolution, Some((64, 48)));
        assert!(stats.connection_duration.is_some());
        let frame = source.fetch_latest().unwrap().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.timestamp, Duration::from_millis(5));
    }

    #[test]
    fn refused_session_enters_error_until_reset() {
        let source = NetworkStreamSource::new(
            NetworkConfig::default(),
            QualityPolicy::default(),
            Arc::new(Refuse),
            Diagnostics::tracing_only(),
        );
        assert!(matches!(source.connect(), Err(VcamError::ConnectionError(_))));
        assert_eq!(source.state(), ConnectionState::Error);

        assert!(matches!(
            source.connect(),
            Err(VcamError::InvalidTransition { from: ConnectionState::Error, .. })
        ));
        source.disconnect();
        assert_eq!(source.state(), ConnectionState::Error);

        source.reset();
        assert_eq!(source.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn frames_from_an_old_session_are_ignored() {
        let (source, peers) = source(NetworkConfig::default());
        source.connect().unwrap();
        let old = peers.try_recv().unwrap();
        source.reconnect().unwrap();
        assert_eq!(source.state(), ConnectionState::Reconnecting);
        let new = peers.try_recv().unwrap();

        assert!(!old.sink.is_current());
        assert_eq!(old.sink.deliver(gray(16, 16)).unwrap(), None);
        assert!(source.last_received_frame().is_none());

        new.sink.established();
        assert_eq!(source.state(), ConnectionState::Connected);
    }

    #[test]
    fn paused_stream_drops_frames() {
        let (source, peers) = source(NetworkConfig::default());
        source.connect().unwrap();
        let peer = peers.try_recv().unwrap();
        peer.sink.deliver(gray(16, 16)).unwrap();

        source.pause();
        assert!(source.fetch_latest().unwrap().is_none());
        assert_eq!(peer.sink.deliver(gray(16, 16)).unwrap(), None);
        source.resume();
        assert!(source.fetch_latest().unwrap().is_some());
        assert_eq!(source.stats().frames_received, 1);
    }

    #[test]
    fn stale_frame_times_out() {
        let config = NetworkConfig {
            stale_frame_timeout_ms: 1,
            ..NetworkConfig::default()
        };
        let (source, peers) = source(config);
        source.connect().unwrap();
        peers.try_recv().unwrap().sink.deliver(gray(16, 16)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(source.fetch_latest(), Err(VcamError::SlotReadTimeout { .. })));
        assert!(source.last_received_frame().is_some());
    }

    #[test]
    fn preset_change_waits_for_next_frame() {
        let (source, peers) = source(NetworkConfig {
            preferred_width: 4096,
            preferred_height: 4096,
            ..NetworkConfig::default()
        });
        source.connect().unwrap();
        let peer = peers.try_recv().unwrap();
        peer.sink.deliver(gray(1280, 720)).unwrap();

        source.set_quality_preset(QualityPreset::Low);
        assert_eq!(source.stats().quality_level, QualityPreset::High);
        assert!(peer.quality.try_recv().is_err());

        peer.sink.deliver(gray(1280, 720)).unwrap();
        assert_eq!(source.stats().quality_level, QualityPreset::Low);
        assert_eq!(peer.quality.try_recv().unwrap(), QualityPreset::Low);
        assert_eq!(source.stats().current_resolution, Some((640, 360)));
    }

    /// Drops and re-establishes the peer whenever the quality changes
    struct Renegotiating(flume::Sender<FrameSink>);

    struct RenegotiatingSession(FrameSink);

    impl SessionConnector for Renegotiating {
        fn open(&self, _: &SessionRequest, sink: FrameSink) -> Result<Box<dyn StreamSession>> {
            let _ = self.0.send(sink.clone());
            Ok(Box::new(RenegotiatingSession(sink)))
        }
    }

    impl StreamSession for RenegotiatingSession {
        fn set_quality(&self, _: QualityPreset) {
            self.0.interrupted();
            self.0.established();
        }

        fn close(&self) {}
    }

    #[test]
    fn session_may_call_back_into_the_sink_on_preset_change() {
        let (sinks, opened) = flume::unbounded();
        let source = NetworkStreamSource::new(
            NetworkConfig::default(),
            QualityPolicy::default(),
            Arc::new(Renegotiating(sinks)),
            Diagnostics::tracing_only(),
        );
        source.connect().unwrap();
        let sink = opened.try_recv().unwrap();
        sink.deliver(gray(64, 48)).unwrap();
        source.set_quality_preset(QualityPreset::Low);

        let (done, delivered) = flume::bounded(1);
        std::thread::spawn(move || {
            let _ = done.send(sink.deliver(gray(64, 48)).unwrap());
        });
        let version = delivered
            .recv_timeout(Duration::from_secs(5))
            .expect("delivery blocked on the control lock");
        assert_eq!(version, Some(2));
        assert_eq!(source.state(), ConnectionState::Connected);
        assert_eq!(source.stats().quality_level, QualityPreset::Low);
    }

    #[test]
    fn remote_close_and_failure_follow_the_state_machine() {
        let (source, peers) = source(NetworkConfig::default());
        source.connect().unwrap();
        let peer = peers.try_recv().unwrap();
        peer.sink.established();
        peer.sink.interrupted();
        assert_eq!(source.state(), ConnectionState::Reconnecting);
        peer.sink.closed();
        assert_eq!(source.state(), ConnectionState::Disconnected);

        source.connect().unwrap();
        peers.try_recv().unwrap().sink.fail("ice failed");
        assert_eq!(source.state(), ConnectionState::Error);
    }

    #[test]
    fn transition_table() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition(Connecting));
        assert!(Reconnecting.can_transition(Disconnected));
        assert!(!Error.can_transition(Connecting));
        assert!(!Error.can_transition(Disconnected));
        assert!(!Disconnected.can_transition(Connected));
    }
}
