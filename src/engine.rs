//! Per-tick frame substitution.
//!
//! The capture pipeline calls [`SubstitutionEngine::produce_frame`] once per
//! captured frame. The engine either hands back a pool buffer holding the
//! alternate frame in exactly the geometry and format the host expects, or
//! tells the caller to pass its own frame through. Nothing on this path blocks
//! on I/O or decoding, and no per-frame failure escapes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::frame::{AspectPolicy, CaptureTick, FormatDescriptor, FrameBuffer};
use crate::diagnostics::{DiagnosticEvent, Diagnostics, LogCategory, Severity};
use crate::error::{Result, VcamError};
use crate::network::NetworkStreamSource;
use crate::pipeline::convert::FormatConverter;
use crate::pipeline::pool::{BufferPool, PoolConfig, PooledBuffer};
use crate::source::clip::{ClipOptions, FileClipSource, PlaybackClock};
use crate::source::{
    FrameSourceAdapter, FrameSourceState, SourceConfig, SourceKind, StillImageSource,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master on/off switch
    pub enabled: bool,
    pub preserve_aspect_ratio: bool,
    /// Mirror on top of whatever the capture connection asks for
    pub mirror_output: bool,
    /// Pace clip playback by capture timestamps instead of wall time
    pub match_capture_fps: bool,
    /// Pre-scale still and clip frames to fit this size when decoding
    pub target_resolution: Option<(u32, u32)>,
    pub processing_ema_alpha: f64,
    /// Letterbox color
    pub fill: [u8; 3],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preserve_aspect_ratio: true,
            mirror_output: false,
            match_capture_fps: false,
            target_resolution: None,
            processing_ema_alpha: 0.1,
            fill: [0, 0, 0],
        }
    }
}

/// Outcome of one capture tick
#[derive(Debug)]
pub enum Substitution<'a> {
    /// Use this frame instead of the camera's. Valid until the next call.
    Replaced(&'a FrameBuffer),
    PassThrough(PassReason),
}

impl Substitution<'_> {
    pub fn is_replaced(&self) -> bool {
        matches!(self, Self::Replaced(_))
    }
}

#[derive(Debug)]
pub enum PassReason {
    Disabled,
    NoSource,
    /// The source has nothing ready yet
    NoFrame,
    /// A per-frame failure, already logged
    Failed(VcamError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStats {
    /// Frames substituted since the last reset
    pub frame_count: u64,
    pub pass_through_count: u64,
    /// Moving average of `produce_frame` time for substituted frames
    pub average_processing_ms: f64,
    /// Geometry the host asked for most recently
    pub original_resolution: Option<(u32, u32)>,
    /// Capture timestamp of the last substituted frame
    pub last_frame_time: Option<Duration>,
}

impl EngineStats {
    pub fn average_processing_time(&self) -> Duration {
        Duration::from_secs_f64(self.average_processing_ms.max(0.0) / 1000.0)
    }
}

pub struct SubstitutionEngine {
    config: EngineConfig,
    enabled: AtomicBool,
    pool: BufferPool,
    converter: FormatConverter,
    source: Option<FrameSourceAdapter>,
    /// Buffer handed out by the previous tick
    in_flight: Option<PooledBuffer>,
    diagnostics: Diagnostics,
    stats_interval: u64,
    stats: EngineStats,
}

impl std::fmt::Debug for SubstitutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubstitutionEngine")
            .field("enabled", &self.is_enabled())
            .field("source", &self.source)
            .field("stats", &self.stats)
            .finish()
    }
}

impl SubstitutionEngine {
    pub fn new(config: EngineConfig, pool: PoolConfig, diagnostics: Diagnostics) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            converter: FormatConverter::new(config.fill),
            config,
            pool: BufferPool::new(pool),
            source: None,
            in_flight: None,
            diagnostics,
            stats_interval: 30,
            stats: EngineStats::default(),
        }
    }

    /// Emit a `FrameStats` record every `interval` substituted frames.
    pub fn with_stats_interval(mut self, interval: u64) -> Self {
        self.stats_interval = interval.max(1);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Master switch. Safe to flip from any thread holding a shared reference.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!(enabled, "substitution toggled");
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.as_ref().map_or(SourceKind::None, FrameSourceAdapter::kind)
    }

    pub fn source_state(&self) -> FrameSourceState {
        self.source
            .as_ref()
            .map_or(FrameSourceState::Idle, FrameSourceAdapter::state)
    }

    /// Produce the replacement for one captured frame.
    ///
    /// The previous tick's buffer goes back to the pool first, so the returned
    /// reference must not be held across calls.
    pub fn produce_frame(&mut self, tick: &CaptureTick) -> Substitution<'_> {
        let started = Instant::now();
        self.in_flight = None;
        self.stats.original_resolution = Some((tick.format.width, tick.format.height));

        if !self.is_enabled() {
            return self.pass(PassReason::Disabled);
        }

        let fetched = self.source.as_mut().map(|source| source.fetch_latest(tick));
        let frame = match fetched {
            None => return self.pass(PassReason::NoSource),
            Some(Ok(Some(frame))) => frame,
            Some(Ok(None)) => return self.pass(PassReason::NoFrame),
            Some(Err(err)) => return self.fail(err),
        };

        let target = self.target(&tick.format);
        let mut buffer = match self.pool.acquire(target.key()) {
            Ok(buffer) => buffer,
            Err(err) => return self.fail(err),
        };
        if let Err(err) = self.converter.adapt(&frame, &mut buffer, &target) {
            return self.fail(err);
        }

        // Host timing is authoritative, never the source frame's own
        buffer.timestamp = tick.timestamp;
        self.stats.frame_count += 1;
        buffer.sequence = self.stats.frame_count;
        self.stats.last_frame_time = Some(tick.timestamp);
        self.record_processing_time(started.elapsed());

        trace!(
            sequence = buffer.sequence,
            width = target.width,
            height = target.height,
            format = ?target.pixel_format,
            "frame substituted"
        );
        Substitution::Replaced(&**self.in_flight.insert(buffer))
    }

    fn target(&self, expected: &FormatDescriptor) -> FormatDescriptor {
        let aspect = if self.config.preserve_aspect_ratio {
            AspectPolicy::Preserve
        } else {
            AspectPolicy::Stretch
        };
        expected
            .with_aspect(aspect)
            .with_mirrored(expected.mirrored || self.config.mirror_output)
    }

    fn record_processing_time(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let alpha = self.config.processing_ema_alpha;
        self.stats.average_processing_ms = if self.stats.frame_count <= 1 {
            ms
        } else {
            alpha * ms + (1.0 - alpha) * self.stats.average_processing_ms
        };

        counter!("vcam_frames_substituted").increment(1);
        histogram!("vcam_processing_time_us").record(elapsed.as_micros() as f64);

        if self.stats.frame_count % self.stats_interval == 0 {
            self.diagnostics.emit(DiagnosticEvent::FrameStats {
                frame_count: self.stats.frame_count,
                avg_processing_ms: self.stats.average_processing_ms,
            });
        }
    }

    fn pass(&mut self, reason: PassReason) -> Substitution<'_> {
        self.stats.pass_through_count += 1;
        counter!("vcam_frames_passed_through").increment(1);
        Substitution::PassThrough(reason)
    }

    fn fail(&mut self, err: VcamError) -> Substitution<'_> {
        let (category, severity) = match &err {
            VcamError::SlotReadTimeout { .. } => (LogCategory::Video, Severity::Debug),
            VcamError::InvalidGeometry { .. } | VcamError::UnsupportedFormat(_) => {
                (LogCategory::Format, Severity::Warning)
            }
            _ => (LogCategory::Video, Severity::Warning),
        };
        if severity == Severity::Debug {
            debug!(%err, "no fresh frame, passing through");
        } else {
            warn!(%err, "substitution failed, passing through");
        }
        self.diagnostics.issue(category, severity, err.to_string());
        self.pass(PassReason::Failed(err))
    }

    /// Swap the active source. The previous tick's buffer and all idle
    /// buffers are released, so nothing of the old source is handed out again.
    pub fn set_source(&mut self, source: Option<FrameSourceAdapter>) {
        let from = self.source_kind();
        self.in_flight = None;
        self.source = source;
        self.pool.clear_idle();
        let to = self.source_kind();
        self.diagnostics.emit(DiagnosticEvent::SourceChanged { from, to });
    }

    /// Build and install the source described by `config`.
    ///
    /// Opening failures (missing file, empty clip, no network handle) are
    /// returned and leave the current source in place.
    #[instrument(skip_all, fields(kind = ?config.kind))]
    pub fn open_source(
        &mut self,
        config: &SourceConfig,
        network: Option<Arc<NetworkStreamSource>>,
    ) -> Result<()> {
        let path = || {
            config
                .path
                .as_deref()
                .ok_or_else(|| VcamError::Config(format!("{:?} source needs a path", config.kind)))
        };

        let source = match config.kind {
            SourceKind::None => None,
            SourceKind::Still => Some(FrameSourceAdapter::Still(StillImageSource::open(
                path()?,
                self.config.target_resolution,
            )?)),
            SourceKind::Clip => {
                let options = ClipOptions {
                    fps: config.fps,
                    end_policy: config.end_policy,
                    clock: if self.config.match_capture_fps {
                        PlaybackClock::Capture
                    } else {
                        PlaybackClock::Wall
                    },
                    read_ahead: config.read_ahead,
                    max_resolution: self.config.target_resolution,
                };
                Some(FrameSourceAdapter::Clip(FileClipSource::open(
                    path()?,
                    options,
                    self.diagnostics.clone(),
                )?))
            }
            SourceKind::Network => {
                let network = network.ok_or_else(|| {
                    VcamError::Config("network source needs a stream handle".into())
                })?;
                Some(FrameSourceAdapter::Network(network))
            }
        };
        self.set_source(source);
        Ok(())
    }

    /// Source type changed upstream: drop cached decodes and idle buffers.
    pub fn source_changed(&mut self) {
        self.clear_cache();
    }

    /// Free idle pool buffers. A still or clip source holds nothing but its
    /// decoded frames, so it is detached and the engine goes back to `Idle`
    /// until a source is opened again. A network source stays attached.
    pub fn clear_cache(&mut self) {
        self.in_flight = None;
        let freed = self.pool.clear_idle();
        let file_backed = self
            .source
            .as_ref()
            .is_some_and(|source| source.kind() != SourceKind::Network);
        if file_backed {
            self.set_source(None);
        }
        debug!(freed, detached = file_backed, "engine cache cleared");
    }

    /// Zero the statistics and return every pooled buffer to idle.
    pub fn reset_state(&mut self) {
        self.in_flight = None;
        self.stats = EngineStats::default();
        debug!("engine state reset");
    }
}
