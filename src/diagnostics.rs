//! Structured diagnostic records for the session logger.
//!
//! The pipeline never writes log files itself. It emits typed
//! [`DiagnosticEvent`]s on a bounded channel that the logging collaborator
//! drains, and mirrors each record to `tracing`. Emitting never blocks: when
//! the channel is full the record is counted as dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::network::quality::QualityPreset;
use crate::network::{ConnectionState, StatisticsReport};
use crate::source::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCategory {
    Session,
    Device,
    Video,
    Photo,
    Orientation,
    Format,
    Metadata,
    Transform,
    General,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    FrameStats {
        frame_count: u64,
        avg_processing_ms: f64,
    },
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    FirstFrame {
        width: u32,
        height: u32,
    },
    ResolutionChanged {
        width: u32,
        height: u32,
    },
    FrameRateUpdated {
        fps: f32,
    },
    QualityPresetChanged {
        from: QualityPreset,
        to: QualityPreset,
        automatic: bool,
    },
    SourceChanged {
        from: SourceKind,
        to: SourceKind,
    },
    NetworkStatistics(StatisticsReport),
    Issue {
        category: LogCategory,
        severity: Severity,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Records buffered before new ones are dropped
    pub channel_capacity: usize,
    /// Emit a `FrameStats` record every this many substituted frames
    pub frame_stats_interval: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            frame_stats_interval: 30,
        }
    }
}

/// Cloneable, non-blocking handle for emitting diagnostic records
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    tx: Option<flume::Sender<DiagnosticEvent>>,
    dropped: Arc<AtomicU64>,
}

impl Diagnostics {
    /// Handle plus the receiving end for the logging collaborator.
    pub fn channel(capacity: usize) -> (Self, flume::Receiver<DiagnosticEvent>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::default(),
            },
            rx,
        )
    }

    /// Records go to `tracing` only.
    pub fn tracing_only() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        trace_event(&event);
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn issue(&self, category: LogCategory, severity: Severity, message: impl Into<String>) {
        self.emit(DiagnosticEvent::Issue {
            category,
            severity,
            message: message.into(),
        });
    }

    /// Records lost to a full or disconnected channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn trace_event(event: &DiagnosticEvent) {
    match event {
        DiagnosticEvent::FrameStats {
            frame_count,
            avg_processing_ms,
        } => debug!(frame_count, avg_processing_ms, "frame statistics"),
        DiagnosticEvent::ConnectionStateChanged { from, to } => {
            info!(?from, ?to, "connection state changed")
        }
        DiagnosticEvent::FirstFrame { width, height } => {
            info!(width, height, "first network frame received")
        }
        DiagnosticEvent::ResolutionChanged { width, height } => {
            info!(width, height, "network resolution changed")
        }
        DiagnosticEvent::FrameRateUpdated { fps } => debug!(fps, "network frame rate updated"),
        DiagnosticEvent::QualityPresetChanged {
            from,
            to,
            automatic,
        } => info!(?from, ?to, automatic, "quality preset changed"),
        DiagnosticEvent::SourceChanged { from, to } => info!(?from, ?to, "frame source changed"),
        DiagnosticEvent::NetworkStatistics(report) => info!(
            state = ?report.state,
            frames_received = report.frames_received,
            fps = report.current_fps,
            quality = ?report.quality_level,
            paused = report.paused,
            "network statistics"
        ),
        DiagnosticEvent::Issue {
            category,
            severity,
            message,
        } => match severity {
            Severity::Error => error!(?category, "{message}"),
            Severity::Warning => warn!(?category, "{message}"),
            Severity::Info => info!(?category, "{message}"),
            Severity::Debug | Severity::Verbose => debug!(?category, "{message}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (diag, rx) = Diagnostics::channel(2);
        for fps in [1.0, 2.0, 3.0] {
            diag.emit(DiagnosticEvent::FrameRateUpdated { fps });
        }
        assert_eq!(diag.dropped(), 1);
        assert_eq!(rx.drain().count(), 2);
    }

    #[test]
    fn tracing_only_handle_never_counts_drops() {
        let diag = Diagnostics::tracing_only();
        diag.issue(LogCategory::Video, Severity::Warning, "decode hiccup");
        assert_eq!(diag.dropped(), 0);
    }

    #[test]
    fn issues_carry_category_and_severity() {
        let (diag, rx) = Diagnostics::channel(4);
        diag.issue(LogCategory::Format, Severity::Error, "bad geometry");
        assert_eq!(
            rx.try_recv().unwrap(),
            DiagnosticEvent::Issue {
                category: LogCategory::Format,
                severity: Severity::Error,
                message: "bad geometry".into(),
            }
        );
    }
}
