//! Alternate frame sources the engine can substitute from.
//!
//! Every variant answers `fetch_latest` without blocking the capture tick:
//! either a complete frame is ready, or the caller is told there is none and
//! passes the camera frame through.

pub mod clip;
pub mod still;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{CaptureTick, FrameBuffer};
use crate::error::Result;
use crate::network::{NetworkStreamSource, SessionId};

pub use clip::{ClipEndPolicy, ClipOptions, FileClipSource, PlaybackClock};
pub use still::StillImageSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    None,
    Still,
    Clip,
    Network,
}

/// Which source to substitute from, and how to open it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Still image file, or directory of clip frames
    pub path: Option<PathBuf>,
    /// Native frame rate of a clip
    pub fps: f32,
    pub end_policy: ClipEndPolicy,
    pub read_ahead: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::None,
            path: None,
            fps: 30.0,
            end_policy: ClipEndPolicy::Loop,
            read_ahead: 4,
        }
    }
}

/// What the engine is currently substituting from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSourceState {
    Idle,
    LoadingStill(Option<PathBuf>),
    PlayingClip { path: PathBuf, position: Option<u64> },
    StreamingNetwork(Option<SessionId>),
}

/// The active frame source. Owned exclusively by the engine and swapped whole.
pub enum FrameSourceAdapter {
    Still(StillImageSource),
    Clip(FileClipSource),
    /// The engine only holds a shared handle; the network source owns its session.
    Network(Arc<NetworkStreamSource>),
}

impl FrameSourceAdapter {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Still(_) => SourceKind::Still,
            Self::Clip(_) => SourceKind::Clip,
            Self::Network(_) => SourceKind::Network,
        }
    }

    pub fn state(&self) -> FrameSourceState {
        match self {
            Self::Still(still) => FrameSourceState::LoadingStill(still.path().map(Into::into)),
            Self::Clip(clip) => FrameSourceState::PlayingClip {
                path: clip.path().to_path_buf(),
                position: clip.position(),
            },
            Self::Network(net) => FrameSourceState::StreamingNetwork(net.session_id()),
        }
    }

    /// Latest frame to substitute, `Ok(None)` when nothing is ready yet.
    pub fn fetch_latest(&mut self, tick: &CaptureTick) -> Result<Option<Arc<FrameBuffer>>> {
        match self {
            Self::Still(still) => Ok(Some(still.fetch_latest())),
            Self::Clip(clip) => Ok(clip.fetch_latest(tick)),
            Self::Network(net) => net.fetch_latest(),
        }
    }
}

impl std::fmt::Debug for FrameSourceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FrameSourceAdapter").field(&self.state()).finish()
    }
}
