//! Seam between the stream source and whatever transport delivers frames.
//!
//! Session establishment (signaling, ICE, codecs) lives behind
//! [`SessionConnector`]. A connector gets a [`FrameSink`] and pushes decoded
//! frames and lifecycle notifications into it from any thread.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;

use super::quality::QualityPreset;
use super::NetworkStreamSource;
use crate::error::{Result, VcamError};

/// What the connector is asked to establish
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub server_url: String,
    pub room_id: String,
    pub resolution: (u32, u32),
    pub fps: f32,
    pub preset: QualityPreset,
}

/// Memory layout of an incoming frame's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireLayout {
    I420 {
        y_stride: usize,
        u_stride: usize,
        v_stride: usize,
    },
    Nv12 {
        y_stride: usize,
        uv_stride: usize,
    },
    Rgb24 {
        stride: usize,
    },
    Bgra32 {
        stride: usize,
    },
    /// One complete JPEG image
    Mjpeg,
}

impl WireLayout {
    pub fn packed_i420(width: u32) -> Self {
        let chroma = (width as usize + 1) / 2;
        Self::I420 {
            y_stride: width as usize,
            u_stride: chroma,
            v_stride: chroma,
        }
    }
}

/// A frame as handed over by the transport, before normalization
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    pub width: u32,
    pub height: u32,
    pub layout: WireLayout,
    pub payload: Bytes,
    /// Sender-side timestamp, informational only
    pub timestamp: Duration,
}

/// A live transport session. The source never holds its own lock while
/// calling in, so implementations may call back into their [`FrameSink`].
pub trait StreamSession: Send + Sync {
    /// Ask the remote peer for a different resolution/frame-rate budget.
    fn set_quality(&self, preset: QualityPreset);

    fn close(&self);
}

pub trait SessionConnector: Send + Sync {
    fn open(&self, request: &SessionRequest, sink: FrameSink) -> Result<Box<dyn StreamSession>>;
}

/// Delivery handle for one session.
///
/// Sinks are tied to the session they were created for: once that session is
/// torn down, everything pushed into the sink is ignored.
#[derive(Clone)]
pub struct FrameSink {
    source: Weak<NetworkStreamSource>,
    generation: u64,
}

impl FrameSink {
    pub(crate) fn new(source: &Arc<NetworkStreamSource>, generation: u64) -> Self {
        Self {
            source: Arc::downgrade(source),
            generation,
        }
    }

    fn source(&self) -> Result<Arc<NetworkStreamSource>> {
        self.source
            .upgrade()
            .ok_or_else(|| VcamError::ConnectionError("stream source dropped".into()))
    }

    /// Normalize and publish a frame. Returns the slot version it landed in,
    /// or `None` when the frame was discarded (stale session, paused).
    pub fn deliver(&self, frame: IncomingFrame) -> Result<Option<u64>> {
        self.source()?.deliver(self.generation, frame)
    }

    /// The transport finished negotiating.
    pub fn established(&self) {
        if let Ok(source) = self.source() {
            source.session_established(self.generation);
        }
    }

    /// The transport lost the peer and is trying to get it back.
    pub fn interrupted(&self) {
        if let Ok(source) = self.source() {
            source.session_interrupted(self.generation);
        }
    }

    /// The remote side ended the session.
    pub fn closed(&self) {
        if let Ok(source) = self.source() {
            source.session_closed(self.generation);
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        if let Ok(source) = self.source() {
            source.session_failed(self.generation, reason.into());
        }
    }

    pub fn is_current(&self) -> bool {
        self.source()
            .is_ok_and(|source| source.generation() == self.generation)
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// The transport side of a [`ChannelConnector`] session
#[derive(Debug)]
pub struct RemotePeer {
    pub request: SessionRequest,
    pub sink: FrameSink,
    /// Quality hints sent by the source
    pub quality: flume::Receiver<QualityPreset>,
}

/// Connector that hands every opened session to a channel, for in-process
/// producers such as synthetic feeds and tests.
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    peers: flume::Sender<RemotePeer>,
}

impl ChannelConnector {
    pub fn new() -> (Self, flume::Receiver<RemotePeer>) {
        let (peers, rx) = flume::unbounded();
        (Self { peers }, rx)
    }
}

impl SessionConnector for ChannelConnector {
    fn open(&self, request: &SessionRequest, sink: FrameSink) -> Result<Box<dyn StreamSession>> {
        let (quality_tx, quality_rx) = flume::unbounded();
        self.peers
            .send(RemotePeer {
                request: request.clone(),
                sink,
                quality: quality_rx,
            })
            .map_err(|_| VcamError::ConnectionError("no peer is listening".into()))?;
        Ok(Box::new(ChannelSession {
            quality: Mutex::new(Some(quality_tx)),
        }))
    }
}

struct ChannelSession {
    quality: Mutex<Option<flume::Sender<QualityPreset>>>,
}

impl ChannelSession {
    fn sender(&self) -> MutexGuard<'_, Option<flume::Sender<QualityPreset>>> {
        self.quality.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamSession for ChannelSession {
    fn set_quality(&self, preset: QualityPreset) {
        if let Some(tx) = self.sender().as_ref() {
            let _ = tx.send(preset);
        }
    }

    fn close(&self) {
        self.sender().take();
    }
}
