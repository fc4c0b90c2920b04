//! Single-slot latest-frame register for the network → engine handoff

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::frame::FrameBuffer;

/// A published frame and the version it was published under
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub version: u64,
    pub frame: Arc<FrameBuffer>,
}

/// Version-stamped register holding only the most recent frame.
///
/// The writer never touches a frame once it is published: each publish
/// installs a new `Arc`, so a reader holding a snapshot keeps a complete frame
/// no matter how many publishes happen meanwhile. Reads and writes are a single
/// atomic pointer swap and never block each other.
pub struct NetworkFrameSlot {
    current: ArcSwapOption<SlotSnapshot>,

    /// Frame displaced by the last publish, kept for reuse by the writer
    /// once no reader holds it any more.
    recycled: ArcSwapOption<FrameBuffer>,

    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    version: AtomicU64,
    frames_read: AtomicU64,
    frames_overwritten: AtomicU64,
}

impl Default for NetworkFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkFrameSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            recycled: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: install a new latest frame and return its version.
    pub fn publish(&self, frame: FrameBuffer) -> u64 {
        let version = self.stats.version.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(SlotSnapshot {
            version,
            frame: Arc::new(frame),
        });

        if let Some(previous) = self.current.swap(Some(snapshot)) {
            self.stats.frames_overwritten.fetch_add(1, Ordering::Relaxed);
            // Unread snapshots hand their frame back for reuse
            if let Ok(previous) = Arc::try_unwrap(previous) {
                self.recycled.store(Some(previous.frame));
            }
        }
        version
    }

    /// Consumer: the latest complete frame, if any has been published.
    pub fn read(&self) -> Option<SlotSnapshot> {
        let snapshot = self.current.load_full()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(SlotSnapshot::clone(&snapshot))
    }

    /// Producer: take back a previously displaced frame that nobody reads any
    /// more, so the next conversion can write into it instead of allocating.
    pub fn take_recycled(&self) -> Option<FrameBuffer> {
        let frame = self.recycled.swap(None)?;
        Arc::try_unwrap(frame).ok()
    }

    /// Version of the latest publish; 0 until the first frame arrives.
    pub fn version(&self) -> u64 {
        self.stats.version.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_none()
    }

    pub fn clear(&self) {
        self.current.store(None);
        self.recycled.store(None);
    }

    /// (published, read, overwritten)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.version.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_overwritten.load(Ordering::Relaxed),
        )
    }
}
