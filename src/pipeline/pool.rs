//! Bounded pool of reusable frame buffers keyed by geometry and format.
//!
//! One global lock guards a small map of buckets. It is held only for
//! bookkeeping; allocation and reshaping happen outside of it. Buffers go back
//! to their bucket when the [`PooledBuffer`] handle is dropped, so nothing is
//! ever freed while checked out.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capture::frame::{FrameBuffer, FrameKey};
use crate::error::{Result, VcamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum buffers (idle + checked out) per key
    pub per_key_cap: usize,
    /// Maximum buffers across all keys
    pub total_cap: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_key_cap: 3,
            total_cap: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub buckets: usize,
    pub allocations: u64,
    pub reuses: u64,
    pub evictions: u64,
}

struct IdleBuffer {
    frame: FrameBuffer,
    released_at: u64,
}

#[derive(Default)]
struct Bucket {
    /// Ordered by release time, oldest at the front
    idle: VecDeque<IdleBuffer>,
    checked_out: usize,
}

impl Bucket {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out
    }
}

struct PoolState {
    config: PoolConfig,
    buckets: HashMap<FrameKey, Bucket>,
    /// Logical release clock for LRU ordering
    clock: u64,
    allocations: u64,
    reuses: u64,
    evictions: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.buckets.values().map(Bucket::total).sum()
    }

    /// Remove the least-recently-released idle buffer from any bucket.
    fn evict_lru(&mut self) -> Option<FrameBuffer> {
        let victim = self
            .buckets
            .iter()
            .filter_map(|(key, bucket)| bucket.idle.front().map(|b| (*key, b.released_at)))
            .min_by_key(|(_, released_at)| *released_at)
            .map(|(key, _)| key)?;
        let bucket = self.buckets.get_mut(&victim)?;
        let evicted = bucket.idle.pop_front().map(|b| b.frame);
        if bucket.total() == 0 {
            self.buckets.remove(&victim);
        }
        self.evictions += 1;
        evicted
    }
}

enum Plan {
    Reuse(FrameBuffer),
    Reshape(FrameBuffer),
    Allocate,
}

/// Thread-safe frame buffer pool
#[derive(Clone)]
pub struct BufferPool {
    state: Arc<Mutex<PoolState>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").field("stats", &self.stats()).finish()
    }
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                config,
                buckets: HashMap::new(),
                clock: 0,
                allocations: 0,
                reuses: 0,
                evictions: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock_state(&self.state)
    }

    /// Check out a buffer for `key`.
    ///
    /// Reuses an idle buffer of the same key when there is one. Otherwise
    /// allocates, provided the per-key cap allows it; when the pool-wide cap is
    /// reached the least-recently-released idle buffer of another key is
    /// evicted and reshaped instead. In-use buffers are never taken.
    pub fn acquire(&self, key: FrameKey) -> Result<PooledBuffer> {
        key.validate()?;

        let plan = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let per_key_cap = state.config.per_key_cap;
            let total_cap = state.config.total_cap;
            let at_total_cap = state.total() >= total_cap;

            let bucket = state.buckets.entry(key).or_default();
            if let Some(idle) = bucket.idle.pop_back() {
                bucket.checked_out += 1;
                state.reuses += 1;
                Plan::Reuse(idle.frame)
            } else if bucket.total() >= per_key_cap {
                return Err(exhausted(key, "per-key cap reached with every buffer in use"));
            } else if at_total_cap {
                match state.evict_lru() {
                    Some(frame) => {
                        state.buckets.entry(key).or_default().checked_out += 1;
                        Plan::Reshape(frame)
                    }
                    None => {
                        if state.buckets.get(&key).is_some_and(|b| b.total() == 0) {
                            state.buckets.remove(&key);
                        }
                        return Err(exhausted(key, "pool exhausted with every buffer in use"));
                    }
                }
            } else {
                bucket.checked_out += 1;
                state.allocations += 1;
                Plan::Allocate
            }
        };

        let frame = match plan {
            Plan::Reuse(frame) => Ok(frame),
            Plan::Reshape(mut frame) => frame.reshape(key).map(|_| {
                debug!(
                    width = key.width,
                    height = key.height,
                    format = ?key.format,
                    "evicted idle buffer for new key"
                );
                frame
            }),
            Plan::Allocate => FrameBuffer::new(key.format, key.width, key.height),
        };

        match frame {
            Ok(frame) => {
                trace!(
                    width = key.width,
                    height = key.height,
                    format = ?key.format,
                    "buffer checked out"
                );
                Ok(PooledBuffer {
                    frame: Some(frame),
                    pool: Arc::downgrade(&self.state),
                })
            }
            Err(err) => {
                let mut state = self.lock();
                if let Some(bucket) = state.buckets.get_mut(&key) {
                    bucket.checked_out = bucket.checked_out.saturating_sub(1);
                    if bucket.total() == 0 {
                        state.buckets.remove(&key);
                    }
                }
                Err(err)
            }
        }
    }

    /// Explicitly hand a buffer back. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// Lower or raise the per-key cap. Idle buffers above the new cap are
    /// freed now; checked-out ones are freed when they come back.
    pub fn set_per_key_cap(&self, cap: usize) {
        let mut state = self.lock();
        state.config.per_key_cap = cap;
        for bucket in state.buckets.values_mut() {
            while bucket.total() > cap && bucket.idle.pop_front().is_some() {}
        }
        state.buckets.retain(|_, b| b.total() > 0);
    }

    /// Free every idle buffer. Checked-out buffers are untouched.
    pub fn clear_idle(&self) -> usize {
        let mut state = self.lock();
        let mut freed = 0;
        for bucket in state.buckets.values_mut() {
            freed += bucket.idle.len();
            bucket.idle.clear();
        }
        state.buckets.retain(|_, b| b.total() > 0);
        if freed > 0 {
            debug!(freed, "cleared idle pool buffers");
        }
        freed
    }

    pub fn config(&self) -> PoolConfig {
        self.lock().config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.buckets.values().map(|b| b.idle.len()).sum(),
            checked_out: state.buckets.values().map(|b| b.checked_out).sum(),
            buckets: state.buckets.len(),
            allocations: state.allocations,
            reuses: state.reuses,
            evictions: state.evictions,
        }
    }

    /// Idle and checked-out counts for one key.
    pub fn bucket_stats(&self, key: FrameKey) -> (usize, usize) {
        self.lock()
            .buckets
            .get(&key)
            .map(|b| (b.idle.len(), b.checked_out))
            .unwrap_or((0, 0))
    }
}

fn lock_state(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn exhausted(key: FrameKey, reason: &'static str) -> VcamError {
    VcamError::AllocationFailed {
        width: key.width,
        height: key.height,
        format: key.format,
        reason,
    }
}

/// A checked-out frame buffer. Returns to its bucket on drop.
pub struct PooledBuffer {
    frame: Option<FrameBuffer>,
    pool: Weak<Mutex<PoolState>>,
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledBuffer").field(&self.frame).finish()
    }
}

impl Deref for PooledBuffer {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        self.frame.as_ref().expect("pooled frame present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut FrameBuffer {
        self.frame.as_mut().expect("pooled frame present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let (Some(frame), Some(pool)) = (self.frame.take(), self.pool.upgrade()) else {
            return;
        };
        let mut guard = lock_state(&pool);
        let state = &mut *guard;
        let key = frame.key();
        state.clock += 1;
        let released_at = state.clock;
        let per_key_cap = state.config.per_key_cap;
        let over_total = state.total() > state.config.total_cap;

        let Some(bucket) = state.buckets.get_mut(&key) else {
            return;
        };
        bucket.checked_out = bucket.checked_out.saturating_sub(1);
        if bucket.total() >= per_key_cap || over_total {
            // Over a lowered cap: free instead of keeping
            if bucket.total() == 0 {
                state.buckets.remove(&key);
            }
            return;
        }
        bucket.idle.push_back(IdleBuffer { frame, released_at });
        trace!(width = key.width, height = key.height, "buffer returned to pool");
    }
}
