//! Frame pipeline building blocks: buffer reuse, conversion and the
//! latest-frame handoff between the network thread and the capture tick.

pub mod convert;
pub mod pool;
pub mod slot;

pub use convert::{ContentRect, FormatConverter};
pub use pool::{BufferPool, PoolConfig, PoolStats, PooledBuffer};
pub use slot::{NetworkFrameSlot, SlotSnapshot};
