// Buffer management: frames, guards, and the clock-sweep pool.

pub mod frame;
pub mod pool;

pub use frame::{BufferFrame, FrameGuard, FrameId, PageReadGuard, PageWriteGuard};
pub use pool::{BufferPool, BufferPoolStats};
