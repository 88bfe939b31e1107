/// Deduplicating async cache.
pub mod async_backed;
/// Chunked per-file read cache.
pub mod content;
/// Bounded pool of content buffers.
pub mod pool;

pub use content::ContentBuffer;
pub use pool::{BufferPool, PoolConfig};
