//! Concurrency primitives shared across the storage core (§4.4, §5):
//! the wait-free in-memory WAL buffer, striped key locks for write
//! serialization, and rate limiting for snapshot transfer and index
//! rebuild.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod log_buffer;
mod mem_lock;
mod rate_limiter;

pub use log_buffer::{AtomicLogBuffer, LogBufferIterator, Record, MAX_LENGTH};
pub use mem_lock::{LockGuard, MemLock};
pub use rate_limiter::TokenBucket;
