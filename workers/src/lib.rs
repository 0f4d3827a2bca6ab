//! The queue-draining side of quill: long-lived workers that claim tasks
//! from the store and run them end to end, plus the pool that supervises
//! them and the reaper that rescues hung claims.

mod pool;
mod worker;

pub use pool::WorkerPool;
pub use worker::Worker;
