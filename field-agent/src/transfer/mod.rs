//! Batched transfer protocol: planning, archives, and the sync engine.

pub mod archive;
pub mod batch;
pub mod counting_stream;
pub mod engine;

pub use batch::{plan_batches, Batch, DEFAULT_BATCH_CEILING};
pub use engine::{SyncEngine, SyncResult, SyncSettings, DEFAULT_MAX_CONCURRENT_BATCHES};
