//! Record store adapter for the feed gateway.
//!
//! Wraps an opaque keyed store holding hash-like records and exposes the
//! handful of primitives the gateway needs:
//! - key enumeration by class prefix
//! - batched single-field reads and batched full reads
//! - bounded feed lists (newest pushed to the front)
//! - publish / subscribe
//!
//! # Example
//!
//! ```ignore
//! use record_store::{RecordStore, RedisRecordStore};
//!
//! let store = RedisRecordStore::new(vec!["redis://localhost:6379".to_string()])?;
//! store.connect().await?;
//! let keys = store.keys("token/").await?;
//! let stamps = store.get_field_batch(&keys, "createdAt").await?;
//! ```

pub mod backoff;
pub mod error;
pub mod memory;
pub mod record;
pub mod redis_store;
pub mod status;
pub mod store;

pub use backoff::Backoff;
pub use error::{Error, Result};
pub use memory::InMemoryRecordStore;
pub use record::{created_at_value, parse_timestamp, Fields, CREATED_AT_FIELD, PROGRESS_FIELD};
pub use redis_store::{
    escape_glob, redact, PubSubControl, PubSubMessage, PubSubSession, RedisRecordStore, Topic,
};
pub use status::{StatusHandle, UpstreamStatus};
pub use store::RecordStore;
