//! The record store seam used by the ranking and diagnostic paths.

use crate::error::Result;
use crate::record::Fields;
use async_trait::async_trait;

/// Opaque keyed store of hash-like records.
///
/// Batched reads return one slot per requested key, in request order. A
/// slot is `None` when the key is missing, unreadable, or (for full reads)
/// holds zero fields.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Enumerate every key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read one field from each key in a single round trip.
    async fn get_field_batch(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>>;

    /// Read the full field map of each key in a single round trip.
    async fn get_all_batch(&self, keys: &[String]) -> Result<Vec<Option<Fields>>>;

    /// Read one record. `None` when the record has no fields.
    async fn get(&self, key: &str) -> Result<Option<Fields>>;

    /// Write (or overwrite) fields of a hash record.
    async fn insert(&self, key: &str, fields: &Fields) -> Result<()>;

    /// Push a serialized record to the front of a list, trimming it to `max_len`.
    async fn push_bounded(&self, list_key: &str, value: &str, max_len: usize) -> Result<()>;

    /// Read up to `limit` entries from the front of a list (all when `None`).
    async fn list_range(&self, list_key: &str, limit: Option<usize>) -> Result<Vec<String>>;

    /// Publish a message on a pub/sub channel. Returns the receiver count.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;
}
