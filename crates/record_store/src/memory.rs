//! In-memory record store.
//!
//! Mirrors the Redis semantics the gateway relies on (empty hashes are
//! absent, lists are newest-first and trimmed on push). Used as a test double
//! and for running the gateway without a store.

use crate::error::{Error, Result};
use crate::record::Fields;
use crate::store::RecordStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of the publish tap.
const PUBLISH_BUFFER: usize = 256;

pub struct InMemoryRecordStore {
    /// Insertion-ordered key list, so enumeration order is deterministic.
    order: Mutex<Vec<String>>,
    hashes: DashMap<String, Fields>,
    lists: DashMap<String, VecDeque<String>>,
    available: AtomicBool,
    full_reads: AtomicUsize,
    published: broadcast::Sender<(String, String)>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(PUBLISH_BUFFER);
        Self {
            order: Mutex::new(Vec::new()),
            hashes: DashMap::new(),
            lists: DashMap::new(),
            available: AtomicBool::new(true),
            full_reads: AtomicUsize::new(0),
            published,
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delete a record.
    pub fn remove(&self, key: &str) {
        self.hashes.remove(key);
        self.order_lock().retain(|k| k != key);
    }

    /// Total number of records read by full reads so far.
    pub fn full_reads(&self) -> usize {
        self.full_reads.load(Ordering::SeqCst)
    }

    /// Observe messages passed to [`RecordStore::publish`].
    pub fn published(&self) -> broadcast::Receiver<(String, String)> {
        self.published.subscribe()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("in-memory store offline".to_string()))
        }
    }

    fn order_lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        // A panic while holding the lock cannot leave the Vec half-written.
        self.order.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .order_lock()
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_field_batch(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        self.check()?;
        Ok(keys
            .iter()
            .map(|key| self.hashes.get(key).and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn get_all_batch(&self, keys: &[String]) -> Result<Vec<Option<Fields>>> {
        self.check()?;
        self.full_reads.fetch_add(keys.len(), Ordering::SeqCst);
        Ok(keys
            .iter()
            .map(|key| {
                self.hashes
                    .get(key)
                    .map(|h| h.value().clone())
                    .filter(|h| !h.is_empty())
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Fields>> {
        self.check()?;
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.value().clone())
            .filter(|h| !h.is_empty()))
    }

    async fn insert(&self, key: &str, fields: &Fields) -> Result<()> {
        self.check()?;
        if fields.is_empty() {
            return Err(Error::InvalidRecord(format!("{} has no fields", key)));
        }
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        if entry.is_empty() {
            self.order_lock().push(key.to_string());
        }
        entry.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn push_bounded(&self, list_key: &str, value: &str, max_len: usize) -> Result<()> {
        self.check()?;
        let mut list = self.lists.entry(list_key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(max_len.max(1));
        Ok(())
    }

    async fn list_range(&self, list_key: &str, limit: Option<usize>) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .lists
            .get(list_key)
            .map(|list| {
                let take = limit.unwrap_or(list.len());
                list.iter().take(take).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.check()?;
        Ok(self
            .published
            .send((channel.to_string(), payload.to_string()))
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
