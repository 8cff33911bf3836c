//! "Latest K records" over an unindexed key space.
//!
//! Hash-backed classes are ranked in two passes: a cheap batched read of the
//! creation timestamp of every key, then a full read of the K winners only.
//! List-backed feeds already hold full records and are ranked in one pass.

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, histogram};
use record_store::{
    created_at_value, parse_timestamp, Fields, RecordStore, CREATED_AT_FIELD, PROGRESS_FIELD,
};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a class's records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    /// One hash per record, keys sharing a prefix.
    Hashes { prefix: String },
    /// A bounded list of JSON-serialized records, newest at the head.
    List { key: String },
}

/// A ranked record with normalized output fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRecord {
    pub key: String,
    /// Canonical creation time.
    pub created_at: DateTime<Utc>,
    pub progress: f64,
    pub fields: Fields,
}

/// Field names the normalized output writes itself.
const NORMALIZED_FIELDS: [&str; 4] = ["key", "created_at", CREATED_AT_FIELD, PROGRESS_FIELD];

impl RankedRecord {
    fn from_fields(key: String, fields: Fields, now: DateTime<Utc>) -> Self {
        let created_at = created_at_value(&fields)
            .and_then(parse_timestamp)
            .unwrap_or(now);
        let progress = fields
            .get(PROGRESS_FIELD)
            .and_then(|p| p.trim().parse::<f64>().ok())
            .filter(|p| p.is_finite())
            .unwrap_or(0.0);
        Self {
            key,
            created_at,
            progress,
            fields,
        }
    }

    fn created_at_string(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl Serialize for RankedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        let mut names: Vec<&String> = self
            .fields
            .keys()
            .filter(|k| !NORMALIZED_FIELDS.contains(&k.as_str()))
            .collect();
        names.sort();
        for name in names {
            map.serialize_entry(name, &self.fields[name])?;
        }

        let created_at = self.created_at_string();
        map.serialize_entry("key", &self.key)?;
        map.serialize_entry("created_at", &created_at)?;
        map.serialize_entry(CREATED_AT_FIELD, &created_at)?;
        map.serialize_entry(PROGRESS_FIELD, &self.progress)?;
        map.end()
    }
}

/// Response envelope for latest-records queries.
#[derive(Debug, Clone, Serialize)]
pub struct RankedFeed {
    pub success: bool,
    pub data: Vec<RankedRecord>,
    pub count: usize,
    pub timestamp: String,
    #[serde(rename = "responseTime")]
    pub response_time: String,
    /// Corpus size the ranking ran over.
    #[serde(rename = "totalRecords")]
    pub total_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pick the `k` newest keys. Ties keep enumeration order.
pub fn top_k(mut candidates: Vec<(String, i64)>, k: usize) -> Vec<String> {
    candidates.sort_by_key(|(_, ts)| Reverse(*ts));
    candidates.into_iter().take(k).map(|(key, _)| key).collect()
}

pub struct FreshnessRanker {
    store: Arc<dyn RecordStore>,
}

impl FreshnessRanker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// The `k` most recently created records of `source`, newest first.
    ///
    /// Never fails: store errors yield `success: false` with no data.
    pub async fn rank_latest(&self, source: &FeedSource, k: usize) -> RankedFeed {
        let started = Instant::now();
        let now = Utc::now();
        counter!("gateway_rank_requests_total").increment(1);

        let result = match source {
            FeedSource::Hashes { prefix } => self.rank_hashes(prefix, k, now).await,
            FeedSource::List { key } => self.rank_list(key, k, now).await,
        };

        let elapsed = started.elapsed();
        histogram!("gateway_rank_duration_seconds").record(elapsed.as_secs_f64());

        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let response_time = format!("{}ms", elapsed.as_millis());

        match result {
            Ok((data, total_records)) => {
                info!(
                    "Got {} latest records in {} from {} total",
                    data.len(),
                    response_time,
                    total_records
                );
                RankedFeed {
                    success: true,
                    count: data.len(),
                    data,
                    timestamp,
                    response_time,
                    total_records,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Ranking {:?} failed: {}", source, e);
                counter!("gateway_rank_failures_total").increment(1);
                RankedFeed {
                    success: false,
                    data: Vec::new(),
                    count: 0,
                    timestamp,
                    response_time,
                    total_records: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn rank_hashes(
        &self,
        prefix: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> record_store::Result<(Vec<RankedRecord>, usize)> {
        let keys = self.store.keys(prefix).await?;
        let total = keys.len();
        if keys.is_empty() || k == 0 {
            return Ok((Vec::new(), total));
        }

        // Phase 1: timestamps only. Missing or unparseable sorts as "now".
        let stamps = self.store.get_field_batch(&keys, CREATED_AT_FIELD).await?;
        let now_ms = now.timestamp_millis();
        let candidates: Vec<(String, i64)> = keys
            .into_iter()
            .zip(stamps)
            .map(|(key, raw)| {
                let ts = raw
                    .as_deref()
                    .and_then(parse_timestamp)
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(now_ms);
                (key, ts)
            })
            .collect();

        let winners = top_k(candidates, k);
        debug!("Sorted {} keys under {}, fetching {}", total, prefix, winners.len());

        // Phase 2: full records for the winners only. Records deleted in
        // between come back empty and are dropped.
        let records = self.store.get_all_batch(&winners).await?;
        let ranked = winners
            .into_iter()
            .zip(records)
            .filter_map(|(key, fields)| match fields {
                Some(fields) => Some(RankedRecord::from_fields(key, fields, now)),
                None => {
                    debug!("Record {} vanished between ranking passes", key);
                    None
                }
            })
            .collect();

        Ok((ranked, total))
    }

    async fn rank_list(
        &self,
        list_key: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> record_store::Result<(Vec<RankedRecord>, usize)> {
        let entries = self.store.list_range(list_key, None).await?;
        let total = entries.len();

        let mut records: Vec<RankedRecord> = entries
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| match decode_list_entry(raw) {
                Some(fields) => {
                    let key = fields
                        .get("key")
                        .cloned()
                        .unwrap_or_else(|| format!("{}:{}", list_key, index));
                    Some(RankedRecord::from_fields(key, fields, now))
                }
                None => {
                    warn!("Skipping malformed entry {} in {}", index, list_key);
                    None
                }
            })
            .collect();

        records.sort_by_key(|r| Reverse(r.created_at));
        records.truncate(k);
        Ok((records, total))
    }
}

/// Decode one JSON object from a feed list into a string field map.
/// Non-string scalars are stringified; empty objects count as absent.
fn decode_list_entry(raw: &str) -> Option<Fields> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let fields: Fields = object
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

/// Serialize a field map for pushing onto a feed list.
pub fn encode_list_entry(key: &str, fields: &Fields) -> serde_json::Result<String> {
    let mut object: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    object.insert("key".to_string(), serde_json::Value::String(key.to_string()));
    serde_json::to_string(&object)
}
