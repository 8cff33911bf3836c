//! Redis-backed record store.
//!
//! Records are Redis hashes keyed `{class_prefix}{id}`; the optional feed is a
//! Redis list of JSON objects with the newest entry at the head. Commands go
//! through a `ConnectionManager`, notifications through a dedicated async
//! pub/sub connection opened per [`PubSubSession`].

use crate::error::{Error, Result};
use crate::record::Fields;
use crate::status::{StatusHandle, UpstreamStatus};
use crate::store::RecordStore;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, RedisError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A live store connection and the endpoint it was opened against.
#[derive(Clone)]
struct ActiveConnection {
    endpoint: String,
    client: redis::Client,
    conn: ConnectionManager,
}

/// Redis record store with an ordered list of fallback endpoints.
pub struct RedisRecordStore {
    endpoints: Vec<String>,
    enable_keyspace_events: bool,
    active: RwLock<Option<ActiveConnection>>,
    status: StatusHandle,
}

impl RedisRecordStore {
    /// Create a store over `endpoints`, tried in order on every connect.
    /// Does not connect.
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Unavailable("no store endpoints configured".to_string()));
        }
        // Reject malformed URLs up front rather than on every retry.
        for endpoint in &endpoints {
            redis::Client::open(endpoint.as_str())?;
        }
        Ok(Self {
            endpoints,
            enable_keyspace_events: true,
            active: RwLock::new(None),
            status: StatusHandle::new(),
        })
    }

    /// Toggle `CONFIG SET notify-keyspace-events` after connecting.
    pub fn with_keyspace_events(mut self, enable: bool) -> Self {
        self.enable_keyspace_events = enable;
        self
    }

    /// Status cell for this store's command connection.
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Endpoint of the current connection, redacted.
    pub async fn endpoint(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| redact(&a.endpoint))
    }

    /// Try each endpoint once, in order. First success wins.
    pub async fn connect(&self) -> Result<String> {
        for endpoint in &self.endpoints {
            let shown = redact(endpoint);
            info!("Trying store endpoint {}", shown);

            match self.open(endpoint).await {
                Ok(active) => {
                    *self.active.write().await = Some(active);
                    self.status.set(UpstreamStatus::Connected {
                        endpoint: shown.clone(),
                    });
                    info!("Connected to store at {}", shown);
                    return Ok(shown);
                }
                Err(e) => {
                    warn!("Store endpoint {} failed: {}", shown, e);
                }
            }
        }

        Err(Error::Unavailable(format!(
            "all {} store endpoints failed",
            self.endpoints.len()
        )))
    }

    /// Drop the current connection. The next [`Self::connect`] walks the
    /// endpoint list from the top again.
    pub async fn disconnect(&self) {
        if let Some(active) = self.active.write().await.take() {
            info!("Dropped store connection to {}", redact(&active.endpoint));
        }
    }

    /// Open a dedicated pub/sub connection against the current endpoint.
    pub async fn open_pubsub(&self) -> Result<PubSubSession> {
        let active = self
            .active
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Unavailable("store not connected".to_string()))?;

        let pubsub = active.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();
        debug!("Opened pub/sub connection to {}", redact(&active.endpoint));

        let messages = stream
            .filter_map(|msg| async move {
                let payload = match msg.get_payload::<String>() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Dropping undecodable pub/sub payload: {}", e);
                        return None;
                    }
                };
                let pattern = if msg.from_pattern() {
                    msg.get_pattern::<String>().ok()
                } else {
                    None
                };
                Some(PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    pattern,
                    payload,
                })
            })
            .boxed();

        Ok(PubSubSession {
            control: PubSubControl { sink },
            messages,
        })
    }

    async fn open(&self, endpoint: &str) -> Result<ActiveConnection> {
        let client = redis::Client::open(endpoint)?;

        // Single-shot probe so a dead endpoint fails fast and the next one is
        // tried; the manager's own retries only apply once connected.
        let mut probe = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut probe).await?;

        if self.enable_keyspace_events {
            let res: redis::RedisResult<()> = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("KEA")
                .query_async(&mut probe)
                .await;
            if let Err(e) = res {
                warn!(
                    "Could not enable keyspace notifications on {}: {}",
                    redact(endpoint),
                    e
                );
            }
        }

        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(ActiveConnection {
            endpoint: endpoint.to_string(),
            client,
            conn,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| a.conn.clone())
            .ok_or_else(|| Error::Unavailable("store not connected".to_string()))
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let keys: Vec<String> = conn.keys(&pattern).await?;
        Ok(keys)
    }

    async fn get_field_batch(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hget(key, field);
        }

        let batch: redis::RedisResult<Vec<Option<String>>> = pipe.query_async(&mut conn).await;
        match batch {
            Ok(values) => Ok(values),
            Err(e) if is_key_level(&e) => {
                // One bad key (e.g. WRONGTYPE) fails the whole pipeline.
                warn!("Batched field read failed ({}), falling back to per-key reads", e);
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    let value: redis::RedisResult<Option<String>> = conn.hget(key, field).await;
                    values.push(value.ok().flatten());
                }
                Ok(values)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_all_batch(&self, keys: &[String]) -> Result<Vec<Option<Fields>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }

        let batch: redis::RedisResult<Vec<Fields>> = pipe.query_async(&mut conn).await;
        match batch {
            Ok(maps) => Ok(maps.into_iter().map(non_empty).collect()),
            Err(e) if is_key_level(&e) => {
                warn!("Batched record read failed ({}), falling back to per-key reads", e);
                let mut records = Vec::with_capacity(keys.len());
                for key in keys {
                    let fields: redis::RedisResult<Fields> = conn.hgetall(key).await;
                    records.push(fields.ok().and_then(non_empty));
                }
                Ok(records)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Fields>> {
        let mut conn = self.connection().await?;
        let fields: Fields = conn.hgetall(key).await?;
        Ok(non_empty(fields))
    }

    async fn insert(&self, key: &str, fields: &Fields) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::InvalidRecord(format!("{} has no fields", key)));
        }
        let mut conn = self.connection().await?;
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let _: () = conn.hset_multiple(key, &items).await?;
        debug!("Stored record {} ({} fields)", key, items.len());
        Ok(())
    }

    async fn push_bounded(&self, list_key: &str, value: &str, max_len: usize) -> Result<()> {
        let mut conn = self.connection().await?;
        let stop = max_len.max(1) as isize - 1;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(list_key, value)
            .ignore()
            .ltrim(list_key, 0, stop)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_range(&self, list_key: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let stop = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => n as isize - 1,
            None => -1,
        };
        let entries: Vec<String> = conn.lrange(list_key, 0, stop).await?;
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let receivers: usize = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// A pub/sub subscription target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Exact channel name (`SUBSCRIBE`).
    Channel(String),
    /// Glob pattern (`PSUBSCRIBE`).
    Pattern(String),
}

/// A message received on a pub/sub connection.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: String,
}

/// Subscribe/unsubscribe half of a pub/sub connection.
#[derive(Clone)]
pub struct PubSubControl {
    sink: PubSubSink,
}

impl PubSubControl {
    pub async fn subscribe(&self, topic: &Topic) -> Result<()> {
        let mut sink = self.sink.clone();
        match topic {
            Topic::Channel(name) => sink.subscribe(name).await?,
            Topic::Pattern(pattern) => sink.psubscribe(pattern).await?,
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        let mut sink = self.sink.clone();
        match topic {
            Topic::Channel(name) => sink.unsubscribe(name).await?,
            Topic::Pattern(pattern) => sink.punsubscribe(pattern).await?,
        }
        Ok(())
    }
}

/// An open pub/sub connection: the control half plus the message stream.
/// The stream ends when the connection drops.
pub struct PubSubSession {
    pub control: PubSubControl,
    pub messages: BoxStream<'static, PubSubMessage>,
}

fn non_empty(fields: Fields) -> Option<Fields> {
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

fn is_key_level(e: &RedisError) -> bool {
    !(e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout())
}

/// Escape glob metacharacters so a prefix matches literally in `KEYS`.
pub fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Hide credentials in a connection URL for logging.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
