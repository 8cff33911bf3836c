//! Connection state and the subscription registry.
//!
//! The registry owns two views of subscription state:
//! - a lock-free `DashMap` of live connections, each with its own channel
//!   set, read by the dispatcher on every fan-out;
//! - per-channel subscriber counts behind an async mutex. Every mutation
//!   (subscribe, unsubscribe, connection removal, resubscribe) runs inside
//!   that critical section, so upstream subscribe/unsubscribe calls are
//!   issued exactly at 0↔1 crossings and never overlap.

use crate::error::{GatewayError, Result};
use crate::protocol::{Outbound, ServerMessage};
use crate::upstream::Upstream;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Per-connection outbound queue depth.
/// Sized for ~1 second of bursty notifications at 1000 msgs/sec.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Keepalive periods a WebSocket client may stay silent before eviction.
pub const STALE_AFTER_MISSED_PINGS: u32 = 3;

/// Transport a connection was opened over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    WebSocket,
    Sse,
}

/// Result of pushing one item onto a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue full (slow client); this item was dropped.
    Dropped,
    /// Transport gone; the connection must be removed.
    Broken,
}

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    pub transport: Transport,
    /// Queue drained by the connection's transport task.
    tx: mpsc::Sender<Outbound>,
    /// Channels this connection currently holds.
    channels: DashSet<String>,
    /// Flips to `true` once; transports watch it to end their loops.
    closed: watch::Sender<bool>,
    /// Timestamp when client connected.
    pub connected_at: i64,
    /// Timestamp of last ping or pong received.
    last_ping: AtomicI64,
}

impl ClientState {
    /// Create a client state and the receiving end of its outbound queue.
    pub fn new(transport: Transport) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_BUFFER_SIZE);
        let now = Utc::now().timestamp_millis();
        let state = Self {
            id: Uuid::new_v4(),
            transport,
            tx,
            channels: DashSet::new(),
            closed: watch::channel(false).0,
            connected_at: now,
            last_ping: AtomicI64::new(now),
        };
        (state, rx)
    }

    /// Push an item onto the outbound queue without waiting.
    pub fn deliver(&self, item: Outbound) -> Delivery {
        if !self.is_open() {
            return Delivery::Broken;
        }
        match self.tx.try_send(item) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Broken,
        }
    }

    /// Send a control reply to this client.
    pub fn send(&self, msg: ServerMessage) -> Result<()> {
        match self.deliver(Outbound::Control(msg)) {
            Delivery::Delivered => Ok(()),
            Delivery::Dropped | Delivery::Broken => Err(GatewayError::ChannelSend),
        }
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow() && !self.tx.is_closed()
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves (`wait_for(|c| *c)`) once the registry has closed this
    /// connection.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the last ping timestamp.
    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    /// WebSocket clients answer keepalive pings; SSE has no return path.
    fn is_stale(&self, now_ms: i64, stale_after: Duration) -> bool {
        self.transport == Transport::WebSocket
            && now_ms - self.last_ping_time() > stale_after.as_millis() as i64
    }

    /// Check if this client is subscribed to a channel.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Get all current subscriptions.
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|s| s.clone()).collect()
    }
}

/// Outcome of [`ClientRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// The connection already held the channel; nothing changed.
    AlreadySubscribed,
}

/// Registry of live connections and their channel subscriptions.
pub struct ClientRegistry {
    /// Client ID → Client State.
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// Channel → number of live connections holding it. Only channels with a
    /// non-zero count are present.
    channel_counts: Mutex<HashMap<String, usize>>,
    upstream: Arc<dyn Upstream>,
    /// Set by [`ClientRegistry::close_all`]; later connections are refused.
    closing: AtomicBool,
}

impl ClientRegistry {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            clients: DashMap::new(),
            channel_counts: Mutex::new(HashMap::new()),
            upstream,
            closing: AtomicBool::new(false),
        }
    }

    /// Register a new client. During shutdown the client is closed instead.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        if self.closing.load(Ordering::Acquire) {
            client.close();
            debug!("Client {} refused, shutting down", id);
            return id;
        }
        self.clients.insert(id, client);
        info!("Client {} registered", id);
        id
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Add `channel` to a connection. Issues one upstream subscribe when this
    /// is the channel's first holder; on upstream failure nothing changes.
    pub async fn subscribe(&self, client_id: &ClientId, channel: &str) -> Result<SubscribeOutcome> {
        let mut counts = self.channel_counts.lock().await;

        let client = self
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;

        if client.is_subscribed(channel) {
            debug!("Client {} already subscribed to {}", client_id, channel);
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        // Local state is only touched once the upstream call has returned, so
        // a caller dropped mid-await leaves no half-held channel behind.
        let current = counts.get(channel).copied().unwrap_or(0);
        if current == 0 {
            if let Err(e) = self.upstream.subscribe(channel).await {
                warn!("Upstream subscribe for {} failed: {}", channel, e);
                return Err(e);
            }
            info!("Channel {} now active upstream", channel);
        }
        client.channels.insert(channel.to_string());
        counts.insert(channel.to_string(), current + 1);

        debug!("Client {} subscribed to {} ({} holders)", client_id, channel, current + 1);
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Remove `channel` from a connection. Issues one upstream unsubscribe
    /// when the last holder leaves. Returns whether the connection held it.
    pub async fn unsubscribe(&self, client_id: &ClientId, channel: &str) -> Result<bool> {
        let mut counts = self.channel_counts.lock().await;

        let client = self
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;

        if client.channels.remove(channel).is_none() {
            return Ok(false);
        }
        self.release_channel(&mut counts, channel).await;

        debug!("Client {} unsubscribed from {}", client_id, channel);
        Ok(true)
    }

    /// Take a connection out of the live set immediately, so no further
    /// dispatch reaches it. Its channel counts are left for [`Self::release`].
    pub fn detach(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        let (_, client) = self.clients.remove(client_id)?;
        client.close();
        Some(client)
    }

    /// Drop every channel a detached connection held, unsubscribing upstream
    /// for each channel whose count reaches zero.
    pub async fn release(&self, client: &ClientState) {
        let mut counts = self.channel_counts.lock().await;
        let held = client.channels();
        for channel in &held {
            client.channels.remove(channel);
            self.release_channel(&mut counts, channel).await;
        }
        info!(
            "Client {} unregistered after {}s ({} channels released)",
            client.id,
            (Utc::now().timestamp_millis() - client.connected_at) / 1000,
            held.len()
        );
    }

    /// Detach and release a connection. Returns whether it was live.
    pub async fn remove_connection(&self, client_id: &ClientId) -> bool {
        match self.detach(client_id) {
            Some(client) => {
                self.release(&client).await;
                true
            }
            None => false,
        }
    }

    async fn release_channel(&self, counts: &mut HashMap<String, usize>, channel: &str) {
        let remaining = match counts.get_mut(channel) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                warn!("Channel {} released with no recorded holders", channel);
                return;
            }
        };

        if remaining == 0 {
            counts.remove(channel);
            // Local state is authoritative; a failed unsubscribe only leaves a
            // stray upstream subscription whose messages match no connection.
            if let Err(e) = self.upstream.unsubscribe(channel).await {
                warn!("Upstream unsubscribe for {} failed: {}", channel, e);
            } else {
                info!("Channel {} no longer active upstream", channel);
            }
        }
    }

    /// Number of live connections holding `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channel_counts
            .lock()
            .await
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Channels with at least one holder.
    pub async fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channel_counts.lock().await.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Re-issue upstream subscriptions for every active channel, after the
    /// upstream connection has been replaced. Returns the channels that
    /// failed, with their errors.
    pub async fn resubscribe_all(&self) -> Vec<(String, GatewayError)> {
        let counts = self.channel_counts.lock().await;
        let channels: Vec<String> = counts.keys().cloned().collect();
        let failed = self.resubscribe_locked(&counts, &channels).await;
        info!(
            "Resubscribed {} of {} active channels",
            channels.len() - failed.len(),
            channels.len()
        );
        failed
    }

    /// Retry upstream subscriptions for `channels`. Channels that lost their
    /// last holder in the meantime are skipped.
    pub async fn resubscribe(&self, channels: &[String]) -> Vec<(String, GatewayError)> {
        let counts = self.channel_counts.lock().await;
        self.resubscribe_locked(&counts, channels).await
    }

    async fn resubscribe_locked(
        &self,
        counts: &HashMap<String, usize>,
        channels: &[String],
    ) -> Vec<(String, GatewayError)> {
        let mut failed = Vec::new();
        for channel in channels.iter().filter(|c| counts.contains_key(*c)) {
            if let Err(e) = self.upstream.subscribe(channel).await {
                warn!("Resubscribe to {} failed: {}", channel, e);
                failed.push((channel.clone(), e));
            }
        }
        failed
    }

    /// Snapshot of live connections.
    pub fn live_connections(&self) -> Vec<Arc<ClientState>> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    /// Live, open connections holding `channel`.
    pub fn subscribers_of(&self, channel: &str) -> Vec<Arc<ClientState>> {
        self.clients
            .iter()
            .filter(|e| e.value().is_open() && e.value().is_subscribed(channel))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Send a keepalive to every live connection. Broken connections, and
    /// WebSocket clients silent for longer than `stale_after`, are removed.
    /// Returns the number removed.
    pub async fn ping_all(&self, stale_after: Duration) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let mut dead: Vec<ClientId> = Vec::new();
        for client in self.live_connections() {
            if client.is_stale(now_ms, stale_after) {
                warn!("Removing client {}, no ping for {:?}", client.id, stale_after);
                dead.push(client.id);
            } else if client.deliver(Outbound::Ping) == Delivery::Broken {
                warn!("Removing client {} after failed keepalive", client.id);
                dead.push(client.id);
            }
        }

        for id in &dead {
            self.remove_connection(id).await;
        }
        dead.len()
    }

    /// Periodic keepalive until shutdown.
    pub async fn run_keepalive(self: Arc<Self>, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Keepalive stopped");
                    break;
                }

                _ = ticker.tick() => {
                    self.ping_all(period * STALE_AFTER_MISSED_PINGS).await;
                }
            }
        }
    }

    /// Remove every connection and refuse new ones. Used on shutdown.
    pub async fn close_all(&self) {
        self.closing.store(true, Ordering::Release);
        let ids: Vec<ClientId> = self.clients.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove_connection(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testing::RecordingUpstream;

    fn registry() -> (Arc<ClientRegistry>, Arc<RecordingUpstream>) {
        let upstream = RecordingUpstream::new();
        (Arc::new(ClientRegistry::new(upstream.clone())), upstream)
    }

    fn connect(registry: &ClientRegistry) -> (ClientId, mpsc::Receiver<Outbound>) {
        let (client, rx) = ClientState::new(Transport::WebSocket);
        (registry.register(Arc::new(client)), rx)
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_issues_one_upstream_call() {
        let (registry, upstream) = registry();
        let (a, _rx) = connect(&registry);

        assert_eq!(
            registry.subscribe(&a, "tokens:new").await.unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            registry.subscribe(&a, "tokens:new").await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );

        assert_eq!(upstream.count("subscribe", "tokens:new"), 1);
        assert_eq!(registry.subscriber_count("tokens:new").await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_only_at_last_holder() {
        let (registry, upstream) = registry();
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);

        registry.subscribe(&a, "token").await.unwrap();
        registry.subscribe(&b, "token").await.unwrap();
        assert_eq!(upstream.count("subscribe", "token"), 1);
        assert_eq!(registry.subscriber_count("token").await, 2);

        assert!(registry.unsubscribe(&a, "token").await.unwrap());
        assert_eq!(upstream.count("unsubscribe", "token"), 0);

        assert!(registry.unsubscribe(&b, "token").await.unwrap());
        assert_eq!(upstream.count("unsubscribe", "token"), 1);
        assert_eq!(registry.subscriber_count("token").await, 0);

        // Not held any more: no-op.
        assert!(!registry.unsubscribe(&b, "token").await.unwrap());
        assert_eq!(upstream.count("unsubscribe", "token"), 1);
    }

    #[tokio::test]
    async fn test_remove_connection_releases_every_channel() {
        let (registry, upstream) = registry();
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);

        registry.subscribe(&a, "token").await.unwrap();
        registry.subscribe(&a, "transaction").await.unwrap();
        registry.subscribe(&b, "token").await.unwrap();

        assert!(registry.remove_connection(&a).await);
        assert_eq!(registry.client_count(), 1);
        assert_eq!(upstream.count("unsubscribe", "transaction"), 1);
        assert_eq!(upstream.count("unsubscribe", "token"), 0);
        assert_eq!(registry.active_channels().await, vec!["token".to_string()]);

        assert!(!registry.remove_connection(&a).await);
    }

    #[tokio::test]
    async fn test_upstream_failure_rolls_back() {
        let (registry, upstream) = registry();
        let (a, _ra) = connect(&registry);

        upstream.set_failing(true);
        assert!(registry.subscribe(&a, "token").await.is_err());
        assert_eq!(registry.subscriber_count("token").await, 0);
        assert!(!registry.get(&a).unwrap().is_subscribed("token"));

        upstream.set_failing(false);
        registry.subscribe(&a, "token").await.unwrap();
        assert_eq!(upstream.count("subscribe", "token"), 1);
    }

    #[tokio::test]
    async fn test_unknown_client() {
        let (registry, _) = registry();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            registry.subscribe(&ghost, "token").await,
            Err(GatewayError::ClientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_connect_disconnect_keeps_counts_exact() {
        let (registry, upstream) = registry();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (client, _rx) = ClientState::new(Transport::Sse);
                let id = registry.register(Arc::new(client));
                registry.subscribe(&id, "token").await.unwrap();
                tokio::task::yield_now().await;
                registry.remove_connection(&id).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(registry.subscriber_count("token").await, 0);
        // Strict alternation: never two subscribes without an unsubscribe between.
        let ops: Vec<&str> = upstream.calls().iter().map(|(op, _)| *op).collect();
        for pair in ops.chunks(2) {
            assert_eq!(pair, ["subscribe", "unsubscribe"]);
        }
    }

    #[tokio::test]
    async fn test_detach_closes_immediately() {
        let (registry, _) = registry();
        let (a, _ra) = connect(&registry);
        registry.subscribe(&a, "token").await.unwrap();

        let client = registry.detach(&a).unwrap();
        assert!(!client.is_open());
        assert!(registry.subscribers_of("token").is_empty());
        assert_eq!(client.deliver(Outbound::Ping), Delivery::Broken);

        registry.release(&client).await;
        assert_eq!(registry.subscriber_count("token").await, 0);
    }

    #[tokio::test]
    async fn test_ping_all_removes_broken() {
        let (registry, _) = registry();
        let (_a, mut ra) = connect(&registry);
        let (_b, rb) = connect(&registry);
        drop(rb);

        assert_eq!(registry.ping_all(Duration::from_secs(90)).await, 1);
        assert_eq!(registry.client_count(), 1);
        assert!(matches!(ra.try_recv(), Ok(Outbound::Ping)));
    }

    #[tokio::test]
    async fn test_resubscribe_all() {
        let (registry, upstream) = registry();
        let (a, _ra) = connect(&registry);
        registry.subscribe(&a, "token").await.unwrap();
        registry.subscribe(&a, "transaction").await.unwrap();

        assert!(registry.resubscribe_all().await.is_empty());
        assert_eq!(upstream.count("subscribe", "token"), 2);

        upstream.set_failing(true);
        assert_eq!(registry.resubscribe_all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ping_all_evicts_silent_websocket_clients() {
        let (registry, _) = registry();
        let (ws, _rw) = connect(&registry);
        let (sse, mut rs) = ClientState::new(Transport::Sse);
        let sse = registry.register(Arc::new(sse));
        let stale = Utc::now().timestamp_millis() - 120_000;
        for id in [&ws, &sse] {
            registry.get(id).unwrap().last_ping.store(stale, Ordering::Relaxed);
        }

        assert_eq!(registry.ping_all(Duration::from_secs(90)).await, 1);
        assert!(registry.get(&ws).is_none());
        assert!(registry.get(&sse).is_some());
        assert!(matches!(rs.try_recv(), Ok(Outbound::Ping)));
        assert_eq!(registry.ping_all(Duration::from_secs(90)).await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_subscribe_holds_nothing() {
        let (registry, upstream) = registry();
        let (a, _ra) = connect(&registry);

        // The upstream call yields once, so a zero timeout drops the
        // subscribe while it is suspended there.
        let res = tokio::time::timeout(Duration::ZERO, registry.subscribe(&a, "token")).await;
        assert!(res.is_err());

        let client = registry.get(&a).unwrap();
        assert!(!client.is_subscribed("token"));
        assert_eq!(registry.subscriber_count("token").await, 0);

        // A later subscribe goes upstream as the first holder.
        registry.subscribe(&a, "token").await.unwrap();
        assert_eq!(upstream.count("subscribe", "token"), 1);
        assert_eq!(registry.subscriber_count("token").await, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_skips_released_channels() {
        let (registry, upstream) = registry();
        let (a, _ra) = connect(&registry);
        registry.subscribe(&a, "token").await.unwrap();

        let retry = vec!["token".to_string(), "gone".to_string()];
        assert!(registry.resubscribe(&retry).await.is_empty());
        assert_eq!(upstream.count("subscribe", "token"), 2);
        assert_eq!(upstream.count("subscribe", "gone"), 0);
    }

    #[tokio::test]
    async fn test_close_all_signals_and_refuses() {
        let (registry, _) = registry();
        let (a, _ra) = connect(&registry);
        let mut signal = registry.get(&a).unwrap().closed_signal();

        registry.close_all().await;
        assert!(signal.wait_for(|c| *c).await.is_ok());
        assert_eq!(registry.client_count(), 0);

        let (late, _rl) = ClientState::new(Transport::Sse);
        let late = Arc::new(late);
        registry.register(late.clone());
        assert!(!late.is_open());
        assert_eq!(registry.client_count(), 0);
    }
}
