//! Change router: upstream pub/sub → live connection fan-out.
//!
//! A single task reads the upstream message stream, so events reach each
//! connection's queue in upstream arrival order.

use crate::client::{ClientId, ClientRegistry, Delivery};
use crate::error::GatewayError;
use crate::keyspace::{KeyspaceTranslator, Notification, Translation};
use crate::protocol::{ChannelEvent, Outbound, ServerMessage};
use crate::upstream::UpstreamFeed;
use futures::StreamExt;
use metrics::counter;
use record_store::{Backoff, PubSubMessage, UpstreamStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Floor for the interval between retries of failed resubscribes.
const MIN_RESUBSCRIBE_RETRY: Duration = Duration::from_millis(10);

/// Per-call fan-out tally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Connections whose queue was full; they keep their subscription.
    pub dropped: usize,
    /// Connections found broken and removed.
    pub removed: usize,
}

/// Routes upstream messages to subscribed connections.
pub struct ChangeRouter {
    registry: Arc<ClientRegistry>,
    translator: Arc<KeyspaceTranslator>,
}

impl ChangeRouter {
    pub fn new(registry: Arc<ClientRegistry>, translator: Arc<KeyspaceTranslator>) -> Self {
        Self {
            registry,
            translator,
        }
    }

    /// Deliver `payload` to every open connection subscribed to `channel`.
    ///
    /// Never fails: a broken connection is removed from the registry and the
    /// remaining connections are still served.
    pub async fn dispatch(&self, channel: &str, payload: &str) -> DispatchReport {
        let mut report = DispatchReport::default();

        let clients = self.registry.subscribers_of(channel);
        if clients.is_empty() {
            debug!("No clients subscribed to {}", channel);
            return report;
        }

        let event = match ChannelEvent::new(channel, payload) {
            Ok(e) => Arc::new(e),
            Err(e) => {
                warn!("Failed to encode event for {}: {}", channel, e);
                return report;
            }
        };

        let mut broken: Vec<ClientId> = Vec::new();
        for client in clients {
            match client.deliver(Outbound::Event(event.clone())) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => {
                    report.dropped += 1;
                    warn!("Client {} queue full, dropped event on {}", client.id, channel);
                }
                Delivery::Broken => broken.push(client.id),
            }
        }

        for id in &broken {
            if self.registry.remove_connection(id).await {
                report.removed += 1;
                info!("Removed broken client {}", id);
            }
        }

        counter!("gateway_dispatch_delivered_total").increment(report.delivered as u64);
        counter!("gateway_dispatch_dropped_total").increment(report.dropped as u64);
        counter!("gateway_dispatch_failed_total").increment(report.removed as u64);
        debug!(
            "Routed {} -> {} delivered, {} dropped, {} removed",
            channel, report.delivered, report.dropped, report.removed
        );
        report
    }

    /// Translate and fan out one upstream message.
    pub async fn handle_message(&self, msg: &PubSubMessage) -> Option<DispatchReport> {
        counter!("gateway_upstream_messages_total").increment(1);
        match self.translator.translate(msg, Instant::now()) {
            Translation::Deliver(Notification { channel, payload }) => {
                Some(self.dispatch(&channel, &payload).await)
            }
            Translation::Debounced(_) | Translation::Ignored => None,
        }
    }

    /// Tell every holder of a channel that its upstream subscription failed.
    pub fn notify_channel_error(&self, channel: &str, error: &GatewayError) {
        for client in self.registry.subscribers_of(channel) {
            let _ = client.send(ServerMessage::Error {
                channel: Some(channel.to_string()),
                message: error.to_string(),
                code: error.code().to_string(),
            });
        }
    }

    /// Notify holders of every failed channel; returns the channels to retry.
    fn report_failures(&self, failed: Vec<(String, GatewayError)>) -> Vec<String> {
        failed
            .into_iter()
            .map(|(channel, e)| {
                self.notify_channel_error(&channel, &e);
                channel
            })
            .collect()
    }

    /// Run the router until shutdown: connect upstream, restore active
    /// subscriptions, fan out messages; reconnect with backoff when the
    /// connection drops. Channels whose resubscribe failed are retried while
    /// the connection lasts. Exhausting the attempt budget stops the router
    /// and leaves the status at `exhausted`.
    pub async fn run(
        self: Arc<Self>,
        upstream: Arc<dyn UpstreamFeed>,
        backoff: Backoff,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Starting ChangeRouter");
        let status = upstream.status();
        let mut attempts = 0u32;

        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                res = upstream.connect() => res,
            };

            match connected {
                Ok(mut messages) => {
                    attempts = 0;
                    let mut pending = self.report_failures(self.registry.resubscribe_all().await);
                    let mut retry = tokio::time::interval(backoff.initial_delay.max(MIN_RESUBSCRIBE_RETRY));
                    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    retry.reset();
                    info!("ChangeRouter running");

                    loop {
                        tokio::select! {
                            biased;

                            _ = shutdown_rx.recv() => {
                                info!("ChangeRouter received shutdown signal");
                                upstream.mark_disconnected().await;
                                return;
                            }

                            msg = messages.next() => {
                                match msg {
                                    Some(msg) => {
                                        self.handle_message(&msg).await;
                                    }
                                    None => {
                                        warn!("Upstream pub/sub connection ended unexpectedly");
                                        break;
                                    }
                                }
                            }

                            _ = retry.tick(), if !pending.is_empty() => {
                                let failed = self.registry.resubscribe(&pending).await;
                                let restored = pending.len() - failed.len();
                                if restored > 0 {
                                    info!("Restored {} channel subscriptions on retry", restored);
                                }
                                pending = failed.into_iter().map(|(channel, _)| channel).collect();
                            }
                        }
                    }

                    upstream.mark_disconnected().await;
                    counter!("gateway_upstream_disconnects_total").increment(1);
                }
                Err(e) => {
                    warn!("Upstream connect failed: {}", e);
                }
            }

            attempts += 1;
            if !backoff.allows(attempts) {
                warn!("Upstream reconnection abandoned after {} attempts", attempts);
                status.set(UpstreamStatus::Exhausted { attempts });
                break;
            }

            let delay = backoff.delay_for(attempts);
            status.set(UpstreamStatus::Reconnecting { attempt: attempts });
            warn!("Reconnecting upstream in {:?} (attempt {})", delay, attempts);

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("ChangeRouter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientState, Transport};
    use crate::debounce::Debouncer;
    use crate::keyspace::RecordClass;
    use crate::upstream::testing::RecordingUpstream;
    use tokio::time::timeout;

    struct Harness {
        upstream: Arc<RecordingUpstream>,
        registry: Arc<ClientRegistry>,
        router: ChangeRouter,
    }

    fn harness() -> Harness {
        let upstream = RecordingUpstream::new();
        let registry = Arc::new(ClientRegistry::new(upstream.clone()));
        let translator = Arc::new(KeyspaceTranslator::new(
            0,
            vec![RecordClass::new("token", "token/")],
            Arc::new(Debouncer::new(Duration::from_millis(5000))),
        ));
        let router = ChangeRouter::new(registry.clone(), translator);
        Harness {
            upstream,
            registry,
            router,
        }
    }

    fn connect(registry: &ClientRegistry) -> (ClientId, mpsc::Receiver<Outbound>) {
        let (client, rx) = ClientState::new(Transport::WebSocket);
        (registry.register(Arc::new(client)), rx)
    }

    fn events(rx: &mut mpsc::Receiver<Outbound>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(e) = item {
                out.push((e.channel.clone(), e.payload.clone()));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_only_subscribers_receive() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        let (_b, mut rb) = connect(&h.registry);
        h.registry.subscribe(&a, "tokens:new").await.unwrap();

        let report = h.router.dispatch("tokens:new", "hello").await;
        assert_eq!(report.delivered, 1);

        assert_eq!(
            events(&mut ra),
            vec![("tokens:new".to_string(), "hello".to_string())]
        );
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broken_connection_isolated_and_removed() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        let (b, rb) = connect(&h.registry);
        let (c, mut rc) = connect(&h.registry);
        for id in [&a, &b, &c] {
            h.registry.subscribe(id, "token").await.unwrap();
        }
        drop(rb);

        let report = h.router.dispatch("token", "token/X").await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, 1);

        assert_eq!(events(&mut ra).len(), 1);
        assert_eq!(events(&mut rc).len(), 1);
        assert!(h.registry.get(&b).is_none());
        assert_eq!(h.registry.subscriber_count("token").await, 2);
    }

    #[tokio::test]
    async fn test_per_connection_order_preserved() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        h.registry.subscribe(&a, "feed").await.unwrap();

        for i in 0..50 {
            h.router.dispatch("feed", &i.to_string()).await;
        }

        let payloads: Vec<String> = events(&mut ra).into_iter().map(|(_, p)| p).collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(payloads, expected);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_removal() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        h.registry.subscribe(&a, "feed").await.unwrap();

        for i in 0..crate::client::CLIENT_CHANNEL_BUFFER_SIZE {
            h.router.dispatch("feed", &i.to_string()).await;
        }
        let report = h.router.dispatch("feed", "overflow").await;
        assert_eq!(report.dropped, 1);
        assert_eq!(report.removed, 0);
        assert!(h.registry.get(&a).is_some());

        assert_eq!(events(&mut ra).len(), crate::client::CLIENT_CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_keyspace_message_end_to_end() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        h.registry.subscribe(&a, "token").await.unwrap();

        let msg = PubSubMessage {
            channel: "__keyspace@0__:token/ABC".to_string(),
            pattern: Some("__keyspace@0__:token/*".to_string()),
            payload: "hset".to_string(),
        };

        assert_eq!(h.router.handle_message(&msg).await.unwrap().delivered, 1);
        // Burst within the window is swallowed.
        assert!(h.router.handle_message(&msg).await.is_none());

        assert_eq!(
            events(&mut ra),
            vec![("token".to_string(), "token/ABC".to_string())]
        );
    }

    #[tokio::test]
    async fn test_notify_channel_error() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        h.registry.subscribe(&a, "token").await.unwrap();

        h.router
            .notify_channel_error("token", &GatewayError::UpstreamUnavailable("down".to_string()));

        match ra.try_recv() {
            Ok(Outbound::Control(ServerMessage::Error { channel, code, .. })) => {
                assert_eq!(channel.as_deref(), Some("token"));
                assert_eq!(code, "UPSTREAM_UNAVAILABLE");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn fast_backoff(max_attempts: u32) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_attempts,
        }
    }

    fn plain(channel: &str, payload: &str) -> PubSubMessage {
        PubSubMessage {
            channel: channel.to_string(),
            pattern: None,
            payload: payload.to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> (String, String) {
        loop {
            match timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(Outbound::Event(e))) => return (e.channel.clone(), e.payload.clone()),
                Ok(Some(_)) => continue,
                other => panic!("no event: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_and_resumes_delivery() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        h.registry.subscribe(&a, "token").await.unwrap();

        let first = h.upstream.push_session();
        let second = h.upstream.push_session();
        first.send(plain("token", "before")).unwrap();

        let router = Arc::new(h.router);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(router.run(h.upstream.clone(), fast_backoff(0), shutdown_rx));

        assert_eq!(next_event(&mut ra).await, ("token".to_string(), "before".to_string()));

        drop(first);
        second.send(plain("token", "after")).unwrap();
        assert_eq!(next_event(&mut ra).await, ("token".to_string(), "after".to_string()));

        // Initial subscribe plus one restore per connection.
        assert_eq!(h.upstream.count("subscribe", "token"), 3);
        assert_eq!(h.upstream.count("disconnect", ""), 1);
        assert!(h.upstream.status().get().is_connected());

        shutdown_tx.send(()).await.unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_router() {
        let h = harness();
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        timeout(
            Duration::from_secs(2),
            Arc::new(h.router).run(h.upstream.clone(), fast_backoff(3), shutdown_rx),
        )
        .await
        .unwrap();

        assert_eq!(h.upstream.count("connect", ""), 3);
        assert_eq!(
            h.upstream.status().get(),
            UpstreamStatus::Exhausted { attempts: 3 }
        );
    }

    #[tokio::test]
    async fn test_failed_resubscribe_is_reported_then_retried() {
        let h = harness();
        let (a, mut ra) = connect(&h.registry);
        h.registry.subscribe(&a, "token").await.unwrap();
        h.upstream.set_failing(true);

        let _session = h.upstream.push_session();
        let router = Arc::new(h.router);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(router.run(h.upstream.clone(), fast_backoff(0), shutdown_rx));

        match timeout(Duration::from_secs(2), ra.recv()).await {
            Ok(Some(Outbound::Control(ServerMessage::Error { channel, code, .. }))) => {
                assert_eq!(channel.as_deref(), Some("token"));
                assert_eq!(code, "UPSTREAM_UNAVAILABLE");
            }
            other => panic!("expected error, got {:?}", other.is_ok()),
        }

        h.upstream.set_failing(false);
        timeout(Duration::from_secs(2), async {
            while h.upstream.count("subscribe", "token") < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.registry.subscriber_count("token").await, 1);

        shutdown_tx.send(()).await.unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
