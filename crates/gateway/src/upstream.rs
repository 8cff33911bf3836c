//! Upstream pub/sub seam.
//!
//! The [`ClientRegistry`](crate::client::ClientRegistry) is the only caller
//! of [`Upstream::subscribe`] / [`Upstream::unsubscribe`]; it issues them at
//! subscriber-count 0↔1 crossings under its own lock.

use crate::error::{GatewayError, Result};
use crate::keyspace::KeyspaceTranslator;
use async_trait::async_trait;
use futures::stream::BoxStream;
use record_store::{PubSubControl, PubSubMessage, RedisRecordStore, StatusHandle, UpstreamStatus};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Upstream subscription primitive, keyed by gateway channel name.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn subscribe(&self, channel: &str) -> Result<()>;
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

/// An upstream that can be (re)connected, driven by the router.
#[async_trait]
pub trait UpstreamFeed: Upstream {
    /// Open a fresh pub/sub connection and return its message stream. The
    /// stream ends when the connection drops.
    async fn connect(&self) -> Result<BoxStream<'static, PubSubMessage>>;

    /// Forget the current connection; the next [`Self::connect`] starts over.
    async fn mark_disconnected(&self);

    fn status(&self) -> StatusHandle;
}

/// Redis pub/sub upstream.
///
/// Record-class channels become keyspace pattern subscriptions, any other
/// channel a plain channel subscription. The pub/sub connection is replaced
/// on every reconnect; while it is down, subscribe calls fail with
/// [`GatewayError::UpstreamUnavailable`].
pub struct RedisUpstream {
    store: Arc<RedisRecordStore>,
    translator: Arc<KeyspaceTranslator>,
    control: RwLock<Option<PubSubControl>>,
    status: StatusHandle,
}

impl RedisUpstream {
    pub fn new(store: Arc<RedisRecordStore>, translator: Arc<KeyspaceTranslator>) -> Self {
        let status = store.status();
        Self {
            store,
            translator,
            control: RwLock::new(None),
            status,
        }
    }

    async fn control(&self) -> Result<PubSubControl> {
        self.control
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::UpstreamUnavailable("pub/sub not connected".to_string()))
    }
}

#[async_trait]
impl UpstreamFeed for RedisUpstream {
    /// Reuses the store connection if one is live, otherwise walks the
    /// endpoint list.
    async fn connect(&self) -> Result<BoxStream<'static, PubSubMessage>> {
        if self.store.endpoint().await.is_none() {
            self.store.connect().await?;
        }

        let session = match self.store.open_pubsub().await {
            Ok(session) => session,
            Err(e) => {
                self.store.disconnect().await;
                return Err(e.into());
            }
        };
        *self.control.write().await = Some(session.control);

        if let Some(endpoint) = self.store.endpoint().await {
            self.status.set(UpstreamStatus::Connected { endpoint });
        }
        info!("Upstream pub/sub connected");
        Ok(session.messages)
    }

    async fn mark_disconnected(&self) {
        *self.control.write().await = None;
        self.store.disconnect().await;
    }

    fn status(&self) -> StatusHandle {
        self.status.clone()
    }
}

#[async_trait]
impl Upstream for RedisUpstream {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        let control = self.control().await?;
        let topic = self.translator.topic_for(channel);
        debug!("Upstream subscribe {} -> {:?}", channel, topic);
        control.subscribe(&topic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let control = match self.control().await {
            Ok(c) => c,
            Err(_) => {
                // Nothing is subscribed on a connection that no longer exists.
                debug!("Upstream unsubscribe {} skipped, pub/sub down", channel);
                return Ok(());
            }
        };
        let topic = self.translator.topic_for(channel);
        debug!("Upstream unsubscribe {} -> {:?}", channel, topic);
        if let Err(e) = control.unsubscribe(&topic).await {
            warn!("Upstream unsubscribe {} failed: {}", channel, e);
            return Err(e.into());
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::Debouncer;
    use crate::keyspace::RecordClass;

    #[tokio::test]
    async fn test_every_connect_walks_the_endpoint_list() {
        let store = Arc::new(
            RedisRecordStore::new(vec![
                "redis://127.0.0.1:1".to_string(),
                "redis://127.0.0.1:2".to_string(),
            ])
            .unwrap(),
        );
        let translator = Arc::new(KeyspaceTranslator::new(
            0,
            vec![RecordClass::new("token", "token/")],
            Arc::new(Debouncer::default()),
        ));
        let upstream = RedisUpstream::new(store, translator);

        for _ in 0..2 {
            match upstream.connect().await {
                Ok(_) => panic!("no endpoint is reachable"),
                Err(e) => assert!(e.to_string().contains("all 2 store endpoints failed")),
            }
            upstream.mark_disconnected().await;
        }

        assert!(upstream.subscribe("token").await.is_err());
        assert!(upstream.unsubscribe("token").await.is_ok());
    }
}
