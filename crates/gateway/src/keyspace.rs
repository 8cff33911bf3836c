//! Keyspace notification → channel translation.
//!
//! Record classes are subscribed upstream as keyspace patterns
//! (`__keyspace@<db>__:<prefix>*`). A notification on such a pattern carries
//! the affected key in the channel name and the command in the payload; it
//! is turned into a message on the class channel whose payload is the key.
//! Messages on plain channels pass through unchanged.

use crate::debounce::Debouncer;
use metrics::counter;
use record_store::{escape_glob, PubSubMessage, Topic};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Commands that announce a new (or updated) record. HSET fires for both
/// creation and field updates; the two are not distinguished.
pub const RECORD_WRITE_COMMANDS: [&str; 1] = ["hset"];

/// A class of records sharing a key prefix. The class name doubles as the
/// channel and SSE event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordClass {
    pub name: String,
    pub key_prefix: String,
}

impl RecordClass {
    pub fn new(name: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
        }
    }
}

/// A message ready for fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// What to do with one upstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    Deliver(Notification),
    /// Same entity notified within the debounce window.
    Debounced(String),
    /// Not a record write, or a key outside every class.
    Ignored,
}

pub struct KeyspaceTranslator {
    keyspace_prefix: String,
    classes: Vec<RecordClass>,
    debouncer: Arc<Debouncer>,
}

impl KeyspaceTranslator {
    pub fn new(db: u32, classes: Vec<RecordClass>, debouncer: Arc<Debouncer>) -> Self {
        Self {
            keyspace_prefix: format!("__keyspace@{}__:", db),
            classes,
            debouncer,
        }
    }

    pub fn classes(&self) -> &[RecordClass] {
        &self.classes
    }

    /// Class named `name`.
    pub fn class(&self, name: &str) -> Option<&RecordClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Class owning `key`; the longest matching prefix wins.
    pub fn class_for_key(&self, key: &str) -> Option<&RecordClass> {
        self.classes
            .iter()
            .filter(|c| key.starts_with(&c.key_prefix))
            .max_by_key(|c| c.key_prefix.len())
    }

    /// Upstream topic backing a gateway channel.
    pub fn topic_for(&self, channel: &str) -> Topic {
        match self.class(channel) {
            Some(class) => Topic::Pattern(format!(
                "{}{}*",
                self.keyspace_prefix,
                escape_glob(&class.key_prefix)
            )),
            None => Topic::Channel(channel.to_string()),
        }
    }

    /// Translate one upstream message observed at `now`.
    pub fn translate(&self, msg: &PubSubMessage, now: Instant) -> Translation {
        let Some(key) = msg.channel.strip_prefix(&self.keyspace_prefix) else {
            return Translation::Deliver(Notification {
                channel: msg.channel.clone(),
                payload: msg.payload.clone(),
            });
        };

        if !RECORD_WRITE_COMMANDS.contains(&msg.payload.as_str()) {
            return Translation::Ignored;
        }

        let Some(class) = self.class_for_key(key) else {
            return Translation::Ignored;
        };

        if !self.debouncer.should_deliver(key, now) {
            debug!("Skipping notification for {} - debounced", key);
            counter!("gateway_notifications_debounced_total").increment(1);
            return Translation::Debounced(key.to_string());
        }

        debug!("New {} detected: {}", class.name, key);
        Translation::Deliver(Notification {
            channel: class.name.clone(),
            payload: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn translator() -> KeyspaceTranslator {
        KeyspaceTranslator::new(
            0,
            vec![
                RecordClass::new("token", "token/"),
                RecordClass::new("transaction", "transaction/"),
            ],
            Arc::new(Debouncer::new(Duration::from_millis(5000))),
        )
    }

    fn keyspace(key: &str, op: &str) -> PubSubMessage {
        PubSubMessage {
            channel: format!("__keyspace@0__:{}", key),
            pattern: Some("__keyspace@0__:token/*".to_string()),
            payload: op.to_string(),
        }
    }

    #[test]
    fn test_topics() {
        let t = translator();
        assert_eq!(
            t.topic_for("token"),
            Topic::Pattern("__keyspace@0__:token/*".to_string())
        );
        assert_eq!(
            t.topic_for("tokens:new"),
            Topic::Channel("tokens:new".to_string())
        );
    }

    #[test]
    fn test_keyspace_write_becomes_class_message() {
        let t = translator();
        let now = Instant::now();

        assert_eq!(
            t.translate(&keyspace("token/ABC", "hset"), now),
            Translation::Deliver(Notification {
                channel: "token".to_string(),
                payload: "token/ABC".to_string(),
            })
        );
        assert_eq!(
            t.translate(&keyspace("transaction/1", "hset"), now),
            Translation::Deliver(Notification {
                channel: "transaction".to_string(),
                payload: "transaction/1".to_string(),
            })
        );
    }

    #[test]
    fn test_debounce_per_entity() {
        let t = translator();
        let now = Instant::now();

        assert!(matches!(t.translate(&keyspace("token/A", "hset"), now), Translation::Deliver(_)));
        assert_eq!(
            t.translate(&keyspace("token/A", "hset"), now + Duration::from_millis(3000)),
            Translation::Debounced("token/A".to_string())
        );
        assert!(matches!(
            t.translate(&keyspace("token/B", "hset"), now + Duration::from_millis(3000)),
            Translation::Deliver(_)
        ));
    }

    #[test]
    fn test_ignored_events() {
        let t = translator();
        let now = Instant::now();
        assert_eq!(t.translate(&keyspace("token/A", "del"), now), Translation::Ignored);
        assert_eq!(t.translate(&keyspace("expire/A", "hset"), now), Translation::Ignored);
        assert_eq!(t.translate(&keyspace("token/A", "expire"), now), Translation::Ignored);
    }

    #[test]
    fn test_plain_channel_passthrough() {
        let t = translator();
        let msg = PubSubMessage {
            channel: "tokens:new".to_string(),
            pattern: None,
            payload: r#"{"mint":"X"}"#.to_string(),
        };
        // Never debounced: no entity key.
        for _ in 0..3 {
            assert_eq!(
                t.translate(&msg, Instant::now()),
                Translation::Deliver(Notification {
                    channel: "tokens:new".to_string(),
                    payload: r#"{"mint":"X"}"#.to_string(),
                })
            );
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let t = KeyspaceTranslator::new(
            0,
            vec![
                RecordClass::new("token", "token/"),
                RecordClass::new("token_meta", "token/meta/"),
            ],
            Arc::new(Debouncer::default()),
        );
        assert_eq!(t.class_for_key("token/meta/1").unwrap().name, "token_meta");
        assert_eq!(t.class_for_key("token/1").unwrap().name, "token");
        assert!(t.class_for_key("other").is_none());
    }
}
