//! Wire protocol message types.
//!
//! WebSocket clients exchange JSON control messages with the gateway; SSE
//! clients only receive named events. Both are fed from the same
//! [`Outbound`] queue per connection.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving messages published on `channel`.
    Subscribe { channel: String },
    /// Stop receiving messages published on `channel`.
    Unsubscribe { channel: String },
    /// Application-level keepalive.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription acknowledged.
    Subscribed { channel: String },
    /// Unsubscription acknowledged.
    Unsubscribed { channel: String },
    /// A message fanned out from `channel`.
    Message { channel: String, data: String },
    /// Pong response to ping.
    Pong,
    /// Error report. The connection stays open.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        message: String,
        code: String,
    },
}

/// A channel-tagged event shared by every connection it is delivered to.
///
/// The WebSocket frame is serialized once at construction.
#[derive(Debug)]
pub struct ChannelEvent {
    pub channel: String,
    pub payload: String,
    encoded: String,
}

impl ChannelEvent {
    pub fn new(channel: &str, payload: &str) -> Result<Self> {
        let encoded = serde_json::to_string(&ServerMessage::Message {
            channel: channel.to_string(),
            data: payload.to_string(),
        })?;
        Ok(Self {
            channel: channel.to_string(),
            payload: payload.to_string(),
            encoded,
        })
    }

    /// Pre-serialized WebSocket frame.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

/// One item in a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Fanned-out channel event.
    Event(Arc<ChannelEvent>),
    /// Per-connection control reply.
    Control(ServerMessage),
    /// Keepalive tick.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"tokens:new"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { channel } if channel == "tokens:new"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"unsubscribe","channel":"token"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_reject_malformed() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let json = serde_json::to_value(ServerMessage::Subscribed {
            channel: "token".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "subscribed", "channel": "token"}));

        let json = serde_json::to_value(ServerMessage::Error {
            channel: None,
            message: "bad".to_string(),
            code: "MALFORMED_PAYLOAD".to_string(),
        })
        .unwrap();
        assert!(json.get("channel").is_none());
        assert_eq!(json["type"], "error");
    }

    #[test]
    fn test_channel_event_encoding() {
        let event = ChannelEvent::new("token", "token/ABC").unwrap();
        let json: serde_json::Value = serde_json::from_str(event.encoded()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["channel"], "token");
        assert_eq!(json["data"], "token/ABC");
    }
}
