//! Real-time fan-out gateway between a key-value store and live clients.
//!
//! This service:
//! - Accepts WebSocket and Server-Sent Events connections
//! - Tracks which channels each connection holds, subscribing upstream only
//!   while at least one connection holds a channel
//! - Turns store keyspace notifications into per-class record events,
//!   debounced per entity
//! - Answers "latest K records" queries over an unindexed key space
//!
//! ## Architecture
//!
//! ```text
//! Redis pub/sub + __keyspace@<db>__ notifications
//!         ↓
//! RedisUpstream (single pub/sub connection, reconnect with backoff)
//!         ↓
//! KeyspaceTranslator + Debouncer
//!         ↓
//! ChangeRouter (one task, arrival order)
//!         ↓
//! ClientRegistry (DashMap of connections, bounded queue each)
//!         ↓
//! WebSocket / SSE clients
//! ```
//!
//! Latest-records queries go straight to the store through
//! [`FreshnessRanker`].

pub mod api;
pub mod client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod keyspace;
pub mod protocol;
pub mod ranker;
pub mod router;
pub mod subscription;
pub mod upstream;
pub mod ws_server;

pub use client::{ClientId, ClientRegistry, ClientState, Transport};
pub use config::GatewayConfig;
pub use debounce::Debouncer;
pub use error::{GatewayError, Result};
pub use keyspace::{KeyspaceTranslator, RecordClass};
pub use protocol::{ClientMessage, ServerMessage};
pub use ranker::{FeedSource, FreshnessRanker, RankedFeed};
pub use router::{ChangeRouter, DispatchReport};
pub use upstream::{RedisUpstream, Upstream, UpstreamFeed};
pub use ws_server::{create_router, AppState};
