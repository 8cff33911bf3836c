//! Upstream connection status shared with the status endpoints.

use serde::Serialize;
use tokio::sync::watch;

/// Connection state of an upstream store connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpstreamStatus {
    /// Initial connection in progress.
    Connecting,
    /// Connected to the given endpoint.
    Connected { endpoint: String },
    /// Connection lost, retrying.
    Reconnecting { attempt: u32 },
    /// Retry budget spent; no further attempts will be made.
    Exhausted { attempts: u32 },
}

impl UpstreamStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, UpstreamStatus::Connected { .. })
    }
}

/// Cloneable handle to a status cell. Writers publish, readers peek.
#[derive(Clone)]
pub struct StatusHandle {
    tx: watch::Sender<UpstreamStatus>,
}

impl StatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(UpstreamStatus::Connecting);
        Self { tx }
    }

    pub fn set(&self, status: UpstreamStatus) {
        self.tx.send_replace(status);
    }

    pub fn get(&self) -> UpstreamStatus {
        self.tx.borrow().clone()
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}
