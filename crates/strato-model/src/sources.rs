//! Seams to the external fact sources the monitor drains every cycle.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Application;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

/// Where newly accepted application architectures and removals come from.
/// The admission flow implements this; each call drains the pending queue.
pub trait ArchitectureSource: Send + Sync {
    fn publish_new_architectures(&self) -> Vec<Application>;
    fn publish_new_removals(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEventKind {
    Connected,
    Disconnected,
}

/// A client appearing at or leaving the edge of the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvent {
    pub kind: ClientEventKind,
    pub application: String,
    pub component: String,
    pub id: String,
    pub location: String,
}

/// Feed of client connections and disconnections.
#[async_trait]
pub trait ClientFeed: Send + Sync {
    async fn poll_events(&self) -> Result<Vec<ClientEvent>, FeedError>;
}

/// A user-equipment position report: measured distances from one client to
/// cluster nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UePosition {
    pub client_id: String,
    pub distances: BTreeMap<String, f64>,
}

/// Feed of user-equipment position updates.
#[async_trait]
pub trait UeFeed: Send + Sync {
    async fn poll_positions(&self) -> Result<Vec<UePosition>, FeedError>;
}

/// In-memory feed used by tests and local runs; events are pushed by the
/// harness and drained by the monitor.
#[derive(Debug, Default)]
pub struct QueueFeed {
    events: std::sync::Mutex<Vec<ClientEvent>>,
    positions: std::sync::Mutex<Vec<UePosition>>,
}

impl QueueFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn push_position(&self, position: UePosition) {
        self.positions.lock().unwrap().push(position);
    }
}

#[async_trait]
impl ClientFeed for QueueFeed {
    async fn poll_events(&self) -> Result<Vec<ClientEvent>, FeedError> {
        Ok(std::mem::take(&mut *self.events.lock().unwrap()))
    }
}

#[async_trait]
impl UeFeed for QueueFeed {
    async fn poll_positions(&self) -> Result<Vec<UePosition>, FeedError> {
        Ok(std::mem::take(&mut *self.positions.lock().unwrap()))
    }
}
