use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::domain::engagement::UserId;
use crate::domain::ports::{Notification, Notifier};
use crate::error::Result;

const CONNECTION_BUFFER: usize = 64;

pub type ConnectionId = u64;

struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Notification>,
}

/// Live connections per user.
///
/// Owned by whoever wires the engine and handed out by reference; pushing a
/// notification never waits on a slow connection.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, Vec<Connection>>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        user: impl Into<UserId>,
    ) -> (ConnectionId, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.write().await;
        connections
            .entry(user.into())
            .or_default()
            .push(Connection { id, sender });
        (id, receiver)
    }

    pub async fn unregister(&self, user: &str, id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(live) = connections.get_mut(user) {
            live.retain(|c| c.id != id);
            if live.is_empty() {
                connections.remove(user);
            }
        }
    }

    pub async fn connected(&self, user: &str) -> usize {
        let connections = self.connections.read().await;
        connections.get(user).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Notifier for ConnectionRegistry {
    async fn notify(&self, notification: Notification) -> Result<()> {
        let mut connections = self.connections.write().await;
        let Some(live) = connections.get_mut(&notification.user) else {
            debug!(user = %notification.user, "No live connection, notification dropped");
            return Ok(());
        };
        live.retain(|c| match c.sender.try_send(notification.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(user = %notification.user, connection = c.id, "Connection buffer full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if live.is_empty() {
            connections.remove(&notification.user);
        }
        Ok(())
    }
}
