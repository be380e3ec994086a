//! Registry of live WebSocket connections and their NPC subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use strands_types::ws::ServerFrame;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outbound frame sender for one connection.
pub type FrameSender = mpsc::Sender<ServerFrame>;

#[derive(Debug)]
struct Connection {
    user_id: String,
    sender: FrameSender,
    last_heartbeat: Instant,
    subscriptions: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    npc_subscribers: Mutex<HashMap<Uuid, HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection_id: &str, user_id: &str, sender: FrameSender) {
        lock(&self.connections).insert(
            connection_id.to_string(),
            Connection {
                user_id: user_id.to_string(),
                sender,
                last_heartbeat: Instant::now(),
                subscriptions: HashSet::new(),
            },
        );
    }

    pub fn remove(&self, connection_id: &str) {
        if let Some(connection) = lock(&self.connections).remove(connection_id) {
            let mut subscribers = lock(&self.npc_subscribers);
            for npc_id in connection.subscriptions {
                if let Some(set) = subscribers.get_mut(&npc_id) {
                    set.remove(connection_id);
                    if set.is_empty() {
                        subscribers.remove(&npc_id);
                    }
                }
            }
        }
    }

    pub fn subscribe_npc(&self, connection_id: &str, npc_id: Uuid) -> bool {
        let mut connections = lock(&self.connections);
        let Some(connection) = connections.get_mut(connection_id) else {
            return false;
        };
        connection.subscriptions.insert(npc_id);
        lock(&self.npc_subscribers)
            .entry(npc_id)
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    pub fn touch_heartbeat(&self, connection_id: &str) {
        if let Some(connection) = lock(&self.connections).get_mut(connection_id) {
            connection.last_heartbeat = Instant::now();
        }
    }

    /// Fan an NPC status update out to its subscribers.
    pub async fn broadcast_npc_status(&self, npc_id: Uuid, status: serde_json::Value) {
        let senders: Vec<FrameSender> = {
            let subscribers = lock(&self.npc_subscribers);
            let Some(ids) = subscribers.get(&npc_id) else {
                return;
            };
            let connections = lock(&self.connections);
            ids.iter()
                .filter_map(|id| connections.get(id).map(|c| c.sender.clone()))
                .collect()
        };
        for sender in senders {
            let _ = sender
                .send(ServerFrame::NpcStatusUpdate {
                    npc_id,
                    status: status.clone(),
                })
                .await;
        }
    }

    /// Connections with no heartbeat inside `timeout` are dropped; their
    /// senders closing tears the sockets down.
    pub fn reap_stale(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = lock(&self.connections)
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_heartbeat) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let count = stale.len();
        for connection_id in &stale {
            tracing::info!(connection_id, "reaping stale connection");
            self.remove(connection_id);
        }
        count
    }

    pub fn stats(&self) -> serde_json::Value {
        let connections = lock(&self.connections);
        let unique_users: HashSet<&str> =
            connections.values().map(|c| c.user_id.as_str()).collect();
        json!({
            "total_connections": connections.len(),
            "unique_users": unique_users.len(),
            "npc_subscriptions": lock(&self.npc_subscribers).len(),
        })
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }
}
