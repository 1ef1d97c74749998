use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chatfront_cache::TtlCache;
use chatfront_common::{CacheConfig, GatewayResult};
use chatfront_pipeline::Client;
use dashmap::DashMap;
use tracing::debug;

use crate::packets::Outbound;

/// Per-connection session entry.
struct Session {
    client: Arc<dyn Client>,
    name: Option<String>,
}

/// Live connections, their display names and room membership.
///
/// Constructed once at startup and shared by the transport and the handlers.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    rooms: DashMap<String, HashSet<String>>,
    /// Latest message per room, replayed to clients that join.
    last_messages: TtlCache<String, Outbound>,
}

impl SessionRegistry {
    pub fn new(message_lifetime: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            last_messages: TtlCache::new(message_lifetime),
        }
    }

    pub fn from_config(config: &CacheConfig) -> GatewayResult<Self> {
        let registry = Self::new(config.default_lifetime());
        if let Some(interval) = config.sweep_interval() {
            registry.last_messages.start_sweeper(interval)?;
        }
        Ok(registry)
    }

    pub fn register(&self, client: Arc<dyn Client>) {
        debug!(client = %client.id(), peer = %client.peer_addr(), "session registered");
        self.sessions
            .insert(client.id().to_string(), Session { client, name: None });
    }

    /// Drop a session and its room memberships.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        for mut members in self.rooms.iter_mut() {
            members.remove(id);
        }
        self.rooms.retain(|_, members| !members.is_empty());
        if removed {
            debug!(client = %id, "session removed");
        }
        removed
    }

    pub fn set_name(&self, id: &str, name: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.name = Some(name.to_string());
                true
            }
            None => false,
        }
    }

    /// Display name of a client, falling back to its id.
    pub fn display_name(&self, id: &str) -> String {
        self.sessions
            .get(id)
            .and_then(|session| session.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Add a client to a room and return the resulting member count.
    pub fn join(&self, room: &str, id: &str) -> usize {
        let mut members = self.rooms.entry(room.to_string()).or_default();
        members.insert(id.to_string());
        members.len()
    }

    pub fn is_member(&self, room: &str, id: &str) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(id))
            .unwrap_or(false)
    }

    /// Clients currently in `room`.
    pub fn members(&self, room: &str) -> Vec<Arc<dyn Client>> {
        let ids: Vec<String> = match self.rooms.get(room) {
            Some(members) => members.iter().cloned().collect(),
            None => return Vec::new(),
        };

        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.client.clone()))
            .collect()
    }

    pub fn remember_message(&self, room: &str, message: Outbound) -> GatewayResult<()> {
        self.last_messages.insert(room.to_string(), message)
    }

    pub fn last_message(&self, room: &str) -> GatewayResult<Option<Outbound>> {
        Ok(self
            .last_messages
            .try_get(&room.to_string())?
            .map(|(message, _)| message))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Release the message cache. Later lookups fail with `Disposed`.
    pub fn shutdown(&self) {
        self.last_messages.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingClient;

    #[test]
    fn membership_follows_sessions() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (alice, _) = RecordingClient::new("alice");
        let (bob, _) = RecordingClient::new("bob");
        registry.register(alice);
        registry.register(bob);

        assert_eq!(registry.join("lobby", "alice"), 1);
        assert_eq!(registry.join("lobby", "bob"), 2);
        assert_eq!(registry.join("lobby", "bob"), 2);
        assert!(registry.is_member("lobby", "alice"));
        assert!(!registry.is_member("kitchen", "alice"));

        assert!(registry.remove("alice"));
        assert!(!registry.is_member("lobby", "alice"));
        assert_eq!(registry.members("lobby").len(), 1);

        registry.remove("bob");
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let (carol, _) = RecordingClient::new("carol");
        registry.register(carol);

        assert_eq!(registry.display_name("carol"), "carol");
        assert!(registry.set_name("carol", "Carol"));
        assert_eq!(registry.display_name("carol"), "Carol");
        assert!(!registry.set_name("nobody", "x"));
    }

    #[tokio::test(start_paused = true)]
    async fn last_message_expires() {
        let registry = SessionRegistry::new(Duration::from_secs(30));
        registry
            .remember_message("lobby", Outbound::error("placeholder"))
            .unwrap();
        assert!(registry.last_message("lobby").unwrap().is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(registry.last_message("lobby").unwrap().is_none());

        registry.shutdown();
        assert!(registry.last_message("lobby").is_err());
    }
}
