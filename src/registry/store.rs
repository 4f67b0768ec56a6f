//! In-memory session table shared by every registry request

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error::RegistryError;
use super::invite::InviteRegistry;
use super::session::{ServerFilter, SessionDescriptor, SessionUpdate};

/// Sessions silent for this long are no longer listed
pub const DEFAULT_STALE_AFTER_SECS: i64 = 60;

/// Aggregate counts for `/api/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Every entry, stale ones included
    pub total_servers: usize,
    pub active_servers: usize,
    /// Sum over active entries
    pub total_players: u64,
}

/// Session table plus the invite registry
pub struct Registry {
    sessions: RwLock<HashMap<String, SessionDescriptor>>,
    invites: InviteRegistry,
    stale_after: TimeDelta,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(DEFAULT_STALE_AFTER_SECS))
    }
}

impl Registry {
    pub fn new(stale_after: TimeDelta) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            invites: InviteRegistry::new(),
            stale_after,
        }
    }

    pub fn invites(&self) -> &InviteRegistry {
        &self.invites
    }

    /// Add or replace a session, returning its id
    ///
    /// An empty id gets a fresh UUID and an empty external address is taken
    /// from `caller`.
    pub fn register(&self, mut session: SessionDescriptor, caller: IpAddr) -> String {
        if session.server_id.is_empty() {
            session.server_id = Uuid::new_v4().to_string();
        }
        if session.external_ip.is_empty() {
            session.external_ip = caller.to_string();
        }
        session.last_heartbeat = Utc::now();

        let id = session.server_id.clone();
        info!(
            "Server registered: {} ({}) at {}",
            session.server_name,
            id,
            session.address()
        );
        self.sessions.write().insert(id.clone(), session);
        id
    }

    /// Refresh a session's heartbeat and apply an optional partial update
    pub fn heartbeat(&self, id: &str, update: Option<&SessionUpdate>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound("Server not found".to_string()))?;

        if let Some(update) = update {
            update.apply(session);
        }
        session.last_heartbeat = Utc::now();
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        match self.sessions.write().remove(id) {
            Some(_) => {
                info!("Server unregistered: {}", id);
                Ok(())
            }
            None => Err(RegistryError::NotFound("Server not found".to_string())),
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionDescriptor> {
        self.sessions.read().get(id).cloned()
    }

    /// Live sessions matching `filter`
    pub fn list(&self, filter: &ServerFilter) -> Vec<SessionDescriptor> {
        self.list_at(filter, Utc::now())
    }

    pub fn list_at(&self, filter: &ServerFilter, now: DateTime<Utc>) -> Vec<SessionDescriptor> {
        let mut sessions: Vec<SessionDescriptor> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_alive_at(now, self.stale_after) && filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        sessions
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> RegistryStats {
        let sessions = self.sessions.read();
        let mut stats = RegistryStats {
            total_servers: sessions.len(),
            ..Default::default()
        };
        for session in sessions.values().filter(|s| s.is_alive_at(now, self.stale_after)) {
            stats.active_servers += 1;
            stats.total_players += u64::from(session.current_players);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Issue an invite for a session. The session does not have to exist yet.
    pub fn create_invite(&self, session_id: &str, creator: &str, ttl_minutes: i64, max_uses: u32) -> String {
        self.invites.create(session_id, creator, ttl_minutes, max_uses)
    }

    /// Redeem an invite and return the session it grants access to
    ///
    /// A non-empty identity is admitted to the session's allowed list so
    /// invite-only sessions accept it afterwards.
    pub fn validate_invite(&self, code: &str, identity: &str) -> Option<SessionDescriptor> {
        let session_id = self.invites.validate(code, identity)?;

        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&session_id)?;
        if !identity.is_empty() && !session.allowed_steam_ids.iter().any(|id| id == identity) {
            session.allowed_steam_ids.push(identity.to_string());
        }
        Some(session.clone())
    }

    /// Drop stale sessions and dead invites. Returns the number of sessions removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<String> = {
            let mut sessions = self.sessions.write();
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| !s.is_alive_at(now, self.stale_after))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                sessions.remove(id);
            }
            stale
        };

        for id in &stale {
            info!("Server timeout: {}", id);
        }
        self.invites.cleanup_expired_at(now);
        stale.len()
    }
}
