//! Session descriptors advertised through the master registry

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Who may join a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Privacy {
    #[default]
    Public,
    FriendsOnly,
    InviteOnly,
    PasswordProtected,
}

/// A game session listed in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionDescriptor {
    /// Assigned by the registry when empty
    pub server_id: String,
    pub server_name: String,
    pub host_name: String,
    pub port: u16,
    /// Filled from the registering connection when empty
    #[serde(alias = "externalIP")]
    pub external_ip: String,
    pub game_mode: String,
    pub map_name: String,
    pub current_players: u32,
    pub max_players: u32,
    pub privacy: Privacy,
    pub has_password: bool,
    pub host_steam_id: String,
    /// Identities admitted to friends-only and invite-only sessions
    pub allowed_steam_ids: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub ping: u32,
    pub custom_data: HashMap<String, String>,
    pub is_dedicated: bool,
    pub version: String,
}

impl Default for SessionDescriptor {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            server_name: "Unnamed Server".to_string(),
            host_name: String::new(),
            port: 0,
            external_ip: String::new(),
            game_mode: "Deathmatch".to_string(),
            map_name: "Unknown".to_string(),
            current_players: 0,
            max_players: 16,
            privacy: Privacy::Public,
            has_password: false,
            host_steam_id: String::new(),
            allowed_steam_ids: Vec::new(),
            last_heartbeat: Utc::now(),
            ping: 0,
            custom_data: HashMap::new(),
            is_dedicated: false,
            version: "1.0".to_string(),
        }
    }
}

impl SessionDescriptor {
    /// Whether the last heartbeat is younger than `stale_after`
    pub fn is_alive_at(&self, now: DateTime<Utc>, stale_after: TimeDelta) -> bool {
        now.signed_duration_since(self.last_heartbeat) < stale_after
    }

    pub fn is_full(&self) -> bool {
        self.current_players >= self.max_players
    }

    /// Whether `identity` may take a slot in this session
    ///
    /// Friends-only and invite-only sessions admit listed identities only.
    /// Anonymous callers are not checked.
    pub fn can_join(&self, identity: Option<&str>) -> bool {
        if self.is_full() {
            return false;
        }

        match (self.privacy, identity) {
            (Privacy::FriendsOnly | Privacy::InviteOnly, Some(id)) if !id.is_empty() => {
                self.allowed_steam_ids.iter().any(|allowed| allowed == id)
            }
            _ => true,
        }
    }

    /// `address:port` to connect to
    pub fn address(&self) -> String {
        let host = if self.external_ip.is_empty() {
            &self.host_name
        } else {
            &self.external_ip
        };
        format!("{}:{}", host, self.port)
    }
}

/// Partial update sent with a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Negative counts are ignored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_players: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_name: Option<String>,
}

impl SessionUpdate {
    pub fn apply(&self, session: &mut SessionDescriptor) {
        if let Some(name) = self.server_name.as_deref().filter(|n| !n.is_empty()) {
            session.server_name = name.to_string();
        }
        if let Some(players) = self.current_players.and_then(|p| u32::try_from(p).ok()) {
            session.current_players = players;
        }
        if let Some(map) = self.map_name.as_deref().filter(|m| !m.is_empty()) {
            session.map_name = map.to_string();
        }
    }
}

/// Server browser filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    pub game_mode: Option<String>,
    pub map: Option<String>,
    pub not_full: bool,
    pub no_password: bool,
}

impl ServerFilter {
    /// Build from query parameters. `notfull` and `nopassword` are presence flags.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        Self {
            game_mode: query.get("gamemode").cloned(),
            map: query.get("map").cloned(),
            not_full: query.contains_key("notfull"),
            no_password: query.contains_key("nopassword"),
        }
    }

    /// Query parameters understood by [`ServerFilter::from_query`]
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(ref mode) = self.game_mode {
            query.push(("gamemode", mode.clone()));
        }
        if let Some(ref map) = self.map {
            query.push(("map", map.clone()));
        }
        if self.not_full {
            query.push(("notfull", "1".to_string()));
        }
        if self.no_password {
            query.push(("nopassword", "1".to_string()));
        }
        query
    }

    pub fn matches(&self, session: &SessionDescriptor) -> bool {
        if let Some(ref mode) = self.game_mode {
            if !session.game_mode.eq_ignore_ascii_case(mode) {
                return false;
            }
        }
        if let Some(ref map) = self.map {
            if !session.map_name.eq_ignore_ascii_case(map) {
                return false;
            }
        }
        if self.not_full && session.is_full() {
            return false;
        }
        !(self.no_password && session.has_password)
    }
}
