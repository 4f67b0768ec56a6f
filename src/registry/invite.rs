//! Invite codes for private sessions
//!
//! Codes look like `K7QX-M2PA`: eight symbols from an alphabet without
//! look-alike glyphs (no `I`, `O`, `0` or `1`).

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::debug;

/// Symbols used in invite codes
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default invite lifetime in minutes
pub const DEFAULT_INVITE_TTL_MINUTES: i64 = 60;

const CODE_LEN: usize = 8;

/// An issued invite
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteCode {
    pub code: String,
    pub session_id: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 0 means unlimited
    pub max_uses: u32,
    pub used_count: u32,
    pub used_by: Vec<String>,
}

impl InviteCode {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if now > self.expires_at {
            return false;
        }
        self.max_uses == 0 || self.used_count < self.max_uses
    }
}

/// Issues, validates and expires invite codes
#[derive(Default)]
pub struct InviteRegistry {
    invites: Mutex<HashMap<String, InviteCode>>,
}

impl InviteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a code for `session_id` valid for `ttl_minutes`
    pub fn create(&self, session_id: &str, creator: &str, ttl_minutes: i64, max_uses: u32) -> String {
        self.create_at(session_id, creator, ttl_minutes, max_uses, Utc::now())
    }

    pub fn create_at(
        &self,
        session_id: &str,
        creator: &str,
        ttl_minutes: i64,
        max_uses: u32,
        now: DateTime<Utc>,
    ) -> String {
        // Out-of-range lifetimes saturate toward their sign
        let ttl = TimeDelta::try_minutes(ttl_minutes).unwrap_or(if ttl_minutes < 0 {
            TimeDelta::MIN
        } else {
            TimeDelta::MAX
        });
        let expires_at = now.checked_add_signed(ttl).unwrap_or(if ttl < TimeDelta::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });

        let mut invites = self.invites.lock();
        let code = loop {
            let candidate = generate_code(&mut rand::thread_rng());
            if !invites.contains_key(&candidate) {
                break candidate;
            }
        };

        invites.insert(
            code.clone(),
            InviteCode {
                code: code.clone(),
                session_id: session_id.to_string(),
                creator: creator.to_string(),
                created_at: now,
                expires_at,
                max_uses,
                used_count: 0,
                used_by: Vec::new(),
            },
        );
        debug!("Invite {} issued for session {}", code, session_id);
        code
    }

    /// Redeem `code` for `identity`, returning the bound session id
    pub fn validate(&self, code: &str, identity: &str) -> Option<String> {
        self.validate_at(code, identity, Utc::now())
    }

    pub fn validate_at(&self, code: &str, identity: &str, now: DateTime<Utc>) -> Option<String> {
        let code = normalize(code);
        let mut invites = self.invites.lock();
        let invite = invites.get_mut(&code)?;

        if !invite.is_valid_at(now) {
            return None;
        }

        invite.used_count += 1;
        if !identity.is_empty() && !invite.used_by.iter().any(|id| id == identity) {
            invite.used_by.push(identity.to_string());
        }
        Some(invite.session_id.clone())
    }

    /// Remove a code. Returns whether it existed.
    pub fn revoke(&self, code: &str) -> bool {
        self.invites.lock().remove(&normalize(code)).is_some()
    }

    pub fn get(&self, code: &str) -> Option<InviteCode> {
        self.invites.lock().get(&normalize(code)).cloned()
    }

    /// Valid invites issued for a session
    pub fn server_invites(&self, session_id: &str) -> Vec<InviteCode> {
        let now = Utc::now();
        self.invites
            .lock()
            .values()
            .filter(|i| i.session_id == session_id && i.is_valid_at(now))
            .cloned()
            .collect()
    }

    /// Drop every code that is no longer valid. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut invites = self.invites.lock();
        let before = invites.len();
        invites.retain(|_, invite| invite.is_valid_at(now));
        before - invites.len()
    }

    pub fn len(&self) -> usize {
        self.invites.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn generate_code<R: Rng>(rng: &mut R) -> String {
    let mut code = String::with_capacity(CODE_LEN + 1);
    for i in 0..CODE_LEN {
        if i == CODE_LEN / 2 {
            code.push('-');
        }
        code.push(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char);
    }
    code
}

/// Codes are typed by people: accept lower case and stray whitespace
fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
