#![forbid(unsafe_code)]

// Identity module - connection identities and their lifecycle
pub mod auth;

use crate::now_millis;
use auth::VerifiedIdentity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Display colors handed out round-robin. Collisions are fine.
pub const USER_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7",
    "#DDA0DD", "#98D8C8", "#F7DC6F", "#BB8FCE", "#F8C471",
];

pub const MAX_DISPLAY_NAME_LEN: usize = 32;

/// Account-level role, as opposed to the per-room [`ParticipantRole`](crate::room::roles::ParticipantRole).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityRole {
    #[default]
    Guest,
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Server-assigned, unique per connection
    pub id: String,
    pub display_name: String,
    pub display_color: String,
    pub role: IdentityRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub connected_at: u64,
    pub last_activity_at: u64,
    pub online: bool,
}

impl Identity {
    /// Last four characters of the id, used in lobby summaries.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub fn short_id(id: &str) -> &str {
    let start = id.char_indices().rev().nth(3).map_or(0, |(i, _)| i);
    &id[start..]
}

struct Entry {
    identity: Identity,
    /// Updated on every inbound event under the read lock
    last_activity_at: AtomicU64,
    offline_since: Option<Instant>,
}

impl Entry {
    fn snapshot(&self) -> Identity {
        Identity {
            last_activity_at: self.last_activity_at.load(Ordering::Relaxed),
            ..self.identity.clone()
        }
    }
}

/// Directory of every identity the server knows about. Offline identities
/// linger for a grace window so late events can still be attributed.
pub struct IdentityDirectory {
    entries: StdRwLock<HashMap<String, Entry>>,
    next_color: AtomicUsize,
    grace: Duration,
}

impl IdentityDirectory {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: StdRwLock::new(HashMap::new()),
            next_color: AtomicUsize::new(0),
            grace,
        }
    }

    /// Register an anonymous connection. A missing or blank name becomes
    /// `Guest-XXXX`.
    pub fn connect_guest(&self, display_name: Option<&str>) -> Identity {
        self.register(display_name, IdentityRole::Guest, None)
    }

    pub fn connect_verified(&self, verified: VerifiedIdentity) -> Identity {
        self.register(Some(&verified.display_name), verified.role, Some(verified.account_id))
    }

    fn register(&self, display_name: Option<&str>, role: IdentityRole, account_id: Option<String>) -> Identity {
        let id = Uuid::new_v4().simple().to_string();
        let color_index = self.next_color.fetch_add(1, Ordering::Relaxed) % USER_COLORS.len();
        let now = now_millis();
        let display_name = sanitize_display_name(display_name)
            .unwrap_or_else(|| format!("Guest-{}", short_id(&id)));

        let identity = Identity {
            id: id.clone(),
            display_name,
            display_color: USER_COLORS[color_index].to_string(),
            role,
            account_id,
            connected_at: now,
            last_activity_at: now,
            online: true,
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            id,
            Entry {
                identity: identity.clone(),
                last_activity_at: AtomicU64::new(now),
                offline_since: None,
            },
        );
        info!("Identity {} connected as {:?} ({:?})", identity.id, identity.display_name, identity.role);
        identity
    }

    pub fn get(&self, id: &str) -> Option<Identity> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(Entry::snapshot)
    }

    /// Record inbound activity. Returns false for unknown ids. Runs on every
    /// event, so it only takes the shared read lock.
    pub fn touch(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(id) {
            Some(entry) => {
                entry.last_activity_at.fetch_max(now_millis(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Flip to offline and start the grace window. Never fails.
    pub fn disconnect(&self, id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(id) {
            entry.identity.online = false;
            entry.offline_since = Some(Instant::now());
            debug!("Identity {} offline", id);
        }
    }

    pub fn online_count(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|entry| entry.identity.online).count()
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Drop identities that have been offline longer than the grace window.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| match entry.offline_since {
            Some(since) => now.saturating_duration_since(since) < self.grace,
            None => true,
        });
        before - entries.len()
    }
}

fn sanitize_display_name(raw: Option<&str>) -> Option<String> {
    let cleaned: String = raw?
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DISPLAY_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}
