#![forbid(unsafe_code)]

// Participant roles, capability grants and the single authorization check

use super::Room;
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role of a participant inside one room. Ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Viewer = 0,
    Moderator = 1,
    Host = 2,
}

impl ParticipantRole {
    pub fn name(&self) -> &'static str {
        match self {
            ParticipantRole::Host => "host",
            ParticipantRole::Moderator => "moderator",
            ParticipantRole::Viewer => "viewer",
        }
    }

    /// Settings and permission changes are reserved for host and moderators.
    pub fn can_administer(&self) -> bool {
        *self >= ParticipantRole::Moderator
    }

    pub fn can_kick(&self, target: ParticipantRole) -> bool {
        self.can_administer() && *self > target
    }

    /// Only the host hands out roles, and the host role itself is never
    /// assigned this way (failover owns that transition).
    pub fn can_assign(&self, new_role: ParticipantRole) -> bool {
        *self == ParticipantRole::Host && new_role != ParticipantRole::Host
    }
}

/// Fine-grained grants checked before relaying input, drawing and uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Control,
    Draw,
    Upload,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Control, Capability::Draw, Capability::Upload];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::Control => "control",
            Capability::Draw => "draw",
            Capability::Upload => "upload",
        }
    }
}

/// The three grant sets of a room.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    controllers: HashSet<String>,
    drawers: HashSet<String>,
    uploaders: HashSet<String>,
}

impl Permissions {
    /// Grant sets for a fresh room: the host holds every capability.
    pub fn seeded(host_id: &str) -> Self {
        let mut permissions = Self::default();
        for capability in Capability::ALL {
            permissions.set(capability, host_id, true);
        }
        permissions
    }

    pub fn holders(&self, capability: Capability) -> &HashSet<String> {
        match capability {
            Capability::Control => &self.controllers,
            Capability::Draw => &self.drawers,
            Capability::Upload => &self.uploaders,
        }
    }

    fn holders_mut(&mut self, capability: Capability) -> &mut HashSet<String> {
        match capability {
            Capability::Control => &mut self.controllers,
            Capability::Draw => &mut self.drawers,
            Capability::Upload => &mut self.uploaders,
        }
    }

    pub fn has(&self, capability: Capability, identity_id: &str) -> bool {
        self.holders(capability).contains(identity_id)
    }

    /// Grant or revoke. Returns whether the set actually changed; repeating a
    /// grant or revoking something never granted is a successful no-op.
    pub fn set(&mut self, capability: Capability, identity_id: &str, granted: bool) -> bool {
        let holders = self.holders_mut(capability);
        if granted {
            holders.insert(identity_id.to_string())
        } else {
            holders.remove(identity_id)
        }
    }

    /// Drop an identity from all three sets (room departure).
    pub fn revoke_all(&mut self, identity_id: &str) {
        for capability in Capability::ALL {
            self.holders_mut(capability).remove(identity_id);
        }
    }

    pub fn snapshot(&self) -> PermissionsSnapshot {
        let sorted = |set: &HashSet<String>| {
            let mut ids: Vec<String> = set.iter().cloned().collect();
            ids.sort();
            ids
        };
        PermissionsSnapshot {
            controllers: sorted(&self.controllers),
            drawers: sorted(&self.drawers),
            uploaders: sorted(&self.uploaders),
        }
    }
}

/// Wire form of [`Permissions`], with ids sorted for stable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsSnapshot {
    pub controllers: Vec<String>,
    pub drawers: Vec<String>,
    pub uploaders: Vec<String>,
}

/// What an inbound event requires of its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// No room involved (lobby-level requests)
    Open,
    /// Sender must be a participant of the room
    Member,
    /// Sender must be the host or hold the capability
    Capability(Capability),
    /// Sender must be the host or a moderator
    Administrator,
    /// Sender must be the host
    Host,
}

/// The one authorization check every room operation goes through.
pub fn authorize(room: &Room, identity_id: &str, gate: Gate) -> RelayResult<()> {
    let is_host = room.host_id() == Some(identity_id);
    let denied = match gate {
        Gate::Open => None,
        Gate::Member if room.is_participant(identity_id) => None,
        Gate::Member => Some(format!("not a participant of room {}", room.id)),
        Gate::Capability(capability) if is_host || room.permissions.has(capability, identity_id) => None,
        Gate::Capability(capability) => Some(format!("{} permission required", capability.name())),
        Gate::Administrator
            if room
                .participant(identity_id)
                .is_some_and(|p| p.role.can_administer()) =>
        {
            None
        }
        Gate::Administrator => Some("host or moderator role required".to_string()),
        Gate::Host if is_host => None,
        Gate::Host => Some("host role required".to_string()),
    };

    match denied {
        None => Ok(()),
        Some(reason) => Err(RelayError::Forbidden(reason)),
    }
}
