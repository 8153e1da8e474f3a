#![forbid(unsafe_code)]

// Membership and permission mutations, applied under the room lock

use super::failover::{self, HostChange};
use super::roles::{authorize, Capability, Gate, ParticipantRole};
use super::settings::SettingsPatch;
use super::{Member, Participant, Room};
use crate::error::{RelayError, RelayResult};
use crate::identity::IdentityRole;
use std::time::Instant;
use tracing::info;

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinGrant {
    pub role: ParticipantRole,
    pub color: String,
    /// The room was empty and pending deletion; the joiner took it over as host
    pub took_over: bool,
}

/// Result of removing a participant.
#[derive(Debug)]
pub struct Departure {
    pub participant: Participant,
    pub host_change: Option<HostChange>,
    pub now_empty: bool,
}

/// Add `member` as a viewer, or as host when the room is empty. Only an
/// admin identity may ask to enter as moderator.
pub fn join(
    room: &mut Room,
    member: Member,
    requested: Option<ParticipantRole>,
    now: Instant,
) -> RelayResult<JoinGrant> {
    let role = match requested {
        None | Some(ParticipantRole::Viewer) => ParticipantRole::Viewer,
        Some(ParticipantRole::Moderator) if member.identity_role == IdentityRole::Admin => ParticipantRole::Moderator,
        Some(ParticipantRole::Moderator) => {
            return Err(RelayError::Forbidden("moderator role requires an admin identity".into()))
        }
        Some(ParticipantRole::Host) => {
            return Err(RelayError::Validation("the host role is assigned by registration".into()))
        }
    };
    if room.is_participant(&member.id) {
        return Err(RelayError::Validation(format!("already a participant of room {}", room.id)));
    }
    let capacity = room.settings.max_participants as usize;
    if room.participants.len() >= capacity {
        return Err(RelayError::CapacityExceeded(format!(
            "Room {} is full ({} participants)",
            room.id, capacity
        )));
    }

    let color = member.color.clone();
    if room.is_empty() {
        let password_hash = room.password_hash.take();
        room.install_host(member, password_hash, now);
        return Ok(JoinGrant {
            role: ParticipantRole::Host,
            color,
            took_over: true,
        });
    }

    room.insert_participant(member, role);
    room.touch(now);
    Ok(JoinGrant {
        role,
        color,
        took_over: false,
    })
}

/// Remove a participant from the room, its role sets and every grant set in
/// one step. A departing host hands over to a successor before the room lock
/// is released. Returns `None` if the identity was not a participant.
pub fn leave(room: &mut Room, identity_id: &str) -> Option<Departure> {
    let participant = room.participants.remove(identity_id)?;
    room.permissions.revoke_all(identity_id);

    let mut host_change = None;
    if room.host_id() == Some(identity_id) {
        room.host_id = None;
        host_change = failover::promote(room, identity_id);
        if let Some(change) = &host_change {
            info!(
                "Host {} left room {}, promoted {}",
                change.previous_host_id, room.id, change.new_host_id
            );
        }
    }

    Some(Departure {
        participant,
        host_change,
        now_empty: room.is_empty(),
    })
}

/// Grant or revoke a capability. Returns whether anything changed.
pub fn set_permission(
    room: &mut Room,
    actor_id: &str,
    target_id: &str,
    capability: Capability,
    granted: bool,
) -> RelayResult<bool> {
    authorize(room, actor_id, Gate::Administrator)?;
    if !room.is_participant(target_id) {
        return Err(RelayError::NotFound(format!("Participant {target_id}")));
    }
    Ok(room.permissions.set(capability, target_id, granted))
}

pub fn update_settings(room: &mut Room, actor_id: &str, patch: &SettingsPatch) -> RelayResult<()> {
    authorize(room, actor_id, Gate::Administrator)?;
    let participants = room.participants.len();
    let ceiling = room.participant_ceiling;
    room.settings.apply(patch, participants, ceiling)
}

/// Change a participant's role between viewer and moderator. Returns whether
/// anything changed.
pub fn set_role(room: &mut Room, actor_id: &str, target_id: &str, role: ParticipantRole) -> RelayResult<bool> {
    authorize(room, actor_id, Gate::Host)?;
    let actor_role = room.participant(actor_id).map_or(ParticipantRole::Viewer, |p| p.role);
    if !actor_role.can_assign(role) {
        return Err(RelayError::Validation(format!("cannot assign the {} role", role.name())));
    }
    if room.host_id() == Some(target_id) {
        return Err(RelayError::Validation("the host's role cannot be changed".into()));
    }
    let target = room
        .participants
        .get_mut(target_id)
        .ok_or_else(|| RelayError::NotFound(format!("Participant {target_id}")))?;
    if target.role == role {
        return Ok(false);
    }
    target.role = role;
    Ok(true)
}

/// Check that `actor_id` may remove `target_id` from the room.
pub fn check_kick(room: &Room, actor_id: &str, target_id: &str) -> RelayResult<()> {
    authorize(room, actor_id, Gate::Administrator)?;
    let actor = room
        .participant(actor_id)
        .ok_or_else(|| RelayError::Forbidden(format!("not a participant of room {}", room.id)))?;
    let target = room
        .participant(target_id)
        .ok_or_else(|| RelayError::NotFound(format!("Participant {target_id}")))?;
    if !actor.role.can_kick(target.role) {
        return Err(RelayError::Forbidden(format!(
            "a {} cannot remove a {}",
            actor.role.name(),
            target.role.name()
        )));
    }
    Ok(())
}
