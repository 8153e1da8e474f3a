#![forbid(unsafe_code)]

// Host succession when the current host leaves a room

use super::roles::ParticipantRole;
use super::Room;

/// Host state as observable from outside the room lock. A room with
/// participants but no host never escapes a locked section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
    Active(String),
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostChange {
    pub previous_host_id: String,
    pub new_host_id: String,
}

pub fn host_state(room: &Room) -> HostState {
    match room.host_id() {
        Some(id) if !room.closed => HostState::Active(id.to_string()),
        _ => HostState::Destroyed,
    }
}

/// Earliest-joined moderator, otherwise earliest-joined participant.
pub fn elect_successor(room: &Room) -> Option<String> {
    room.participants
        .values()
        .min_by_key(|p| (p.role != ParticipantRole::Moderator, p.joined_seq))
        .map(|p| p.id.clone())
}

/// Promote a successor after `previous_host_id` has already been removed.
///
/// The new host starts with no screen share and inherits nothing from the
/// previous host's explicit grants; host authority alone covers every
/// capability. Returns `None` when nobody is left.
pub fn promote(room: &mut Room, previous_host_id: &str) -> Option<HostChange> {
    let new_host_id = elect_successor(room)?;
    if let Some(participant) = room.participants.get_mut(&new_host_id) {
        participant.role = ParticipantRole::Host;
    }
    room.host_id = Some(new_host_id.clone());
    room.screen_active = false;

    Some(HostChange {
        previous_host_id: previous_host_id.to_string(),
        new_host_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomLimits;
    use crate::room::test_support::member;
    use crate::room::roles::Capability;
    use std::time::Instant;

    fn room_with(ids: &[&str]) -> Room {
        let mut room = Room::new("abc".into(), &RoomLimits::default(), Instant::now());
        let (host, _rx) = member(ids[0]);
        room.install_host(host, None, Instant::now());
        for id in &ids[1..] {
            let (m, _rx) = member(id);
            room.insert_participant(m, ParticipantRole::Viewer);
        }
        room
    }

    fn remove_host(room: &mut Room) -> String {
        let host = room.host_id().unwrap().to_string();
        room.participants.remove(&host);
        room.permissions.revoke_all(&host);
        room.host_id = None;
        host
    }

    #[test]
    fn test_earliest_participant_wins_without_moderators() {
        let mut room = room_with(&["h", "v1", "v2"]);
        let previous = remove_host(&mut room);
        let change = promote(&mut room, &previous).unwrap();
        assert_eq!(change.new_host_id, "v1");
        assert_eq!(change.previous_host_id, "h");
        assert_eq!(room.participant("v1").unwrap().role, ParticipantRole::Host);
        assert_eq!(host_state(&room), HostState::Active("v1".into()));
    }

    #[test]
    fn test_moderator_preferred_over_earlier_viewer() {
        let mut room = room_with(&["h", "v1", "m1", "m2"]);
        room.participants.get_mut("m2").unwrap().role = ParticipantRole::Moderator;
        room.participants.get_mut("m1").unwrap().role = ParticipantRole::Moderator;
        let previous = remove_host(&mut room);
        assert_eq!(promote(&mut room, &previous).unwrap().new_host_id, "m1");
    }

    #[test]
    fn test_promotion_clears_screen_and_grants() {
        let mut room = room_with(&["h", "v1"]);
        room.screen_active = true;
        let previous = remove_host(&mut room);
        promote(&mut room, &previous).unwrap();
        assert!(!room.screen_active);
        // Authority comes from being host, not from inherited set membership
        assert!(!room.permissions.has(Capability::Control, "v1"));
    }

    #[test]
    fn test_no_successor_in_empty_room() {
        let mut room = room_with(&["h"]);
        let previous = remove_host(&mut room);
        assert!(promote(&mut room, &previous).is_none());
        assert_eq!(host_state(&room), HostState::Destroyed);
    }
}
