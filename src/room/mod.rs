#![forbid(unsafe_code)]

// Room module - room registry, per-room state and participant fan-out
pub mod api;
pub mod failover;
pub mod history;
pub mod membership;
pub mod password;
pub mod roles;
pub mod settings;

use crate::config::RoomLimits;
use crate::error::{RelayError, RelayResult};
use crate::identity::{short_id, Identity, IdentityRole};
use crate::metrics::ServerMetrics;
use crate::now_millis;
use crate::outbound::{self, Delivery, Outbound};
use crate::signaling::protocol::{SenderStamp, ServerEvent};
use history::{BoundedHistory, ChatMessage, FileRecord};
use membership::{Departure, JoinGrant};
use roles::{ParticipantRole, Permissions, PermissionsSnapshot};
use serde::{Deserialize, Serialize};
use settings::RoomSettings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type RoomHandle = Arc<TokioMutex<Room>>;
type RoomMap = Arc<StdRwLock<HashMap<String, RoomHandle>>>;

/// Participant in a room
#[derive(Clone, Debug)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub color: String,
    pub identity_role: IdentityRole,
    pub role: ParticipantRole,
    /// Monotonic join order within the room, used for host succession
    pub joined_seq: u64,
    pub outbound: Outbound,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
            role: self.role,
            identity_role: self.identity_role,
        }
    }

    pub fn stamp(&self, timestamp: u64) -> SenderStamp {
        SenderStamp {
            sender_id: self.id.clone(),
            sender_name: self.display_name.clone(),
            color: self.color.clone(),
            timestamp,
        }
    }
}

/// An identity about to enter a room, together with its delivery queue.
#[derive(Clone, Debug)]
pub struct Member {
    pub id: String,
    pub display_name: String,
    pub color: String,
    pub identity_role: IdentityRole,
    pub outbound: Outbound,
}

impl Member {
    pub fn from_identity(identity: &Identity, outbound: Outbound) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            color: identity.display_color.clone(),
            identity_role: identity.role,
            outbound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub display_name: String,
    pub color: String,
    pub role: ParticipantRole,
    pub identity_role: IdentityRole,
}

/// Full room state as sent to a host or joiner. Never includes the password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: String,
    pub host_id: Option<String>,
    /// Ordered by join time
    pub participants: Vec<ParticipantInfo>,
    pub viewer_ids: Vec<String>,
    pub moderator_ids: Vec<String>,
    pub screen_active: bool,
    pub settings: RoomSettings,
    pub quality_scale: f32,
    pub chat_history: Vec<ChatMessage>,
    pub files: Vec<FileRecord>,
    pub permissions: PermissionsSnapshot,
    pub password_protected: bool,
    pub created_at: u64,
    pub last_frame_at: Option<u64>,
}

/// Lobby-level view of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub participant_count: usize,
    pub host_short_id: Option<String>,
    pub screen_active: bool,
    pub capacity: u32,
    pub password_protected: bool,
    pub created_at: u64,
}

/// Room state
pub struct Room {
    pub(crate) id: String,
    pub(crate) host_id: Option<String>,
    pub(crate) participants: HashMap<String, Participant>,
    next_seq: u64,
    pub(crate) screen_active: bool,
    pub(crate) settings: RoomSettings,
    /// Upper bound the settings may raise `maxParticipants` to
    pub(crate) participant_ceiling: u32,
    pub(crate) chat_history: BoundedHistory<ChatMessage>,
    pub(crate) files: BoundedHistory<FileRecord>,
    pub(crate) permissions: Permissions,
    pub(crate) password_hash: Option<String>,
    created_at: u64,
    pub(crate) last_frame_at: Option<u64>,
    activity_deadline: Instant,
    idle_timeout: Duration,
    /// Set under the room lock right before removal from the registry, so a
    /// handle obtained earlier can tell the room is gone
    pub(crate) closed: bool,
}

impl Room {
    pub(crate) fn new(id: String, limits: &RoomLimits, now: Instant) -> Self {
        Self {
            id,
            host_id: None,
            participants: HashMap::new(),
            next_seq: 0,
            screen_active: false,
            settings: RoomSettings::with_capacity(limits.max_participants),
            participant_ceiling: limits.max_participants,
            chat_history: BoundedHistory::new(limits.chat_history_limit),
            files: BoundedHistory::new(limits.file_history_limit),
            permissions: Permissions::default(),
            password_hash: None,
            created_at: now_millis(),
            last_frame_at: None,
            activity_deadline: now + limits.idle_timeout,
            idle_timeout: limits.idle_timeout,
            closed: false,
        }
    }

    /// Make `member` the host of an empty room, with grant sets seeded for it.
    pub(crate) fn install_host(&mut self, member: Member, password_hash: Option<String>, now: Instant) {
        let host_id = member.id.clone();
        self.insert_participant(member, ParticipantRole::Host);
        self.host_id = Some(host_id.clone());
        self.permissions = Permissions::seeded(&host_id);
        self.password_hash = password_hash;
        self.screen_active = false;
        self.touch(now);
    }

    pub(crate) fn insert_participant(&mut self, member: Member, role: ParticipantRole) {
        let participant = Participant {
            id: member.id.clone(),
            display_name: member.display_name,
            color: member.color,
            identity_role: member.identity_role,
            role,
            joined_seq: self.next_seq,
            outbound: member.outbound,
        };
        self.next_seq += 1;
        self.participants.insert(member.id, participant);
    }

    /// Push the inactivity deadline out by the idle timeout.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.activity_deadline = now + self.idle_timeout;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn participant(&self, identity_id: &str) -> Option<&Participant> {
        self.participants.get(identity_id)
    }

    pub fn is_participant(&self, identity_id: &str) -> bool {
        self.participants.contains_key(identity_id)
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn is_active(&self, now: Instant) -> bool {
        !self.closed && !self.is_empty() && self.activity_deadline > now
    }

    fn ids_with_role(&self, role: ParticipantRole) -> Vec<String> {
        let mut members: Vec<&Participant> = self.participants.values().filter(|p| p.role == role).collect();
        members.sort_by_key(|p| p.joined_seq);
        members.into_iter().map(|p| p.id.clone()).collect()
    }

    pub fn viewer_ids(&self) -> Vec<String> {
        self.ids_with_role(ParticipantRole::Viewer)
    }

    pub fn moderator_ids(&self) -> Vec<String> {
        self.ids_with_role(ParticipantRole::Moderator)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by_key(|p| p.joined_seq);

        RoomSnapshot {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            participants: participants.into_iter().map(Participant::info).collect(),
            viewer_ids: self.viewer_ids(),
            moderator_ids: self.moderator_ids(),
            screen_active: self.screen_active,
            settings: self.settings.clone(),
            quality_scale: self.settings.quality.scale(),
            chat_history: self.chat_history.to_vec(),
            files: self.files.to_vec(),
            permissions: self.permissions.snapshot(),
            password_protected: self.password_hash.is_some(),
            created_at: self.created_at,
            last_frame_at: self.last_frame_at,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            participant_count: self.participants.len(),
            host_short_id: self.host_id.as_deref().map(|id| short_id(id).to_string()),
            screen_active: self.screen_active,
            capacity: self.settings.max_participants,
            password_protected: self.password_hash.is_some(),
            created_at: self.created_at,
        }
    }

    fn deliver(&self, participant: &Participant, json: &Arc<String>) -> bool {
        match participant.outbound.deliver(json) {
            Delivery::Queued => true,
            Delivery::Overflow => {
                warn!(
                    "Outbound queue full for participant {} in room {}, disconnecting",
                    participant.id, self.id
                );
                false
            }
            Delivery::Closed => {
                debug!("Channel closed for participant {} in room {} (disconnected)", participant.id, self.id);
                false
            }
        }
    }

    /// Send an event to one participant.
    pub(crate) fn send_to(&self, participant_id: &str, event: &ServerEvent) -> bool {
        let Some(participant) = self.participants.get(participant_id) else {
            return false;
        };
        match outbound::encode(event) {
            Some(json) => self.deliver(participant, &json),
            None => false,
        }
    }

    /// Broadcast an event to all participants. Returns the number queued.
    pub(crate) fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let Some(json) = outbound::encode(event) else {
            return 0;
        };
        self.participants
            .values()
            .filter(|p| self.deliver(p, &json))
            .count()
    }

    /// Broadcast an event to all participants except the sender.
    pub(crate) fn broadcast_except(&self, sender_id: &str, event: &ServerEvent) -> usize {
        let Some(json) = outbound::encode(event) else {
            return 0;
        };
        self.participants
            .values()
            .filter(|p| p.id != sender_id)
            .filter(|p| self.deliver(p, &json))
            .count()
    }
}

struct PendingDeletion {
    token: u64,
    timer: JoinHandle<()>,
}

/// Owns every room.
///
/// The outer HashMap is protected by a std::sync::RwLock held only for brief
/// lookups, inserts and removals, never across await points. Each room is
/// protected by its own tokio::sync::Mutex. Nothing blocks on a room lock
/// while holding the outer lock; removal paths only `try_lock`.
pub struct RoomManager {
    rooms: RoomMap,
    pending_deletions: Arc<StdMutex<HashMap<String, PendingDeletion>>>,
    next_token: AtomicU64,
    limits: RoomLimits,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(limits: RoomLimits, metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            pending_deletions: Arc::new(StdMutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
            limits,
            metrics,
        }
    }

    pub fn limits(&self) -> &RoomLimits {
        &self.limits
    }

    pub fn validate_room_id(&self, room_id: &str) -> RelayResult<()> {
        let len = room_id.chars().count();
        if len < self.limits.min_room_id_len || len > self.limits.max_room_id_len {
            return Err(RelayError::Validation(format!(
                "roomId must be {}-{} characters",
                self.limits.min_room_id_len, self.limits.max_room_id_len
            )));
        }
        if !room_id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(RelayError::Validation(
                "roomId may only contain letters, digits, '-' and '_'".into(),
            ));
        }
        Ok(())
    }

    /// Brief outer read lock, no await
    fn lookup(&self, room_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Lock a live room. Rooms removed while we waited for the lock report
    /// NotFound.
    pub async fn lock_room(&self, room_id: &str) -> RelayResult<OwnedMutexGuard<Room>> {
        let handle = self.lookup(room_id).ok_or_else(|| RelayError::room_not_found(room_id))?;
        let room = handle.lock_owned().await;
        if room.closed {
            return Err(RelayError::room_not_found(room_id));
        }
        Ok(room)
    }

    /// Register `host` as the host of a new room.
    ///
    /// An existing room that is empty and waiting out its grace delay is
    /// taken over instead; any other existing room is `AlreadyExists`.
    pub async fn create_room(&self, room_id: &str, host: Member, password: Option<&str>) -> RelayResult<RoomSnapshot> {
        self.validate_room_id(room_id)?;
        let password_hash = match password.filter(|p| !p.is_empty()) {
            Some(p) => Some(password::hash_password(p)?),
            None => None,
        };

        loop {
            if let Some(handle) = self.lookup(room_id) {
                let mut room = handle.lock().await;
                if room.closed {
                    // Removed between lookup and lock; the map no longer has it
                    continue;
                }
                if !room.is_empty() {
                    return Err(RelayError::AlreadyExists(room_id.to_string()));
                }
                self.cancel_deletion(room_id);
                let host_id = host.id.clone();
                room.install_host(host, password_hash, Instant::now());
                info!("Host {} took over empty room {}", host_id, room_id);
                return Ok(announce_host(&room, &host_id));
            }

            let handle: RoomHandle = Arc::new(TokioMutex::new(Room::new(
                room_id.to_string(),
                &self.limits,
                Instant::now(),
            )));
            // Fresh mutex, nobody else can hold it yet
            let mut room = handle.clone().lock_owned().await;
            {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                if rooms.contains_key(room_id) {
                    // Lost a creation race; resolve it against the winner
                    continue;
                }
                if rooms.len() >= self.limits.max_rooms {
                    return Err(RelayError::CapacityExceeded(format!(
                        "server is at its limit of {} rooms",
                        self.limits.max_rooms
                    )));
                }
                rooms.insert(room_id.to_string(), handle);
            }

            let host_id = host.id.clone();
            room.install_host(host, password_hash, Instant::now());
            self.metrics.inc_rooms_created();
            info!("Room {} created by host {}", room_id, host_id);
            return Ok(announce_host(&room, &host_id));
        }
    }

    /// Snapshot of a live room. Empty rooms awaiting deletion are not live.
    pub async fn get_room(&self, room_id: &str) -> Option<RoomSnapshot> {
        let room = self.lock_room(room_id).await.ok()?;
        (!room.is_empty()).then(|| room.snapshot())
    }

    pub async fn room_status(&self, room_id: &str) -> Option<RoomSummary> {
        let room = self.lock_room(room_id).await.ok()?;
        (!room.is_empty()).then(|| room.summary())
    }

    /// Summaries of non-empty rooms whose inactivity deadline has not passed,
    /// oldest first.
    pub async fn list_active(&self) -> Vec<RoomSummary> {
        let handles: Vec<RoomHandle> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let now = Instant::now();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let room = handle.lock().await;
            if room.is_active(now) {
                summaries.push(room.summary());
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Add `member` to an existing room. Joining an empty room that is
    /// waiting out its grace delay cancels the deletion and makes the joiner
    /// host.
    pub async fn join_room(
        &self,
        room_id: &str,
        member: Member,
        password: Option<&str>,
        requested_role: Option<ParticipantRole>,
    ) -> RelayResult<RoomSnapshot> {
        let member_id = member.id.clone();
        let (room, grant) = loop {
            let verified_hash = self.lock_room(room_id).await?.password_hash.clone();
            // Hash check runs without holding the room lock
            if let Some(hash) = &verified_hash {
                password::verify_password(password, hash)?;
            }

            let mut room = self.lock_room(room_id).await?;
            match admit(&mut room, member.clone(), requested_role, verified_hash.as_deref())? {
                Some(grant) => break (room, grant),
                None => debug!("Password of room {} changed during join by {}, checking again", room_id, member_id),
            }
        };
        if grant.took_over {
            self.cancel_deletion(room_id);
            info!("Participant {} revived empty room {} as host", member_id, room_id);
        }

        let snapshot = room.snapshot();
        if let Some(joined) = room.participant(&member_id).map(Participant::info) {
            room.send_to(
                &member_id,
                &ServerEvent::RoomJoined {
                    room: snapshot.clone(),
                    user_color: grant.color,
                    user_data: joined.clone(),
                },
            );
            room.broadcast_except(&member_id, &ServerEvent::UserJoined { user: joined });
        }

        self.metrics.inc_joins();
        info!("Participant {} joined room {} as {}", member_id, room_id, grant.role.name());
        Ok(snapshot)
    }

    /// Remove a participant. An emptied room is scheduled for deletion.
    pub async fn leave_room(&self, room_id: &str, identity_id: &str) -> RelayResult<()> {
        let departure = {
            let mut room = self.lock_room(room_id).await?;
            self.depart(&mut room, identity_id)
                .ok_or_else(|| RelayError::NotFound(format!("Participant {identity_id}")))?
        };
        if departure.now_empty {
            self.schedule_deletion(room_id);
        }
        Ok(())
    }

    /// Remove `target_id` on behalf of a host or moderator that outranks it.
    pub async fn kick_participant(&self, room_id: &str, actor_id: &str, target_id: &str) -> RelayResult<()> {
        let departure = {
            let mut room = self.lock_room(room_id).await?;
            membership::check_kick(&room, actor_id, target_id)?;
            room.send_to(
                target_id,
                &ServerEvent::Kicked {
                    room_id: room_id.to_string(),
                    by: actor_id.to_string(),
                },
            );
            self.depart(&mut room, target_id)
                .ok_or_else(|| RelayError::NotFound(format!("Participant {target_id}")))?
        };
        info!("kick: {} removed {} from room {}", actor_id, target_id, room_id);
        if departure.now_empty {
            self.schedule_deletion(room_id);
        }
        Ok(())
    }

    /// Apply a departure and notify whoever is left. Runs under the room lock
    /// so the host change is observed exactly once.
    fn depart(&self, room: &mut Room, identity_id: &str) -> Option<Departure> {
        let departure = membership::leave(room, identity_id)?;
        self.metrics.inc_leaves();
        info!("Participant {} left room {}", identity_id, room.id);

        room.broadcast_all(&ServerEvent::UserLeft {
            user_id: departure.participant.id.clone(),
            display_name: departure.participant.display_name.clone(),
        });

        if let Some(change) = &departure.host_change {
            self.metrics.inc_host_failovers();
            room.broadcast_all(&ServerEvent::HostChanged {
                room_id: room.id.clone(),
                new_host_id: change.new_host_id.clone(),
                previous_host_id: change.previous_host_id.clone(),
            });
            let new_host_name = room
                .participant(&change.new_host_id)
                .map(|p| p.display_name.clone())
                .unwrap_or_default();
            room.broadcast_all(&ServerEvent::SystemMessage {
                kind: "host-changed".into(),
                message: format!("{new_host_name} is now the host"),
                timestamp: now_millis(),
            });
        }
        Some(departure)
    }

    /// Remove the room after the grace delay unless someone claims it first.
    pub fn schedule_deletion(&self, room_id: &str) {
        let grace = self.limits.empty_room_grace;
        if grace.is_zero() {
            if remove_if_empty(&self.rooms, room_id) {
                info!("Room {} is empty, removed", room_id);
                self.metrics.add_rooms_reclaimed(1);
            }
            return;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let rooms = self.rooms.clone();
        let pending = self.pending_deletions.clone();
        let metrics = self.metrics.clone();
        let rid = room_id.to_string();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                if pending.get(&rid).is_some_and(|p| p.token == token) {
                    pending.remove(&rid);
                }
            }
            if remove_if_empty(&rooms, &rid) {
                info!("Grace delay expired, removed empty room {}", rid);
                metrics.add_rooms_reclaimed(1);
            }
        });

        debug!("Room {} is empty, removing in {:?} unless rejoined", room_id, grace);
        let mut pending = self.pending_deletions.lock().unwrap_or_else(|e| e.into_inner());
        // Cancel any earlier timer for this room
        if let Some(old) = pending.insert(room_id.to_string(), PendingDeletion { token, timer }) {
            old.timer.abort();
        }
    }

    fn cancel_deletion(&self, room_id: &str) {
        let mut pending = self.pending_deletions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = pending.remove(room_id) {
            entry.timer.abort();
            debug!("Cancelled pending deletion of room {}", room_id);
        }
    }

    pub fn has_pending_deletion(&self, room_id: &str) -> bool {
        let pending = self.pending_deletions.lock().unwrap_or_else(|e| e.into_inner());
        pending.contains_key(room_id)
    }

    pub fn reclaim_idle(&self) -> usize {
        self.reclaim_idle_at(Instant::now())
    }

    /// Remove rooms that are empty or past their inactivity deadline.
    ///
    /// Rooms whose lock is held are skipped: someone is using them right now.
    /// Participants of a reclaimed room get `room-closed`. Idempotent.
    pub fn reclaim_idle_at(&self, now: Instant) -> usize {
        // Room id and the queues of whoever was still inside
        let mut reclaimed: Vec<(String, Vec<Outbound>)> = Vec::new();
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.retain(|room_id, handle| {
                let Ok(mut room) = handle.try_lock() else {
                    return true;
                };
                if !room.is_empty() && room.activity_deadline > now {
                    return true;
                }
                room.closed = true;
                let recipients = room.participants.values().map(|p| p.outbound.clone()).collect();
                reclaimed.push((room_id.clone(), recipients));
                false
            });
        }

        for (room_id, recipients) in &reclaimed {
            self.cancel_deletion(room_id);
            if !recipients.is_empty() {
                let closed = ServerEvent::RoomClosed {
                    room_id: room_id.clone(),
                    reason: "idle".into(),
                };
                if let Some(json) = outbound::encode(&closed) {
                    for recipient in recipients {
                        recipient.deliver(&json);
                    }
                }
            }
            info!("Reclaimed room {} ({} participants)", room_id, recipients.len());
        }
        if !reclaimed.is_empty() {
            self.metrics.add_rooms_reclaimed(reclaimed.len() as u64);
        }
        reclaimed.len()
    }

    /// Close every room, telling participants why.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(String, RoomHandle)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };
        {
            let mut pending = self.pending_deletions.lock().unwrap_or_else(|e| e.into_inner());
            for (_, entry) in pending.drain() {
                entry.timer.abort();
            }
        }

        for (room_id, handle) in &all_rooms {
            let mut room = handle.lock().await;
            room.closed = true;
            room.broadcast_all(&ServerEvent::RoomClosed {
                room_id: room_id.clone(),
                reason: "shutdown".into(),
            });
            info!("Shut down room {} ({} participants)", room_id, room.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count, including empty rooms awaiting deletion
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total participant count across all rooms (busy rooms are skipped)
    pub fn total_participant_count(&self) -> usize {
        let handles: Vec<RoomHandle> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        handles
            .iter()
            .filter_map(|handle| handle.try_lock().ok().map(|room| room.len()))
            .sum()
    }
}

/// Confirm registration to the new host and return the snapshot it was sent.
fn announce_host(room: &Room, host_id: &str) -> RoomSnapshot {
    let snapshot = room.snapshot();
    room.send_to(host_id, &ServerEvent::HostConfirmed { room: snapshot.clone() });
    let host_name = room.participant(host_id).map(|p| p.display_name.clone()).unwrap_or_default();
    room.broadcast_all(&ServerEvent::SystemMessage {
        kind: "host-registered".into(),
        message: format!("{host_name} is hosting room {}", room.id),
        timestamp: now_millis(),
    });
    snapshot
}

/// Join under the room lock, provided the password is still the one the
/// joiner was verified against. `Ok(None)` means it changed in between.
fn admit(
    room: &mut Room,
    member: Member,
    requested_role: Option<ParticipantRole>,
    verified_hash: Option<&str>,
) -> RelayResult<Option<JoinGrant>> {
    if room.password_hash.as_deref() != verified_hash {
        return Ok(None);
    }
    membership::join(room, member, requested_role, Instant::now()).map(Some)
}

/// Remove an empty room from the registry, marking it closed first. A room
/// whose lock is busy is left alone; the sweeper gets it later.
fn remove_if_empty(rooms: &RoomMap, room_id: &str) -> bool {
    let mut rooms = rooms.write().unwrap_or_else(|e| e.into_inner());
    let Some(handle) = rooms.get(room_id) else {
        return false;
    };
    let removable = match handle.try_lock() {
        Ok(mut room) if room.is_empty() => {
            room.closed = true;
            true
        }
        _ => false,
    };
    if removable {
        rooms.remove(room_id);
    }
    removable
}


#[cfg(test)]
mod tests {
    use super::test_support::member;
    use super::*;

    fn manager_with(limits: RoomLimits) -> RoomManager {
        RoomManager::new(limits, ServerMetrics::new())
    }

    fn manager() -> RoomManager {
        manager_with(RoomLimits::default())
    }

    #[tokio::test]
    async fn test_create_room_confirms_host() {
        let rooms = manager();
        let (host, mut host_rx) = member("h");
        let snapshot = rooms.create_room("abc", host, None).await.unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some("h"));
        assert!(snapshot.viewer_ids.is_empty());
        assert!(!snapshot.screen_active);
        assert_eq!(snapshot.permissions.controllers, vec!["h".to_string()]);

        let events = host_rx.drain_events();
        assert!(matches!(events[0], ServerEvent::HostConfirmed { .. }));
        assert!(matches!(&events[1], ServerEvent::SystemMessage { kind, .. } if kind == "host-registered"));
    }

    #[tokio::test]
    async fn test_duplicate_room_rejected() {
        let rooms = manager();
        let (h1, _rx1) = member("h1");
        let (h2, _rx2) = member("h2");
        rooms.create_room("abc", h1, None).await.unwrap();
        assert_eq!(
            rooms.create_room("abc", h2, None).await.unwrap_err(),
            RelayError::AlreadyExists("abc".into())
        );
    }

    #[tokio::test]
    async fn test_room_id_validation() {
        let rooms = manager();
        let (h, _rx) = member("h");
        assert!(matches!(rooms.create_room("ab", h.clone(), None).await, Err(RelayError::Validation(_))));
        assert!(matches!(rooms.create_room("has space", h, None).await, Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let rooms = manager_with(RoomLimits {
            max_rooms: 1,
            ..RoomLimits::default()
        });
        let (h1, _rx1) = member("h1");
        let (h2, _rx2) = member("h2");
        rooms.create_room("one", h1, None).await.unwrap();
        assert!(matches!(
            rooms.create_room("two", h2, None).await,
            Err(RelayError::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_join_notifies_joiner_and_room() {
        let rooms = manager();
        let (host, mut host_rx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        host_rx.drain_events();

        let (viewer, mut viewer_rx) = member("v1");
        let snapshot = rooms.join_room("abc", viewer, None, None).await.unwrap();
        assert_eq!(snapshot.viewer_ids, vec!["v1".to_string()]);

        match &viewer_rx.drain_events()[0] {
            ServerEvent::RoomJoined { room, user_data, .. } => {
                assert_eq!(room.host_id.as_deref(), Some("h"));
                assert_eq!(user_data.role, ParticipantRole::Viewer);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&host_rx.drain_events()[0], ServerEvent::UserJoined { user } if user.id == "v1"));
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let rooms = manager();
        let (viewer, _rx) = member("v1");
        assert_eq!(
            rooms.join_room("nope", viewer, None, None).await.unwrap_err(),
            RelayError::room_not_found("nope")
        );
    }

    #[tokio::test]
    async fn test_password_protected_room() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        let snapshot = rooms.create_room("abc", host, Some("hunter2")).await.unwrap();
        assert!(snapshot.password_protected);

        let (v1, _rx1) = member("v1");
        assert!(matches!(rooms.join_room("abc", v1.clone(), None, None).await, Err(RelayError::Forbidden(_))));
        assert!(matches!(rooms.join_room("abc", v1.clone(), Some("nope"), None).await, Err(RelayError::Forbidden(_))));
        assert!(rooms.join_room("abc", v1, Some("hunter2"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_host_leave_broadcasts_one_host_change() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        let (v1, mut rx1) = member("v1");
        let (v2, mut rx2) = member("v2");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.join_room("abc", v1, None, None).await.unwrap();
        rooms.join_room("abc", v2, None, None).await.unwrap();
        rx1.drain_events();
        rx2.drain_events();

        rooms.leave_room("abc", "h").await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let changes: Vec<_> = rx
                .drain_events()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::HostChanged { new_host_id, previous_host_id, .. } => Some((new_host_id, previous_host_id)),
                    _ => None,
                })
                .collect();
            assert_eq!(changes, vec![("v1".to_string(), "h".to_string())]);
        }

        let snapshot = rooms.get_room("abc").await.unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some("v1"));
        assert!(!snapshot.screen_active);
    }

    #[tokio::test]
    async fn test_password_set_between_check_and_join_is_enforced() {
        let rooms = manager();
        let (h1, _rx1) = member("h1");
        rooms.create_room("abc", h1, None).await.unwrap();
        // The joiner was checked against an open room
        let verified_hash = rooms.lock_room("abc").await.unwrap().password_hash.clone();
        assert!(verified_hash.is_none());

        // A takeover installs a password before the joiner gets the lock back
        {
            let mut room = rooms.lock_room("abc").await.unwrap();
            membership::leave(&mut room, "h1").unwrap();
            let (h2, _rx2) = member("h2");
            let hash = password::hash_password("secret").unwrap();
            room.install_host(h2, Some(hash), Instant::now());
        }

        let (v, _rxv) = member("v");
        {
            let mut room = rooms.lock_room("abc").await.unwrap();
            assert!(admit(&mut room, v.clone(), None, verified_hash.as_deref()).unwrap().is_none());
            assert!(!room.is_participant("v"));
        }

        // Retrying re-verifies against the new password
        assert!(matches!(rooms.join_room("abc", v.clone(), None, None).await, Err(RelayError::Forbidden(_))));
        assert!(rooms.join_room("abc", v, Some("secret"), None).await.is_ok());
        let snapshot = rooms.get_room("abc").await.unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some("h2"));
        assert_eq!(snapshot.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_leave_twice_is_not_found() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        let (v1, _rx1) = member("v1");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.join_room("abc", v1, None, None).await.unwrap();
        rooms.leave_room("abc", "v1").await.unwrap();
        assert!(matches!(rooms.leave_room("abc", "v1").await, Err(RelayError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_deleted_after_grace() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.leave_room("abc", "h").await.unwrap();

        // Logically gone right away, physically after the grace delay
        assert!(rooms.list_active().await.is_empty());
        assert!(rooms.get_room("abc").await.is_none());
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.has_pending_deletion("abc"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rooms.room_count(), 0);
        assert!(!rooms.has_pending_deletion("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_during_grace_cancels_deletion() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.leave_room("abc", "h").await.unwrap();

        let (v1, _rx1) = member("v1");
        let snapshot = rooms.join_room("abc", v1, None, None).await.unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some("v1"));
        assert!(!rooms.has_pending_deletion("abc"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.get_room("abc").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_host_during_grace_takes_over() {
        let rooms = manager();
        let (h1, _rx1) = member("h1");
        rooms.create_room("abc", h1, None).await.unwrap();
        rooms.leave_room("abc", "h1").await.unwrap();

        let (h2, mut rx2) = member("h2");
        let snapshot = rooms.create_room("abc", h2, None).await.unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some("h2"));
        assert!(matches!(rx2.drain_events()[0], ServerEvent::HostConfirmed { .. }));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rooms.get_room("abc").await.is_some());
    }

    #[tokio::test]
    async fn test_zero_grace_deletes_immediately() {
        let rooms = manager_with(RoomLimits {
            empty_room_grace: Duration::ZERO,
            ..RoomLimits::default()
        });
        let (host, _hrx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.leave_room("abc", "h").await.unwrap();
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_handle_sees_closed_room() {
        let rooms = manager_with(RoomLimits {
            empty_room_grace: Duration::ZERO,
            ..RoomLimits::default()
        });
        let (host, _hrx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        let stale = rooms.lookup("abc").unwrap();
        rooms.leave_room("abc", "h").await.unwrap();
        assert!(stale.lock().await.closed);
        assert!(matches!(rooms.lock_room("abc").await, Err(RelayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reclaim_idle_rooms() {
        let rooms = manager();
        let (host, mut hrx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        hrx.drain_events();

        assert_eq!(rooms.reclaim_idle_at(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(31 * 60);
        assert_eq!(rooms.reclaim_idle_at(later), 1);
        assert_eq!(rooms.room_count(), 0);
        assert!(matches!(&hrx.drain_events()[0], ServerEvent::RoomClosed { reason, .. } if reason == "idle"));

        // Idempotent
        assert_eq!(rooms.reclaim_idle_at(later), 0);
    }

    #[tokio::test]
    async fn test_reclaim_notifies_everyone_once() {
        let rooms = manager();
        let (host, mut hrx) = member("h");
        let (v1, mut rx1) = member("v1");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.join_room("abc", v1, None, None).await.unwrap();
        hrx.drain_events();
        rx1.drain_events();

        let later = Instant::now() + Duration::from_secs(31 * 60);
        assert_eq!(rooms.reclaim_idle_at(later), 1);
        for rx in [&mut hrx, &mut rx1] {
            let closed = rx
                .drain_events()
                .into_iter()
                .filter(|e| matches!(e, ServerEvent::RoomClosed { reason, .. } if reason == "idle"))
                .count();
            assert_eq!(closed, 1);
        }
        assert!(matches!(rooms.lock_room("abc").await, Err(RelayError::NotFound(_))));
        assert!(!rooms.has_pending_deletion("abc"));
    }

    #[tokio::test]
    async fn test_list_active_summaries() {
        let rooms = manager();
        let (h1, _rx1) = member("host-aaaa");
        let (h2, _rx2) = member("host-bbbb");
        rooms.create_room("one", h1, None).await.unwrap();
        rooms.create_room("two", h2, None).await.unwrap();
        rooms.leave_room("two", "host-bbbb").await.unwrap();

        let active = rooms.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "one");
        assert_eq!(active[0].participant_count, 1);
        assert_eq!(active[0].host_short_id.as_deref(), Some("aaaa"));
        assert_eq!(active[0].capacity, 50);
    }

    #[tokio::test]
    async fn test_kick_removes_target() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        let (v1, mut rx1) = member("v1");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.join_room("abc", v1, None, None).await.unwrap();
        rx1.drain_events();

        rooms.kick_participant("abc", "h", "v1").await.unwrap();
        assert!(matches!(&rx1.drain_events()[0], ServerEvent::Kicked { by, .. } if by == "h"));
        let snapshot = rooms.get_room("abc").await.unwrap();
        assert_eq!(snapshot.participants.len(), 1);

        assert!(matches!(
            rooms.kick_participant("abc", "v1", "h").await,
            Err(RelayError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms() {
        let rooms = manager();
        let (host, mut hrx) = member("h");
        rooms.create_room("abc", host, None).await.unwrap();
        hrx.drain_events();

        rooms.shutdown().await;
        assert_eq!(rooms.room_count(), 0);
        assert!(matches!(&hrx.drain_events()[0], ServerEvent::RoomClosed { reason, .. } if reason == "shutdown"));
    }

    #[tokio::test]
    async fn test_participant_counts() {
        let rooms = manager();
        let (host, _hrx) = member("h");
        let (v1, _rx1) = member("v1");
        rooms.create_room("abc", host, None).await.unwrap();
        rooms.join_room("abc", v1, None, None).await.unwrap();
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.total_participant_count(), 2);
    }
}
