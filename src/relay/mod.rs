#![forbid(unsafe_code)]

// Relay module - per-event authorization, stamping and fan-out

use crate::error::{RelayError, RelayResult};
use crate::identity::IdentityDirectory;
use crate::metrics::ServerMetrics;
use crate::now_millis;
use crate::outbound::Outbound;
use crate::room::history::{ChatMessage, FileRecord};
use crate::room::roles::{authorize, Capability, Gate};
use crate::room::{membership, Member, Room, RoomManager};
use crate::signaling::protocol::{ClientEvent, SenderStamp, ServerEvent};
use crate::storage::FileStore;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MAX_KEY_LEN: usize = 64;

/// Per-connection state the engine reads and updates.
pub struct Session {
    pub identity_id: String,
    pub outbound: Outbound,
    /// Room this connection currently belongs to
    pub room_id: Option<String>,
}

impl Session {
    pub fn new(identity_id: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            identity_id: identity_id.into(),
            outbound,
            room_id: None,
        }
    }
}

/// What each inbound event requires of its sender. Lobby-level events carry
/// no room and are open to every connection.
pub fn required_gate(event: &ClientEvent) -> Gate {
    match event {
        ClientEvent::RegisterHost { .. }
        | ClientEvent::JoinRoom { .. }
        | ClientEvent::LeaveRoom {}
        | ClientEvent::GetRooms {}
        | ClientEvent::GetRoomStatus { .. }
        | ClientEvent::Heartbeat {} => Gate::Open,
        ClientEvent::ScreenFrame { .. } => Gate::Capability(Capability::Control),
        ClientEvent::MouseEvent { .. } => Gate::Capability(Capability::Control),
        ClientEvent::KeyboardEvent { .. } => Gate::Capability(Capability::Control),
        ClientEvent::WhiteboardDraw { .. } => Gate::Capability(Capability::Draw),
        ClientEvent::UploadFile { .. } => Gate::Capability(Capability::Upload),
        ClientEvent::ChatMessage { .. } => Gate::Member,
        ClientEvent::UpdateRoomSettings { .. }
        | ClientEvent::SetPermissions { .. }
        | ClientEvent::KickParticipant { .. } => Gate::Administrator,
        ClientEvent::SetRole { .. } => Gate::Host,
    }
}

pub struct RelayEngine {
    rooms: Arc<RoomManager>,
    identities: Arc<IdentityDirectory>,
    files: Arc<dyn FileStore>,
    metrics: ServerMetrics,
    max_upload_bytes: usize,
}

impl RelayEngine {
    pub fn new(
        rooms: Arc<RoomManager>,
        identities: Arc<IdentityDirectory>,
        files: Arc<dyn FileStore>,
        metrics: ServerMetrics,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            rooms,
            identities,
            files,
            metrics,
            max_upload_bytes,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn identities(&self) -> &Arc<IdentityDirectory> {
        &self.identities
    }

    /// Handle one inbound event. Never fails: rejections and internal faults
    /// become an `error` event for the sender only.
    pub async fn dispatch(&self, session: &mut Session, event: ClientEvent) {
        let name = event.name();
        let started = Instant::now();
        self.metrics.inc_events_received();
        self.identities.touch(&session.identity_id);

        let result = AssertUnwindSafe(self.handle(session, event)).catch_unwind().await;
        self.metrics.observe_event_handling(started.elapsed());

        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                self.metrics.inc_rejections();
                debug!("Rejected {} from {}: {}", name, session.identity_id, err);
                err
            }
            Err(_) => {
                self.metrics.inc_errors();
                error!("Handler for {} from {} panicked", name, session.identity_id);
                RelayError::Internal(format!("failed to process {name}"))
            }
        };
        session
            .outbound
            .send(&ServerEvent::error(err.code(), err.to_string(), Some(name)));
    }

    /// Handle one inbound event, returning the rejection instead of sending it.
    pub async fn handle(&self, session: &mut Session, event: ClientEvent) -> RelayResult<()> {
        let gate = required_gate(&event);
        match event {
            ClientEvent::RegisterHost { room_id, password } => {
                let host = self.member_for(session)?;
                self.rooms.create_room(&room_id, host, password.as_deref()).await?;
                self.enter_room(session, room_id).await;
                Ok(())
            }
            ClientEvent::JoinRoom { room_id, password, role } => {
                let member = self.member_for(session)?;
                self.rooms.join_room(&room_id, member, password.as_deref(), role).await?;
                self.enter_room(session, room_id).await;
                Ok(())
            }
            ClientEvent::LeaveRoom {} => {
                self.leave_current(session).await;
                Ok(())
            }
            ClientEvent::GetRooms {} => {
                let rooms = self.rooms.list_active().await;
                session.outbound.send(&ServerEvent::RoomsList { rooms });
                Ok(())
            }
            ClientEvent::GetRoomStatus { room_id } => {
                let room = self
                    .rooms
                    .room_status(&room_id)
                    .await
                    .ok_or_else(|| RelayError::room_not_found(&room_id))?;
                session.outbound.send(&ServerEvent::RoomStatus { room });
                Ok(())
            }
            ClientEvent::Heartbeat {} => {
                session.outbound.send(&ServerEvent::HeartbeatAck { timestamp: now_millis() });
                Ok(())
            }
            ClientEvent::ScreenFrame { room_id, image_data, settings } => {
                let (mut room, sender) = self.authorized(session, &room_id, gate).await?;

                // Piggybacked settings only count from someone allowed to change them
                let settings = match settings.filter(|patch| !patch.is_empty()) {
                    Some(patch) if authorize(&room, &session.identity_id, Gate::Administrator).is_ok() => {
                        membership::update_settings(&mut room, &session.identity_id, &patch)?;
                        Some(room.settings().clone())
                    }
                    _ => None,
                };

                if !room.screen_active {
                    info!("Screen sharing started in room {} by {}", room_id, session.identity_id);
                }
                room.screen_active = true;
                room.last_frame_at = Some(sender.timestamp);
                room.touch(Instant::now());

                let delivered = room.broadcast_except(
                    &session.identity_id,
                    &ServerEvent::ScreenFrame { room_id, image_data, settings, sender },
                );
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::MouseEvent { room_id, kind, x, y, button } => {
                let (mut room, sender) = self.authorized(session, &room_id, gate).await?;
                if !x.is_finite() || !y.is_finite() {
                    return Err(RelayError::Validation("mouse coordinates must be finite".into()));
                }
                if room.host_id() != Some(session.identity_id.as_str()) && !room.settings().mouse_control_enabled {
                    return Err(RelayError::Forbidden("mouse control is disabled in this room".into()));
                }
                room.touch(Instant::now());

                let delivered = room.broadcast_except(
                    &session.identity_id,
                    &ServerEvent::MouseEvent { room_id, kind, x, y, button, sender },
                );
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::KeyboardEvent { room_id, kind, key, code } => {
                let (room, sender) = self.authorized(session, &room_id, gate).await?;
                if key.is_empty() || key.chars().count() > MAX_KEY_LEN || code.chars().count() > MAX_KEY_LEN {
                    return Err(RelayError::Validation(format!("key must be 1-{MAX_KEY_LEN} characters")));
                }
                if room.host_id() != Some(session.identity_id.as_str()) && !room.settings().keyboard_control_enabled {
                    return Err(RelayError::Forbidden("keyboard control is disabled in this room".into()));
                }

                let delivered = room.broadcast_except(
                    &session.identity_id,
                    &ServerEvent::KeyboardEvent { room_id, kind, key, code, sender },
                );
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::ChatMessage { room_id, message } => {
                let (mut room, sender) = self.authorized(session, &room_id, gate).await?;
                let chat = {
                    let participant = room
                        .participant(&session.identity_id)
                        .ok_or_else(|| RelayError::Forbidden(format!("not a participant of room {room_id}")))?;
                    ChatMessage::compose(participant, &message, sender.timestamp)?
                };
                room.chat_history.push(chat.clone());
                room.touch(Instant::now());

                let delivered = room.broadcast_all(&ServerEvent::ChatMessage(chat));
                self.metrics.inc_chat_messages();
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::WhiteboardDraw { room_id, draw_data } => {
                let (mut room, sender) = self.authorized(session, &room_id, gate).await?;
                room.touch(Instant::now());

                let delivered = room.broadcast_except(
                    &session.identity_id,
                    &ServerEvent::WhiteboardDraw { room_id, draw_data, sender },
                );
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::UploadFile { room_id, filename, file_data } => {
                self.upload_file(session, room_id, filename, file_data, gate).await
            }
            ClientEvent::UpdateRoomSettings { room_id, settings } => {
                let mut room = self.rooms.lock_room(&room_id).await?;
                membership::update_settings(&mut room, &session.identity_id, &settings)?;
                room.touch(Instant::now());

                let delivered = room.broadcast_all(&ServerEvent::RoomSettingsUpdated {
                    room_id,
                    settings: room.settings().clone(),
                    updated_by: session.identity_id.clone(),
                });
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::SetPermissions { room_id, user_id, permission, value } => {
                let mut room = self.rooms.lock_room(&room_id).await?;
                let changed = membership::set_permission(&mut room, &session.identity_id, &user_id, permission, value)?;
                if changed {
                    info!(
                        "{} {} {} permission for {} in room {}",
                        session.identity_id,
                        if value { "granted" } else { "revoked" },
                        permission.name(),
                        user_id,
                        room_id
                    );
                }

                let delivered = room.broadcast_all(&ServerEvent::PermissionsUpdated {
                    room_id,
                    user_id,
                    permission,
                    value,
                    updated_by: session.identity_id.clone(),
                    permissions: room.permissions.snapshot(),
                });
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::SetRole { room_id, user_id, role } => {
                let mut room = self.rooms.lock_room(&room_id).await?;
                if membership::set_role(&mut room, &session.identity_id, &user_id, role)? {
                    info!("{} is now {} in room {}", user_id, role.name(), room_id);
                }

                let delivered = room.broadcast_all(&ServerEvent::RoleChanged {
                    room_id,
                    user_id,
                    role,
                    updated_by: session.identity_id.clone(),
                });
                self.metrics.add_deliveries(delivered as u64);
                Ok(())
            }
            ClientEvent::KickParticipant { room_id, user_id } => {
                self.rooms.kick_participant(&room_id, &session.identity_id, &user_id).await
            }
        }
    }

    /// Lock the room, run the sender through `gate` and stamp it.
    async fn authorized(
        &self,
        session: &Session,
        room_id: &str,
        gate: Gate,
    ) -> RelayResult<(OwnedMutexGuard<Room>, SenderStamp)> {
        let room = self.rooms.lock_room(room_id).await?;
        authorize(&room, &session.identity_id, gate)?;
        let sender = room
            .participant(&session.identity_id)
            .map(|p| p.stamp(now_millis()))
            .ok_or_else(|| RelayError::Forbidden(format!("not a participant of room {room_id}")))?;
        Ok((room, sender))
    }

    /// Two-phase upload: validate under the lock, persist without it, then
    /// re-check membership before the record becomes visible.
    async fn upload_file(
        &self,
        session: &Session,
        room_id: String,
        filename: String,
        file_data: String,
        gate: Gate,
    ) -> RelayResult<()> {
        let mut record = {
            let (room, sender) = self.authorized(session, &room_id, gate).await?;
            let uploader = room
                .participant(&session.identity_id)
                .ok_or_else(|| RelayError::Forbidden(format!("not a participant of room {room_id}")))?;
            FileRecord::new(uploader, &filename, file_data.len(), self.max_upload_bytes, sender.timestamp)?
        };

        record.storage_key = self.files.persist(&room_id, &record, &file_data)?;

        let (mut room, sender) = match self.authorized(session, &room_id, gate).await {
            Ok(authorized) => authorized,
            Err(err) => {
                if let Some(key) = &record.storage_key {
                    match self.files.discard(key) {
                        Ok(()) => debug!("Discarded {} after {} lost upload rights", key, session.identity_id),
                        Err(e) => warn!("Stored upload {} is orphaned: {}", key, e),
                    }
                }
                return Err(err);
            }
        };
        room.files.push(record.clone());
        room.touch(Instant::now());
        info!("{} shared {} ({} bytes) in room {}", session.identity_id, record.filename, record.size, room_id);

        let delivered = room.broadcast_all(&ServerEvent::UploadFile {
            room_id,
            file: record,
            file_data,
            sender,
        });
        self.metrics.inc_uploads();
        self.metrics.add_deliveries(delivered as u64);
        Ok(())
    }

    fn member_for(&self, session: &Session) -> RelayResult<Member> {
        let identity = self
            .identities
            .get(&session.identity_id)
            .ok_or_else(|| RelayError::NotFound(format!("Identity {}", session.identity_id)))?;
        Ok(Member::from_identity(&identity, session.outbound.clone()))
    }

    /// Record the new room, leaving the previous one if it differs.
    async fn enter_room(&self, session: &mut Session, room_id: String) {
        if session.room_id.as_deref() != Some(room_id.as_str()) {
            self.leave_current(session).await;
        }
        session.room_id = Some(room_id);
    }

    async fn leave_current(&self, session: &mut Session) {
        let Some(room_id) = session.room_id.take() else {
            return;
        };
        match self.rooms.leave_room(&room_id, &session.identity_id).await {
            // Already gone: kicked, reclaimed or shut down
            Ok(()) | Err(RelayError::NotFound(_)) => {}
            Err(e) => warn!("Failed to leave room {} for {}: {}", room_id, session.identity_id, e),
        }
    }

    /// Connection closed. Leaves the current room and starts the identity's
    /// offline grace window. Cannot fail.
    pub async fn disconnect(&self, session: &mut Session) {
        self.leave_current(session).await;
        self.identities.disconnect(&session.identity_id);
    }

    /// Reclaim idle rooms and purge expired identities once.
    pub fn sweep(&self) -> (usize, usize) {
        let rooms = self.rooms.reclaim_idle();
        let identities = self.identities.purge_expired();
        if rooms > 0 || identities > 0 {
            info!("Sweep reclaimed {} rooms and purged {} identities", rooms, identities);
        }
        (rooms, identities)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                engine.sweep();
            }
        })
    }
}
