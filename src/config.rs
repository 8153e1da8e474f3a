#![forbid(unsafe_code)]

// Runtime configuration, loaded from environment variables with sane defaults

use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Limits and timers owned by the room registry.
#[derive(Debug, Clone)]
pub struct RoomLimits {
    /// Maximum number of live rooms in the registry
    pub max_rooms: usize,
    /// Default `maxParticipants` for newly created rooms
    pub max_participants: u32,
    pub min_room_id_len: usize,
    pub max_room_id_len: usize,
    /// Chat messages retained per room (oldest evicted first)
    pub chat_history_limit: usize,
    /// Shared-file records retained per room
    pub file_history_limit: usize,
    /// A room with no relayed event for this long is reclaimed
    pub idle_timeout: Duration,
    /// Delay between a room becoming empty and its removal
    pub empty_room_grace: Duration,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_rooms: 1000,
            max_participants: 50,
            min_room_id_len: 3,
            max_room_id_len: 64,
            chat_history_limit: 100,
            file_history_limit: 50,
            idle_timeout: Duration::from_secs(30 * 60),
            empty_room_grace: Duration::from_secs(5),
        }
    }
}

/// Whole-server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub max_connections: usize,
    pub rooms: RoomLimits,
    /// Largest accepted `fileData` payload, in bytes
    pub max_upload_bytes: usize,
    /// Connection is dropped after this long without inbound traffic
    pub heartbeat_timeout: Duration,
    /// Offline identities are kept this long for late events
    pub identity_grace: Duration,
    pub sweep_interval: Duration,
    /// Bounded outbound queue per connection; overflow disconnects the peer
    pub outbound_capacity: usize,
    /// Token bucket refill rate (and burst size) per connection
    pub rate_limit_per_sec: u64,
    pub jwt_secret: Option<String>,
    pub metrics_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: 10_000,
            rooms: RoomLimits::default(),
            max_upload_bytes: 50_000_000,
            heartbeat_timeout: Duration::from_secs(60),
            identity_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            outbound_capacity: 256,
            rate_limit_per_sec: 240,
            jwt_secret: None,
            metrics_token: None,
        }
    }
}

impl RelayConfig {
    /// Load from environment variables, falling back to defaults for anything
    /// unset, unparsable or zero.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RelayConfig::from_env`] but reads through `lookup`, so tests
    /// don't have to touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(positive(&lookup, key, default.as_secs()))
        };

        let config = Self {
            port: positive(&lookup, "PORT", d.port),
            max_connections: positive(&lookup, "MAX_CONNECTIONS", d.max_connections),
            rooms: RoomLimits {
                max_rooms: positive(&lookup, "MAX_ROOMS", d.rooms.max_rooms),
                max_participants: positive(&lookup, "MAX_PARTICIPANTS", d.rooms.max_participants),
                min_room_id_len: positive(&lookup, "MIN_ROOM_ID_LEN", d.rooms.min_room_id_len),
                max_room_id_len: positive(&lookup, "MAX_ROOM_ID_LEN", d.rooms.max_room_id_len),
                chat_history_limit: positive(&lookup, "CHAT_HISTORY_LIMIT", d.rooms.chat_history_limit),
                file_history_limit: positive(&lookup, "FILE_HISTORY_LIMIT", d.rooms.file_history_limit),
                idle_timeout: secs("ROOM_IDLE_TIMEOUT_SECS", d.rooms.idle_timeout),
                // Zero is meaningful here: delete empty rooms immediately
                empty_room_grace: Duration::from_secs(
                    parse_or(&lookup, "EMPTY_ROOM_GRACE_SECS", d.rooms.empty_room_grace.as_secs()),
                ),
            },
            max_upload_bytes: positive(&lookup, "MAX_UPLOAD_BYTES", d.max_upload_bytes),
            heartbeat_timeout: secs("HEARTBEAT_TIMEOUT_SECS", d.heartbeat_timeout),
            identity_grace: secs("IDENTITY_GRACE_SECS", d.identity_grace),
            sweep_interval: secs("SWEEP_INTERVAL_SECS", d.sweep_interval),
            outbound_capacity: positive(&lookup, "OUTBOUND_CAPACITY", d.outbound_capacity),
            rate_limit_per_sec: positive(&lookup, "RATE_LIMIT_PER_SEC", d.rate_limit_per_sec),
            jwt_secret: lookup("JWT_SECRET").filter(|s| !s.is_empty()),
            metrics_token: lookup("METRICS_TOKEN").filter(|s| !s.is_empty()),
        };

        if config.rooms.min_room_id_len > config.rooms.max_room_id_len {
            warn!(
                "MIN_ROOM_ID_LEN ({}) exceeds MAX_ROOM_ID_LEN ({}), using defaults",
                config.rooms.min_room_id_len, config.rooms.max_room_id_len
            );
            return Self {
                rooms: RoomLimits {
                    min_room_id_len: d.rooms.min_room_id_len,
                    max_room_id_len: d.rooms.max_room_id_len,
                    ..config.rooms
                },
                ..config
            };
        }

        config
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        info!(
            "Limits: {} rooms, {} participants/room, {} connections, chat history {}",
            self.rooms.max_rooms,
            self.rooms.max_participants,
            self.max_connections,
            self.rooms.chat_history_limit
        );
        info!(
            "Timers: room idle {:?}, empty-room grace {:?}, heartbeat {:?}, sweep every {:?}",
            self.rooms.idle_timeout, self.rooms.empty_room_grace, self.heartbeat_timeout, self.sweep_interval
        );
        if self.jwt_secret.is_some() {
            info!("JWT verification enabled");
        } else {
            info!("JWT_SECRET not set, every connection joins as a guest");
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{}={:?} is not valid, using default {}", key, raw, default);
            default
        }),
    }
}

fn positive<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy + PartialEq + Default,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default);
    if value == T::default() {
        warn!("{}=0 is not allowed, using default {}", key, default);
        return default;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RelayConfig::from_lookup(|_| None);
        assert_eq!(config.port, 3000);
        assert_eq!(config.rooms.chat_history_limit, 100);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.rooms.idle_timeout, Duration::from_secs(1800));
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("PORT", "8080"),
            ("MAX_ROOMS", "3"),
            ("CHAT_HISTORY_LIMIT", "10"),
            ("EMPTY_ROOM_GRACE_SECS", "0"),
            ("JWT_SECRET", "s3cret"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.rooms.max_rooms, 3);
        assert_eq!(config.rooms.chat_history_limit, 10);
        assert_eq!(config.rooms.empty_room_grace, Duration::ZERO);
        assert_eq!(config.jwt_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_zero_and_garbage_fall_back() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("MAX_CONNECTIONS", "0"),
            ("OUTBOUND_CAPACITY", "lots"),
            ("JWT_SECRET", ""),
        ]));
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.outbound_capacity, 256);
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_inverted_room_id_bounds_fall_back() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("MIN_ROOM_ID_LEN", "80"),
            ("MAX_ROOM_ID_LEN", "10"),
        ]));
        assert_eq!(config.rooms.min_room_id_len, 3);
        assert_eq!(config.rooms.max_room_id_len, 64);
    }
}
