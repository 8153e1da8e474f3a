#![forbid(unsafe_code)]

// Bounded per-room logs: chat messages and shared-file records

use super::roles::ParticipantRole;
use super::Participant;
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Longest accepted chat message, in characters, after trimming.
pub const MAX_CHAT_LEN: usize = 1000;

/// Longest accepted shared-file name, in characters.
pub const MAX_FILENAME_LEN: usize = 255;

/// FIFO buffer that keeps only the most recent `capacity` entries.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    /// A zero capacity is bumped to one so the newest entry is always kept.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Append an entry, returning the evicted oldest one when over capacity.
    pub fn push(&mut self, entry: T) -> Option<T> {
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Clone> BoundedHistory<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// A chat line as stored in the room log and broadcast to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub color: String,
    pub role: ParticipantRole,
    pub text: String,
    pub sent_at: u64,
}

impl ChatMessage {
    /// Build a message from raw client text. The text is trimmed and must end
    /// up between 1 and [`MAX_CHAT_LEN`] characters.
    pub fn compose(sender: &Participant, raw: &str, sent_at: u64) -> RelayResult<Self> {
        let text = raw.trim();
        let len = text.chars().count();
        if len == 0 || len > MAX_CHAT_LEN {
            return Err(RelayError::Validation(format!(
                "Chat message must be 1-{MAX_CHAT_LEN} characters"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.id.clone(),
            sender_display_name: sender.display_name.clone(),
            color: sender.color.clone(),
            role: sender.role,
            text: text.to_string(),
            sent_at,
        })
    }
}

/// Metadata of a file shared into a room. The bytes themselves go to the
/// [`FileStore`](crate::storage::FileStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    /// Length of the encoded payload as received
    pub size: usize,
    pub uploader_id: String,
    pub uploader_name: String,
    pub uploaded_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
}

impl FileRecord {
    pub fn new(uploader: &Participant, filename: &str, size: usize, max_size: usize, uploaded_at: u64) -> RelayResult<Self> {
        let filename = filename.trim();
        let name_len = filename.chars().count();
        if name_len == 0 || name_len > MAX_FILENAME_LEN {
            return Err(RelayError::Validation(format!(
                "Filename must be 1-{MAX_FILENAME_LEN} characters"
            )));
        }
        if filename.contains(['/', '\\']) || filename.chars().any(char::is_control) {
            return Err(RelayError::Validation("Filename contains invalid characters".into()));
        }
        if size == 0 {
            return Err(RelayError::Validation("File is empty".into()));
        }
        if size > max_size {
            return Err(RelayError::CapacityExceeded(format!(
                "File exceeds the {max_size} byte upload limit"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            size,
            uploader_id: uploader.id.clone(),
            uploader_name: uploader.display_name.clone(),
            uploaded_at,
            storage_key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRole;
    use crate::outbound::Outbound;
    use proptest::prelude::*;

    fn participant() -> Participant {
        let (outbound, _rx) = Outbound::channel(4);
        Participant {
            id: "p1".into(),
            display_name: "Alice".into(),
            color: "#FF6B6B".into(),
            identity_role: IdentityRole::Guest,
            role: ParticipantRole::Viewer,
            joined_seq: 0,
            outbound,
        }
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut history = BoundedHistory::new(3);
        for m in ["M1", "M2", "M3", "M4", "M5"] {
            history.push(m);
        }
        assert_eq!(history.to_vec(), vec!["M3", "M4", "M5"]);
    }

    #[test]
    fn test_push_reports_evicted_entry() {
        let mut history = BoundedHistory::new(2);
        assert_eq!(history.push(1), None);
        assert_eq!(history.push(2), None);
        assert_eq!(history.push(3), Some(1));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let mut history = BoundedHistory::new(0);
        history.push("a");
        history.push("b");
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.to_vec(), vec!["b"]);
    }

    #[test]
    fn test_compose_trims_and_stamps() {
        let msg = ChatMessage::compose(&participant(), "  hello  ", 42).unwrap();
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.sender_id, "p1");
        assert_eq!(msg.sender_display_name, "Alice");
        assert_eq!(msg.sent_at, 42);
    }

    #[test]
    fn test_compose_rejects_blank_and_oversized() {
        assert!(matches!(
            ChatMessage::compose(&participant(), "   ", 0),
            Err(RelayError::Validation(_))
        ));
        let long = "x".repeat(MAX_CHAT_LEN + 1);
        assert!(matches!(
            ChatMessage::compose(&participant(), &long, 0),
            Err(RelayError::Validation(_))
        ));
        // Limit counts characters, not bytes
        let wide = "é".repeat(MAX_CHAT_LEN);
        assert!(ChatMessage::compose(&participant(), &wide, 0).is_ok());
    }

    #[test]
    fn test_file_record_validation() {
        let p = participant();
        assert!(FileRecord::new(&p, "notes.txt", 10, 100, 0).is_ok());
        assert!(matches!(FileRecord::new(&p, "../etc/passwd", 10, 100, 0), Err(RelayError::Validation(_))));
        assert!(matches!(FileRecord::new(&p, "", 10, 100, 0), Err(RelayError::Validation(_))));
        assert!(matches!(FileRecord::new(&p, "big.bin", 101, 100, 0), Err(RelayError::CapacityExceeded(_))));
    }

    proptest! {
        #[test]
        fn prop_history_keeps_newest_suffix(cap in 1usize..20, items in proptest::collection::vec(any::<u32>(), 0..100)) {
            let mut history = BoundedHistory::new(cap);
            for item in &items {
                history.push(*item);
            }
            let keep = items.len().min(cap);
            prop_assert_eq!(history.to_vec(), items[items.len() - keep..].to_vec());
        }
    }
}
