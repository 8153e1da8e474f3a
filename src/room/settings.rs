#![forbid(unsafe_code)]

// Per-room presentation and control settings, with merge-patch updates

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

pub const MIN_FRAMERATE: u32 = 1;
pub const MAX_FRAMERATE: u32 = 120;
pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl Quality {
    /// Frame scale factor clients apply when encoding.
    pub fn scale(&self) -> f32 {
        match self {
            Quality::Low => 0.3,
            Quality::Medium => 0.6,
            Quality::High => 0.9,
            Quality::Ultra => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub quality: Quality,
    pub framerate: u32,
    pub cursor_visible: bool,
    pub audio_enabled: bool,
    pub zoom_level: f64,
    pub mouse_control_enabled: bool,
    pub keyboard_control_enabled: bool,
    pub max_participants: u32,
}

impl RoomSettings {
    pub fn with_capacity(max_participants: u32) -> Self {
        Self {
            quality: Quality::Medium,
            framerate: 30,
            cursor_visible: true,
            audio_enabled: false,
            zoom_level: 1.0,
            mouse_control_enabled: true,
            keyboard_control_enabled: false,
            max_participants,
        }
    }

    /// Merge `patch` field by field. Every present field is validated before
    /// anything is written, so a rejected patch leaves the settings untouched.
    ///
    /// `participants` is the current room size and `ceiling` the configured
    /// upper bound for `maxParticipants`.
    pub fn apply(&mut self, patch: &SettingsPatch, participants: usize, ceiling: u32) -> RelayResult<()> {
        if let Some(framerate) = patch.framerate {
            if !(MIN_FRAMERATE..=MAX_FRAMERATE).contains(&framerate) {
                return Err(RelayError::Validation(format!(
                    "framerate must be {MIN_FRAMERATE}-{MAX_FRAMERATE}"
                )));
            }
        }
        if let Some(zoom) = patch.zoom_level {
            if !zoom.is_finite() || !(MIN_ZOOM..=MAX_ZOOM).contains(&zoom) {
                return Err(RelayError::Validation(format!(
                    "zoomLevel must be {MIN_ZOOM}-{MAX_ZOOM}"
                )));
            }
        }
        if let Some(max) = patch.max_participants {
            if max == 0 || max > ceiling {
                return Err(RelayError::Validation(format!("maxParticipants must be 1-{ceiling}")));
            }
            if (max as usize) < participants {
                return Err(RelayError::Validation(format!(
                    "maxParticipants cannot be below the current {participants} participants"
                )));
            }
        }

        if let Some(quality) = patch.quality {
            self.quality = quality;
        }
        if let Some(framerate) = patch.framerate {
            self.framerate = framerate;
        }
        if let Some(cursor_visible) = patch.cursor_visible {
            self.cursor_visible = cursor_visible;
        }
        if let Some(audio_enabled) = patch.audio_enabled {
            self.audio_enabled = audio_enabled;
        }
        if let Some(zoom) = patch.zoom_level {
            self.zoom_level = zoom;
        }
        if let Some(enabled) = patch.mouse_control_enabled {
            self.mouse_control_enabled = enabled;
        }
        if let Some(enabled) = patch.keyboard_control_enabled {
            self.keyboard_control_enabled = enabled;
        }
        if let Some(max) = patch.max_participants {
            self.max_participants = max;
        }
        Ok(())
    }
}

/// Partial settings as sent by clients. Absent fields are left alone and
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_level: Option<f64>,
    #[serde(default, alias = "mouseControl", skip_serializing_if = "Option::is_none")]
    pub mouse_control_enabled: Option<bool>,
    #[serde(default, alias = "keyboardControl", skip_serializing_if = "Option::is_none")]
    pub keyboard_control_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }
}
