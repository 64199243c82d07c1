use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-member device flags, keyed by member id. Many independent writers
/// update this bucket one key at a time.
pub const DEVICE_STATE_BUCKET: &str = "deviceState";
/// Singleton room-wide state, one top-level key per field.
pub const ROOM_STATE_BUCKET: &str = "roomState";

/// Raw bucket contents as stored remotely.
pub type BucketMap = serde_json::Map<String, Value>;

/// Mic/camera switches for one member. Entries absent from the store default
/// to everything off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub mic: bool,
    pub camera: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "mic")]
    Mic,
    #[serde(rename = "camera")]
    Camera,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassMode {
    #[default]
    Lecture,
    Interaction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStartStatus {
    #[default]
    Idle,
    Started,
    Paused,
    Stopped,
}

/// The singleton `roomState` bucket, seeded with these defaults when the
/// store is first connected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomState {
    pub class_mode: ClassMode,
    pub raise_hand_users: Vec<String>,
    pub ban: bool,
    pub on_stage_users: HashMap<String, bool>,
}

impl RoomState {
    /// Connect-time defaults, one entry per top-level field.
    pub fn default_fields() -> BucketMap {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(fields)) => fields,
            _ => BucketMap::new(),
        }
    }

    pub fn on_stage_count(&self) -> usize {
        self.on_stage_users.values().filter(|on| **on).count()
    }
}

/// Display info resolved through the member-profile REST lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub name: String,
    pub avatar: Option<String>,
    /// Numeric id of this member on the audio/video transport.
    pub rtc_handle: u32,
}

/// One row of the merged member list. Derived, never stored: recomputed
/// whenever membership, device state, the raise-hand queue or the stage
/// assignment changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomUser {
    pub id: String,
    pub rtc_handle: u32,
    pub name: String,
    pub avatar: Option<String>,
    pub online: bool,
    pub on_stage: bool,
    pub raising_hand: bool,
    pub device: DeviceState,
}
