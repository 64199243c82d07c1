use serde_json::{json, Map, Value};

use super::Command;
use crate::{
    model::{DeviceKind, RoomStartStatus},
    types::RoomResult,
};

// Wire tags kept byte-compatible with the original client protocol.
const TAG_RAISE_HAND: &str = "raise-hand";
const TAG_BAN: &str = "ban";
const TAG_NOTICE: &str = "notice";
const TAG_UPDATE_ROOM_STATUS: &str = "update-room-status";
const TAG_REQUEST_DEVICE: &str = "request-device";
const TAG_REQUEST_DEVICE_RESPONSE: &str = "request-device-response";
const TAG_NOTIFY_DEVICE_OFF: &str = "notify-device-off";
const TAG_UNDEFINED: &str = "undefined";

fn device_field(device: DeviceKind) -> &'static str {
    match device {
        DeviceKind::Mic => "mic",
        DeviceKind::Camera => "camera",
    }
}

/// Encodes a command into the tagged `{"t": ..., "v": {...}}` envelope.
pub fn encode(command: &Command, room_id: &str) -> RoomResult<Vec<u8>> {
    let (tag, body) = match command {
        Command::UpdateRoomStatus(status) => (
            TAG_UPDATE_ROOM_STATUS,
            json!({ "roomUUID": room_id, "status": status }),
        ),
        Command::RaiseHand(raise) => (
            TAG_RAISE_HAND,
            json!({ "roomUUID": room_id, "raiseHand": raise }),
        ),
        Command::Ban(status) => (TAG_BAN, json!({ "roomUUID": room_id, "status": status })),
        Command::Notice(text) => (TAG_NOTICE, json!({ "roomUUID": room_id, "text": text })),
        Command::RequestDevice(device) => (
            TAG_REQUEST_DEVICE,
            json!({ "roomUUID": room_id, device_field(*device): true }),
        ),
        Command::RequestDeviceResponse { device, on } => (
            TAG_REQUEST_DEVICE_RESPONSE,
            json!({ "roomUUID": room_id, device_field(*device): on }),
        ),
        Command::NotifyDeviceOff(device) => (
            TAG_NOTIFY_DEVICE_OFF,
            json!({ "roomUUID": room_id, device_field(*device): false }),
        ),
        Command::Undefined(reason) => (TAG_UNDEFINED, json!({ "reason": reason })),
    };

    Ok(serde_json::to_vec(&json!({ "t": tag, "v": body }))?)
}

/// Decodes wire bytes into a command. Never fails: anything unknown or
/// malformed becomes [`Command::Undefined`] so a single bad peer cannot
/// break the pipeline.
pub fn decode(data: &[u8]) -> Command {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return Command::Undefined("malformed command payload".into());
    };
    let Some(tag) = value.get("t").and_then(Value::as_str) else {
        return Command::Undefined("command tag missing".into());
    };
    let Some(body) = value.get("v").and_then(Value::as_object) else {
        return Command::Undefined("command body missing".into());
    };
    if tag == TAG_UNDEFINED {
        let reason = body
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason given");
        return Command::Undefined(reason.into());
    }
    if !body.get("roomUUID").is_some_and(Value::is_string) {
        return Command::Undefined(format!("{tag} without roomUUID"));
    }

    match tag {
        TAG_RAISE_HAND => match body.get("raiseHand").and_then(Value::as_bool) {
            Some(raise) => Command::RaiseHand(raise),
            None => Command::Undefined("raise-hand without flag".into()),
        },
        TAG_BAN => match body.get("status").and_then(Value::as_bool) {
            Some(status) => Command::Ban(status),
            None => Command::Undefined("ban without status".into()),
        },
        TAG_NOTICE => match body.get("text").and_then(Value::as_str) {
            Some(text) => Command::Notice(text.into()),
            None => Command::Undefined("notice without text".into()),
        },
        TAG_UPDATE_ROOM_STATUS => match body
            .get("status")
            .and_then(|status| serde_json::from_value::<RoomStartStatus>(status.clone()).ok())
        {
            Some(status) => Command::UpdateRoomStatus(status),
            None => Command::Undefined("unknown room status".into()),
        },
        TAG_REQUEST_DEVICE => match device_flag(body) {
            Some((device, _)) => Command::RequestDevice(device),
            None => Command::Undefined("request-device without device".into()),
        },
        TAG_REQUEST_DEVICE_RESPONSE => match device_flag(body) {
            Some((device, on)) => Command::RequestDeviceResponse { device, on },
            None => Command::Undefined("request-device-response without device".into()),
        },
        TAG_NOTIFY_DEVICE_OFF => match device_flag(body) {
            Some((device, _)) => Command::NotifyDeviceOff(device),
            None => Command::Undefined("notify-device-off without device".into()),
        },
        _ => Command::Undefined(format!("unknown command tag {tag}")),
    }
}

// A device command carries exactly one of the `mic`/`camera` flags.
fn device_flag(body: &Map<String, Value>) -> Option<(DeviceKind, bool)> {
    if let Some(on) = body.get("mic").and_then(Value::as_bool) {
        return Some((DeviceKind::Mic, on));
    }
    if let Some(on) = body.get("camera").and_then(Value::as_bool) {
        return Some((DeviceKind::Camera, on));
    }
    None
}
