mod codec;

pub use codec::{decode, encode};

use crate::model::{DeviceKind, RoomStartStatus};

/// Ephemeral signals exchanged over the command bus. Never persisted; the
/// authoritative room state lives in the shared store.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Room lifecycle transition, broadcast by the owner after the REST
    /// status service confirmed it.
    UpdateRoomStatus(RoomStartStatus),
    /// Participant request to join (or leave) the raise-hand queue, sent
    /// unicast to the owner.
    RaiseHand(bool),
    /// Transient ban notice; the authoritative flag lives in the store.
    Ban(bool),
    Notice(String),
    /// Owner asks a member to turn a device on; the member answers with
    /// [`Command::RequestDeviceResponse`].
    RequestDevice(DeviceKind),
    RequestDeviceResponse { device: DeviceKind, on: bool },
    /// Owner turned a member's device off directly.
    NotifyDeviceOff(DeviceKind),
    /// Fallback for unknown or corrupt payloads; decoding never fails, so
    /// peers running newer protocol versions stay compatible.
    Undefined(String),
}
