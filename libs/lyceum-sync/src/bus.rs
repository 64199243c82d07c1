use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::types::{FatalKind, RoomResult};

/// Everything the presence/command transport can report. Broadcast and
/// unicast payloads are merged into one feed tagged with the sender; no
/// ordering is guaranteed between the two delivery paths.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    MemberJoined(String),
    MemberLeft(String),
    Message { data: Vec<u8>, sender: String },
    Fatal(FatalKind),
}

/// The room-scoped presence + messaging transport, implemented by the
/// hosting application (or by [`crate::MemoryBus`] in tests).
#[async_trait]
pub trait BusProvider: Send + Sync {
    /// Authenticates the presence session. Safe to call more than once.
    async fn login(&self) -> RoomResult;
    /// Joins the room channel; membership events start flowing afterwards.
    async fn join(&self) -> RoomResult;
    async fn leave(&self) -> RoomResult;
    /// Point-in-time membership snapshot.
    async fn get_members(&self) -> RoomResult<Vec<String>>;
    async fn send_broadcast(&self, data: Vec<u8>) -> RoomResult;
    async fn send_unicast(&self, data: Vec<u8>, target: &str) -> RoomResult;
    /// Takes the merged inbound event feed. Fails on the second call: there
    /// is exactly one consumer per session.
    async fn subscribe(&self) -> RoomResult<Receiver<BusEvent>>;
}
