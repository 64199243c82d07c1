mod synced;

pub use synced::SyncedStore;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    model::{BucketMap, ClassMode, DeviceState, RoomState},
    types::RoomResult,
};

/// Push notification for one bucket. The shape depends on how the store
/// multiplexes writers for that bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketChange {
    /// Only the changed key names; the bucket has many independent writers
    /// per key, so values must be re-fetched to materialize them.
    Keys { bucket: String, keys: Vec<String> },
    /// Already-materialized new value per top-level field; no re-fetch
    /// needed.
    Fields { bucket: String, fields: BucketMap },
}

/// The remote, eventually-propagating key-value store. Partial updates are
/// resolved last-writer-wins per top-level key by the store itself.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Opens one named bucket, seeding absent keys from `default`.
    /// Idempotent.
    async fn connect_bucket(&self, name: &str, default: BucketMap) -> RoomResult;
    async fn get_bucket(&self, name: &str) -> RoomResult<BucketMap>;
    /// Merges `partial` into the bucket, key by key. Fails with
    /// [`crate::RoomError::Transport`] on serialization or network failure.
    async fn set_partial(&self, name: &str, partial: BucketMap) -> RoomResult;
    /// Releases subscriptions; partial writes already in flight are not
    /// affected.
    async fn disconnect_bucket(&self, name: &str) -> RoomResult;
    fn subscribe(&self) -> broadcast::Receiver<BucketChange>;
}

/// Tagged store mutations, used in both directions: the reconciler writes
/// them through [`SyncedStore::write`], and incoming change notifications are
/// materialized into the same shape.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// Full device-state map on notify; a partial per-member map on write.
    DeviceState(HashMap<String, DeviceState>),
    RaiseHandUsers(Vec<String>),
    OnStageUsers(HashMap<String, bool>),
    Ban(bool),
    ClassMode(ClassMode),
}

/// Fresh point-in-time read of both buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub device_state: HashMap<String, DeviceState>,
    pub room_state: RoomState,
}
