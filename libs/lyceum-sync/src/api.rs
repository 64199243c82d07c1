use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    model::{RoomStartStatus, UserProfile},
    types::RoomResult,
};

/// REST collaborators of the engine.
#[async_trait]
pub trait RoomApi: Send + Sync {
    /// Source-of-truth room status transition. The engine only broadcasts a
    /// status change after this call confirmed it.
    async fn update_room_status(&self, room_id: &str, status: RoomStartStatus) -> RoomResult;

    /// Batched member-profile lookup for all of `ids` at once.
    async fn member_profiles(
        &self,
        room_id: &str,
        ids: &[String],
    ) -> RoomResult<HashMap<String, UserProfile>>;
}
