use std::collections::{BTreeMap, HashMap};

use crate::model::{DeviceState, RoomUser, UserProfile};

/// Builds the merged member list out of the independently-sourced pieces.
///
/// The id universe is decided by the caller; `members` maps every id to its
/// online flag, so members that only survive through the stage assignment or
/// the raise-hand queue still get a row. A missing profile degrades to the
/// default one rather than dropping the row.
pub(super) fn merge_users(
    owner_id: &str,
    members: &BTreeMap<String, bool>,
    profiles: &HashMap<String, UserProfile>,
    device_state: &HashMap<String, DeviceState>,
    raise_hand_users: &[String],
    on_stage_users: &HashMap<String, bool>,
) -> Vec<RoomUser> {
    let mut users: Vec<RoomUser> = members
        .iter()
        .map(|(id, online)| {
            let profile = profiles.get(id).cloned().unwrap_or_default();
            RoomUser {
                on_stage: id == owner_id || on_stage_users.get(id).copied().unwrap_or(false),
                raising_hand: raise_hand_users.contains(id),
                device: device_state.get(id).copied().unwrap_or_default(),
                rtc_handle: profile.rtc_handle,
                name: profile.name,
                avatar: profile.avatar,
                online: *online,
                id: id.clone(),
            }
        })
        .collect();
    users.sort_by(|a, b| {
        priority(owner_id, b)
            .cmp(&priority(owner_id, a))
            .then_with(|| b.name.cmp(&a.name))
    });
    users
}

/// Owner first, then stage members, then raised hands; equal priorities
/// fall back to name, descending.
fn priority(owner_id: &str, user: &RoomUser) -> u8 {
    let mut priority = 0;
    if user.id == owner_id {
        priority |= 1 << 2;
    }
    if user.on_stage {
        priority |= 1 << 1;
    }
    if user.raising_hand {
        priority |= 1;
    }
    priority
}
