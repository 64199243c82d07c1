//! Realtime classroom state synchronization engine.
//!
//! Reconciles a presence feed, an eventually-propagating shared key-value
//! store and a broadcast+unicast command bus into one coherent, race-tolerant
//! view of a classroom: who is in the room, who is on stage, who raised a
//! hand, whose devices are on, and whether the room is banned or started.
#![forbid(unsafe_code)]

mod api;
mod bus;
mod command;
mod connector;
mod model;
mod presence;
mod profile;
mod session;
mod store;
mod types;

pub use api::RoomApi;
pub use bus::{BusEvent, BusProvider};
pub use command::{decode, encode, Command};
pub use connector::{MemoryBus, MemoryRouter, MemoryStore};
pub use model::{
    BucketMap, ClassMode, DeviceKind, DeviceState, RoomStartStatus, RoomState, RoomUser,
    UserProfile, DEVICE_STATE_BUCKET, ROOM_STATE_BUCKET,
};
pub use presence::{Presence, PresenceEvent};
pub use profile::ProfileCache;
pub use session::{Classroom, ClassroomConfig, ClassroomEvent, SessionState};
pub use store::{BucketChange, StoreProvider, StoreSnapshot, StoreUpdate, SyncedStore};
pub use types::{FatalKind, RoomError, RoomResult};
