use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use lyceum_logger::{debug, error, trace, warn};
use tokio::sync::{broadcast, mpsc, watch};

use super::{merge::merge_users, ClassroomConfig, ClassroomEvent};
use crate::{
    bus::BusEvent,
    command::{decode, Command},
    model::{ClassMode, DeviceState, RoomStartStatus, RoomUser},
    presence::{Presence, PresenceEvent},
    profile::ProfileCache,
    store::{StoreUpdate, SyncedStore},
    types::{RoomError, RoomResult},
};

/// Single-task event loop that folds the bus feed and the store feed into
/// the published views. Nothing else mutates session state, so no state is
/// ever observed mid-merge.
pub(super) struct Reconciler {
    pub config: ClassroomConfig,
    pub store: Arc<SyncedStore>,
    pub profiles: ProfileCache,
    pub presence: Presence,
    pub device_state: HashMap<String, DeviceState>,
    pub raise_hand_users: Vec<String>,
    pub on_stage_users: HashMap<String, bool>,
    pub ban: bool,
    pub members_tx: Arc<watch::Sender<Vec<RoomUser>>>,
    pub status_tx: Arc<watch::Sender<RoomStartStatus>>,
    pub ban_tx: Arc<watch::Sender<bool>>,
    pub class_mode_tx: Arc<watch::Sender<ClassMode>>,
    pub events_tx: broadcast::Sender<ClassroomEvent>,
    pub errors_tx: broadcast::Sender<RoomError>,
}

impl Reconciler {
    pub(super) async fn run(
        mut self,
        mut bus_rx: mpsc::Receiver<BusEvent>,
        mut store_rx: mpsc::Receiver<RoomResult<StoreUpdate>>,
    ) {
        self.republish().await;
        let mut store_open = true;
        loop {
            tokio::select! {
                event = bus_rx.recv() => match event {
                    Some(event) => {
                        if !self.handle_bus(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                update = store_rx.recv(), if store_open => match update {
                    Some(Ok(update)) => self.apply_store(update).await,
                    Some(Err(e)) => {
                        error!("store feed failed: {e}");
                        let _ = self.errors_tx.send(e);
                        store_open = false;
                    }
                    None => store_open = false,
                },
            }
        }
        debug!("reconciler stopped");
    }

    async fn handle_bus(&mut self, event: BusEvent) -> bool {
        match event {
            BusEvent::MemberJoined(id) => {
                self.presence.apply(PresenceEvent::Joined(id));
                self.republish().await;
            }
            BusEvent::MemberLeft(id) => {
                self.presence.apply(PresenceEvent::Left(id));
                self.republish().await;
            }
            BusEvent::Message { data, sender } => {
                self.dispatch(decode(&data), sender).await;
            }
            BusEvent::Fatal(kind) => {
                error!("presence session lost: {kind}");
                let _ = self.errors_tx.send(RoomError::Fatal(kind));
                return false;
            }
        }
        true
    }

    async fn dispatch(&mut self, command: Command, sender: String) {
        trace!("command from {sender}: {command:?}");
        match command {
            Command::UpdateRoomStatus(status) => {
                self.status_tx.send_replace(status);
            }
            Command::RaiseHand(raising) => {
                // only the owner arbitrates the queue; everyone else drops
                // stray raise-hand traffic
                if !self.config.is_owner() {
                    return;
                }
                if let Err(e) = self.handle_raise_hand(sender, raising).await {
                    warn!("failed to update the raise-hand queue: {e}");
                }
            }
            Command::Ban(ban) => {
                let _ = self.events_tx.send(ClassroomEvent::BanMessage(ban));
            }
            Command::Notice(text) => {
                let _ = self.events_tx.send(ClassroomEvent::Notice(text));
            }
            Command::RequestDevice(device) => {
                let _ = self.events_tx.send(ClassroomEvent::DeviceRequest(device));
            }
            Command::RequestDeviceResponse { device, on } => {
                let user_name = match self.profiles.resolve(&[sender.clone()]).await {
                    Ok(profiles) => profiles.get(&sender).map(|p| p.name.clone()),
                    Err(e) => {
                        warn!("profile lookup for {sender} failed: {e}");
                        self.profiles.get(&sender).map(|p| p.name.clone())
                    }
                }
                .unwrap_or_default();
                let _ = self.events_tx.send(ClassroomEvent::DeviceRequestResponse {
                    device,
                    user_id: sender,
                    user_name,
                    on,
                });
            }
            Command::NotifyDeviceOff(device) => {
                let _ = self
                    .events_tx
                    .send(ClassroomEvent::DeviceNotifyOff(device));
            }
            Command::Undefined(reason) => {
                trace!("ignoring unknown command from {sender}: {reason}");
            }
        }
    }

    /// Owner-side arbitration of one raise-hand request, validated against a
    /// fresh snapshot rather than the possibly-stale local copy.
    async fn handle_raise_hand(&mut self, sender: String, raising: bool) -> RoomResult {
        let snapshot = self.store.snapshot().await?;
        if raising {
            if snapshot.room_state.ban {
                debug!("dropping raise-hand from {sender}: room is banned");
                return Ok(());
            }
            if snapshot.room_state.on_stage_count() >= self.config.max_on_stage_users {
                debug!("dropping raise-hand from {sender}: stage is full");
                return Ok(());
            }
        }
        let mut queue = snapshot.room_state.raise_hand_users;
        if raising {
            if queue.contains(&sender) {
                return Ok(());
            }
            queue.push(sender);
        } else {
            if !queue.contains(&sender) {
                return Ok(());
            }
            queue.retain(|id| *id != sender);
        }
        self.store.write(StoreUpdate::RaiseHandUsers(queue)).await
    }

    async fn apply_store(&mut self, update: StoreUpdate) {
        match update {
            StoreUpdate::DeviceState(states) => {
                self.device_state = states;
                self.republish().await;
            }
            StoreUpdate::RaiseHandUsers(users) => {
                self.raise_hand_users = users;
                self.republish().await;
            }
            StoreUpdate::OnStageUsers(users) => {
                self.on_stage_users = users;
                self.republish().await;
            }
            StoreUpdate::Ban(ban) => {
                self.ban = ban;
                self.ban_tx.send_replace(ban);
            }
            StoreUpdate::ClassMode(mode) => {
                trace!("class mode is now {mode:?}");
                self.class_mode_tx.send_replace(mode);
            }
        }
    }

    /// Recomputes and publishes the member list. The id universe is online
    /// members plus anyone still referenced by the stage assignment or the
    /// raise-hand queue.
    async fn republish(&mut self) {
        let mut members: BTreeMap<String, bool> = BTreeMap::new();
        for id in self.presence.online() {
            members.insert(id.to_owned(), true);
        }
        for (id, on) in &self.on_stage_users {
            if *on {
                members.entry(id.clone()).or_insert(false);
            }
        }
        for id in &self.raise_hand_users {
            members.entry(id.clone()).or_insert(false);
        }

        let ids: Vec<String> = members.keys().cloned().collect();
        let profiles = match self.profiles.resolve(&ids).await {
            Ok(profiles) => profiles,
            Err(e) => {
                // degrade to whatever is cached instead of publishing nothing
                warn!("profile lookup failed, using cached entries: {e}");
                self.profiles.cached(&ids)
            }
        };
        let users = merge_users(
            &self.config.owner_id,
            &members,
            &profiles,
            &self.device_state,
            &self.raise_hand_users,
            &self.on_stage_users,
        );
        self.members_tx.send_replace(users);
    }
}
