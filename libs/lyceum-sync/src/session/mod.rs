mod merge;
mod reconciler;

use std::{collections::HashMap, sync::Arc, time::Duration};

use lyceum_logger::{debug, info, warn};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};

use reconciler::Reconciler;

use crate::{
    api::RoomApi,
    bus::BusProvider,
    command::{encode, Command},
    model::{ClassMode, DeviceKind, DeviceState, RoomStartStatus, RoomUser},
    presence::Presence,
    profile::ProfileCache,
    store::{StoreProvider, StoreUpdate, SyncedStore},
    types::{RoomError, RoomResult},
};

/// Where a session is in its startup sequence. Failures leave the state at
/// the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PresenceAuthenticating,
    BusJoining,
    StoreConnecting,
    /// Owner only: announcing the room start before going ready.
    BroadcastingStarted,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClassroomConfig {
    pub room_id: String,
    pub user_id: String,
    pub owner_id: String,
    /// Hard cap on concurrently staged members, enforced when raise-hand
    /// requests are arbitrated. Owner acceptance bypasses it.
    pub max_on_stage_users: usize,
    /// Room lifecycle status known before joining, from the room-info
    /// lookup. Late joiners never hear the owner's original announcement.
    pub initial_status: RoomStartStatus,
}

impl ClassroomConfig {
    pub fn is_owner(&self) -> bool {
        self.user_id == self.owner_id
    }
}

/// Transient, fire-and-forget happenings surfaced to the hosting
/// application. State changes travel through the watch views instead.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassroomEvent {
    Notice(String),
    /// Ban toast; the authoritative flag arrives via [`Classroom::ban_state`].
    BanMessage(bool),
    /// The owner asks this member to turn a device on.
    DeviceRequest(DeviceKind),
    /// A member answered a device request; delivered to the owner.
    DeviceRequestResponse {
        device: DeviceKind,
        user_id: String,
        user_name: String,
        on: bool,
    },
    /// The owner turned one of this member's devices off directly.
    DeviceNotifyOff(DeviceKind),
}

/// One member's connection to a classroom.
///
/// Owns the presence bus, the shared store and the REST client for the room,
/// and publishes the reconciled views through watch and broadcast channels.
/// All commands go through here; the background reconciler task is the only
/// writer of the published views.
pub struct Classroom {
    config: ClassroomConfig,
    bus: Arc<dyn BusProvider>,
    store: Arc<SyncedStore>,
    api: Arc<dyn RoomApi>,
    state_tx: watch::Sender<SessionState>,
    members_tx: Arc<watch::Sender<Vec<RoomUser>>>,
    status_tx: Arc<watch::Sender<RoomStartStatus>>,
    ban_tx: Arc<watch::Sender<bool>>,
    class_mode_tx: Arc<watch::Sender<ClassMode>>,
    events_tx: broadcast::Sender<ClassroomEvent>,
    errors_tx: broadcast::Sender<RoomError>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Classroom {
    pub fn new(
        config: ClassroomConfig,
        bus: Arc<dyn BusProvider>,
        store: Arc<dyn StoreProvider>,
        api: Arc<dyn RoomApi>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (members_tx, _) = watch::channel(Vec::new());
        let (status_tx, _) = watch::channel(config.initial_status);
        let (ban_tx, _) = watch::channel(false);
        let (class_mode_tx, _) = watch::channel(ClassMode::default());
        let (events_tx, _) = broadcast::channel(64);
        let (errors_tx, _) = broadcast::channel(16);
        Self {
            config,
            bus,
            store: Arc::new(SyncedStore::new(store)),
            api,
            state_tx,
            members_tx: Arc::new(members_tx),
            status_tx: Arc::new(status_tx),
            ban_tx: Arc::new(ban_tx),
            class_mode_tx: Arc::new(class_mode_tx),
            events_tx,
            errors_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Drives the whole startup sequence: presence login, channel join,
    /// store connect, initial snapshot, then the background reconciler. The
    /// owner additionally announces the room start. On failure the session
    /// state is left at the failing step.
    pub async fn connect(&self) -> RoomResult {
        // serializes concurrent connect attempts; the loser observes a
        // non-idle state and is rejected
        let mut loop_handle = self.loop_handle.lock().await;
        if *self.state_tx.borrow() != SessionState::Idle {
            return Err(RoomError::Transport("session already started".into()));
        }
        info!("joining classroom {}", self.config.room_id);

        self.state_tx
            .send_replace(SessionState::PresenceAuthenticating);
        self.bus.login().await?;

        self.state_tx.send_replace(SessionState::BusJoining);
        self.bus.join().await?;
        let bus_rx = self.bus.subscribe().await?;

        self.state_tx.send_replace(SessionState::StoreConnecting);
        self.store.connect().await?;
        let snapshot = self.store.snapshot().await?;
        let members = self.bus.get_members().await?;
        let store_rx = self
            .store
            .updates()
            .ok_or_else(|| RoomError::Transport("store updates already taken".into()))?;

        let mut presence = Presence::new();
        presence.seed(members);
        self.ban_tx.send_replace(snapshot.room_state.ban);
        self.class_mode_tx
            .send_replace(snapshot.room_state.class_mode);

        let reconciler = Reconciler {
            config: self.config.clone(),
            store: self.store.clone(),
            profiles: ProfileCache::new(self.api.clone(), self.config.room_id.clone()),
            presence,
            device_state: snapshot.device_state,
            raise_hand_users: snapshot.room_state.raise_hand_users,
            on_stage_users: snapshot.room_state.on_stage_users,
            ban: snapshot.room_state.ban,
            members_tx: self.members_tx.clone(),
            status_tx: self.status_tx.clone(),
            ban_tx: self.ban_tx.clone(),
            class_mode_tx: self.class_mode_tx.clone(),
            events_tx: self.events_tx.clone(),
            errors_tx: self.errors_tx.clone(),
        };
        *loop_handle = Some(tokio::spawn(reconciler.run(bus_rx, store_rx)));
        drop(loop_handle);

        if self.config.is_owner() {
            self.state_tx.send_replace(SessionState::BroadcastingStarted);
            self.broadcast_room_status(RoomStartStatus::Started).await?;
        }
        self.state_tx.send_replace(SessionState::Ready);
        info!("classroom {} ready", self.config.room_id);
        Ok(())
    }

    /// Leaves the room and stops the reconciler. A short grace period lets
    /// the leave notification and trailing store writes flush first.
    pub async fn destroy(&self) {
        info!("leaving classroom {}", self.config.room_id);
        self.state_tx.send_replace(SessionState::Closed);
        self.store.disconnect().await;
        if let Err(e) = self.bus.leave().await {
            warn!("failed to leave the room cleanly: {e}");
        }
        sleep(Duration::from_millis(100)).await;
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
    }

    // views

    /// Merged, sorted member list. Replays the latest value to late
    /// subscribers.
    pub fn members(&self) -> watch::Receiver<Vec<RoomUser>> {
        self.members_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<RoomStartStatus> {
        self.status_tx.subscribe()
    }

    pub fn ban_state(&self) -> watch::Receiver<bool> {
        self.ban_tx.subscribe()
    }

    pub fn class_mode(&self) -> watch::Receiver<ClassMode> {
        self.class_mode_tx.subscribe()
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Transient events. Unlike the watch views, missed events are gone.
    pub fn events(&self) -> broadcast::Receiver<ClassroomEvent> {
        self.events_tx.subscribe()
    }

    /// Unrecoverable failures observed by the background task.
    pub fn errors(&self) -> broadcast::Receiver<RoomError> {
        self.errors_tx.subscribe()
    }

    // commands

    /// Asks the owner to add (or remove) this member in the raise-hand
    /// queue. The owner arbitrates; a dropped request is silent.
    pub async fn update_raise_hand(&self, raising: bool) -> RoomResult {
        self.ensure_ready()?;
        self.send_unicast(Command::RaiseHand(raising), &self.config.owner_id)
            .await
    }

    /// Owner accepts a queued raise-hand: the member leaves the queue and
    /// goes on stage. Acceptance always wins, even over a full stage. A
    /// member no longer in the queue is a no-op.
    pub async fn accept_raise_hand(&self, user_id: &str) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        let snapshot = self.store.snapshot().await?;
        let mut queue = snapshot.room_state.raise_hand_users;
        if !queue.iter().any(|id| id == user_id) {
            debug!("{user_id} is no longer raising a hand");
            return Ok(());
        }
        queue.retain(|id| id != user_id);
        self.store.write(StoreUpdate::RaiseHandUsers(queue)).await?;

        let mut stage = snapshot.room_state.on_stage_users;
        stage.insert(user_id.to_owned(), true);
        self.store.write(StoreUpdate::OnStageUsers(stage)).await
    }

    /// Owner puts a member on stage directly, raised hand or not.
    pub async fn pick_user_on_stage(&self, user_id: &str) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        let snapshot = self.store.snapshot().await?;
        let mut queue = snapshot.room_state.raise_hand_users;
        if queue.iter().any(|id| id == user_id) {
            queue.retain(|id| id != user_id);
            self.store.write(StoreUpdate::RaiseHandUsers(queue)).await?;
        }
        let mut stage = snapshot.room_state.on_stage_users;
        stage.insert(user_id.to_owned(), true);
        self.store.write(StoreUpdate::OnStageUsers(stage)).await
    }

    /// Owner takes a member off stage, turning their devices off first.
    pub async fn disconnect_user(&self, user_id: &str) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        self.store
            .write(StoreUpdate::DeviceState(
                [(user_id.to_owned(), DeviceState::default())].into(),
            ))
            .await?;
        let snapshot = self.store.snapshot().await?;
        let mut stage = snapshot.room_state.on_stage_users;
        stage.insert(user_id.to_owned(), false);
        self.store.write(StoreUpdate::OnStageUsers(stage)).await
    }

    /// Updates device switches. Members write their own state directly; the
    /// owner may turn another member's devices off (forced, with a notify)
    /// but can only *request* that they be turned on. Everyone else is a
    /// no-op on foreign state.
    pub async fn update_device_state(&self, user_id: &str, device: DeviceState) -> RoomResult {
        self.ensure_ready()?;
        if user_id == self.config.user_id {
            return self
                .store
                .write(StoreUpdate::DeviceState(
                    [(user_id.to_owned(), device)].into(),
                ))
                .await;
        }
        if !self.config.is_owner() {
            return Ok(());
        }
        let snapshot = self.store.snapshot().await?;
        let Some(current) = snapshot.device_state.get(user_id).copied() else {
            debug!("no device state for {user_id}, nothing to update");
            return Ok(());
        };

        let mut forced = current;
        if current.mic && !device.mic {
            forced.mic = false;
        }
        if current.camera && !device.camera {
            forced.camera = false;
        }
        if forced != current {
            self.store
                .write(StoreUpdate::DeviceState(
                    [(user_id.to_owned(), forced)].into(),
                ))
                .await?;
            if current.mic && !device.mic {
                self.send_unicast(Command::NotifyDeviceOff(DeviceKind::Mic), user_id)
                    .await?;
            }
            if current.camera && !device.camera {
                self.send_unicast(Command::NotifyDeviceOff(DeviceKind::Camera), user_id)
                    .await?;
            }
        }
        if !current.mic && device.mic {
            self.send_unicast(Command::RequestDevice(DeviceKind::Mic), user_id)
                .await?;
        }
        if !current.camera && device.camera {
            self.send_unicast(Command::RequestDevice(DeviceKind::Camera), user_id)
                .await?;
        }
        Ok(())
    }

    /// Answers a [`ClassroomEvent::DeviceRequest`] back to the owner. An
    /// accepted request is followed by the member turning the device on
    /// through [`Classroom::update_device_state`].
    pub async fn request_device_response(&self, device: DeviceKind, on: bool) -> RoomResult {
        self.ensure_ready()?;
        self.send_unicast(
            Command::RequestDeviceResponse { device, on },
            &self.config.owner_id,
        )
        .await
    }

    /// Owner bans (or unbans) the room. A transient notice reaches current
    /// members immediately while the authoritative flag propagates through
    /// the store.
    pub async fn ban(&self, ban: bool) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        self.store.write(StoreUpdate::Ban(ban)).await?;
        self.send_broadcast(Command::Ban(ban)).await?;
        // the bus never echoes to the sender; surface the toast locally
        let _ = self.events_tx.send(ClassroomEvent::BanMessage(ban));
        Ok(())
    }

    /// Owner resets all interaction: every non-owner device off, everyone
    /// off stage, queue cleared. Three independent writes, best effort.
    pub async fn stop_interaction(&self) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        let snapshot = self.store.snapshot().await?;

        let devices: HashMap<String, DeviceState> = snapshot
            .device_state
            .iter()
            .filter(|(id, _)| **id != self.config.owner_id)
            .map(|(id, _)| (id.clone(), DeviceState::default()))
            .collect();
        if !devices.is_empty() {
            self.store.write(StoreUpdate::DeviceState(devices)).await?;
        }

        let stage: HashMap<String, bool> = snapshot
            .room_state
            .on_stage_users
            .keys()
            .map(|id| (id.clone(), false))
            .collect();
        self.store.write(StoreUpdate::OnStageUsers(stage)).await?;
        self.store
            .write(StoreUpdate::RaiseHandUsers(Vec::new()))
            .await
    }

    /// Owner mutes every open non-owner microphone, cameras untouched. Each
    /// muted member gets a notify; unreachable members are skipped.
    pub async fn all_mute(&self) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        let snapshot = self.store.snapshot().await?;

        let muted: HashMap<String, DeviceState> = snapshot
            .device_state
            .iter()
            .filter(|(id, state)| **id != self.config.owner_id && state.mic)
            .map(|(id, state)| (id.clone(), DeviceState { mic: false, ..*state }))
            .collect();
        if muted.is_empty() {
            return Ok(());
        }
        self.store
            .write(StoreUpdate::DeviceState(muted.clone()))
            .await?;
        for id in muted.keys() {
            if let Err(e) = self
                .send_unicast(Command::NotifyDeviceOff(DeviceKind::Mic), id)
                .await
            {
                warn!("mute notify to {id} failed: {e}");
            }
        }
        Ok(())
    }

    /// Owner switches the room between lecture and interaction mode.
    pub async fn update_class_mode(&self, mode: ClassMode) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        self.store.write(StoreUpdate::ClassMode(mode)).await
    }

    /// Owner moves the room through its lifecycle. The REST status service
    /// must confirm first; only then is the transition broadcast and
    /// published locally.
    pub async fn update_room_start_status(&self, status: RoomStartStatus) -> RoomResult {
        self.ensure_ready()?;
        self.ensure_owner()?;
        self.broadcast_room_status(status).await
    }

    async fn broadcast_room_status(&self, status: RoomStartStatus) -> RoomResult {
        let data = encode(&Command::UpdateRoomStatus(status), &self.config.room_id)?;
        self.api
            .update_room_status(&self.config.room_id, status)
            .await?;
        self.bus.send_broadcast(data).await?;
        self.status_tx.send_replace(status);
        Ok(())
    }

    async fn send_broadcast(&self, command: Command) -> RoomResult {
        let data = encode(&command, &self.config.room_id)?;
        self.bus.send_broadcast(data).await
    }

    async fn send_unicast(&self, command: Command, target: &str) -> RoomResult {
        let data = encode(&command, &self.config.room_id)?;
        self.bus.send_unicast(data, target).await
    }

    fn ensure_ready(&self) -> RoomResult {
        match *self.state_tx.borrow() {
            SessionState::Ready => Ok(()),
            _ => Err(RoomError::NotReady),
        }
    }

    fn ensure_owner(&self) -> RoomResult {
        if self.config.is_owner() {
            Ok(())
        } else {
            Err(RoomError::ConsistencyViolation(
                "operation restricted to the room owner".into(),
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use nanoid::nanoid;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        connector::{MemoryBus, MemoryRouter, MemoryStore},
        model::UserProfile,
        types::FatalKind,
    };

    #[derive(Default)]
    struct TestApi {
        status_calls: std::sync::Mutex<Vec<RoomStartStatus>>,
        fail_status: AtomicBool,
    }

    #[async_trait]
    impl RoomApi for TestApi {
        async fn update_room_status(&self, _room_id: &str, status: RoomStartStatus) -> RoomResult {
            if self.fail_status.load(Ordering::SeqCst) {
                return Err(RoomError::Transport("status service unavailable".into()));
            }
            self.status_calls.lock().unwrap().push(status);
            Ok(())
        }

        async fn member_profiles(
            &self,
            _room_id: &str,
            ids: &[String],
        ) -> RoomResult<HashMap<String, UserProfile>> {
            Ok(ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        UserProfile {
                            name: format!("{id}-name"),
                            ..UserProfile::default()
                        },
                    )
                })
                .collect())
        }
    }

    struct Room {
        id: String,
        router: Arc<MemoryRouter>,
        store: Arc<MemoryStore>,
        api: Arc<TestApi>,
    }

    impl Room {
        fn new() -> Self {
            Self {
                id: nanoid!(),
                router: MemoryRouter::new(),
                store: MemoryStore::new(),
                api: Arc::new(TestApi::default()),
            }
        }

        fn member(&self, user_id: &str, owner_id: &str) -> Classroom {
            self.member_on_bus(self.router.client(user_id), user_id, owner_id)
        }

        fn member_on_bus(&self, bus: Arc<MemoryBus>, user_id: &str, owner_id: &str) -> Classroom {
            Classroom::new(
                ClassroomConfig {
                    room_id: self.id.clone(),
                    user_id: user_id.into(),
                    owner_id: owner_id.into(),
                    max_on_stage_users: 2,
                    initial_status: if user_id == owner_id {
                        RoomStartStatus::Idle
                    } else {
                        RoomStartStatus::Started
                    },
                },
                bus,
                self.store.clone(),
                self.api.clone(),
            )
        }
    }

    async fn wait_for<T: Clone>(
        rx: &mut watch::Receiver<T>,
        pred: impl FnMut(&T) -> bool,
    ) -> T {
        timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("timed out waiting for watched value")
            .expect("watch channel closed")
            .clone()
    }

    fn find<'a>(users: &'a [RoomUser], id: &str) -> Option<&'a RoomUser> {
        users.iter().find(|u| u.id == id)
    }

    #[tokio::test]
    async fn owner_startup_announces_started() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        owner.connect().await.unwrap();

        assert_eq!(*owner.session_state().borrow(), SessionState::Ready);
        assert_eq!(*owner.status().borrow(), RoomStartStatus::Started);
        assert_eq!(
            *room.api.status_calls.lock().unwrap(),
            vec![RoomStartStatus::Started]
        );

        let mut members = owner.members();
        let users = wait_for(&mut members, |users| !users.is_empty()).await;
        let me = find(&users, "owner").unwrap();
        assert!(me.on_stage);
        assert!(me.online);
        assert_eq!(me.name, "owner-name");
    }

    #[tokio::test]
    async fn views_replay_to_subscribers_arriving_after_the_fact() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        // nobody holds a single receiver during startup
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        owner.ban(true).await.unwrap();
        let mut student_ban = student.ban_state();
        wait_for(&mut student_ban, |banned| *banned).await;

        // receivers created only now still observe the current state
        assert_eq!(*owner.session_state().borrow(), SessionState::Ready);
        assert_eq!(*owner.status().borrow(), RoomStartStatus::Started);
        assert!(*student.ban_state().borrow());
        let mut members = owner.members();
        wait_for(&mut members, |users| find(users, "s1").is_some()).await;
    }

    #[tokio::test]
    async fn concurrent_connects_admit_exactly_one() {
        let room = Room::new();
        let owner = Arc::new(room.member("owner", "owner"));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let classroom = owner.clone();
                tokio::spawn(async move { classroom.connect().await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(*owner.session_state().borrow(), SessionState::Ready);
    }

    #[tokio::test]
    async fn raise_hand_accept_puts_student_on_stage() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        student.update_raise_hand(true).await.unwrap();
        let mut owner_members = owner.members();
        let users = wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.raising_hand)
        })
        .await;
        assert!(!find(&users, "s1").unwrap().on_stage);

        owner.accept_raise_hand("s1").await.unwrap();
        let mut student_members = student.members();
        let users = wait_for(&mut student_members, |users| {
            find(users, "s1").is_some_and(|u| u.on_stage)
        })
        .await;
        assert!(!find(&users, "s1").unwrap().raising_hand);
    }

    #[tokio::test]
    async fn lowering_the_hand_leaves_the_queue() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        student.update_raise_hand(true).await.unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.raising_hand)
        })
        .await;

        student.update_raise_hand(false).await.unwrap();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| !u.raising_hand)
        })
        .await;
    }

    #[tokio::test]
    async fn raise_hand_commands_are_ignored_by_non_owners() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let s1 = room.member("s1", "owner");
        let s2 = room.member("s2", "owner");
        owner.connect().await.unwrap();
        s1.connect().await.unwrap();
        s2.connect().await.unwrap();

        // a raise-hand delivered to a non-owner never reaches the store
        let rogue = room.router.client("rogue");
        let data = encode(&Command::RaiseHand(true), &room.id).unwrap();
        rogue.send_unicast(data, "s1").await.unwrap();
        sleep(Duration::from_millis(100)).await;
        let members = owner.members().borrow().clone();
        assert!(members.iter().all(|u| !u.raising_hand));
    }

    #[tokio::test]
    async fn raise_hand_is_dropped_while_banned() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        owner.ban(true).await.unwrap();
        let mut student_ban = student.ban_state();
        wait_for(&mut student_ban, |banned| *banned).await;

        student.update_raise_hand(true).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        let members = owner.members().borrow().clone();
        assert!(!find(&members, "s1").unwrap().raising_hand);
    }

    #[tokio::test]
    async fn raise_hand_is_dropped_when_stage_is_full() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let s1 = room.member("s1", "owner");
        let s2 = room.member("s2", "owner");
        let s3 = room.member("s3", "owner");
        owner.connect().await.unwrap();
        s1.connect().await.unwrap();
        s2.connect().await.unwrap();
        s3.connect().await.unwrap();

        owner.pick_user_on_stage("s1").await.unwrap();
        owner.pick_user_on_stage("s2").await.unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            users.iter().filter(|u| u.on_stage && u.id != "owner").count() == 2
        })
        .await;

        // stage cap is 2: the request is silently dropped
        s3.update_raise_hand(true).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        let members = owner.members().borrow().clone();
        assert!(!find(&members, "s3").unwrap().raising_hand);
    }

    #[tokio::test]
    async fn ban_leaves_the_raise_hand_queue_untouched() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        student.update_raise_hand(true).await.unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.raising_hand)
        })
        .await;

        // the ban flag and the queue are independent fields
        owner.ban(true).await.unwrap();
        let mut student_ban = student.ban_state();
        wait_for(&mut student_ban, |banned| *banned).await;
        sleep(Duration::from_millis(50)).await;
        let members = owner.members().borrow().clone();
        assert!(find(&members, "s1").unwrap().raising_hand);
    }

    #[tokio::test]
    async fn class_mode_changes_reach_every_member() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        assert_eq!(*student.class_mode().borrow(), ClassMode::Lecture);

        owner.update_class_mode(ClassMode::Interaction).await.unwrap();
        let mut student_mode = student.class_mode();
        wait_for(&mut student_mode, |mode| *mode == ClassMode::Interaction).await;
        let mut owner_mode = owner.class_mode();
        wait_for(&mut owner_mode, |mode| *mode == ClassMode::Interaction).await;
    }

    #[tokio::test]
    async fn ban_reaches_students_as_toast_and_state() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        let mut student_events = student.events();
        let mut owner_events = owner.events();

        owner.ban(true).await.unwrap();

        let event = timeout(Duration::from_secs(2), student_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ClassroomEvent::BanMessage(true));
        // the owner surfaces its own toast locally
        assert_eq!(
            owner_events.recv().await.unwrap(),
            ClassroomEvent::BanMessage(true)
        );

        let mut student_ban = student.ban_state();
        wait_for(&mut student_ban, |banned| *banned).await;
    }

    #[tokio::test]
    async fn status_change_is_gated_by_the_status_service() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        room.api.fail_status.store(true, Ordering::SeqCst);
        let result = owner.update_room_start_status(RoomStartStatus::Paused).await;
        assert!(matches!(result, Err(RoomError::Transport(_))));

        // nothing was broadcast or published
        assert_eq!(*owner.status().borrow(), RoomStartStatus::Started);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(*student.status().borrow(), RoomStartStatus::Started);
        assert_eq!(
            *room.api.status_calls.lock().unwrap(),
            vec![RoomStartStatus::Started]
        );

        room.api.fail_status.store(false, Ordering::SeqCst);
        owner
            .update_room_start_status(RoomStartStatus::Stopped)
            .await
            .unwrap();
        let mut student_status = student.status();
        wait_for(&mut student_status, |s| *s == RoomStartStatus::Stopped).await;
    }

    #[tokio::test]
    async fn device_request_round_trip() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        let mut student_events = student.events();
        let mut owner_events = owner.events();

        // the member owns an entry before anyone can address its devices
        student
            .update_device_state("s1", DeviceState::default())
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        // turning a device on is a request, never a forced write
        owner
            .update_device_state(
                "s1",
                DeviceState {
                    mic: true,
                    camera: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(2), student_events.recv())
                .await
                .unwrap()
                .unwrap(),
            ClassroomEvent::DeviceRequest(DeviceKind::Mic)
        );

        student
            .request_device_response(DeviceKind::Mic, true)
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(2), owner_events.recv())
                .await
                .unwrap()
                .unwrap(),
            ClassroomEvent::DeviceRequestResponse {
                device: DeviceKind::Mic,
                user_id: "s1".into(),
                user_name: "s1-name".into(),
                on: true,
            }
        );

        student
            .update_device_state(
                "s1",
                DeviceState {
                    mic: true,
                    camera: false,
                },
            )
            .await
            .unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.device.mic)
        })
        .await;
    }

    #[tokio::test]
    async fn owner_forces_devices_off_with_a_notify() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        let mut student_events = student.events();

        student
            .update_device_state(
                "s1",
                DeviceState {
                    mic: true,
                    camera: true,
                },
            )
            .await
            .unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.device.mic && u.device.camera)
        })
        .await;

        owner
            .update_device_state("s1", DeviceState::default())
            .await
            .unwrap();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| !u.device.mic && !u.device.camera)
        })
        .await;
        // mic notify first, then camera
        assert_eq!(
            student_events.recv().await.unwrap(),
            ClassroomEvent::DeviceNotifyOff(DeviceKind::Mic)
        );
        assert_eq!(
            student_events.recv().await.unwrap(),
            ClassroomEvent::DeviceNotifyOff(DeviceKind::Camera)
        );
    }

    #[tokio::test]
    async fn all_mute_spares_cameras_and_the_owner() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        let mut student_events = student.events();

        owner
            .update_device_state(
                "owner",
                DeviceState {
                    mic: true,
                    camera: false,
                },
            )
            .await
            .unwrap();
        student
            .update_device_state(
                "s1",
                DeviceState {
                    mic: true,
                    camera: true,
                },
            )
            .await
            .unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.device.mic)
                && find(users, "owner").is_some_and(|u| u.device.mic)
        })
        .await;

        owner.all_mute().await.unwrap();
        let users = wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| !u.device.mic)
        })
        .await;
        assert!(find(&users, "s1").unwrap().device.camera);
        assert!(find(&users, "owner").unwrap().device.mic);
        assert_eq!(
            student_events.recv().await.unwrap(),
            ClassroomEvent::DeviceNotifyOff(DeviceKind::Mic)
        );
    }

    #[tokio::test]
    async fn stop_interaction_resets_stage_queue_and_devices() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let s1 = room.member("s1", "owner");
        let s2 = room.member("s2", "owner");
        owner.connect().await.unwrap();
        s1.connect().await.unwrap();
        s2.connect().await.unwrap();

        owner.pick_user_on_stage("s1").await.unwrap();
        s1.update_device_state(
            "s1",
            DeviceState {
                mic: true,
                camera: true,
            },
        )
        .await
        .unwrap();
        s2.update_raise_hand(true).await.unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.on_stage && u.device.mic)
                && find(users, "s2").is_some_and(|u| u.raising_hand)
        })
        .await;

        owner.stop_interaction().await.unwrap();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| !u.on_stage && !u.device.mic)
                && find(users, "s2").is_some_and(|u| !u.raising_hand)
        })
        .await;
    }

    #[tokio::test]
    async fn disconnect_user_clears_stage_and_devices() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        owner.pick_user_on_stage("s1").await.unwrap();
        student
            .update_device_state(
                "s1",
                DeviceState {
                    mic: true,
                    camera: false,
                },
            )
            .await
            .unwrap();
        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| u.on_stage && u.device.mic)
        })
        .await;

        owner.disconnect_user("s1").await.unwrap();
        wait_for(&mut owner_members, |users| {
            find(users, "s1").is_some_and(|u| !u.on_stage && !u.device.mic)
        })
        .await;
    }

    #[tokio::test]
    async fn leaving_member_drops_out_of_the_view() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        let mut owner_members = owner.members();
        wait_for(&mut owner_members, |users| find(users, "s1").is_some()).await;

        student.destroy().await;
        wait_for(&mut owner_members, |users| find(users, "s1").is_none()).await;
    }

    #[tokio::test]
    async fn commands_require_a_ready_session() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        assert_eq!(owner.ban(true).await, Err(RoomError::NotReady));
        assert_eq!(
            owner.update_raise_hand(true).await,
            Err(RoomError::NotReady)
        );
    }

    #[tokio::test]
    async fn owner_only_commands_reject_students() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let student = room.member("s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();

        assert!(matches!(
            student.ban(true).await,
            Err(RoomError::ConsistencyViolation(_))
        ));
        assert!(matches!(
            student
                .update_room_start_status(RoomStartStatus::Stopped)
                .await,
            Err(RoomError::ConsistencyViolation(_))
        ));
    }

    #[tokio::test]
    async fn fatal_bus_failure_surfaces_on_the_error_stream() {
        let room = Room::new();
        let owner = room.member("owner", "owner");
        let bus = room.router.client("s1");
        let student = room.member_on_bus(bus.clone(), "s1", "owner");
        owner.connect().await.unwrap();
        student.connect().await.unwrap();
        let mut errors = student.errors();

        bus.emit_fatal(FatalKind::RemoteLogin).await;
        let error = timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error, RoomError::Fatal(FatalKind::RemoteLogin));
    }
}
