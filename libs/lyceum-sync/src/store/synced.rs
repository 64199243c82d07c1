use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::try_join;
use lyceum_logger::{debug, error, info, trace, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::{BucketChange, StoreProvider, StoreSnapshot, StoreUpdate};
use crate::{
    model::{BucketMap, DeviceState, RoomState, DEVICE_STATE_BUCKET, ROOM_STATE_BUCKET},
    types::{RoomError, RoomResult},
};

pub(crate) const FIELD_CLASS_MODE: &str = "classMode";
pub(crate) const FIELD_RAISE_HAND_USERS: &str = "raiseHandUsers";
pub(crate) const FIELD_BAN: &str = "ban";
pub(crate) const FIELD_ON_STAGE_USERS: &str = "onStageUsers";

enum ConnectState {
    Idle,
    /// Handshake in flight; queued callers resolve together when it settles.
    Connecting(Vec<oneshot::Sender<RoomResult>>),
    Ready,
    Failed(RoomError),
}

/// Adapter over the remote store.
///
/// Owns the two classroom buckets, gates every read behind the two-phase
/// connect handshake, and pumps push notifications into a single channel of
/// tagged [`StoreUpdate`] values for the reconciler.
pub struct SyncedStore {
    provider: Arc<dyn StoreProvider>,
    state: Mutex<ConnectState>,
    updates_tx: mpsc::Sender<RoomResult<StoreUpdate>>,
    updates_rx: Mutex<Option<mpsc::Receiver<RoomResult<StoreUpdate>>>>,
    shutdown: watch::Sender<bool>,
}

impl SyncedStore {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            provider,
            state: Mutex::new(ConnectState::Idle),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            shutdown,
        }
    }

    /// Takes the store-update feed. Yields `None` after the first call.
    pub fn updates(&self) -> Option<mpsc::Receiver<RoomResult<StoreUpdate>>> {
        self.updates_rx.lock().unwrap().take()
    }

    /// Connects both buckets with their defaults. Idempotent: the store is
    /// ready only once *all* buckets completed their handshake, and every
    /// caller queued behind an in-flight handshake settles together, exactly
    /// once.
    pub async fn connect(&self) -> RoomResult {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                ConnectState::Ready => return Ok(()),
                ConnectState::Failed(e) => return Err(e.clone()),
                ConnectState::Connecting(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                ConnectState::Idle => {
                    *state = ConnectState::Connecting(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx
                .await
                .unwrap_or_else(|_| Err(RoomError::Transport("store handshake dropped".into())));
        }

        let result = self.handshake().await;
        let waiters = {
            let mut state = self.state.lock().unwrap();
            let settled = match &result {
                Ok(()) => ConnectState::Ready,
                Err(e) => ConnectState::Failed(e.clone()),
            };
            match std::mem::replace(&mut *state, settled) {
                ConnectState::Connecting(waiters) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn handshake(&self) -> RoomResult {
        info!("connecting store buckets");
        try_join!(
            self.provider
                .connect_bucket(DEVICE_STATE_BUCKET, BucketMap::new()),
            self.provider
                .connect_bucket(ROOM_STATE_BUCKET, RoomState::default_fields()),
        )?;
        self.spawn_pump();
        info!("store buckets connected");
        Ok(())
    }

    fn spawn_pump(&self) {
        let provider = self.provider.clone();
        let changes = provider.subscribe();
        let updates_tx = self.updates_tx.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(pump(provider, changes, updates_tx, shutdown));
    }

    fn ensure_ready(&self) -> RoomResult {
        match &*self.state.lock().unwrap() {
            ConnectState::Ready => Ok(()),
            ConnectState::Failed(e) => Err(e.clone()),
            _ => Err(RoomError::NotReady),
        }
    }

    /// Fresh read of both buckets, queued behind readiness.
    pub async fn snapshot(&self) -> RoomResult<StoreSnapshot> {
        self.connect().await?;
        let (device, room) = try_join!(
            self.provider.get_bucket(DEVICE_STATE_BUCKET),
            self.provider.get_bucket(ROOM_STATE_BUCKET),
        )?;
        Ok(StoreSnapshot {
            device_state: parse_device_state(&device),
            room_state: serde_json::from_value(Value::Object(room))?,
        })
    }

    /// Partial write, resolved last-writer-wins per top-level key by the
    /// store.
    pub async fn write(&self, update: StoreUpdate) -> RoomResult {
        self.ensure_ready()?;
        debug!("store write: {:?}", update);
        let (bucket, partial) = match update {
            StoreUpdate::DeviceState(states) => {
                let mut partial = BucketMap::new();
                for (id, state) in states {
                    partial.insert(id, serde_json::to_value(state)?);
                }
                (DEVICE_STATE_BUCKET, partial)
            }
            StoreUpdate::RaiseHandUsers(users) => (
                ROOM_STATE_BUCKET,
                field(FIELD_RAISE_HAND_USERS, serde_json::to_value(users)?),
            ),
            StoreUpdate::OnStageUsers(users) => (
                ROOM_STATE_BUCKET,
                field(FIELD_ON_STAGE_USERS, serde_json::to_value(users)?),
            ),
            StoreUpdate::Ban(ban) => (ROOM_STATE_BUCKET, field(FIELD_BAN, Value::Bool(ban))),
            StoreUpdate::ClassMode(mode) => (
                ROOM_STATE_BUCKET,
                field(FIELD_CLASS_MODE, serde_json::to_value(mode)?),
            ),
        };
        self.provider.set_partial(bucket, partial).await
    }

    /// Releases the bucket subscriptions and stops the pump. Partial writes
    /// already in flight are left to complete.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let ready = matches!(&*self.state.lock().unwrap(), ConnectState::Ready);
        if ready {
            for bucket in [DEVICE_STATE_BUCKET, ROOM_STATE_BUCKET] {
                if let Err(e) = self.provider.disconnect_bucket(bucket).await {
                    warn!("failed to release {bucket} subscription: {e}");
                }
            }
        }
    }
}

fn field(name: &str, value: Value) -> BucketMap {
    let mut partial = BucketMap::new();
    partial.insert(name.into(), value);
    partial
}

fn parse_device_state(bucket: &BucketMap) -> HashMap<String, DeviceState> {
    bucket
        .iter()
        .filter_map(
            |(id, value)| match serde_json::from_value::<DeviceState>(value.clone()) {
                Ok(state) => Some((id.clone(), state)),
                Err(e) => {
                    warn!("dropping malformed device state for {id}: {e}");
                    None
                }
            },
        )
        .collect()
}

async fn pump(
    provider: Arc<dyn StoreProvider>,
    mut changes: broadcast::Receiver<BucketChange>,
    updates_tx: mpsc::Sender<RoomResult<StoreUpdate>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    if !forward_change(provider.as_ref(), change, &updates_tx).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("store change feed lagged by {n} notifications");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = updates_tx
                        .send(Err(RoomError::Transport("store change feed closed".into())))
                        .await;
                    break;
                }
            },
        }
    }
    debug!("store pump stopped");
}

/// Materializes one push notification into tagged updates. Returns `false`
/// once the reconciler is gone or the feed is no longer usable.
async fn forward_change(
    provider: &dyn StoreProvider,
    change: BucketChange,
    updates_tx: &mpsc::Sender<RoomResult<StoreUpdate>>,
) -> bool {
    match change {
        BucketChange::Keys { bucket, keys } if bucket == DEVICE_STATE_BUCKET => {
            trace!("device state changed: {keys:?}");
            // the notification carries key names only; values must be
            // re-fetched because many writers multiplex this bucket
            match provider.get_bucket(DEVICE_STATE_BUCKET).await {
                Ok(map) => updates_tx
                    .send(Ok(StoreUpdate::DeviceState(parse_device_state(&map))))
                    .await
                    .is_ok(),
                Err(e) => {
                    error!("failed to re-fetch device state: {e}");
                    let _ = updates_tx.send(Err(e)).await;
                    false
                }
            }
        }
        BucketChange::Fields { bucket, fields } if bucket == ROOM_STATE_BUCKET => {
            for (name, value) in fields {
                let update = match name.as_str() {
                    FIELD_RAISE_HAND_USERS => serde_json::from_value(value)
                        .ok()
                        .map(StoreUpdate::RaiseHandUsers),
                    FIELD_ON_STAGE_USERS => serde_json::from_value(value)
                        .ok()
                        .map(StoreUpdate::OnStageUsers),
                    FIELD_BAN => value.as_bool().map(StoreUpdate::Ban),
                    FIELD_CLASS_MODE => serde_json::from_value(value)
                        .ok()
                        .map(StoreUpdate::ClassMode),
                    _ => {
                        trace!("ignoring unknown room state field {name}");
                        continue;
                    }
                };
                let Some(update) = update else {
                    warn!("dropping malformed room state field {name}");
                    continue;
                };
                if updates_tx.send(Ok(update)).await.is_err() {
                    return false;
                }
            }
            true
        }
        // changes for buckets this adapter does not own
        _ => true,
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{connector::MemoryStore, model::ClassMode};

    #[tokio::test]
    async fn snapshot_returns_connect_defaults() {
        let store = SyncedStore::new(MemoryStore::new());
        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot.device_state.is_empty());
        assert_eq!(snapshot.room_state, RoomState::default());
        assert_eq!(snapshot.room_state.class_mode, ClassMode::Lecture);
        assert!(!snapshot.room_state.ban);
    }

    #[tokio::test]
    async fn queued_waiters_resolve_together() {
        let provider = MemoryStore::with_connect_delay(Duration::from_millis(30));
        let store = Arc::new(SyncedStore::new(provider.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.snapshot().await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        // one handshake serves all callers: one connect per bucket
        assert_eq!(provider.connect_count(), 2);
    }

    #[tokio::test]
    async fn queued_waiters_reject_together() {
        let provider = MemoryStore::with_connect_delay(Duration::from_millis(30));
        provider.fail_connections(true);
        let store = Arc::new(SyncedStore::new(provider.clone()));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.snapshot().await })
            })
            .collect();
        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(RoomError::Transport(_))
            ));
        }
        // the failed handshake connected nothing and is not retried
        assert_eq!(provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn device_changes_are_refetched_in_full() {
        let provider = MemoryStore::new();
        let store = SyncedStore::new(provider.clone());
        store.connect().await.unwrap();
        let mut updates = store.updates().unwrap();

        store
            .write(StoreUpdate::DeviceState(
                [(
                    "u1".to_owned(),
                    DeviceState {
                        mic: true,
                        camera: false,
                    },
                )]
                .into(),
            ))
            .await
            .unwrap();

        let update = updates.recv().await.unwrap().unwrap();
        let StoreUpdate::DeviceState(states) = update else {
            panic!("expected a device state update, got {update:?}");
        };
        assert!(states["u1"].mic);
        assert!(!states["u1"].camera);
    }

    #[tokio::test]
    async fn room_state_changes_arrive_materialized() {
        let provider = MemoryStore::new();
        let store = SyncedStore::new(provider.clone());
        store.connect().await.unwrap();
        let mut updates = store.updates().unwrap();
        let fetches_before = provider.get_count();

        store
            .write(StoreUpdate::RaiseHandUsers(vec!["u1".to_owned()]))
            .await
            .unwrap();
        store.write(StoreUpdate::Ban(true)).await.unwrap();
        store
            .write(StoreUpdate::ClassMode(ClassMode::Interaction))
            .await
            .unwrap();

        assert_eq!(
            updates.recv().await.unwrap().unwrap(),
            StoreUpdate::RaiseHandUsers(vec!["u1".to_owned()])
        );
        assert_eq!(
            updates.recv().await.unwrap().unwrap(),
            StoreUpdate::Ban(true)
        );
        assert_eq!(
            updates.recv().await.unwrap().unwrap(),
            StoreUpdate::ClassMode(ClassMode::Interaction)
        );
        // materialized fields never trigger a re-fetch
        assert_eq!(provider.get_count(), fetches_before);
    }

    #[tokio::test]
    async fn writes_before_readiness_are_rejected() {
        let store = SyncedStore::new(MemoryStore::new());
        assert_eq!(
            store.write(StoreUpdate::Ban(true)).await,
            Err(RoomError::NotReady)
        );
    }
}
