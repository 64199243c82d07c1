//! In-memory loopback transports. Faithful enough to the real presence bus
//! and shared store to drive the whole engine in tests and local demos.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use lyceum_logger::debug;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    time::sleep,
};

use crate::{
    bus::{BusEvent, BusProvider},
    model::{BucketMap, DEVICE_STATE_BUCKET},
    store::{BucketChange, StoreProvider},
    types::{FatalKind, RoomError, RoomResult},
};

/// One room's worth of connected peers. Hand a clone to every
/// [`MemoryBus`] client that should share the room.
#[derive(Default)]
pub struct MemoryRouter {
    peers: Mutex<HashMap<String, mpsc::Sender<BusEvent>>>,
}

impl MemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, user_id: impl Into<String>) -> Arc<MemoryBus> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(MemoryBus {
            router: self.clone(),
            user_id: user_id.into(),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }
}

/// Per-client handle onto a [`MemoryRouter`].
pub struct MemoryBus {
    router: Arc<MemoryRouter>,
    user_id: String,
    tx: mpsc::Sender<BusEvent>,
    rx: Mutex<Option<mpsc::Receiver<BusEvent>>>,
}

impl MemoryBus {
    /// Injects an unrecoverable presence failure into this client's feed.
    pub async fn emit_fatal(&self, kind: FatalKind) {
        let _ = self.tx.send(BusEvent::Fatal(kind)).await;
    }
}

#[async_trait]
impl BusProvider for MemoryBus {
    async fn login(&self) -> RoomResult {
        Ok(())
    }

    async fn join(&self) -> RoomResult {
        let mut peers = self.router.peers.lock().await;
        for peer in peers.values() {
            let _ = peer.send(BusEvent::MemberJoined(self.user_id.clone())).await;
        }
        peers.insert(self.user_id.clone(), self.tx.clone());
        debug!("{} joined the room", self.user_id);
        Ok(())
    }

    async fn leave(&self) -> RoomResult {
        let mut peers = self.router.peers.lock().await;
        peers.remove(&self.user_id);
        for peer in peers.values() {
            let _ = peer.send(BusEvent::MemberLeft(self.user_id.clone())).await;
        }
        debug!("{} left the room", self.user_id);
        Ok(())
    }

    async fn get_members(&self) -> RoomResult<Vec<String>> {
        Ok(self.router.peers.lock().await.keys().cloned().collect())
    }

    async fn send_broadcast(&self, data: Vec<u8>) -> RoomResult {
        let peers = self.router.peers.lock().await;
        if !peers.contains_key(&self.user_id) {
            return Err(RoomError::Transport("not in the room".into()));
        }
        // the sender does not hear its own broadcast
        for (id, peer) in peers.iter() {
            if *id == self.user_id {
                continue;
            }
            let _ = peer
                .send(BusEvent::Message {
                    data: data.clone(),
                    sender: self.user_id.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn send_unicast(&self, data: Vec<u8>, target: &str) -> RoomResult {
        let peers = self.router.peers.lock().await;
        let peer = peers
            .get(target)
            .ok_or_else(|| RoomError::Transport(format!("peer {target} unreachable")))?;
        peer.send(BusEvent::Message {
            data,
            sender: self.user_id.clone(),
        })
        .await
        .map_err(|_| RoomError::Transport(format!("peer {target} stopped receiving")))
    }

    async fn subscribe(&self) -> RoomResult<mpsc::Receiver<BusEvent>> {
        self.rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RoomError::Transport("bus events already taken".into()))
    }
}

/// Shared last-writer-wins store. `deviceState` notifies with changed key
/// names only (forcing the re-fetch path); every other bucket notifies with
/// materialized field values, matching the real store's split behavior.
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, BucketMap>>,
    changes: broadcast::Sender<BucketChange>,
    connect_delay: Duration,
    fail_connections: AtomicBool,
    connect_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_connect_delay(Duration::ZERO)
    }

    pub fn with_connect_delay(delay: Duration) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            changes,
            connect_delay: delay,
            fail_connections: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        })
    }

    /// Makes every subsequent bucket handshake fail.
    pub fn fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    /// Number of buckets connected successfully so far.
    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of full bucket reads served so far.
    pub fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreProvider for MemoryStore {
    async fn connect_bucket(&self, name: &str, default: BucketMap) -> RoomResult {
        sleep(self.connect_delay).await;
        if self.fail_connections.load(Ordering::SeqCst) {
            return Err(RoomError::Transport(format!(
                "bucket {name} connection refused"
            )));
        }
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(name.to_owned()).or_default();
        for (key, value) in default {
            bucket.entry(key).or_insert(value);
        }
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_bucket(&self, name: &str) -> RoomResult<BucketMap> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.buckets
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RoomError::Transport(format!("bucket {name} not connected")))
    }

    async fn set_partial(&self, name: &str, partial: BucketMap) -> RoomResult {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .get_mut(name)
            .ok_or_else(|| RoomError::Transport(format!("bucket {name} not connected")))?;
        for (key, value) in partial.clone() {
            bucket.insert(key, value);
        }
        drop(buckets);

        let change = if name == DEVICE_STATE_BUCKET {
            BucketChange::Keys {
                bucket: name.to_owned(),
                keys: partial.keys().cloned().collect(),
            }
        } else {
            BucketChange::Fields {
                bucket: name.to_owned(),
                fields: partial,
            }
        };
        let _ = self.changes.send(change);
        Ok(())
    }

    async fn disconnect_bucket(&self, name: &str) -> RoomResult {
        // releasing a subscription is client-side: the receiver goes away
        debug!("bucket {name} subscription released");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BucketChange> {
        self.changes.subscribe()
    }
}
