//! Thin async interface over a durable relation with change
//! notification. The relay is a store, not a process holding sockets:
//! any number of front-ends may share one backend, so everything the
//! registry, relay, and sweeper need is expressed against these traits.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use tether_proto::{DeviceRecord, NewSignal, SessionRecord, Side, SignalRecord};

use crate::error::StoreError;

/// Push feed of signal inserts for one session. Best-effort: it may lag,
/// miss rows during a backend reconnect, or fail to open at all. The
/// poll path is the correctness backstop.
pub struct SignalFeed {
    rx: mpsc::UnboundedReceiver<SignalRecord>,
}

impl SignalFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<SignalRecord>) -> Self {
        Self { rx }
    }

    /// Next inserted signal, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<SignalRecord> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Append one signal row. The store assigns id, created_at, and the
    /// per-session insertion sequence.
    async fn insert_signal(&self, signal: NewSignal) -> Result<SignalRecord, StoreError>;

    /// All signals for a session from the given sides with seq greater
    /// than `after_seq`, ordered by creation time (seq breaks ties).
    async fn signals_for_session(
        &self,
        session_id: Uuid,
        sides: &[Side],
        after_seq: u64,
    ) -> Result<Vec<SignalRecord>, StoreError>;

    /// Open a push feed of inserts filtered to `session_id`.
    async fn subscribe_signals(&self, session_id: Uuid) -> Result<SignalFeed, StoreError>;

    /// Delete signals older than `cutoff`; returns how many went away.
    async fn prune_signals_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError>;

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError>;

    /// Sessions for a device still in a pending/active status.
    async fn open_sessions_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    async fn session_by_pin_hash(
        &self,
        pin_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    async fn all_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError>;

    async fn device(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Explicit removal; devices are never deleted any other way.
    async fn delete_device(&self, id: &str) -> Result<(), StoreError>;

    /// Refresh last_seen and the online flag. Returns false for an
    /// unknown device.
    async fn record_heartbeat(&self, id: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Compare-and-swap on the device's current-holder field: succeeds
    /// only if the holder still equals `expected`. This is the sole
    /// mutation path for the claim's contended state.
    async fn swap_holder(
        &self,
        device_id: &str,
        expected: Option<&str>,
        new_holder: Option<(&str, &str)>,
    ) -> Result<bool, StoreError>;

    /// Clear the online flag on devices whose last_seen predates
    /// `cutoff`; returns the ids that were flipped.
    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}

/// The full adapter surface a relay front-end supplies.
pub trait RelayStore: SignalStore + SessionStore + DeviceStore {}

impl<T: SignalStore + SessionStore + DeviceStore> RelayStore for T {}
