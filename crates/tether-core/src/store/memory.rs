//! In-process store backend. Used by the test suite and by embedded
//! single-process deployments; the Redis backend in the relay front-end
//! is the production twin.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use tether_proto::{DeviceRecord, NewSignal, SessionRecord, SignalRecord, Side};

use super::{SignalFeed, SignalStore, SessionStore, DeviceStore};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    signals: HashMap<Uuid, Vec<SignalRecord>>,
    seq: HashMap<Uuid, u64>,
    sessions: HashMap<Uuid, SessionRecord>,
    devices: HashMap<String, DeviceRecord>,
    subscribers: HashMap<Uuid, Vec<mpsc::UnboundedSender<SignalRecord>>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; the data is
        // still consistent for a store this simple.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn insert_signal(&self, signal: NewSignal) -> Result<SignalRecord, StoreError> {
        let mut inner = self.lock();
        let seq = inner.seq.entry(signal.session_id).or_insert(0);
        *seq += 1;
        let record = SignalRecord {
            id: Uuid::new_v4(),
            session_id: signal.session_id,
            from_side: signal.from_side,
            msg_type: signal.msg_type,
            payload: signal.payload,
            created_at: Utc::now(),
            seq: *seq,
        };
        inner
            .signals
            .entry(record.session_id)
            .or_default()
            .push(record.clone());
        if let Some(subs) = inner.subscribers.get_mut(&record.session_id) {
            subs.retain(|tx| tx.send(record.clone()).is_ok());
        }
        Ok(record)
    }

    async fn signals_for_session(
        &self,
        session_id: Uuid,
        sides: &[Side],
        after_seq: u64,
    ) -> Result<Vec<SignalRecord>, StoreError> {
        let inner = self.lock();
        let mut rows: Vec<SignalRecord> = inner
            .signals
            .get(&session_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.seq > after_seq && sides.contains(&r.from_side))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    async fn subscribe_signals(&self, session_id: Uuid) -> Result<SignalFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(session_id)
            .or_default()
            .push(tx);
        Ok(SignalFeed::new(rx))
    }

    async fn prune_signals_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut pruned = 0u64;
        for rows in inner.signals.values_mut() {
            let before = rows.len();
            rows.retain(|r| r.created_at >= cutoff);
            pruned += (before - rows.len()) as u64;
        }
        inner.signals.retain(|_, rows| !rows.is_empty());
        Ok(pruned)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sessions.remove(&id);
        inner.signals.remove(&id);
        inner.seq.remove(&id);
        inner.subscribers.remove(&id);
        Ok(())
    }

    async fn open_sessions_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.device_id.as_deref() == Some(device_id) && s.is_open())
            .cloned()
            .collect())
    }

    async fn session_by_pin_hash(
        &self,
        pin_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .lock()
            .sessions
            .values()
            .find(|s| s.pin_hash == pin_hash)
            .cloned())
    }

    async fn all_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.lock().sessions.values().cloned().collect())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError> {
        self.lock()
            .devices
            .insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn device(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.lock().devices.get(id).cloned())
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.lock().devices.values().cloned().collect())
    }

    async fn delete_device(&self, id: &str) -> Result<(), StoreError> {
        self.lock().devices.remove(id);
        Ok(())
    }

    async fn record_heartbeat(&self, id: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.devices.get_mut(id) {
            Some(device) => {
                device.is_online = true;
                device.last_seen = seen_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn swap_holder(
        &self,
        device_id: &str,
        expected: Option<&str>,
        new_holder: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return Ok(false);
        };
        if device.holder.as_deref() != expected {
            return Ok(false);
        }
        match new_holder {
            Some((holder, holder_type)) => {
                device.holder = Some(holder.to_string());
                device.holder_type = Some(holder_type.to_string());
            }
            None => {
                device.holder = None;
                device.holder_type = None;
            }
        }
        Ok(true)
    }

    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        let mut flipped = Vec::new();
        for device in inner.devices.values_mut() {
            if device.is_online && device.last_seen < cutoff {
                device.is_online = false;
                flipped.push(device.id.clone());
            }
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::{MsgType, SignalPayload};

    fn device(id: &str) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            name: format!("device {id}"),
            owner: None,
            is_online: true,
            last_seen: Utc::now(),
            holder: None,
            holder_type: None,
        }
    }

    #[tokio::test]
    async fn signals_ordered_by_seq_and_filtered_by_side() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        for (side, kind) in [
            (Side::Controller, MsgType::Offer),
            (Side::Device, MsgType::Answer),
            (Side::Device, MsgType::Ice),
        ] {
            store
                .insert_signal(NewSignal {
                    session_id,
                    from_side: side,
                    msg_type: kind,
                    payload: SignalPayload::sdp("x"),
                })
                .await
                .unwrap();
        }

        let rows = store
            .signals_for_session(session_id, &[Side::Device, Side::System], 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].seq < rows[1].seq);
        assert_eq!(rows[0].msg_type, MsgType::Answer);

        let after = store
            .signals_for_session(session_id, &[Side::Device, Side::System], rows[0].seq)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].msg_type, MsgType::Ice);
    }

    #[tokio::test]
    async fn subscribe_delivers_inserts() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let mut feed = store.subscribe_signals(session_id).await.unwrap();
        store
            .insert_signal(NewSignal {
                session_id,
                from_side: Side::Controller,
                msg_type: MsgType::Offer,
                payload: SignalPayload::sdp("v=0"),
            })
            .await
            .unwrap();
        let record = feed.recv().await.unwrap();
        assert_eq!(record.msg_type, MsgType::Offer);
    }

    #[tokio::test]
    async fn holder_swap_is_compare_and_swap() {
        let store = MemoryStore::new();
        store.upsert_device(&device("d1")).await.unwrap();

        assert!(store
            .swap_holder("d1", None, Some(("alice", "controller")))
            .await
            .unwrap());
        // Stale expectation loses.
        assert!(!store
            .swap_holder("d1", None, Some(("bob", "controller")))
            .await
            .unwrap());
        assert!(store
            .swap_holder("d1", Some("alice"), Some(("bob", "controller")))
            .await
            .unwrap());
        let d = store.device("d1").await.unwrap().unwrap();
        assert_eq!(d.holder.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn offline_marking_respects_cutoff() {
        let store = MemoryStore::new();
        let mut stale = device("stale");
        stale.last_seen = Utc::now() - chrono::Duration::minutes(10);
        store.upsert_device(&stale).await.unwrap();
        store.upsert_device(&device("fresh")).await.unwrap();

        let flipped = store
            .mark_offline_before(Utc::now() - chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(flipped, vec!["stale".to_string()]);
        assert!(!store.device("stale").await.unwrap().unwrap().is_online);
        assert!(store.device("fresh").await.unwrap().unwrap().is_online);
    }
}
