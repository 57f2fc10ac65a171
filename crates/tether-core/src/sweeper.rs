//! Periodic cleanup of abandoned state.
//!
//! Four actions per tick, each independent and idempotent: prune
//! consumed signals, expire overdue sessions (telling any connected
//! peer first), hard-delete long-terminal sessions, and mark silent
//! devices offline. A failed or partial run leaves nothing corrupted
//! and is simply retried on the next tick.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::Serialize;

use tether_proto::{MsgType, SessionStatus, Side, SignalPayload};

use crate::relay;
use crate::store::{DeviceStore, RelayStore, SessionStore, SignalStore};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Cadence of the sweep loop.
    pub interval: StdDuration,
    /// Signals older than this are assumed consumed by both sides.
    pub signal_retention: Duration,
    /// Terminal sessions older than this are hard-deleted.
    pub terminal_retention: Duration,
    /// A device silent for longer than this is marked offline.
    pub device_liveness: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(180),
            signal_retention: Duration::minutes(1),
            terminal_retention: Duration::hours(24),
            device_liveness: Duration::minutes(2),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepSummary {
    pub signals_pruned: u64,
    pub sessions_expired: u64,
    pub sessions_deleted: u64,
    pub devices_marked_offline: u64,
}

pub struct Sweeper {
    store: Arc<dyn RelayStore>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self::with_config(store, SweeperConfig::default())
    }

    pub fn with_config(store: Arc<dyn RelayStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run forever on the configured interval.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            ticker.tick().await;
            let summary = self.sweep_once().await;
            tracing::info!(
                signals_pruned = summary.signals_pruned,
                sessions_expired = summary.sessions_expired,
                sessions_deleted = summary.sessions_deleted,
                devices_marked_offline = summary.devices_marked_offline,
                "sweep complete"
            );
        }
    }

    /// One pass over all four actions. Errors are logged per action so
    /// one failing backend call never starves the others.
    pub async fn sweep_once(&self) -> SweepSummary {
        let now = Utc::now();
        let mut summary = SweepSummary::default();

        match self
            .store
            .prune_signals_before(now - self.config.signal_retention)
            .await
        {
            Ok(pruned) => summary.signals_pruned = pruned,
            Err(err) => tracing::error!(error = %err, "signal prune failed"),
        }

        match self.store.all_sessions().await {
            Ok(sessions) => {
                for session in &sessions {
                    if session.is_open() && session.expires_at < now {
                        summary.sessions_expired += self.expire_session(session).await;
                    }
                }
                for session in &sessions {
                    if session.status.is_terminal()
                        && session.created_at < now - self.config.terminal_retention
                    {
                        match self.store.delete_session(session.id).await {
                            Ok(()) => summary.sessions_deleted += 1,
                            Err(err) => {
                                tracing::error!(session = %session.id, error = %err, "delete failed")
                            }
                        }
                    }
                }
            }
            Err(err) => tracing::error!(error = %err, "session scan failed"),
        }

        match self
            .store
            .mark_offline_before(now - self.config.device_liveness)
            .await
        {
            Ok(flipped) => {
                summary.devices_marked_offline = flipped.len() as u64;
                for device in flipped {
                    tracing::info!(device = %device, "marked offline after missed heartbeats");
                }
            }
            Err(err) => tracing::error!(error = %err, "offline marking failed"),
        }

        summary
    }

    /// Expire one overdue session: tell a possibly-connected peer
    /// first, then flip the status and free the device's holder.
    async fn expire_session(&self, session: &tether_proto::SessionRecord) -> u64 {
        if let Err(err) = relay::publish(
            self.store.as_ref(),
            session.id,
            Side::System,
            MsgType::Bye,
            SignalPayload::teardown("session_expired"),
        )
        .await
        {
            tracing::warn!(session = %session.id, error = %err, "expiry bye publish failed");
        }

        let mut expired = session.clone();
        expired.status = SessionStatus::Expired;
        expired.ended_at = Some(Utc::now());
        if let Err(err) = self.store.update_session(&expired).await {
            tracing::error!(session = %session.id, error = %err, "expiry update failed");
            return 0;
        }

        if let Some(device_id) = &session.device_id {
            if let Err(err) = self
                .store
                .swap_holder(device_id, Some(session.created_by.as_str()), None)
                .await
            {
                tracing::warn!(device = %device_id, error = %err, "holder release failed");
            }
        }
        tracing::info!(session = %session.id, "session expired");
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, SessionRegistry};
    use crate::store::{DeviceStore, MemoryStore, SessionStore, SignalStore};
    use tether_proto::NewSignal;
    use uuid::Uuid;

    fn sweeper(store: Arc<MemoryStore>) -> Sweeper {
        Sweeper::with_config(
            store as Arc<dyn RelayStore>,
            SweeperConfig {
                interval: StdDuration::from_secs(1),
                signal_retention: Duration::minutes(1),
                terminal_retention: Duration::hours(24),
                device_liveness: Duration::minutes(2),
            },
        )
    }

    #[tokio::test]
    async fn overdue_session_expires_with_bye() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::with_config(
            Arc::clone(&store) as Arc<dyn RelayStore>,
            RegistryConfig {
                // Already past its TTL the moment it is created.
                session_ttl: Duration::minutes(-16),
                support_ttl: Duration::minutes(30),
            },
        );
        registry.register_device("d1", "desk", None).await.unwrap();
        registry.claim_device("d1", "alice", "controller").await.unwrap();
        let (session, _) = registry.create_session("d1", "alice").await.unwrap();

        let summary = sweeper(Arc::clone(&store)).sweep_once().await;
        assert_eq!(summary.sessions_expired, 1);

        let expired = store.session(session.id).await.unwrap().unwrap();
        assert_eq!(expired.status, SessionStatus::Expired);

        let byes = store
            .signals_for_session(session.id, &[Side::System], 0)
            .await
            .unwrap();
        assert_eq!(byes.len(), 1);
        assert_eq!(byes[0].msg_type, MsgType::Bye);

        // Holder freed so the next claim starts clean.
        let device = store.device("d1").await.unwrap().unwrap();
        assert!(device.holder.is_none());

        // Second pass is a no-op.
        let summary = sweeper(store).sweep_once().await;
        assert_eq!(summary.sessions_expired, 0);
    }

    #[tokio::test]
    async fn old_signals_are_pruned() {
        let store = Arc::new(MemoryStore::new());
        let session_id = Uuid::new_v4();
        store
            .insert_signal(NewSignal {
                session_id,
                from_side: Side::Controller,
                msg_type: MsgType::Ice,
                payload: SignalPayload::sdp("x"),
            })
            .await
            .unwrap();

        // A fresh signal survives the one-minute window...
        let none = Sweeper::with_config(
            Arc::clone(&store) as Arc<dyn RelayStore>,
            SweeperConfig {
                signal_retention: Duration::minutes(1),
                ..SweeperConfig::default()
            },
        )
        .sweep_once()
        .await;
        assert_eq!(none.signals_pruned, 0);

        // ...a negative retention window prunes everything.
        let all = Sweeper::with_config(
            Arc::clone(&store) as Arc<dyn RelayStore>,
            SweeperConfig {
                signal_retention: Duration::minutes(-1),
                ..SweeperConfig::default()
            },
        )
        .sweep_once()
        .await;
        assert_eq!(all.signals_pruned, 1);
    }

    #[tokio::test]
    async fn old_terminal_sessions_are_deleted() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn RelayStore>);
        let (session, _) = registry.create_support_session("helper").await.unwrap();
        registry.end_session(session.id).await.unwrap();

        let mut old = store.session(session.id).await.unwrap().unwrap();
        old.created_at = Utc::now() - Duration::hours(25);
        store.update_session(&old).await.unwrap();

        let summary = sweeper(Arc::clone(&store)).sweep_once().await;
        assert_eq!(summary.sessions_deleted, 1);
        assert!(store.session(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silent_devices_go_offline() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn RelayStore>);
        registry.register_device("d1", "desk", None).await.unwrap();

        let mut device = store.device("d1").await.unwrap().unwrap();
        device.last_seen = Utc::now() - Duration::minutes(5);
        store.upsert_device(&device).await.unwrap();

        let summary = sweeper(Arc::clone(&store)).sweep_once().await;
        assert_eq!(summary.devices_marked_offline, 1);
        assert!(!store.device("d1").await.unwrap().unwrap().is_online);
    }
}
