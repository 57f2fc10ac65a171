//! Cross-component scenarios: registry, relay, negotiation machines on
//! both ends, multiplexer, and sweeper wired over one shared store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tether_core::{
    DeviceStore, EntryStatus, MemoryStore, MuxConfig, NegotiationMachine, NegotiationState,
    PeerConnector, PeerError, RegistryConfig, RelayBinding, RelayStore, RemoteCandidate, Role,
    SessionMultiplexer, SessionRegistry, SessionStore, SignalFeed, SignalStore, StoreError,
    Sweeper, SweeperConfig,
};
use tether_proto::{DeviceRecord, NewSignal, SessionRecord, SessionStatus, Side, SignalRecord};
use uuid::Uuid;

struct TestPeer {
    label: &'static str,
    events: Mutex<Vec<String>>,
}

impl TestPeer {
    fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnector for TestPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        Ok(format!("offer from {}", self.label))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, PeerError> {
        self.events.lock().unwrap().push(format!("accepted {sdp}"));
        Ok(format!("answer from {}", self.label))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), PeerError> {
        self.events.lock().unwrap().push(format!("applied {sdp}"));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &RemoteCandidate) -> Result<(), PeerError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("candidate {}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.events.lock().unwrap().push("closed".to_string());
    }
}

async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn fast_mux(store: Arc<MemoryStore>) -> SessionMultiplexer {
    SessionMultiplexer::with_config(
        store as Arc<dyn RelayStore>,
        MuxConfig {
            max_sessions: 6,
            poll_interval: Duration::from_millis(20),
        },
    )
}

#[tokio::test]
async fn offer_answer_roundtrip_over_shared_store() {
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn RelayStore>);
    registry.register_device("d1", "workstation", Some("alice")).await.unwrap();
    registry.claim_device("d1", "alice", "controller").await.unwrap();
    let (session, _) = registry.create_session("d1", "alice").await.unwrap();

    // Sharer end: machine plus its own dual-path subscription.
    let device_peer = TestPeer::new("device");
    let (device_machine, _device_events) = NegotiationMachine::new(
        session.id,
        Role::Device,
        device_peer.clone(),
        Arc::clone(&store) as Arc<dyn RelayStore>,
    );
    let mut device_binding = RelayBinding::bind(
        Arc::clone(&store) as Arc<dyn RelayStore>,
        session.id,
        vec![Side::Controller, Side::System],
        Duration::from_millis(20),
        device_machine.clone(),
    )
    .await;

    // Controller end through the multiplexer; opening the entry
    // publishes the offer.
    let mux = fast_mux(Arc::clone(&store));
    let controller_peer = TestPeer::new("controller");
    let entry = mux
        .create_or_switch("d1", &session, controller_peer.clone())
        .await
        .unwrap();

    wait_for("controller to connect", || {
        entry.view().status == EntryStatus::Connected
    })
    .await;
    assert_eq!(
        device_machine.state().await,
        NegotiationState::Connected
    );
    assert!(controller_peer
        .events()
        .contains(&"applied answer from device".to_string()));
    assert!(device_peer
        .events()
        .contains(&"accepted offer from controller".to_string()));

    // Negotiation completion flips the session to active.
    let active = store.session(session.id).await.unwrap().unwrap();
    assert_eq!(active.status, SessionStatus::Active);

    // Graceful close from the controller reaches the sharer as a bye.
    mux.close("d1").await.unwrap();
    wait_for("device to observe bye", || {
        device_peer.events().contains(&"closed".to_string())
    })
    .await;
    device_binding.detach();
}

/// Store wrapper that, once armed, holds every `device` read at a
/// barrier until two callers have arrived, so both claims observe the
/// same holder before either conditional update runs: the worst-case
/// interleaving.
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<Option<Arc<tokio::sync::Barrier>>>,
}

impl GatedStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            gate: Mutex::new(None),
        }
    }

    fn arm(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(tokio::sync::Barrier::new(2)));
    }
}

#[async_trait]
impl SignalStore for GatedStore {
    async fn insert_signal(&self, signal: NewSignal) -> Result<SignalRecord, StoreError> {
        self.inner.insert_signal(signal).await
    }

    async fn signals_for_session(
        &self,
        session_id: Uuid,
        sides: &[Side],
        after_seq: u64,
    ) -> Result<Vec<SignalRecord>, StoreError> {
        self.inner
            .signals_for_session(session_id, sides, after_seq)
            .await
    }

    async fn subscribe_signals(&self, session_id: Uuid) -> Result<SignalFeed, StoreError> {
        self.inner.subscribe_signals(session_id).await
    }

    async fn prune_signals_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_signals_before(cutoff).await
    }
}

#[async_trait]
impl SessionStore for GatedStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.inner.insert_session(session).await
    }

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.session(id).await
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.inner.update_session(session).await
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_session(id).await
    }

    async fn open_sessions_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.open_sessions_for_device(device_id).await
    }

    async fn session_by_pin_hash(
        &self,
        pin_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.session_by_pin_hash(pin_hash).await
    }

    async fn all_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.all_sessions().await
    }
}

#[async_trait]
impl DeviceStore for GatedStore {
    async fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError> {
        self.inner.upsert_device(device).await
    }

    async fn device(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let device = self.inner.device(id).await;
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        device
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        self.inner.devices().await
    }

    async fn delete_device(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_device(id).await
    }

    async fn record_heartbeat(&self, id: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.record_heartbeat(id, seen_at).await
    }

    async fn swap_holder(
        &self,
        device_id: &str,
        expected: Option<&str>,
        new_holder: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        self.inner.swap_holder(device_id, expected, new_holder).await
    }

    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        self.inner.mark_offline_before(cutoff).await
    }
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let gated = Arc::new(GatedStore::new(MemoryStore::new()));
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&gated) as Arc<dyn RelayStore>
    ));
    registry.register_device("d1", "desk", None).await.unwrap();
    gated.arm();

    let a = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.claim_device("d1", "alice", "controller").await })
    };
    let b = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.claim_device("d1", "bob", "controller").await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    assert!(
        a.claimed ^ b.claimed,
        "expected exactly one winner, got a={a:?} b={b:?}"
    );
    assert_eq!(a.kicked_sessions + b.kicked_sessions, 0);
}

#[tokio::test]
async fn answer_before_any_offer_leaves_session_negotiating() {
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn RelayStore>);
    registry.register_device("d1", "desk", None).await.unwrap();
    registry.claim_device("d1", "alice", "controller").await.unwrap();
    let (session, _) = registry.create_session("d1", "alice").await.unwrap();

    let controller_peer = TestPeer::new("controller");
    let (machine, _events) = NegotiationMachine::new(
        session.id,
        Role::Controller,
        controller_peer.clone(),
        Arc::clone(&store) as Arc<dyn RelayStore>,
    );
    let mut binding = RelayBinding::bind(
        Arc::clone(&store) as Arc<dyn RelayStore>,
        session.id,
        vec![Side::Device, Side::System],
        Duration::from_millis(20),
        machine.clone(),
    )
    .await;

    // The device jumps the gun and answers an offer that never was.
    tether_core::relay::publish(
        store.as_ref(),
        session.id,
        Side::Device,
        tether_proto::MsgType::Answer,
        tether_proto::SignalPayload::sdp("v=0 premature"),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(machine.state().await, NegotiationState::Idle);
    assert!(controller_peer.events().is_empty());
    let unchanged = store.session(session.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, SessionStatus::Pending);
    binding.detach();
}

#[tokio::test]
async fn takeover_displaces_live_controller() {
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn RelayStore>);
    registry.register_device("d1", "desk", None).await.unwrap();
    registry.claim_device("d1", "alice", "controller").await.unwrap();
    let (first, _) = registry.create_session("d1", "alice").await.unwrap();

    let mux = fast_mux(Arc::clone(&store));
    let entry = mux
        .create_or_switch("d1", &first, TestPeer::new("alice"))
        .await
        .unwrap();

    let outcome = registry.claim_device("d1", "bob", "controller").await.unwrap();
    assert!(outcome.claimed);
    assert_eq!(outcome.kicked_sessions, 1);

    wait_for("alice to be displaced", || {
        matches!(
            entry.view().status,
            EntryStatus::Ended { ref notice } if notice == "displaced by another controller"
        )
    })
    .await;

    let expired = store.session(first.id).await.unwrap().unwrap();
    assert_eq!(expired.status, SessionStatus::Expired);

    // Bob's fresh session is the only open one for the device.
    let (second, _) = registry.create_session("d1", "bob").await.unwrap();
    let open = store.open_sessions_for_device("d1").await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second.id);
}

#[tokio::test]
async fn sweeper_expiry_reaches_connected_controller() {
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::with_config(
        Arc::clone(&store) as Arc<dyn RelayStore>,
        RegistryConfig {
            session_ttl: chrono::Duration::minutes(-16),
            support_ttl: chrono::Duration::minutes(30),
        },
    );
    registry.register_device("d1", "desk", None).await.unwrap();
    registry.claim_device("d1", "alice", "controller").await.unwrap();
    let (session, _) = registry.create_session("d1", "alice").await.unwrap();

    let mux = fast_mux(Arc::clone(&store));
    let entry = mux
        .create_or_switch("d1", &session, TestPeer::new("alice"))
        .await
        .unwrap();

    let sweeper = Sweeper::with_config(
        Arc::clone(&store) as Arc<dyn RelayStore>,
        SweeperConfig::default(),
    );
    let summary = sweeper.sweep_once().await;
    assert_eq!(summary.sessions_expired, 1);

    wait_for("controller to learn of expiry", || {
        matches!(
            entry.view().status,
            EntryStatus::Ended { ref notice } if notice == "session expired"
        )
    })
    .await;

    let expired = store.session(session.id).await.unwrap().unwrap();
    assert_eq!(expired.status, SessionStatus::Expired);
}
