//! Controller-side fan-out over concurrent sessions.
//!
//! Each open device gets an independent negotiation machine plus the
//! UI-relevant view state; the per-device map is the only structure
//! shared across sessions and supports concurrent insert/remove/lookup.
//! Switching focus is a pure local operation.

use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tether_proto::{SessionRecord, Side};

use crate::error::MuxError;
use crate::negotiation::{
    EndReason, MachineEvent, NegotiationMachine, PeerConnector, Role,
};
use crate::relay::{RelayBinding, DEFAULT_POLL_INTERVAL};
use crate::store::RelayStore;

pub const DEFAULT_MAX_SESSIONS: usize = 6;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub max_sessions: usize,
    pub poll_interval: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Negotiating,
    Connected,
    /// Terminal, with the single user-facing notice for this entry.
    Ended { notice: String },
}

/// What the UI renders for one open device.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub status: EntryStatus,
    pub frames_received: u64,
    pub last_frame: Option<Vec<u8>>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            status: EntryStatus::Negotiating,
            frames_received: 0,
            last_frame: None,
        }
    }
}

pub struct SessionEntry {
    device_id: String,
    session_id: Uuid,
    machine: Arc<NegotiationMachine>,
    binding: StdMutex<RelayBinding>,
    view: StdMutex<ViewState>,
    events_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("device_id", &self.device_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionEntry {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn machine(&self) -> &Arc<NegotiationMachine> {
        &self.machine
    }

    pub fn view(&self) -> ViewState {
        self.view.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_status(&self, status: EntryStatus) {
        self.view.lock().unwrap_or_else(|e| e.into_inner()).status = status;
    }

    fn push_frame(&self, frame: Vec<u8>) {
        let mut view = self.view.lock().unwrap_or_else(|e| e.into_inner());
        view.frames_received += 1;
        view.last_frame = Some(frame);
    }

    /// The three releases (poll loop, push feed, peer connection)
    /// always run together, whatever triggered the teardown.
    async fn teardown(&self, publish_bye: bool) {
        self.binding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .detach();
        if let Some(task) = self
            .events_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if publish_bye {
            self.machine.close("controller closed").await;
        }
    }
}

fn terminal_notice(reason: &EndReason) -> String {
    match reason {
        EndReason::Kicked { .. } => "displaced by another controller".to_string(),
        EndReason::Bye { reason } if reason == "session_expired" => "session expired".to_string(),
        EndReason::Bye { .. } | EndReason::Failed(_) | EndReason::Closed => {
            "disconnected".to_string()
        }
    }
}

pub struct SessionMultiplexer {
    store: Arc<dyn RelayStore>,
    config: MuxConfig,
    entries: DashMap<String, Arc<SessionEntry>>,
    focused: RwLock<Option<String>>,
    /// Serializes admission so the max-session check and the insert
    /// are atomic with respect to concurrent create calls.
    admission: Mutex<()>,
}

impl SessionMultiplexer {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self::with_config(store, MuxConfig::default())
    }

    pub fn with_config(store: Arc<dyn RelayStore>, config: MuxConfig) -> Self {
        Self {
            store,
            config,
            entries: DashMap::new(),
            focused: RwLock::new(None),
            admission: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, device_id: &str) -> Option<Arc<SessionEntry>> {
        self.entries.get(device_id).map(|e| Arc::clone(e.value()))
    }

    pub fn focused_device(&self) -> Option<String> {
        self.focused.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn focused_entry(&self) -> Option<Arc<SessionEntry>> {
        self.focused_device().and_then(|id| self.entry(&id))
    }

    /// Pure local focus change; no network involved.
    pub fn switch(&self, device_id: &str) -> bool {
        if self.entries.contains_key(device_id) {
            *self.focused.write().unwrap_or_else(|e| e.into_inner()) =
                Some(device_id.to_string());
            true
        } else {
            false
        }
    }

    /// Returns the existing entry (switching focus to it) rather than
    /// creating a duplicate; otherwise starts a new machine for the
    /// device, bounded by the configured maximum.
    pub async fn create_or_switch(
        &self,
        device_id: &str,
        session: &SessionRecord,
        peer: Arc<dyn PeerConnector>,
    ) -> Result<Arc<SessionEntry>, MuxError> {
        let _admission = self.admission.lock().await;

        if let Some(existing) = self.entry(device_id) {
            self.switch(device_id);
            return Ok(existing);
        }
        if self.entries.len() >= self.config.max_sessions {
            return Err(MuxError::MaxSessions(self.config.max_sessions));
        }

        let (machine, events) = NegotiationMachine::new(
            session.id,
            Role::Controller,
            peer,
            Arc::clone(&self.store),
        );
        let binding = RelayBinding::bind(
            Arc::clone(&self.store),
            session.id,
            vec![Side::Device, Side::System],
            self.config.poll_interval,
            machine.clone(),
        )
        .await;

        let entry = Arc::new(SessionEntry {
            device_id: device_id.to_string(),
            session_id: session.id,
            machine: machine.clone(),
            binding: StdMutex::new(binding),
            view: StdMutex::new(ViewState::default()),
            events_task: StdMutex::new(None),
        });

        let task = tokio::spawn(watch_events(Arc::downgrade(&entry), events));
        *entry
            .events_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        if let Err(err) = machine.start_offer().await {
            entry.teardown(false).await;
            return Err(MuxError::Negotiation(err));
        }

        self.entries
            .insert(device_id.to_string(), Arc::clone(&entry));
        *self.focused.write().unwrap_or_else(|e| e.into_inner()) = Some(device_id.to_string());
        tracing::info!(device = %device_id, session = %session.id, "session opened");
        Ok(entry)
    }

    /// Tear an entry down on all paths: stop the poll loop, drop the
    /// push feed, release the peer connection, then move focus to any
    /// remaining entry.
    pub async fn close(&self, device_id: &str) -> Result<(), MuxError> {
        let Some((_, entry)) = self.entries.remove(device_id) else {
            return Err(MuxError::UnknownEntry(device_id.to_string()));
        };
        entry.teardown(true).await;

        let mut focused = self.focused.write().unwrap_or_else(|e| e.into_inner());
        if focused.as_deref() == Some(device_id) {
            *focused = self.entries.iter().next().map(|e| e.key().clone());
        }
        tracing::info!(device = %device_id, "session closed");
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }

    /// Bookkeeping hook for the media plumbing: count a decoded frame
    /// against the entry it belongs to.
    pub fn record_frame(&self, device_id: &str, frame: Vec<u8>) -> bool {
        match self.entries.get(device_id) {
            Some(entry) => {
                entry.push_frame(frame);
                true
            }
            None => false,
        }
    }
}

async fn watch_events(
    entry: Weak<SessionEntry>,
    mut events: mpsc::UnboundedReceiver<MachineEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(entry) = entry.upgrade() else {
            return;
        };
        match event {
            MachineEvent::Connected => entry.set_status(EntryStatus::Connected),
            MachineEvent::Ended(reason) => {
                // The machine already released the peer connection;
                // drop the delivery paths with it. The entry stays in
                // the map so the UI can show the terminal notice until
                // the user closes it.
                entry
                    .binding
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .detach();
                entry.set_status(EntryStatus::Ended {
                    notice: terminal_notice(&reason),
                });
            }
        }
    }
}
