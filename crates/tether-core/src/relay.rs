//! Signal delivery between the two parties of a session.
//!
//! Delivery is dual-path: a push feed of store inserts plus a poll loop
//! over the same rows. Both paths feed the same consumer, which drops
//! any signal id it has already seen: at-least-once delivery over an
//! idempotent-by-dedup consumer. The poll loop alone must be sufficient
//! for the protocol to make progress; the push feed is allowed to fail
//! silently.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tether_proto::{MsgType, NewSignal, Side, SignalPayload, SignalRecord};

use crate::error::RelayError;
use crate::store::{RelayStore, SignalStore};

/// Poll cadence of the fallback loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bound on the per-session dedup set. Signals are retained by the
/// store for about a minute, so ids older than the window can never be
/// re-delivered; FIFO eviction at this capacity keeps long-lived
/// sessions from growing the set without limit.
pub const PROCESSED_SET_CAPACITY: usize = 1024;

/// Session-scoped set of already-applied signal ids.
#[derive(Debug)]
pub struct ProcessedSet {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl ProcessedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records an id. Returns false if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ProcessedSet {
    fn default() -> Self {
        Self::new(PROCESSED_SET_CAPACITY)
    }
}

/// Appends one signal row. Write success is the only acknowledgement;
/// delivery to the peer is best-effort. Failures go back to the caller
/// untouched; retrying here could double-send an offer.
pub async fn publish(
    store: &dyn RelayStore,
    session_id: Uuid,
    from_side: Side,
    msg_type: MsgType,
    payload: SignalPayload,
) -> Result<SignalRecord, RelayError> {
    store
        .insert_signal(NewSignal {
            session_id,
            from_side,
            msg_type,
            payload,
        })
        .await
        .map_err(RelayError::StoreWrite)
}

/// Consumer of inbound signals. Implementations are responsible for
/// dedup and state guards; the binding only transports.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn deliver(&self, signal: SignalRecord);
}

/// One session's subscription: the push task and the poll task, bound
/// to a shared sink. Dropping (or detaching) the binding stops both.
pub struct RelayBinding {
    push_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

impl RelayBinding {
    /// Opens the push feed and starts the fallback poll loop. A push
    /// feed that fails to open degrades to poll-only with a warning;
    /// it is not an error the caller needs to handle.
    pub async fn bind(
        store: Arc<dyn RelayStore>,
        session_id: Uuid,
        sides: Vec<Side>,
        poll_interval: Duration,
        sink: Arc<dyn SignalSink>,
    ) -> Self {
        let push_task = match store.subscribe_signals(session_id).await {
            Ok(mut feed) => {
                let sink = Arc::clone(&sink);
                let sides = sides.clone();
                Some(tokio::spawn(async move {
                    while let Some(signal) = feed.recv().await {
                        if sides.contains(&signal.from_side) {
                            sink.deliver(signal).await;
                        }
                    }
                    tracing::debug!(session = %session_id, "push feed closed");
                }))
            }
            Err(err) => {
                tracing::warn!(
                    session = %session_id,
                    error = %err,
                    "push feed unavailable; continuing poll-only"
                );
                None
            }
        };

        let poll_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            // Cursor over the store's insertion sequence. Dedup still
            // happens in the sink; this only bounds the query.
            let mut after_seq = 0u64;
            loop {
                ticker.tick().await;
                match store
                    .signals_for_session(session_id, &sides, after_seq)
                    .await
                {
                    Ok(rows) => {
                        for signal in rows {
                            after_seq = after_seq.max(signal.seq);
                            sink.deliver(signal).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(session = %session_id, error = %err, "signal poll failed");
                    }
                }
            }
        });

        Self {
            push_task,
            poll_task: Some(poll_task),
        }
    }

    /// Stops the poll loop and unsubscribes the push feed. Safe to call
    /// more than once.
    pub fn detach(&mut self) {
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

impl Drop for RelayBinding {
    fn drop(&mut self) {
        self.detach();
    }
}
