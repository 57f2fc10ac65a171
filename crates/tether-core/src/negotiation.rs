//! Per-session negotiation state machine.
//!
//! One instance per (local side, session). The machine is the consumer
//! end of the dual push/poll delivery: every inbound signal funnels
//! through [`NegotiationMachine::handle_signal`], which serializes
//! events behind one async mutex, drops duplicates by id, and rejects
//! out-of-state messages instead of trusting relay ordering.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use tether_proto::{MsgType, SessionStatus, Side, SignalPayload, SignalRecord};

use crate::error::{NegotiationError, PeerError};
use crate::relay::{self, ProcessedSet, SignalSink};
use crate::store::{RelayStore, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AwaitingOffer,
    AnswerPending,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer_sent",
            NegotiationState::AwaitingOffer => "awaiting_offer",
            NegotiationState::AnswerPending => "answer_pending",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }
}

/// Which end of the pairing this machine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Device,
}

impl Role {
    pub fn side(&self) -> Side {
        match self {
            Role::Controller => Side::Controller,
            Role::Device => Side::Device,
        }
    }

    fn initial_state(&self) -> NegotiationState {
        match self {
            Role::Controller => NegotiationState::Idle,
            Role::Device => NegotiationState::AwaitingOffer,
        }
    }
}

/// Why a session reached its terminal state. Drives the single
/// user-visible notification; raw store errors never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Displaced by another controller's claim.
    Kicked {
        reason: String,
        new_controller_type: Option<String>,
    },
    /// Graceful peer-initiated teardown, with the reason the peer (or
    /// the sweeper) stated.
    Bye { reason: String },
    /// Local capability failure (capture, peer connection, publish).
    Failed(String),
    /// Local close.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    Connected,
    Ended(EndReason),
}

/// An ICE candidate as routed through the relay; opaque to everything
/// but the peer-connection capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

/// Seam to the out-of-scope peer-connection stack. Descriptions and
/// candidates are opaque blobs; acquiring local capabilities (capture,
/// input) happens behind these calls, which is why they are async and
/// awaited before the resulting signal is published.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Produce the local offer description.
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, PeerError>;

    /// Apply the remote answer to a previously created offer.
    async fn apply_answer(&self, sdp: &str) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: &RemoteCandidate) -> Result<(), PeerError>;

    /// Release the underlying transport. Must be safe to call twice.
    async fn close(&self);
}

struct Inner {
    state: NegotiationState,
    processed: ProcessedSet,
    /// Candidates that arrived before the remote description; flushed
    /// in arrival order the moment it is applied.
    pending_candidates: Vec<RemoteCandidate>,
    remote_ready: bool,
}

pub struct NegotiationMachine {
    session_id: Uuid,
    role: Role,
    peer: Arc<dyn PeerConnector>,
    store: Arc<dyn RelayStore>,
    events: mpsc::UnboundedSender<MachineEvent>,
    inner: Mutex<Inner>,
}

impl NegotiationMachine {
    pub fn new(
        session_id: Uuid,
        role: Role,
        peer: Arc<dyn PeerConnector>,
        store: Arc<dyn RelayStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MachineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let machine = Arc::new(Self {
            session_id,
            role,
            peer,
            store,
            events,
            inner: Mutex::new(Inner {
                state: role.initial_state(),
                processed: ProcessedSet::default(),
                pending_candidates: Vec::new(),
                remote_ready: false,
            }),
        });
        (machine, events_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    /// Construct and publish a local offer. Valid from `Idle` (first
    /// negotiation) and from `Connected` (restart after the transport
    /// reported failure). The capability call is awaited before the
    /// signal is published.
    pub async fn start_offer(&self) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            NegotiationState::Idle | NegotiationState::Connected => {}
            NegotiationState::Closed => return Err(NegotiationError::Closed),
            other => {
                return Err(NegotiationError::InvalidState {
                    state: other.as_str(),
                })
            }
        }

        let sdp = match self.peer.create_offer().await {
            Ok(sdp) => sdp,
            Err(err) => {
                self.abort(&mut inner, err.to_string()).await;
                return Err(NegotiationError::Peer(err));
            }
        };
        relay::publish(
            self.store.as_ref(),
            self.session_id,
            self.role.side(),
            MsgType::Offer,
            SignalPayload::sdp(sdp),
        )
        .await?;
        inner.remote_ready = false;
        inner.state = NegotiationState::OfferSent;
        tracing::debug!(session = %self.session_id, "offer published");
        Ok(())
    }

    /// Publish a graceful teardown and release the peer connection.
    pub async fn close(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state == NegotiationState::Closed {
            return;
        }
        if let Err(err) = relay::publish(
            self.store.as_ref(),
            self.session_id,
            self.role.side(),
            MsgType::Bye,
            SignalPayload::teardown(reason),
        )
        .await
        {
            tracing::warn!(session = %self.session_id, error = %err, "bye publish failed");
        }
        self.finish(&mut inner, EndReason::Closed).await;
    }

    /// Apply one inbound signal. Guard violations are recovered locally
    /// by discarding the message; they are never surfaced to the user.
    pub async fn handle_signal(&self, signal: SignalRecord) {
        if signal.session_id != self.session_id {
            tracing::trace!(
                session = %self.session_id,
                stray = %signal.session_id,
                "ignoring signal for session this machine does not own"
            );
            return;
        }
        if signal.from_side == self.role.side() {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.state == NegotiationState::Closed {
            return;
        }
        if !inner.processed.insert(signal.id) {
            tracing::debug!(session = %self.session_id, id = %signal.id, "duplicate signal dropped");
            return;
        }

        match signal.msg_type {
            MsgType::Kick => {
                let (reason, new_controller_type) = match signal.payload {
                    SignalPayload::Teardown {
                        reason,
                        new_controller_type,
                    } => (reason, new_controller_type),
                    _ => ("displaced".to_string(), None),
                };
                self.finish(
                    &mut inner,
                    EndReason::Kicked {
                        reason,
                        new_controller_type,
                    },
                )
                .await;
            }
            MsgType::Bye => {
                let reason = match signal.payload {
                    SignalPayload::Teardown { reason, .. } => reason,
                    _ => "disconnected".to_string(),
                };
                self.finish(&mut inner, EndReason::Bye { reason }).await;
            }
            MsgType::Answer => self.on_answer(&mut inner, signal).await,
            MsgType::Offer => self.on_offer(&mut inner, signal).await,
            MsgType::Ice => self.on_candidate(&mut inner, signal).await,
        }
    }

    /// An answer is only meaningful while our own offer is in flight;
    /// anything else is a late or duplicate delivery.
    async fn on_answer(&self, inner: &mut Inner, signal: SignalRecord) {
        if inner.state != NegotiationState::OfferSent {
            tracing::debug!(
                session = %self.session_id,
                state = inner.state.as_str(),
                "discarding answer outside offer_sent"
            );
            return;
        }
        let SignalPayload::Sdp { sdp } = signal.payload else {
            tracing::warn!(session = %self.session_id, "answer without sdp payload");
            return;
        };
        inner.state = NegotiationState::AnswerPending;
        match self.peer.apply_answer(&sdp).await {
            Ok(()) => {
                self.remote_description_applied(inner).await;
                inner.state = NegotiationState::Connected;
                self.mark_session_active().await;
                let _ = self.events.send(MachineEvent::Connected);
            }
            Err(err) => self.abort(inner, err.to_string()).await,
        }
    }

    /// Sharer path, and renegotiation for a connected machine of either
    /// role: apply the remote offer, answer it, and converge.
    async fn on_offer(&self, inner: &mut Inner, signal: SignalRecord) {
        let renegotiation = inner.state == NegotiationState::Connected;
        if inner.state != NegotiationState::AwaitingOffer && !renegotiation {
            tracing::debug!(
                session = %self.session_id,
                state = inner.state.as_str(),
                "discarding offer outside awaiting_offer/connected"
            );
            return;
        }
        let SignalPayload::Sdp { sdp } = signal.payload else {
            tracing::warn!(session = %self.session_id, "offer without sdp payload");
            return;
        };
        inner.state = NegotiationState::AnswerPending;
        let answer = match self.peer.accept_offer(&sdp).await {
            Ok(answer) => answer,
            Err(err) => {
                self.abort(inner, err.to_string()).await;
                return;
            }
        };
        self.remote_description_applied(inner).await;
        if let Err(err) = relay::publish(
            self.store.as_ref(),
            self.session_id,
            self.role.side(),
            MsgType::Answer,
            SignalPayload::sdp(answer),
        )
        .await
        {
            self.abort(inner, err.to_string()).await;
            return;
        }
        inner.state = NegotiationState::Connected;
        self.mark_session_active().await;
        let _ = self.events.send(MachineEvent::Connected);
        if renegotiation {
            tracing::info!(session = %self.session_id, "renegotiation answered");
        }
    }

    async fn on_candidate(&self, inner: &mut Inner, signal: SignalRecord) {
        let SignalPayload::Candidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } = signal.payload
        else {
            tracing::warn!(session = %self.session_id, "ice signal without candidate payload");
            return;
        };
        let candidate = RemoteCandidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        };
        if inner.remote_ready {
            if let Err(err) = self.peer.add_remote_candidate(&candidate).await {
                tracing::warn!(session = %self.session_id, error = %err, "could not add candidate");
            }
        } else {
            inner.pending_candidates.push(candidate);
        }
    }

    /// The remote description just landed: flush buffered candidates in
    /// arrival order, then apply new ones immediately.
    async fn remote_description_applied(&self, inner: &mut Inner) {
        inner.remote_ready = true;
        for candidate in inner.pending_candidates.drain(..) {
            if let Err(err) = self.peer.add_remote_candidate(&candidate).await {
                tracing::warn!(
                    session = %self.session_id,
                    error = %err,
                    "could not add buffered candidate"
                );
            }
        }
    }

    async fn mark_session_active(&self) {
        match self.store.session(self.session_id).await {
            Ok(Some(mut session)) if session.status == SessionStatus::Pending => {
                session.status = SessionStatus::Active;
                if let Err(err) = self.store.update_session(&session).await {
                    tracing::warn!(session = %self.session_id, error = %err, "activate failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(session = %self.session_id, error = %err, "session lookup failed");
            }
        }
    }

    /// Capability failure: abort the session, tell the peer, release
    /// the connection.
    async fn abort(&self, inner: &mut Inner, message: String) {
        tracing::warn!(session = %self.session_id, error = %message, "negotiation aborted");
        if let Err(err) = relay::publish(
            self.store.as_ref(),
            self.session_id,
            self.role.side(),
            MsgType::Bye,
            SignalPayload::teardown("negotiation_failed"),
        )
        .await
        {
            tracing::warn!(session = %self.session_id, error = %err, "bye publish failed");
        }
        self.finish(inner, EndReason::Failed(message)).await;
    }

    /// Terminal transition. Emits exactly one `Ended` event; callers
    /// guard against re-entry via the `Closed` check.
    async fn finish(&self, inner: &mut Inner, reason: EndReason) {
        self.peer.close().await;
        inner.state = NegotiationState::Closed;
        inner.pending_candidates.clear();
        let _ = self.events.send(MachineEvent::Ended(reason));
    }
}

#[async_trait]
impl SignalSink for NegotiationMachine {
    async fn deliver(&self, signal: SignalRecord) {
        self.handle_signal(signal).await;
    }
}
