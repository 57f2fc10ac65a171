use thiserror::Error;

/// Failures surfaced by a store adapter. Backend-specific error text is
/// flattened to a string so the traits stay object-safe across backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("change feed unavailable: {0}")]
    FeedUnavailable(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("device is offline")]
    DeviceOffline,
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Publish failures are surfaced to the caller and never retried inside
/// the relay; a silent retry could double-send an offer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signal publish failed: {0}")]
    StoreWrite(#[source] StoreError),
}

/// Failure of the local peer-connection capability (capture could not
/// start, transport refused the description, and so on).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PeerError(pub String);

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("operation not valid in state {state}")]
    InvalidState { state: &'static str },
    #[error("session is closed")]
    Closed,
    #[error("peer capability failed: {0}")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("maximum of {0} concurrent sessions reached")]
    MaxSessions(usize),
    #[error("no session open for device {0}")]
    UnknownEntry(String),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}
