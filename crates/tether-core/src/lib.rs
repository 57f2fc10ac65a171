//! Session lifecycle and signaling-relay engine for tether.
//!
//! The relay is a store: controllers, devices, and any number of relay
//! front-ends coordinate exclusively through the adapter traits in
//! [`store`]. On top of that sit the signal relay (dual push/poll
//! delivery with reader-side dedup), the session registry (creation,
//! atomic claim, expiry), the per-session negotiation state machine,
//! the controller-side multiplexer, and the cleanup sweeper.

pub mod error;
pub mod multiplexer;
pub mod negotiation;
pub mod registry;
pub mod relay;
pub mod store;
pub mod sweeper;

pub use error::{MuxError, NegotiationError, PeerError, RegistryError, RelayError, StoreError};
pub use multiplexer::{EntryStatus, MuxConfig, SessionEntry, SessionMultiplexer, ViewState};
pub use negotiation::{
    EndReason, MachineEvent, NegotiationMachine, NegotiationState, PeerConnector,
    RemoteCandidate, Role,
};
pub use registry::{IssuedCredentials, RegistryConfig, SessionRegistry};
pub use relay::{ProcessedSet, RelayBinding, SignalSink};
pub use store::{DeviceStore, MemoryStore, RelayStore, SessionStore, SignalFeed, SignalStore};
pub use sweeper::{SweepSummary, Sweeper, SweeperConfig};
