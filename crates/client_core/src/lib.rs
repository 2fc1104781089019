//! Conversation sync and resilience engine for a decentralized messaging
//! client.
//!
//! [`SyncEngine`] is the entry point. It keeps a local cache of
//! conversations and messages current through periodic discovery and one
//! global message stream, tracks per-conversation send readiness, and
//! routes every protocol failure to a recovery supervisor.

pub mod cache;
pub mod config;
pub mod discovery;
mod engine;
pub mod events;
pub mod facade;
pub mod fault;
pub mod persistence;
pub mod readiness;
pub mod recovery;
pub mod session;
pub mod simulated;
pub mod synchronizer;

pub use cache::LocalCache;
pub use config::{load_settings, EngineSettings};
pub use discovery::DiscoveryOutcome;
pub use engine::SyncEngine;
pub use events::{EngineEvent, ListenerHandle};
pub use facade::{MessageStream, ProtocolClient, ProtocolConnector, Signer};
pub use readiness::{ReadinessPhase, ReadinessState};
pub use recovery::{RecoveryOutcome, RecoveryPhase, RecoveryStatus};
pub use session::{Session, SessionState};
pub use synchronizer::HistoryPage;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
