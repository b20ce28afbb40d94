//! Signaling core: a self-healing websocket transport for call-signaling
//! events, per-call state machines driven by those events, and a weakly
//! held observer registry for call notifications.
//!
//! Pure Rust crate; the socket is behind a trait so the transport can be
//! driven by an in-memory fake in tests.

pub mod backoff;
pub mod call;
pub mod config;
pub mod errors;
pub mod events;
pub mod locus;
pub mod manager;
pub mod services;
pub mod socket;
pub mod transport;
pub mod wire;

pub use backoff::BackoffCounter;
pub use call::{Call, CallActions, CallPhase, CallStateMachine};
pub use config::{ConfigStore, TransportConfig};
pub use errors::SignalError;
pub use events::{CallObserver, DisconnectionType, MediaChangeType, ObserverRegistry, ObserverToken};
pub use locus::{CallId, CallInfo};
pub use manager::CallManager;
pub use services::{CallRouter, CredentialSource, ReachabilityService, Registrar, StaticCredentials};
pub use socket::WsSocketFactory;
pub use transport::{SignalingTransport, TransportServices, TransportSnapshot, TransportState};
