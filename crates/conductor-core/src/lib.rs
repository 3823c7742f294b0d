//! Core types, error definitions, and the message bus for Conductor.
//!
//! This crate provides the pieces shared by every Conductor crate: the unified
//! error type, the bus message envelope, and the publish/subscribe hub that
//! decouples the orchestrator from its agents.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`BusMessage`]: Immutable envelope exchanged on the bus.
//! - [`MessageType`]: Closed set of message kinds.
//! - [`MessageBus`]: Ordered pub/sub hub with bounded history.

/// Publish/subscribe message bus.
pub mod bus;
/// Error types.
pub mod error;
/// Tracing subscriber setup.
pub mod logging;
/// Bus message envelope.
pub mod message;

pub use bus::{
    BusConfig, Handler, HistoryFilter, MessageBus, Subscription, WeakMessageBus,
    BROADCAST_SUBSCRIBER,
};
pub use error::{ConductorError, ConductorResult};
pub use logging::LogConfig;
pub use message::{into_payload, BusMessage, MessageType, Payload, Recipient, BROADCAST};
