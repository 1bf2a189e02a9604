//! Opta Daemon Protocol
//!
//! Shared types for communication between the Opta daemon and its clients.
//! These types are serialized as JSON over WebSocket and HTTP.

use uuid::Uuid;

pub mod client;
pub mod contract;
pub mod operations;
pub mod server;
pub mod types;

pub use client::{decode_client_frame, ClientFrame, MetaValue, Metadata, ProtocolViolation};
pub use contract::{ContractDescriptor, ContractGate, ContractMismatch, HealthReport};
pub use operations::{OperationErrorCode, OperationInfo, OperationRequest, OperationResponse};
pub use server::{DaemonEvent, Envelope, PROTOCOL_VERSION};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a prefixed ID such as `turn-3f2a…`.
pub fn new_prefixed_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
