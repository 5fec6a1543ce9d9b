//! Wire protocol for groupcast client-hub communication.
//!
//! Defines the JSON envelope, message type identifiers, request/response
//! payloads and the hub addressing scheme shared by the client and hub
//! crates.

pub mod constants;
pub mod endpoint;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use endpoint::HubAddress;
pub use envelope::{Message, WireError};
pub use messages::{EventNotification, InvokeRequest, InvokeResult};
