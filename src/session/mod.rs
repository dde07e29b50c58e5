//! Session continuity: maps a stateless client history onto the backend's
//! stateful, parent-chained conversation.

pub mod fingerprint;
pub mod manager;

pub use fingerprint::{fingerprint, AssistantFeatures};
pub use manager::{SessionHandle, SessionManager};
