pub mod constants;
pub mod event;
pub mod frames;

// Re-export primary types for convenience.
pub use event::ChangeEvent;
pub use frames::{EventPayload, HubError, InboundFrame, OutboundFrame, ProtocolError};
