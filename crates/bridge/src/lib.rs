//! Bridge between the hub connection and the local history store.
//!
//! [`Bridge`] resolves the connection target from the persisted settings,
//! opens the connection and records every state change before handling the
//! next one. [`Diagnostics`] is the read-mostly view used by tooling.

pub mod bridge;
pub mod diagnostics;
pub mod error;

pub use bridge::{Bridge, BridgeEvent};
pub use diagnostics::{Diagnostics, DiagnosticsReport, export_json};
pub use error::BridgeError;
