//! Breath-alcohol test station: drives the breathalyzer over its serial link,
//! runs manual and automatic test cycles and records every result.

pub mod config;
pub mod devices;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod screening;
pub mod session;

pub use error::{FailureKind, Result, StationError};
pub use session::{EventSink, SessionController, SessionEvent};
