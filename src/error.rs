use thiserror::Error;

/// Failure classes surfaced to the presentation layer.
///
/// Unrecognized or blank device lines are tolerated by the orchestrator and
/// only surface once they exhaust the empty-read bound, as `IoFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    PortUnavailable,
    IoFailure,
    PersistenceFailure,
    ConcurrentTestRejected,
    Configuration,
}

#[derive(Error, Debug)]
pub enum StationError {
    #[error("Serial port {port} unavailable after {attempts} attempts: {reason}")]
    PortUnavailable {
        port: String,
        attempts: u32,
        reason: String,
    },

    #[error("Serial link is already open")]
    LinkAlreadyOpen,

    #[error("Serial link is not open")]
    LinkNotOpen,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serial error: {0}")]
    SerialError(#[from] serialport::Error),

    #[error("Device did not respond after {empty_reads} consecutive empty reads")]
    DeviceUnresponsive { empty_reads: u32 },

    #[error("Failed to persist result: {0}")]
    PersistenceError(#[from] csv::Error),

    #[error("Result ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Another test is already running")]
    ConcurrentTestRejected,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    ConfigFormat(#[from] serde_json::Error),
}

impl StationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StationError::PortUnavailable { .. } => FailureKind::PortUnavailable,
            StationError::LinkAlreadyOpen
            | StationError::LinkNotOpen
            | StationError::IoError(_)
            | StationError::SerialError(_)
            | StationError::DeviceUnresponsive { .. } => FailureKind::IoFailure,
            StationError::PersistenceError(_) | StationError::LedgerUnavailable(_) => {
                FailureKind::PersistenceFailure
            }
            StationError::ConcurrentTestRejected => FailureKind::ConcurrentTestRejected,
            StationError::ConfigError(_) | StationError::ConfigFormat(_) => {
                FailureKind::Configuration
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StationError>;
