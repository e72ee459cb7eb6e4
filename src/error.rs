//! Custom error types for the supervisor.
//!
//! This module defines the primary error type, `EquipmentError`, together with the
//! narrower errors raised by the packet codec and the command protocol. Using the
//! `thiserror` crate, it provides a consistent way to report what can go wrong between
//! the Supervisor and its workers.
//!
//! ## Error Hierarchy
//!
//! - **`PacketError`**: A streaming datagram did not have the fixed wire layout. The worker
//!   drops such packets and keeps running; the error never leaves the worker task.
//! - **`ProtocolError`**: A JSON-encoded command or response could not be decoded, including
//!   commands whose `state` is not part of the vocabulary.
//! - **`EquipmentError`**: Everything the Supervisor's caller can observe: lifecycle misuse
//!   (starting a terminated worker), closed channels, I/O, and configuration problems.
//!
//! Expected runtime conditions (receive timeouts, empty buffers, ping timeouts) are not
//! errors and are handled where they occur.

use thiserror::Error;

/// Convenience alias for results using the supervisor error type.
pub type EquipmentResult<T> = std::result::Result<T, EquipmentError>;

/// A streaming packet that cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet length mismatch: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Payload must hold {expected} values, got {actual}")]
    PayloadSize { expected: usize, actual: usize },
}

/// Failure to decode a message exchanged between Supervisor and worker.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown command state '{0}'")]
    UnknownState(String),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum EquipmentError {
    #[error("Equipment name must not be empty")]
    EmptyName,

    #[error("Equipment '{0}' not found")]
    NotFound(String),

    #[error("Equipment '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Equipment '{0}' has terminated and cannot be restarted")]
    Terminated(String),

    #[error("Command channel closed for equipment '{0}'")]
    ChannelClosed(String),

    #[error("Command queue full for equipment '{0}' (worker not started)")]
    QueueFull(String),

    #[error("Worker for equipment '{0}' panicked: {1}")]
    WorkerPanicked(String, String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Sending '{command}' failed for {} equipment", errors.len())]
    Broadcast {
        command: &'static str,
        errors: Vec<EquipmentError>,
    },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<EquipmentError>),
}

impl EquipmentError {
    /// Collapses a list of shutdown failures into a single error.
    ///
    /// Returns `Ok(())` when the list is empty.
    pub fn from_shutdown_errors(errors: Vec<EquipmentError>) -> EquipmentResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EquipmentError::ShutdownFailed(errors))
        }
    }

    /// Human-readable summary including nested shutdown failures.
    pub fn summary(&self) -> String {
        match self {
            EquipmentError::ShutdownFailed(errors) => {
                format!("Shutdown failed: {}", join_summaries(errors))
            }
            EquipmentError::Broadcast { command, errors } => {
                format!("Sending '{command}' failed: {}", join_summaries(errors))
            }
            other => other.to_string(),
        }
    }
}

fn join_summaries(errors: &[EquipmentError]) -> String {
    errors
        .iter()
        .map(EquipmentError::summary)
        .collect::<Vec<_>>()
        .join("; ")
}
