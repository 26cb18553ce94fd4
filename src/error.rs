// src/error.rs
//
// Structured error type for the bridge.
// One variant per failure domain so callers can pattern match on the
// specific failure mode.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Codec rejected a frame or payload
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Serial open/read/write failure
    #[error("serial I/O error: {0}")]
    Io(String),

    /// MQTT connect/publish failure
    #[error("broker error: {0}")]
    Broker(String),

    /// Configuration failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// No matching frame arrived within the deadline
    #[error("no matching reply from address {address} within {timeout:?}")]
    Timeout { address: u8, timeout: Duration },
}

impl BridgeError {
    pub fn io(details: impl Into<String>) -> Self {
        Self::Io(details.into())
    }

    pub fn broker(details: impl Into<String>) -> Self {
        Self::Broker(details.into())
    }

    pub fn config(details: impl Into<String>) -> Self {
        Self::Config(details.into())
    }
}
