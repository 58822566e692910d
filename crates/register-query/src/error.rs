use crate::{ControllerId, RegisterAddress};
use can_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = QueryError> = core::result::Result<T, E>;

/// Failures of one register query. Nothing here is retried internally.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The address has neither a built-in nor an overridden resolution.
    #[error("unknown register: {0}")]
    UnknownRegister(RegisterAddress),
    #[error("invalid resolution for register {0}")]
    InvalidResolution(RegisterAddress),
    /// No matching reply arrived before the per-frame deadline.
    #[error("timed out waiting for controller {0}")]
    Timeout(ControllerId),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
