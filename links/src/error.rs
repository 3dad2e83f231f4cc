// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for link and chain operations.
//!
//! Every fallible operation in this crate returns [`Result`]. Errors that cross a
//! processor boundary (control replies, network control acks) are flattened to
//! the numeric status codes in [`status`] and rebuilt on the receiving side with
//! [`Error::from_status`].

use crate::link_id::ProcId;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Numeric status codes exchanged in control replies.
pub mod status {
    pub const SOK: i32 = 0;
    pub const EFAIL: i32 = -1;
    pub const ETIMEOUT: i32 = -2;
    pub const EALLOC: i32 = -3;
    pub const EBUSY: i32 = -4;
    pub const EINVALID_PARAMS: i32 = -5;
    pub const EAGAIN: i32 = -6;
    pub const EUNSUPPORTED_CMD: i32 = -7;
}

/// Errors that can occur while building, running or controlling links.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A generic failure with a description.
    #[error("Other error: {0}")]
    Other(String),

    /// The link id does not decode, or names a link that is not registered
    /// on the processor that received the request.
    #[error("Invalid link id {0:#010x}")]
    InvalidLinkId(u32),

    /// Create or control parameters failed validation.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// A bounded wait expired.
    #[error("Timeout")]
    Timeout,

    /// Non-blocking read found nothing to return.
    #[error("Not ready")]
    NotReady,

    /// Non-blocking write found no free slot.
    #[error("Queue full")]
    QueueFull,

    /// A pool or heap ran out of space.
    #[error("Allocation failed: {0}")]
    Alloc(String),

    /// The link does not implement this control command.
    #[error("Unsupported command {0:#x}")]
    UnsupportedCmd(u32),

    /// The operation is not allowed in the link's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The chain topology is malformed.
    #[error("Invalid chain topology: {0}")]
    Graph(String),

    /// A status code received from a peer that maps to no known variant.
    #[error("Unknown status: {0}")]
    Unknown(i32),

    /// A cross-core notify could not be delivered.
    #[error("Transport: {0}")]
    Transport(#[from] TransportError),

    /// Control parameters or a configuration file failed to (de)serialize.
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a configuration file or writing a dump file failed.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the cross-core notify transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The receiving processor's notify queue stayed full.
    #[error("notify queue of {0} is busy")]
    Busy(ProcId),

    /// No dispatcher is attached for the processor.
    #[error("{0} is not attached to the notify bus")]
    Unavailable(ProcId),

    /// The bus has been shut down.
    #[error("notify bus disconnected")]
    Disconnected,
}

impl Error {
    /// Flattens the error to the status code carried in control replies.
    pub fn status(&self) -> i32 {
        match self {
            Error::Timeout => status::ETIMEOUT,
            Error::Alloc(_) => status::EALLOC,
            Error::Transport(TransportError::Busy(_)) => status::EBUSY,
            Error::InvalidParams(_) | Error::Json(_) => status::EINVALID_PARAMS,
            Error::NotReady | Error::QueueFull => status::EAGAIN,
            Error::UnsupportedCmd(_) => status::EUNSUPPORTED_CMD,
            Error::Unknown(code) => *code,
            _ => status::EFAIL,
        }
    }

    /// Converts a status code received from a peer back to a [`Result`].
    ///
    /// # Arguments
    ///
    /// * `status` - Status code as returned by [`Error::status`]
    ///
    /// # Returns
    ///
    /// - `Ok(())` if `status == SOK`
    /// - `Err(Error::...)` for any other code
    pub fn from_status(status: i32) -> Result<()> {
        match status {
            status::SOK => Ok(()),
            status::EFAIL => Err(Error::Other("remote operation failed".to_string())),
            status::ETIMEOUT => Err(Error::Timeout),
            status::EALLOC => Err(Error::Alloc("remote allocation failed".to_string())),
            status::EBUSY => Err(Error::Other("remote is busy".to_string())),
            status::EINVALID_PARAMS => {
                Err(Error::InvalidParams("rejected by remote".to_string()))
            }
            status::EAGAIN => Err(Error::NotReady),
            status::EUNSUPPORTED_CMD => Err(Error::UnsupportedCmd(0)),
            other => Err(Error::Unknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_survive_the_wire() {
        for err in [
            Error::Timeout,
            Error::NotReady,
            Error::UnsupportedCmd(0x42),
            Error::InvalidParams("x".into()),
        ] {
            let rebuilt = Error::from_status(err.status()).unwrap_err();
            assert_eq!(rebuilt.status(), err.status());
        }
        assert!(Error::from_status(status::SOK).is_ok());
        assert!(matches!(Error::from_status(-99), Err(Error::Unknown(-99))));
    }
}
