//! PDU decoding error types.

use thiserror::Error;

/// Errors that can occur when decoding an SMS PDU.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PduError {
    /// The PDU text is not valid hexadecimal.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// The PDU ended before a field was complete.
    #[error("PDU truncated at offset {offset}: {needed} more bytes needed")]
    Truncated {
        /// Byte offset where the field starts.
        offset: usize,
        /// Bytes required by the field.
        needed: usize,
    },

    /// The message type is not SMS-DELIVER.
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(u8),

    /// The originating address could not be decoded.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The service centre timestamp is not a valid date.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// UCS-2 user data has an odd length or unpaired surrogates.
    #[error("invalid UCS-2 data")]
    InvalidUcs2,
}

/// Result type alias for PDU operations.
pub type PduResult<T> = Result<T, PduError>;
