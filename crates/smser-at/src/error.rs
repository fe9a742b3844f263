//! Error types for the AT protocol.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when talking to a modem.
///
/// All variants are recoverable at the call site that issued the command;
/// none of them stop the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AtError {
    /// An unsolicited line could not be parsed into an event.
    #[error("malformed event: '{0}'")]
    MalformedEvent(String),

    /// The command completed with the error token.
    #[error("error for command '{command}': {lines:?}")]
    Protocol {
        /// The command text that was sent.
        command: String,
        /// Intermediate lines received before the error token.
        lines: Vec<String>,
    },

    /// No terminal token arrived within the per-line timeout.
    #[error("command '{command}' timed out after {timeout:?} (received: {lines:?})")]
    CommandTimeout {
        /// The command text that was sent.
        command: String,
        /// The per-line wait that expired.
        timeout: Duration,
        /// Intermediate lines received before the timeout.
        lines: Vec<String>,
    },

    /// The engine was stopped or the channel failed.
    #[error("channel closed")]
    ChannelClosed,

    /// A typed event argument accessor failed.
    #[error("expected argument {index} as {expected} for event {event}")]
    ArgumentMismatch {
        /// Requested argument index.
        index: usize,
        /// Requested argument kind.
        expected: &'static str,
        /// The event, rendered for diagnostics.
        event: String,
    },
}

/// Result type alias for AT operations.
pub type AtResult<T> = Result<T, AtError>;
