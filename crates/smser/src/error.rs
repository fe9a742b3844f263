//! Error types for the forwarder.

use std::path::PathBuf;

use smser_at::AtError;
use thiserror::Error;

/// Errors that can occur when loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the config file.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for the config schema.
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A device names a recipient missing from `chats`.
    #[error("unknown recipient '{recipient}' in device '{device}'")]
    UnknownRecipient {
        /// Device name.
        device: String,
        /// Recipient name.
        recipient: String,
    },

    /// A balance check has an hour window that no hour of the day falls into.
    #[error("invalid hour window {from:?}..{till:?} for '{code}' in device '{device}'")]
    InvalidHours {
        /// Device name.
        device: String,
        /// USSD code of the check.
        code: String,
        /// Configured start hour.
        from: Option<u32>,
        /// Configured end hour.
        till: Option<u32>,
    },

    /// A balance check has `period_days: 0`.
    #[error("period_days must be positive for '{code}' in device '{device}'")]
    ZeroPeriod {
        /// Device name.
        device: String,
        /// USSD code of the check.
        code: String,
    },

    /// Two devices share a name.
    #[error("duplicate device name '{0}'")]
    DuplicateDevice(String),
}

/// Errors that can occur when delivering a notification.
#[derive(Debug, Error)]
pub enum SinkError {
    /// HTTP transport failure.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered but refused the message.
    #[error("rejected with status {status}: {description}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Description returned by the API.
        description: String,
    },
}

/// Errors that can occur when running a balance check.
#[derive(Debug, Error)]
pub enum UssdError {
    /// The initiation command failed.
    #[error("USSD '{code}' on '{device}' failed: {source}")]
    Initiation {
        /// Device name.
        device: String,
        /// USSD code.
        code: String,
        /// Engine error.
        #[source]
        source: AtError,
    },
}

/// Errors that can occur while starting the forwarder.
#[derive(Debug, Error)]
pub enum StartupError {
    /// A device transport could not be opened.
    #[error("failed to open '{locator}' for device '{device}': {source}")]
    Open {
        /// Device name.
        device: String,
        /// Transport locator from the config.
        locator: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The notification sink could not be created.
    #[error("failed to create notification sink: {0}")]
    Sink(#[from] SinkError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
