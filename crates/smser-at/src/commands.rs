//! Commands that can be sent to the modem.
//!
//! [`AtCommand`] builds the text of the commands this system issues;
//! [`Invocation`] carries one command together with its terminal tokens,
//! per-line timeout and optional reply subscription.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::subscription::Subscription;

/// Default token that completes a command successfully.
pub const DEFAULT_SUCCESS_TOKEN: &str = "OK";

/// Default token that completes a command with an error.
pub const DEFAULT_ERROR_TOKEN: &str = "ERROR";

/// Default wait for each response line.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Data coding scheme requested for USSD strings (GSM 7-bit default alphabet).
pub const USSD_DCS: u8 = 15;

/// Event name of a new-message indication.
pub const EVENT_MESSAGE_INDICATION: &str = "+CMTI";

/// Event name of a USSD reply.
pub const EVENT_USSD_REPLY: &str = "+CUSD";

/// AT commands used by the forwarder.
#[derive(Debug, Clone, PartialEq)]
pub enum AtCommand {
    /// Enable or disable command echo (`ATE`).
    Echo {
        /// Whether the modem should echo commands.
        enabled: bool,
    },

    /// Select PDU (0) or text (1) message format.
    MessageFormat {
        /// Whether to use text mode.
        text_mode: bool,
    },

    /// Store incoming messages and announce each with `+CMTI`.
    StoreAndIndicate,

    /// Select the preferred message storage area.
    SelectStorage {
        /// Storage area reported by the modem, e.g. `SM` or `ME`.
        area: String,
    },

    /// Read the message stored at the given index.
    ReadMessage {
        /// Index within the selected storage.
        index: u32,
    },

    /// Start a USSD session with the given service code.
    UssdRequest {
        /// Service code, e.g. `*100#`.
        code: String,
    },

    /// Cancel the current USSD session.
    UssdCancel,
}

impl AtCommand {
    /// Get the command string without the terminator.
    pub fn to_command_string(&self) -> String {
        match self {
            AtCommand::Echo { enabled } => format!("ATE{}", u8::from(*enabled)),
            AtCommand::MessageFormat { text_mode } => format!("AT+CMGF={}", u8::from(*text_mode)),
            AtCommand::StoreAndIndicate => "AT+CNMI=2,1,0,0,0".to_string(),
            AtCommand::SelectStorage { area } => format!("AT+CPMS=\"{}\"", area),
            AtCommand::ReadMessage { index } => format!("AT+CMGR={}", index),
            AtCommand::UssdRequest { code } => format!("AT+CUSD=1,\"{}\",{}", code, USSD_DCS),
            AtCommand::UssdCancel => "AT+CUSD=2".to_string(),
        }
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command_string())
    }
}

/// One command execution request.
#[derive(Clone)]
pub struct Invocation {
    /// Command text, without terminator.
    pub text: String,
    /// Line that completes the command successfully.
    pub success_token: String,
    /// Line that completes the command with an error.
    pub error_token: String,
    /// Wait allowed for each response line. `None` uses the engine default.
    pub timeout: Option<Duration>,
    /// Subscription registered before the command is written.
    pub subscription: Option<Arc<dyn Subscription>>,
}

impl Invocation {
    /// Create an invocation with default tokens and timeout.
    pub fn new(text: impl Into<String>) -> Self {
        Invocation {
            text: text.into(),
            success_token: DEFAULT_SUCCESS_TOKEN.to_string(),
            error_token: DEFAULT_ERROR_TOKEN.to_string(),
            timeout: None,
            subscription: None,
        }
    }

    /// Override the per-line timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the terminal tokens.
    pub fn with_tokens(mut self, success: impl Into<String>, error: impl Into<String>) -> Self {
        self.success_token = success.into();
        self.error_token = error.into();
        self
    }

    /// Register a subscription together with the command.
    pub fn subscribe(mut self, subscription: Arc<dyn Subscription>) -> Self {
        self.subscription = Some(subscription);
        self
    }
}

impl From<AtCommand> for Invocation {
    fn from(cmd: AtCommand) -> Self {
        Invocation::new(cmd.to_command_string())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("text", &self.text)
            .field("success_token", &self.success_token)
            .field("error_token", &self.error_token)
            .field("timeout", &self.timeout)
            .field("subscription", &self.subscription.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{Delivery, OneShot};

    #[test]
    fn test_encode_select_storage() {
        let cmd = AtCommand::SelectStorage { area: "ME".to_string() };
        assert_eq!(cmd.to_command_string(), "AT+CPMS=\"ME\"");
    }

    #[test]
    fn test_encode_read_message() {
        let cmd = AtCommand::ReadMessage { index: 3 };
        assert_eq!(cmd.to_command_string(), "AT+CMGR=3");
    }

    #[test]
    fn test_encode_ussd() {
        let cmd = AtCommand::UssdRequest { code: "*100#".to_string() };
        assert_eq!(cmd.to_command_string(), "AT+CUSD=1,\"*100#\",15");
        assert_eq!(AtCommand::UssdCancel.to_command_string(), "AT+CUSD=2");
    }

    #[test]
    fn test_encode_setup_commands() {
        assert_eq!(AtCommand::Echo { enabled: true }.to_command_string(), "ATE1");
        assert_eq!(AtCommand::MessageFormat { text_mode: false }.to_command_string(), "AT+CMGF=0");
        assert_eq!(AtCommand::StoreAndIndicate.to_string(), "AT+CNMI=2,1,0,0,0");
    }

    #[test]
    fn test_invocation_defaults() {
        let inv = Invocation::from(AtCommand::ReadMessage { index: 1 });
        assert_eq!(inv.text, "AT+CMGR=1");
        assert_eq!(inv.success_token, "OK");
        assert_eq!(inv.error_token, "ERROR");
        assert!(inv.timeout.is_none());
        assert!(inv.subscription.is_none());
    }

    #[test]
    fn test_invocation_builders() {
        let sub: Arc<dyn Subscription> = Arc::new(OneShot::new("+CUSD", |_: &crate::Event| Delivery::Consumed));
        let inv = Invocation::new("AT+CUSD=1")
            .with_timeout(Duration::from_millis(250))
            .with_tokens("DONE", "FAIL")
            .subscribe(sub);
        assert_eq!(inv.timeout, Some(Duration::from_millis(250)));
        assert_eq!(inv.success_token, "DONE");
        assert_eq!(inv.error_token, "FAIL");
        assert!(inv.subscription.is_some());
    }
}
