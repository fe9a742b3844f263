//! YAML configuration.
//!
//! ```yaml
//! telegram_bot_token: "123:abc"
//! chats:
//!   alice: "1111"
//! devices:
//!   - name: modem1
//!     device: /dev/ttyUSB0
//!     recipients: [alice]
//!     balance_checks:
//!       - code: "*100#"
//!         period_days: 1
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use smser_at::AtCommand;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Config file used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Serial line speed used when a device does not set one.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Per-line command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5;

/// First hour of the day a balance check may run.
pub const DEFAULT_HOUR_FROM: u32 = 10;

/// Hour of the day from which balance checks stop running.
pub const DEFAULT_HOUR_TILL: u32 = 23;

/// Seconds in one `period_days` unit.
pub const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Commands sent to every modem after opening it, unless overridden.
///
/// Echo stays on: when reading a message, the echoed command and the PDU are
/// the two response lines, since the `+CMGR:` header is routed as an event.
pub fn default_init_commands() -> Vec<String> {
    [
        AtCommand::Echo { enabled: true },
        AtCommand::MessageFormat { text_mode: false },
        AtCommand::StoreAndIndicate,
    ]
    .iter()
    .map(AtCommand::to_command_string)
    .collect()
}

fn default_api_url() -> String {
    DEFAULT_TELEGRAM_API_URL.to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_hour_from() -> Option<u32> {
    Some(DEFAULT_HOUR_FROM)
}

fn default_hour_till() -> Option<u32> {
    Some(DEFAULT_HOUR_TILL)
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Bot token for the Telegram Bot API.
    pub telegram_bot_token: String,

    /// Bot API base URL.
    #[serde(default = "default_api_url")]
    pub telegram_api_url: String,

    /// Per-line command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Recipient name to chat id.
    #[serde(deserialize_with = "deserialize_chats")]
    pub chats: BTreeMap<String, String>,

    /// Modems to serve.
    pub devices: Vec<DeviceConfig>,
}

/// One modem.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name, used in logs and messages.
    pub name: String,

    /// Serial device path or `socket://host:port`.
    pub device: String,

    /// Serial line speed.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Recipient names, keys of [`Config::chats`].
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Commands sent after opening the modem.
    #[serde(default = "default_init_commands")]
    pub init_commands: Vec<String>,

    /// Periodic USSD balance checks.
    #[serde(default)]
    pub balance_checks: Vec<BalanceCheck>,
}

/// A periodic USSD balance check.
///
/// `hour_from` is inclusive and `hour_till` exclusive; an explicit `null`
/// removes that bound.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BalanceCheck {
    /// USSD code, e.g. `*100#`.
    pub code: String,

    /// Days between checks.
    pub period_days: u32,

    /// First hour a check may run.
    #[serde(default = "default_hour_from")]
    pub hour_from: Option<u32>,

    /// Hour from which checks stop running.
    #[serde(default = "default_hour_till")]
    pub hour_till: Option<u32>,
}

impl BalanceCheck {
    /// Minimum time between two runs, in seconds.
    pub fn period_seconds(&self) -> u64 {
        u64::from(self.period_days) * SECONDS_PER_DAY
    }
}

impl Config {
    /// Per-line command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Chat ids for a device's recipients, in configured order.
    pub fn chat_targets(&self, device: &DeviceConfig) -> Result<Vec<String>, ConfigError> {
        device
            .recipients
            .iter()
            .map(|recipient| {
                self.chats
                    .get(recipient)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownRecipient {
                        device: device.name.clone(),
                        recipient: recipient.clone(),
                    })
            })
            .collect()
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
            self.chat_targets(device)?;

            for check in &device.balance_checks {
                if check.period_days == 0 {
                    return Err(ConfigError::ZeroPeriod {
                        device: device.name.clone(),
                        code: check.code.clone(),
                    });
                }
                // A window that no hour 0..=23 can fall into is rejected.
                let from_ok = check.hour_from.map_or(true, |h| h <= 23);
                let till_ok = check.hour_till.map_or(true, |h| (1..=24).contains(&h));
                let ordered = match (check.hour_from, check.hour_till) {
                    (Some(from), Some(till)) => from < till,
                    _ => true,
                };
                if !from_ok || !till_ok || !ordered {
                    return Err(ConfigError::InvalidHours {
                        device: device.name.clone(),
                        code: check.code.clone(),
                        from: check.hour_from,
                        till: check.hour_till,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a config document.
pub fn load_config_from_str(text: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_from_str(&text)
}

/// Chat ids may be written as strings or bare numbers.
fn deserialize_chats<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChatId {
        Number(i64),
        Text(String),
    }

    let raw = BTreeMap::<String, ChatId>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, id)| {
            let id = match id {
                ChatId::Number(n) => n.to_string(),
                ChatId::Text(s) => s,
            };
            (name, id)
        })
        .collect())
}
