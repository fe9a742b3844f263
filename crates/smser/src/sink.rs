//! Outbound notification delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SinkError;

/// HTTP timeout for one Bot API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Destination for forwarded messages.
pub trait NotificationSink: Send + Sync {
    /// Deliver `text` to the chat identified by `target`.
    fn send(&self, target: &str, text: &str) -> Result<(), SinkError>;
}

/// Sink posting to the Telegram Bot API `sendMessage` method.
pub struct TelegramSink {
    client: reqwest::blocking::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl std::fmt::Debug for TelegramSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The endpoint embeds the bot token.
        f.debug_struct("TelegramSink").finish_non_exhaustive()
    }
}

impl TelegramSink {
    /// Create a sink for the bot with the given token.
    pub fn new(api_url: &str, token: &str) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint: send_message_url(api_url, token),
        })
    }
}

impl NotificationSink for TelegramSink {
    fn send(&self, target: &str, text: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMessage {
                chat_id: target,
                text,
            })
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        check_reply(status, &body)?;
        debug!("TelegramSink: delivered {} chars to chat {}", text.chars().count(), target);
        Ok(())
    }
}

fn send_message_url(api_url: &str, token: &str) -> String {
    format!("{}/bot{}/sendMessage", api_url.trim_end_matches('/'), token)
}

fn check_reply(status: u16, body: &str) -> Result<(), SinkError> {
    match serde_json::from_str::<ApiReply>(body) {
        Ok(reply) if reply.ok && (200..300).contains(&status) => Ok(()),
        Ok(reply) => Err(SinkError::Rejected {
            status,
            description: reply.description.unwrap_or_else(|| "no description".to_string()),
        }),
        Err(_) => Err(SinkError::Rejected {
            status,
            description: body.chars().take(200).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_url() {
        assert_eq!(
            send_message_url("https://api.telegram.org/", "123:abc"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn test_request_body() {
        let body = serde_json::to_value(SendMessage {
            chat_id: "-100",
            text: "hi",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"chat_id": "-100", "text": "hi"}));
    }

    #[test]
    fn test_check_reply() {
        assert!(check_reply(200, r#"{"ok":true,"result":{}}"#).is_ok());

        match check_reply(400, r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#) {
            Err(SinkError::Rejected { status, description }) => {
                assert_eq!(status, 400);
                assert_eq!(description, "Bad Request: chat not found");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }

        assert!(matches!(
            check_reply(502, "<html>Bad Gateway</html>"),
            Err(SinkError::Rejected { status: 502, .. })
        ));
    }

    #[test]
    fn test_debug_hides_token() {
        let sink = TelegramSink::new("http://127.0.0.1:1", "secret-token").unwrap();
        assert!(!format!("{:?}", sink).contains("secret-token"));
    }
}
