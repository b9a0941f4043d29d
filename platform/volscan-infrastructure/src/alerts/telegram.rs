use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use volscan_domain::errors::PipelineError;
use volscan_domain::events::anomaly_event::AnomalyEvent;
use volscan_domain::repositories::alert_sink::AlertSink;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Posts each anomaly as a chat message through the Bot API.
pub struct TelegramAlertSink {
    client: Client,
    base_url: String,
    token: String,
    chat_id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramAlertSink {
    pub fn new(token: String, chat_id: i64, request_timeout: Duration) -> Result<Self, String> {
        if token.trim().is_empty() {
            return Err("telegram bot token is empty".to_string());
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| format!("failed to build http client: {err}"))?;
        Ok(Self {
            client,
            base_url: TELEGRAM_API_BASE.to_string(),
            token,
            chat_id,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, self.token)
    }
}

impl std::fmt::Debug for TelegramAlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAlertSink")
            .field("base_url", &self.base_url)
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    async fn notify(&self, event: &AnomalyEvent) -> Result<(), PipelineError> {
        let text = event.to_message();
        let body = SendMessage {
            chat_id: self.chat_id,
            text: &text,
        };
        // The request URL contains the bot token; keep it out of errors.
        let response = self
            .client
            .post(self.send_message_url())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                PipelineError::Notify(format!("telegram request failed: {}", err.without_url()))
            })?;

        let status = response.status();
        let payload: Option<BotResponse> = response.json().await.ok();
        match payload {
            Some(BotResponse { ok: true, .. }) if status.is_success() => {
                metrics::counter!("volscan.infra.telegram.messages_total", "result" => "ok")
                    .increment(1);
                Ok(())
            }
            other => {
                metrics::counter!("volscan.infra.telegram.messages_total", "result" => "err")
                    .increment(1);
                let description = other
                    .and_then(|p| p.description)
                    .unwrap_or_else(|| "no description".to_string());
                Err(PipelineError::Notify(format!(
                    "telegram sendMessage failed with status {status}: {description}"
                )))
            }
        }
    }
}
