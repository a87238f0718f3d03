use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::message::RegularMessage;
use crate::config::WeComConfig;
use crate::error::{HubError, HubResult};

/// Provider error codes meaning "the access token is no longer valid".
const STALE_TOKEN_CODES: [i64; 3] = [40014, 42001, 41001];
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Outbound edge of the hub: everything that pushes messages to users goes
/// through this trait so handlers stay testable.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, message: RegularMessage) -> HubResult<()>;

    async fn send_text(&self, agent_id: u64, recipients: &str, text: &str) -> HubResult<()> {
        self.send(RegularMessage::text(agent_id, recipients, text))
            .await
    }

    async fn send_card(
        &self,
        agent_id: u64,
        recipients: &str,
        title: &str,
        description: &str,
        url: &str,
        button_text: &str,
    ) -> HubResult<()> {
        self.send(RegularMessage::text_card(
            agent_id,
            recipients,
            title,
            description,
            url,
            button_text,
        ))
        .await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    invaliduser: Option<String>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// HTTP client for the provider's message API. Access tokens are cached per
/// application until shortly before they expire.
pub struct WeComClient {
    http: reqwest::Client,
    api_base: String,
    corp_id: String,
    secrets: HashMap<u64, String>,
    tokens: Mutex<HashMap<u64, CachedToken>>,
}

impl WeComClient {
    pub fn new(config: &WeComConfig) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        let secrets = config
            .apps
            .iter()
            .map(|app| (app.agent_id, app.corp_secret.clone()))
            .collect();
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            corp_id: config.corp_id.clone(),
            secrets,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn access_token(&self, agent_id: u64) -> HubResult<String> {
        // Held across the fetch so concurrent senders share one refresh.
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&agent_id) {
            if Instant::now() + TOKEN_REFRESH_MARGIN < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        let secret = self.secrets.get(&agent_id).ok_or_else(|| {
            HubError::Config(format!("no corp_secret configured for agent {}", agent_id))
        })?;
        debug!("[WeComClient] Refreshing access token for agent {}", agent_id);
        let response: TokenResponse = self
            .http
            .get(format!("{}/cgi-bin/gettoken", self.api_base))
            .query(&[("corpid", self.corp_id.as_str()), ("corpsecret", secret.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let token = match (response.errcode, response.access_token) {
            (0, Some(token)) => token,
            (code, _) => {
                return Err(HubError::Upstream(format!(
                    "gettoken failed for agent {}: {} {}",
                    agent_id, code, response.errmsg
                )))
            }
        };
        tokens.insert(
            agent_id,
            CachedToken {
                value: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(response.expires_in),
            },
        );
        Ok(token)
    }

    async fn invalidate(&self, agent_id: u64) {
        self.tokens.lock().await.remove(&agent_id);
    }

    async fn post_message(&self, message: &RegularMessage) -> HubResult<SendResponse> {
        let token = self.access_token(message.agent_id).await?;
        let response = self
            .http
            .post(format!("{}/cgi-bin/message/send", self.api_base))
            .query(&[("access_token", token.as_str())])
            .json(message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl OutboundSender for WeComClient {
    async fn send(&self, message: RegularMessage) -> HubResult<()> {
        let mut response = self.post_message(&message).await?;
        if STALE_TOKEN_CODES.contains(&response.errcode) {
            info!(
                "[WeComClient] Token rejected for agent {}, refreshing",
                message.agent_id
            );
            self.invalidate(message.agent_id).await;
            response = self.post_message(&message).await?;
        }

        if response.errcode != 0 {
            return Err(HubError::Outbound(format!(
                "{} {}",
                response.errcode, response.errmsg
            )));
        }
        if let Some(invalid) = response.invaliduser.filter(|s| !s.is_empty()) {
            warn!("[WeComClient] Recipients rejected by provider: {}", invalid);
        }
        Ok(())
    }
}

/// Sender that keeps messages in memory instead of calling the provider.
/// Backs the `--dry-run` gateway mode and the test suites.
#[derive(Default)]
pub struct MemorySender {
    sent: StdMutex<Vec<RegularMessage>>,
    failures_left: StdMutex<usize>,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with an outbound error.
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut left) = self.failures_left.lock() {
            *left = count;
        }
    }

    pub fn sent(&self) -> Vec<RegularMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutboundSender for MemorySender {
    async fn send(&self, message: RegularMessage) -> HubResult<()> {
        {
            let mut left = self
                .failures_left
                .lock()
                .map_err(|_| HubError::Outbound("sender state poisoned".to_string()))?;
            if *left > 0 {
                *left -= 1;
                return Err(HubError::Outbound("simulated delivery failure".to_string()));
            }
        }
        info!(
            "[MemorySender] agent={} to={} {}",
            message.agent_id,
            message.to_user,
            message.body()
        );
        self.sent
            .lock()
            .map_err(|_| HubError::Outbound("sender state poisoned".to_string()))?
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sender_records_and_fails_on_demand() {
        let sender = MemorySender::new();
        sender.fail_next(1);
        assert!(sender.send_text(1, "u", "first").await.is_err());
        sender.send_text(1, "u", "second").await.unwrap();
        sender
            .send_card(2, "a|b", "title", "desc", "https://x", "more")
            .await
            .unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].body(), "second");
        assert_eq!(sent[1].msg_type, "textcard");
        assert_eq!(sent[1].to_user, "a|b");
    }
}
