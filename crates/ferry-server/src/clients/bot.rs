use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use ferry_relay::clients::{ChatClient, ChatEvent};
use ferry_relay::dispatcher::Dispatcher;

/// Bot-platform HTTP client. Long polling pulls updates; each text message
/// becomes one [`ChatEvent`].
pub struct BotClient {
    http: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl User {
    /// Best available human-readable name for the sender.
    pub fn display_name(&self) -> String {
        let mut name = self.first_name.clone();
        if let Some(last) = self.last_name.as_deref().filter(|s| !s.is_empty()) {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(last);
        }
        if !name.is_empty() {
            return name;
        }
        if let Some(username) = self.username.as_deref().filter(|s| !s.is_empty()) {
            return username.to_string();
        }
        self.id.to_string()
    }
}

impl BotClient {
    pub fn new(token: &str) -> Result<Self> {
        // The long-poll timeout rides on top of this, so keep it generous.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            http,
            base: format!("https://api.telegram.org/bot{token}"),
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let resp: ApiResponse = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(&params)
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            return Err(anyhow!(
                "{method} failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        Ok(resp.result)
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": timeout_secs,
                    "allowed_updates": ["message"],
                }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait::async_trait]
impl ChatClient for BotClient {
    async fn send_text(&self, chat_id: i64, body: &str) -> Result<()> {
        self.call("sendMessage", json!({ "chat_id": chat_id, "text": body }))
            .await?;
        Ok(())
    }

    async fn self_identity(&self) -> Result<String> {
        let me: User = serde_json::from_value(self.call("getMe", json!({})).await?)?;
        Ok(me.display_name())
    }
}

/// Pull updates until intake is cancelled, spawning one dispatch task per
/// message. The offset only advances past an update once it is handed to
/// the dispatcher, so a crash redelivers rather than drops.
pub async fn run_poll_loop(
    client: Arc<BotClient>,
    dispatcher: Dispatcher,
    tracker: TaskTracker,
    intake: CancellationToken,
    poll_timeout_secs: u64,
) {
    let mut offset = 0i64;
    loop {
        let updates = tokio::select! {
            _ = intake.cancelled() => {
                debug!("poll loop stopping");
                return;
            }
            r = client.get_updates(offset, poll_timeout_secs) => r,
        };
        let updates = match updates {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "getUpdates failed, retrying");
                tokio::select! {
                    _ = intake.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let ev = ChatEvent {
                // Namespaced so bot ids can never collide with room ids in
                // the shared dedup bucket.
                event_id: format!("update-{}", update.update_id),
                chat_id: message.chat.id,
                sender_name: message
                    .from
                    .as_ref()
                    .map(User::display_name)
                    .unwrap_or_default(),
                text: message.text.unwrap_or_default(),
            };
            let dispatcher = dispatcher.clone();
            tracker.spawn(async move {
                dispatcher.on_chat_event(ev).await;
            });
        }
    }
}
