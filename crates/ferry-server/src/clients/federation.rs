use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ferry_relay::clients::{RoomClient, RoomEvent};
use ferry_relay::dispatcher::Dispatcher;

use crate::config::Config;

const SYNC_TIMEOUT_MS: u64 = 30_000;

/// Federated-platform HTTP client. The access token is refreshed in place
/// when the server reports it expired, so concurrent senders pick up the
/// new one without restarting.
pub struct FederationClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    device_id: String,
    token: RwLock<String>,
}

/// An error response from the federated server.
#[derive(Debug, Deserialize, thiserror::Error)]
#[error("{errcode}: {error}")]
pub struct ApiError {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
    #[serde(skip)]
    pub status: u16,
}

impl ApiError {
    pub fn auth_expired(&self) -> bool {
        self.status == 401 || self.errcode == "M_UNKNOWN_TOKEN"
    }
}

/// True when the underlying failure is an expired or revoked access token.
pub fn auth_expired(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>().is_some_and(ApiError::auth_expired)
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<TimelineEvent>,
}

#[derive(Debug, Deserialize)]
struct TimelineEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    content: serde_json::Value,
}

impl FederationClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        device_id: &str,
        token: &str,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            device_id: device_id.to_string(),
            token: RwLock::new(token.to_string()),
        })
    }

    pub fn has_token(&self) -> bool {
        !self.current_token().is_empty()
    }

    fn current_token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Password login. Stores the fresh access token and returns it so the
    /// caller can persist it.
    pub async fn login(&self) -> Result<String> {
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": self.username },
            "password": self.password,
            "device_id": self.device_id,
            "initial_device_display_name": "ferry bridge",
        });
        let resp = self
            .http
            .post(format!("{}/_matrix/client/v3/login", self.base_url))
            .json(&body)
            .send()
            .await?;
        let login: LoginResponse = Self::decode(resp).await.context("login")?;
        *self.token.write().unwrap_or_else(PoisonError::into_inner) =
            login.access_token.clone();
        info!(username = %self.username, "logged in to federated server");
        Ok(login.access_token)
    }

    /// One long-poll sync. Returns the next batch token and the text
    /// messages found in joined-room timelines.
    pub async fn sync(&self, since: Option<&str>) -> Result<(String, Vec<RoomEvent>)> {
        let mut req = self
            .http
            .get(format!("{}/_matrix/client/v3/sync", self.base_url))
            .bearer_auth(self.current_token())
            .query(&[("timeout", SYNC_TIMEOUT_MS.to_string())]);
        if let Some(since) = since {
            req = req.query(&[("since", since)]);
        }
        let sync: SyncResponse = Self::decode(req.send().await?).await.context("sync")?;

        let mut events = Vec::new();
        for (room_id, room) in sync.rooms.join {
            for ev in room.timeline.events {
                if ev.kind != "m.room.message" {
                    continue;
                }
                if ev.content.get("msgtype").and_then(|v| v.as_str()) != Some("m.text") {
                    continue;
                }
                let body = ev
                    .content
                    .get("body")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                events.push(RoomEvent {
                    event_id: ev.event_id,
                    room_id: room_id.clone(),
                    sender: ev.sender,
                    body: body.to_string(),
                });
            }
        }
        Ok((sync.next_batch, events))
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let mut err: ApiError = resp
            .json()
            .await
            .unwrap_or_else(|_| ApiError {
                errcode: "M_UNKNOWN".to_string(),
                error: status.to_string(),
                status: 0,
            });
        err.status = status.as_u16();
        Err(anyhow!(err))
    }

    fn room_url(&self, room_id: &str, rest: &str) -> String {
        format!(
            "{}/_matrix/client/v3/rooms/{}/{rest}",
            self.base_url,
            urlencoding::encode(room_id)
        )
    }
}

#[async_trait::async_trait]
impl RoomClient for FederationClient {
    async fn send_text(&self, room_id: &str, body: &str) -> Result<()> {
        let txn = Uuid::new_v4();
        let resp = self
            .http
            .put(self.room_url(room_id, &format!("send/m.room.message/{txn}")))
            .bearer_auth(self.current_token())
            .json(&json!({ "msgtype": "m.text", "body": body }))
            .send()
            .await?;
        Self::decode::<serde_json::Value>(resp).await.context("send message")?;
        Ok(())
    }

    async fn create_direct_room(&self, name: &str, invite: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            room_id: String,
        }
        let resp = self
            .http
            .post(format!("{}/_matrix/client/v3/createRoom", self.base_url))
            .bearer_auth(self.current_token())
            .json(&json!({
                "name": name,
                "invite": [invite],
                "is_direct": true,
                "preset": "private_chat",
            }))
            .send()
            .await?;
        let created: Created = Self::decode(resp).await.context("create room")?;
        Ok(created.room_id)
    }

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<()> {
        let resp = self
            .http
            .put(self.room_url(room_id, "state/m.room.name"))
            .bearer_auth(self.current_token())
            .json(&json!({ "name": name }))
            .send()
            .await?;
        Self::decode::<serde_json::Value>(resp).await.context("set room name")?;
        Ok(())
    }

    async fn ack_event(&self, room_id: &str, event_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.room_url(
                room_id,
                &format!("receipt/m.read/{}", urlencoding::encode(event_id)),
            ))
            .bearer_auth(self.current_token())
            .json(&json!({}))
            .send()
            .await?;
        Self::decode::<serde_json::Value>(resp).await.context("send receipt")?;
        Ok(())
    }
}

/// Sync until intake is cancelled, spawning one dispatch task per event.
/// An expired token triggers exactly one relogin attempt per sync; the
/// refreshed token is written back to the config file.
pub async fn run_sync_loop(
    client: Arc<FederationClient>,
    dispatcher: Dispatcher,
    tracker: TaskTracker,
    intake: CancellationToken,
    config: Arc<Mutex<Config>>,
) {
    let mut since: Option<String> = None;
    loop {
        let result = tokio::select! {
            _ = intake.cancelled() => {
                debug!("sync loop stopping");
                return;
            }
            r = client.sync(since.as_deref()) => r,
        };
        let (next, events) = match result {
            Ok(r) => r,
            Err(e) if auth_expired(&e) => {
                warn!("access token expired, logging in again");
                match client.login().await {
                    Ok(token) => persist_token(&config, token),
                    Err(e) => {
                        warn!(error = %e, "relogin failed, retrying");
                        tokio::select! {
                            _ = intake.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "sync failed, retrying");
                tokio::select! {
                    _ = intake.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        // The first sync is a state catch-up, not live traffic. Dispatching
        // it would replay history already relayed before a restart.
        let caught_up = since.is_some();
        since = Some(next);
        if !caught_up {
            continue;
        }

        for ev in events {
            let dispatcher = dispatcher.clone();
            tracker.spawn(async move {
                dispatcher.on_room_event(ev).await;
            });
        }
    }
}

fn persist_token(config: &Mutex<Config>, token: String) {
    let mut cfg = config.lock().unwrap_or_else(PoisonError::into_inner);
    cfg.content.federation.token = token;
    if let Err(e) = cfg.save() {
        warn!(error = %e, "failed to persist refreshed token");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_response_extracts_text_messages() {
        let raw = serde_json::json!({
            "next_batch": "s72595_4483",
            "rooms": { "join": {
                "!room:example.org": { "timeline": { "events": [
                    {
                        "type": "m.room.message",
                        "event_id": "$1",
                        "sender": "@friend:example.org",
                        "content": { "msgtype": "m.text", "body": "hello" }
                    },
                    {
                        "type": "m.room.message",
                        "event_id": "$2",
                        "sender": "@friend:example.org",
                        "content": { "msgtype": "m.image", "url": "mxc://x" }
                    },
                    { "type": "m.room.member", "event_id": "$3" }
                ] } }
            } }
        });
        let sync: SyncResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(sync.next_batch, "s72595_4483");

        let room = &sync.rooms.join["!room:example.org"];
        let texts: Vec<_> = room
            .timeline
            .events
            .iter()
            .filter(|e| {
                e.kind == "m.room.message"
                    && e.content.get("msgtype").and_then(|v| v.as_str()) == Some("m.text")
            })
            .collect();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].event_id, "$1");
    }

    #[test]
    fn auth_errors_are_recognized() {
        let err = anyhow!(ApiError {
            errcode: "M_UNKNOWN_TOKEN".to_string(),
            error: "token expired".to_string(),
            status: 401,
        });
        assert!(auth_expired(&err));

        let err = anyhow!(ApiError {
            errcode: "M_FORBIDDEN".to_string(),
            error: "nope".to_string(),
            status: 403,
        });
        assert!(!auth_expired(&err));
    }

    #[test]
    fn room_ids_are_escaped_in_request_paths() {
        let client =
            FederationClient::new("https://hs.example.org", "@bot:x", "pw", "DEV", "").unwrap();
        assert_eq!(
            client.room_url("!a:example.org", "state/m.room.name"),
            "https://hs.example.org/_matrix/client/v3/rooms/%21a%3Aexample.org/state/m.room.name"
        );
    }
}
