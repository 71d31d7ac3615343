use anyhow::Result;
use async_trait::async_trait;

/// Client for the federated platform (the "rooms" side). Implementations
/// are authenticated network clients; the dispatcher only consumes this
/// narrow surface.
#[async_trait]
pub trait RoomClient: Send + Sync {
    async fn send_text(&self, room_id: &str, body: &str) -> Result<()>;

    /// Create a direct room and invite the single counterpart user.
    /// Returns the new room id.
    async fn create_direct_room(&self, name: &str, invite: &str) -> Result<String>;

    async fn set_room_name(&self, room_id: &str, name: &str) -> Result<()>;

    /// Mark an event as read on the room side. Best-effort.
    async fn ack_event(&self, room_id: &str, event_id: &str) -> Result<()>;
}

/// Client for the bot platform (the "chats" side).
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_text(&self, chat_id: i64, body: &str) -> Result<()>;

    /// Display name of the bot account itself.
    async fn self_identity(&self) -> Result<String>;
}

/// An inbound message from the bot platform. Any distinct chat is a
/// bridging candidate.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    /// Platform event id, unique per delivery stream. Used by the dedup gate.
    pub event_id: String,
    pub chat_id: i64,
    pub sender_name: String,
    pub text: String,
}

/// An inbound message from the federated platform. Only events sent by the
/// configured counterpart identity are relayed.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub body: String,
}
