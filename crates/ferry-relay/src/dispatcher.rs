use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::OwnedRwLockWriteGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferry_store::links::chat_key;
use ferry_store::{Keyspace, LinkTable, RoomLink, SeenEvents};

use crate::clients::{ChatClient, ChatEvent, RoomClient, RoomEvent};

const WELCOME_TEXT: &str =
    "Welcome! From this message on, your messages are forwarded to your contact.";

/// Resolves a bridge-pair record for each inbound event and performs the
/// cross-post. One instance serves both relay directions; per-event
/// concurrency comes from the caller spawning one task per event.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    links: LinkTable,
    seen: SeenEvents,
    chat: Arc<dyn ChatClient>,
    rooms: Arc<dyn RoomClient>,
    /// The one federated identity served by this bridge. Only its messages
    /// are relayed from the room side.
    counterpart: String,
    /// Cancelled by the shutdown controller in tiers 2-3; aborts outbound
    /// network calls. Already-applied store writes are never rolled back.
    net_cancel: CancellationToken,
    /// Fired on a record-invariant violation. Once cancelled, all further
    /// dispatch halts and the lifecycle controller shuts the process down.
    fatal: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        links: LinkTable,
        seen: SeenEvents,
        chat: Arc<dyn ChatClient>,
        rooms: Arc<dyn RoomClient>,
        counterpart: String,
        net_cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                links,
                seen,
                chat,
                rooms,
                counterpart,
                net_cancel,
                fatal: CancellationToken::new(),
            }),
        }
    }

    /// Token that fires when the store is found corrupt. The lifecycle
    /// controller treats it like a shutdown signal.
    pub fn fatal_token(&self) -> CancellationToken {
        self.inner.fatal.clone()
    }

    /// Handle one inbound event from the bot platform.
    pub async fn on_chat_event(&self, ev: ChatEvent) {
        if self.inner.fatal.is_cancelled() {
            return;
        }
        match self.inner.seen.seen(&ev.event_id) {
            Ok(true) => {
                debug!(event_id = %ev.event_id, "duplicate chat event dropped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "dedup check failed");
                self.notify_chat(ev.chat_id, &anyhow!(e)).await;
                return;
            }
        }

        if ev.text.is_empty() {
            debug!(chat_id = ev.chat_id, "unsupported chat event dropped");
            return;
        }

        if let Some(id) = self.chat_message(&ev).await {
            self.refresh_profile(&id, &ev.sender_name).await;
        }
    }

    /// Handle one inbound event from the federated platform.
    pub async fn on_room_event(&self, ev: RoomEvent) {
        if self.inner.fatal.is_cancelled() {
            return;
        }
        if ev.sender != self.inner.counterpart {
            debug!(sender = %ev.sender, "room event not from counterpart, dropped");
            return;
        }
        match self.inner.seen.seen(&ev.event_id) {
            Ok(true) => {
                debug!(event_id = %ev.event_id, "duplicate room event dropped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "dedup check failed");
                self.notify_room(&ev.room_id, &anyhow!(e)).await;
                return;
            }
        }
        if ev.body.is_empty() {
            debug!(event_id = %ev.event_id, "empty room message dropped");
            return;
        }

        self.room_text(&ev).await;
    }

    /// Resolve the chat's record under its write lock, then either forward
    /// the message or, for a chat seen for the first time, create the pairing.
    async fn chat_message(&self, ev: &ChatEvent) -> Option<Vec<u8>> {
        let locks = self.inner.links.locks().clone();

        // Write lock even though this is usually a plain lookup: two
        // concurrent first-message callers must not both observe "absent".
        let chat_lock = locks
            .handle(Keyspace::Chat, &chat_key(ev.chat_id))
            .write_owned()
            .await;

        let existing = match self.inner.links.index_by_chat(ev.chat_id) {
            Ok(v) => v,
            Err(e) => {
                drop(chat_lock);
                error!(error = %e, chat_id = ev.chat_id, "chat index lookup failed");
                self.notify_chat(ev.chat_id, &anyhow!(e)).await;
                return None;
            }
        };

        match existing {
            Some(id) => {
                // The record exists, so its identity fields are frozen and
                // the chat lock can go early.
                drop(chat_lock);
                self.chat_text(ev, id).await
            }
            None => self.chat_create(ev, chat_lock).await,
        }
    }

    /// First message from a new chat: create the record (and the room). The
    /// message itself is never forwarded. The freshly created room may not
    /// have propagated yet, and first messages are greetings anyway.
    async fn chat_create(
        &self,
        ev: &ChatEvent,
        chat_lock: OwnedRwLockWriteGuard<()>,
    ) -> Option<Vec<u8>> {
        let locks = self.inner.links.locks().clone();

        info!(chat_id = ev.chat_id, sender = %ev.sender_name, "new chat, creating room");

        if let Err(e) = self.guarded(self.inner.chat.send_text(ev.chat_id, WELCOME_TEXT)).await {
            warn!(error = %e, "failed to send welcome message");
        }

        let room_id = match self
            .guarded(
                self.inner
                    .rooms
                    .create_direct_room(&ev.sender_name, &self.inner.counterpart),
            )
            .await
        {
            Ok(room_id) => room_id,
            Err(e) => {
                error!(error = %e, "failed to create room");
                self.notify_chat(ev.chat_id, &e).await;
                return None;
            }
        };

        // Lock order: Chat (held) -> Link (inside allocate_id) -> Room. All
        // three are held across all three bucket writes and released only
        // after the last write lands or any fails.
        let (id, id_lock) = match self.inner.links.allocate_id().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to allocate identifier");
                self.notify_chat(ev.chat_id, &anyhow!(e)).await;
                return None;
            }
        };
        let room_lock = locks
            .handle(Keyspace::Room, room_id.as_bytes())
            .write_owned()
            .await;

        let link = RoomLink {
            chat_id: ev.chat_id,
            room_id: room_id.clone(),
            display_name: ev.sender_name.clone(),
            avatar_ref: String::new(),
            last_profile_sync: None,
        };
        let written = self
            .inner
            .links
            .put_link(&id, &link)
            .and_then(|_| self.inner.links.put_chat_index(ev.chat_id, &id))
            .and_then(|_| self.inner.links.put_room_index(&room_id, &id));

        drop(room_lock);
        drop(id_lock);
        drop(chat_lock);

        if let Err(e) = written {
            error!(error = %e, chat_id = ev.chat_id, "failed to persist new record");
            self.notify_chat(ev.chat_id, &anyhow!(e)).await;
            return None;
        }

        info!(chat_id = ev.chat_id, room_id = %room_id, "record created");
        self.mark_seen(&ev.event_id);
        Some(id)
    }

    /// Message for an already-linked chat: forward to the room.
    async fn chat_text(&self, ev: &ChatEvent, id: Vec<u8>) -> Option<Vec<u8>> {
        let link = self
            .read_link_or_notify(&id, NotifyTarget::Chat(ev.chat_id))
            .await?;
        if !self.validate(&id, &link, NotifyTarget::Chat(ev.chat_id)).await {
            return None;
        }

        info!(sender = %ev.sender_name, "relaying chat message to room");
        if let Err(e) = self.guarded(self.inner.rooms.send_text(&link.room_id, &ev.text)).await {
            error!(error = %e, "failed to relay to room");
            self.notify_chat(ev.chat_id, &e).await;
            return None;
        }

        self.mark_seen(&ev.event_id);
        Some(id)
    }

    /// Room message from the counterpart: forward to the linked chat.
    async fn room_text(&self, ev: &RoomEvent) {
        let locks = self.inner.links.locks().clone();

        let index = {
            let _room_lock = locks
                .handle(Keyspace::Room, ev.room_id.as_bytes())
                .read_owned()
                .await;
            self.inner.links.index_by_room(&ev.room_id)
        };
        let id = match index {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(room_id = %ev.room_id, "room not linked, dropped");
                return;
            }
            Err(e) => {
                error!(error = %e, room_id = %ev.room_id, "room index lookup failed");
                self.notify_room(&ev.room_id, &anyhow!(e)).await;
                return;
            }
        };

        let Some(link) = self.read_link_or_notify(&id, NotifyTarget::Room(ev.room_id.clone())).await
        else {
            return;
        };
        if !self
            .validate(&id, &link, NotifyTarget::Room(ev.room_id.clone()))
            .await
        {
            return;
        }

        info!(recipient = %link.display_name, "relaying room message to chat");
        if let Err(e) = self.guarded(self.inner.chat.send_text(link.chat_id, &ev.body)).await {
            error!(error = %e, "failed to relay to chat");
            self.notify_room(&ev.room_id, &e).await;
            return;
        }

        self.mark_seen(&ev.event_id);

        if let Err(e) = self
            .guarded(self.inner.rooms.ack_event(&ev.room_id, &ev.event_id))
            .await
        {
            warn!(error = %e, "failed to send read receipt");
        }
    }

    /// Read an existing record under its read lock. Identity fields are
    /// immutable once complete, so a read lock is enough for forwarding.
    async fn read_link(&self, id: &[u8]) -> Result<Option<RoomLink>> {
        let _lock = self
            .inner
            .links
            .locks()
            .handle(Keyspace::Link, id)
            .read_owned()
            .await;
        Ok(self.inner.links.link_by_id(id)?)
    }

    /// Read a record a secondary index points at. A store I/O error gets one
    /// notice to the sender; a missing record means the index dangles, which
    /// is the same class of corruption as an invalid record.
    async fn read_link_or_notify(&self, id: &[u8], target: NotifyTarget) -> Option<RoomLink> {
        match self.read_link(id).await {
            Ok(Some(link)) => Some(link),
            Ok(None) => {
                error!(id = %hex::encode_upper(id), "index points at missing record");
                self.fatal_corrupt(id, target).await;
                None
            }
            Err(e) => {
                error!(error = %e, id = %hex::encode_upper(id), "record lookup failed");
                match target {
                    NotifyTarget::Chat(chat_id) => self.notify_chat(chat_id, &e).await,
                    NotifyTarget::Room(room_id) => self.notify_room(&room_id, &e).await,
                }
                None
            }
        }
    }

    /// Enforce the completeness invariant. A record with chat_id == 0 or an
    /// empty room id means the store is corrupt: one best-effort notice,
    /// then all further dispatch halts.
    async fn validate(&self, id: &[u8], link: &RoomLink, target: NotifyTarget) -> bool {
        if link.is_complete() {
            return true;
        }
        error!(
            id = %hex::encode_upper(id),
            chat_id = link.chat_id,
            room_id = %link.room_id,
            "record invalid, store corrupted"
        );
        self.fatal_corrupt(id, target).await;
        false
    }

    async fn fatal_corrupt(&self, id: &[u8], target: NotifyTarget) {
        let err = anyhow!("bridge record {} is corrupt, stopping", hex::encode_upper(id));
        match target {
            NotifyTarget::Chat(chat_id) => self.notify_chat(chat_id, &err).await,
            NotifyTarget::Room(room_id) => self.notify_room(&room_id, &err).await,
        }
        self.inner.fatal.cancel();
    }

    fn mark_seen(&self, event_id: &str) {
        // A failed mark costs at most one duplicate relay on redelivery.
        if let Err(e) = self.inner.seen.mark_seen(event_id) {
            error!(error = %e, event_id, "failed to mark event processed");
        }
    }

    /// Keep the room name and stored profile in sync with the chat's display
    /// name. Not urgent, so errors only warn.
    async fn refresh_profile(&self, id: &[u8], sender_name: &str) {
        let Ok(Some(link)) = self.read_link(id).await else {
            return;
        };
        let name_changed = link.display_name != sender_name;
        if !name_changed && !link.profile_refresh_due() {
            return;
        }
        if name_changed {
            if let Err(e) = self
                .guarded(self.inner.rooms.set_room_name(&link.room_id, sender_name))
                .await
            {
                warn!(error = %e, "failed to update room name");
                return;
            }
        }
        if let Err(e) = self.inner.links.set_profile(id, sender_name, None).await {
            warn!(error = %e, "failed to update stored profile");
        }
    }

    /// One best-effort error notice to the chat side. Never retried.
    async fn notify_chat(&self, chat_id: i64, err: &anyhow::Error) {
        let body = format!(
            "{err}\nSomething went wrong on the room side. \
             Please try reaching your contact another way."
        );
        if let Err(e) = self.guarded(self.inner.chat.send_text(chat_id, &body)).await {
            error!(error = %e, "failed to deliver error notice to chat");
        }
    }

    /// One best-effort error notice to the room side. Never retried.
    async fn notify_room(&self, room_id: &str, err: &anyhow::Error) {
        let body = format!("{err}\nSomething went wrong, please check the bridge logs.");
        if let Err(e) = self.guarded(self.inner.rooms.send_text(room_id, &body)).await {
            error!(error = %e, "failed to deliver error notice to room");
        }
    }

    /// Race an outbound network call against the shutdown cancellation
    /// signal (tiers 2-3). Biased so an already-cancelled token always wins
    /// over a ready send future.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.inner.net_cancel.cancelled() => {
                Err(anyhow!("outbound call aborted by shutdown"))
            }
            result = fut => result,
        }
    }
}

enum NotifyTarget {
    Chat(i64),
    Room(String),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use ferry_store::{KeyLocks, Store};

    use super::*;

    #[derive(Default)]
    struct MockRooms {
        sent: Mutex<Vec<(String, String)>>,
        created: Mutex<Vec<String>>,
        renamed: Mutex<Vec<(String, String)>>,
        acked: Mutex<Vec<(String, String)>>,
        next_room: AtomicU64,
        fail_send: AtomicBool,
    }

    #[async_trait]
    impl RoomClient for MockRooms {
        async fn send_text(&self, room_id: &str, body: &str) -> Result<()> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(anyhow!("homeserver unreachable"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((room_id.to_string(), body.to_string()));
            Ok(())
        }

        async fn create_direct_room(&self, name: &str, _invite: &str) -> Result<String> {
            let n = self.next_room.fetch_add(1, Ordering::SeqCst);
            self.created.lock().unwrap().push(name.to_string());
            Ok(format!("!room{n}:example.org"))
        }

        async fn set_room_name(&self, room_id: &str, name: &str) -> Result<()> {
            self.renamed
                .lock()
                .unwrap()
                .push((room_id.to_string(), name.to_string()));
            Ok(())
        }

        async fn ack_event(&self, room_id: &str, event_id: &str) -> Result<()> {
            self.acked
                .lock()
                .unwrap()
                .push((room_id.to_string(), event_id.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockChat {
        sent: Mutex<Vec<(i64, String)>>,
        fail_send: AtomicBool,
    }

    #[async_trait]
    impl ChatClient for MockChat {
        async fn send_text(&self, chat_id: i64, body: &str) -> Result<()> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(anyhow!("bot api unreachable"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id, body.to_string()));
            Ok(())
        }

        async fn self_identity(&self) -> Result<String> {
            Ok("Ferry Bot".to_string())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        dispatcher: Dispatcher,
        rooms: Arc<MockRooms>,
        chat: Arc<MockChat>,
        links: LinkTable,
        store: Arc<Store>,
        locks: Arc<KeyLocks>,
    }

    const COUNTERPART: &str = "@friend:example.org";

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("ferry.db")).unwrap());
        let locks = Arc::new(KeyLocks::new());
        let links = LinkTable::open(store.clone(), locks.clone()).unwrap();
        let rooms = Arc::new(MockRooms::default());
        let chat = Arc::new(MockChat::default());
        let dispatcher = Dispatcher::new(
            LinkTable::open(store.clone(), locks.clone()).unwrap(),
            SeenEvents::new(store.clone()),
            chat.clone(),
            rooms.clone(),
            COUNTERPART.to_string(),
            CancellationToken::new(),
        );
        Fixture {
            _dir: dir,
            dispatcher,
            rooms,
            chat,
            links,
            store,
            locks,
        }
    }

    fn chat_event(event_id: &str, chat_id: i64, text: &str) -> ChatEvent {
        ChatEvent {
            event_id: event_id.to_string(),
            chat_id,
            sender_name: "Mia".to_string(),
            text: text.to_string(),
        }
    }

    fn room_event(event_id: &str, room_id: &str, sender: &str, body: &str) -> RoomEvent {
        RoomEvent {
            event_id: event_id.to_string(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn first_message_creates_record_without_forwarding() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hello"))
            .await;

        let id = f.links.index_by_chat(555).unwrap().expect("record created");
        let link = f.links.link_by_id(&id).unwrap().unwrap();
        assert_eq!(link.chat_id, 555);
        assert!(link.room_id.starts_with("!room"));
        assert!(link.is_complete());
        assert_eq!(f.links.index_by_room(&link.room_id).unwrap(), Some(id));

        // One room created, trigger message never forwarded.
        assert_eq!(f.rooms.created.lock().unwrap().len(), 1);
        assert!(f.rooms.sent.lock().unwrap().is_empty());
        // The chat got the welcome message.
        let chat_sent = f.chat.sent.lock().unwrap();
        assert_eq!(chat_sent.len(), 1);
        assert_eq!(chat_sent[0].0, 555);
    }

    #[tokio::test]
    async fn second_message_is_forwarded_to_room() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;
        f.dispatcher
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;

        let room_id = f
            .links
            .link_by_id(&f.links.index_by_chat(555).unwrap().unwrap())
            .unwrap()
            .unwrap()
            .room_id;
        let sent = f.rooms.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[(room_id, "hello".to_string())]);
    }

    #[tokio::test]
    async fn duplicate_event_id_yields_one_send() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;
        f.dispatcher
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;
        // Redelivery of the same event id.
        f.dispatcher
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;

        assert_eq!(f.rooms.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_messages_create_one_record() {
        let f = fixture();
        let d1 = f.dispatcher.clone();
        let d2 = f.dispatcher.clone();
        tokio::join!(
            d1.on_chat_event(chat_event("update-1", 777, "hello")),
            d2.on_chat_event(chat_event("update-2", 777, "hello again")),
        );

        assert_eq!(f.rooms.created.lock().unwrap().len(), 1);
        let id = f.links.index_by_chat(777).unwrap().unwrap();
        let link = f.links.link_by_id(&id).unwrap().unwrap();
        assert_eq!(f.links.index_by_room(&link.room_id).unwrap(), Some(id));

        // The loser of the race sees the fresh record and forwards normally;
        // only the creating message is swallowed.
        assert_eq!(f.rooms.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn room_message_from_counterpart_is_forwarded() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;
        let room_id = f
            .links
            .link_by_id(&f.links.index_by_chat(555).unwrap().unwrap())
            .unwrap()
            .unwrap()
            .room_id;

        f.dispatcher
            .on_room_event(room_event("$ev1", &room_id, COUNTERPART, "hi there"))
            .await;

        let sent = f.chat.sent.lock().unwrap();
        assert_eq!(sent.last().unwrap(), &(555, "hi there".to_string()));
        // Read receipt went out after the relay.
        assert_eq!(
            f.rooms.acked.lock().unwrap().as_slice(),
            &[(room_id, "$ev1".to_string())]
        );
    }

    #[tokio::test]
    async fn room_message_from_stranger_is_dropped() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;
        let room_id = f
            .links
            .link_by_id(&f.links.index_by_chat(555).unwrap().unwrap())
            .unwrap()
            .unwrap()
            .room_id;
        let before = f.chat.sent.lock().unwrap().len();

        f.dispatcher
            .on_room_event(room_event("$ev1", &room_id, "@stranger:example.org", "hi"))
            .await;

        assert_eq!(f.chat.sent.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn unknown_room_is_ignored() {
        let f = fixture();
        f.dispatcher
            .on_room_event(room_event("$ev1", "!nowhere:example.org", COUNTERPART, "hi"))
            .await;
        assert!(f.chat.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_failure_notifies_sender_and_skips_mark() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;

        f.rooms.fail_send.store(true, Ordering::SeqCst);
        f.dispatcher
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;

        // The chat got an error notice instead of a relay.
        let notice = f.chat.sent.lock().unwrap().last().unwrap().clone();
        assert_eq!(notice.0, 555);
        assert!(notice.1.contains("homeserver unreachable"));

        // The event was not marked seen, so redelivery succeeds later.
        f.rooms.fail_send.store(false, Ordering::SeqCst);
        f.dispatcher
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;
        assert_eq!(f.rooms.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_record_is_fatal_and_halts_dispatch() {
        let f = fixture();
        // Plant a corrupt record: the completeness invariant is violated.
        let id = b"\x01".to_vec();
        f.links
            .put_link(
                &id,
                &RoomLink {
                    chat_id: 555,
                    room_id: String::new(),
                    display_name: String::new(),
                    avatar_ref: String::new(),
                    last_profile_sync: None,
                },
            )
            .unwrap();
        f.links.put_chat_index(555, &id).unwrap();

        let fatal = f.dispatcher.fatal_token();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hello"))
            .await;

        assert!(fatal.is_cancelled());
        // One best-effort notice went to the sender.
        assert_eq!(f.chat.sent.lock().unwrap().len(), 1);
        assert!(f.rooms.sent.lock().unwrap().is_empty());

        // All further dispatch halts, even for healthy chats.
        f.dispatcher
            .on_chat_event(chat_event("update-2", 556, "hi"))
            .await;
        assert!(f.rooms.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn net_cancel_aborts_outbound_sends() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;

        // Same store, but with the shutdown network token already cancelled
        // (tier 2): the relay must abort before reaching the room client and
        // must not mark the event seen.
        let net_cancel = CancellationToken::new();
        net_cancel.cancel();
        let cancelled = Dispatcher::new(
            LinkTable::open(f.store.clone(), f.locks.clone()).unwrap(),
            SeenEvents::new(f.store.clone()),
            f.chat.clone(),
            f.rooms.clone(),
            COUNTERPART.to_string(),
            net_cancel,
        );
        cancelled
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;
        assert!(f.rooms.sent.lock().unwrap().is_empty());

        // Redelivery through a live dispatcher still goes out: the aborted
        // attempt had no side effects.
        f.dispatcher
            .on_chat_event(chat_event("update-2", 555, "hello"))
            .await;
        assert_eq!(f.rooms.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sender_rename_updates_room_name_and_profile() {
        let f = fixture();
        f.dispatcher
            .on_chat_event(chat_event("update-1", 555, "hi"))
            .await;
        let id = f.links.index_by_chat(555).unwrap().unwrap();

        let mut ev = chat_event("update-2", 555, "hello");
        ev.sender_name = "Mia Renamed".to_string();
        f.dispatcher.on_chat_event(ev).await;

        let link = f.links.link_by_id(&id).unwrap().unwrap();
        assert_eq!(link.display_name, "Mia Renamed");
        let renamed = f.rooms.renamed.lock().unwrap();
        assert_eq!(renamed.last().unwrap().1, "Mia Renamed");
    }
}
