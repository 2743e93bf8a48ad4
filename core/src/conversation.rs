/// Conversation store: the active 1:1 thread, the global message list and
/// optimistic sends reconciled against the realtime echo.
use crate::error::ChatError;
use crate::gateway::MessageGateway;
use crate::inbox::derive_inbox;
use crate::messenger_types::{ChatEvent, DeliveryState, InboxEntry, Message, MessageId, SendOutcome};
use crate::session::SessionState;
use crate::subscription::{ChannelKey, SubscriptionManager};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

type SinkFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What reconciliation did with an incoming durable message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Same durable id already present
    Duplicate,
    /// Took the place of the provisional entry at this index
    Replaced(usize),
    /// Appended as the new last entry
    Appended,
}

/// Message list of the active conversation
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    peer_id: Option<String>,
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn is_open_with(&self, peer_id: &str) -> bool {
        self.peer_id.as_deref() == Some(peer_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Switch to `peer_id` with an empty list
    pub fn open(&mut self, peer_id: &str) {
        if !self.is_open_with(peer_id) {
            self.messages.clear();
        }
        self.peer_id = Some(peer_id.to_string());
    }

    /// Install fetched history for `peer_id`.
    ///
    /// Provisional entries added while the fetch was in flight survive unless
    /// the history already carries their durable counterpart. A durable entry
    /// confirms at most one provisional entry, and only one created no later
    /// than itself.
    pub fn replace(&mut self, peer_id: &str, history: Vec<Message>) {
        let carried: Vec<Message> = if self.is_open_with(peer_id) {
            self.messages
                .drain(..)
                .filter(|m| m.is_provisional())
                .collect()
        } else {
            Vec::new()
        };

        self.peer_id = Some(peer_id.to_string());
        self.messages = history;
        let mut consumed = vec![false; self.messages.len()];
        for pending in carried {
            let counterpart = self.messages.iter().enumerate().position(|(idx, m)| {
                !consumed[idx]
                    && !m.is_provisional()
                    && m.body == pending.body
                    && m.sender_id == pending.sender_id
                    && m.created_at >= pending.created_at
            });
            match counterpart {
                Some(idx) => consumed[idx] = true,
                None => self.messages.push(pending),
            }
        }
    }

    /// Optimistic update: show the entry before the gateway confirms it
    pub fn append_provisional(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// Merge a durable message delivered by the realtime feed.
    ///
    /// Idempotent under duplicate delivery and independent of whether the
    /// echo arrives before or after the local send resolves.
    pub fn reconcile(&mut self, msg: Message) -> Reconciled {
        if self.messages.iter().any(|m| m.id == msg.id) {
            return Reconciled::Duplicate;
        }

        let provisional = self
            .messages
            .iter()
            .position(|m| m.is_provisional() && m.body == msg.body && m.sender_id == msg.sender_id);
        match provisional {
            Some(idx) => {
                self.messages[idx] = msg;
                Reconciled::Replaced(idx)
            }
            None => {
                self.messages.push(msg);
                Reconciled::Appended
            }
        }
    }

    pub fn mark_failed(&mut self, id: &MessageId, reason: &str) -> bool {
        self.set_delivery(
            id,
            DeliveryState::Failed {
                reason: reason.to_string(),
            },
        )
    }

    pub fn mark_pending(&mut self, id: &MessageId) -> bool {
        self.set_delivery(id, DeliveryState::Pending)
    }

    fn set_delivery(&mut self, id: &MessageId, delivery: DeliveryState) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id && m.is_provisional()) {
            Some(msg) => {
                msg.delivery = delivery;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let idx = self.messages.iter().position(|m| &m.id == id)?;
        Some(self.messages.remove(idx))
    }

    pub fn clear(&mut self) {
        self.peer_id = None;
        self.messages.clear();
    }
}

/// State reachable from feed pumps
struct StoreShared {
    conversation: RwLock<ConversationState>,
    messages: RwLock<Vec<Message>>,
    events: broadcast::Sender<ChatEvent>,
}

impl StoreShared {
    fn emit(&self, event: ChatEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn apply_conversation_message(&self, peer_id: &str, msg: Message) {
        let outcome = {
            let mut conv = self.conversation.write().await;
            if !conv.is_open_with(peer_id) {
                debug!("Dropping echo for closed conversation with {}", peer_id);
                return;
            }
            conv.reconcile(msg)
        };
        debug!("Reconciled message for {}: {:?}", peer_id, outcome);
        if outcome != Reconciled::Duplicate {
            self.emit(ChatEvent::ConversationChanged {
                peer_id: peer_id.to_string(),
            });
        }
    }

    async fn apply_global_message(&self, msg: Message) -> bool {
        {
            let mut messages = self.messages.write().await;
            if messages.iter().any(|m| m.id == msg.id) {
                return false;
            }
            messages.push(msg);
        }
        self.emit(ChatEvent::InboxChanged);
        true
    }
}

/// Authoritative view of the active conversation and the global message list
pub struct ConversationStore<G: MessageGateway> {
    gateway: Arc<G>,
    session: SessionState,
    subscriptions: Arc<SubscriptionManager>,
    shared: Arc<StoreShared>,
    /// Bumped by every load/close; results tagged with an older value are stale
    generation: AtomicU64,
    /// Held while a load or close touches the conversation or its feed
    load_lock: Mutex<()>,
    loading: AtomicBool,
    in_flight_sends: AtomicUsize,
    history_limit: usize,
}

impl<G: MessageGateway> ConversationStore<G> {
    pub fn new(
        gateway: Arc<G>,
        session: SessionState,
        subscriptions: Arc<SubscriptionManager>,
        events: broadcast::Sender<ChatEvent>,
        history_limit: usize,
    ) -> Self {
        Self {
            gateway,
            session,
            subscriptions,
            shared: Arc::new(StoreShared {
                conversation: RwLock::new(ConversationState::default()),
                messages: RwLock::new(Vec::new()),
                events,
            }),
            generation: AtomicU64::new(0),
            load_lock: Mutex::new(()),
            loading: AtomicBool::new(false),
            in_flight_sends: AtomicUsize::new(0),
            history_limit,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Open the conversation with `peer_id`: release the previous conversation
    /// feed, fetch the history, install it and subscribe to the new pair.
    ///
    /// Returns the fetched history. A load superseded by a later load or a
    /// close still returns its history but leaves the store untouched.
    pub async fn load_conversation(&self, peer_id: &str) -> Vec<Message> {
        let generation = {
            let _serial = self.load_lock.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.subscriptions.release(ChannelKey::Conversation);
            self.shared.conversation.write().await.open(peer_id);
            self.loading.store(true, Ordering::SeqCst);
            generation
        };
        self.shared.emit(ChatEvent::ConversationChanged {
            peer_id: peer_id.to_string(),
        });

        let history = match self.gateway.fetch_conversation(peer_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to fetch conversation with {}: {}", peer_id, e);
                Vec::new()
            }
        };

        let _serial = self.load_lock.lock().await;
        if !self.is_current(generation) {
            debug!("Discarding stale conversation fetch for {}", peer_id);
            return history;
        }

        self.shared
            .conversation
            .write()
            .await
            .replace(peer_id, history.clone());
        self.shared.emit(ChatEvent::ConversationChanged {
            peer_id: peer_id.to_string(),
        });

        let subscribed = self.gateway.subscribe_to_conversation(peer_id).await;
        if !self.is_current(generation) {
            if let Ok(feed) = subscribed {
                debug!("Releasing feed of superseded conversation with {}", peer_id);
                feed.unsubscribe.release();
            }
            return history;
        }

        match subscribed {
            Ok(feed) => {
                let shared = self.shared.clone();
                let peer = peer_id.to_string();
                self.subscriptions
                    .install(ChannelKey::Conversation, peer_id, feed, move |msg| {
                        let shared = shared.clone();
                        let peer = peer.clone();
                        async move { shared.apply_conversation_message(&peer, msg).await }
                    });
            }
            Err(e) => warn!("Failed to subscribe to conversation with {}: {}", peer_id, e),
        }

        self.loading.store(false, Ordering::SeqCst);
        info!("Conversation with {} loaded ({} messages)", peer_id, history.len());
        history
    }

    /// Optimistically append `body` and send it to `peer_id`.
    ///
    /// The provisional entry is replaced when the realtime echo arrives; a
    /// failed send keeps it visible, marked failed, for retry or discard.
    pub async fn send_message(&self, body: &str, peer_id: &str) -> SendOutcome {
        if body.trim().is_empty() {
            return SendOutcome::failure(ChatError::EmptyMessage.to_string());
        }
        let Some(me) = self.session.current_user() else {
            return SendOutcome::failure(ChatError::NotAuthenticated.to_string());
        };

        let optimistic = Message::provisional(body, me.as_participant(), peer_id);
        let local_id = optimistic.id.clone();
        let shown = {
            let mut conv = self.shared.conversation.write().await;
            if conv.is_open_with(peer_id) {
                conv.append_provisional(optimistic);
                true
            } else {
                false
            }
        };
        if shown {
            self.shared.emit(ChatEvent::ConversationChanged {
                peer_id: peer_id.to_string(),
            });
        }

        self.deliver(local_id, body, peer_id, shown).await
    }

    /// Re-send a failed optimistic entry of the active conversation
    pub async fn retry_message(&self, id: &MessageId) -> SendOutcome {
        let (body, peer_id) = {
            let mut conv = self.shared.conversation.write().await;
            let failed = conv
                .get(id)
                .filter(|m| m.is_failed())
                .map(|m| (m.body.clone(), m.receiver_id.clone()));
            match failed {
                Some(found) => {
                    conv.mark_pending(id);
                    found
                }
                None => {
                    return SendOutcome::failure(
                        ChatError::NotFound(format!("failed message {}", id)).to_string(),
                    )
                }
            }
        };
        self.shared.emit(ChatEvent::ConversationChanged {
            peer_id: peer_id.clone(),
        });
        self.deliver(id.clone(), &body, &peer_id, true).await
    }

    async fn deliver(&self, local_id: MessageId, body: &str, peer_id: &str, shown: bool) -> SendOutcome {
        self.in_flight_sends.fetch_add(1, Ordering::SeqCst);
        let result = self.gateway.send_message(body, peer_id).await;
        self.in_flight_sends.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(durable_id) => {
                debug!("Sent {} to {} as {}", local_id, peer_id, durable_id);
                SendOutcome::ok_with_id(durable_id)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Failed to send message to {}: {}", peer_id, reason);
                if !shown {
                    return SendOutcome::failure(reason);
                }
                // the echo may already have confirmed it
                let marked = self
                    .shared
                    .conversation
                    .write()
                    .await
                    .mark_failed(&local_id, &reason);
                if marked {
                    self.shared.emit(ChatEvent::MessageFailed {
                        message_id: local_id.clone(),
                        error: reason.clone(),
                    });
                }
                SendOutcome::failure_for(local_id, reason)
            }
        }
    }

    /// Drop a provisional entry from the active conversation
    pub async fn discard_message(&self, id: &MessageId) -> bool {
        if !id.is_provisional() {
            return false;
        }
        let (removed, peer_id) = {
            let mut conv = self.shared.conversation.write().await;
            let removed = conv.remove(id).is_some();
            (removed, conv.peer_id().map(String::from))
        };
        if let (true, Some(peer_id)) = (removed, peer_id) {
            self.shared.emit(ChatEvent::ConversationChanged { peer_id });
        }
        removed
    }

    /// Delete a durable message; provisional ones are only discarded locally
    pub async fn delete_message(&self, id: &MessageId) -> SendOutcome {
        if id.is_provisional() {
            return if self.discard_message(id).await {
                SendOutcome::ok()
            } else {
                SendOutcome::failure(ChatError::NotFound(format!("message {}", id)).to_string())
            };
        }

        if let Err(e) = self.gateway.delete_message(id).await {
            warn!("Failed to delete message {}: {}", id, e);
            return SendOutcome::failure(e.to_string());
        }

        self.shared.messages.write().await.retain(|m| &m.id != id);
        self.shared.emit(ChatEvent::InboxChanged);
        let peer_id = {
            let mut conv = self.shared.conversation.write().await;
            conv.remove(id).and(conv.peer_id().map(String::from))
        };
        if let Some(peer_id) = peer_id {
            self.shared.emit(ChatEvent::ConversationChanged { peer_id });
        }
        SendOutcome::ok()
    }

    /// Release the conversation feed and clear the active conversation
    pub async fn close_conversation(&self) {
        // a load mid-apply finishes first, then gets torn down here
        let was_open = {
            let _serial = self.load_lock.lock().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.subscriptions.release(ChannelKey::Conversation);
            self.loading.store(false, Ordering::SeqCst);
            let mut conv = self.shared.conversation.write().await;
            let was_open = conv.peer_id().is_some();
            conv.clear();
            was_open
        };
        if was_open {
            info!("Conversation closed");
            self.shared.emit(ChatEvent::ConversationClosed);
        }
    }

    /// Refetch the global message list (inbox source)
    ///
    /// Feed deliveries newer than anything in the fetched page are kept, so a
    /// message that lands while the fetch is in flight is not lost. A failed
    /// fetch leaves the list as it was.
    pub async fn reload_messages(&self) -> Vec<Message> {
        let fetched = match self.gateway.fetch_history(self.history_limit).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to fetch message history: {}", e);
                return Vec::new();
            }
        };
        {
            let mut messages = self.shared.messages.write().await;
            let newest = fetched.iter().map(|m| m.created_at).max();
            let late: Vec<Message> = messages
                .drain(..)
                .filter(|m| newest.map_or(true, |newest| m.created_at >= newest))
                .filter(|m| !fetched.iter().any(|f| f.id == m.id))
                .collect();
            *messages = fetched.clone();
            messages.extend(late);
        }
        self.shared.emit(ChatEvent::InboxChanged);
        fetched
    }

    /// Merge a message from the global insert feed; false for duplicates
    pub async fn apply_global(&self, msg: Message) -> bool {
        self.shared.apply_global_message(msg).await
    }

    /// Merge a message from the active conversation's feed
    pub async fn apply_conversation(&self, peer_id: &str, msg: Message) {
        self.shared.apply_conversation_message(peer_id, msg).await
    }

    /// Pump target for the global insert feed
    pub(crate) fn global_sink(&self) -> impl FnMut(Message) -> SinkFuture + Send + 'static {
        let shared = self.shared.clone();
        move |msg| {
            let shared = shared.clone();
            Box::pin(async move {
                shared.apply_global_message(msg).await;
            })
        }
    }

    pub async fn active_peer(&self) -> Option<String> {
        self.shared.conversation.read().await.peer_id().map(String::from)
    }

    pub async fn conversation(&self) -> Vec<Message> {
        self.shared.conversation.read().await.messages().to_vec()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.shared.messages.read().await.clone()
    }

    pub async fn inbox(&self) -> Vec<InboxEntry> {
        match self.session.current_user() {
            Some(me) => derive_inbox(&self.shared.messages.read().await, &me.id),
            None => Vec::new(),
        }
    }

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn sending(&self) -> bool {
        self.in_flight_sends.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::Participant;
    use chrono::Utc;

    fn me() -> Participant {
        Participant {
            id: "me".into(),
            ..Default::default()
        }
    }

    fn durable(id: &str, body: &str, from: &str, to: &str) -> Message {
        Message {
            id: MessageId::new(id),
            body: body.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            created_at: Utc::now(),
            sender: None,
            receiver: None,
            delivery: DeliveryState::Confirmed,
        }
    }

    fn open_with(peer: &str, history: Vec<Message>) -> ConversationState {
        let mut state = ConversationState::default();
        state.replace(peer, history);
        state
    }

    #[test]
    fn test_duplicate_delivery_is_ignored() {
        let mut state = open_with("peer1", vec![durable("d0", "earlier", "peer1", "me")]);
        let echo = durable("d1", "hi", "peer1", "me");

        assert_eq!(state.reconcile(echo.clone()), Reconciled::Appended);
        let after_first = state.messages().to_vec();
        assert_eq!(state.reconcile(echo), Reconciled::Duplicate);
        assert_eq!(state.messages(), after_first.as_slice());
    }

    #[test]
    fn test_echo_replaces_provisional_in_place() {
        let mut state = open_with("peer1", vec![durable("d0", "earlier", "peer1", "me")]);
        state.append_provisional(Message::provisional("hello", me(), "peer1"));
        state.append_provisional(Message::provisional("second", me(), "peer1"));

        let outcome = state.reconcile(durable("d1", "hello", "me", "peer1"));
        assert_eq!(outcome, Reconciled::Replaced(1));

        let hellos: Vec<_> = state.messages().iter().filter(|m| m.body == "hello").collect();
        assert_eq!(hellos.len(), 1);
        assert_eq!(state.messages()[1].id.as_str(), "d1");
        assert_eq!(state.messages()[2].body, "second");
        assert!(state.messages()[2].is_provisional());
    }

    #[test]
    fn test_non_matching_echo_appends() {
        let mut state = open_with("peer1", Vec::new());
        state.append_provisional(Message::provisional("hello", me(), "peer1"));

        // same body, other sender
        assert_eq!(state.reconcile(durable("d1", "hello", "peer1", "me")), Reconciled::Appended);
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1].id.as_str(), "d1");
        assert!(state.messages()[0].is_provisional());
    }

    #[test]
    fn test_failed_entry_can_still_be_confirmed() {
        let mut state = open_with("peer1", Vec::new());
        let pending = Message::provisional("hello", me(), "peer1");
        let id = pending.id.clone();
        state.append_provisional(pending);

        assert!(state.mark_failed(&id, "timeout"));
        assert!(state.get(&id).unwrap().is_failed());
        assert_eq!(state.reconcile(durable("d1", "hello", "me", "peer1")), Reconciled::Replaced(0));
        assert_eq!(state.messages()[0].delivery, DeliveryState::Confirmed);
    }

    #[test]
    fn test_durable_entries_cannot_be_marked() {
        let mut state = open_with("peer1", vec![durable("d1", "x", "me", "peer1")]);
        assert!(!state.mark_failed(&MessageId::new("d1"), "nope"));
    }

    #[test]
    fn test_replace_keeps_unconfirmed_provisional_entries() {
        let mut state = ConversationState::default();
        state.open("peer1");
        state.append_provisional(Message::provisional("confirmed already", me(), "peer1"));
        state.append_provisional(Message::provisional("still pending", me(), "peer1"));

        state.replace("peer1", vec![durable("d1", "confirmed already", "me", "peer1")]);
        let bodies: Vec<_> = state.messages().iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["confirmed already", "still pending"]);
        assert!(!state.messages()[0].is_provisional());
    }

    #[test]
    fn test_older_history_entry_does_not_confirm_pending_send() {
        let mut state = ConversationState::default();
        state.open("peer1");
        let pending = Message::provisional("ok", me(), "peer1");
        let id = pending.id.clone();
        state.append_provisional(pending);

        let mut old_ok = durable("d1", "ok", "me", "peer1");
        old_ok.created_at = Utc::now() - chrono::Duration::hours(1);
        state.replace("peer1", vec![old_ok]);

        assert_eq!(state.messages().len(), 2);
        assert!(state.messages()[1].is_provisional());
        assert!(state.mark_failed(&id, "timeout"));
    }

    #[test]
    fn test_durable_entry_confirms_one_pending_send() {
        let mut state = ConversationState::default();
        state.open("peer1");
        state.append_provisional(Message::provisional("ok", me(), "peer1"));
        state.append_provisional(Message::provisional("ok", me(), "peer1"));

        state.replace("peer1", vec![durable("d1", "ok", "me", "peer1")]);
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].id.as_str(), "d1");
        assert!(state.messages()[1].is_provisional());
    }

    #[test]
    fn test_open_other_peer_clears() {
        let mut state = open_with("a", vec![durable("d1", "x", "me", "a")]);
        state.open("b");
        assert_eq!(state.peer_id(), Some("b"));
        assert!(state.messages().is_empty());
        state.clear();
        assert!(state.peer_id().is_none());
    }
}
