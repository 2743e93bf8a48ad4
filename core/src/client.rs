/// Chat client: composition root wiring gateway, session, store, typing
/// tracker and feed ownership together.
use crate::config::ChatConfig;
use crate::conversation::ConversationStore;
use crate::error::{ChatError, Result};
use crate::gateway::MessageGateway;
use crate::messenger_types::{ChatEvent, InboxEntry, Message, MessageId, Participant, SendOutcome, TypingEvent};
use crate::session::SessionState;
use crate::subscription::{ChannelKey, SubscriptionManager};
use crate::typing::TypingTracker;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub struct ChatClient<G: MessageGateway> {
    config: ChatConfig,
    gateway: Arc<G>,
    session: SessionState,
    subscriptions: Arc<SubscriptionManager>,
    store: ConversationStore<G>,
    typing: TypingTracker<G>,
    events: broadcast::Sender<ChatEvent>,
}

impl<G: MessageGateway> ChatClient<G> {
    pub fn new(gateway: G, session: SessionState, config: ChatConfig) -> Self {
        let gateway = Arc::new(gateway);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let store = ConversationStore::new(
            gateway.clone(),
            session.clone(),
            subscriptions.clone(),
            events.clone(),
            config.history_limit,
        );
        let typing = TypingTracker::new(gateway.clone(), session.clone(), config.typing_expiry, events.clone());

        Self {
            config,
            gateway,
            session,
            subscriptions,
            store,
            typing,
            events,
        }
    }

    /// Open the global message feed, load the global history, then open the
    /// typing feed. The feed goes first so inserts racing the fetch still land.
    pub async fn start(&self) {
        self.subscriptions
            .acquire(
                ChannelKey::Messages,
                "messages",
                self.gateway.subscribe_to_insertions(),
                self.store.global_sink(),
            )
            .await;

        let loaded = self.store.reload_messages().await;
        info!("Loaded {} messages", loaded.len());

        self.subscriptions
            .acquire(
                ChannelKey::Typing,
                "typing",
                self.gateway.subscribe_to_typing(),
                self.typing.sink(),
            )
            .await;
    }

    /// Release every feed, cancel typing timers and close the conversation
    pub async fn shutdown(&self) {
        self.store.close_conversation().await;
        self.subscriptions.release_all();
        self.typing.clear();
        info!("Chat client shut down");
    }

    pub async fn load_conversation(&self, peer_id: &str) -> Vec<Message> {
        self.store.load_conversation(peer_id).await
    }

    pub async fn send_message(&self, body: &str, peer_id: &str) -> SendOutcome {
        self.store.send_message(body, peer_id).await
    }

    pub async fn retry_message(&self, id: &MessageId) -> SendOutcome {
        self.store.retry_message(id).await
    }

    pub async fn discard_message(&self, id: &MessageId) -> bool {
        self.store.discard_message(id).await
    }

    pub async fn delete_message(&self, id: &MessageId) -> SendOutcome {
        self.store.delete_message(id).await
    }

    pub async fn close_conversation(&self) {
        self.store.close_conversation().await
    }

    pub async fn reload_messages(&self) -> Vec<Message> {
        self.store.reload_messages().await
    }

    pub async fn notify_typing(&self) {
        self.typing.notify_typing().await
    }

    /// Customers without an open conversation are routed to an advisor
    pub async fn open_advisor_chat(&self) -> Result<Option<Participant>> {
        let me = self.session.current_user().ok_or(ChatError::NotAuthenticated)?;
        if me.is_advisor() {
            return Ok(None);
        }
        let advisor = self.gateway.find_advisor().await?;
        if let Some(advisor) = &advisor {
            info!("Opening advisor chat with {}", advisor.id);
            self.store.load_conversation(&advisor.id).await;
        }
        Ok(advisor)
    }

    pub async fn conversation(&self) -> Vec<Message> {
        self.store.conversation().await
    }

    pub async fn active_peer(&self) -> Option<String> {
        self.store.active_peer().await
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.store.messages().await
    }

    pub async fn inbox(&self) -> Vec<InboxEntry> {
        self.store.inbox().await
    }

    pub fn typing(&self) -> Vec<TypingEvent> {
        self.typing.typing()
    }

    /// Typing event of the active conversation's peer, if they are typing
    pub async fn typing_for_active(&self) -> Option<TypingEvent> {
        let peer = self.store.active_peer().await?;
        self.typing.typing_peer(&peer)
    }

    pub fn loading(&self) -> bool {
        self.store.loading()
    }

    pub fn sending(&self) -> bool {
        self.store.sending()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn store(&self) -> &ConversationStore<G> {
        &self.store
    }

    pub fn typing_tracker(&self) -> &TypingTracker<G> {
        &self.typing
    }
}

impl<G: MessageGateway> Drop for ChatClient<G> {
    fn drop(&mut self) {
        self.subscriptions.release_all();
    }
}
