/// In-memory stand-in for the hosted backend
///
/// `InMemoryBackend` plays the platform: a user table, the message table, an
/// insert feed and a typing broadcast channel. `InMemoryGateway` is one
/// client's authenticated view of it. Faults and latency can be injected so
/// the failure paths of the chat core can be driven deterministically.
use super::record::{map_rows, MessageRow, RowId, UserRow};
use super::{Feed, MessageGateway, Unsubscribe};
use crate::error::{ChatError, Result};
use crate::messenger_types::{Message, MessageId, Participant, Role, TypingEvent};
use crate::session::{LocalUser, SessionState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const FEED_CAPACITY: usize = 256;

/// Subscription journal entry, in the order the backend saw them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Subscribed(String),
    Unsubscribed(String),
}

#[derive(Default)]
struct Faults {
    fail_sends: Option<String>,
    fail_fetches: Option<String>,
    fail_subscriptions: Option<String>,
    fail_deletes: Option<String>,
    conversation_delays: HashMap<String, Duration>,
    history_delay: Option<Duration>,
}

struct BackendInner {
    users: Mutex<HashMap<String, UserRow>>,
    rows: Mutex<Vec<MessageRow>>,
    next_id: AtomicU64,
    inserts: broadcast::Sender<MessageRow>,
    typing: broadcast::Sender<TypingEvent>,
    faults: Mutex<Faults>,
    live_feeds: AtomicUsize,
    journal: Mutex<Vec<FeedEvent>>,
}

/// Shared fake platform; clones refer to the same tables and channels
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicked test thread must not wedge the fake
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(FEED_CAPACITY);
        let (typing, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(BackendInner {
                users: Mutex::new(HashMap::new()),
                rows: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                inserts,
                typing,
                faults: Mutex::new(Faults::default()),
                live_feeds: AtomicUsize::new(0),
                journal: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an account in the user table
    pub fn add_user(&self, user: &LocalUser) {
        lock(&self.inner.users).insert(
            user.id.clone(),
            UserRow {
                id: Some(user.id.clone()),
                nombre: user.display_name.clone(),
                email: Some(user.email.clone()),
                rol: Some(user.role),
            },
        );
    }

    /// Gateway view authenticated through `session`
    pub fn gateway(&self, session: SessionState) -> InMemoryGateway {
        InMemoryGateway {
            backend: self.clone(),
            session,
        }
    }

    /// Insert a row with a fixed timestamp without notifying any feed
    pub fn seed_message(&self, sender_id: &str, receiver_id: &str, body: &str, created_at: DateTime<Utc>) -> MessageId {
        let row = self.new_row(sender_id, receiver_id, body, created_at);
        let id = MessageId::new(row_id(&row));
        lock(&self.inner.rows).push(row);
        id
    }

    /// Durable insert followed by the realtime notification
    pub fn insert_message(&self, sender_id: &str, receiver_id: &str, body: &str) -> Result<MessageId> {
        if let Some(reason) = lock(&self.inner.faults).fail_sends.clone() {
            return Err(ChatError::Gateway(reason));
        }
        let row = self.new_row(sender_id, receiver_id, body, Utc::now());
        let id = MessageId::new(row_id(&row));
        lock(&self.inner.rows).push(row.clone());
        // no listeners is fine
        let _ = self.inner.inserts.send(row);
        Ok(id)
    }

    pub fn message_count(&self) -> usize {
        lock(&self.inner.rows).len()
    }

    /// Number of realtime feeds currently open against this backend
    pub fn live_feeds(&self) -> usize {
        self.inner.live_feeds.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<FeedEvent> {
        lock(&self.inner.journal).clone()
    }

    pub fn fail_sends(&self, reason: Option<&str>) {
        lock(&self.inner.faults).fail_sends = reason.map(String::from);
    }

    pub fn fail_fetches(&self, reason: Option<&str>) {
        lock(&self.inner.faults).fail_fetches = reason.map(String::from);
    }

    pub fn fail_subscriptions(&self, reason: Option<&str>) {
        lock(&self.inner.faults).fail_subscriptions = reason.map(String::from);
    }

    pub fn fail_deletes(&self, reason: Option<&str>) {
        lock(&self.inner.faults).fail_deletes = reason.map(String::from);
    }

    /// Delay every conversation fetch involving `peer_id`
    pub fn delay_conversation(&self, peer_id: &str, delay: Duration) {
        lock(&self.inner.faults)
            .conversation_delays
            .insert(peer_id.to_string(), delay);
    }

    /// Hold every history response for `delay` after the rows were read
    pub fn delay_history(&self, delay: Duration) {
        lock(&self.inner.faults).history_delay = Some(delay);
    }

    fn new_row(&self, sender_id: &str, receiver_id: &str, body: &str, created_at: DateTime<Utc>) -> MessageRow {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        MessageRow {
            id: RowId::Int(id as i64),
            contenido: body.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            created_at: created_at.to_rfc3339(),
            sender: None,
            receiver: None,
            usuario: None,
        }
    }

    /// Row with both user joins resolved, the shape the select queries return
    fn joined(&self, row: &MessageRow) -> MessageRow {
        let users = lock(&self.inner.users);
        MessageRow {
            sender: users.get(&row.sender_id).cloned(),
            receiver: users.get(&row.receiver_id).cloned(),
            ..row.clone()
        }
    }

    fn select<F>(&self, filter: F) -> Vec<MessageRow>
    where
        F: Fn(&MessageRow) -> bool,
    {
        let rows: Vec<MessageRow> = lock(&self.inner.rows)
            .iter()
            .filter(|r| filter(r))
            .cloned()
            .collect();
        rows.iter().map(|r| self.joined(r)).collect()
    }

    fn check_fetch(&self) -> Result<()> {
        match lock(&self.inner.faults).fail_fetches.clone() {
            Some(reason) => Err(ChatError::Gateway(reason)),
            None => Ok(()),
        }
    }

    fn check_subscribe(&self) -> Result<()> {
        match lock(&self.inner.faults).fail_subscriptions.clone() {
            Some(reason) => Err(ChatError::Subscription(reason)),
            None => Ok(()),
        }
    }

    /// Bridge a broadcast channel into a per-subscriber feed
    fn open_feed<S, T, F>(&self, channel: String, mut source: broadcast::Receiver<S>, mut map: F) -> Feed<T>
    where
        S: Clone + Send + 'static,
        T: Send + 'static,
        F: FnMut(S) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(item) => {
                        if let Some(out) = map(item) {
                            if tx.send(out).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Feed {} lagged {} events", label, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.inner.live_feeds.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.journal).push(FeedEvent::Subscribed(channel.clone()));
        debug!("Backend feed opened: {}", channel);

        let inner = self.inner.clone();
        let unsubscribe = Unsubscribe::new(move || {
            task.abort();
            inner.live_feeds.fetch_sub(1, Ordering::SeqCst);
            lock(&inner.journal).push(FeedEvent::Unsubscribed(channel.clone()));
            debug!("Backend feed closed: {}", channel);
        });
        Feed::new(rx, unsubscribe)
    }
}

fn row_id(row: &MessageRow) -> String {
    match &row.id {
        RowId::Int(n) => n.to_string(),
        RowId::Text(s) => s.clone(),
    }
}

/// One client's authenticated view of an `InMemoryBackend`
#[derive(Clone)]
pub struct InMemoryGateway {
    backend: InMemoryBackend,
    session: SessionState,
}

impl InMemoryGateway {
    pub fn backend(&self) -> &InMemoryBackend {
        &self.backend
    }

    fn me(&self) -> Result<LocalUser> {
        self.session.current_user().ok_or(ChatError::NotAuthenticated)
    }
}

impl MessageGateway for InMemoryGateway {
    async fn fetch_history(&self, limit: usize) -> Result<Vec<Message>> {
        let me = self.me()?;
        self.backend.check_fetch()?;
        let rows = self
            .backend
            .select(|r| r.sender_id == me.id || r.receiver_id == me.id);
        let delay = lock(&self.backend.inner.faults).history_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut messages = map_rows(rows);
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn fetch_conversation(&self, peer_id: &str) -> Result<Vec<Message>> {
        let me = self.me()?;
        let delay = lock(&self.backend.inner.faults)
            .conversation_delays
            .get(peer_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.backend.check_fetch()?;
        let rows = self.backend.select(|r| {
            (r.sender_id == me.id && r.receiver_id == peer_id)
                || (r.sender_id == peer_id && r.receiver_id == me.id)
        });
        let mut messages = map_rows(rows);
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn send_message(&self, body: &str, receiver_id: &str) -> Result<MessageId> {
        let me = self.me()?;
        self.backend.insert_message(&me.id, receiver_id, body)
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        self.me()?;
        if let Some(reason) = lock(&self.backend.inner.faults).fail_deletes.clone() {
            return Err(ChatError::Gateway(reason));
        }
        let mut rows = lock(&self.backend.inner.rows);
        let before = rows.len();
        rows.retain(|r| row_id(r) != id.as_str());
        if rows.len() == before {
            return Err(ChatError::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    async fn subscribe_to_insertions(&self) -> Result<Feed<Message>> {
        let me = self.me()?;
        self.backend.check_subscribe()?;
        let backend = self.backend.clone();
        let source = self.backend.inner.inserts.subscribe();
        // same scope as fetch_history: rows the local user sent or received
        Ok(self.backend.open_feed("messages".to_string(), source, move |row| {
            if row.sender_id != me.id && row.receiver_id != me.id {
                return None;
            }
            Message::try_from(backend.joined(&row)).ok()
        }))
    }

    async fn subscribe_to_conversation(&self, peer_id: &str) -> Result<Feed<Message>> {
        let me = self.me()?;
        self.backend.check_subscribe()?;
        let backend = self.backend.clone();
        let peer = peer_id.to_string();
        let source = self.backend.inner.inserts.subscribe();
        Ok(self
            .backend
            .open_feed(format!("conv:{}", peer_id), source, move |row| {
                let belongs = (row.sender_id == me.id && row.receiver_id == peer)
                    || (row.sender_id == peer && row.receiver_id == me.id);
                if !belongs {
                    return None;
                }
                Message::try_from(backend.joined(&row)).ok()
            }))
    }

    async fn broadcast_typing(&self, user_id: &str, user_display: &str) -> Result<()> {
        let _ = self
            .backend
            .inner
            .typing
            .send(TypingEvent::now(user_id, user_display));
        Ok(())
    }

    async fn subscribe_to_typing(&self) -> Result<Feed<TypingEvent>> {
        self.backend.check_subscribe()?;
        let source = self.backend.inner.typing.subscribe();
        Ok(self.backend.open_feed("typing".to_string(), source, Some))
    }

    async fn find_advisor(&self) -> Result<Option<Participant>> {
        self.backend.check_fetch()?;
        let users = lock(&self.backend.inner.users);
        let mut advisors: Vec<&UserRow> = users
            .values()
            .filter(|u| u.rol == Some(Role::Advisor))
            .collect();
        advisors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(advisors.first().map(|u| Participant {
            id: u.id.clone().unwrap_or_default(),
            display_name: u.nombre.clone(),
            email: u.email.clone(),
            role: u.rol,
        }))
    }
}
