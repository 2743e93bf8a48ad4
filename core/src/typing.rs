/// Typing presence tracker
///
/// The transport only carries "typing" notifications, never "stopped typing".
/// Each peer stays in the active set until its quiet period elapses without a
/// newer event.
use crate::gateway::MessageGateway;
use crate::messenger_types::{ChatEvent, TypingEvent};
use crate::session::SessionState;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ExpiryTimer {
    token: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct PresenceState {
    active: HashMap<String, TypingEvent>,
    timers: HashMap<String, ExpiryTimer>,
    next_token: u64,
}

struct Presence {
    state: Mutex<PresenceState>,
    expiry: Duration,
    events: broadcast::Sender<ChatEvent>,
}

impl Presence {
    fn state(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(state: &PresenceState) -> Vec<TypingEvent> {
        let mut typing: Vec<TypingEvent> = state.active.values().cloned().collect();
        typing.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        typing
    }

    fn publish(&self, typing: Vec<TypingEvent>) {
        let _ = self.events.send(ChatEvent::TypingChanged { typing });
    }

    fn expire(&self, peer_id: &str, token: u64) {
        let typing = {
            let mut state = self.state();
            // a refresh may have replaced this timer after it fired
            match state.timers.get(peer_id) {
                Some(timer) if timer.token == token => {}
                _ => return,
            }
            state.timers.remove(peer_id);
            state.active.remove(peer_id);
            Self::snapshot(&state)
        };
        debug!("Typing indicator for {} expired", peer_id);
        self.publish(typing);
    }
}

/// Live "who is typing now" set for the local client
pub struct TypingTracker<G: MessageGateway> {
    gateway: Arc<G>,
    session: SessionState,
    presence: Arc<Presence>,
}

impl<G: MessageGateway> TypingTracker<G> {
    pub fn new(gateway: Arc<G>, session: SessionState, expiry: Duration, events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            gateway,
            session,
            presence: Arc::new(Presence {
                state: Mutex::new(PresenceState::default()),
                expiry,
                events,
            }),
        }
    }

    /// Broadcast that the local user is typing. Call frequency is the caller's
    /// concern; every call sends.
    pub async fn notify_typing(&self) {
        let Some(me) = self.session.current_user() else {
            debug!("Not broadcasting typing without a signed-in user");
            return;
        };
        let display = me.display_name.clone().unwrap_or_else(|| me.email.clone());
        if let Err(e) = self.gateway.broadcast_typing(&me.id, &display).await {
            warn!("Failed to broadcast typing: {}", e);
        }
    }

    /// Record a typing event and (re)start that peer's expiry timer
    pub fn on_typing_event(&self, event: TypingEvent) {
        on_typing_event(&self.presence, &self.session, event);
    }

    /// Pump target for the typing feed
    pub(crate) fn sink(&self) -> impl FnMut(TypingEvent) -> std::future::Ready<()> + Send + 'static {
        let presence = self.presence.clone();
        let session = self.session.clone();
        move |event| {
            on_typing_event(&presence, &session, event);
            std::future::ready(())
        }
    }

    /// Currently typing peers, ordered by peer id
    pub fn typing(&self) -> Vec<TypingEvent> {
        Presence::snapshot(&self.presence.state())
    }

    pub fn typing_peer(&self, peer_id: &str) -> Option<TypingEvent> {
        self.presence.state().active.get(peer_id).cloned()
    }

    pub fn is_typing(&self, peer_id: &str) -> bool {
        self.presence.state().active.contains_key(peer_id)
    }

    /// Cancel every timer and forget all peers
    pub fn clear(&self) {
        let had_any = {
            let mut state = self.presence.state();
            for (_, timer) in state.timers.drain() {
                timer.task.abort();
            }
            let had_any = !state.active.is_empty();
            state.active.clear();
            had_any
        };
        if had_any {
            self.presence.publish(Vec::new());
        }
    }
}

impl<G: MessageGateway> Drop for TypingTracker<G> {
    fn drop(&mut self) {
        for (_, timer) in self.presence.state().timers.drain() {
            timer.task.abort();
        }
    }
}

fn on_typing_event(presence: &Arc<Presence>, session: &SessionState, event: TypingEvent) {
    if let Some(me) = session.current_user() {
        if me.id == event.peer_id {
            return;
        }
    }

    let peer_id = event.peer_id.clone();
    let typing = {
        let mut state = presence.state();
        state.next_token += 1;
        let token = state.next_token;

        if let Some(previous) = state.timers.remove(&peer_id) {
            previous.task.abort();
        }
        state.active.insert(peer_id.clone(), event);
        let task = tokio::spawn(expire_after(
            Arc::downgrade(presence),
            peer_id.clone(),
            token,
            presence.expiry,
        ));
        state.timers.insert(peer_id, ExpiryTimer { token, task });
        Presence::snapshot(&state)
    };
    presence.publish(typing);
}

fn expire_after(presence: Weak<Presence>, peer_id: String, token: u64, after: Duration) -> impl Future<Output = ()> + Send {
    async move {
        tokio::time::sleep(after).await;
        if let Some(presence) = presence.upgrade() {
            presence.expire(&peer_id, token);
        }
    }
}
