/// Message gateway boundary
///
/// The hosted backend (auth, message table, realtime feeds) is consumed only
/// through `MessageGateway`. Implementations translate backend rows into the
/// fixed-shape `Message` in one place (`record`).
pub mod memory;
pub mod record;

use crate::error::Result;
use crate::messenger_types::{Message, MessageId, Participant, TypingEvent};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

/// One-shot release callback for a realtime feed.
///
/// Runs exactly once: on `release()` or, failing that, on drop.
pub struct Unsubscribe {
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Unsubscribe {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A callback with nothing to release
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

/// A live realtime feed: items arrive on `receiver` until `unsubscribe` runs
#[derive(Debug)]
pub struct Feed<T> {
    pub receiver: mpsc::UnboundedReceiver<T>,
    pub unsubscribe: Unsubscribe,
}

impl<T> Feed<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>, unsubscribe: Unsubscribe) -> Self {
        Self {
            receiver,
            unsubscribe,
        }
    }
}

/// Capability interface of the hosted chat backend.
///
/// The gateway resolves the local user from its own auth session; operations
/// that need it fail with `ChatError::NotAuthenticated` when nobody is signed in.
pub trait MessageGateway: Send + Sync + 'static {
    /// Most recent `limit` messages visible to the local user, oldest first
    fn fetch_history(&self, limit: usize) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Full conversation between the local user and `peer_id`, ascending by timestamp
    fn fetch_conversation(&self, peer_id: &str) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Durable write; returns the id assigned by the backend
    fn send_message(&self, body: &str, receiver_id: &str) -> impl Future<Output = Result<MessageId>> + Send;

    fn delete_message(&self, id: &MessageId) -> impl Future<Output = Result<()>> + Send;

    /// Every newly inserted message
    fn subscribe_to_insertions(&self) -> impl Future<Output = Result<Feed<Message>>> + Send;

    /// Newly inserted messages of the (local user, `peer_id`) pair only
    fn subscribe_to_conversation(&self, peer_id: &str) -> impl Future<Output = Result<Feed<Message>>> + Send;

    fn broadcast_typing(&self, user_id: &str, user_display: &str) -> impl Future<Output = Result<()>> + Send;

    fn subscribe_to_typing(&self) -> impl Future<Output = Result<Feed<TypingEvent>>> + Send;

    /// Any advisor account a customer can be routed to
    fn find_advisor(&self) -> impl Future<Output = Result<Option<Participant>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_unsubscribe_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let unsub = Unsubscribe::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        unsub.release();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_runs_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let c = calls.clone();
            let _unsub = Unsubscribe::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
