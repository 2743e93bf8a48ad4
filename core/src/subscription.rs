/// Subscription lifecycle management
///
/// Sole owner of live realtime feeds. Each logical channel holds at most one
/// feed; installing a new feed for a channel releases the previous one first,
/// and dropping the manager releases everything still live.
use crate::error::Result;
use crate::gateway::{Feed, Unsubscribe};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Logical realtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Global message insert feed
    Messages,
    /// Global typing broadcast feed
    Typing,
    /// Feed of the currently open conversation
    Conversation,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Messages => f.write_str("messages"),
            ChannelKey::Typing => f.write_str("typing"),
            ChannelKey::Conversation => f.write_str("conversation"),
        }
    }
}

/// Opaque ownership token for one installed feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedHandle {
    pub key: ChannelKey,
    id: u64,
}

struct LiveFeed {
    id: u64,
    label: String,
    unsubscribe: Unsubscribe,
    pump: JoinHandle<()>,
}

impl LiveFeed {
    fn release(self, key: ChannelKey) {
        // stop delivering before the transport listener goes away
        self.pump.abort();
        self.unsubscribe.release();
        info!("Released {} feed ({})", key, self.label);
    }
}

/// Owner of every live feed handle
pub struct SubscriptionManager {
    feeds: Mutex<HashMap<ChannelKey, LiveFeed>>,
    next_id: AtomicU64,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<ChannelKey, LiveFeed>> {
        self.feeds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Release the previous feed for `key`, establish a new one and pump its
    /// items into `on_item`.
    ///
    /// A failed subscription is logged and leaves the channel without a feed.
    pub async fn acquire<T, S, F, Fut>(
        &self,
        key: ChannelKey,
        label: impl Into<String>,
        subscribe: S,
        on_item: F,
    ) -> Option<FeedHandle>
    where
        T: Send + 'static,
        S: Future<Output = Result<Feed<T>>>,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        self.release(key);
        match subscribe.await {
            Ok(feed) => Some(self.install(key, label, feed, on_item)),
            Err(e) => {
                warn!("Failed to subscribe to {} feed ({}): {}", key, label, e);
                None
            }
        }
    }

    /// Take ownership of an established feed.
    ///
    /// Any feed still live under `key` is released before the new one starts.
    pub fn install<T, F, Fut>(&self, key: ChannelKey, label: impl Into<String>, feed: Feed<T>, mut on_item: F) -> FeedHandle
    where
        T: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let Feed {
            mut receiver,
            unsubscribe,
        } = feed;

        let previous = self.feeds().remove(&key);
        if let Some(previous) = previous {
            previous.release(key);
        }

        let pump_label = label.clone();
        let pump = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                on_item(item).await;
            }
            debug!("Feed {} drained", pump_label);
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!("Acquired {} feed ({})", key, label);
        let displaced = self.feeds().insert(
            key,
            LiveFeed {
                id,
                label,
                unsubscribe,
                pump,
            },
        );
        // a concurrent install for the same key lost the race
        if let Some(displaced) = displaced {
            displaced.release(key);
        }
        FeedHandle { key, id }
    }

    /// Release whatever feed is live for `key`; returns whether one was
    pub fn release(&self, key: ChannelKey) -> bool {
        let removed = self.feeds().remove(&key);
        match removed {
            Some(feed) => {
                feed.release(key);
                true
            }
            None => false,
        }
    }

    /// Release `handle` only if it is still the live feed for its channel
    pub fn release_handle(&self, handle: &FeedHandle) -> bool {
        let removed = {
            let mut feeds = self.feeds();
            match feeds.get(&handle.key) {
                Some(feed) if feed.id == handle.id => feeds.remove(&handle.key),
                _ => None,
            }
        };
        match removed {
            Some(feed) => {
                feed.release(handle.key);
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let drained: Vec<(ChannelKey, LiveFeed)> = self.feeds().drain().collect();
        for (key, feed) in drained {
            feed.release(key);
        }
    }

    pub fn is_live(&self, key: ChannelKey) -> bool {
        self.feeds().contains_key(&key)
    }

    pub fn is_current(&self, handle: &FeedHandle) -> bool {
        self.feeds()
            .get(&handle.key)
            .map(|f| f.id == handle.id)
            .unwrap_or(false)
    }

    /// Label of the feed live for `key` (e.g. the conversation's peer)
    pub fn label(&self, key: ChannelKey) -> Option<String> {
        self.feeds().get(&key).map(|f| f.label.clone())
    }

    pub fn live_count(&self) -> usize {
        self.feeds().len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
