/// Feed lifecycle tests - one live conversation feed, stale fetches discarded,
/// every feed released on close, shutdown and drop.
use chrono::Utc;
use planchat_core::gateway::memory::{FeedEvent, InMemoryBackend, InMemoryGateway};
use planchat_core::messenger_types::Role;
use planchat_core::subscription::ChannelKey;
use planchat_core::{ChatClient, ChatConfig, LocalUser, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn setup(peers: &[&str]) -> (InMemoryBackend, ChatClient<InMemoryGateway>) {
    let backend = InMemoryBackend::new();
    let me = LocalUser::new("me", "me@example.com", Role::Advisor);
    backend.add_user(&me);
    for peer in peers {
        backend.add_user(&LocalUser::new(*peer, format!("{}@example.com", peer), Role::Customer));
    }
    let session = SessionState::signed_in(me);
    let client = ChatClient::new(backend.gateway(session.clone()), session, ChatConfig::default());
    (backend, client)
}

fn subscribed(channel: &str) -> FeedEvent {
    FeedEvent::Subscribed(channel.to_string())
}

fn unsubscribed(channel: &str) -> FeedEvent {
    FeedEvent::Unsubscribed(channel.to_string())
}

#[tokio::test]
async fn test_switching_conversation_releases_previous_feed_first() {
    let (backend, client) = setup(&["A", "B"]);

    client.load_conversation("A").await;
    assert_eq!(backend.live_feeds(), 1);
    client.load_conversation("B").await;

    assert_eq!(
        backend.journal(),
        vec![subscribed("conv:A"), unsubscribed("conv:A"), subscribed("conv:B")]
    );
    assert_eq!(backend.live_feeds(), 1);
    assert_eq!(client.subscriptions().label(ChannelKey::Conversation).as_deref(), Some("B"));
}

#[tokio::test]
async fn test_stale_fetch_does_not_win() {
    let (backend, client) = setup(&["A", "B"]);
    backend.seed_message("A", "me", "from A", Utc::now());
    backend.seed_message("B", "me", "from B", Utc::now());
    backend.delay_conversation("A", Duration::from_millis(200));

    let (a_history, b_history) = tokio::join!(client.load_conversation("A"), async {
        sleep(Duration::from_millis(20)).await;
        client.load_conversation("B").await
    });

    // each call still returns what it fetched
    assert_eq!(a_history[0].body, "from A");
    assert_eq!(b_history[0].body, "from B");

    assert_eq!(client.active_peer().await.as_deref(), Some("B"));
    let conversation = client.conversation().await;
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].body, "from B");

    assert_eq!(backend.journal(), vec![subscribed("conv:B")]);
    assert_eq!(backend.live_feeds(), 1);
}

#[tokio::test]
async fn test_close_during_load_leaves_nothing_open() {
    let (backend, client) = setup(&["A"]);
    backend.delay_conversation("A", Duration::from_millis(100));

    let (_, _) = tokio::join!(client.load_conversation("A"), async {
        sleep(Duration::from_millis(10)).await;
        client.close_conversation().await
    });

    assert!(client.active_peer().await.is_none());
    assert!(client.conversation().await.is_empty());
    assert_eq!(backend.live_feeds(), 0);
}

#[tokio::test]
async fn test_close_conversation_is_idempotent() {
    let (backend, client) = setup(&["A"]);
    client.load_conversation("A").await;

    client.close_conversation().await;
    client.close_conversation().await;

    assert_eq!(backend.journal(), vec![subscribed("conv:A"), unsubscribed("conv:A")]);
    assert!(client.active_peer().await.is_none());
    assert!(!client.subscriptions().is_live(ChannelKey::Conversation));
}

#[tokio::test]
async fn test_echo_after_close_is_dropped() {
    let (backend, client) = setup(&["A"]);
    client.load_conversation("A").await;
    client.close_conversation().await;

    backend.insert_message("A", "me", "too late").unwrap();
    sleep(Duration::from_millis(30)).await;
    assert!(client.conversation().await.is_empty());
}

#[tokio::test]
async fn test_start_opens_global_feeds_once() {
    let (backend, client) = setup(&[]);
    client.start().await;
    client.start().await;

    assert_eq!(backend.live_feeds(), 2);
    assert!(client.subscriptions().is_live(ChannelKey::Messages));
    assert!(client.subscriptions().is_live(ChannelKey::Typing));
    assert_eq!(
        backend.journal(),
        vec![
            subscribed("messages"),
            subscribed("typing"),
            unsubscribed("messages"),
            subscribed("messages"),
            unsubscribed("typing"),
            subscribed("typing"),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_releases_every_feed() {
    let (backend, client) = setup(&["A"]);
    client.start().await;
    client.load_conversation("A").await;
    assert_eq!(backend.live_feeds(), 3);

    client.shutdown().await;
    assert_eq!(backend.live_feeds(), 0);
    assert_eq!(client.subscriptions().live_count(), 0);
    assert!(client.active_peer().await.is_none());
}

#[tokio::test]
async fn test_drop_releases_every_feed() {
    let (backend, client) = setup(&["A"]);
    client.start().await;
    client.load_conversation("A").await;
    assert_eq!(backend.live_feeds(), 3);

    drop(client);
    assert_eq!(backend.live_feeds(), 0);
}

#[tokio::test]
async fn test_subscription_failure_leaves_feed_absent() {
    let (backend, client) = setup(&["A"]);
    backend.seed_message("A", "me", "still readable", Utc::now());
    backend.fail_subscriptions(Some("CHANNEL_ERROR"));

    client.start().await;
    let history = client.load_conversation("A").await;

    assert_eq!(history.len(), 1);
    assert_eq!(client.conversation().await.len(), 1);
    assert_eq!(client.subscriptions().live_count(), 0);
    assert_eq!(backend.live_feeds(), 0);
    assert!(!client.loading());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_load_never_orphans_a_feed() {
    let (backend, client) = setup(&["A"]);
    backend.seed_message("A", "me", "hi", Utc::now());
    let client = Arc::new(client);

    for _ in 0..200 {
        let loader = {
            let client = client.clone();
            tokio::spawn(async move {
                client.load_conversation("A").await;
            })
        };
        let closer = {
            let client = client.clone();
            tokio::spawn(async move { client.close_conversation().await })
        };
        loader.await.unwrap();
        closer.await.unwrap();

        // either the load landed after the close or the close won
        match client.active_peer().await {
            Some(peer) => {
                assert_eq!(peer, "A");
                assert_eq!(backend.live_feeds(), 1);
            }
            None => {
                assert_eq!(backend.live_feeds(), 0);
                assert!(client.conversation().await.is_empty());
            }
        }

        client.close_conversation().await;
        assert_eq!(backend.live_feeds(), 0);
    }
}

#[tokio::test]
async fn test_insert_during_startup_fetch_is_kept() {
    let (backend, client) = setup(&["x"]);
    backend.seed_message("x", "me", "older", Utc::now() - chrono::Duration::minutes(1));
    backend.delay_history(Duration::from_millis(100));

    tokio::join!(client.start(), async {
        sleep(Duration::from_millis(20)).await;
        backend.insert_message("x", "me", "during start").unwrap();
    });

    let bodies: Vec<_> = client.messages().await.into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["older", "during start"]);
    assert_eq!(client.inbox().await[0].last.body, "during start");
}
