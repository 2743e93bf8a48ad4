/// Inbox derivation: one entry per peer holding the latest message exchanged
use crate::messenger_types::{InboxEntry, Message};
use std::collections::HashMap;

/// Group `messages` by the peer seen from `me` and keep the most recent one.
///
/// Messages `me` neither sent nor received are skipped. Equal timestamps resolve to the later message in input order. Entries are
/// returned newest first.
pub fn derive_inbox(messages: &[Message], me: &str) -> Vec<InboxEntry> {
    let mut latest: HashMap<&str, &Message> = HashMap::new();
    for msg in messages.iter().filter(|m| m.involves(me)) {
        let peer = msg.peer_of(me);
        match latest.get(peer) {
            Some(existing) if existing.created_at > msg.created_at => {}
            _ => {
                latest.insert(peer, msg);
            }
        }
    }

    let mut entries: Vec<InboxEntry> = latest
        .into_iter()
        .map(|(peer, last)| InboxEntry {
            peer_id: peer.to_string(),
            peer: last.peer_info_of(me).cloned(),
            last: last.clone(),
        })
        .collect();
    entries.sort_by(|a, b| {
        b.last
            .created_at
            .cmp(&a.last.created_at)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
    entries
}
