//! Channel directory: channel addressing, history persistence and topic fan-out.
//!
//! A private channel is named by the sha256 of its two participants (sorted),
//! so both sides resolve the same ID without coordination. Each channel owns
//! two store keys: an ordered message list and a pub/sub topic.

use crate::store::{Store, Subscription};
use murmur_core::{ChatMessage, MurmurError, MurmurResult, ServerEnvelope, SysEvent, PUBLIC_CHANNEL};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

fn topic_key(channel: &str) -> String {
    format!("channel:{channel}:events")
}

fn history_key(channel: &str) -> String {
    format!("channel:{channel}:messages")
}

/// Map a pair of participants to their channel ID.
///
/// Symmetric in its arguments; if either side is empty the result is the
/// public channel.
pub fn resolve_channel(a: &str, b: &str) -> String {
    if a.is_empty() || b.is_empty() {
        return PUBLIC_CHANNEL.to_string();
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update([0u8]);
    hasher.update(hi.as_bytes());
    hex::encode(hasher.finalize())
}

/// What travels over a channel topic: the envelope every subscriber forwards,
/// tagged with the session that produced it so that session can skip its own
/// events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub origin: String,
    pub envelope: ServerEnvelope,
}

impl ChannelEvent {
    pub fn decode(payload: &str) -> MurmurResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

pub struct ChannelDirectory {
    store: Arc<dyn Store>,
    max_page: i64,
}

impl ChannelDirectory {
    pub fn new(store: Arc<dyn Store>, max_page: i64) -> Self {
        Self { store, max_page }
    }

    /// Subscribe to the channel's topic. Events published after this returns
    /// are delivered to the subscription.
    pub async fn join(&self, channel: &str) -> MurmurResult<Subscription> {
        let sub = self.store.subscribe(&topic_key(channel)).await?;
        debug!(channel, "subscribed");
        Ok(sub)
    }

    /// Persist `message` in its channel's history, then fan it out.
    /// Returns the channel ID.
    pub async fn publish(&self, message: &ChatMessage, origin: &str) -> MurmurResult<String> {
        let channel = resolve_channel(&message.sender, &message.recipient);
        let record = serde_json::to_string(message)?;
        self.store.append(&history_key(&channel), &record).await?;

        let event = ChannelEvent {
            origin: origin.to_string(),
            envelope: ServerEnvelope::ChannelMessage {
                channel_message: message.clone(),
            },
        };
        self.store
            .publish(&topic_key(&channel), &serde_json::to_string(&event)?)
            .await?;
        debug!(channel = %channel, message_id = %message.id, "message published");
        Ok(channel)
    }

    /// Fan out a non-persisted system event on `channel`.
    pub async fn announce(&self, channel: &str, origin: &str, event: SysEvent) -> MurmurResult<()> {
        let event = ChannelEvent {
            origin: origin.to_string(),
            envelope: ServerEnvelope::Sys { sys: event },
        };
        self.store
            .publish(&topic_key(channel), &serde_json::to_string(&event)?)
            .await?;
        Ok(())
    }

    /// Up to `limit` messages, newest first, skipping the `offset` newest.
    /// `limit` is capped at the configured page size. Returns the page and
    /// the channel's total message count.
    pub async fn history(
        &self,
        channel: &str,
        offset: i64,
        limit: i64,
    ) -> MurmurResult<(Vec<ChatMessage>, u64)> {
        if limit <= 0 {
            return Err(MurmurError::InvalidArgument("limit must be positive".into()));
        }
        if offset < 0 {
            return Err(MurmurError::InvalidArgument("offset must not be negative".into()));
        }
        let limit = limit.min(self.max_page);

        let key = history_key(channel);
        let total = self.store.len(&key).await?;
        let raw = self.store.range(&key, offset as u64, limit as u64).await?;

        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<ChatMessage>(&entry) {
                Ok(m) => messages.push(m),
                Err(e) => warn!(channel, error = %e, "skipping unreadable history entry"),
            }
        }
        Ok((messages, total))
    }

    /// Effective page size for a requested `limit`.
    pub fn page_limit(&self, limit: i64) -> i64 {
        limit.min(self.max_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn message(id: &str, sender: &str, recipient: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    fn directory() -> ChannelDirectory {
        ChannelDirectory::new(Arc::new(MemoryStore::new()), 100)
    }

    #[test]
    fn resolve_is_symmetric() {
        assert_eq!(resolve_channel("alice", "bob"), resolve_channel("bob", "alice"));
        assert_ne!(resolve_channel("alice", "bob"), resolve_channel("alice", "carol"));
        assert_eq!(resolve_channel("alice", "bob").len(), 64);
    }

    #[test]
    fn empty_side_is_public() {
        assert_eq!(resolve_channel("alice", ""), PUBLIC_CHANNEL);
        assert_eq!(resolve_channel("", "bob"), PUBLIC_CHANNEL);
        assert_eq!(resolve_channel("", ""), PUBLIC_CHANNEL);
    }

    #[test]
    fn separator_prevents_concatenation_clash() {
        assert_ne!(resolve_channel("ab", "c"), resolve_channel("a", "bc"));
    }

    #[tokio::test]
    async fn publish_then_history() {
        let dir = directory();
        let m = message("m1", "alice", "bob", "hello");
        let channel = dir.publish(&m, "s1").await.unwrap();
        assert_eq!(channel, resolve_channel("bob", "alice"));

        let (page, total) = dir.history(&channel, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(page, vec![m]);
    }

    #[tokio::test]
    async fn history_pages_from_newest() {
        let dir = directory();
        for i in 1..=3 {
            dir.publish(&message(&format!("m{i}"), "alice", "", "x"), "s1")
                .await
                .unwrap();
        }
        let (page, total) = dir.history(PUBLIC_CHANNEL, 0, 2).await.unwrap();
        assert_eq!(total, 3);
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2"]);

        let (page, _) = dir.history(PUBLIC_CHANNEL, 2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "m1");

        let (page, total) = dir.history(PUBLIC_CHANNEL, 3, 2).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn history_rejects_bad_bounds() {
        let dir = directory();
        assert!(matches!(
            dir.history(PUBLIC_CHANNEL, 0, 0).await,
            Err(MurmurError::InvalidArgument(_))
        ));
        assert!(matches!(
            dir.history(PUBLIC_CHANNEL, -1, 5).await,
            Err(MurmurError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn history_limit_is_capped() {
        let dir = ChannelDirectory::new(Arc::new(MemoryStore::new()), 2);
        for i in 0..5 {
            dir.publish(&message(&i.to_string(), "a", "", "x"), "s")
                .await
                .unwrap();
        }
        let (page, total) = dir.history(PUBLIC_CHANNEL, 0, 50).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);
        assert_eq!(dir.page_limit(50), 2);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let dir = directory();
        let mut sub = dir.join(PUBLIC_CHANNEL).await.unwrap();

        dir.publish(&message("m1", "alice", "", "one"), "s1")
            .await
            .unwrap();
        dir.announce(
            PUBLIC_CHANNEL,
            "s2",
            SysEvent::SignIn {
                user_id: "u2".into(),
                username: "bob".into(),
            },
        )
        .await
        .unwrap();

        let first = ChannelEvent::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(first.origin, "s1");
        assert_eq!(first.envelope.kind(), "channelMessage");

        let second = ChannelEvent::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(second.origin, "s2");
        assert_eq!(second.envelope.kind(), "sys");
    }

    #[tokio::test]
    async fn unreachable_store_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let dir = ChannelDirectory::new(store.clone(), 10);
        store.set_available(false);
        let err = dir.join(PUBLIC_CHANNEL).await.err().unwrap();
        assert!(matches!(err, MurmurError::StoreUnavailable(_)));
    }
}
