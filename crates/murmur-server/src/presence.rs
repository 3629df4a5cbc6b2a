//! Presence registry.
//!
//! A user is online while `presence:{user}` exists. The marker carries a TTL
//! that every live session refreshes from its heartbeat, so a crashed server
//! cannot leave users online forever. `presence:{user}:sessions` holds the
//! IDs of the user's live sessions; the marker is only cleared by the last one.

use crate::store::Store;
use murmur_core::MurmurResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn marker_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

fn sessions_key(user_id: &str) -> String {
    format!("presence:{user_id}:sessions")
}

#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl Presence {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// How often a session should call [`Presence::mark_online`] to keep its
    /// user's marker alive.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(10))
    }

    /// Register `session_id` for `user_id` and (re)arm the marker. Idempotent,
    /// so it doubles as the heartbeat.
    pub async fn mark_online(&self, user_id: &str, session_id: &str) -> MurmurResult<()> {
        let sessions = sessions_key(user_id);
        self.store.set_add(&sessions, session_id).await?;
        self.store.expire(&sessions, self.ttl).await?;
        self.store
            .set_with_ttl(&marker_key(user_id), session_id, self.ttl)
            .await?;
        Ok(())
    }

    /// Drop `session_id`; clears the marker if no other session remains.
    pub async fn mark_offline(&self, user_id: &str, session_id: &str) -> MurmurResult<()> {
        let sessions = sessions_key(user_id);
        let remaining = self.store.set_remove(&sessions, session_id).await?;
        if remaining > 0 {
            debug!(user_id, remaining, "user still has live sessions");
            return Ok(());
        }

        let marker = marker_key(user_id);
        self.store.del(&marker).await?;

        // A session may have registered between the removal and the delete.
        if self.store.set_len(&sessions).await? > 0 {
            self.store.set_with_ttl(&marker, "", self.ttl).await?;
        } else {
            debug!(user_id, "user offline");
        }
        Ok(())
    }

    pub async fn is_online(&self, user_id: &str) -> MurmurResult<bool> {
        Ok(self.store.exists(&marker_key(user_id)).await?)
    }
}
