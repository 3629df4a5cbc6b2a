//! In-process store: hash maps behind a tokio lock, one broadcast channel
//! per topic.
//!
//! Expiry is checked lazily on access, which is enough for presence markers.
//! Used for single-process deployments and throughout the test suite.

use super::{Store, StoreError, StoreFuture, StoreResult, Subscription};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// Per-topic broadcast capacity; slower subscribers see `Lagged`.
const TOPIC_CAPACITY: usize = 1024;

struct KeyEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

fn live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |t| t > now)
}

#[derive(Default)]
struct State {
    keys: HashMap<String, KeyEntry>,
    /// Oldest entry first.
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, SetEntry>,
    topics: HashMap<String, broadcast::Sender<String>>,
}

impl State {
    fn live_set_mut(&mut self, key: &str, now: Instant) -> Option<&mut SetEntry> {
        let expired = self
            .sets
            .get(key)
            .is_some_and(|s| !live(s.expires_at, now));
        if expired {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }
}

/// Store backed by process memory.
pub struct MemoryStore {
    state: RwLock<State>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    /// While unavailable every operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(available, "memory store availability changed");
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            if let Some(sender) = state.topics.get(topic) {
                if sender.send(payload.to_string()).is_err() {
                    // Every subscriber is gone; forget the topic.
                    state.topics.remove(topic);
                }
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> StoreFuture<'a, Subscription> {
        Box::pin(async move {
            self.check()?;
            let mut rx = {
                let mut state = self.state.write().await;
                state
                    .topics
                    .entry(topic.to_string())
                    .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                    .subscribe()
            };

            let (tx, queue) = Subscription::channel();
            let topic_name = topic.to_string();
            let pump = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(topic = %topic_name, skipped = n, "subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            Ok(Subscription::new(topic.to_string(), queue, pump))
        })
    }

    fn append<'a>(&'a self, key: &'a str, payload: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            let list = state.lists.entry(key.to_string()).or_default();
            list.push(payload.to_string());
            Ok(list.len() as u64)
        })
    }

    fn range<'a>(&'a self, key: &'a str, offset: u64, limit: u64) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.read().await;
            Ok(state
                .lists
                .get(key)
                .map(|list| {
                    list.iter()
                        .rev()
                        .skip(offset as usize)
                        .take(limit as usize)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.read().await;
            Ok(state.lists.get(key).map_or(0, |l| l.len() as u64))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let state = self.state.read().await;
            Ok(state
                .keys
                .get(key)
                .filter(|e| live(e.expires_at, now))
                .map(|e| e.value.clone()))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            state.keys.insert(
                key.to_string(),
                KeyEntry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
            Ok(())
        })
    }

    fn set_nx<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut state = self.state.write().await;
            if state.keys.get(key).is_some_and(|e| live(e.expires_at, now)) {
                return Ok(false);
            }
            state.keys.insert(
                key.to_string(),
                KeyEntry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
            Ok(true)
        })
    }

    fn set_with_ttl<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            state.keys.insert(
                key.to_string(),
                KeyEntry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let state = self.state.read().await;
            Ok(state.keys.get(key).is_some_and(|e| live(e.expires_at, now))
                || state.lists.get(key).is_some_and(|l| !l.is_empty())
                || state
                    .sets
                    .get(key)
                    .is_some_and(|s| live(s.expires_at, now) && !s.members.is_empty()))
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            state.keys.remove(key);
            state.lists.remove(key);
            state.sets.remove(key);
            Ok(())
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let deadline = Some(now + ttl);
            let mut state = self.state.write().await;
            if let Some(entry) = state.keys.get_mut(key).filter(|e| live(e.expires_at, now)) {
                entry.expires_at = deadline;
                return Ok(true);
            }
            if let Some(set) = state.live_set_mut(key, now) {
                set.expires_at = deadline;
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut state = self.state.write().await;
            // Drop an expired set first so the new member starts a fresh one.
            state.live_set_mut(key, now);
            state
                .sets
                .entry(key.to_string())
                .or_default()
                .members
                .insert(member.to_string());
            Ok(())
        })
    }

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut state = self.state.write().await;
            let remaining = match state.live_set_mut(key, now) {
                Some(set) => {
                    set.members.remove(member);
                    set.members.len() as u64
                }
                None => 0,
            };
            if remaining == 0 {
                state.sets.remove(key);
            }
            Ok(remaining)
        })
    }

    fn set_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let state = self.state.read().await;
            Ok(state
                .sets
                .get(key)
                .filter(|s| live(s.expires_at, now))
                .map_or(0, |s| s.members.len() as u64))
        })
    }
}
