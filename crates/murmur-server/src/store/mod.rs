//! Backing store contract and adapters.
//!
//! Every component receives an `Arc<dyn Store>` at construction; nothing in
//! the server reaches for a global connection. Both adapters must be safe to
//! call concurrently from any number of sessions.

pub mod memory;
pub mod redis_store;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store returned malformed data: {0}")]
    Corrupt(String),
}

impl From<StoreError> for murmur_core::MurmurError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => murmur_core::MurmurError::StoreUnavailable(e.to_string()),
            StoreError::Corrupt(_) => murmur_core::MurmurError::Other(e.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future returned by store operations (keeps the trait object-safe).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Buffered payloads per subscription before the forwarding task waits.
const SUBSCRIPTION_BUFFER: usize = 256;

/// A live subscription to one pub/sub topic.
///
/// Payloads are pumped by a background task into a bounded queue. Dropping
/// the subscription aborts the pump, which releases the underlying store
/// subscription.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<String>,
    pump: JoinHandle<()>,
}

impl Subscription {
    /// Wrap a pump task that feeds `rx`.
    pub(crate) fn new(topic: String, rx: mpsc::Receiver<String>, pump: JoinHandle<()>) -> Self {
        Self { topic, rx, pump }
    }

    /// Create the queue a pump task writes into.
    pub(crate) fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(SUBSCRIPTION_BUFFER)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload published on the topic, or `None` once the store side
    /// has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Operations the messaging core needs from the shared key-value store.
pub trait Store: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &'static str;

    // ── pub/sub ────────────────────────────────────────────────────────

    /// PUBLISH: deliver `payload` to every current subscriber of `topic`.
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a str) -> StoreFuture<'a, ()>;

    /// SUBSCRIBE: resolves once the subscription is active, so anything
    /// published afterwards is observed.
    fn subscribe<'a>(&'a self, topic: &'a str) -> StoreFuture<'a, Subscription>;

    // ── ordered lists ──────────────────────────────────────────────────

    /// APPEND: add `payload` at the newest end of the list. Returns the new length.
    fn append<'a>(&'a self, key: &'a str, payload: &'a str) -> StoreFuture<'a, u64>;

    /// RANGE: up to `limit` entries, newest first, skipping `offset` newest entries.
    fn range<'a>(&'a self, key: &'a str, offset: u64, limit: u64) -> StoreFuture<'a, Vec<String>>;

    /// LEN: number of entries in the list (0 if absent).
    fn len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    // ── keys ───────────────────────────────────────────────────────────

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()>;

    /// SET-IF-ABSENT: returns `true` if the key was created.
    fn set_nx<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, bool>;

    /// SET-WITH-TTL: overwrite `key` and (re)arm its expiry.
    fn set_with_ttl<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
        -> StoreFuture<'a, ()>;

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// EXPIRE: (re)arm the expiry of an existing key. Returns `false` if absent.
    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool>;

    // ── unordered sets ─────────────────────────────────────────────────

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()>;

    /// Remove `member`; returns how many members remain.
    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, u64>;

    fn set_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;
}
