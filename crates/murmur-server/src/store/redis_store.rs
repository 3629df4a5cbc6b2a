//! Redis adapter.
//!
//! Commands go through a shared `ConnectionManager` (reconnects on its own);
//! every subscription opens a dedicated pub/sub connection whose pump task
//! owns it. Lists are pushed at the head, so `LRANGE 0..n` is newest first.

use super::{Store, StoreError, StoreFuture, StoreResult, Subscription};
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{debug, info, warn};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        match e.kind() {
            redis::ErrorKind::TypeError => StoreError::Corrupt(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

/// Store backed by a Redis server.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis (`redis://` or `rediss://` URL).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(url, "connected to redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let receivers: i64 = self.conn().publish(topic, payload).await?;
            debug!(topic, receivers, "published");
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> StoreFuture<'a, Subscription> {
        Box::pin(async move {
            let mut pubsub = self.client.get_async_pubsub().await?;
            // Resolves after the server confirms the subscription.
            pubsub.subscribe(topic).await?;

            let (tx, queue) = Subscription::channel();
            let topic_name = topic.to_string();
            let pump = tokio::spawn(async move {
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(topic = %topic_name, error = %e, "dropping non-text payload");
                            continue;
                        }
                    };
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
                debug!(topic = %topic_name, "redis subscription closed");
            });

            Ok(Subscription::new(topic.to_string(), queue, pump))
        })
    }

    fn append<'a>(&'a self, key: &'a str, payload: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let len: u64 = self.conn().lpush(key, payload).await?;
            Ok(len)
        })
    }

    fn range<'a>(&'a self, key: &'a str, offset: u64, limit: u64) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(Vec::new());
            }
            let start = offset as isize;
            let stop = (offset + limit - 1) as isize;
            let items: Vec<String> = self.conn().lrange(key, start, stop).await?;
            Ok(items)
        })
    }

    fn len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let len: u64 = self.conn().llen(key).await?;
            Ok(len)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let value: Option<String> = self.conn().get(key).await?;
            Ok(value)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _: () = self.conn().set(key, value).await?;
            Ok(())
        })
    }

    fn set_nx<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let created: bool = self.conn().set_nx(key, value).await?;
            Ok(created)
        })
    }

    fn set_with_ttl<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _: () = self.conn().pset_ex(key, value, millis(ttl)).await?;
            Ok(())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let found: bool = self.conn().exists(key).await?;
            Ok(found)
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _: i64 = self.conn().del(key).await?;
            Ok(())
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let armed: bool = self.conn().pexpire(key, millis(ttl) as i64).await?;
            Ok(armed)
        })
    }

    fn set_add<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _: i64 = self.conn().sadd(key, member).await?;
            Ok(())
        })
    }

    fn set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn();
            let _: i64 = conn.srem(key, member).await?;
            let remaining: u64 = conn.scard(key).await?;
            Ok(remaining)
        })
    }

    fn set_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let len: u64 = self.conn().scard(key).await?;
            Ok(len)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests need a running Redis:
    //   docker run -d -p 6379:6379 redis:7
    const URL: &str = "redis://127.0.0.1:6379";

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn list_range_newest_first() {
        let store = RedisStore::connect(URL).await.unwrap();
        store.del("murmur:test:list").await.unwrap();
        for i in 1..=4 {
            store.append("murmur:test:list", &format!("m{i}")).await.unwrap();
        }
        assert_eq!(store.len("murmur:test:list").await.unwrap(), 4);
        assert_eq!(
            store.range("murmur:test:list", 1, 2).await.unwrap(),
            vec!["m3", "m2"]
        );
        store.del("murmur:test:list").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn ttl_and_sets() {
        let store = RedisStore::connect(URL).await.unwrap();
        store
            .set_with_ttl("murmur:test:ttl", "1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.exists("murmur:test:ttl").await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!store.exists("murmur:test:ttl").await.unwrap());

        store.set_add("murmur:test:set", "a").await.unwrap();
        store.set_add("murmur:test:set", "b").await.unwrap();
        assert_eq!(store.set_remove("murmur:test:set", "a").await.unwrap(), 1);
        assert_eq!(store.set_remove("murmur:test:set", "b").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn pubsub_roundtrip() {
        let store = RedisStore::connect(URL).await.unwrap();
        let mut sub = store.subscribe("murmur:test:topic").await.unwrap();
        store.publish("murmur:test:topic", "hello").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
    }
}
