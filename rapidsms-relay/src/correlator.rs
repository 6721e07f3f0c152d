//! Reply correlation.
//!
//! When replies are enabled every inbound message forwarded to the remote
//! system is remembered for `vumi_reply_timeout` seconds, so that a later
//! outbound request carrying `in_reply_to` can be sent as a reply to it.

use crate::config::RedisManagerConfig;
use crate::errors::StoreError;
use crate::message::Message;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const KEY_PREFIX: &str = "pending_reply";
const MEMORY_STORE_CAPACITY: u64 = 100_000;

/// What is kept of an inbound message so a reply can be validated and built.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PendingReply {
    pub message_id: String,
    pub from_addr: String,
    pub to_addr: String,
    #[serde(default)]
    pub transport_name: Option<String>,
    #[serde(default)]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub helper_metadata: Map<String, Value>,
}

impl PendingReply {
    /// Builds the reply: addresses swapped, `in_reply_to` pointing at the
    /// original, transport details carried over.
    pub fn reply(&self, content: &str) -> Message {
        let mut reply = Message::new(&self.from_addr, &self.to_addr, content)
            .with_transport_name(self.transport_name.clone());
        reply.in_reply_to = Some(self.message_id.clone());
        reply.transport_type = self.transport_type.clone();
        reply.helper_metadata = self.helper_metadata.clone();
        reply
    }
}

impl From<&Message> for PendingReply {
    fn from(message: &Message) -> Self {
        PendingReply {
            message_id: message.message_id.clone(),
            from_addr: message.from_addr.clone(),
            to_addr: message.to_addr.clone(),
            transport_name: message.transport_name.clone(),
            transport_type: message.transport_type.clone(),
            helper_metadata: message.helper_metadata.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CorrelationError {
    #[error("no pending reply for message {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Expiring key-value store.
#[async_trait]
pub trait ReplyStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Removes the entry and returns it with the time it had left. Of any
    /// number of concurrent calls for one key, at most one gets the value.
    async fn take(&self, key: &str) -> Result<Option<(String, Duration)>, StoreError>;

    /// Releases the underlying connection. Later calls fail with
    /// [`StoreError::Closed`].
    async fn close(&self);
}

#[derive(Clone)]
struct StoredValue {
    value: String,
    ttl: Duration,
    expires_at: Instant,
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store for single instance deployments and tests.
pub struct MemoryStore {
    cache: Cache<String, StoredValue>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(MEMORY_STORE_CAPACITY)
            .expire_after(PerEntryTtl)
            .build();

        MemoryStore {
            cache,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        match self.closed.load(Ordering::Acquire) {
            true => Err(StoreError::Closed),
            false => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplyStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.check_open()?;
        let stored = StoredValue {
            value,
            ttl,
            expires_at: Instant::now() + ttl,
        };
        self.cache.insert(key.to_string(), stored).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_open()?;
        // Eviction is lazy, so check the deadline here as well
        Ok(self
            .cache
            .get(key)
            .await
            .filter(|stored| stored.expires_at > Instant::now())
            .map(|stored| stored.value))
    }

    async fn take(&self, key: &str) -> Result<Option<(String, Duration)>, StoreError> {
        self.check_open()?;
        let now = Instant::now();
        Ok(self
            .cache
            .remove(key)
            .await
            .filter(|stored| stored.expires_at > now)
            .map(|stored| (stored.value, stored.expires_at - now)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cache.invalidate_all();
    }
}

/// Redis backed store, shared by every relay instance using the same server
/// and key prefix.
pub struct RedisStore {
    conn: Mutex<Option<ConnectionManager>>,
    key_prefix: String,
}

impl RedisStore {
    pub async fn connect(config: &RedisManagerConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(key_prefix = %config.key_prefix, "connected to redis");
        Ok(RedisStore {
            conn: Mutex::new(Some(conn)),
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Closed)?
            .clone()
            .ok_or(StoreError::Closed)
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl ReplyStore for RedisStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        // SET EX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(self.key(key), value, seconds).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        Ok(conn.get(self.key(key)).await?)
    }

    async fn take(&self, key: &str) -> Result<Option<(String, Duration)>, StoreError> {
        let mut conn = self.connection()?;
        let key = self.key(key);
        let (ttl, value): (i64, Option<String>) = redis::pipe()
            .atomic()
            .ttl(&key)
            .get_del(&key)
            .query_async(&mut conn)
            .await?;
        // TTL is negative for keys without expiry
        let remaining = Duration::from_secs(ttl.max(1) as u64);
        Ok(value.map(|value| (value, remaining)))
    }

    async fn close(&self) {
        if let Ok(mut conn) = self.conn.lock() {
            conn.take();
        }
    }
}

/// A pending reply taken out of the store by [`ReplyCorrelator::claim`].
#[derive(Clone, Debug)]
pub struct ClaimedReply {
    pub pending: PendingReply,
    remaining: Duration,
}

/// Remembers forwarded messages and looks them up again for replies.
#[derive(Clone)]
pub struct ReplyCorrelator {
    store: Arc<dyn ReplyStore>,
}

impl ReplyCorrelator {
    pub fn new(store: Arc<dyn ReplyStore>) -> Self {
        Self { store }
    }

    pub async fn remember(&self, message: &Message, ttl: Duration) -> Result<(), StoreError> {
        let entry = serde_json::to_string(&PendingReply::from(message))?;
        self.store
            .set_ex(&store_key(&message.message_id), entry, ttl)
            .await
    }

    pub async fn recall(&self, message_id: &str) -> Result<PendingReply, CorrelationError> {
        let raw = self
            .store
            .get(&store_key(message_id))
            .await?
            .ok_or_else(|| CorrelationError::NotFound(message_id.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| CorrelationError::Store(e.into()))
    }

    /// Takes the entry out of the store so no other reply can use it.
    pub async fn claim(&self, message_id: &str) -> Result<ClaimedReply, CorrelationError> {
        let (raw, remaining) = self
            .store
            .take(&store_key(message_id))
            .await?
            .ok_or_else(|| CorrelationError::NotFound(message_id.to_string()))?;
        let pending = serde_json::from_str(&raw).map_err(|e| CorrelationError::Store(e.into()))?;
        Ok(ClaimedReply { pending, remaining })
    }

    /// Puts a claimed entry back for whatever time it had left.
    pub async fn restore(&self, claimed: &ClaimedReply) -> Result<(), StoreError> {
        let entry = serde_json::to_string(&claimed.pending)?;
        self.store
            .set_ex(&store_key(&claimed.pending.message_id), entry, claimed.remaining)
            .await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn store_key(message_id: &str) -> String {
    format!("{KEY_PREFIX}:{message_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> Message {
        let mut msg = Message::new("1234", "+27831234567", "hi");
        msg.transport_type = Some("sms".into());
        msg.transport_name = Some("sms_transport".into());
        msg
    }

    fn correlator() -> ReplyCorrelator {
        ReplyCorrelator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_remember_and_recall() {
        let correlator = correlator();
        let msg = inbound();
        correlator
            .remember(&msg, Duration::from_secs(60))
            .await
            .unwrap();

        let pending = correlator.recall(&msg.message_id).await.unwrap();
        assert_eq!(pending, PendingReply::from(&msg));
    }

    #[tokio::test]
    async fn test_unknown_key_not_found() {
        let result = correlator().recall("missing").await;
        assert!(matches!(result, Err(CorrelationError::NotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_expired_entry_not_found() {
        let correlator = correlator();
        let msg = inbound();
        correlator
            .remember(&msg, Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(matches!(
            correlator.recall(&msg.message_id).await,
            Err(CorrelationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_consumes_entry() {
        let correlator = correlator();
        let msg = inbound();
        correlator
            .remember(&msg, Duration::from_secs(60))
            .await
            .unwrap();

        let claimed = correlator.claim(&msg.message_id).await.unwrap();
        assert_eq!(claimed.pending, PendingReply::from(&msg));
        assert!(claimed.remaining <= Duration::from_secs(60));

        assert!(matches!(
            correlator.claim(&msg.message_id).await,
            Err(CorrelationError::NotFound(_))
        ));
        assert!(correlator.recall(&msg.message_id).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let correlator = correlator();
        let msg = inbound();
        correlator
            .remember(&msg, Duration::from_secs(60))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            correlator.claim(&msg.message_id),
            correlator.claim(&msg.message_id)
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn test_restore_keeps_remaining_ttl() {
        let correlator = correlator();
        let msg = inbound();
        correlator
            .remember(&msg, Duration::from_millis(200))
            .await
            .unwrap();

        let claimed = correlator.claim(&msg.message_id).await.unwrap();
        correlator.restore(&claimed).await.unwrap();
        assert!(correlator.recall(&msg.message_id).await.is_ok());

        // Not extended past the original deadline
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(correlator.recall(&msg.message_id).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_store() {
        let correlator = correlator();
        correlator.close().await;
        assert!(matches!(
            correlator.remember(&inbound(), Duration::from_secs(1)).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            correlator.recall("m1").await,
            Err(CorrelationError::Store(StoreError::Closed))
        ));
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let msg = inbound();
        let reply = PendingReply::from(&msg).reply("thanks");

        assert_eq!(reply.to_addr, msg.from_addr);
        assert_eq!(reply.from_addr, msg.to_addr);
        assert_eq!(reply.in_reply_to.as_deref(), Some(msg.message_id.as_str()));
        assert_eq!(reply.content.as_deref(), Some("thanks"));
        assert_eq!(reply.transport_name, msg.transport_name);
        assert_eq!(reply.transport_type, msg.transport_type);
        assert_ne!(reply.message_id, msg.message_id);
    }
}
