use crate::compressor::CompressedContext;
use crate::models::{MemoryMessage, User};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

// ============================================================
// User Cache: short-TTL working set for the completion pipeline
// ============================================================
//
// One entry per user: profile + recent memory, refreshed through the
// store on miss. The committer invalidates after every write that
// changes either field, so read-after-write staleness stays inside
// the TTL window at worst.
// ============================================================

#[derive(Debug, Clone)]
pub struct CachedUser {
    pub user: User,
    pub recent_memory: Vec<MemoryMessage>,
    pub fetched_at: Instant,
}

pub struct UserCache {
    ttl: Duration,
    inner: RwLock<HashMap<Uuid, CachedUser>>,
}

impl UserCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for `user_id`, or None when absent/expired.
    /// On None the caller loads from the store and calls `insert`.
    /// Duplicate concurrent loads for the same key may both run.
    pub async fn get(&self, user_id: Uuid) -> Option<CachedUser> {
        let map = self.inner.read().await;
        map.get(&user_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .cloned()
    }

    pub async fn insert(&self, user_id: Uuid, user: User, recent_memory: Vec<MemoryMessage>) {
        let mut map = self.inner.write().await;
        map.insert(
            user_id,
            CachedUser {
                user,
                recent_memory,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop the entry so the next read observes committed writes.
    pub async fn invalidate(&self, user_id: Uuid) {
        let mut map = self.inner.write().await;
        map.remove(&user_id);
    }
}

impl Default for UserCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

// ============================================================
// Compression Cache: a bounded LRU of compressed contexts
// ============================================================

struct CompressionEntry {
    value: CompressedContext,
    last_used: u64,
}

pub struct CompressionCache {
    capacity: usize,
    clock: Mutex<u64>,
    inner: Mutex<HashMap<String, CompressionEntry>>,
}

impl CompressionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: Mutex::new(0),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key over everything that shapes the output. Complexity is
    /// quantized to one decimal, matching the compressor's own rounding.
    pub fn key(user_id: Uuid, message_type: &str, complexity: f64, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(message_type.as_bytes());
        hasher.update(format!("{:.1}", complexity).as_bytes());
        hasher.update(model.as_bytes());
        let hash = hex::encode(hasher.finalize());
        format!("cmp:{}", &hash[..16])
    }

    pub fn get(&self, key: &str) -> Option<CompressedContext> {
        let tick = self.tick();
        let mut map = self.inner.lock().unwrap();
        map.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    pub fn insert(&self, key: String, value: CompressedContext) {
        let tick = self.tick();
        let mut map = self.inner.lock().unwrap();
        map.insert(key, CompressionEntry { value, last_used: tick });

        // Evict the coldest entries once over capacity.
        while map.len() > self.capacity {
            if let Some(coldest) = map
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                map.remove(&coldest);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock().unwrap();
        *clock += 1;
        *clock
    }
}

impl Default for CompressionCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{CompressedContext, CompressionMetadata, Strategy};
    use chrono::Utc;

    fn test_user(id: Uuid) -> User {
        User {
            id,
            email: "t@example.com".to_string(),
            password_hash: "x".to_string(),
            profile: HashMap::new(),
            emotional_log: vec![],
            subscribed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_compressed(text: &str) -> CompressedContext {
        CompressedContext {
            text: text.to_string(),
            metadata: CompressionMetadata {
                strategy: Strategy::Balanced,
                budget: 100,
                estimated_tokens: 10,
                ratio: 0.1,
                fallback: false,
                version: "v1".to_string(),
            },
        }
    }

    mod user_cache_tests {
        use super::*;

        #[tokio::test]
        async fn miss_then_hit() {
            let cache = UserCache::default();
            let id = Uuid::new_v4();
            assert!(cache.get(id).await.is_none());

            cache.insert(id, test_user(id), vec![]).await;
            let entry = cache.get(id).await.unwrap();
            assert_eq!(entry.user.id, id);
        }

        #[tokio::test]
        async fn expired_entry_is_a_miss() {
            let cache = UserCache::new(Duration::from_millis(10));
            let id = Uuid::new_v4();
            cache.insert(id, test_user(id), vec![]).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(cache.get(id).await.is_none());
        }

        #[tokio::test]
        async fn invalidate_removes_entry() {
            let cache = UserCache::default();
            let id = Uuid::new_v4();
            cache.insert(id, test_user(id), vec![]).await;
            cache.invalidate(id).await;
            assert!(cache.get(id).await.is_none());
        }
    }

    mod compression_cache_tests {
        use super::*;

        #[test]
        fn key_is_stable_and_input_sensitive() {
            let id = Uuid::new_v4();
            let a = CompressionCache::key(id, "question", 5.0, "solace-chat");
            let b = CompressionCache::key(id, "question", 5.0, "solace-chat");
            let c = CompressionCache::key(id, "question", 5.1, "solace-chat");
            assert_eq!(a, b);
            assert_ne!(a, c);
        }

        #[test]
        fn evicts_least_recently_used() {
            let cache = CompressionCache::new(2);
            cache.insert("a".to_string(), test_compressed("a"));
            cache.insert("b".to_string(), test_compressed("b"));
            // Touch "a" so "b" is the coldest.
            cache.get("a").unwrap();
            cache.insert("c".to_string(), test_compressed("c"));

            assert_eq!(cache.len(), 2);
            assert!(cache.get("a").is_some());
            assert!(cache.get("b").is_none());
            assert!(cache.get("c").is_some());
        }
    }
}
