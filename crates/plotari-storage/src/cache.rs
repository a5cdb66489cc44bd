//! Two-tier conversation cache.
//!
//! The memory tier is a bounded LRU map guarded by one mutex. The durable
//! tier is any [`ConversationStore`]. Writes go to memory first and then
//! to the store with bounded retries; a write the store keeps rejecting is
//! held for reconciliation instead of failing the turn.
//!
//! Expiry is logical on read: an entry past `expires_at` is never returned,
//! whether or not [`ConversationCache::sweep`] has physically removed it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use plotari_core::config::CacheConfig;
use plotari_core::error::{PlotariError, ProviderError};
use plotari_core::retry::RetryPolicy;
use plotari_core::types::{Conversation, ConversationKey};

use crate::error::{CacheError, Result};
use crate::store::ConversationStore;

/// Where a cached conversation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Written by this process.
    Memory,
    /// Repopulated from the durable store after a memory miss.
    Durable,
}

/// A conversation held in the memory tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub conversation: Conversation,
    pub tier: Tier,
    pub inserted_at: DateTime<Utc>,
    /// Logical access clock; the smallest value is evicted first.
    last_access: u64,
}

/// Outcome of a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    /// Both tiers hold the new state.
    Durable,
    /// Only the memory tier holds it; the key awaits reconciliation.
    MemoryOnly { reason: String },
}

impl Persistence {
    pub fn is_durable(&self) -> bool {
        matches!(self, Persistence::Durable)
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub capacity: usize,
    pub pending_reconciliation: usize,
}

struct MemoryTier {
    entries: HashMap<ConversationKey, CacheEntry>,
    clock: u64,
}

impl MemoryTier {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded in-process cache in front of a durable conversation store.
pub struct ConversationCache {
    memory: Mutex<MemoryTier>,
    pending: Mutex<HashMap<ConversationKey, Conversation>>,
    store: Arc<dyn ConversationStore>,
    capacity: usize,
    store_timeout: Duration,
    retry: RetryPolicy,
}

impl ConversationCache {
    pub fn new(store: Arc<dyn ConversationStore>, config: &CacheConfig) -> Self {
        Self {
            memory: Mutex::new(MemoryTier {
                entries: HashMap::new(),
                clock: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            store,
            capacity: config.memory_capacity.max(1),
            store_timeout: config.store_timeout(),
            retry: config.write_retry.policy(),
        }
    }

    /// The live conversation for `key`, if any.
    ///
    /// A memory miss first checks writes awaiting reconciliation, then
    /// falls through to the durable store with bounded retries and
    /// repopulates the memory tier on a hit. Expired conversations read as
    /// absent.
    pub async fn get(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let now = Utc::now();
        if let Some(found) = self.resident(key, now)? {
            return Ok(found);
        }

        // An evicted entry whose durable write failed is newer than the store.
        let queued = self.pending()?.get(key).cloned();
        if let Some(conversation) = queued {
            if conversation.is_expired(now) {
                return Ok(None);
            }
            debug!(conversation = %key, "Repopulated memory tier from pending writes");
            return self.insert_if_absent(conversation, Tier::Memory, now);
        }

        match self.load(key).await? {
            Some(conversation) if !conversation.is_expired(now) => {
                debug!(conversation = %key, "Repopulated memory tier from durable store");
                self.insert_if_absent(conversation, Tier::Durable, now)
            }
            _ => Ok(None),
        }
    }

    /// Store `conversation` in memory and persist it to the durable tier.
    ///
    /// Only a poisoned lock is an error. A durable failure after retries
    /// yields [`Persistence::MemoryOnly`] and queues the key for
    /// [`reconcile`](Self::reconcile).
    pub async fn put(&self, conversation: Conversation) -> Result<Persistence> {
        let key = conversation.key.clone();
        self.insert(conversation.clone(), Tier::Memory, Utc::now())?;

        match self.persist(&conversation).await {
            Ok(()) => {
                self.pending()?.remove(&key);
                Ok(Persistence::Durable)
            }
            Err(e) => {
                warn!(conversation = %key, error = %e, "Durable write failed, holding for reconciliation");
                self.pending()?.insert(key, conversation);
                Ok(Persistence::MemoryOnly {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub async fn remove(&self, key: &ConversationKey) -> Result<bool> {
        let in_memory = self.memory()?.entries.remove(key).is_some();
        let was_pending = self.pending()?.remove(key).is_some();
        let in_store = match tokio::time::timeout(self.store_timeout, self.store.delete(key)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::timeout("conversation delete", self.store_timeout).into())
            }
        };
        Ok(in_memory || was_pending || in_store)
    }

    /// Physically purge expired conversations from both tiers and return
    /// how many distinct conversations were removed.
    ///
    /// Pending durable writes are retried first. A durable tier that is
    /// down only limits the purge to the memory tier.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let reconciled = self.reconcile().await?;

        let mut removed: HashSet<ConversationKey> = HashSet::new();
        {
            let mut memory = self.memory()?;
            memory.entries.retain(|key, entry| {
                let expired = entry.conversation.is_expired(now);
                if expired {
                    removed.insert(key.clone());
                }
                !expired
            });
        }
        let memory_removed = removed.len();
        self.pending()?.retain(|key, conv| {
            let expired = conv.is_expired(now);
            if expired {
                removed.insert(key.clone());
            }
            !expired
        });

        let durable_removed =
            match tokio::time::timeout(self.store_timeout, self.store.purge_expired(now)).await {
                Ok(Ok(keys)) => {
                    let n = keys.len();
                    removed.extend(keys);
                    n
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Durable purge failed, memory tier swept only");
                    0
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.store_timeout.as_millis() as u64,
                        "Durable purge timed out, memory tier swept only"
                    );
                    0
                }
            };

        info!(
            memory_removed,
            durable_removed,
            reconciled,
            total = removed.len(),
            "Cache sweep completed"
        );
        Ok(removed.len())
    }

    /// Retry durable writes that previously failed. Returns how many
    /// succeeded.
    pub async fn reconcile(&self) -> Result<usize> {
        let snapshot: Vec<Conversation> = self.pending()?.values().cloned().collect();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut reconciled = 0;
        for conversation in snapshot {
            if conversation.is_expired(now) {
                continue;
            }
            match self.persist(&conversation).await {
                Ok(()) => {
                    let mut pending = self.pending()?;
                    // A newer write for the same key stays queued.
                    if pending.get(&conversation.key) == Some(&conversation) {
                        pending.remove(&conversation.key);
                    }
                    reconciled += 1;
                }
                Err(e) => {
                    debug!(conversation = %conversation.key, error = %e, "Reconciliation still failing");
                }
            }
        }
        if reconciled > 0 {
            info!(reconciled, "Reconciled pending conversation writes");
        }
        Ok(reconciled)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            memory_entries: self.memory()?.entries.len(),
            capacity: self.capacity,
            pending_reconciliation: self.pending()?.len(),
        })
    }

    /// Whether `key` is physically present in the memory tier, expired or not.
    pub fn is_resident(&self, key: &ConversationKey) -> bool {
        self.memory
            .lock()
            .map(|m| m.entries.contains_key(key))
            .unwrap_or(false)
    }

    /// Tier metadata for a resident entry.
    pub fn entry(&self, key: &ConversationKey) -> Option<CacheEntry> {
        self.memory.lock().ok()?.entries.get(key).cloned()
    }

    // -- Private helpers --

    fn memory(&self) -> Result<MutexGuard<'_, MemoryTier>> {
        self.memory
            .lock()
            .map_err(|e| CacheError::LockPoisoned(format!("memory tier: {}", e)))
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<ConversationKey, Conversation>>> {
        self.pending
            .lock()
            .map_err(|e| CacheError::LockPoisoned(format!("pending writes: {}", e)))
    }

    /// `Some(found)` when `key` is resident; `found` is `None` if it expired.
    fn resident(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Option<Conversation>>> {
        let mut memory = self.memory()?;
        let tick = memory.tick();
        Ok(memory.entries.get_mut(key).map(|entry| {
            if entry.conversation.is_expired(now) {
                return None;
            }
            entry.last_access = tick;
            Some(entry.conversation.clone())
        }))
    }

    /// Insert a copy read from a slower tier unless a turn already put a
    /// newer one in memory, and return whichever copy is resident.
    fn insert_if_absent(
        &self,
        conversation: Conversation,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<Option<Conversation>> {
        let mut memory = self.memory()?;
        if let Some(found) = memory.entries.get(&conversation.key) {
            return Ok(Some(found.conversation.clone()).filter(|c| !c.is_expired(now)));
        }
        Self::insert_locked(&mut memory, self.capacity, conversation.clone(), tier, now);
        Ok(Some(conversation))
    }

    fn insert(&self, conversation: Conversation, tier: Tier, now: DateTime<Utc>) -> Result<()> {
        let mut memory = self.memory()?;
        Self::insert_locked(&mut memory, self.capacity, conversation, tier, now);
        Ok(())
    }

    /// Insert into the memory tier, evicting the least recently accessed
    /// entry when a new key would exceed capacity.
    fn insert_locked(
        memory: &mut MemoryTier,
        capacity: usize,
        conversation: Conversation,
        tier: Tier,
        now: DateTime<Utc>,
    ) {
        let tick = memory.tick();
        let key = conversation.key.clone();

        if !memory.entries.contains_key(&key) && memory.entries.len() >= capacity {
            let victim = memory
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                memory.entries.remove(&victim);
                debug!(evicted = %victim, "Evicted least recently used conversation");
            }
        }

        let inserted_at = memory
            .entries
            .get(&key)
            .map(|e| e.inserted_at)
            .unwrap_or(now);
        memory.entries.insert(
            key,
            CacheEntry {
                conversation,
                tier,
                inserted_at,
                last_access: tick,
            },
        );
    }

    async fn load(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.retry
            .run("conversation load", self.store_timeout, || async move {
                self.store.load(key).await.map_err(into_provider)
            })
            .await
            .map_err(|e| CacheError::Store(PlotariError::Provider(e)))
    }

    async fn persist(&self, conversation: &Conversation) -> Result<()> {
        let policy = self.retry;
        policy
            .run("conversation save", self.store_timeout, || async move {
                self.store.save(conversation).await.map_err(into_provider)
            })
            .await
            .map_err(|e| CacheError::Inconsistency {
                key: conversation.key.to_string(),
                attempts: policy.max_attempts(),
                reason: e.to_string(),
            })
    }
}

/// Store failures other than provider errors are treated as transient.
fn into_provider(err: PlotariError) -> ProviderError {
    match err {
        PlotariError::Provider(p) => p,
        other => ProviderError::Unavailable(other.to_string()),
    }
}
