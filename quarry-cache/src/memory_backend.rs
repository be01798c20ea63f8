//! In-process key-value store.
//!
//! Behaves like the Redis store closely enough for the entity cache: values
//! expire after their TTL (lazily, on the next access), the access index is
//! a score map that outlives expired values, and `put`/`remove` change both
//! under one lock. Expiry uses `tokio::time::Instant` so tests can drive it
//! with a paused clock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_core::{QuarryError, QuarryResult};
use tokio::time::Instant;

use crate::traits::KeyValueStore;

struct Entry {
    value: String,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    indexes: HashMap<String, HashMap<String, f64>>,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.values.retain(|_, entry| entry.expires_at > now);
    }
}

/// [`KeyValueStore`] held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing_reads: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    put_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read of `key` fail until cleared.
    pub fn fail_reads_for(&self, key: impl Into<String>) {
        self.failing_reads.lock().insert(key.into());
    }

    pub fn clear_read_failures(&self) {
        self.failing_reads.lock().clear();
    }

    /// Make `put` and `remove` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// TTL `key` was last written with, if it is still live.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.values.get(key).map(|entry| entry.ttl)
    }

    /// Raw stored value, bypassing failure injection.
    pub fn raw(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.values.get(key).map(|entry| entry.value.clone())
    }

    /// Members of `index`, lowest score first.
    pub fn index_members(&self, index: &str) -> Vec<String> {
        sorted_members(&self.inner.lock(), index)
    }

    pub fn index_score(&self, index: &str, member: &str) -> Option<f64> {
        self.inner
            .lock()
            .indexes
            .get(index)
            .and_then(|members| members.get(member).copied())
    }

    fn check_read(&self, key: &str) -> QuarryResult<()> {
        if self.failing_reads.lock().contains(key) {
            return Err(QuarryError::cache(format!("Injected read failure for '{}'", key)));
        }
        Ok(())
    }

    fn check_write(&self) -> QuarryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QuarryError::cache("Injected write failure"));
        }
        Ok(())
    }
}

fn sorted_members(inner: &Inner, index: &str) -> Vec<String> {
    let Some(members) = inner.indexes.get(index) else {
        return Vec::new();
    };
    let mut scored: Vec<(&String, f64)> = members.iter().map(|(k, s)| (k, *s)).collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    scored.into_iter().map(|(k, _)| k.clone()).collect()
}

/// Glob match supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> QuarryResult<Option<String>> {
        self.check_read(key)?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.values.get(key).map(|entry| entry.value.clone()))
    }

    async fn mget(&self, keys: &[String]) -> Vec<QuarryResult<Option<String>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await);
        }
        results
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        index: &str,
        score: f64,
    ) -> QuarryResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        let mut inner = self.inner.lock();
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        inner
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(key.to_string(), score);
        Ok(())
    }

    async fn remove(&self, keys: &[String], index: &str) -> QuarryResult<u64> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let mut deleted = 0;
        for key in keys {
            if inner.values.remove(key).is_some() {
                deleted += 1;
            }
        }
        if let Some(members) = inner.indexes.get_mut(index) {
            for key in keys {
                members.remove(key);
            }
        }
        Ok(deleted)
    }

    async fn oldest(&self, index: &str, n: usize) -> QuarryResult<Vec<String>> {
        let mut members = sorted_members(&self.inner.lock(), index);
        members.truncate(n);
        Ok(members)
    }

    async fn scan(&self, pattern: &str, index: &str) -> QuarryResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .filter(|k| k.as_str() != index && glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn size(&self, _index: &str) -> QuarryResult<u64> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.values.len() as u64)
    }
}
