//! In-process implementation of [`CoordinationStore`].
//!
//! Expiry is lazy: an expired key behaves as absent on every access and is
//! physically removed by writers or by [`MemoryStore::purge_expired`].

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::RwLock, time::Instant};

use super::{CoordinationStore, StoreResult};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    /// Kept sorted by (score, member).
    ZSet(Vec<(f64, String)>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value:      Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self { value, expires_at: ttl.map(|t| Instant::now() + t) }
    }

    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Map = HashMap<String, Entry>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Map>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Drops every expired key. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut m = self.inner.write().await;
        let before = m.len();
        m.retain(|_, e| e.live(now));
        before - m.len()
    }
}

/* ── lookup helpers ── */
fn live<'a>(m: &'a Map, key: &str) -> Option<&'a Entry> {
    m.get(key).filter(|e| e.live(Instant::now()))
}

/// Mutable access to a live entry; an expired one is removed first.
fn live_mut<'a>(m: &'a mut Map, key: &str) -> Option<&'a mut Entry> {
    if m.get(key).is_some_and(|e| !e.live(Instant::now())) {
        m.remove(key);
    }
    m.get_mut(key)
}

fn wrong(key: &str) -> StoreError { StoreError::WrongType(key.to_string()) }

fn zpos(z: &[(f64, String)], member: &str) -> Option<usize> {
    z.iter().position(|(_, name)| name == member)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.write().await.insert(key.to_string(), Entry::new(Value::Str(value), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        if live_mut(&mut m, key).is_some() {
            return Ok(false);
        }
        m.insert(key.to_string(), Entry::new(Value::Str(value), ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn incr(&self, key: &str, window: Duration) -> StoreResult<i64> {
        let mut m = self.inner.write().await;
        let Some(e) = live_mut(&mut m, key) else {
            m.insert(key.to_string(), Entry::new(Value::Str("1".into()), Some(window)));
            return Ok(1);
        };
        let Value::Str(s) = &mut e.value else {
            return Err(wrong(key));
        };
        let n = s.parse::<i64>().map_err(|_| wrong(key))? + 1;
        *s = n.to_string();
        Ok(n)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        let existed = live_mut(&mut m, key).is_some();
        m.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        Ok(match live_mut(&mut m, key) {
            Some(e) => {
                e.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut m = self.inner.write().await;
        if live_mut(&mut m, key).is_none() {
            m.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new()), None));
        }
        let Some(Entry { value: Value::Hash(h), .. }) = m.get_mut(key) else {
            return Err(wrong(key));
        };
        for (f, v) in fields {
            h.insert((*f).to_string(), v.clone());
        }
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: String) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        if live_mut(&mut m, key).is_none() {
            m.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new()), None));
        }
        let Some(Entry { value: Value::Hash(h), .. }) = m.get_mut(key) else {
            return Err(wrong(key));
        };
        if h.contains_key(field) {
            return Ok(false);
        }
        h.insert(field.to_string(), value);
        Ok(true)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        match live_mut(&mut m, key).map(|e| &mut e.value) {
            None => Ok(false),
            Some(Value::Hash(h)) => Ok(h.remove(field).is_some()),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        if live_mut(&mut m, key).is_none() {
            m.insert(key.to_string(), Entry::new(Value::ZSet(Vec::new()), None));
        }
        let Some(Entry { value: Value::ZSet(z), .. }) = m.get_mut(key) else {
            return Err(wrong(key));
        };
        if zpos(z, member).is_some() {
            return Ok(false);
        }
        let at = z.partition_point(|(s, name)| (*s, name.as_str()) < (score, member));
        z.insert(at, (score, member.to_string()));
        Ok(true)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut m = self.inner.write().await;
        match live_mut(&mut m, key).map(|e| &mut e.value) {
            None => Ok(false),
            Some(Value::ZSet(z)) => Ok(match zpos(z, member) {
                Some(i) => {
                    z.remove(i);
                    true
                }
                None => false,
            }),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(zpos(z, member).map(|i| z[i].0)),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn zrank(&self, key: &str, member: &str) -> StoreResult<Option<usize>> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(zpos(z, member)),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(z)) => Ok(z.iter().map(|(_, name)| name.clone()).collect()),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(z)) => Ok(z.len()),
            Some(_) => Err(wrong(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<Vec<String>> {
        let mut m = self.inner.write().await;
        if live_mut(&mut m, key).is_none() {
            m.insert(key.to_string(), Entry::new(Value::Set(BTreeSet::new()), None));
        }
        let Some(Entry { value: Value::Set(s), .. }) = m.get_mut(key) else {
            return Err(wrong(key));
        };
        s.insert(member.to_string());
        Ok(s.iter().cloned().collect())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let m = self.inner.read().await;
        match live(&m, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(wrong(key)),
        }
    }
}
