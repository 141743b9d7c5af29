//! In-memory `KvStore` used by tests and single-process development runs.
//!
//! Single-mutex implementation; atomicity of `apply` falls out of holding
//! the lock for the whole batch. Pub/sub loops back locally through a
//! broadcast channel, matching the visibility a replica has against a real
//! store (publishers receive their own messages).

use crate::error::{KvError, KvResult};
use crate::traits::{KvEvent, KvStore, WriteOp};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if let Some(entry) = self.strings.get(key)
            && entry.expires_at.is_some_and(|t| t <= Instant::now())
        {
            self.strings.remove(key);
        }
    }
}

/// An in-memory store. Clone by wrapping in `Arc`.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<KvEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Simulate a pub/sub reconnect, for cache-flush tests.
    pub fn emit_reconnected(&self) {
        let _ = self.events.send(KvEvent::Reconnected);
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        f(&mut inner)
    }

    fn apply_op(inner: &mut Inner, op: &WriteOp, published: &mut Vec<(String, String)>) {
        match op {
            WriteOp::SetAdd { key, member } => {
                inner.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            WriteOp::SetRemove { key, member } => {
                if let Some(set) = inner.sets.get_mut(key) {
                    set.remove(member);
                }
            }
            WriteOp::HashSet { key, fields } => {
                let hash = inner.hashes.entry(key.clone()).or_default();
                for (f, v) in fields {
                    hash.insert(f.clone(), v.clone());
                }
            }
            WriteOp::Delete { key } => {
                inner.strings.remove(key);
                inner.hashes.remove(key);
                inner.sets.remove(key);
            }
            WriteOp::Rename { from, to } => {
                if let Some(set) = inner.sets.remove(from) {
                    inner.sets.insert(to.clone(), set);
                } else if let Some(hash) = inner.hashes.remove(from) {
                    inner.hashes.insert(to.clone(), hash);
                } else if let Some(entry) = inner.strings.remove(from) {
                    inner.strings.insert(to.clone(), entry);
                }
            }
            WriteOp::Publish { channel, payload } => {
                published.push((channel.clone(), payload.clone()));
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn string_get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.with_inner(|inner| {
            inner.purge(key);
            inner.strings.get(key).map(|e| e.value.clone())
        }))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        Ok(self.with_inner(|inner| {
            inner.purge(key);
            if inner.strings.contains_key(key) {
                return false;
            }
            inner.strings.insert(
                key.to_string(),
                StringEntry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> KvResult<bool> {
        Ok(self.with_inner(|inner| {
            inner.purge(key);
            if inner.strings.get(key).is_some_and(|e| e.value == value) {
                inner.strings.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        Ok(self.with_inner(|inner| {
            inner.hashes.get(key).and_then(|h| h.get(field).cloned())
        }))
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        Ok(self.with_inner(|inner| inner.hashes.get(key).cloned().unwrap_or_default()))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        self.with_inner(|inner| {
            let hash = inner.hashes.entry(key.to_string()).or_default();
            for (f, v) in fields {
                hash.insert(f.clone(), v.clone());
            }
        });
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()> {
        self.with_inner(|inner| {
            if let Some(hash) = inner.hashes.get_mut(key) {
                hash.remove(field);
            }
        });
        Ok(())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        Ok(self.with_inner(|inner| {
            let hash = inner.hashes.entry(key.to_string()).or_default();
            let entry = hash.entry(field.to_string()).or_insert_with(|| "0".into());
            let next = entry.parse::<i64>().unwrap_or(0) + delta;
            *entry = next.to_string();
            next
        }))
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        self.with_inner(|inner| {
            inner.sets.entry(key.to_string()).or_default().insert(member.to_string());
        });
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()> {
        self.with_inner(|inner| {
            if let Some(set) = inner.sets.get_mut(key) {
                set.remove(member);
            }
        });
        Ok(())
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        Ok(self.with_inner(|inner| {
            inner
                .sets
                .get(key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn set_random_member(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.with_inner(|inner| {
            inner.sets.get(key).and_then(|s| s.iter().next().cloned())
        }))
    }

    async fn set_random_members(&self, key: &str, count: usize) -> KvResult<Vec<String>> {
        Ok(self.with_inner(|inner| {
            inner
                .sets
                .get(key)
                .map(|s| s.iter().take(count).cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn set_diff(&self, a: &str, b: &str) -> KvResult<Vec<String>> {
        Ok(self.with_inner(|inner| {
            let empty = HashSet::new();
            let sa = inner.sets.get(a).unwrap_or(&empty);
            let sb = inner.sets.get(b).unwrap_or(&empty);
            sa.difference(sb).cloned().collect()
        }))
    }

    async fn set_inter_store(&self, dst: &str, a: &str, b: &str) -> KvResult<i64> {
        Ok(self.with_inner(|inner| {
            let empty = HashSet::new();
            let sa = inner.sets.get(a).unwrap_or(&empty);
            let sb = inner.sets.get(b).unwrap_or(&empty);
            let inter: HashSet<String> = sa.intersection(sb).cloned().collect();
            let count = inter.len() as i64;
            if inter.is_empty() {
                inner.sets.remove(dst);
            } else {
                inner.sets.insert(dst.to_string(), inter);
            }
            count
        }))
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.with_inner(|inner| {
            inner.strings.remove(key);
            inner.hashes.remove(key);
            inner.sets.remove(key);
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.with_inner(|inner| {
            inner.purge(key);
            inner.strings.contains_key(key)
                || inner.hashes.contains_key(key)
                || inner.sets.contains_key(key)
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> KvResult<()> {
        self.with_inner(|inner| {
            if !inner.sets.contains_key(from)
                && !inner.hashes.contains_key(from)
                && !inner.strings.contains_key(from)
            {
                return Err(KvError::NotFound);
            }
            let op = WriteOp::Rename {
                from: from.to_string(),
                to: to.to_string(),
            };
            let mut published = Vec::new();
            Self::apply_op(inner, &op, &mut published);
            Ok(())
        })
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> KvResult<()> {
        let published = self.with_inner(|inner| {
            let mut published = Vec::new();
            for op in &ops {
                Self::apply_op(inner, op, &mut published);
            }
            published
        });
        for (channel, payload) in published {
            let _ = self.events.send(KvEvent::Message { channel, payload });
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        let _ = self.events.send(KvEvent::Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KvEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sets_and_diff() {
        let s = MemoryStore::new();
        for m in ["a", "b", "c"] {
            s.set_add("S1", m).await.unwrap();
        }
        for m in ["b", "c"] {
            s.set_add("S2", m).await.unwrap();
        }
        let mut diff = s.set_diff("S1", "S2").await.unwrap();
        diff.sort();
        assert_eq!(diff, vec!["a"]);
    }

    #[tokio::test]
    async fn inter_store_counts_and_overwrites() {
        let s = MemoryStore::new();
        for m in ["a", "b", "c"] {
            s.set_add("A", m).await.unwrap();
        }
        for m in ["b", "c", "d"] {
            s.set_add("B", m).await.unwrap();
        }
        assert_eq!(s.set_inter_store("OUT", "A", "B").await.unwrap(), 2);
        let mut out = s.set_members("OUT").await.unwrap();
        out.sort();
        assert_eq!(out, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn rename_moves_set_and_errors_on_missing() {
        let s = MemoryStore::new();
        s.set_add("TMP", "x").await.unwrap();
        s.rename("TMP", "LIVE").await.unwrap();
        assert!(!s.exists("TMP").await.unwrap());
        assert_eq!(s.set_members("LIVE").await.unwrap(), vec!["x"]);
        assert!(matches!(
            s.rename("TMP", "LIVE").await,
            Err(KvError::NotFound)
        ));
    }

    #[tokio::test]
    async fn apply_publishes_after_writes() {
        let s = MemoryStore::new();
        let mut rx = s.subscribe();
        s.apply(vec![
            WriteOp::SetAdd {
                key: "K".into(),
                member: "m".into(),
            },
            WriteOp::Publish {
                channel: "FILE_UPDATE".into(),
                payload: "m".into(),
            },
        ])
        .await
        .unwrap();

        assert_eq!(s.set_members("K").await.unwrap(), vec!["m"]);
        assert_eq!(
            rx.recv().await.unwrap(),
            KvEvent::Message {
                channel: "FILE_UPDATE".into(),
                payload: "m".into()
            }
        );
    }

    #[tokio::test]
    async fn hash_incr_starts_at_zero() {
        let s = MemoryStore::new();
        assert_eq!(s.hash_incr_by("H", "f", 2).await.unwrap(), 2);
        assert_eq!(s.hash_incr_by("H", "f", 3).await.unwrap(), 5);
    }
}
