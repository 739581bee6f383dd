use crate::error::Result;
use crate::keys::Keys;
use crate::store::{Store, StreamEntry, WarAppend, WindowAppend};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// In-process store used by tests and single-node runs.
///
/// One mutex over the whole keyspace, which makes every compound operation
/// atomic by construction. TTLs are checked lazily on access against the
/// tokio clock, so paused-clock tests can drive expiry deterministically.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish()
    }
}

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry<String>>,
    zsets: HashMap<String, Entry<HashMap<String, f64>>>,
    hashes: HashMap<String, Entry<HashMap<String, String>>>,
    lists: HashMap<String, Entry<Vec<String>>>,
    sets: HashMap<String, Entry<HashSet<String>>>,
    streams: HashMap<String, Vec<StreamEntry>>,
    stream_seq: u64,
}

fn live<'a, T>(map: &'a mut HashMap<String, Entry<T>>, key: &str) -> Option<&'a mut Entry<T>> {
    if map.get(key).is_some_and(Entry::is_expired) {
        map.remove(key);
    }
    map.get_mut(key)
}

/// Converts redis-style inclusive rank bounds (negative = from the end)
/// into a concrete index range.
fn range_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let start = if start < 0 {
        (len as isize + start).max(0)
    } else {
        start
    } as usize;
    let stop = if stop < 0 { len as isize + stop } else { stop };
    if stop < 0 {
        return None;
    }
    let stop = (stop as usize).min(len - 1);
    if start > stop {
        return None;
    }
    Some((start, stop))
}

fn parse_stream_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms, seq)
}

fn sorted_desc(members: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut items: Vec<(String, f64)> = members.iter().map(|(m, s)| (m.clone(), *s)).collect();
    items.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    items
}

fn sorted_asc(members: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut items = sorted_desc(members);
    items.reverse();
    items
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.strings, key).map(|e| e.value.clone()))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        if inner.strings.get(key).is_some_and(Entry::is_expired) {
            inner.strings.remove(key);
        }
        let entry = inner
            .strings
            .entry(key.to_string())
            .or_insert_with(|| Entry::new("0".to_string()));
        let value = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = value.to_string();
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let at = Instant::now() + ttl;
        if let Some(entry) = live(&mut inner.strings, key) {
            entry.expires_at = Some(at);
        } else if let Some(entry) = live(&mut inner.zsets, key) {
            entry.expires_at = Some(at);
        } else if let Some(entry) = live(&mut inner.hashes, key) {
            entry.expires_at = Some(at);
        } else if let Some(entry) = live(&mut inner.lists, key) {
            entry.expires_at = Some(at);
        } else if let Some(entry) = live(&mut inner.sets, key) {
            entry.expires_at = Some(at);
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if live(&mut inner.strings, key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.strings, key).is_some()
            || live(&mut inner.zsets, key).is_some()
            || live(&mut inner.hashes, key).is_some()
            || live(&mut inner.lists, key).is_some()
            || live(&mut inner.sets, key).is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for key in keys {
            inner.strings.remove(key);
            inner.zsets.remove(key);
            inner.hashes.remove(key);
            inner.lists.remove(key);
            inner.sets.remove(key);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.zsets.get(key).is_some_and(Entry::is_expired) {
            inner.zsets.remove(key);
        }
        inner
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()))
            .value
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).map_or(0, |e| e.value.len() as u64))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).map_or(0, |e| {
            e.value.values().filter(|s| **s >= min && **s <= max).count() as u64
        }))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).and_then(|e| e.value.get(member).copied()))
    }

    async fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).and_then(|e| {
            sorted_desc(&e.value)
                .iter()
                .position(|(m, _)| m == member)
                .map(|rank| rank as u64)
        }))
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).map_or_else(Vec::new, |e| {
            let items = sorted_desc(&e.value);
            match range_bounds(items.len(), start, stop) {
                Some((s, t)) => items[s..=t].to_vec(),
                None => Vec::new(),
            }
        }))
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).map_or_else(Vec::new, |e| {
            let items = sorted_asc(&e.value);
            match range_bounds(items.len(), start, stop) {
                Some((s, t)) => items[s..=t].to_vec(),
                None => Vec::new(),
            }
        }))
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.zsets, key).map_or(0, |e| {
            members
                .iter()
                .filter(|m| e.value.remove(m.as_str()).is_some())
                .count() as u64
        }))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.hashes, key).and_then(|e| e.value.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.hashes, key).map_or_else(HashMap::new, |e| e.value.clone()))
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.hashes, key).map_or(0, |e| e.value.len() as u64))
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = live(&mut inner.hashes, key) {
            for field in fields {
                entry.value.remove(field);
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.lists, key).map_or_else(Vec::new, |e| {
            match range_bounds(e.value.len(), start, stop) {
                Some((s, t)) => e.value[s..=t].to_vec(),
                None => Vec::new(),
            }
        }))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.sets.get(key).is_some_and(Entry::is_expired) {
            inner.sets.remove(key);
        }
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(HashSet::new()))
            .value
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.sets, key).is_some_and(|e| e.value.remove(member)))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.sets, key).is_some_and(|e| e.value.contains(member)))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        Ok(live(&mut inner.sets, key)
            .map_or_else(Vec::new, |e| e.value.iter().cloned().collect()))
    }

    async fn xadd_capped(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: u64,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.stream_seq += 1;
        let id = format!("{}-0", inner.stream_seq);
        let entries = inner.streams.entry(stream.to_string()).or_default();
        entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.to_vec(),
        });
        let len = entries.len() as u64;
        if len > maxlen {
            entries.drain(..(len - maxlen) as usize);
        }
        Ok(id)
    }

    async fn xrange_after(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let inner = self.inner.lock().await;
        let cursor = after.map(parse_stream_id);
        Ok(inner.streams.get(stream).map_or_else(Vec::new, |entries| {
            entries
                .iter()
                .filter(|e| cursor.is_none_or(|c| parse_stream_id(&e.id) > c))
                .take(count)
                .cloned()
                .collect()
        }))
    }

    async fn xrevrange_count(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream).map_or_else(Vec::new, |entries| {
            entries.iter().rev().take(count).cloned().collect()
        }))
    }

    async fn xlen(&self, stream: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream).map_or(0, |e| e.len() as u64))
    }

    async fn xlast_id(&self, stream: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .and_then(|entries| entries.last().map(|e| e.id.clone())))
    }

    async fn window_append(&self, req: WindowAppend<'_>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expires_at = Some(Instant::now() + req.ttl);
        let watermark = req.timestamp - req.window.as_secs() as i64;

        // Window: insert, drop old, trim from the oldest end.
        if inner.zsets.get(req.window_key).is_some_and(Entry::is_expired) {
            inner.zsets.remove(req.window_key);
        }
        let window = inner
            .zsets
            .entry(req.window_key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()));
        window.value.insert(req.member.to_string(), req.timestamp as f64);
        window.value.retain(|_, score| *score > watermark as f64);
        if window.value.len() as u64 > req.max_members {
            let excess = window.value.len() as u64 - req.max_members;
            let doomed: Vec<String> = sorted_asc(&window.value)
                .into_iter()
                .take(excess as usize)
                .map(|(m, _)| m)
                .collect();
            for member in doomed {
                window.value.remove(&member);
            }
        }
        window.expires_at = expires_at;

        // Hot-set registry (no TTL; cleanup prunes dead entries)
        inner
            .zsets
            .entry(req.registry_key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()))
            .value
            .insert(req.page.to_string(), req.timestamp as f64);

        // Metadata
        if inner.hashes.get(req.meta_key).is_some_and(Entry::is_expired) {
            inner.hashes.remove(req.meta_key);
        }
        let meta = inner
            .hashes
            .entry(req.meta_key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()));
        meta.value
            .insert("last_edit_ts".into(), req.timestamp.to_string());
        let count = meta
            .value
            .get("edit_count")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        meta.value.insert("edit_count".into(), count.to_string());
        meta.expires_at = expires_at;

        // Per-editor counts
        if inner
            .hashes
            .get(req.editors_key)
            .is_some_and(Entry::is_expired)
        {
            inner.hashes.remove(req.editors_key);
        }
        let editors = inner
            .hashes
            .entry(req.editors_key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()));
        let edits = editors
            .value
            .get(req.editor)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        editors
            .value
            .insert(req.editor.to_string(), edits.to_string());
        editors.expires_at = expires_at;

        // Byte-change history, newest first
        if inner
            .lists
            .get(req.changes_key)
            .is_some_and(Entry::is_expired)
        {
            inner.lists.remove(req.changes_key);
        }
        let changes = inner
            .lists
            .entry(req.changes_key.to_string())
            .or_insert_with(|| Entry::new(Vec::new()));
        changes.value.insert(0, req.byte_delta.to_string());
        changes.value.truncate(req.changes_cap as usize);
        changes.expires_at = expires_at;

        Ok(())
    }

    async fn war_append(&self, req: WarAppend<'_>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expires_at = Some(Instant::now() + req.ttl);

        if inner
            .hashes
            .get(req.editors_key)
            .is_some_and(Entry::is_expired)
        {
            inner.hashes.remove(req.editors_key);
        }
        let editors = inner
            .hashes
            .entry(req.editors_key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new()));
        let count = editors
            .value
            .get(req.editor)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        editors
            .value
            .insert(req.editor.to_string(), count.to_string());
        editors.expires_at = expires_at;

        if inner
            .lists
            .get(req.changes_key)
            .is_some_and(Entry::is_expired)
        {
            inner.lists.remove(req.changes_key);
        }
        let changes = inner
            .lists
            .entry(req.changes_key.to_string())
            .or_insert_with(|| Entry::new(Vec::new()));
        changes.value.insert(0, req.byte_delta.to_string());
        changes.value.truncate(req.changes_cap as usize);
        changes.expires_at = expires_at;

        Ok(())
    }

    async fn trending_store(&self, page: &str, score: f64, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .zsets
            .entry(Keys::trending_global().to_string())
            .or_insert_with(|| Entry::new(HashMap::new()))
            .value
            .insert(page.to_string(), score);
        inner
            .hashes
            .entry(Keys::trending_updated().to_string())
            .or_insert_with(|| Entry::new(HashMap::new()))
            .value
            .insert(page.to_string(), now.to_string());
        Ok(())
    }
}
