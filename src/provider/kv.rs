use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Error;

pub type KvHandle = Arc<dyn KvDriver>;

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Only write if the key is absent.
    pub nx: bool,
    /// Expire the key after this duration.
    pub ex: Option<Duration>,
}

impl SetOptions {
    pub fn nx_ex(ttl: Duration) -> Self {
        SetOptions {
            nx: true,
            ex: Some(ttl),
        }
    }

    pub fn ex(ttl: Duration) -> Self {
        SetOptions {
            nx: false,
            ex: Some(ttl),
        }
    }
}

/// A value read back from the store. Some deployed drivers transparently
/// JSON-decode on read, so every consumer must accept either shape.
#[derive(Debug, Clone)]
pub enum KvValue {
    Raw(String),
    Json(serde_json::Value),
}

impl KvValue {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match self {
            KvValue::Raw(raw) => Ok(serde_json::from_str(raw)?),
            KvValue::Json(value) => {
                Ok(serde_json::from_value(value.clone())?)
            },
        }
    }

    /// The value as a plain string (lock tokens, hash counters).
    pub fn into_plain(self) -> String {
        match self {
            KvValue::Raw(raw) => raw,
            KvValue::Json(serde_json::Value::String(s)) => s,
            KvValue::Json(value) => value.to_string(),
        }
    }
}

/// One command inside a client-side pipeline. Ordering is preserved;
/// atomicity across commands is not assumed.
#[derive(Debug, Clone)]
pub enum KvCommand {
    Set {
        key: String,
        value: String,
        options: SetOptions,
    },
    Del {
        key: String,
    },
    LPush {
        key: String,
        value: String,
    },
    RPush {
        key: String,
        value: String,
    },
    LTrim {
        key: String,
        start: i64,
        stop: i64,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HDel {
        key: String,
        field: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

#[async_trait]
pub trait KvDriver: Send + Sync + std::fmt::Debug {
    /// Returns true iff the write was accepted (with `nx`, only on
    /// absence).
    async fn set(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> Result<bool, Error>;
    async fn get(&self, key: &str) -> Result<Option<KvValue>, Error>;
    async fn del(&self, key: &str) -> Result<bool, Error>;
    async fn exists(&self, key: &str) -> Result<bool, Error>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), Error>;
    async fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<KvValue>, Error>;
    async fn hgetall(
        &self,
        key: &str,
    ) -> Result<HashMap<String, KvValue>, Error>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, Error>;

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, Error>;
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, Error>;
    async fn lpop(&self, key: &str) -> Result<Option<KvValue>, Error>;
    async fn llen(&self, key: &str) -> Result<u64, Error>;
    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<KvValue>, Error>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64)
        -> Result<(), Error>;

    async fn zadd(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<(), Error>;
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        rev: bool,
    ) -> Result<Vec<String>, Error>;

    /// Cursor iteration; callers loop until the returned cursor is zero.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), Error>;

    async fn pipeline(&self, commands: Vec<KvCommand>) -> Result<(), Error>;
}

/// Glob match for `SCAN` patterns: `*` matches any run of characters.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut remaining = key;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            match remaining.strip_prefix(part) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(at) => remaining = &remaining[at + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[derive(Debug, Clone)]
enum Slot {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

/// In-memory driver with per-key expiry. Default backend of the binary
/// and the backend of every store test.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> KvHandle {
        Arc::new(Self::new())
    }
}

fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

macro_rules! typed_slot {
    ($entry:expr, $variant:ident, $default:expr) => {{
        match $entry {
            Entry {
                slot: Slot::$variant(inner),
                ..
            } => inner,
            entry => {
                entry.slot = Slot::$variant($default);
                entry.expires_at = None;
                match &mut entry.slot {
                    Slot::$variant(inner) => inner,
                    _ => unreachable!(),
                }
            },
        }
    }};
}

impl MemoryKv {
    async fn with_slot<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> R {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            slot: Slot::Str(String::new()),
            expires_at: None,
        });
        if !entry.live() {
            entry.slot = Slot::Str(String::new());
            entry.expires_at = None;
        }
        f(entry)
    }

    async fn read_slot<R>(
        &self,
        key: &str,
        f: impl FnOnce(&Slot) -> R,
    ) -> Option<R> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| f(&entry.slot))
    }
}

#[async_trait]
impl KvDriver for MemoryKv {
    async fn set(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        let occupied = entries
            .get(key)
            .map(|entry| entry.live())
            .unwrap_or(false);
        if options.nx && occupied {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Str(value.to_string()),
                expires_at: options.ex.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<KvValue>, Error> {
        Ok(self
            .read_slot(key, |slot| match slot {
                Slot::Str(value) => Some(KvValue::Raw(value.clone())),
                _ => None,
            })
            .await
            .flatten())
    }

    async fn del(&self, key: &str) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).map(|e| e.live()).unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(|e| e.live()).unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key).filter(|e| e.live()) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), Error> {
        self.with_slot(key, |entry| {
            let hash = typed_slot!(entry, Hash, HashMap::new());
            hash.insert(field.to_string(), value.to_string());
        })
        .await;
        Ok(())
    }

    async fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<KvValue>, Error> {
        Ok(self
            .read_slot(key, |slot| match slot {
                Slot::Hash(hash) => {
                    hash.get(field).cloned().map(KvValue::Raw)
                },
                _ => None,
            })
            .await
            .flatten())
    }

    async fn hgetall(
        &self,
        key: &str,
    ) -> Result<HashMap<String, KvValue>, Error> {
        Ok(self
            .read_slot(key, |slot| match slot {
                Slot::Hash(hash) => hash
                    .iter()
                    .map(|(k, v)| (k.clone(), KvValue::Raw(v.clone())))
                    .collect(),
                _ => HashMap::new(),
            })
            .await
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, Error> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key).filter(|e| e.live()) {
            Some(Entry {
                slot: Slot::Hash(hash),
                ..
            }) => Ok(hash.remove(field).is_some()),
            _ => Ok(false),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, Error> {
        Ok(self
            .with_slot(key, |entry| {
                let list = typed_slot!(entry, List, VecDeque::new());
                list.push_front(value.to_string());
                list.len() as u64
            })
            .await)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, Error> {
        Ok(self
            .with_slot(key, |entry| {
                let list = typed_slot!(entry, List, VecDeque::new());
                list.push_back(value.to_string());
                list.len() as u64
            })
            .await)
    }

    async fn lpop(&self, key: &str) -> Result<Option<KvValue>, Error> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key).filter(|e| e.live()) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(list.pop_front().map(KvValue::Raw)),
            _ => Ok(None),
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, Error> {
        Ok(self
            .read_slot(key, |slot| match slot {
                Slot::List(list) => list.len() as u64,
                _ => 0,
            })
            .await
            .unwrap_or(0))
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<KvValue>, Error> {
        Ok(self
            .read_slot(key, |slot| match slot {
                Slot::List(list) => {
                    match normalize_range(start, stop, list.len()) {
                        Some((from, to)) => list
                            .iter()
                            .skip(from)
                            .take(to - from + 1)
                            .cloned()
                            .map(KvValue::Raw)
                            .collect(),
                        None => Vec::new(),
                    }
                },
                _ => Vec::new(),
            })
            .await
            .unwrap_or_default())
    }

    async fn ltrim(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<(), Error> {
        self.with_slot(key, |entry| {
            let list = typed_slot!(entry, List, VecDeque::new());
            match normalize_range(start, stop, list.len()) {
                Some((from, to)) => {
                    let kept: VecDeque<String> = list
                        .iter()
                        .skip(from)
                        .take(to - from + 1)
                        .cloned()
                        .collect();
                    *list = kept;
                },
                None => list.clear(),
            }
        })
        .await;
        Ok(())
    }

    async fn zadd(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<(), Error> {
        self.with_slot(key, |entry| {
            let zset = typed_slot!(entry, ZSet, HashMap::new());
            zset.insert(member.to_string(), score);
        })
        .await;
        Ok(())
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        rev: bool,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .read_slot(key, |slot| match slot {
                Slot::ZSet(zset) => {
                    let mut members: Vec<(&String, &f64)> =
                        zset.iter().collect();
                    members.sort_by(|a, b| {
                        a.1.partial_cmp(b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(b.0))
                    });
                    if rev {
                        members.reverse();
                    }
                    match normalize_range(start, stop, members.len()) {
                        Some((from, to)) => members
                            [from..=to]
                            .iter()
                            .map(|(member, _)| (*member).clone())
                            .collect(),
                        None => Vec::new(),
                    }
                },
                _ => Vec::new(),
            })
            .await
            .unwrap_or_default())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), Error> {
        let entries = self.entries.read().await;
        let mut keys: Vec<&String> = entries
            .iter()
            .filter(|(_, entry)| entry.live())
            .map(|(key, _)| key)
            .collect();
        keys.sort();

        let from = cursor as usize;
        if from >= keys.len() {
            return Ok((0, Vec::new()));
        }
        let to = (from + count.max(1)).min(keys.len());
        let page: Vec<String> = keys[from..to]
            .iter()
            .filter(|key| pattern_matches(pattern, key))
            .map(|key| (*key).clone())
            .collect();
        let next = if to >= keys.len() { 0 } else { to as u64 };
        Ok((next, page))
    }

    async fn pipeline(&self, commands: Vec<KvCommand>) -> Result<(), Error> {
        for command in commands {
            match command {
                KvCommand::Set {
                    key,
                    value,
                    options,
                } => {
                    self.set(&key, &value, options).await?;
                },
                KvCommand::Del { key } => {
                    self.del(&key).await?;
                },
                KvCommand::LPush { key, value } => {
                    self.lpush(&key, &value).await?;
                },
                KvCommand::RPush { key, value } => {
                    self.rpush(&key, &value).await?;
                },
                KvCommand::LTrim { key, start, stop } => {
                    self.ltrim(&key, start, stop).await?;
                },
                KvCommand::HSet { key, field, value } => {
                    self.hset(&key, &field, &value).await?;
                },
                KvCommand::HDel { key, field } => {
                    self.hdel(&key, &field).await?;
                },
                KvCommand::Expire { key, ttl } => {
                    self.expire(&key, ttl).await?;
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_semantics() {
        let kv = MemoryKv::new();
        assert!(kv
            .set("k", "first", SetOptions::nx_ex(Duration::from_secs(60)))
            .await
            .unwrap());
        assert!(!kv
            .set("k", "second", SetOptions::nx_ex(Duration::from_secs(60)))
            .await
            .unwrap());
        let value = kv.get("k").await.unwrap().unwrap();
        assert_eq!(value.into_plain(), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let kv = MemoryKv::new();
        kv.set("k", "v", SetOptions::ex(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(kv.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!kv.exists("k").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_none());

        // nx succeeds again once the old value has lapsed
        assert!(kv
            .set("k", "fresh", SetOptions::nx_ex(Duration::from_secs(5)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_order_and_trim() {
        let kv = MemoryKv::new();
        kv.rpush("list", "a").await.unwrap();
        kv.rpush("list", "b").await.unwrap();
        kv.lpush("list", "head").await.unwrap();
        assert_eq!(kv.llen("list").await.unwrap(), 3);

        let all: Vec<String> = kv
            .lrange("list", 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(KvValue::into_plain)
            .collect();
        assert_eq!(all, vec!["head", "a", "b"]);

        kv.ltrim("list", 0, 1).await.unwrap();
        assert_eq!(kv.llen("list").await.unwrap(), 2);
        let popped = kv.lpop("list").await.unwrap().unwrap();
        assert_eq!(popped.into_plain(), "head");
    }

    #[tokio::test]
    async fn test_zrange_ordering() {
        let kv = MemoryKv::new();
        kv.zadd("z", 3.0, "late").await.unwrap();
        kv.zadd("z", 1.0, "early").await.unwrap();
        kv.zadd("z", 2.0, "mid").await.unwrap();

        let asc = kv.zrange("z", 0, -1, false).await.unwrap();
        assert_eq!(asc, vec!["early", "mid", "late"]);
        let desc = kv.zrange("z", 0, 1, true).await.unwrap();
        assert_eq!(desc, vec!["late", "mid"]);
    }

    #[tokio::test]
    async fn test_scan_cursor_terminates() {
        let kv = MemoryKv::new();
        for i in 0..25 {
            kv.set(
                &format!("user:stats:0x{:02}", i),
                "{}",
                SetOptions::default(),
            )
            .await
            .unwrap();
        }
        kv.set("other:key", "{}", SetOptions::default())
            .await
            .unwrap();

        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let (next, page) =
                kv.scan(cursor, "user:stats:*", 10).await.unwrap();
            found.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(found.len(), 25);
        assert!(found.iter().all(|k| k.starts_with("user:stats:")));
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("user:stats:*", "user:stats:0xabc"));
        assert!(!pattern_matches("user:stats:*", "user:tx:0xabc"));
        assert!(pattern_matches("jobs:processing:*", "jobs:processing:1"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
        assert!(pattern_matches("*:totals", "allocvote:main:totals"));
    }

    #[tokio::test]
    async fn test_dual_shape_decode() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Record {
            n: u32,
        }

        let raw = KvValue::Raw(String::from(r#"{"n":7}"#));
        let json = KvValue::Json(serde_json::json!({"n": 7}));
        assert_eq!(raw.decode::<Record>().unwrap(), Record { n: 7 });
        assert_eq!(json.decode::<Record>().unwrap(), Record { n: 7 });
    }
}
