//! InMemoryKvStore - 開発・テスト用の TTL 付き KV ストア
//!
//! # 実装詳細
//! - HashMap<String, Entry> を tokio::sync::Mutex で保護
//! - 期限は Clock で判定する（FixedClock を渡せば TTL 切れを決定的に再現できる）
//! - 障害注入: `set_available(false)` で全操作が Unavailable、
//!   `fail_next_writes(n)` で次の n 回の書き込みだけ失敗
//! - `write_count()` は成功した set / delete の回数（「書き込みがなかった」ことの検証用）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::RegistryError;
use crate::ports::{Clock, KvStore, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// InMemoryKvStore は開発用の KvStore
///
/// # 使用例
/// ```ignore
/// let clock = Arc::new(FixedClock::new(t0));
/// let store = InMemoryKvStore::with_clock(clock.clone());
/// store.set_with_ttl("k", "v".into(), Duration::from_secs(30)).await?;
/// clock.advance(Duration::from_secs(31));
/// assert_eq!(store.get("k").await?, None);
/// ```
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
    write_delay: std::sync::Mutex<Option<Duration>>,
}

impl InMemoryKvStore {
    /// 壁時計で期限を判定するストア
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            failing_writes: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            write_delay: std::sync::Mutex::new(None),
        }
    }

    /// false にすると以降の全操作が `RegistryError::Unavailable` になる
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 次の `n` 回の set / delete を失敗させる
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// set_with_ttl が値を反映する前に待つ時間（書き込みの in-flight 状態を作る）
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    /// 成功した set / delete の回数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 期限切れでないキーの一覧（ソート済み）
    pub async fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 保持しているエントリ数（期限切れで未回収のものも含む）
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// キーの残り TTL
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        entry.expires_at.signed_duration_since(now).to_std().ok()
    }

    fn check_available(&self, op: &'static str, key: &str) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::unavailable(op, key, "connection refused"))
        }
    }

    fn check_write(&self, op: &'static str, key: &str) -> Result<(), RegistryError> {
        self.check_available(op, key)?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RegistryError::unavailable(op, key, "injected write failure"));
        }
        Ok(())
    }

    fn current_write_delay(&self) -> Option<Duration> {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        self.check_write("set", key)?;
        if let Some(delay) = self.current_write_delay() {
            tokio::time::sleep(delay).await;
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut entries = self.entries.lock().await;
        // 読まれないまま期限切れになったキーが溜まらないよう書き込みのたびに掃除する
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(key.to_string(), Entry { value, expires_at });
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RegistryError> {
        self.check_available("get", key)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, RegistryError> {
        let first = keys.first().map(String::as_str).unwrap_or_default();
        self.check_write("delete", first)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.expires_at > now)
            .count();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(removed)
    }
}
