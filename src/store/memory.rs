use {
    super::{KeyValueStore, StoreError},
    crate::clock::{Clock, SystemClock},
    async_trait::async_trait,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex, MutexGuard, PoisonError,
        },
    },
};

struct Entry {
    value: String,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

///
/// Number of calls made to each primitive of an [`InMemoryStore`].
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub set_if_absent: usize,
    pub get: usize,
    pub swap: usize,
    pub delete: usize,
    pub expire: usize,
    pub compare_and_delete: usize,
}

#[derive(Default)]
struct CallCounters {
    set_if_absent: AtomicUsize,
    get: AtomicUsize,
    swap: AtomicUsize,
    delete: AtomicUsize,
    expire: AtomicUsize,
    compare_and_delete: AtomicUsize,
}

impl CallCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreCallCounts {
        StoreCallCounts {
            set_if_absent: self.set_if_absent.load(Ordering::Relaxed),
            get: self.get.load(Ordering::Relaxed),
            swap: self.swap.load(Ordering::Relaxed),
            delete: self.delete.load(Ordering::Relaxed),
            expire: self.expire.load(Ordering::Relaxed),
            compare_and_delete: self.compare_and_delete.load(Ordering::Relaxed),
        }
    }
}

///
/// A [`KeyValueStore`] living in the memory of the current process.
///
/// Expiry is evaluated against the injected [`Clock`]: an entry whose deadline is reached is
/// treated as absent and purged on the next access. Every primitive is atomic since the whole
/// map sits behind a single mutex.
///
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    counters: CallCounters,
    unavailable: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            counters: CallCounters::default(),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn call_counts(&self) -> StoreCallCounts {
        self.counters.snapshot()
    }

    ///
    /// When set, every call fails with [`StoreError::Unavailable`] until it is cleared again.
    ///
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_epoch_secs();
        let mut entries = self.entries();
        entries.retain(|_, entry| entry.is_live(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    ///
    /// Locks the map and drops `key` if it has expired.
    ///
    fn live_entries(&self, key: &str) -> (MutexGuard<'_, HashMap<String, Entry>>, i64) {
        let now = self.clock.now_epoch_secs();
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        (entries, now)
    }

    fn deadline(now: i64, ttl_secs: u64) -> Option<i64> {
        (ttl_secs > 0).then(|| {
            i64::try_from(ttl_secs).map_or(i64::MAX, |ttl| now.saturating_add(ttl))
        })
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        CallCounters::bump(&self.counters.set_if_absent);
        self.check_available()?;
        let (mut entries, now) = self.live_entries(key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::deadline(now, ttl_secs),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        CallCounters::bump(&self.counters.get);
        self.check_available()?;
        let (entries, _) = self.live_entries(key);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        CallCounters::bump(&self.counters.swap);
        self.check_available()?;
        let (mut entries, _) = self.live_entries(key);
        let previous = entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(previous.map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        CallCounters::bump(&self.counters.delete);
        self.check_available()?;
        self.entries().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        CallCounters::bump(&self.counters.expire);
        self.check_available()?;
        let (mut entries, now) = self.live_entries(key);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Self::deadline(now, ttl_secs);
        }
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        CallCounters::bump(&self.counters.compare_and_delete);
        self.check_available()?;
        let (mut entries, _) = self.live_entries(key);
        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
