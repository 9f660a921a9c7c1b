use {
    crate::{
        clock::{Clock, SystemClock},
        options::{check_ttl, LockOptions, MAX_TTL_SECS},
        store::{KeyValueStore, StoreError},
        token::{ProcessTokenSource, TokenSource},
        value::StoredLockValue,
    },
    futures::FutureExt,
    rand::Rng,
    std::{
        future::Future,
        ops::Deref,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    },
    thiserror::Error,
    tokio::{
        sync::mpsc,
        task::{JoinError, JoinHandle},
    },
    tracing::{error, info, trace, warn},
};

struct ReleaseCommand {
    key: String,
    owner_token: String,
    release_callback: mpsc::UnboundedSender<()>,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock ttl {0}, must be between one (1) and {MAX_TTL_SECS} seconds")]
    InvalidTtl(u64),
    #[error("invalid reclaim probability {0}, must be within [0, 1]")]
    InvalidReclaimProbability(f64),
    #[error("lock is already taken")]
    AlreadyTaken,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

///
/// Creates lock handles and releases the ones dropped while still holding their lock.
///
/// You can clone [`LockManager`] to share it across tasks, it is really cheap to do so.
///
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenSource>,
    options: LockOptions,
    release_queue_tx: mpsc::UnboundedSender<ReleaseCommand>,
}

pub struct LockManagerHandle {
    inner: JoinHandle<()>,
}

impl Future for LockManagerHandle {
    type Output = Result<(), JoinError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

///
/// Resolves once the release of a dropped [`Lock`] has been processed by the background worker,
/// or right away if the lock was not held when dropped.
///
pub struct ReleaseNotify {
    release_callback_rx: mpsc::UnboundedReceiver<()>,
}

impl Future for ReleaseNotify {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.release_callback_rx.poll_recv(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

///
/// Spawns the background release worker and returns a [`LockManager`] using the system clock
/// and per-process owner tokens.
///
/// The worker stops once every [`LockManager`] and every [`Lock`] is dropped, after processing
/// the releases still queued. Await the [`LockManagerHandle`] to wait for it.
///
/// Must be called from within a tokio runtime.
///
/// Examples
///
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use rust_kv_lock::{lock::spawn_lock_manager, options::LockOptions, store::etcd::EtcdStore};
///
/// let store = EtcdStore::connect(["http://localhost:2379"]).await?;
/// let (lock_man_handle, lock_man) = spawn_lock_manager(Arc::new(store), LockOptions::new())?;
///
/// let mut lock = lock_man.new_lock("job-42")?;
/// if lock.acquire().await? {
///     // Do something while holding the lock
///     lock.release().await?;
/// }
///
/// drop(lock);
/// drop(lock_man);
/// lock_man_handle.await?;
/// # Ok(())
/// # }
/// ```
///
pub fn spawn_lock_manager(
    store: Arc<dyn KeyValueStore>,
    options: LockOptions,
) -> Result<(LockManagerHandle, LockManager), LockError> {
    spawn_lock_manager_with(
        store,
        options,
        Arc::new(SystemClock),
        Arc::new(ProcessTokenSource::new()),
    )
}

///
/// Same as [`spawn_lock_manager`] with an explicit clock and owner token source.
///
pub fn spawn_lock_manager_with(
    store: Arc<dyn KeyValueStore>,
    options: LockOptions,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenSource>,
) -> Result<(LockManagerHandle, LockManager), LockError> {
    options.validate()?;
    let (tx, mut rx) = mpsc::unbounded_channel::<ReleaseCommand>();
    let worker_store = Arc::clone(&store);
    let handle = tokio::spawn(async move {
        // Every manager and lock holds a sender, the loop ends when the last one is dropped.
        while let Some(cmd) = rx.recv().await {
            let ReleaseCommand {
                key,
                owner_token,
                release_callback,
            } = cmd;
            match release_entry(worker_store.as_ref(), &key, &owner_token).await {
                Ok(true) => info!("Released dropped lock {key}"),
                Ok(false) => {}
                Err(e) => error!("Failed to release dropped lock {key}: {e}"),
            }
            let _ = release_callback.send(());
        }
        trace!("lock manager release worker exiting");
    });
    Ok((
        LockManagerHandle { inner: handle },
        LockManager {
            store,
            clock,
            tokens,
            options,
            release_queue_tx: tx,
        },
    ))
}

impl LockManager {
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    ///
    /// Creates a handle on `resource_key` using the manager's default ttl.
    ///
    pub fn new_lock(&self, resource_key: impl AsRef<str>) -> Result<Lock, LockError> {
        self.new_lock_with_ttl(resource_key, self.options.ttl_secs)
    }

    pub fn new_lock_with_ttl(
        &self,
        resource_key: impl AsRef<str>,
        ttl_secs: u64,
    ) -> Result<Lock, LockError> {
        self.new_lock_with_release_notify(resource_key, ttl_secs)
            .map(|(lock, _)| lock)
    }

    pub fn new_lock_with_release_notify(
        &self,
        resource_key: impl AsRef<str>,
        ttl_secs: u64,
    ) -> Result<(Lock, ReleaseNotify), LockError> {
        check_ttl(ttl_secs)?;
        let resource_key = resource_key.as_ref();
        let (release_callback_tx, release_callback_rx) = mpsc::unbounded_channel();
        let lock = Lock {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            key: format!("{}{resource_key}", self.options.key_prefix),
            resource_key: resource_key.to_string(),
            owner_token: self.tokens.next_token(),
            ttl_secs,
            reclaim_min_ttl_secs: self.options.reclaim_min_ttl_secs,
            reclaim_probability: self.options.reclaim_probability,
            state: LockState::Unlocked,
            release_queue_tx: self.release_queue_tx.clone(),
            release_callback_tx,
        };
        Ok((
            lock,
            ReleaseNotify {
                release_callback_rx,
            },
        ))
    }
}

///
/// Deletes `key` if it still holds a lock owned by `owner_token`.
///
/// Returns whether the entry was deleted. An entry that is gone, unreadable or owned by someone
/// else is left alone.
///
async fn release_entry(
    store: &dyn KeyValueStore,
    key: &str,
    owner_token: &str,
) -> Result<bool, StoreError> {
    let Some(raw) = store.get(key).await? else {
        trace!("lock {key} already gone");
        return Ok(false);
    };
    match StoredLockValue::parse(&raw) {
        Some(held) if held.owner_token == owner_token => {
            let deleted = store.compare_and_delete(key, &raw).await?;
            if !deleted {
                warn!("lock {key} changed hands while releasing it");
            }
            Ok(deleted)
        }
        Some(held) => {
            warn!("lock {key} was reclaimed by {}, nothing to release", held.owner_token);
            Ok(false)
        }
        None => {
            warn!("lock {key} holds an unreadable value, nothing to release");
            Ok(false)
        }
    }
}

///
/// A handle on one lock, owned by a single task.
///
/// [`Lock::acquire`] is a single non-blocking probe: callers that need to wait must retry with
/// their own backoff. A handle dropped while holding its lock is released by the
/// [`LockManager`] background worker.
///
pub struct Lock {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    resource_key: String,
    owner_token: String,
    ttl_secs: u64,
    reclaim_min_ttl_secs: u64,
    reclaim_probability: f64,
    state: LockState,
    release_queue_tx: mpsc::UnboundedSender<ReleaseCommand>,
    release_callback_tx: mpsc::UnboundedSender<()>,
}

impl Lock {
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    ///
    /// Key under which the lock lives in the store: key prefix followed by the resource key.
    ///
    pub fn get_key(&self) -> &str {
        &self.key
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    ///
    /// Tries to take the lock, returns `false` if someone else holds it.
    ///
    /// On contention, a lock whose ttl exceeds `reclaim_min_ttl_secs` may, with probability
    /// `reclaim_probability`, probe the held entry: if its deadline has passed, the entry is
    /// swapped for ours and the lock is won only if nobody touched it between the read and the
    /// swap. A handle that loses that race has already overwritten the winner's entry; it writes
    /// the winner's value back, but a release by the winner in between finds our value and leaves
    /// the entry to expire with its ttl.
    ///
    /// Store failures are returned as is, they are never retried here.
    ///
    pub async fn acquire(&mut self) -> Result<bool, StoreError> {
        if self.is_locked() {
            return Ok(true);
        }
        let now = self.clock.now_epoch_secs();
        // ttl is bounded by MAX_TTL_SECS at construction.
        let expires_at = now.saturating_add(self.ttl_secs as i64);
        let value = StoredLockValue::new(expires_at, self.owner_token.as_str()).encode();
        trace!("Trying to lock {}...", self.key);
        if self.store.set_if_absent(&self.key, &value, self.ttl_secs).await? {
            self.state = LockState::Locked;
            // Stores without atomic set-with-ttl get their ttl here.
            self.store.expire(&self.key, self.ttl_secs).await?;
            return Ok(true);
        }
        if !self.should_try_reclaim() {
            return Ok(false);
        }
        self.try_reclaim(now, value).await
    }

    fn should_try_reclaim(&self) -> bool {
        self.ttl_secs > self.reclaim_min_ttl_secs
            && rand::thread_rng().gen_bool(self.reclaim_probability)
    }

    async fn try_reclaim(&mut self, now: i64, value: String) -> Result<bool, StoreError> {
        let Some(current) = self.store.get(&self.key).await? else {
            return Ok(false);
        };
        let Some(held) = StoredLockValue::parse(&current) else {
            return Ok(false);
        };
        if !held.is_expired(now) {
            return Ok(false);
        }
        let previous = self.store.swap(&self.key, &value).await?;
        if previous.as_deref() != Some(current.as_str()) {
            trace!("lost the race to reclaim stale lock {}", self.key);
            self.undo_lost_swap(now, previous).await?;
            return Ok(false);
        }
        self.state = LockState::Locked;
        self.store.expire(&self.key, self.ttl_secs).await?;
        info!(
            "Reclaimed stale lock {} from {}, expired at {}",
            self.key, held.owner_token, held.expires_at_epoch
        );
        Ok(true)
    }

    ///
    /// Our swap overwrote `previous`, written by whoever won the race. If that is a live lock, put
    /// it back with its remaining ttl so its owner can still release it. Otherwise keep our value
    /// and give it a ttl, since swapped values carry none.
    ///
    async fn undo_lost_swap(&self, now: i64, previous: Option<String>) -> Result<(), StoreError> {
        let winner = previous
            .as_deref()
            .and_then(StoredLockValue::parse)
            .filter(|held| !held.is_expired(now));
        match (winner, previous) {
            (Some(held), Some(raw)) => {
                self.store.swap(&self.key, &raw).await?;
                let remaining = held.expires_at_epoch.saturating_sub(now).max(1) as u64;
                self.store.expire(&self.key, remaining).await?;
                trace!("restored lock {} held by {}", self.key, held.owner_token);
            }
            _ => self.store.expire(&self.key, self.ttl_secs).await?,
        }
        Ok(())
    }

    ///
    /// Releases the lock if this handle holds it.
    ///
    /// The stored entry is deleted only if it still carries this handle's token, so a lock
    /// reclaimed by someone else after our lease lapsed is left untouched. The handle is
    /// unlocked in every case.
    ///
    pub async fn release(&mut self) -> Result<(), StoreError> {
        if !self.is_locked() {
            return Ok(());
        }
        self.state = LockState::Unlocked;
        release_entry(self.store.as_ref(), &self.key, &self.owner_token).await?;
        Ok(())
    }

    ///
    /// Acquires the lock and returns a guard that releases it when dropped.
    ///
    /// Returns `None` if the lock is taken.
    ///
    pub async fn try_guard(&mut self) -> Result<Option<LockGuard<'_>>, StoreError> {
        if self.acquire().await? {
            Ok(Some(LockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }

    ///
    /// Runs `f` while holding the lock.
    ///
    /// Fails with [`LockError::AlreadyTaken`] if the lock could not be acquired. The lock is
    /// released once `f` completes; if the returned future is dropped or `f` panics, the release
    /// is handed to the [`LockManager`] background worker.
    ///
    pub async fn scope<T, F, Fut>(&mut self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.try_guard().await? else {
            return Err(LockError::AlreadyTaken);
        };
        let out = f().await;
        guard.release().await?;
        Ok(out)
    }

    fn enqueue_release(&mut self) {
        if !self.is_locked() {
            return;
        }
        self.state = LockState::Unlocked;
        let _ = self.release_queue_tx.send(ReleaseCommand {
            key: self.key.clone(),
            owner_token: self.owner_token.clone(),
            release_callback: self.release_callback_tx.clone(),
        });
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.enqueue_release();
    }
}

///
/// Holds a [`Lock`] in the locked state for the lifetime of the guard.
///
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard<'a> {
    lock: &'a mut Lock,
}

impl LockGuard<'_> {
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.lock.release().await
    }
}

impl Deref for LockGuard<'_> {
    type Target = Lock;
    fn deref(&self) -> &Lock {
        self.lock
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.enqueue_release();
    }
}
