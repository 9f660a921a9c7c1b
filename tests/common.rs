#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use rust_kv_lock::{
    clock::ManualClock,
    lock::{spawn_lock_manager_with, LockManager, LockManagerHandle},
    options::LockOptions,
    store::{memory::InMemoryStore, KeyValueStore},
    token::TokenSource,
};

pub const START_EPOCH_SECS: i64 = 1_700_000_000;

///
/// Hands out `handle-0`, `handle-1`, ...
///
#[derive(Default)]
pub struct SequentialTokenSource {
    next: AtomicU64,
}

impl TokenSource for SequentialTokenSource {
    fn next_token(&self) -> String {
        format!("handle-{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub lock_man: LockManager,
    pub lock_man_handle: LockManagerHandle,
}

///
/// Routes lock logs to the test output, filtered by `RUST_LOG`.
///
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness(options: LockOptions) -> Harness {
    init_tracing();
    let clock = ManualClock::new(START_EPOCH_SECS);
    let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    let (lock_man_handle, lock_man) =
        manager_over(store.clone(), clock.clone(), options);
    Harness {
        store,
        clock,
        lock_man,
        lock_man_handle,
    }
}

pub fn manager_over(
    store: Arc<dyn KeyValueStore>,
    clock: ManualClock,
    options: LockOptions,
) -> (LockManagerHandle, LockManager) {
    spawn_lock_manager_with(
        store,
        options,
        Arc::new(clock),
        Arc::new(SequentialTokenSource::default()),
    )
    .expect("valid lock options")
}

///
/// Options where every eligible failed acquire probes for a stale lock.
///
pub fn always_reclaim() -> LockOptions {
    LockOptions::new().with_reclaim_probability(1.0)
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
