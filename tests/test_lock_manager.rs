use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use common::{harness, random_str, Harness};
use rust_kv_lock::{
    lock::{LockError, LockState},
    options::LockOptions,
    store::KeyValueStore,
};
mod common;

#[tokio::test]
async fn dropping_locked_handle_releases_lock() {
    let Harness { store, lock_man, .. } = harness(LockOptions::new());
    let lock_name = random_str(10);
    let (mut lock1, release_notify) = lock_man
        .new_lock_with_release_notify(lock_name.as_str(), 5)
        .unwrap();
    assert!(lock1.acquire().await.unwrap());

    drop(lock1);
    release_notify.await;
    assert!(store.is_empty());

    let mut lock2 = lock_man.new_lock(lock_name).unwrap();
    assert!(lock2.acquire().await.unwrap());
}

#[tokio::test]
async fn dropping_unlocked_handle_touches_nothing() {
    let Harness { store, lock_man, .. } = harness(LockOptions::new());
    let (lock, release_notify) = lock_man.new_lock_with_release_notify("idle", 5).unwrap();

    drop(lock);
    release_notify.await;
    assert_eq!(store.call_counts().get, 0);
}

#[tokio::test]
async fn dropping_superseded_handle_keeps_new_owner() {
    let Harness {
        store,
        clock,
        lock_man,
        ..
    } = harness(LockOptions::new());
    let (mut a, a_released) = lock_man.new_lock_with_release_notify("job", 2).unwrap();
    let mut b = lock_man.new_lock_with_ttl("job", 2).unwrap();

    assert!(a.acquire().await.unwrap());
    clock.advance(Duration::from_secs(3));
    assert!(b.acquire().await.unwrap());

    drop(a);
    a_released.await;
    assert_eq!(store.len(), 1);
    assert!(store.get(b.get_key()).await.unwrap().is_some());
}

#[tokio::test]
async fn lock_manager_drains_pending_releases_on_shutdown() {
    let Harness {
        store,
        lock_man,
        lock_man_handle,
        ..
    } = harness(LockOptions::new());

    let mut locks = Vec::new();
    for _ in 0..3 {
        let mut lock = lock_man.new_lock(random_str(10)).unwrap();
        assert!(lock.acquire().await.unwrap());
        locks.push(lock);
    }
    assert_eq!(store.len(), 3);

    drop(locks);
    drop(lock_man);
    lock_man_handle
        .await
        .expect("failed to release lock manager handle");
    assert!(store.is_empty());
}

#[tokio::test]
async fn guard_holds_lock_until_released() {
    let Harness { store, lock_man, .. } = harness(LockOptions::new());
    let mut lock1 = lock_man.new_lock("guarded").unwrap();
    let mut lock2 = lock_man.new_lock("guarded").unwrap();

    let guard = lock1.try_guard().await.unwrap().expect("lock is free");
    assert!(guard.is_locked());
    assert!(lock2.try_guard().await.unwrap().is_none());

    guard.release().await.unwrap();
    assert_eq!(lock1.state(), LockState::Unlocked);
    assert!(store.is_empty());
    assert!(lock2.acquire().await.unwrap());
}

#[tokio::test]
async fn dropping_guard_releases_lock() {
    let Harness { store, lock_man, .. } = harness(LockOptions::new());
    let (mut lock, release_notify) = lock_man
        .new_lock_with_release_notify("guard-drop", 5)
        .unwrap();

    {
        let _guard = lock.try_guard().await.unwrap().expect("lock is free");
    }
    assert_eq!(lock.state(), LockState::Unlocked);
    release_notify.await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn scope_runs_under_lock_and_releases() {
    let Harness { store, lock_man, .. } = harness(LockOptions::new());
    let mut lock = lock_man.new_lock("scoped").unwrap();
    let key = lock.get_key().to_string();

    let store2 = store.clone();
    let seen = lock
        .scope(|| async move { store2.get(&key).await.unwrap().is_some() })
        .await
        .expect("scope");

    assert!(seen);
    assert!(!lock.is_locked());
    assert!(store.is_empty());
}

#[tokio::test]
async fn scope_on_taken_lock_does_not_run() {
    let Harness { lock_man, .. } = harness(LockOptions::new());
    let mut holder = lock_man.new_lock("busy").unwrap();
    let mut other = lock_man.new_lock("busy").unwrap();
    assert!(holder.acquire().await.unwrap());

    let ran = AtomicBool::new(false);
    let ran_ref = &ran;
    let result = other
        .scope(move || async move { ran_ref.store(true, Ordering::SeqCst) })
        .await;

    assert!(matches!(result, Err(LockError::AlreadyTaken)));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancelled_scope_still_releases() {
    let Harness { store, lock_man, .. } = harness(LockOptions::new());
    let (mut lock, release_notify) = lock_man
        .new_lock_with_release_notify("cancelled", 5)
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        lock.scope(futures::future::pending::<()>),
    )
    .await;

    assert!(result.is_err());
    assert!(!lock.is_locked());
    release_notify.await;
    assert!(store.is_empty());
}
