use core::time::Duration;
use std::sync::Arc;

use rust_kv_lock::{lock::spawn_lock_manager, options::LockOptions, store::etcd::EtcdStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = EtcdStore::connect(["http://localhost:2379"])
        .await
        .expect("failed to connect to etcd");

    let (lock_man_handle, lock_manager) =
        spawn_lock_manager(Arc::new(store), LockOptions::new().with_ttl_secs(10))
            .expect("invalid lock options");

    let lock_name = "example-lock";

    let mut my_lock = lock_manager.new_lock(lock_name).expect("failed to create lock");
    assert!(my_lock.acquire().await.expect("etcd failure"), "lock already taken");
    println!("Lock acquired in main task!");

    let lock_manager2 = lock_manager.clone();
    let h = tokio::spawn(async move {
        let mut lock = lock_manager2
            .new_lock(lock_name)
            .expect("failed to create lock");
        // `acquire` never waits, polling with a backoff is up to the caller.
        let mut backoff = Duration::from_millis(100);
        while !lock.acquire().await.expect("etcd failure") {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
        println!("Lock acquired in task 2!");
        lock.release().await.expect("etcd failure");
    });

    println!("Sleeping for 5 second...");
    for i in 1..=5 {
        println!("{}...", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    // Dropped locks are released by the lock manager.
    println!("Dropping lock!");
    drop(my_lock);

    println!("Waiting for task 2 to acquire lock...");
    h.await.expect("task 2 failed to acquire lock");

    drop(lock_manager);
    lock_man_handle.await.expect("lock manager failed");
    println!("Finished!");
}
