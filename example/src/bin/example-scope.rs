use std::sync::Arc;

use rust_kv_lock::{
    lock::{spawn_lock_manager, LockError},
    options::LockOptions,
    store::memory::InMemoryStore,
};

#[tokio::main]
async fn main() {
    let store = Arc::new(InMemoryStore::new());
    let (lock_man_handle, lock_manager) =
        spawn_lock_manager(store.clone(), LockOptions::new()).expect("invalid lock options");

    let mut holder = lock_manager.new_lock("report").expect("failed to create lock");
    let mut other = lock_manager.new_lock("report").expect("failed to create lock");

    // `scope` releases the lock once the closure is done, even if it is cancelled.
    let other_ref = &mut other;
    let rows = holder
        .scope(move || async move {
            match other_ref.scope(|| async {}).await {
                Err(LockError::AlreadyTaken) => println!("Second handle sees the lock taken"),
                result => println!("Unexpected: {result:?}"),
            }
            42
        })
        .await
        .expect("failed to run scope");
    println!("Scope produced {rows}, store now holds {} keys", store.len());

    drop(holder);
    drop(other);
    drop(lock_manager);
    lock_man_handle.await.expect("lock manager failed");
}
