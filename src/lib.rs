///
/// Provides the lock handle, its manager and scoped guards
///
pub mod lock;

///
/// Key-value store abstraction the lock is built on, with etcd and in-memory backends
///
pub mod store;

///
/// Encoding of the value stored under a lock key
///
pub mod value;

///
/// Owner token generation
///
pub mod token;

///
/// Wall-clock abstraction, lock deadlines are epoch seconds
pub mod clock;

///
/// Lock configuration
///
pub mod options;

///
/// Utility function to manage various transient errors.
pub mod retry;

pub use lock::{spawn_lock_manager, Lock, LockError, LockManager, LockState};
