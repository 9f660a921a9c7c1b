use {async_trait::async_trait, thiserror::Error};

///
/// Store backed by etcd, TTL is implemented with etcd leases.
///
pub mod etcd;

///
/// Process-local store, mostly useful for tests and single-host setups.
///
pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

///
/// Atomic single-key primitives a [`crate::lock::Lock`] needs from the shared store.
///
/// Every method is expected to be atomic with respect to other clients of the store.
/// Nothing is assumed about the atomicity of a *sequence* of calls.
///
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    ///
    /// Creates `key` with `value` and a time-to-live of `ttl_secs` only if the key does not exist.
    ///
    /// Returns `true` if the key was created by this call.
    ///
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    ///
    /// Replaces the value of `key` and returns the previous one.
    ///
    /// The new value carries no time-to-live, callers re-apply it with [`KeyValueStore::expire`].
    ///
    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    ///
    /// (Re)sets the remaining time-to-live of `key`, does nothing if the key is absent.
    ///
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    ///
    /// Deletes `key` only if its current value is exactly `expected`.
    ///
    /// The default implementation is a get followed by a delete, which leaves a window where
    /// another client may overwrite the value in between. Backends with a native
    /// compare-and-delete should override it.
    ///
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
