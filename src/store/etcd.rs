use {
    super::{KeyValueStore, StoreError},
    crate::retry::{retry_etcd, retry_etcd_txn},
    async_trait::async_trait,
    etcd_client::{
        Compare, CompareOp, DeleteOptions, KeyValue, PutOptions, Txn, TxnOp, TxnOpResponse,
        TxnResponse,
    },
    tonic::Code,
    tracing::{trace, warn},
};

///
/// [`KeyValueStore`] over etcd.
///
/// etcd has no per-key TTL, so every TTL is a freshly granted lease attached to the key.
/// Leases are never kept alive: they expire on their own, taking the key with them.
/// Each lease carries a single key, and is revoked as soon as that key is deleted or moved
/// to another lease. Keys stored here must not be attached to leases granted elsewhere.
///
/// Idempotent requests are retried on transient gRPC errors (see [`crate::retry::retry_etcd`]),
/// `swap` is sent exactly once.
///
#[derive(Clone)]
pub struct EtcdStore {
    etcd: etcd_client::Client,
}

impl EtcdStore {
    pub fn new(etcd: etcd_client::Client) -> Self {
        Self { etcd }
    }

    pub async fn connect<E, S>(endpoints: S) -> Result<Self, StoreError>
    where
        E: AsRef<str>,
        S: AsRef<[E]>,
    {
        let etcd = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self::new(etcd))
    }

    pub fn client(&self) -> &etcd_client::Client {
        &self.etcd
    }

    async fn grant_lease(&self, ttl_secs: u64) -> Result<i64, StoreError> {
        let ttl = i64::try_from(ttl_secs).map_err(|_| {
            etcd_client::Error::InvalidArgs(format!("lease ttl {ttl_secs} is out of range"))
        })?;
        let resp = retry_etcd(self.etcd.clone(), (ttl,), |mut etcd, (ttl,)| async move {
            etcd.lease_grant(ttl, None).await
        })
        .await?;
        Ok(resp.id())
    }

    ///
    /// Best effort: a lease we fail to revoke still expires on its own.
    ///
    async fn revoke_unused_lease(&self, lease_id: i64) {
        if lease_id == 0 {
            return;
        }
        let mut etcd = self.etcd.clone();
        match etcd.lease_revoke(lease_id).await {
            Ok(_) => trace!("revoked unused lease {lease_id:?}"),
            Err(etcd_client::Error::GRpcStatus(status)) if status.code() == Code::NotFound => {}
            Err(e) => warn!("failed to revoke unused lease {lease_id:?}, it will expire on its own: {e:?}"),
        }
    }

    ///
    /// Revokes the lease a key was attached to before it got deleted or overwritten.
    ///
    async fn revoke_detached_lease(&self, prev_kv: Option<&KeyValue>, new_lease_id: i64) {
        if let Some(lease_id) = prev_kv.map(KeyValue::lease) {
            if lease_id != new_lease_id {
                self.revoke_unused_lease(lease_id).await;
            }
        }
    }

    ///
    /// Runs `txn` and revokes `lease_id` when the txn did not take.
    ///
    async fn txn_with_lease(&self, txn: Txn, lease_id: Option<i64>) -> Result<TxnResponse, StoreError> {
        let result = retry_etcd_txn(self.etcd.clone(), txn).await;
        let succeeded = matches!(&result, Ok(resp) if resp.succeeded());
        if let (false, Some(lease_id)) = (succeeded, lease_id) {
            self.revoke_unused_lease(lease_id).await;
        }
        Ok(result?)
    }
}

fn put_options(lease_id: Option<i64>) -> Option<PutOptions> {
    lease_id.map(|id| PutOptions::new().with_lease(id))
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let lease_id = match ttl_secs {
            0 => None,
            ttl_secs => Some(self.grant_lease(ttl_secs).await?),
        };
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, put_options(lease_id))]);
        let created = self.txn_with_lease(txn, lease_id).await?.succeeded();
        trace!("set_if_absent {key}: created={created}");
        Ok(created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let resp = retry_etcd(self.etcd.clone(), (key.to_string(),), |etcd, (key,)| async move {
            etcd.kv_client().get(key, None).await
        })
        .await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned()))
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        // A replayed put would report our own value as the previous one.
        let resp = self
            .etcd
            .kv_client()
            .put(key, value, Some(PutOptions::new().with_prev_key()))
            .await?;
        self.revoke_detached_lease(resp.prev_key(), 0).await;
        Ok(resp
            .prev_key()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let resp = retry_etcd(self.etcd.clone(), (key.to_string(),), |etcd, (key,)| async move {
            etcd.kv_client()
                .delete(key, Some(DeleteOptions::new().with_prev_key()))
                .await
        })
        .await?;
        self.revoke_detached_lease(resp.prev_kvs().first(), 0).await;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let lease_id = match ttl_secs {
            0 => None,
            ttl_secs => Some(self.grant_lease(ttl_secs).await?),
        };
        // Re-attach the key to the new lease without touching its value, reading the lease it
        // leaves in the same txn.
        let opts = match lease_id {
            Some(id) => PutOptions::new().with_lease(id).with_ignore_value(),
            None => PutOptions::new().with_ignore_value(),
        };
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::get(key, None), TxnOp::put(key, "", Some(opts))]);
        let resp = self.txn_with_lease(txn, lease_id).await?;
        if resp.succeeded() {
            let previous = resp.op_responses().into_iter().find_map(|op| match op {
                TxnOpResponse::Get(get) => get.kvs().first().cloned(),
                _ => None,
            });
            self.revoke_detached_lease(previous.as_ref(), lease_id.unwrap_or(0))
                .await;
        }
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let txn = Txn::new()
            .when(vec![Compare::value(key, CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::delete(
                key,
                Some(DeleteOptions::new().with_prev_key()),
            )]);
        let resp = retry_etcd_txn(self.etcd.clone(), txn).await?;
        if !resp.succeeded() {
            return Ok(false);
        }
        let previous = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Delete(delete) => delete.prev_kvs().first().cloned(),
            _ => None,
        });
        self.revoke_detached_lease(previous.as_ref(), 0).await;
        Ok(true)
    }
}
