use {crate::lock::LockError, serde::Deserialize};

pub const DEFAULT_KEY_PREFIX: &str = "kv-lock-";
pub const DEFAULT_TTL_SECS: u64 = 5;
pub const DEFAULT_RECLAIM_MIN_TTL_SECS: u64 = 5;
pub const DEFAULT_RECLAIM_PROBABILITY: f64 = 0.05;

///
/// Longest accepted lock ttl, in seconds. Same bound as etcd's maximum lease ttl, and far below
/// anything that could overflow an epoch deadline.
///
pub const MAX_TTL_SECS: u64 = 9_000_000_000;

///
/// Rejects a ttl of zero or above [`MAX_TTL_SECS`].
///
pub fn check_ttl(ttl_secs: u64) -> Result<(), LockError> {
    if ttl_secs == 0 || ttl_secs > MAX_TTL_SECS {
        return Err(LockError::InvalidTtl(ttl_secs));
    }
    Ok(())
}

///
/// Options shared by every lock created from a [`crate::lock::LockManager`].
///
/// Can be deserialized from a config file, missing fields take their default value.
///
/// ```
/// use rust_kv_lock::options::LockOptions;
///
/// let opts: LockOptions = serde_json::from_str(r#"{"key_prefix": "jobs-", "ttl_secs": 30}"#).unwrap();
/// assert_eq!(opts.reclaim_probability, 0.05);
/// ```
///
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    ///
    /// Prepended to every resource key to namespace lock entries from other data in the store.
    ///
    pub key_prefix: String,

    ///
    /// Default lease duration of a lock, in seconds.
    ///
    pub ttl_secs: u64,

    ///
    /// Stale lock reclamation is skipped for locks whose ttl is at most this many seconds.
    ///
    pub reclaim_min_ttl_secs: u64,

    ///
    /// Chance that a failed acquire on an eligible lock probes for a stale entry.
    ///
    pub reclaim_probability: f64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
            reclaim_min_ttl_secs: DEFAULT_RECLAIM_MIN_TTL_SECS,
            reclaim_probability: DEFAULT_RECLAIM_PROBABILITY,
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_reclaim_min_ttl_secs(mut self, reclaim_min_ttl_secs: u64) -> Self {
        self.reclaim_min_ttl_secs = reclaim_min_ttl_secs;
        self
    }

    pub fn with_reclaim_probability(mut self, reclaim_probability: f64) -> Self {
        self.reclaim_probability = reclaim_probability;
        self
    }

    pub fn validate(&self) -> Result<(), LockError> {
        check_ttl(self.ttl_secs)?;
        if !(0.0..=1.0).contains(&self.reclaim_probability) {
            return Err(LockError::InvalidReclaimProbability(self.reclaim_probability));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = LockOptions::default();
        assert_eq!(opts.key_prefix, "kv-lock-");
        assert_eq!(opts.ttl_secs, 5);
        assert_eq!(opts.reclaim_min_ttl_secs, 5);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err = LockOptions::new().with_ttl_secs(0).validate();
        assert!(matches!(err, Err(LockError::InvalidTtl(0))));
    }

    #[test]
    fn ttl_beyond_max_is_rejected() {
        assert!(LockOptions::new().with_ttl_secs(MAX_TTL_SECS).validate().is_ok());
        for ttl in [MAX_TTL_SECS + 1, i64::MAX as u64, u64::MAX] {
            let err = LockOptions::new().with_ttl_secs(ttl).validate();
            assert!(matches!(err, Err(LockError::InvalidTtl(t)) if t == ttl));
        }
    }

    #[test]
    fn probability_out_of_range_is_rejected() {
        for p in [-0.1, 1.5, f64::NAN] {
            let err = LockOptions::new().with_reclaim_probability(p).validate();
            assert!(matches!(err, Err(LockError::InvalidReclaimProbability(_))));
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let opts: LockOptions = serde_json::from_str(r#"{"ttl_secs": 30}"#).unwrap();
        assert_eq!(opts, LockOptions::new().with_ttl_secs(30));
    }
}
