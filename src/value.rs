use serde::{Deserialize, Serialize};

///
/// Value stored under a lock key: who holds the lock and until when.
///
/// Encoded as a two-field JSON object, e.g. `{"expires_at":1700000005,"owner":"1f3a-0-Xb9..."}`.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLockValue {
    #[serde(rename = "expires_at")]
    pub expires_at_epoch: i64,
    #[serde(rename = "owner")]
    pub owner_token: String,
}

impl StoredLockValue {
    pub fn new(expires_at_epoch: i64, owner_token: impl Into<String>) -> Self {
        Self {
            expires_at_epoch,
            owner_token: owner_token.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("lock value is always serializable")
    }

    ///
    /// Parses a raw stored value. Anything that does not decode is treated as "no lock held".
    ///
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn is_expired(&self, now_epoch_secs: i64) -> bool {
        self.expires_at_epoch < now_epoch_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_value_parses_back() {
        let value = StoredLockValue::new(1_700_000_005, "abc-0-xyz");
        let raw = value.encode();
        assert_eq!(raw, r#"{"expires_at":1700000005,"owner":"abc-0-xyz"}"#);
        assert_eq!(StoredLockValue::parse(&raw), Some(value));
    }

    #[test]
    fn malformed_values_are_not_locks() {
        assert_eq!(StoredLockValue::parse(""), None);
        assert_eq!(StoredLockValue::parse("1700000005"), None);
        assert_eq!(StoredLockValue::parse(r#"{"expires_at":"soon","owner":"a"}"#), None);
        assert_eq!(StoredLockValue::parse(r#"{"owner":"a"}"#), None);
    }

    #[test]
    fn deadline_itself_is_not_expired() {
        let value = StoredLockValue::new(10, "a");
        assert!(!value.is_expired(10));
        assert!(value.is_expired(11));
    }
}
