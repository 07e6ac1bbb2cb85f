//! NATS JetStream KV implementation of [`StateStore`].
//!
//! Compare-and-set maps onto KV revision-guarded updates. JetStream KV has
//! no per-key TTL, so each record carries its own expiry and expired records
//! are treated as absent on read.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_nats::jetstream::kv;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{StateStore, StateStoreError};

/// How many times optimistic counter updates retry on revision conflicts
/// before reporting contention as a backend error.
const CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    v: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp_ms: Option<u64>,
}

impl Record {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            v: value.to_string(),
            exp_ms: ttl.map(|t| epoch_ms() + t.as_millis() as u64),
        }
    }

    fn live(&self) -> bool {
        self.exp_ms.map_or(true, |at| epoch_ms() < at)
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Distributed [`StateStore`] over a JetStream KV bucket.
pub struct NatsStateStore {
    kv: kv::Store,
}

impl NatsStateStore {
    /// Connect to the given NATS URL and open (or create) the bucket.
    pub async fn connect(url: &str, bucket: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        let jetstream = async_nats::jetstream::new(client);
        let kv = jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await?;
        info!(bucket, "connected to NATS state store");
        Ok(Self { kv })
    }

    pub fn from_store(kv: kv::Store) -> Self {
        Self { kv }
    }

    /// KV keys may not contain `:`; the documented key schema uses it as a
    /// separator, so it is mapped to `.` inside the bucket.
    fn encode_key(key: &str) -> String {
        key.replace(':', ".")
    }

    /// Fetch the live record and its revision. Expired records read as
    /// absent but keep their revision so writers can still CAS over them.
    async fn entry(&self, key: &str) -> Result<(Option<Record>, u64), StateStoreError> {
        match self.kv.entry(Self::encode_key(key)).await {
            Ok(Some(entry)) => {
                if matches!(
                    entry.operation,
                    kv::Operation::Delete | kv::Operation::Purge
                ) {
                    return Ok((None, entry.revision));
                }
                let record: Record = serde_json::from_slice(&entry.value).map_err(|e| {
                    StateStoreError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                if record.live() {
                    Ok((Some(record), entry.revision))
                } else {
                    Ok((None, entry.revision))
                }
            }
            Ok(None) => Ok((None, 0)),
            Err(e) => Err(StateStoreError::Unavailable(e.to_string())),
        }
    }

    fn payload(record: &Record) -> Result<Vec<u8>, StateStoreError> {
        serde_json::to_vec(record).map_err(|e| StateStoreError::Backend(e.to_string()))
    }

    /// Revision-guarded write. Revision 0 means "create".
    async fn write_at(
        &self,
        key: &str,
        record: &Record,
        revision: u64,
    ) -> Result<bool, StateStoreError> {
        let encoded = Self::encode_key(key);
        let payload = Self::payload(record)?;
        let outcome: std::result::Result<(), String> = if revision == 0 {
            self.kv
                .create(&encoded, payload.into())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        } else {
            self.kv
                .update(&encoded, payload.into(), revision)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        };
        match outcome {
            Ok(()) => Ok(true),
            Err(e) => {
                // A lost revision race is expected under contention; callers
                // re-read and retry.
                debug!(key, revision, error = %e, "kv write lost revision race");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl StateStore for NatsStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        let (record, _) = self.entry(key).await?;
        Ok(record.map(|r| r.v))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateStoreError> {
        let payload = Self::payload(&Record::new(value, ttl))?;
        self.kv
            .put(Self::encode_key(key), payload.into())
            .await
            .map(|_| ())
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        self.kv
            .purge(Self::encode_key(key))
            .await
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateStoreError> {
        for _ in 0..CAS_ATTEMPTS {
            let (record, revision) = self.entry(key).await?;
            let (next, next_record) = match record {
                Some(r) => {
                    let current =
                        r.v.parse::<i64>().map_err(|_| StateStoreError::Corrupt {
                            key: key.to_string(),
                            reason: format!("expected integer, got {:?}", r.v),
                        })?;
                    let next = current.saturating_add(delta);
                    // Preserve the expiry set when the counter was created.
                    let record = Record {
                        v: next.to_string(),
                        exp_ms: r.exp_ms,
                    };
                    (next, record)
                }
                None => (delta, Record::new(&delta.to_string(), ttl)),
            };
            if self.write_at(key, &next_record, revision).await? {
                return Ok(next);
            }
        }
        Err(StateStoreError::Backend(format!(
            "counter {key} contended beyond {CAS_ATTEMPTS} attempts"
        )))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateStoreError> {
        let (record, revision) = self.entry(key).await?;
        if record.as_ref().map(|r| r.v.as_str()) != expected {
            return Ok(false);
        }
        self.write_at(key, &Record::new(value, ttl), revision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_strips_colons() {
        assert_eq!(
            NatsStateStore::encode_key("circuit:openai:state"),
            "circuit.openai.state"
        );
    }

    #[test]
    fn record_expiry() {
        let live = Record::new("1", Some(Duration::from_secs(60)));
        assert!(live.live());
        let expired = Record {
            v: "1".to_string(),
            exp_ms: Some(epoch_ms().saturating_sub(1)),
        };
        assert!(!expired.live());
    }
}
