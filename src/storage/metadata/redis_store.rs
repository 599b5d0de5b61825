//! Networked metadata store on Redis.
//!
//! Records are stored as JSON strings under `{prefix}:secret:{id}` without a
//! Redis TTL; expiry is enforced by the vault and the sweeper like every other
//! backend. A sorted set `{prefix}:expiry` scored by `expires_at` in
//! milliseconds lets `list_expired` run as a range query.

use crate::error::{StoreError, StoreResult};
use crate::secret::SecretRecord;
use crate::storage::MetadataStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::{debug, info};

/// Drops an index entry only while its record key is still absent, so a
/// record written since the listing keeps its entry.
const PRUNE_STALE_ENTRY: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return redis.call('ZREM', KEYS[2], ARGV[1])
end
return 0
";

#[derive(Clone)]
pub struct RedisMetadataStore {
    conn: ConnectionManager,
    keys: KeyLayout,
    prune: redis::Script,
}

/// Key names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
        }
    }

    fn record(&self, id: &str) -> String {
        format!("{}:secret:{}", self.prefix, id)
    }

    fn index(&self) -> String {
        format!("{}:expiry", self.prefix)
    }
}

fn index_score(expires_at: DateTime<Utc>) -> i64 {
    expires_at.timestamp_millis()
}

fn create_pipeline(keys: &KeyLayout, record: &SecretRecord, encoded: String) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("SET")
        .arg(keys.record(&record.id))
        .arg(encoded)
        .ignore()
        .cmd("ZADD")
        .arg(keys.index())
        .arg(index_score(record.expires_at))
        .arg(&record.id)
        .ignore();
    pipe
}

fn delete_pipeline(keys: &KeyLayout, id: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("DEL")
        .arg(keys.record(id))
        .ignore()
        .cmd("ZREM")
        .arg(keys.index())
        .arg(id)
        .ignore();
    pipe
}

/// Split an index range and its `MGET` answers into records expired at or
/// before `before`, and ids with no record behind them.
fn partition_expired(
    ids: Vec<String>,
    values: Vec<Option<String>>,
    before: DateTime<Utc>,
) -> StoreResult<(Vec<SecretRecord>, Vec<String>)> {
    let mut expired = Vec::with_capacity(ids.len());
    let mut stale = Vec::new();
    for (id, value) in ids.into_iter().zip(values) {
        match value {
            Some(json) => {
                let record: SecretRecord = serde_json::from_str(&json)?;
                // Scores are millisecond-truncated; compare exactly.
                if record.expires_at <= before {
                    expired.push(record);
                }
            }
            None => stale.push(id),
        }
    }
    Ok((expired, stale))
}

impl RedisMetadataStore {
    /// Connect and verify the server answers PING.
    pub async fn connect(url: &str, prefix: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let store = Self::with_connection(conn, prefix);

        let mut conn = store.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to redis metadata store (prefix {})", store.keys.prefix);
        Ok(store)
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            keys: KeyLayout::new(prefix),
            prune: redis::Script::new(PRUNE_STALE_ENTRY),
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim().trim_end_matches(':');
    if prefix.is_empty() {
        "ephemera".to_string()
    } else {
        prefix.to_string()
    }
}

impl std::fmt::Debug for RedisMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMetadataStore")
            .field("prefix", &self.keys.prefix)
            .finish()
    }
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn create(&self, record: &SecretRecord) -> StoreResult<()> {
        let encoded = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let _: () = create_pipeline(&self.keys, record, encoded)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<SecretRecord> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.record(id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = delete_pipeline(&self.keys, id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<SecretRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.index())
            .arg("-inf")
            .arg(index_score(before))
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let record_keys: Vec<String> = ids.iter().map(|id| self.keys.record(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&record_keys)
            .query_async(&mut conn)
            .await?;

        let (expired, stale) = partition_expired(ids, values, before)?;
        if !stale.is_empty() {
            let mut pruned = 0;
            for id in &stale {
                let removed: i64 = self
                    .prune
                    .key(self.keys.record(id))
                    .key(self.keys.index())
                    .arg(id)
                    .invoke_async(&mut conn)
                    .await?;
                pruned += removed;
            }
            debug!("Pruned {} of {} stale expiry index entries", pruned, stale.len());
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::PayloadType;
    use chrono::Duration;

    // Server-backed tests are ignored by default. Run them with a local
    // server: REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored
    async fn connect() -> RedisMetadataStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("ephemera-test-{}", uuid::Uuid::new_v4().simple());
        RedisMetadataStore::connect(&url, &prefix).await.unwrap()
    }

    fn record(id: &str, expires_at: DateTime<Utc>) -> SecretRecord {
        SecretRecord {
            id: id.to_string(),
            file_name: String::new(),
            content_type: "text/plain".to_string(),
            size: 4,
            expires_at,
            payload_type: PayloadType::Text,
            proof_record: vec![1],
        }
    }

    fn packed(pipe: &redis::Pipeline) -> String {
        String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned()
    }

    #[test]
    fn test_prefix_normalisation() {
        assert_eq!(normalize_prefix("ns:::"), "ns");
        assert_eq!(normalize_prefix(" app "), "app");
        assert_eq!(normalize_prefix(""), "ephemera");
    }

    #[test]
    fn test_key_layout() {
        let keys = KeyLayout::new("tenant:");
        assert_eq!(keys.record("abc"), "tenant:secret:abc");
        assert_eq!(keys.index(), "tenant:expiry");
    }

    #[test]
    fn test_index_score_is_epoch_millis() {
        let at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(index_score(at), 1_767_225_600_123);
    }

    #[test]
    fn test_create_pipeline_writes_record_and_index_atomically() {
        let keys = KeyLayout::new("ns");
        let rec = record("abc", Utc::now());
        let packed = packed(&create_pipeline(&keys, &rec, "{}".to_string()));

        assert!(packed.contains("MULTI"));
        assert!(packed.contains("EXEC"));
        assert!(packed.contains("ns:secret:abc"));
        assert!(packed.contains("ZADD"));
        assert!(packed.contains("ns:expiry"));
        assert!(packed.contains(&index_score(rec.expires_at).to_string()));
    }

    #[test]
    fn test_delete_pipeline_removes_record_and_index_entry() {
        let packed = packed(&delete_pipeline(&KeyLayout::new("ns"), "abc"));
        assert!(packed.contains("MULTI"));
        assert!(packed.contains("DEL"));
        assert!(packed.contains("ns:secret:abc"));
        assert!(packed.contains("ZREM"));
        assert!(packed.contains("ns:expiry"));
    }

    #[test]
    fn test_partition_expired() {
        let now = Utc::now();
        let old = record("old", now - Duration::minutes(1));
        // Can share the millisecond score of `now` while expiring after it
        let edge = record("edge", now + Duration::microseconds(1));
        let ids = vec!["old".to_string(), "ghost".to_string(), "edge".to_string()];
        let values = vec![
            Some(serde_json::to_string(&old).unwrap()),
            None,
            Some(serde_json::to_string(&edge).unwrap()),
        ];

        let (expired, stale) = partition_expired(ids, values, now).unwrap();
        assert_eq!(expired, vec![old]);
        assert_eq!(stale, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_partition_rejects_corrupt_record() {
        let err = partition_expired(
            vec!["bad".to_string()],
            vec![Some("not json".to_string())],
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn test_round_trip_against_server() {
        let store = connect().await;
        let rec = record("a", Utc::now() + Duration::hours(1));
        store.create(&rec).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), rec);
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    #[ignore]
    async fn test_list_expired_prunes_stale_index() {
        let store = connect().await;
        let now = Utc::now();
        store.create(&record("old", now - Duration::minutes(1))).await.unwrap();
        store.create(&record("live", now + Duration::minutes(1))).await.unwrap();

        // Orphan index entry with no record behind it
        let mut conn = store.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(store.keys.index())
            .arg(0)
            .arg("ghost")
            .query_async(&mut conn)
            .await
            .unwrap();

        let expired = store.list_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");

        let remaining: Vec<String> = redis::cmd("ZRANGE")
            .arg(store.keys.index())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(!remaining.contains(&"ghost".to_string()));

        store.delete("old").await.unwrap();
        store.delete("live").await.unwrap();
    }
}
