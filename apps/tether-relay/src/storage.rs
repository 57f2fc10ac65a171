//! Redis-backed store adapter.
//!
//! Sessions are JSON strings under `session:{id}` with a safety-net
//! TTL; signals are insertion-ordered lists under `signals:{id}` with a
//! pub/sub channel carrying each insert to push subscribers; devices
//! are hashes under `device:{id}` so the holder field can be swapped by
//! a single conditional script. The sweeper owns logical expiry; the
//! key TTLs only stop garbage outliving a dead sweeper.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;
use uuid::Uuid;

use tether_core::store::{DeviceStore, SessionStore, SignalFeed, SignalStore};
use tether_core::StoreError;
use tether_proto::{DeviceRecord, NewSignal, SessionRecord, SignalRecord, Side};

/// Conditional update guarded by the device's current holder: only one
/// caller wins when two claims race.
static SWAP_HOLDER: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
        local current = redis.call('HGET', KEYS[1], 'holder')
        if current == false then current = '' end
        if current ~= ARGV[1] then return 0 end
        redis.call('HSET', KEYS[1], 'holder', ARGV[2], 'holder_type', ARGV[3])
        return 1
        "#,
    )
});

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    key_ttl_seconds: u64,
}

impl RedisStore {
    pub async fn new(redis_url: &str, key_ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(backend)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(backend)?;
        Ok(Self {
            client,
            conn,
            key_ttl_seconds,
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            cursor = next_cursor;
            keys.extend(batch);
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn session_key(id: Uuid) -> String {
    format!("session:{id}")
}

fn signals_key(id: Uuid) -> String {
    format!("signals:{id}")
}

fn signal_seq_key(id: Uuid) -> String {
    format!("signals:{id}:seq")
}

fn signal_channel(id: Uuid) -> String {
    format!("signals:{id}:feed")
}

fn device_key(id: &str) -> String {
    format!("device:{id}")
}

fn device_fields(device: &DeviceRecord) -> Vec<(&'static str, String)> {
    vec![
        ("id", device.id.clone()),
        ("name", device.name.clone()),
        ("owner", device.owner.clone().unwrap_or_default()),
        ("is_online", if device.is_online { "1" } else { "0" }.to_string()),
        ("last_seen", device.last_seen.to_rfc3339()),
        ("holder", device.holder.clone().unwrap_or_default()),
        ("holder_type", device.holder_type.clone().unwrap_or_default()),
    ]
}

fn device_from_fields(fields: &HashMap<String, String>) -> Result<DeviceRecord, StoreError> {
    let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
    let optional = |name: &str| Some(get(name)).filter(|v| !v.is_empty());
    let last_seen = DateTime::parse_from_rfc3339(&get("last_seen"))
        .map(|d| d.with_timezone(&Utc))
        .map_err(|err| StoreError::Backend(format!("bad last_seen field: {err}")))?;
    Ok(DeviceRecord {
        id: get("id"),
        name: get("name"),
        owner: optional("owner"),
        is_online: get("is_online") == "1",
        last_seen,
        holder: optional("holder"),
        holder_type: optional("holder_type"),
    })
}

#[async_trait]
impl SignalStore for RedisStore {
    async fn insert_signal(&self, signal: NewSignal) -> Result<SignalRecord, StoreError> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn
            .incr(signal_seq_key(signal.session_id), 1)
            .await
            .map_err(backend)?;
        let record = SignalRecord {
            id: Uuid::new_v4(),
            session_id: signal.session_id,
            from_side: signal.from_side,
            msg_type: signal.msg_type,
            payload: signal.payload,
            created_at: Utc::now(),
            seq,
        };
        let serialized = serde_json::to_string(&record)?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(signals_key(record.session_id))
            .arg(&serialized)
            .ignore()
            .cmd("EXPIRE")
            .arg(signals_key(record.session_id))
            .arg(self.key_ttl_seconds)
            .ignore()
            .cmd("EXPIRE")
            .arg(signal_seq_key(record.session_id))
            .arg(self.key_ttl_seconds)
            .ignore()
            .cmd("PUBLISH")
            .arg(signal_channel(record.session_id))
            .arg(&serialized)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)?;
        Ok(record)
    }

    async fn signals_for_session(
        &self,
        session_id: Uuid,
        sides: &[Side],
        after_seq: u64,
    ) -> Result<Vec<SignalRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(signals_key(session_id), 0, -1)
            .await
            .map_err(backend)?;
        let mut rows: Vec<SignalRecord> = raw
            .iter()
            .filter_map(|json| serde_json::from_str::<SignalRecord>(json).ok())
            .filter(|r| r.seq > after_seq && sides.contains(&r.from_side))
            .collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    async fn subscribe_signals(&self, session_id: Uuid) -> Result<SignalFeed, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| StoreError::FeedUnavailable(err.to_string()))?;
        pubsub
            .subscribe(signal_channel(session_id))
            .await
            .map_err(|err| StoreError::FeedUnavailable(err.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<SignalRecord>(&payload) {
                    Ok(record) => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(session = %session_id, error = %err, "bad feed payload");
                    }
                }
            }
        });
        Ok(SignalFeed::new(rx))
    }

    async fn prune_signals_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut pruned = 0u64;
        for key in self.scan_keys("signals:*").await? {
            if key.ends_with(":seq") {
                continue;
            }
            let raw: Vec<String> = conn.lrange(&key, 0, -1).await.map_err(backend)?;
            // The list is in insertion order, so everything past
            // retention sits at the head.
            let stale = raw
                .iter()
                .take_while(|json| {
                    serde_json::from_str::<SignalRecord>(json)
                        .map(|r| r.created_at < cutoff)
                        .unwrap_or(true)
                })
                .count();
            if stale > 0 {
                let _: Option<Vec<String>> = conn
                    .lpop(&key, NonZeroUsize::new(stale))
                    .await
                    .map_err(backend)?;
                pruned += stale as u64;
            }
        }
        Ok(pruned)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let serialized = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(session_key(session.id), serialized, self.key_ttl_seconds)
            .await
            .map_err(backend)
    }

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(session_key(id)).await.map_err(backend)?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.insert_session(session).await
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>((session_key(id), signals_key(id), signal_seq_key(id)))
            .await
            .map_err(backend)
    }

    async fn open_sessions_for_device(
        &self,
        device_id: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .all_sessions()
            .await?
            .into_iter()
            .filter(|s| s.device_id.as_deref() == Some(device_id) && s.is_open())
            .collect())
    }

    async fn session_by_pin_hash(
        &self,
        pin_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .all_sessions()
            .await?
            .into_iter()
            .find(|s| s.pin_hash == pin_hash))
    }

    async fn all_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let keys = self.scan_keys("session:*").await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|json| serde_json::from_str::<SessionRecord>(&json).ok())
            .collect())
    }
}

#[async_trait]
impl DeviceStore for RedisStore {
    async fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(device_key(&device.id), &device_fields(device))
            .await
            .map_err(backend)
    }

    async fn device(&self, id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(device_key(id)).await.map_err(backend)?;
        if fields.is_empty() {
            return Ok(None);
        }
        device_from_fields(&fields).map(Some)
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut devices = Vec::new();
        for key in self.scan_keys("device:*").await? {
            let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(backend)?;
            if !fields.is_empty() {
                devices.push(device_from_fields(&fields)?);
            }
        }
        Ok(devices)
    }

    async fn delete_device(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(device_key(id)).await.map_err(backend)
    }

    async fn record_heartbeat(&self, id: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(device_key(id)).await.map_err(backend)?;
        if !exists {
            return Ok(false);
        }
        conn.hset_multiple::<_, _, _, ()>(
            device_key(id),
            &[
                ("is_online", "1".to_string()),
                ("last_seen", seen_at.to_rfc3339()),
            ],
        )
        .await
        .map_err(backend)?;
        Ok(true)
    }

    async fn swap_holder(
        &self,
        device_id: &str,
        expected: Option<&str>,
        new_holder: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (holder, holder_type) = new_holder.unwrap_or(("", ""));
        let swapped: i64 = SWAP_HOLDER
            .key(device_key(device_id))
            .arg(expected.unwrap_or(""))
            .arg(holder)
            .arg(holder_type)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(swapped == 1)
    }

    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut flipped = Vec::new();
        for device in self.devices().await? {
            if device.is_online && device.last_seen < cutoff {
                conn.hset::<_, _, _, ()>(device_key(&device.id), "is_online", "0")
                    .await
                    .map_err(backend)?;
                flipped.push(device.id);
            }
        }
        Ok(flipped)
    }
}
