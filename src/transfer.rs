//! Per-key value transfer.
//!
//! Reads a key's declared type and full value from a source endpoint and
//! rewrites an equivalent value on a target endpoint, followed by the
//! residual time-to-live. Rewrites are idempotent: container destinations
//! are deleted before re-applying, so retrying a window never duplicates
//! list entries or set members.

use bytes::Bytes;
use tracing::trace;

use crate::client::{ClientError, Connection};
use crate::error::{MigrateError, Result};

/// Elements written per bulk command, bounding request sizes for very large
/// containers.
const WRITE_CHUNK: usize = 512;

/// A fully-materialized value of one of the five supported types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Plain string (raw bytes).
    Str(Bytes),
    /// Field → value mapping.
    Hash(Vec<(Bytes, Bytes)>),
    /// Ordered sequence.
    List(Vec<Bytes>),
    /// Unordered unique collection.
    Set(Vec<Bytes>),
    /// Score-ordered unique collection.
    SortedSet(Vec<(Bytes, f64)>),
}

impl Value {
    /// Type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "zset",
        }
    }

    /// Rough payload size, for transfer statistics.
    pub fn approx_bytes(&self) -> u64 {
        match self {
            Value::Str(b) => b.len() as u64,
            Value::Hash(pairs) => pairs.iter().map(|(f, v)| (f.len() + v.len()) as u64).sum(),
            Value::List(items) | Value::Set(items) => {
                items.iter().map(|i| i.len() as u64).sum()
            }
            Value::SortedSet(scored) => scored.iter().map(|(m, _)| m.len() as u64 + 8).sum(),
        }
    }

    /// Whether the value holds no elements. An empty container cannot exist
    /// in the store; reading one means the key vanished mid-read.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(pairs) => pairs.is_empty(),
            Value::List(items) | Value::Set(items) => items.is_empty(),
            Value::SortedSet(scored) => scored.is_empty(),
        }
    }
}

/// Outcome of transferring one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The value was written to the target.
    Copied,
    /// The key was absent or expired at read time; a defined no-op.
    Skipped,
}

/// Read the full value for `key`, dispatching on the source-declared type.
///
/// Returns `Ok(None)` for absent/expired keys. Types outside the supported
/// five fail with [`MigrateError::UnsupportedType`].
pub async fn read_value(source: &mut Connection, key: &[u8]) -> Result<Option<Value>> {
    let identity = source.endpoint().identity();
    let type_name = source
        .key_type(key)
        .await
        .map_err(|e| MigrateError::source(&identity, e))?;

    let src = |e: ClientError| MigrateError::source(&identity, e);

    let value = match type_name.as_str() {
        "none" => return Ok(None),
        "string" => match source.get(key).await.map_err(src)? {
            Some(bytes) => Value::Str(bytes),
            // Expired between TYPE and GET.
            None => return Ok(None),
        },
        "hash" => Value::Hash(source.hgetall(key).await.map_err(src)?),
        "list" => Value::List(source.lrange(key, 0, -1).await.map_err(src)?),
        "set" => Value::Set(source.smembers(key).await.map_err(src)?),
        "zset" => Value::SortedSet(source.zrange_withscores(key).await.map_err(src)?),
        other => {
            return Err(MigrateError::UnsupportedType {
                key: String::from_utf8_lossy(key).into_owned(),
                type_name: other.to_string(),
            })
        }
    };

    if value.is_empty() && !matches!(value, Value::Str(_)) {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Residual TTL of `key` in seconds, `None` when the key never expires.
pub async fn read_ttl(source: &mut Connection, key: &[u8]) -> Result<Option<i64>> {
    let identity = source.endpoint().identity();
    let ttl = source
        .ttl(key)
        .await
        .map_err(|e| MigrateError::source(&identity, e))?;
    // -1 = no expiry, -2 = gone; both mean nothing to re-apply.
    Ok((ttl >= 0).then_some(ttl))
}

/// Write `value` under `key` on the target.
///
/// Container types delete the destination key first so a retried window
/// overwrites instead of appending.
pub async fn write_value(target: &mut Connection, key: &[u8], value: &Value) -> Result<()> {
    let identity = target.endpoint().identity();
    let tgt = |e: ClientError| MigrateError::target(&identity, e);

    match value {
        Value::Str(bytes) => target.set(key, bytes).await.map_err(tgt)?,
        Value::Hash(pairs) => {
            target.del(key).await.map_err(tgt)?;
            for chunk in pairs.chunks(WRITE_CHUNK) {
                target.hmset(key, chunk).await.map_err(tgt)?;
            }
        }
        Value::List(items) => {
            target.del(key).await.map_err(tgt)?;
            for chunk in items.chunks(WRITE_CHUNK) {
                target.rpush(key, chunk).await.map_err(tgt)?;
            }
        }
        Value::Set(members) => {
            target.del(key).await.map_err(tgt)?;
            for chunk in members.chunks(WRITE_CHUNK) {
                target.sadd(key, chunk).await.map_err(tgt)?;
            }
        }
        Value::SortedSet(scored) => {
            target.del(key).await.map_err(tgt)?;
            for chunk in scored.chunks(WRITE_CHUNK) {
                target.zadd(key, chunk).await.map_err(tgt)?;
            }
        }
    }
    Ok(())
}

/// Apply a residual TTL to the target key.
pub async fn write_ttl(target: &mut Connection, key: &[u8], ttl: i64) -> Result<()> {
    let identity = target.endpoint().identity();
    target
        .expire(key, ttl)
        .await
        .map(|_| ())
        .map_err(|e| MigrateError::target(&identity, e))
}

/// Move one key from `source` to `target`: read type + value, rewrite,
/// re-apply residual TTL. Returns the payload size alongside the outcome.
pub async fn transfer_key(
    source: &mut Connection,
    target: &mut Connection,
    key: &[u8],
) -> Result<(TransferOutcome, u64)> {
    let Some(value) = read_value(source, key).await? else {
        trace!(key = %String::from_utf8_lossy(key), "key absent at transfer time, skipping");
        return Ok((TransferOutcome::Skipped, 0));
    };

    write_value(target, key, &value).await?;

    // Residual lifetime, read after the value so a key observed alive above
    // lands with whatever remains now.
    if let Some(ttl) = read_ttl(source, key).await? {
        write_ttl(target, key, ttl).await?;
    }

    trace!(
        key = %String::from_utf8_lossy(key),
        kind = value.kind(),
        target = %target.endpoint(),
        "transferred"
    );
    Ok((TransferOutcome::Copied, value.approx_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind_names() {
        assert_eq!(Value::Str(Bytes::from("v")).kind(), "string");
        assert_eq!(Value::Hash(vec![]).kind(), "hash");
        assert_eq!(Value::List(vec![]).kind(), "list");
        assert_eq!(Value::Set(vec![]).kind(), "set");
        assert_eq!(Value::SortedSet(vec![]).kind(), "zset");
    }

    #[test]
    fn test_empty_containers_detected() {
        assert!(Value::Hash(vec![]).is_empty());
        assert!(Value::List(vec![]).is_empty());
        assert!(!Value::Str(Bytes::new()).is_empty());
        assert!(!Value::List(vec![Bytes::from("a")]).is_empty());
    }

    #[test]
    fn test_approx_bytes() {
        let v = Value::Hash(vec![(Bytes::from("ab"), Bytes::from("cde"))]);
        assert_eq!(v.approx_bytes(), 5);
        let v = Value::List(vec![Bytes::from("aa"), Bytes::from("b")]);
        assert_eq!(v.approx_bytes(), 3);
    }
}
