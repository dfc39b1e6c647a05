//! Typed client for Redis-protocol endpoints.
//!
//! One [`Connection`] per endpoint, multiplexing nothing: the engine issues
//! strictly synchronous request/response commands, which keeps replies
//! trivially attributable. Only the command set the transfer engine needs is
//! exposed.

pub mod pool;

pub use pool::ConnectionPool;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::endpoint::Endpoint;
use crate::protocol::{encode_command, parse_frame, Frame, ParseError};

/// Errors from a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection mid-reply.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// The server sent bytes that do not parse as RESP.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The server answered with an error reply (`-ERR ...`).
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with a frame type the command does not produce.
    #[error("unexpected reply to {command}: {got}")]
    UnexpectedReply {
        /// The command that was issued.
        command: &'static str,
        /// Short description of the offending frame.
        got: String,
    },
}

fn unexpected(command: &'static str, frame: &Frame) -> ClientError {
    ClientError::UnexpectedReply {
        command,
        got: format!("{:?}", frame),
    }
}

/// A connection to one endpoint, already `SELECT`ed to its database.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    buf: BytesMut,
    endpoint: Endpoint,
}

impl Connection {
    /// Connect and select the endpoint's database.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
            endpoint: endpoint.clone(),
        };
        conn.select(endpoint.db).await?;
        trace!(endpoint = %endpoint, "connected");
        Ok(conn)
    }

    /// The endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Issue one command and read one reply. Error replies become
    /// [`ClientError::Server`].
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Frame, ClientError> {
        let mut out = BytesMut::with_capacity(64);
        encode_command(args, &mut out);
        self.stream.write_all(&out).await?;
        let frame = self.read_frame().await?;
        if let Frame::Error(msg) = &frame {
            return Err(ClientError::Server(
                String::from_utf8_lossy(msg).into_owned(),
            ));
        }
        Ok(frame)
    }

    async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            if let Some(frame) = parse_frame(&mut self.buf)? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    // ── Key space ────────────────────────────────────────────────────────

    /// `SELECT db`
    pub async fn select(&mut self, db: u32) -> Result<(), ClientError> {
        let db = db.to_string();
        let frame = self.command(&[b"SELECT", db.as_bytes()]).await?;
        expect_ok("SELECT", frame)
    }

    /// `KEYS pattern` — full scan; order is store-defined.
    pub async fn keys(&mut self, pattern: &str) -> Result<Vec<Bytes>, ClientError> {
        let frame = self.command(&[b"KEYS", pattern.as_bytes()]).await?;
        bulk_items("KEYS", frame)
    }

    /// `DBSIZE`
    pub async fn dbsize(&mut self) -> Result<i64, ClientError> {
        let frame = self.command(&[b"DBSIZE"]).await?;
        expect_integer("DBSIZE", frame)
    }

    /// `TYPE key` — the declared type name (`"none"` for absent keys).
    pub async fn key_type(&mut self, key: &[u8]) -> Result<String, ClientError> {
        let frame = self.command(&[b"TYPE", key]).await?;
        frame
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| unexpected("TYPE", &frame))
    }

    /// `TTL key` — seconds remaining, `-1` for no expiry, `-2` for absent.
    pub async fn ttl(&mut self, key: &[u8]) -> Result<i64, ClientError> {
        let frame = self.command(&[b"TTL", key]).await?;
        expect_integer("TTL", frame)
    }

    /// `EXPIRE key secs`
    pub async fn expire(&mut self, key: &[u8], secs: i64) -> Result<bool, ClientError> {
        let secs = secs.to_string();
        let frame = self.command(&[b"EXPIRE", key, secs.as_bytes()]).await?;
        Ok(expect_integer("EXPIRE", frame)? == 1)
    }

    /// `DEL key`
    pub async fn del(&mut self, key: &[u8]) -> Result<i64, ClientError> {
        let frame = self.command(&[b"DEL", key]).await?;
        expect_integer("DEL", frame)
    }

    /// `FLUSHDB` — destructively clears the selected database.
    pub async fn flushdb(&mut self) -> Result<(), ClientError> {
        let frame = self.command(&[b"FLUSHDB"]).await?;
        expect_ok("FLUSHDB", frame)
    }

    // ── Strings ──────────────────────────────────────────────────────────

    /// `GET key`
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, ClientError> {
        let frame = self.command(&[b"GET", key]).await?;
        match frame {
            Frame::Bulk(opt) => Ok(opt),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// `SET key value`
    pub async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ClientError> {
        let frame = self.command(&[b"SET", key, value]).await?;
        expect_ok("SET", frame)
    }

    /// `SETNX key value` — true when the key was set (was absent).
    pub async fn setnx(&mut self, key: &[u8], value: &[u8]) -> Result<bool, ClientError> {
        let frame = self.command(&[b"SETNX", key, value]).await?;
        Ok(expect_integer("SETNX", frame)? == 1)
    }

    // ── Lists ────────────────────────────────────────────────────────────

    /// `LLEN key`
    pub async fn llen(&mut self, key: &[u8]) -> Result<i64, ClientError> {
        let frame = self.command(&[b"LLEN", key]).await?;
        expect_integer("LLEN", frame)
    }

    /// `LRANGE key start stop` (stop inclusive, Redis convention).
    pub async fn lrange(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<Bytes>, ClientError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        let frame = self
            .command(&[b"LRANGE", key, start.as_bytes(), stop.as_bytes()])
            .await?;
        bulk_items("LRANGE", frame)
    }

    /// `RPUSH key v...`
    pub async fn rpush(&mut self, key: &[u8], values: &[Bytes]) -> Result<i64, ClientError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(values.len() + 2);
        args.push(b"RPUSH");
        args.push(key);
        args.extend(values.iter().map(|v| v.as_ref()));
        let frame = self.command(&args).await?;
        expect_integer("RPUSH", frame)
    }

    // ── Hashes ───────────────────────────────────────────────────────────

    /// `HGETALL key` — field/value pairs in reply order.
    pub async fn hgetall(&mut self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>, ClientError> {
        let frame = self.command(&[b"HGETALL", key]).await?;
        let items = bulk_items("HGETALL", frame)?;
        pairs_from_flat("HGETALL", items)
    }

    /// `HMSET key f v ...`
    pub async fn hmset(
        &mut self,
        key: &[u8],
        pairs: &[(Bytes, Bytes)],
    ) -> Result<(), ClientError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(pairs.len() * 2 + 2);
        args.push(b"HMSET");
        args.push(key);
        for (field, value) in pairs {
            args.push(field.as_ref());
            args.push(value.as_ref());
        }
        let frame = self.command(&args).await?;
        expect_ok("HMSET", frame)
    }

    // ── Sets ─────────────────────────────────────────────────────────────

    /// `SMEMBERS key`
    pub async fn smembers(&mut self, key: &[u8]) -> Result<Vec<Bytes>, ClientError> {
        let frame = self.command(&[b"SMEMBERS", key]).await?;
        bulk_items("SMEMBERS", frame)
    }

    /// `SADD key m...`
    pub async fn sadd(&mut self, key: &[u8], members: &[Bytes]) -> Result<i64, ClientError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(members.len() + 2);
        args.push(b"SADD");
        args.push(key);
        args.extend(members.iter().map(|m| m.as_ref()));
        let frame = self.command(&args).await?;
        expect_integer("SADD", frame)
    }

    // ── Sorted sets ──────────────────────────────────────────────────────

    /// `ZRANGE key 0 -1 WITHSCORES` — all members with scores, score order.
    pub async fn zrange_withscores(
        &mut self,
        key: &[u8],
    ) -> Result<Vec<(Bytes, f64)>, ClientError> {
        let frame = self
            .command(&[b"ZRANGE", key, b"0", b"-1", b"WITHSCORES"])
            .await?;
        let items = bulk_items("ZRANGE", frame)?;
        scored_from_flat("ZRANGE", items)
    }

    /// `ZADD key score member ...`
    pub async fn zadd(&mut self, key: &[u8], scored: &[(Bytes, f64)]) -> Result<i64, ClientError> {
        let rendered: Vec<String> = scored.iter().map(|(_, s)| format_score(*s)).collect();
        let mut args: Vec<&[u8]> = Vec::with_capacity(scored.len() * 2 + 2);
        args.push(b"ZADD");
        args.push(key);
        for ((member, _), score) in scored.iter().zip(&rendered) {
            args.push(score.as_bytes());
            args.push(member.as_ref());
        }
        let frame = self.command(&args).await?;
        expect_integer("ZADD", frame)
    }
}

/// Render a score the way the store accepts it back.
fn format_score(score: f64) -> String {
    if score == score.trunc() && score.is_finite() && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

fn expect_ok(command: &'static str, frame: Frame) -> Result<(), ClientError> {
    match frame.as_str() {
        Some("OK") => Ok(()),
        _ => Err(unexpected(command, &frame)),
    }
}

fn expect_integer(command: &'static str, frame: Frame) -> Result<i64, ClientError> {
    frame
        .as_integer()
        .ok_or_else(|| unexpected(command, &frame))
}

/// Flatten an array reply of bulk strings.
fn bulk_items(command: &'static str, frame: Frame) -> Result<Vec<Bytes>, ClientError> {
    let items = match frame {
        Frame::Array(Some(items)) => items,
        // A null multi-bulk means "no elements" for the commands we issue.
        Frame::Array(None) => return Ok(Vec::new()),
        other => return Err(unexpected(command, &other)),
    };
    items
        .into_iter()
        .map(|item| match item {
            Frame::Bulk(Some(b)) => Ok(b),
            Frame::Bulk(None) => Ok(Bytes::new()),
            other => Err(unexpected(command, &other)),
        })
        .collect()
}

/// Interpret a flat `[f1, v1, f2, v2, ...]` reply as pairs.
fn pairs_from_flat(
    command: &'static str,
    items: Vec<Bytes>,
) -> Result<Vec<(Bytes, Bytes)>, ClientError> {
    if items.len() % 2 != 0 {
        return Err(ClientError::UnexpectedReply {
            command,
            got: format!("odd reply length {}", items.len()),
        });
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(a), Some(b)) = (it.next(), it.next()) {
        pairs.push((a, b));
    }
    Ok(pairs)
}

/// Interpret a flat `[m1, s1, m2, s2, ...]` reply as scored members.
fn scored_from_flat(
    command: &'static str,
    items: Vec<Bytes>,
) -> Result<Vec<(Bytes, f64)>, ClientError> {
    let pairs = pairs_from_flat(command, items)?;
    pairs
        .into_iter()
        .map(|(member, raw)| {
            let score = std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| ClientError::UnexpectedReply {
                    command,
                    got: format!("unparsable score {:?}", raw),
                })?;
            Ok((member, score))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_items_from_array() {
        let frame = Frame::array(vec![Frame::bulk("a"), Frame::bulk("b")]);
        let items = bulk_items("KEYS", frame).unwrap();
        assert_eq!(items, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[test]
    fn test_bulk_items_null_array_is_empty() {
        assert!(bulk_items("KEYS", Frame::Array(None)).unwrap().is_empty());
    }

    #[test]
    fn test_bulk_items_rejects_integer_reply() {
        assert!(bulk_items("KEYS", Frame::Integer(3)).is_err());
    }

    #[test]
    fn test_pairs_from_flat() {
        let items = vec![
            Bytes::from("f1"),
            Bytes::from("v1"),
            Bytes::from("f2"),
            Bytes::from("v2"),
        ];
        let pairs = pairs_from_flat("HGETALL", items).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (Bytes::from("f1"), Bytes::from("v1")));
    }

    #[test]
    fn test_pairs_from_flat_rejects_odd_length() {
        let items = vec![Bytes::from("f1")];
        assert!(pairs_from_flat("HGETALL", items).is_err());
    }

    #[test]
    fn test_scored_from_flat() {
        let items = vec![
            Bytes::from("x"),
            Bytes::from("1"),
            Bytes::from("y"),
            Bytes::from("2.5"),
        ];
        let scored = scored_from_flat("ZRANGE", items).unwrap();
        assert_eq!(scored[0], (Bytes::from("x"), 1.0));
        assert_eq!(scored[1], (Bytes::from("y"), 2.5));
    }

    #[test]
    fn test_scored_from_flat_rejects_bad_score() {
        let items = vec![Bytes::from("x"), Bytes::from("not-a-number")];
        assert!(scored_from_flat("ZRANGE", items).is_err());
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(1.0), "1");
        assert_eq!(format_score(-3.0), "-3");
        assert_eq!(format_score(2.5), "2.5");
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok("SET", Frame::simple("OK")).is_ok());
        assert!(expect_ok("SET", Frame::Integer(1)).is_err());
    }
}
