//! In-process wire-compatible test server.
//!
//! Listens on an ephemeral port and serves the command subset the transfer
//! engine issues, backed by a multi-database in-memory store with lazy key
//! expiry. Tests use the direct accessors to seed data and inspect results
//! without going through the protocol.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use keyferry::protocol::{encode_frame, parse_frame, Frame};
use keyferry::Address;

const DATABASES: usize = 16;

#[derive(Debug, Clone)]
enum Stored {
    Str(Bytes),
    List(Vec<Bytes>),
    Hash(Vec<(Bytes, Bytes)>),
    Set(Vec<Bytes>),
    Zset(Vec<(Bytes, f64)>),
    // Reports a type the transfer engine does not speak.
    Stream,
}

impl Stored {
    fn type_name(&self) -> &'static str {
        match self {
            Stored::Str(_) => "string",
            Stored::List(_) => "list",
            Stored::Hash(_) => "hash",
            Stored::Set(_) => "set",
            Stored::Zset(_) => "zset",
            Stored::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

type Db = HashMap<Vec<u8>, Entry>;

struct Shared {
    dbs: Vec<Db>,
}

impl Shared {
    fn new() -> Self {
        Self {
            dbs: (0..DATABASES).map(|_| Db::new()).collect(),
        }
    }
}

/// Fetch a live entry, discarding it first when expired.
fn live<'a>(db: &'a mut Db, key: &[u8]) -> Option<&'a mut Entry> {
    let expired = matches!(db.get(key), Some(e) if e.expires_at.is_some_and(|t| t <= Instant::now()));
    if expired {
        db.remove(key);
        return None;
    }
    db.get_mut(key)
}

/// A running server instance plus direct store access for tests.
pub struct TestServer {
    addr: Address,
    shared: Arc<Mutex<Shared>>,
}

impl TestServer {
    /// Bind an ephemeral port and serve until dropped.
    pub async fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Mutex::new(Shared::new()));

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_conn(socket, Arc::clone(&accept_shared)));
            }
        });

        TestServer {
            addr: Address::new("127.0.0.1", port),
            shared,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr.clone()
    }

    // ── Direct store access ──────────────────────────────────────────

    pub fn set_str(&self, db: usize, key: &str, value: &str) {
        self.insert(db, key, Stored::Str(Bytes::copy_from_slice(value.as_bytes())));
    }

    pub fn set_list(&self, db: usize, key: &str, items: &[&str]) {
        self.insert(db, key, Stored::List(owned(items)));
    }

    pub fn set_hash(&self, db: usize, key: &str, pairs: &[(&str, &str)]) {
        let pairs = pairs
            .iter()
            .map(|(f, v)| {
                (
                    Bytes::copy_from_slice(f.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect();
        self.insert(db, key, Stored::Hash(pairs));
    }

    pub fn set_set(&self, db: usize, key: &str, members: &[&str]) {
        self.insert(db, key, Stored::Set(owned(members)));
    }

    pub fn set_zset(&self, db: usize, key: &str, scored: &[(&str, f64)]) {
        let scored = scored
            .iter()
            .map(|(m, s)| (Bytes::copy_from_slice(m.as_bytes()), *s))
            .collect();
        self.insert(db, key, Stored::Zset(scored));
    }

    /// Store a value whose declared type no transfer supports.
    pub fn set_stream(&self, db: usize, key: &str) {
        self.insert(db, key, Stored::Stream);
    }

    pub fn set_ttl(&self, db: usize, key: &str, secs: u64) {
        if let Some(entry) = self.shared.lock().dbs[db].get_mut(key.as_bytes()) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
        }
    }

    pub fn remove(&self, db: usize, key: &str) {
        self.shared.lock().dbs[db].remove(key.as_bytes());
    }

    pub fn get_str(&self, db: usize, key: &str) -> Option<String> {
        match self.value_of(db, key)? {
            Stored::Str(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            _ => None,
        }
    }

    pub fn get_list(&self, db: usize, key: &str) -> Option<Vec<String>> {
        match self.value_of(db, key)? {
            Stored::List(items) => Some(strings(&items)),
            _ => None,
        }
    }

    pub fn get_hash(&self, db: usize, key: &str) -> Option<Vec<(String, String)>> {
        match self.value_of(db, key)? {
            Stored::Hash(pairs) => Some(
                pairs
                    .iter()
                    .map(|(f, v)| {
                        (
                            String::from_utf8_lossy(f).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        )
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Set members, sorted for stable comparison.
    pub fn get_set(&self, db: usize, key: &str) -> Option<Vec<String>> {
        match self.value_of(db, key)? {
            Stored::Set(members) => {
                let mut out = strings(&members);
                out.sort();
                Some(out)
            }
            _ => None,
        }
    }

    pub fn get_zset(&self, db: usize, key: &str) -> Option<Vec<(String, f64)>> {
        match self.value_of(db, key)? {
            Stored::Zset(scored) => {
                let mut out: Vec<(String, f64)> = scored
                    .iter()
                    .map(|(m, s)| (String::from_utf8_lossy(m).into_owned(), *s))
                    .collect();
                out.sort_by(|a, b| a.0.cmp(&b.0));
                Some(out)
            }
            _ => None,
        }
    }

    /// Remaining TTL in whole seconds, `None` when absent or persistent.
    pub fn ttl_of(&self, db: usize, key: &str) -> Option<u64> {
        let shared = self.shared.lock();
        let entry = shared.dbs[db].get(key.as_bytes())?;
        let at = entry.expires_at?;
        Some(at.saturating_duration_since(Instant::now()).as_secs())
    }

    /// All live key names in one database, sorted.
    pub fn key_names(&self, db: usize) -> Vec<String> {
        let now = Instant::now();
        let mut names: Vec<String> = self.shared.lock().dbs[db]
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |t| t > now))
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn key_count(&self, db: usize) -> usize {
        self.key_names(db).len()
    }

    fn insert(&self, db: usize, key: &str, value: Stored) {
        self.shared.lock().dbs[db].insert(
            key.as_bytes().to_vec(),
            Entry {
                value,
                expires_at: None,
            },
        );
    }

    fn value_of(&self, db: usize, key: &str) -> Option<Stored> {
        let mut shared = self.shared.lock();
        live(&mut shared.dbs[db], key.as_bytes()).map(|e| e.value.clone())
    }
}

fn owned(items: &[&str]) -> Vec<Bytes> {
    items
        .iter()
        .map(|i| Bytes::copy_from_slice(i.as_bytes()))
        .collect()
}

fn strings(items: &[Bytes]) -> Vec<String> {
    items
        .iter()
        .map(|i| String::from_utf8_lossy(i).into_owned())
        .collect()
}

// ── Protocol handling ────────────────────────────────────────────────

async fn handle_conn(mut socket: TcpStream, shared: Arc<Mutex<Shared>>) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut out = BytesMut::with_capacity(16 * 1024);
    let mut db = 0usize;

    loop {
        let frame = loop {
            match parse_frame(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(_) => return,
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };

        let reply = match command_args(frame) {
            Some(args) => execute(&shared, &mut db, &args),
            None => Frame::error("ERR protocol: expected command array"),
        };

        out.clear();
        encode_frame(&reply, &mut out);
        if socket.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn command_args(frame: Frame) -> Option<Vec<Bytes>> {
    let items = frame.into_array()?;
    items.into_iter().map(Frame::into_bytes).collect()
}

fn execute(shared: &Arc<Mutex<Shared>>, db: &mut usize, args: &[Bytes]) -> Frame {
    let Some(name) = args.first() else {
        return Frame::error("ERR empty command");
    };
    let name = String::from_utf8_lossy(name).to_uppercase();
    let mut shared = shared.lock();

    match (name.as_str(), &args[1..]) {
        ("SELECT", [index]) => match parse_int(index) {
            Some(i) if (i as usize) < DATABASES && i >= 0 => {
                *db = i as usize;
                Frame::simple("OK")
            }
            _ => Frame::error("ERR DB index is out of range"),
        },
        ("FLUSHDB", []) => {
            shared.dbs[*db].clear();
            Frame::simple("OK")
        }
        ("DBSIZE", []) => {
            let now = Instant::now();
            let n = shared.dbs[*db]
                .values()
                .filter(|e| e.expires_at.map_or(true, |t| t > now))
                .count();
            Frame::Integer(n as i64)
        }
        ("KEYS", [pattern]) if pattern.as_ref() == b"*" => {
            let now = Instant::now();
            let keys = shared.dbs[*db]
                .iter()
                .filter(|(_, e)| e.expires_at.map_or(true, |t| t > now))
                .map(|(k, _)| Frame::bulk(Bytes::copy_from_slice(k)))
                .collect();
            Frame::array(keys)
        }
        ("TYPE", [key]) => match live(&mut shared.dbs[*db], key) {
            Some(entry) => Frame::simple(entry.value.type_name()),
            None => Frame::simple("none"),
        },
        ("TTL", [key]) => match live(&mut shared.dbs[*db], key) {
            Some(entry) => match entry.expires_at {
                Some(at) => {
                    let secs = at.saturating_duration_since(Instant::now()).as_secs_f64();
                    Frame::Integer(secs.ceil() as i64)
                }
                None => Frame::Integer(-1),
            },
            None => Frame::Integer(-2),
        },
        ("EXPIRE", [key, secs]) => match (live(&mut shared.dbs[*db], key), parse_int(secs)) {
            (Some(entry), Some(secs)) if secs >= 0 => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(secs as u64));
                Frame::Integer(1)
            }
            _ => Frame::Integer(0),
        },
        ("DEL", keys) => {
            let mut removed = 0i64;
            for key in keys {
                if live(&mut shared.dbs[*db], key).is_some() {
                    shared.dbs[*db].remove(key.as_ref());
                    removed += 1;
                }
            }
            Frame::Integer(removed)
        }
        ("GET", [key]) => match live(&mut shared.dbs[*db], key) {
            Some(Entry {
                value: Stored::Str(b),
                ..
            }) => Frame::bulk(b.clone()),
            Some(_) => wrongtype(),
            None => Frame::null(),
        },
        ("SET", [key, value]) => {
            store(&mut shared.dbs[*db], key, Stored::Str(value.clone()));
            Frame::simple("OK")
        }
        ("SETNX", [key, value]) => {
            if live(&mut shared.dbs[*db], key).is_some() {
                Frame::Integer(0)
            } else {
                store(&mut shared.dbs[*db], key, Stored::Str(value.clone()));
                Frame::Integer(1)
            }
        }
        ("LLEN", [key]) => match live(&mut shared.dbs[*db], key) {
            Some(Entry {
                value: Stored::List(items),
                ..
            }) => Frame::Integer(items.len() as i64),
            Some(_) => wrongtype(),
            None => Frame::Integer(0),
        },
        ("LRANGE", [key, start, stop]) => {
            let (Some(start), Some(stop)) = (parse_int(start), parse_int(stop)) else {
                return Frame::error("ERR value is not an integer");
            };
            match live(&mut shared.dbs[*db], key) {
                Some(Entry {
                    value: Stored::List(items),
                    ..
                }) => {
                    let slice = range_slice(items, start, stop);
                    Frame::array(slice.iter().map(|i| Frame::bulk(i.clone())).collect())
                }
                Some(_) => wrongtype(),
                None => Frame::array(Vec::new()),
            }
        }
        ("RPUSH", [key, values @ ..]) if !values.is_empty() => {
            let db = &mut shared.dbs[*db];
            purge(db, key);
            let entry = vacant_as(db, key, || Stored::List(Vec::new()));
            match &mut entry.value {
                Stored::List(items) => {
                    items.extend(values.iter().cloned());
                    Frame::Integer(items.len() as i64)
                }
                _ => wrongtype(),
            }
        }
        ("HGETALL", [key]) => match live(&mut shared.dbs[*db], key) {
            Some(Entry {
                value: Stored::Hash(pairs),
                ..
            }) => {
                let mut flat = Vec::with_capacity(pairs.len() * 2);
                for (f, v) in pairs.iter() {
                    flat.push(Frame::bulk(f.clone()));
                    flat.push(Frame::bulk(v.clone()));
                }
                Frame::array(flat)
            }
            Some(_) => wrongtype(),
            None => Frame::array(Vec::new()),
        },
        ("HMSET", [key, rest @ ..]) if !rest.is_empty() && rest.len() % 2 == 0 => {
            let db = &mut shared.dbs[*db];
            let incoming: Vec<(Bytes, Bytes)> = rest
                .chunks(2)
                .map(|p| (p[0].clone(), p[1].clone()))
                .collect();
            purge(db, key);
            let entry = vacant_as(db, key, || Stored::Hash(Vec::new()));
            match &mut entry.value {
                Stored::Hash(pairs) => {
                    for (field, value) in incoming {
                        match pairs.iter_mut().find(|(f, _)| *f == field) {
                            Some(slot) => slot.1 = value,
                            None => pairs.push((field, value)),
                        }
                    }
                    Frame::simple("OK")
                }
                _ => wrongtype(),
            }
        }
        ("SMEMBERS", [key]) => match live(&mut shared.dbs[*db], key) {
            Some(Entry {
                value: Stored::Set(members),
                ..
            }) => Frame::array(members.iter().map(|m| Frame::bulk(m.clone())).collect()),
            Some(_) => wrongtype(),
            None => Frame::array(Vec::new()),
        },
        ("SADD", [key, members @ ..]) if !members.is_empty() => {
            let db = &mut shared.dbs[*db];
            purge(db, key);
            let entry = vacant_as(db, key, || Stored::Set(Vec::new()));
            match &mut entry.value {
                Stored::Set(existing) => {
                    let mut added = 0i64;
                    for m in members {
                        if !existing.contains(m) {
                            existing.push(m.clone());
                            added += 1;
                        }
                    }
                    Frame::Integer(added)
                }
                _ => wrongtype(),
            }
        }
        ("ZADD", [key, rest @ ..]) if !rest.is_empty() && rest.len() % 2 == 0 => {
            let db = &mut shared.dbs[*db];
            let mut incoming = Vec::with_capacity(rest.len() / 2);
            for pair in rest.chunks(2) {
                let Some(score) = parse_float(&pair[0]) else {
                    return Frame::error("ERR value is not a valid float");
                };
                incoming.push((pair[1].clone(), score));
            }
            purge(db, key);
            let entry = vacant_as(db, key, || Stored::Zset(Vec::new()));
            match &mut entry.value {
                Stored::Zset(scored) => {
                    let mut added = 0i64;
                    for (member, score) in incoming {
                        match scored.iter_mut().find(|(m, _)| *m == member) {
                            Some(slot) => slot.1 = score,
                            None => {
                                scored.push((member, score));
                                added += 1;
                            }
                        }
                    }
                    Frame::Integer(added)
                }
                _ => wrongtype(),
            }
        }
        ("ZRANGE", [key, start, stop, flag])
            if flag.eq_ignore_ascii_case(b"WITHSCORES")
                && parse_int(start) == Some(0)
                && parse_int(stop) == Some(-1) =>
        {
            match live(&mut shared.dbs[*db], key) {
                Some(Entry {
                    value: Stored::Zset(scored),
                    ..
                }) => {
                    let mut ordered = scored.clone();
                    ordered.sort_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    let mut flat = Vec::with_capacity(ordered.len() * 2);
                    for (member, score) in ordered {
                        flat.push(Frame::bulk(member));
                        flat.push(Frame::bulk(Bytes::from(render_score(score))));
                    }
                    Frame::array(flat)
                }
                Some(_) => wrongtype(),
                None => Frame::array(Vec::new()),
            }
        }
        _ => Frame::error(Bytes::from(format!("ERR unknown command '{}'", name))),
    }
}

fn store(db: &mut Db, key: &Bytes, value: Stored) {
    db.insert(
        key.as_ref().to_vec(),
        Entry {
            value,
            expires_at: None,
        },
    );
}

/// Drop an expired entry so a following write sees a vacant slot.
fn purge(db: &mut Db, key: &[u8]) {
    let expired = matches!(db.get(key), Some(e) if e.expires_at.is_some_and(|t| t <= Instant::now()));
    if expired {
        db.remove(key);
    }
}

/// Mutable entry for `key`, inserting an empty value when vacant.
fn vacant_as<'a>(db: &'a mut Db, key: &Bytes, empty: impl FnOnce() -> Stored) -> &'a mut Entry {
    db.entry(key.as_ref().to_vec()).or_insert_with(|| Entry {
        value: empty(),
        expires_at: None,
    })
}

fn wrongtype() -> Frame {
    Frame::error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn parse_int(raw: &Bytes) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn parse_float(raw: &Bytes) -> Option<f64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn render_score(score: f64) -> String {
    if score == score.trunc() && score.is_finite() && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

/// Redis LRANGE index semantics: negatives count from the end, stop is
/// inclusive, out-of-range indices clamp.
fn range_slice(items: &[Bytes], start: i64, stop: i64) -> &[Bytes] {
    let len = items.len() as i64;
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    let start = norm(start).min(len) as usize;
    let stop = norm(stop).min(len - 1);
    if stop < start as i64 {
        return &[];
    }
    &items[start..=stop as usize]
}
