//! In-process backend
//!
//! Each [`MemoryServer`] is an independent store with string, list and set
//! values, a replication role, a reachability switch and a log of the
//! commands it served. [`MemoryConnector`] maps `host:port` endpoints to
//! servers, so a whole topology can run inside one process.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::command::{Command, Op};
use crate::error::NodeError;
use crate::node::{NodeClient, NodeConnector, Reply};
use crate::topology::NodeRole;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
}

type Database = HashMap<Vec<u8>, Value>;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// One simulated server
pub struct MemoryServer {
    role: NodeRole,
    reachable: AtomicBool,
    databases: Mutex<HashMap<i64, Database>>,
    served: Mutex<Vec<String>>,
    pushed: Notify,
}

impl MemoryServer {
    pub fn new(role: NodeRole) -> Arc<Self> {
        Arc::new(Self {
            role,
            reachable: AtomicBool::new(true),
            databases: Mutex::new(HashMap::new()),
            served: Mutex::new(Vec::new()),
            pushed: Notify::new(),
        })
    }

    pub fn master() -> Arc<Self> {
        Self::new(NodeRole::Master)
    }

    pub fn slave() -> Arc<Self> {
        Self::new(NodeRole::Slave)
    }

    /// Take the server down or bring it back; existing connections fail
    /// while it is down
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Commands served so far, as `"<op> <first arg>"`
    pub fn served(&self) -> Vec<String> {
        self.served.lock().clone()
    }

    pub fn clear_served(&self) {
        self.served.lock().clear();
    }

    /// Store a string value directly, bypassing any client
    pub fn insert(&self, database: i64, key: &str, value: &str) {
        self.databases
            .lock()
            .entry(database)
            .or_default()
            .insert(key.as_bytes().to_vec(), Value::Str(value.as_bytes().to_vec()));
    }

    /// String value of a key, read directly
    pub fn value(&self, database: i64, key: &str) -> Option<Vec<u8>> {
        match self.databases.lock().get(&database)?.get(key.as_bytes())? {
            Value::Str(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Set members of a key, read directly
    pub fn members(&self, database: i64, key: &str) -> Vec<Vec<u8>> {
        match self
            .databases
            .lock()
            .get(&database)
            .and_then(|db| db.get(key.as_bytes()))
        {
            Some(Value::Set(members)) => members.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Number of keys in a database
    pub fn key_count(&self, database: i64) -> usize {
        self.databases.lock().get(&database).map_or(0, |db| db.len())
    }

    fn check_reachable(&self) -> Result<(), NodeError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(NodeError::Transport("connection reset by peer".to_string()))
        }
    }

    fn record(&self, cmd: &Command) {
        let entry = match cmd.args.first() {
            Some(arg) => format!("{} {}", cmd.op, String::from_utf8_lossy(arg)),
            None => cmd.op.to_string(),
        };
        self.served.lock().push(entry);
    }

    fn with_db<T>(&self, database: i64, f: impl FnOnce(&mut Database) -> T) -> T {
        let mut databases = self.databases.lock();
        f(databases.entry(database).or_default())
    }

    /// Execute a non-blocking command
    fn apply(&self, database: i64, cmd: &Command) -> Result<Reply, NodeError> {
        let args = &cmd.args;
        let arity = |n: usize| {
            if args.len() < n {
                Err(NodeError::Server(format!(
                    "ERR wrong number of arguments for '{}' command",
                    cmd.op
                )))
            } else {
                Ok(())
            }
        };

        match cmd.op {
            Op::Ping => Ok(Reply::Status("PONG".to_string())),
            Op::Echo => {
                arity(1)?;
                Ok(Reply::Bulk(args[0].clone()))
            }
            Op::Dbsize => Ok(Reply::Int(self.with_db(database, |db| db.len() as i64))),
            Op::Flushdb => {
                self.with_db(database, |db| db.clear());
                Ok(Reply::ok())
            }
            Op::Flushall => {
                self.databases.lock().clear();
                Ok(Reply::ok())
            }
            Op::Keys => {
                arity(1)?;
                let pattern = args[0].clone();
                Ok(self.with_db(database, |db| {
                    let mut keys: Vec<_> =
                        db.keys().filter(|k| glob_match(&pattern, k)).cloned().collect();
                    keys.sort();
                    Reply::Array(keys.into_iter().map(Reply::Bulk).collect())
                }))
            }
            Op::Get => {
                arity(1)?;
                self.with_db(database, |db| match db.get(&args[0]) {
                    None => Ok(Reply::Nil),
                    Some(Value::Str(v)) => Ok(Reply::Bulk(v.clone())),
                    Some(_) => Err(NodeError::Server(WRONGTYPE.to_string())),
                })
            }
            Op::Set => {
                arity(2)?;
                self.with_db(database, |db| {
                    db.insert(args[0].clone(), Value::Str(args[1].clone()))
                });
                Ok(Reply::ok())
            }
            Op::Setnx => {
                arity(2)?;
                Ok(self.with_db(database, |db| {
                    if db.contains_key(&args[0]) {
                        Reply::Int(0)
                    } else {
                        db.insert(args[0].clone(), Value::Str(args[1].clone()));
                        Reply::Int(1)
                    }
                }))
            }
            Op::Incr | Op::Incrby | Op::Decr | Op::Decrby => {
                arity(1)?;
                let step = match cmd.op {
                    Op::Incr => 1,
                    Op::Decr => -1,
                    _ => {
                        arity(2)?;
                        let by = parse_int(&args[1])?;
                        if cmd.op == Op::Decrby { -by } else { by }
                    }
                };
                self.with_db(database, |db| {
                    let current = match db.get(&args[0]) {
                        None => 0,
                        Some(Value::Str(v)) => parse_int(v)?,
                        Some(_) => return Err(NodeError::Server(WRONGTYPE.to_string())),
                    };
                    let next = current + step;
                    db.insert(args[0].clone(), Value::Str(next.to_string().into_bytes()));
                    Ok(Reply::Int(next))
                })
            }
            Op::Append => {
                arity(2)?;
                self.with_db(database, |db| {
                    let entry = db
                        .entry(args[0].clone())
                        .or_insert_with(|| Value::Str(Vec::new()));
                    let Value::Str(value) = entry else {
                        return Err(NodeError::Server(WRONGTYPE.to_string()));
                    };
                    value.extend_from_slice(&args[1]);
                    Ok(Reply::Int(value.len() as i64))
                })
            }
            Op::Strlen => {
                arity(1)?;
                self.with_db(database, |db| match db.get(&args[0]) {
                    None => Ok(Reply::Int(0)),
                    Some(Value::Str(v)) => Ok(Reply::Int(v.len() as i64)),
                    Some(_) => Err(NodeError::Server(WRONGTYPE.to_string())),
                })
            }
            Op::Info => Ok(Reply::Bulk(
                format!("# Replication\r\nrole:{}\r\n", self.role).into_bytes(),
            )),
            Op::Object => {
                arity(2)?;
                let subcommand = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();
                self.with_db(database, |db| {
                    let Some(value) = db.get(&args[1]) else {
                        return Ok(Reply::Nil);
                    };
                    match subcommand.as_str() {
                        "encoding" => Ok(Reply::bulk(match value {
                            Value::Str(_) => "raw",
                            Value::List(_) => "quicklist",
                            Value::Set(_) => "hashtable",
                        })),
                        "refcount" => Ok(Reply::Int(1)),
                        "idletime" => Ok(Reply::Int(0)),
                        other => Err(NodeError::Server(format!(
                            "ERR unknown subcommand '{}'",
                            other
                        ))),
                    }
                })
            }
            Op::Exists => {
                arity(1)?;
                Ok(Reply::Int(self.with_db(database, |db| {
                    args.iter().filter(|k| db.contains_key(*k)).count() as i64
                })))
            }
            Op::Del => {
                arity(1)?;
                Ok(Reply::Int(self.with_db(database, |db| {
                    args.iter().filter(|k| db.remove(*k).is_some()).count() as i64
                })))
            }
            Op::Type => {
                arity(1)?;
                let kind = self.with_db(database, |db| match db.get(&args[0]) {
                    None => "none",
                    Some(Value::Str(_)) => "string",
                    Some(Value::List(_)) => "list",
                    Some(Value::Set(_)) => "set",
                });
                Ok(Reply::Status(kind.to_string()))
            }
            Op::Rename | Op::Renamenx => {
                arity(2)?;
                self.with_db(database, |db| {
                    if cmd.op == Op::Renamenx && db.contains_key(&args[1]) {
                        return Ok(Reply::Int(0));
                    }
                    let value = db
                        .remove(&args[0])
                        .ok_or_else(|| NodeError::Server("ERR no such key".to_string()))?;
                    db.insert(args[1].clone(), value);
                    Ok(if cmd.op == Op::Rename {
                        Reply::ok()
                    } else {
                        Reply::Int(1)
                    })
                })
            }
            Op::Sadd => {
                arity(2)?;
                self.with_db(database, |db| {
                    let entry = db
                        .entry(args[0].clone())
                        .or_insert_with(|| Value::Set(BTreeSet::new()));
                    let Value::Set(members) = entry else {
                        return Err(NodeError::Server(WRONGTYPE.to_string()));
                    };
                    let added = args[1..].iter().filter(|m| members.insert(m.to_vec())).count();
                    Ok(Reply::Int(added as i64))
                })
            }
            Op::Srem => {
                arity(2)?;
                self.with_db(database, |db| match db.get_mut(&args[0]) {
                    None => Ok(Reply::Int(0)),
                    Some(Value::Set(members)) => {
                        let removed = args[1..].iter().filter(|m| members.remove(*m)).count();
                        if members.is_empty() {
                            db.remove(&args[0]);
                        }
                        Ok(Reply::Int(removed as i64))
                    }
                    Some(_) => Err(NodeError::Server(WRONGTYPE.to_string())),
                })
            }
            Op::Smembers | Op::Scard | Op::Sismember => {
                arity(1)?;
                self.with_db(database, |db| {
                    let empty = BTreeSet::new();
                    let members = match db.get(&args[0]) {
                        None => &empty,
                        Some(Value::Set(members)) => members,
                        Some(_) => return Err(NodeError::Server(WRONGTYPE.to_string())),
                    };
                    Ok(match cmd.op {
                        Op::Scard => Reply::Int(members.len() as i64),
                        Op::Sismember => Reply::from_bool(
                            args.get(1).is_some_and(|m| members.contains(m)),
                        ),
                        _ => Reply::Array(members.iter().cloned().map(Reply::Bulk).collect()),
                    })
                })
            }
            Op::Lpush | Op::Rpush => {
                arity(2)?;
                let reply = self.with_db(database, |db| {
                    let entry = db
                        .entry(args[0].clone())
                        .or_insert_with(|| Value::List(VecDeque::new()));
                    let Value::List(list) = entry else {
                        return Err(NodeError::Server(WRONGTYPE.to_string()));
                    };
                    for value in &args[1..] {
                        if cmd.op == Op::Lpush {
                            list.push_front(value.clone());
                        } else {
                            list.push_back(value.clone());
                        }
                    }
                    Ok(Reply::Int(list.len() as i64))
                })?;
                self.pushed.notify_waiters();
                Ok(reply)
            }
            Op::Lpop | Op::Rpop => {
                arity(1)?;
                self.with_db(database, |db| pop(db, &args[0], cmd.op == Op::Lpop))
                    .map(|popped| popped.map_or(Reply::Nil, Reply::Bulk))
            }
            Op::Llen => {
                arity(1)?;
                self.with_db(database, |db| match db.get(&args[0]) {
                    None => Ok(Reply::Int(0)),
                    Some(Value::List(list)) => Ok(Reply::Int(list.len() as i64)),
                    Some(_) => Err(NodeError::Server(WRONGTYPE.to_string())),
                })
            }
            Op::Lrange => {
                arity(3)?;
                let start = parse_int(&args[1])?;
                let stop = parse_int(&args[2])?;
                self.with_db(database, |db| match db.get(&args[0]) {
                    None => Ok(Reply::Array(Vec::new())),
                    Some(Value::List(list)) => {
                        let len = list.len() as i64;
                        let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
                        let (start, stop) = (norm(start), norm(stop).min(len - 1));
                        Ok(Reply::Array(
                            (start..=stop)
                                .filter_map(|i| list.get(i as usize).cloned())
                                .map(Reply::Bulk)
                                .collect(),
                        ))
                    }
                    Some(_) => Err(NodeError::Server(WRONGTYPE.to_string())),
                })
            }
            _ => Err(NodeError::Server(format!("ERR unknown command '{}'", cmd.op))),
        }
    }

    /// `blpop`/`brpop key [key ...] timeout`
    async fn blocking_pop(&self, database: i64, cmd: &Command) -> Result<Reply, NodeError> {
        let Some((timeout, keys)) = cmd.args.split_last() else {
            return Err(NodeError::Server(format!(
                "ERR wrong number of arguments for '{}' command",
                cmd.op
            )));
        };
        let secs: f64 = std::str::from_utf8(timeout)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| NodeError::Server("ERR timeout is not a float".to_string()))?;
        // zero, or a timeout too large to represent, waits forever
        let deadline = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .and_then(|d| Instant::now().checked_add(d));
        let front = cmd.op == Op::Blpop;

        loop {
            // registered before checking so a push in between is not missed
            let pushed = self.pushed.notified();
            self.check_reachable()?;
            for key in keys {
                if let Some(value) = self.with_db(database, |db| pop(db, key, front))? {
                    return Ok(Reply::Array(vec![Reply::Bulk(key.clone()), Reply::Bulk(value)]));
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                        return Ok(Reply::Nil);
                    }
                }
                None => pushed.await,
            }
        }
    }
}

fn pop(db: &mut Database, key: &[u8], front: bool) -> Result<Option<Vec<u8>>, NodeError> {
    let popped = match db.get_mut(key) {
        None => return Ok(None),
        Some(Value::List(list)) => {
            let value = if front { list.pop_front() } else { list.pop_back() };
            if list.is_empty() {
                db.remove(key);
            }
            value
        }
        Some(_) => return Err(NodeError::Server(WRONGTYPE.to_string())),
    };
    Ok(popped)
}

fn parse_int(raw: &[u8]) -> Result<i64, NodeError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| NodeError::Server("ERR value is not an integer or out of range".to_string()))
}

/// Glob matching with `*` and `?`
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, None) => true,
        (Some((b'*', rest)), _) => {
            glob_match(rest, text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some((b'?', rest)), Some((_, text_rest))) => glob_match(rest, text_rest),
        (Some((p, rest)), Some((t, text_rest))) => p == t && glob_match(rest, text_rest),
        _ => false,
    }
}

/// Connection to a [`MemoryServer`]
pub struct MemoryNode {
    server: Arc<MemoryServer>,
    database: i64,
}

#[async_trait]
impl NodeClient for MemoryNode {
    async fn call(&mut self, cmd: &Command) -> Result<Reply, NodeError> {
        self.server.check_reachable()?;
        self.server.record(cmd);
        match cmd.op {
            Op::Blpop | Op::Brpop => self.server.blocking_pop(self.database, cmd).await,
            _ => self.server.apply(self.database, cmd),
        }
    }

    async fn role(&mut self) -> Result<NodeRole, NodeError> {
        self.server.check_reachable()?;
        Ok(self.server.role)
    }

    async fn select(&mut self, database: i64) -> Result<Reply, NodeError> {
        self.server.check_reachable()?;
        if database < 0 {
            return Err(NodeError::Server("ERR DB index is out of range".to_string()));
        }
        self.database = database;
        Ok(Reply::ok())
    }
}

/// Maps endpoints to in-process servers
#[derive(Default)]
pub struct MemoryConnector {
    servers: HashMap<String, Arc<MemoryServer>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server at `host:port`
    pub fn with_server(mut self, host: &str, port: u16, server: Arc<MemoryServer>) -> Self {
        self.servers.insert(format!("{}:{}", host, port), server);
        self
    }

    pub fn server(&self, host: &str, port: u16) -> Option<Arc<MemoryServer>> {
        self.servers.get(&format!("{}:{}", host, port)).cloned()
    }

    /// Connection attempts made against `host:port`
    pub fn attempts(&self, host: &str, port: u16) -> u32 {
        self.attempts
            .lock()
            .get(&format!("{}:{}", host, port))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl NodeConnector for MemoryConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn NodeClient>, NodeError> {
        let endpoint = format!("{}:{}", host, port);
        *self.attempts.lock().entry(endpoint.clone()).or_default() += 1;
        match self.servers.get(&endpoint) {
            Some(server) if server.is_reachable() => Ok(Box::new(MemoryNode {
                server: server.clone(),
                database: 0,
            })),
            _ => Err(NodeError::Transport(format!(
                "connection refused: {}",
                endpoint
            ))),
        }
    }
}
