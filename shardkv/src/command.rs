//! Command names, argument lists and the static classification tables
//!
//! Every other component decides what to do with an operation by asking
//! [`classify`]. The tables are immutable process-wide data.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

macro_rules! ops {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Operation name understood by the cluster client
        ///
        /// Names outside the classification tables are carried verbatim in
        /// [`Op::Other`] and routed to the default node.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Op {
            $($variant,)*
            Other(String),
        }

        impl Op {
            /// Parse an operation name (case-insensitive)
            pub fn parse(name: &str) -> Self {
                let lower = name.to_ascii_lowercase();
                match lower.as_str() {
                    $($name => Self::$variant,)*
                    _ => Self::Other(lower),
                }
            }

            /// Lowercase name as sent to the store
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)*
                    Self::Other(name) => name,
                }
            }
        }
    };
}

ops! {
    // keys and strings
    Append => "append", Bitcount => "bitcount", Decr => "decr", Decrby => "decrby",
    Del => "del", Exists => "exists", Expire => "expire", Expireat => "expireat",
    Get => "get", Getbit => "getbit", Getrange => "getrange", Getset => "getset",
    Incr => "incr", Incrby => "incrby", Mget => "mget", Move => "move", Mset => "mset",
    Msetnx => "msetnx", Object => "object", Persist => "persist", Rename => "rename",
    Renamenx => "renamenx", Set => "set", Setbit => "setbit", Setex => "setex",
    Setnx => "setnx", Setrange => "setrange", Sort => "sort", Strlen => "strlen",
    Substr => "substr", Ttl => "ttl", Type => "type",
    // hashes
    Hdel => "hdel", Hexists => "hexists", Hget => "hget", Hgetall => "hgetall",
    Hincrby => "hincrby", Hkeys => "hkeys", Hlen => "hlen", Hmget => "hmget",
    Hmset => "hmset", Hset => "hset", Hsetnx => "hsetnx", Hvals => "hvals",
    // lists
    Blpop => "blpop", Brpop => "brpop", Brpoplpush => "brpoplpush", Lindex => "lindex",
    Linsert => "linsert", Llen => "llen", Lpop => "lpop", Lpush => "lpush",
    Lpushx => "lpushx", Lrange => "lrange", Lrem => "lrem", Lset => "lset",
    Ltrim => "ltrim", Rpop => "rpop", Rpoplpush => "rpoplpush", Rpush => "rpush",
    Rpushx => "rpushx",
    // sets
    Sadd => "sadd", Scard => "scard", Sdiff => "sdiff", Sdiffstore => "sdiffstore",
    Sinter => "sinter", Sinterstore => "sinterstore", Sismember => "sismember",
    Smembers => "smembers", Smove => "smove", Spop => "spop",
    Srandmember => "srandmember", Srem => "srem", Sunion => "sunion",
    Sunionstore => "sunionstore",
    // sorted sets
    Zadd => "zadd", Zcard => "zcard", Zcount => "zcount", Zincrby => "zincrby",
    Zinterstore => "zinterstore", Zrange => "zrange", Zrangebyscore => "zrangebyscore",
    Zrank => "zrank", Zrem => "zrem", Zremrangebyrank => "zremrangebyrank",
    Zremrangebyscore => "zremrangebyscore", Zrevrange => "zrevrange",
    Zrevrangebyscore => "zrevrangebyscore", Zrevrank => "zrevrank", Zscore => "zscore",
    Zunionstore => "zunionstore",
    // pub/sub and transactions
    Publish => "publish", Psubscribe => "psubscribe", Punsubscribe => "punsubscribe",
    Subscribe => "subscribe", Unsubscribe => "unsubscribe", Watch => "watch",
    Unwatch => "unwatch", Multi => "multi", Exec => "exec", Discard => "discard",
    // connection and server
    Auth => "auth", Bgrewriteaof => "bgrewriteaof", Bgsave => "bgsave",
    Config => "config", Dbsize => "dbsize", Debug => "debug", Echo => "echo",
    Flushall => "flushall", Flushdb => "flushdb", Getkeys => "getkeys",
    GetOption => "getoption", Info => "info", Keys => "keys", Lastsave => "lastsave",
    Monitor => "monitor", Ping => "ping", Quit => "quit", Randomkey => "randomkey",
    Save => "save", Select => "select", SetOption => "setoption",
    Shutdown => "shutdown", Slaveof => "slaveof", Slowlog => "slowlog", Sync => "sync",
    Time => "time",
}

impl From<&str> for Op {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution strategy attached to an operation name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Session/admin command, always run on the default node
    Unhashed,
    /// Run on every node, results aggregated
    Broadcast,
    /// Multi-key command that must be confined to one shard by a tag
    TagRequired,
    /// Routed to the master of the key's shard
    Write,
    /// Routed to the slave of the key's shard
    Read,
    /// Routed to the default node
    Default,
}

struct Tables {
    read: HashSet<Op>,
    write: HashSet<Op>,
    unhashed: HashSet<Op>,
    broadcast: HashSet<Op>,
    tag_required: HashSet<Op>,
}

static TABLES: LazyLock<Tables> = LazyLock::new(|| {
    use Op::*;
    Tables {
        read: HashSet::from([
            Debug, Getbit, Get, Getrange, Hget, Hgetall, Hkeys, Hlen, Hmget, Hvals, Lindex,
            Llen, Lrange, Object, Scard, Sismember, Smembers, Srandmember, Strlen, Type, Zcard,
            Zcount, Zrange, Zrangebyscore, Zrank, Zrevrange, Zrevrangebyscore, Zrevrank, Zscore,
            Mget, Bitcount, Echo, Substr,
        ]),
        write: HashSet::from([
            Append, Blpop, Brpop, Brpoplpush, Decr, Decrby, Del, Exists, Hexists, Expire,
            Expireat, Getset, Hdel, Hincrby, Hset, Hsetnx, Hmset, Incr, Incrby, Linsert, Lpop,
            Lpush, Lpushx, Lrem, Lset, Ltrim, Move, Persist, Publish, Psubscribe, Punsubscribe,
            Rpop, Rpoplpush, Rpush, Rpushx, Sadd, Sdiff, Sdiffstore, Set, Setbit, Setex, Setnx,
            Setrange, Sinter, Sinterstore, Smove, Sort, Spop, Srem, Subscribe, Sunion,
            Sunionstore, Unsubscribe, Unwatch, Watch, Zadd, Zincrby, Zinterstore, Zrem,
            Zremrangebyrank, Zremrangebyscore, Zunionstore, Mset, Msetnx, Rename, Renamenx, Ttl,
            Flushall, Flushdb,
        ]),
        unhashed: HashSet::from([
            Auth, Monitor, Quit, Shutdown, Slaveof, Slowlog, Sync, Discard, Exec, Multi,
            SetOption, GetOption,
        ]),
        broadcast: HashSet::from([
            Keys, Getkeys, Select, Save, Bgsave, Bgrewriteaof, Dbsize, Info, Lastsave, Ping,
            Flushall, Flushdb, Randomkey, Sync, Config, Time,
        ]),
        tag_required: HashSet::from([
            Mget, Rename, Renamenx, Mset, Msetnx, Brpoplpush, Rpoplpush, Sdiff, Sdiffstore,
            Sinter, Sinterstore, Sunion, Sunionstore, Smove, Zinterstore, Zunionstore, Sort,
        ]),
    }
});

/// Classify an operation
///
/// Precedence when a name sits in several tables:
/// Unhashed > Broadcast > TagRequired > Write > Read > Default.
pub fn classify(op: &Op) -> CommandClass {
    let t = &*TABLES;
    if t.unhashed.contains(op) {
        CommandClass::Unhashed
    } else if t.broadcast.contains(op) {
        CommandClass::Broadcast
    } else if t.tag_required.contains(op) {
        CommandClass::TagRequired
    } else if t.write.contains(op) {
        CommandClass::Write
    } else if t.read.contains(op) {
        CommandClass::Read
    } else {
        CommandClass::Default
    }
}

/// Whether the operation modifies data (routes to a master)
pub fn is_write(op: &Op) -> bool {
    TABLES.write.contains(op)
}

/// Whether the operation is read-only (routes to a slave)
pub fn is_read(op: &Op) -> bool {
    TABLES.read.contains(op)
}

/// Broadcasts whose per-node replies are concatenated instead of keyed by alias
pub fn concatenates_replies(op: &Op) -> bool {
    matches!(op, Op::Keys | Op::Getkeys)
}

/// Operations that block server-side until data arrives or a timeout elapses
pub fn is_blocking(op: &Op) -> bool {
    matches!(op, Op::Blpop | Op::Brpop | Op::Brpoplpush)
}

/// An operation plus its positional arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: Op,
    pub args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(op: impl Into<Op>) -> Self {
        Self {
            op: op.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_vec()));
        self
    }

    /// First argument interpreted as a key, if it is valid UTF-8
    pub fn first_key(&self) -> Option<&str> {
        self.args.first().and_then(|a| std::str::from_utf8(a).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(Op::parse("GET"), Op::Get);
        assert_eq!(Op::parse("SetOption"), Op::SetOption);
        assert_eq!(Op::parse("xadd"), Op::Other("xadd".to_string()));
        assert_eq!(Op::parse("XADD").as_str(), "xadd");
    }

    #[test]
    fn test_precedence() {
        // sync is both unhashed and broadcast
        assert_eq!(classify(&Op::Sync), CommandClass::Unhashed);
        // flushall is both broadcast and write
        assert_eq!(classify(&Op::Flushall), CommandClass::Broadcast);
        // rename is both tag-required and write
        assert_eq!(classify(&Op::Rename), CommandClass::TagRequired);
        // mget is both tag-required and read
        assert_eq!(classify(&Op::Mget), CommandClass::TagRequired);
        assert_eq!(classify(&Op::Set), CommandClass::Write);
        assert_eq!(classify(&Op::Get), CommandClass::Read);
        assert_eq!(classify(&Op::Auth), CommandClass::Unhashed);
        assert_eq!(classify(&Op::Dbsize), CommandClass::Broadcast);
    }

    #[test]
    fn test_unknown_names_are_default() {
        assert_eq!(classify(&Op::parse("xadd")), CommandClass::Default);
        assert_eq!(classify(&Op::parse("")), CommandClass::Default);
    }

    #[test]
    fn test_every_tabled_name_maps_to_one_class() {
        let t = &*TABLES;
        for op in t
            .read
            .iter()
            .chain(&t.write)
            .chain(&t.unhashed)
            .chain(&t.broadcast)
            .chain(&t.tag_required)
        {
            let class = classify(op);
            assert_ne!(class, CommandClass::Default, "{op} fell through");
            assert_eq!(class, classify(&Op::parse(op.as_str())));
        }
    }

    #[test]
    fn test_command_builder() {
        let cmd = Command::new("SET").arg("user:1").arg(b"value".as_slice());
        assert_eq!(cmd.op, Op::Set);
        assert_eq!(cmd.first_key(), Some("user:1"));
        assert_eq!(cmd.args.len(), 2);

        let cmd = Command::new(Op::Del).args(["a", "b", "c"]);
        assert_eq!(cmd.args, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(Command::new(Op::Ping).first_key().is_none());
    }

    #[test]
    fn test_helpers() {
        assert!(is_write(&Op::Flushdb));
        assert!(!is_write(&Op::Dbsize));
        assert!(is_read(&Op::Smembers));
        assert!(concatenates_replies(&Op::Keys));
        assert!(!concatenates_replies(&Op::Dbsize));
        assert!(is_blocking(&Op::Brpop));
    }
}
