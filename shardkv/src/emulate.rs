//! Cross-shard emulation
//!
//! Multi-key operations whose keys may live on different shards are
//! decomposed into single-key primitives. None of them is atomic: a failure
//! or a concurrent writer between two steps is visible to other clients.

use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::client::ClusterClient;
use crate::command::{Command, Op, classify};
use crate::error::{ClusterError, Result};
use crate::node::Reply;

#[derive(Debug, Clone, Copy)]
enum SetAlgebra {
    Diff,
    Inter,
    Union,
}

impl ClusterClient {
    /// Emulated implementation of an untagged tag-required operation
    pub(crate) async fn emulate(&self, cmd: Command) -> Result<Reply> {
        debug!(command = %cmd.op, keys = cmd.args.len(), "emulating across shards");
        let name = cmd.op.to_string();
        let args = cmd.args;
        match cmd.op {
            Op::Sdiff => self.set_algebra(SetAlgebra::Diff, &args).await,
            Op::Sinter => self.set_algebra(SetAlgebra::Inter, &args).await,
            Op::Sunion => self.set_algebra(SetAlgebra::Union, &args).await,
            Op::Sdiffstore => self.set_algebra_store(SetAlgebra::Diff, &name, &args).await,
            Op::Sinterstore => self.set_algebra_store(SetAlgebra::Inter, &name, &args).await,
            Op::Sunionstore => self.set_algebra_store(SetAlgebra::Union, &name, &args).await,
            Op::Smove => match args.as_slice() {
                [src, dst, value] => self.emulate_smove(src, dst, value).await,
                _ => Err(ClusterError::invalid_args(&name, "expected src dst member")),
            },
            Op::Rpoplpush => match args.as_slice() {
                [src, dst] => self.emulate_pop_push(src, dst, None).await,
                _ => Err(ClusterError::invalid_args(&name, "expected src dst")),
            },
            Op::Brpoplpush => match args.as_slice() {
                [src, dst, timeout] => self.emulate_pop_push(src, dst, Some(timeout)).await,
                _ => Err(ClusterError::invalid_args(&name, "expected src dst timeout")),
            },
            Op::Mget => self.emulate_mget(&args).await,
            Op::Mset => self.emulate_mset(&name, &args).await,
            Op::Msetnx => self.emulate_msetnx(&name, &args).await,
            _ => Err(ClusterError::UnsupportedCommand(name)),
        }
    }

    /// Run a primitive through the router
    async fn primitive(&self, cmd: Command) -> Result<Reply> {
        let class = classify(&cmd.op);
        self.route(cmd, class).await
    }

    async fn members(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let reply = self.primitive(Command::new(Op::Smembers).arg(key)).await?;
        match reply {
            Reply::Array(items) => Ok(items.into_iter().filter_map(Reply::into_bytes).collect()),
            Reply::Nil => Ok(Vec::new()),
            other => Err(ClusterError::UnexpectedReply {
                command: "smembers".to_string(),
                reply: format!("{:?}", other),
            }),
        }
    }

    async fn set_algebra(&self, algebra: SetAlgebra, keys: &[Vec<u8>]) -> Result<Reply> {
        let members = self.compute_set(algebra, keys).await?;
        Ok(Reply::Array(members.into_iter().map(Reply::Bulk).collect()))
    }

    /// Members of `keys[0]` combined with every following set, in the
    /// source set's order
    async fn compute_set(&self, algebra: SetAlgebra, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        let Some((src, others)) = keys.split_first() else {
            return Ok(Vec::new());
        };
        let mut result = self.members(src).await?;
        if result.is_empty() {
            return Ok(result);
        }

        for key in others {
            let other = self.members(key).await?;
            if other.is_empty() {
                continue;
            }
            match algebra {
                SetAlgebra::Diff => {
                    let other: HashSet<_> = other.into_iter().collect();
                    result.retain(|m| !other.contains(m));
                }
                SetAlgebra::Inter => {
                    let other: HashSet<_> = other.into_iter().collect();
                    result.retain(|m| other.contains(m));
                }
                SetAlgebra::Union => {
                    let mut seen: HashSet<_> = result.iter().cloned().collect();
                    for m in other {
                        if seen.insert(m.clone()) {
                            result.push(m);
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    async fn set_algebra_store(
        &self,
        algebra: SetAlgebra,
        name: &str,
        args: &[Vec<u8>],
    ) -> Result<Reply> {
        let Some((dst, keys)) = args.split_first() else {
            return Err(ClusterError::invalid_args(name, "expected dst and source keys"));
        };
        let members = self.compute_set(algebra, keys).await?;

        let mut added = 0;
        for member in members {
            let reply = self
                .primitive(Command::new(Op::Sadd).arg(dst).arg(member))
                .await?;
            added += reply.as_int().unwrap_or(0);
        }
        Ok(Reply::Int(added))
    }

    async fn emulate_smove(&self, src: &[u8], dst: &[u8], value: &[u8]) -> Result<Reply> {
        let removed = self
            .primitive(Command::new(Op::Srem).arg(src).arg(value))
            .await?;
        if !removed.is_truthy() {
            return Ok(Reply::from_bool(false));
        }
        self.primitive(Command::new(Op::Sadd).arg(dst).arg(value))
            .await?;
        Ok(Reply::from_bool(true))
    }

    async fn emulate_pop_push(
        &self,
        src: &[u8],
        dst: &[u8],
        timeout: Option<&Vec<u8>>,
    ) -> Result<Reply> {
        let value = match timeout {
            None => self.primitive(Command::new(Op::Rpop).arg(src)).await?,
            Some(timeout) => {
                let popped = self
                    .primitive(Command::new(Op::Brpop).arg(src).arg(timeout))
                    .await?;
                // [list, value]
                popped
                    .into_array()
                    .and_then(|mut pair| (pair.len() == 2).then(|| pair.swap_remove(1)))
                    .unwrap_or(Reply::Nil)
            }
        };
        let Some(value) = value.into_bytes() else {
            return Ok(Reply::Nil);
        };

        let pushed = self
            .primitive(Command::new(Op::Lpush).arg(dst).arg(&value))
            .await?;
        if pushed.is_truthy() {
            Ok(Reply::Bulk(value))
        } else {
            Ok(Reply::Nil)
        }
    }

    async fn emulate_mget(&self, keys: &[Vec<u8>]) -> Result<Reply> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.primitive(Command::new(Op::Get).arg(key)).await?);
        }
        Ok(Reply::Array(values))
    }

    async fn emulate_mset(&self, name: &str, args: &[Vec<u8>]) -> Result<Reply> {
        // no pairs is vacuously successful
        if args.len() % 2 != 0 {
            return Err(ClusterError::invalid_args(name, "expected key value pairs"));
        }
        // stops at the first set that does not succeed
        for pair in args.chunks(2) {
            let reply = self
                .primitive(Command::new(Op::Set).arg(&pair[0]).arg(&pair[1]))
                .await?;
            if !reply.is_truthy() {
                return Ok(Reply::from_bool(false));
            }
        }
        Ok(Reply::from_bool(true))
    }

    async fn emulate_msetnx(&self, name: &str, args: &[Vec<u8>]) -> Result<Reply> {
        if args.len() % 2 != 0 {
            return Err(ClusterError::invalid_args(name, "expected key value pairs"));
        }
        // existence pass and write pass are not atomic as a unit
        for pair in args.chunks(2) {
            let exists = self
                .primitive(Command::new(Op::Exists).arg(&pair[0]))
                .await?;
            if exists.is_truthy() {
                return Ok(Reply::from_bool(false));
            }
        }
        self.emulate_mset(name, args).await
    }

    // Typed helpers. They go through `execute`, so a tagged first key keeps
    // the operation on one shard and the failure policy applies.

    /// Values of `keys` in order; missing keys are `None`
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Option<Vec<u8>>>> {
        let cmd = Command::new(Op::Mget).args(keys.iter().map(|k| k.as_ref()));
        let reply = self.call(cmd).await?;
        Ok(reply
            .into_array()
            .unwrap_or_default()
            .into_iter()
            .map(Reply::into_bytes)
            .collect())
    }

    /// Set every pair; true only if every set succeeded
    pub async fn mset<K, V>(&self, pairs: &[(K, V)]) -> Result<bool>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let cmd = pairs.iter().fold(Command::new(Op::Mset), |cmd, (k, v)| {
            cmd.arg(k.as_ref()).arg(v)
        });
        Ok(self.call(cmd).await?.is_truthy())
    }

    /// Set every pair only if none of the keys exists
    pub async fn msetnx<K, V>(&self, pairs: &[(K, V)]) -> Result<bool>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let cmd = pairs.iter().fold(Command::new(Op::Msetnx), |cmd, (k, v)| {
            cmd.arg(k.as_ref()).arg(v)
        });
        Ok(self.call(cmd).await?.is_truthy())
    }

    /// Members of `src` not in any of `others`
    pub async fn sdiff<K: AsRef<str>>(&self, src: &str, others: &[K]) -> Result<Vec<Vec<u8>>> {
        self.members_call(Op::Sdiff, src, others).await
    }

    /// Members of `src` present in every one of `others`
    pub async fn sinter<K: AsRef<str>>(&self, src: &str, others: &[K]) -> Result<Vec<Vec<u8>>> {
        self.members_call(Op::Sinter, src, others).await
    }

    /// Members of `src` and all of `others`
    pub async fn sunion<K: AsRef<str>>(&self, src: &str, others: &[K]) -> Result<Vec<Vec<u8>>> {
        self.members_call(Op::Sunion, src, others).await
    }

    /// Store `sdiff(src, others)` into `dst`; returns the number of members added
    pub async fn sdiffstore<K: AsRef<str>>(&self, dst: &str, src: &str, others: &[K]) -> Result<i64> {
        self.store_call(Op::Sdiffstore, dst, src, others).await
    }

    /// Store `sinter(src, others)` into `dst`; returns the number of members added
    pub async fn sinterstore<K: AsRef<str>>(
        &self,
        dst: &str,
        src: &str,
        others: &[K],
    ) -> Result<i64> {
        self.store_call(Op::Sinterstore, dst, src, others).await
    }

    /// Store `sunion(src, others)` into `dst`; returns the number of members added
    pub async fn sunionstore<K: AsRef<str>>(
        &self,
        dst: &str,
        src: &str,
        others: &[K],
    ) -> Result<i64> {
        self.store_call(Op::Sunionstore, dst, src, others).await
    }

    /// Move `member` from `src` to `dst`
    pub async fn smove(&self, src: &str, dst: &str, member: impl AsRef<[u8]>) -> Result<bool> {
        let cmd = Command::new(Op::Smove).arg(src).arg(dst).arg(member);
        Ok(self.call(cmd).await?.is_truthy())
    }

    /// Pop the tail of `src` and push it on the head of `dst`
    pub async fn rpoplpush(&self, src: &str, dst: &str) -> Result<Option<Vec<u8>>> {
        let cmd = Command::new(Op::Rpoplpush).arg(src).arg(dst);
        Ok(self.call(cmd).await?.into_bytes())
    }

    /// Blocking [`rpoplpush`](Self::rpoplpush); a zero timeout waits forever
    pub async fn brpoplpush(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let cmd = Command::new(Op::Brpoplpush)
            .arg(src)
            .arg(dst)
            .arg(timeout.as_secs_f64().to_string());
        Ok(self.call(cmd).await?.into_bytes())
    }

    /// `object <subcommand> <key>`, served by the key's read replica
    pub async fn object(&self, subcommand: &str, key: &str) -> Result<Reply> {
        self.call(Command::new(Op::Object).arg(subcommand).arg(key))
            .await
    }

    async fn members_call<K: AsRef<str>>(
        &self,
        op: Op,
        src: &str,
        others: &[K],
    ) -> Result<Vec<Vec<u8>>> {
        let cmd = Command::new(op)
            .arg(src)
            .args(others.iter().map(|k| k.as_ref()));
        Ok(self
            .call(cmd)
            .await?
            .into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(Reply::into_bytes)
            .collect())
    }

    async fn store_call<K: AsRef<str>>(
        &self,
        op: Op,
        dst: &str,
        src: &str,
        others: &[K],
    ) -> Result<i64> {
        let cmd = Command::new(op)
            .arg(dst)
            .arg(src)
            .args(others.iter().map(|k| k.as_ref()));
        Ok(self.call(cmd).await?.as_int().unwrap_or(0))
    }
}
