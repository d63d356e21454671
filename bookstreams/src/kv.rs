// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of bookstreams.
//
// bookstreams is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// bookstreams is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with bookstreams.  If
// not, see <http://www.gnu.org/licenses/>.

//! # kv
//!
//! Abstractions for the sorted-set key-value store backing the streams.
//!
//! The vocabulary is Redis', since that's what we run against in production, but nothing here
//! requires Redis: any store that can keep a set of (member, score) pairs per key, read them back
//! by descending score, trim them by rank & keep a few integer counters will do. See [redis] and
//! [memory] for the two implementations.
//!
//! [redis]: crate::redis_store
//! [memory]: crate::memory
//!
//! Writes are expressed as a [Pipeline]: an ordered batch of operations submitted in one round
//! trip. Backends must apply the operations in order, but a pipeline is *not* a transaction; if
//! the backend fails part-way through, some operations may have been applied & others not.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
pub enum Error {
    /// The backend could not be reached, or timed out
    #[snafu(display("The key-value store is unavailable: {source}"))]
    StoreUnavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("The key-value store returned something unexpected for {key}: {message}"))]
    #[snafu(visibility(pub(crate)))]
    Unexpected {
        key: String,
        message: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::StoreUnavailable {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One write operation against the store
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Upsert `member` into the sorted set at `key` with `score`. When `only_existing` is set, the
    /// operation is a no-op unless `member` is already present (Redis' `ZADD XX`).
    ZAdd {
        key: String,
        member: u64,
        score: f64,
        only_existing: bool,
    },
    /// Remove `member` from the sorted set at `key`, if present
    ZRem { key: String, member: u64 },
    /// Remove members by rank, ascending from the lowest score; negative indices count back from
    /// the highest-ranked member, with -1 naming the highest
    ZRemRangeByRank { key: String, start: isize, stop: isize },
    /// Increment the integer counter at `key` (absent counters are zero)
    Incr { key: String },
    /// Set the integer counter at `key`
    Set { key: String, value: i64 },
    /// Increment field `field` of the hash at `key`
    HIncrBy { key: String, field: String, delta: i64 },
    /// Delete `key`, whatever it holds
    Del { key: String },
}

/// An ordered batch of [Op]s, submitted to a [Backend] in one round trip
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipeline {
    ops: Vec<Op>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }
    pub fn zadd(&mut self, key: &str, member: u64, score: f64) -> &mut Pipeline {
        self.ops.push(Op::ZAdd {
            key: key.to_owned(),
            member,
            score,
            only_existing: false,
        });
        self
    }
    /// Update `member`'s score, but only if it's already present at `key`
    pub fn zadd_xx(&mut self, key: &str, member: u64, score: f64) -> &mut Pipeline {
        self.ops.push(Op::ZAdd {
            key: key.to_owned(),
            member,
            score,
            only_existing: true,
        });
        self
    }
    pub fn zrem(&mut self, key: &str, member: u64) -> &mut Pipeline {
        self.ops.push(Op::ZRem {
            key: key.to_owned(),
            member,
        });
        self
    }
    pub fn zremrangebyrank(&mut self, key: &str, start: isize, stop: isize) -> &mut Pipeline {
        self.ops.push(Op::ZRemRangeByRank {
            key: key.to_owned(),
            start,
            stop,
        });
        self
    }
    pub fn incr(&mut self, key: &str) -> &mut Pipeline {
        self.ops.push(Op::Incr {
            key: key.to_owned(),
        });
        self
    }
    pub fn set(&mut self, key: &str, value: i64) -> &mut Pipeline {
        self.ops.push(Op::Set {
            key: key.to_owned(),
            value,
        });
        self
    }
    pub fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> &mut Pipeline {
        self.ops.push(Op::HIncrBy {
            key: key.to_owned(),
            field: field.to_owned(),
            delta,
        });
        self
    }
    pub fn del(&mut self, key: &str) -> &mut Pipeline {
        self.ops.push(Op::Del {
            key: key.to_owned(),
        });
        self
    }
    /// Append all of `other`'s operations to this pipeline
    pub fn extend(&mut self, other: Pipeline) -> &mut Pipeline {
        self.ops.extend(other.ops);
        self
    }
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
    pub fn len(&self) -> usize {
        self.ops.len()
    }
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }
    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Object-safe trait abstracting over the sorted-set key-value store
///
/// Reads of absent keys are never errors: an absent sorted set is empty, an absent counter is zero
/// & an absent hash has no fields.
#[async_trait]
pub trait Backend {
    /// Apply every operation in `pipeline`, in order
    async fn execute(&self, pipeline: Pipeline) -> Result<()>;
    /// The members of the sorted set at `key` together with their scores, by descending score
    async fn zrevrange(&self, key: &str) -> Result<Vec<(u64, f64)>>;
    /// The number of members in the sorted set at `key`
    async fn zcard(&self, key: &str) -> Result<usize>;
    /// The integer counter at `key`
    async fn get(&self, key: &str) -> Result<i64>;
    /// Every field of the hash at `key`
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, i64>>;
    /// The keys matching a glob-style `pattern` (`*` matches any run of characters)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}
