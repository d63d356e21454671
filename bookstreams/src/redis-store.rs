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

//! # redis-store
//!
//! [kv::Backend] implementation over Redis.
//!
//! Each [Pipeline] goes out as a single Redis pipeline (`MULTI`-less: Redis applies the commands
//! in order, but another client's commands may interleave). Connection handling is left to
//! [ConnectionManager], which reconnects transparently; while it's reconnecting, commands fail &
//! we report the store as unavailable.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisError};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::debug;

use crate::kv::{self, Op, Pipeline};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad Redis URL {url}: {source}"))]
    Url {
        url: String,
        source: RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to {url}: {source}"))]
    Connect {
        url: String,
        source: RedisError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Redis connection parameters
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: "redis://localhost:6379/0".to_owned(),
        }
    }
}

/// Map a Redis failure to our error type; anything that isn't a connectivity problem means Redis
/// answered, just not the way we expected
fn map_err(key: &str, err: RedisError) -> kv::Error {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        kv::Error::unavailable(err)
    } else {
        kv::Error::Unexpected {
            key: key.to_owned(),
            message: err.to_string(),
            backtrace: Backtrace::capture(),
        }
    }
}

#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub async fn new(config: &Config) -> Result<RedisBackend> {
        let client = redis::Client::open(config.url.as_str()).context(UrlSnafu {
            url: config.url.clone(),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .context(ConnectSnafu {
                url: config.url.clone(),
            })?;
        Ok(RedisBackend { conn })
    }
}

/// Translate `pipeline` into its Redis counterpart
fn to_redis(pipeline: Pipeline) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for op in pipeline.into_ops() {
        match op {
            Op::ZAdd {
                key,
                member,
                score,
                only_existing,
            } => {
                let cmd = pipe.cmd("ZADD").arg(key);
                if only_existing {
                    cmd.arg("XX");
                }
                cmd.arg(score).arg(member).ignore();
            }
            Op::ZRem { key, member } => {
                pipe.cmd("ZREM").arg(key).arg(member).ignore();
            }
            Op::ZRemRangeByRank { key, start, stop } => {
                pipe.cmd("ZREMRANGEBYRANK")
                    .arg(key)
                    .arg(start)
                    .arg(stop)
                    .ignore();
            }
            Op::Incr { key } => {
                pipe.cmd("INCR").arg(key).ignore();
            }
            Op::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            Op::HIncrBy { key, field, delta } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(delta).ignore();
            }
            Op::Del { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
        }
    }
    pipe
}

#[async_trait]
impl kv::Backend for RedisBackend {
    async fn execute(&self, pipeline: Pipeline) -> kv::Result<()> {
        let n = pipeline.len();
        // Name the first key touched, for error reporting
        let key = match pipeline.ops().first() {
            Some(Op::ZAdd { key, .. })
            | Some(Op::ZRem { key, .. })
            | Some(Op::ZRemRangeByRank { key, .. })
            | Some(Op::Incr { key })
            | Some(Op::Set { key, .. })
            | Some(Op::HIncrBy { key, .. })
            | Some(Op::Del { key }) => key.clone(),
            None => return Ok(()),
        };
        let mut conn = self.conn.clone();
        let () = to_redis(pipeline)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_err(&key, err))?;
        debug!("Sent {} commands to Redis", n);
        Ok(())
    }
    async fn zrevrange(&self, key: &str) -> kv::Result<Vec<(u64, f64)>> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|err| map_err(key, err))
    }
    async fn zcard(&self, key: &str) -> kv::Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_err(key, err))
    }
    async fn get(&self, key: &str) -> kv::Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_err(key, err))?;
        Ok(value.unwrap_or(0))
    }
    async fn hgetall(&self, key: &str) -> kv::Result<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_err(key, err))
    }
    // `KEYS` blocks the server while it walks the keyspace; it's only used by administrative
    // operations like erasing streams.
    async fn keys(&self, pattern: &str) -> kv::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_err(pattern, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errors_are_classified() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(
            map_err("1-home", io),
            kv::Error::StoreUnavailable { .. }
        ));
        let wrongtype = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(
            map_err("1-home", wrongtype),
            kv::Error::Unexpected { key, .. } if key == "1-home"
        ));
    }

    #[test]
    fn pipelines_translate_one_for_one() {
        let mut p = Pipeline::new();
        p.zadd("1-home", 7, 1.5)
            .zadd_xx("1-suggestions", 2, 0.5)
            .zremrangebyrank("1-home", 0, -201)
            .incr("1-home-unread")
            .hincrby("1-home-unread-by-type", "review", 1)
            .del("1-suggestions");
        assert_eq!(to_redis(p).cmd_iter().count(), 6);
    }

    #[test]
    fn default_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.url, "redis://localhost:6379/0");
    }
}
