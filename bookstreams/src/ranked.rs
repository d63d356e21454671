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

//! # ranked
//!
//! A [RankedStore] is a family of score-ordered, size-bounded sets of integer members, one per
//! store key. Both the activity streams and the suggested-users lists are built on it.
//!
//! Every mutation comes in two flavors: one that appends its operations to a caller-owned
//! [Pipeline] (named `..._to`), and one that builds & executes a pipeline of its own. The former
//! lets a caller batch all the writes for one event into one round trip.
//!
//! Failures from the key-value store are simply propagated as [kv::Error]; there's no retry at
//! this layer.

use std::{num::NonZeroUsize, sync::Arc};

use tracing::debug;

use crate::kv::{self, Pipeline};

/// A score-ordered, optionally bounded, set of members per store key
#[derive(Clone)]
pub struct RankedStore {
    kv: Arc<dyn kv::Backend + Send + Sync>,
    max_length: Option<NonZeroUsize>,
}

impl std::fmt::Debug for RankedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedStore")
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl RankedStore {
    /// `max_length` of None means the stores are unbounded
    pub fn new(kv: Arc<dyn kv::Backend + Send + Sync>, max_length: Option<NonZeroUsize>) -> Self {
        RankedStore { kv, max_length }
    }
    pub fn max_length(&self) -> Option<NonZeroUsize> {
        self.max_length
    }
    pub fn kv(&self) -> &Arc<dyn kv::Backend + Send + Sync> {
        &self.kv
    }
    /// Trim `key` so that it holds at most `max_length` members, evicting the lowest-ranked first
    pub fn trim_to(&self, pipeline: &mut Pipeline, key: &str) {
        if let Some(n) = self.max_length {
            // Ranks [0, len - n - 1] are everything but the top n; Redis treats an empty range as
            // a no-op.
            pipeline.zremrangebyrank(key, 0, -(n.get() as isize) - 1);
        }
    }
    /// Upsert `member` with `score` into every store in `keys`, trimming each
    pub fn add_to<I, S>(&self, pipeline: &mut Pipeline, keys: I, member: u64, score: f64)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().for_each(|key| {
            pipeline.zadd(key.as_ref(), member, score);
            self.trim_to(pipeline, key.as_ref());
        });
    }
    pub async fn add<I, S>(&self, keys: I, member: u64, score: f64) -> kv::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pipeline = Pipeline::new();
        self.add_to(&mut pipeline, keys, member, score);
        self.execute(pipeline).await
    }
    /// Update `member`'s score in every store in `keys` that already holds it
    pub fn rerank_to<I, S>(&self, pipeline: &mut Pipeline, keys: I, member: u64, score: f64)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().for_each(|key| {
            pipeline.zadd_xx(key.as_ref(), member, score);
        });
    }
    /// Remove `member` from every store in `keys`; absent members are not an error
    pub fn remove_from<I, S>(&self, pipeline: &mut Pipeline, keys: I, member: u64)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().for_each(|key| {
            pipeline.zrem(key.as_ref(), member);
        });
    }
    pub async fn remove<I, S>(&self, keys: I, member: u64) -> kv::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pipeline = Pipeline::new();
        self.remove_from(&mut pipeline, keys, member);
        self.execute(pipeline).await
    }
    /// Add the first `max_length` of `items` (in the order given) to the store at `key`, then trim
    /// once
    ///
    /// Returns the number of members written.
    pub fn bulk_add_to<I>(&self, pipeline: &mut Pipeline, key: &str, items: I) -> usize
    where
        I: IntoIterator<Item = (u64, f64)>,
    {
        let limit = self.max_length.map(NonZeroUsize::get).unwrap_or(usize::MAX);
        let written = items
            .into_iter()
            .take(limit)
            .map(|(member, score)| {
                pipeline.zadd(key, member, score);
            })
            .count();
        if written > 0 {
            self.trim_to(pipeline, key);
        }
        written
    }
    pub async fn bulk_add<I>(&self, key: &str, items: I) -> kv::Result<usize>
    where
        I: IntoIterator<Item = (u64, f64)>,
    {
        let mut pipeline = Pipeline::new();
        let written = self.bulk_add_to(&mut pipeline, key, items);
        self.execute(pipeline).await?;
        Ok(written)
    }
    pub fn bulk_remove_to<I>(&self, pipeline: &mut Pipeline, key: &str, items: I)
    where
        I: IntoIterator<Item = u64>,
    {
        items.into_iter().for_each(|member| {
            pipeline.zrem(key, member);
        });
    }
    pub async fn bulk_remove<I>(&self, key: &str, items: I) -> kv::Result<()>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut pipeline = Pipeline::new();
        self.bulk_remove_to(&mut pipeline, key, items);
        self.execute(pipeline).await
    }
    /// The members of the store at `key`, highest score first; an absent store is empty
    pub async fn read(&self, key: &str) -> kv::Result<Vec<u64>> {
        Ok(self
            .kv
            .zrevrange(key)
            .await?
            .into_iter()
            .map(|(member, _)| member)
            .collect())
    }
    pub async fn read_with_scores(&self, key: &str) -> kv::Result<Vec<(u64, f64)>> {
        self.kv.zrevrange(key).await
    }
    pub async fn len(&self, key: &str) -> kv::Result<usize> {
        self.kv.zcard(key).await
    }
    pub fn increment_counter_to(&self, pipeline: &mut Pipeline, key: &str) {
        pipeline.incr(key);
    }
    pub async fn increment_counter(&self, key: &str) -> kv::Result<()> {
        let mut pipeline = Pipeline::new();
        self.increment_counter_to(&mut pipeline, key);
        self.execute(pipeline).await
    }
    /// The counter at `key`; zero if absent
    pub async fn get_counter(&self, key: &str) -> kv::Result<i64> {
        self.kv.get(key).await
    }
    pub async fn reset_counter(&self, key: &str) -> kv::Result<()> {
        let mut pipeline = Pipeline::new();
        pipeline.set(key, 0);
        self.execute(pipeline).await
    }
    /// Submit `pipeline`; empty pipelines never reach the backend
    pub async fn execute(&self, pipeline: Pipeline) -> kv::Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        debug!(ops = pipeline.len(), "Executing pipeline");
        self.kv.execute(pipeline).await
    }
}
