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

//! # The bookstreams Integration Tests
//!
//! # Introduction
//!
//! The unit tests beside each module exercise one piece at a time. The tests here drive the whole
//! pipeline (notifier, queue, processor, fan-out & stores) through multi-step scenarios, the way
//! an embedding application would.
//!
//! As with any integration test suite, the question is one of fixtures: the same scenario should
//! hold whether the key-value store is the in-memory one or a real Redis server. Cargo has no
//! notion of fixtures, so the test program opts out of the default harness:
//!
//! ```toml
//! [[test]]
//!     name = "scenarios"
//!     harness = false
//! ```
//!
//! and uses [libtest-mimic] to present each (scenario, fixture) pair as a separate test while still
//! honoring the usual `cargo test` command-line.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! # Project Structure
//!
//! The scenarios themselves live in this library crate, written against a bare
//! [kv::Backend](bookstreams::kv::Backend) so that any fixture can run them. Code relating to the
//! test framework (the fixtures, the test registry) lives in `tests/common`, and the test program
//! in `tests/scenarios.rs`.
use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use libtest_mimic::Failed;

use bookstreams::{
    background_tasks::{self, Processor},
    catalog::StreamCatalog,
    entities::{StatusId, UserId},
    fanout::{self, EventQueue, Fanout, Notifier},
    kv::{self, Pipeline},
    memory::InMemory,
    metrics::Instruments,
    streams::StreamKind,
    suggested::SuggestedUsers,
};

pub mod streams;
pub mod suggestions;

/// Delete every key in `kv`
///
/// Scenarios number their users from one, so each must start from an empty store.
pub async fn clear(kv: &(dyn kv::Backend + Send + Sync)) -> Result<(), Failed> {
    let mut pipeline = Pipeline::new();
    for key in kv.keys("*").await? {
        pipeline.del(&key);
    }
    kv.execute(pipeline).await?;
    Ok(())
}

/// Everything a scenario needs: a database to play the application against, the fan-out engine,
/// and the pipeline feeding it
pub struct World {
    pub db: Arc<InMemory>,
    pub kv: Arc<dyn kv::Backend + Send + Sync>,
    pub fanout: Arc<Fanout>,
    pub notifier: Notifier,
    queue: Arc<EventQueue>,
    processor: Processor,
}

impl World {
    /// Start a world over an empty `kv` with every stream kind active
    pub async fn new(
        kv: Arc<dyn kv::Backend + Send + Sync>,
        max_stream_length: usize,
    ) -> Result<World, Failed> {
        clear(kv.as_ref()).await?;
        let db = Arc::new(InMemory::new());
        let instruments = Arc::new(Instruments::new("bookstreams-test"));
        let fanout = Arc::new(Fanout::new(
            StreamCatalog::new(
                StreamKind::all(),
                kv.clone(),
                db.clone(),
                NonZeroUsize::new(max_stream_length).ok_or("zero-length streams")?,
            ),
            SuggestedUsers::new(
                kv.clone(),
                db.clone(),
                NonZeroUsize::new(10).ok_or("zero-length suggestions")?,
            ),
            instruments.clone(),
        ));
        let (notifier, queue, processor) = fanout::start(
            fanout.clone(),
            background_tasks::Config {
                sleep_duration: Duration::from_millis(5),
                ..Default::default()
            },
            instruments,
        );
        Ok(World {
            db,
            kv,
            fanout,
            notifier,
            queue,
            processor,
        })
    }
    /// Wait for every published event to be processed
    pub async fn settle(&self) -> Result<(), Failed> {
        if self.queue.wait_idle(Duration::from_secs(10)).await {
            Ok(())
        } else {
            Err("timed-out waiting for the event queue to drain".into())
        }
    }
    pub async fn timeline(&self, user: UserId, kind: StreamKind) -> Result<Vec<StatusId>, Failed> {
        Ok(self.fanout.get_timeline(&user, kind).await?)
    }
    pub async fn shutdown(self) -> Result<(), Failed> {
        self.settle().await?;
        self.processor.shutdown(Duration::from_secs(5)).await?;
        Ok(())
    }
}

/// `minutes` minutes ago; scenarios publish into the recent past so that later statuses rank higher
pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}
