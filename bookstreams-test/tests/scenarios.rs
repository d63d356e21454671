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

//! # bookstreams scenario tests
//!
//! Every registered [ScenarioTest] is run against the in-memory key-value store & (when
//! `BOOKSTREAMS_TEST_REDIS` names a server) against Redis. Each trial is named
//! `<fixture>::<scenario>` so that `cargo test --test scenarios -- memory::` & the like work as
//! expected.
//!
//! The Redis fixture is shared between scenarios, each of which begins by clearing it, so when
//! it's in play the trials are run one at a time.

use std::{fmt::Display, io, sync::Arc};

use common::{Configuration, ScenarioTest};

use bookstreams::{
    kv,
    memory::InMemoryKv,
    redis_store::{self, RedisBackend},
};
use bookstreams_test::{streams, suggestions};
use itertools::Itertools;
use libtest_mimic::{Arguments, Trial};
use snafu::prelude::*;
use tokio::runtime::Runtime;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to connect to Redis: {source}"))]
    Redis { source: redis_store::Error },
    #[snafu(display("Failed to build a tokio runtime: {source}"))]
    Runtime { source: io::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit!(ScenarioTest {
    name: "010follow_backfills_home",
    test_fn: |kv| Box::pin(streams::follow_backfills_home(kv)),
});

inventory::submit!(ScenarioTest {
    name: "020followers_only_audience",
    test_fn: |kv| Box::pin(streams::followers_only_audience(kv)),
});

inventory::submit!(ScenarioTest {
    name: "030block_and_unblock",
    test_fn: |kv| Box::pin(streams::block_and_unblock(kv)),
});

inventory::submit!(ScenarioTest {
    name: "040boosts_supersede",
    test_fn: |kv| Box::pin(streams::boosts_supersede(kv)),
});

inventory::submit!(ScenarioTest {
    name: "050unread_counts",
    test_fn: |kv| Box::pin(streams::unread_counts(kv)),
});

inventory::submit!(ScenarioTest {
    name: "060rebuild_equivalence",
    test_fn: |kv| Box::pin(streams::rebuild_equivalence(kv)),
});

inventory::submit!(ScenarioTest {
    name: "070capacity",
    test_fn: |kv| Box::pin(streams::capacity(kv)),
});

inventory::submit!(ScenarioTest {
    name: "080suggestion_lifecycle",
    test_fn: |kv| Box::pin(suggestions::suggestion_lifecycle(kv)),
});

/// Hands out the key-value store for each trial
type MakeKv = Arc<dyn Fn() -> Arc<dyn kv::Backend + Send + Sync> + Send + Sync>;

fn main() -> Result<()> {
    // libtest-mimic wants synchronous test functions, so we build the runtime ourselves & block on
    // each scenario in turn.
    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);

    let config = Configuration::new();

    if config.logging {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(config.log_level).into())
            .from_env()
            .context(FilterSnafu)?;
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(filter),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    let memory: MakeKv =
        Arc::new(|| Arc::new(InMemoryKv::new()) as Arc<dyn kv::Backend + Send + Sync>);
    let mut fixtures: Vec<(&'static str, MakeKv)> = vec![("memory", memory)];

    let mut args = Arguments::from_args();

    if let Some(url) = &config.redis {
        let redis = Arc::new(
            rt.block_on(RedisBackend::new(&redis_store::Config { url: url.clone() }))
                .context(RedisSnafu)?,
        );
        let shared: MakeKv =
            Arc::new(move || redis.clone() as Arc<dyn kv::Backend + Send + Sync>);
        fixtures.push(("redis", shared));
        if !matches!(args.test_threads, Some(1)) {
            eprintln!("Overriding --test-threads to 1 for the shared Redis fixture.");
            args.test_threads = Some(1);
        }
    }

    let conclusion = libtest_mimic::run(
        &args,
        fixtures
            .iter()
            .cartesian_product(
                inventory::iter::<ScenarioTest>
                    .into_iter()
                    .sorted_by_key(|t| t.name)
                    .collect::<Vec<_>>(),
            )
            .map(|((fixture, make_kv), test)| {
                Trial::test(format!("{}::{}", fixture, test.name), {
                    let rt = rt.clone();
                    let make_kv = make_kv.clone();
                    move || rt.block_on(async { (test.test_fn)(make_kv()).await })
                })
            })
            .collect(),
    );

    conclusion.exit();
}
