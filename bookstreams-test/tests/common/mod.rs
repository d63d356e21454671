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

use std::{env, future::Future, pin::Pin, sync::Arc};

use bookstreams::kv;
use libtest_mimic::Failed;
use tracing::Level;

/// Common test configuration
///
/// libtest-mimic claims the command line, so configuration comes from the environment.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Install a tracing subscriber
    pub logging: bool,
    pub log_level: Level,
    /// Redis URL; when set, every scenario runs against Redis as well
    pub redis: Option<String>,
}

impl Configuration {
    /// Obtain a [Configuration] from `BOOKSTREAMS_TEST_LOG` (a log level, whose presence turns
    /// logging on) & `BOOKSTREAMS_TEST_REDIS`
    pub fn new() -> Configuration {
        let level = env::var("BOOKSTREAMS_TEST_LOG")
            .ok()
            .filter(|s| !s.is_empty());
        Configuration {
            logging: level.is_some(),
            log_level: level
                .and_then(|s| s.parse::<Level>().ok())
                .unwrap_or(Level::INFO),
            redis: env::var("BOOKSTREAMS_TEST_REDIS")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

pub type TestFuture = Pin<Box<dyn Future<Output = Result<(), Failed>> + Send>>;

/// A scenario, to be run against each fixture
#[derive(Debug)]
pub struct ScenarioTest {
    pub name: &'static str,
    pub test_fn: fn(Arc<dyn kv::Backend + Send + Sync>) -> TestFuture,
}

inventory::collect!(ScenarioTest);
