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

//! # bookstreams
//!
//! Administrative tool for inspecting & maintaining [bookstreams] stores in Redis.
//!
//! The tool speaks only to the key-value store; it has no access to the service's database, so
//! everything it does is either a read, or a reset (marking a stream read, erasing streams). Fanning
//! events out is the business of the service embedding the library.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    result::Result as StdResult,
    sync::Arc,
};

use clap::{
    crate_authors, crate_version, parser::ValueSource, value_parser, Arg, ArgAction, ArgMatches,
    Command,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tap::Pipe;
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use bookstreams::{
    background_tasks,
    catalog::{self, StreamCatalog},
    entities::UserId,
    memory::InMemory,
    redis_store::{self, RedisBackend},
    streams::StreamKind,
    suggested::{SuggestedUsers, SuggestionRank},
};

#[derive(Snafu)]
enum Error {
    #[snafu(display("While attempting to read {path:?}, {source}"))]
    BadConfig {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Catalog { source: catalog::Error },
    #[snafu(display("While parsing the configuration file, {source}"))]
    Config {
        source: toml::de::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build the log filter: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
        backtrace: Backtrace,
    },
    #[snafu(display("No sub-command given; try --help"))]
    NoSubCommand,
    #[snafu(display("{source}"))]
    Redis { source: redis_store::Error },
    #[snafu(display("Failed to serialize the configuration: {source}"))]
    Ser {
        source: toml::ser::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to setup the tracing global subscriber: {source}"))]
    Subscriber {
        source: tracing::dispatcher::SetGlobalDefaultError,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Suggestions {
        source: bookstreams::suggested::Error,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> StdResult<(), std::fmt::Error> {
        write!(f, "{self}")
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// bookstreams configuration, version one
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigV1 {
    streams: catalog::Config,
    #[serde(rename = "background-tasks")]
    background_tasks: background_tasks::Config,
    redis: redis_store::Config,
}

#[derive(Deserialize, Serialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the configuration file at `path`; a missing file is only an error if the user named it
fn parse_config(path: &Path, source: Option<ValueSource>) -> Result<ConfigV1> {
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str::<Configuration>(&text).context(ConfigSnafu)? {
            Configuration::V1(cfg) => Ok(cfg),
        },
        Err(err) => match (err.kind(), source) {
            (io::ErrorKind::NotFound, Some(ValueSource::DefaultValue)) => Ok(ConfigV1::default()),
            _ => Err(BadConfigSnafu {
                path: path.to_path_buf(),
            }
            .into_error(err)),
        },
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          sub-commands                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The handles the sub-commands work through
///
/// Neither handle ever needs the database for the operations we expose, so they're given an empty
/// one.
struct Stores {
    catalog: StreamCatalog,
    suggestions: SuggestedUsers,
}

impl Stores {
    async fn connect(cfg: &ConfigV1) -> Result<Stores> {
        let kv = Arc::new(RedisBackend::new(&cfg.redis).await.context(RedisSnafu)?);
        let db = Arc::new(InMemory::new());
        Stores {
            catalog: StreamCatalog::from_config(&cfg.streams, kv.clone(), db.clone()),
            suggestions: SuggestedUsers::new(kv, db, cfg.streams.suggestions_max_length),
        }
        .pipe(Ok)
    }
}

fn user_and_kind(matches: &ArgMatches) -> (UserId, StreamKind) {
    (
        *matches.get_one::<UserId>("USER").unwrap(/* impossible */),
        *matches.get_one::<StreamKind>("STREAM").unwrap(/* impossible */),
    )
}

async fn timeline(stores: &Stores, matches: &ArgMatches) -> Result<()> {
    let (user, kind) = user_and_kind(matches);
    if matches.get_flag("scores") {
        stores
            .catalog
            .get_timeline_with_scores(&user, kind)
            .await
            .context(CatalogSnafu)?
            .into_iter()
            .for_each(|(id, score)| println!("{id}\t{score:.6}"));
    } else {
        stores
            .catalog
            .get_timeline(&user, kind)
            .await
            .context(CatalogSnafu)?
            .into_iter()
            .for_each(|id| println!("{id}"));
    }
    Ok(())
}

async fn unread(stores: &Stores, matches: &ArgMatches) -> Result<()> {
    let (user, kind) = user_and_kind(matches);
    let total = stores
        .catalog
        .get_unread_count(&user, kind)
        .await
        .context(CatalogSnafu)?;
    println!("{total} unread");
    stores
        .catalog
        .get_unread_count_by_type(&user, kind)
        .await
        .context(CatalogSnafu)?
        .into_iter()
        .sorted_by_key(|(status_type, _)| status_type.to_string())
        .for_each(|(status_type, count)| println!("    {status_type}: {count}"));
    Ok(())
}

async fn mark_read(stores: &Stores, matches: &ArgMatches) -> Result<()> {
    let (user, kind) = user_and_kind(matches);
    stores
        .catalog
        .mark_read(&user, kind)
        .await
        .context(CatalogSnafu)
}

async fn suggestions(stores: &Stores, matches: &ArgMatches) -> Result<()> {
    let user = matches.get_one::<UserId>("USER").unwrap(/* impossible */);
    let n = *matches.get_one::<usize>("count").unwrap(/* defaulted */);
    stores
        .suggestions
        .get_suggestions(user, n)
        .await
        .context(SuggestionsSnafu)?
        .into_iter()
        .for_each(|(id, rank)| {
            println!(
                "{id}\t{} mutual(s), {} shared book(s)",
                rank.mutuals, rank.shared_books
            )
        });
    Ok(())
}

async fn erase(stores: &Stores, matches: &ArgMatches) -> Result<()> {
    let kinds = match matches.get_many::<StreamKind>("STREAM") {
        Some(kinds) => kinds.copied().collect::<Vec<_>>(),
        None => stores.catalog.kinds().to_vec(),
    };
    let n = stores.catalog.erase(&kinds).await.context(CatalogSnafu)?;
    println!("Erased {n} keys.");
    Ok(())
}

fn decode_rank(matches: &ArgMatches) {
    let score = *matches.get_one::<f64>("SCORE").unwrap(/* impossible */);
    match SuggestionRank::try_from_score(score) {
        Ok(rank) => println!(
            "{} mutual(s), {} shared book(s)",
            rank.mutuals, rank.shared_books
        ),
        Err(err) => println!("{err}"),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              main                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn user_arg() -> Arg {
    Arg::new("USER")
        .required(true)
        .value_parser(value_parser!(UserId))
        .index(1)
        .help("Numeric ID of the user whose stores are of interest")
}

fn stream_arg() -> Arg {
    Arg::new("STREAM")
        .required(true)
        .value_parser(value_parser!(StreamKind))
        .index(2)
        .help("One of home, local, federated, books or reviews")
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("bookstreams")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Inspect & maintain bookstreams stores")
        .long_about(
            "Inspect & maintain the per-user activity streams & suggested-users lists
bookstreams keeps in Redis.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .default_value(OsStr::new("/etc/bookstreams.toml"))
                .env("BOOKSTREAMS_CONFIG")
                .help("Specify the path to the configuration file"),
        )
        .arg(
            Arg::new("redis")
                .short('r')
                .long("redis")
                .num_args(1)
                .value_parser(value_parser!(String))
                .env("BOOKSTREAMS_REDIS")
                .help("Redis URL (overrides the configuration file)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("produce more prolix output"),
        )
        .subcommand(
            Command::new("timeline")
                .about("List the statuses in a stream, newest first")
                .arg(
                    Arg::new("scores")
                        .short('s')
                        .long("scores")
                        .num_args(0)
                        .action(ArgAction::SetTrue)
                        .help("Print each status' score alongside its ID"),
                )
                .arg(user_arg())
                .arg(stream_arg()),
        )
        .subcommand(
            Command::new("unread")
                .about("Show a stream's unread count, in total & by status type")
                .arg(user_arg())
                .arg(stream_arg()),
        )
        .subcommand(
            Command::new("mark-read")
                .about("Reset a stream's unread counts")
                .arg(user_arg())
                .arg(stream_arg()),
        )
        .subcommand(
            Command::new("suggestions")
                .about("List a user's suggested users, best first")
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .num_args(1)
                        .value_parser(value_parser!(usize))
                        .default_value("5")
                        .help("Number of suggestions to list"),
                )
                .arg(user_arg()),
        )
        .subcommand(
            Command::new("erase")
                .about("Delete streams")
                .long_about(
                    "Delete every user's instance of the named streams (all active streams, if
none are named), along with their unread counts. The streams can be rebuilt by the
service.",
                )
                .arg(
                    Arg::new("STREAM")
                        .num_args(1..)
                        .value_parser(value_parser!(StreamKind))
                        .help("Stream kinds to erase"),
                ),
        )
        .subcommand(
            Command::new("decode-rank")
                .about("Decode a suggested-user score into its mutuals & shared books")
                .arg(
                    Arg::new("SCORE")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64))
                        .index(1),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
        .get_matches();

    let filter = EnvFilter::builder()
        .with_default_directive(if matches.get_flag("verbose") {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env()
        .context(EnvFilterSnafu)?;
    tracing::subscriber::set_global_default(
        Registry::default().with(filter).with(
            fmt::Layer::default()
                .compact()
                .without_time()
                .with_target(false)
                .with_writer(io::stderr),
        ),
    )
    .context(SubscriberSnafu)?;

    let mut cfg = parse_config(
        matches
            .get_one::<PathBuf>("config")
            .unwrap(/* defaulted */),
        matches.value_source("config"),
    )?;
    if let Some(url) = matches.get_one::<String>("redis") {
        cfg.redis.url = url.clone();
    }
    debug!("Configuration: {:?}", cfg);

    match matches.subcommand() {
        Some(("decode-rank", matches)) => {
            decode_rank(matches);
            Ok(())
        }
        Some(("config", _)) => {
            print!(
                "{}",
                toml::to_string(&Configuration::V1(cfg)).context(SerSnafu)?
            );
            Ok(())
        }
        Some((name, sub_matches)) => {
            let stores = Stores::connect(&cfg).await?;
            match name {
                "timeline" => timeline(&stores, sub_matches).await,
                "unread" => unread(&stores, sub_matches).await,
                "mark-read" => mark_read(&stores, sub_matches).await,
                "suggestions" => suggestions(&stores, sub_matches).await,
                "erase" => erase(&stores, sub_matches).await,
                _ => unimplemented!(/* impossible */),
            }
        }
        None => NoSubCommandSnafu.fail(),
    }
}
