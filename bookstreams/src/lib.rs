// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
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
//! Per-user activity streams & "suggested users" lists for a federated book-cataloguing service,
//! maintained by fan-out-on-write over a sorted-set key-value store.
//!
//! The pieces, bottom-up:
//!
//! - [entities] & [storage]: the domain model, and the read-only source of truth it lives in
//! - [kv], [redis_store] & [memory]: the key-value store & its backends
//! - [ranked]: bounded, score-ordered ID lists on top of [kv]
//! - [streams] & [catalog]: per-kind audience & query rules, and the event handlers applying them
//! - [suggested]: the suggested-users cache
//! - [background_tasks] & [fanout]: asynchronous, sequenced event processing
//!
//! Like the binary, the library crate is named `bookstreams`, so `rustdoc` documents only this.
#[path = "background-tasks.rs"]
pub mod background_tasks;
pub mod catalog;
pub mod entities;
pub mod fanout;
pub mod kv;
pub mod memory;
pub mod metrics;
pub mod ranked;
#[path = "redis-store.rs"]
pub mod redis_store;
pub mod storage;
pub mod streams;
pub mod suggested;
