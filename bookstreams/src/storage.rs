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

//! # storage
//!
//! Abstractions for the source of truth.
//!
//! Nothing bookstreams writes is authoritative: every stream & every suggestion list can be rebuilt
//! from the surrounding application's database. This module defines what we need to ask of that
//! database; the application supplies an implementation of [Backend].

use std::{collections::HashSet, pin::Pin};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::entities::{Privacy, Status, StatusId, StatusType, User, UserId, WorkId};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// A lazily-evaluated sequence of [Status]es, newest first
pub type StatusStream<'a> = Pin<Box<dyn Stream<Item = Result<Status, Error>> + Send + 'a>>;

/// A predicate over statuses, as seen by a particular viewer
///
/// This is how a stream describes "everything this user should currently see" to the source of
/// truth. Implementations of [Backend::statuses] must honor *all* of the following, in addition to
/// whatever fields are set:
///
/// - deleted statuses, and statuses by inactive authors, are never returned
/// - if `viewer` is set, statuses by anyone blocking, or blocked by, the viewer are never returned
/// - a `Followers` status is only returned if the viewer is its author or follows its author
/// - a `Direct` status is only returned if the viewer is its author or is mentioned in it, and
///   never if it's a plain note
///
/// Results are ordered by publication date, newest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StatusQuery {
    pub viewer: Option<UserId>,
    /// Privacy levels to be returned; empty means "all"
    pub privacy: Vec<Privacy>,
    /// Restrict to statuses authored by the viewer or by someone the viewer follows
    pub following_only: bool,
    /// Restrict to statuses authored by users local to this instance
    pub local_authors_only: bool,
    pub status_types: Option<Vec<StatusType>>,
    /// Restrict to statuses about (or mentioning) any of these works
    pub works: Option<HashSet<WorkId>>,
    pub author: Option<UserId>,
}

impl StatusQuery {
    pub fn for_viewer(viewer: UserId) -> StatusQuery {
        StatusQuery {
            viewer: Some(viewer),
            ..Default::default()
        }
    }
    pub fn with_privacy(mut self, privacy: &[Privacy]) -> StatusQuery {
        self.privacy = privacy.to_vec();
        self
    }
    pub fn by(mut self, author: UserId) -> StatusQuery {
        self.author = Some(author);
        self
    }
    /// Evaluate this predicate against a single status
    ///
    /// The three relationship arguments describe the viewer's relation to the status' author; this
    /// is a convenience for [Backend] implementations that hold their data in memory.
    pub fn matches(
        &self,
        status: &Status,
        author: &User,
        viewer_follows_author: bool,
        blocked: bool,
    ) -> bool {
        if status.deleted || !author.is_active() || blocked {
            return false;
        }
        // Direct messages never appear in streams; direct comments, reviews & so forth do.
        if status.privacy == Privacy::Direct && status.status_type == StatusType::Note {
            return false;
        }
        if !self.privacy.is_empty() && !self.privacy.contains(&status.privacy) {
            return false;
        }
        let is_author = self.viewer == Some(status.author);
        let is_mentioned = self
            .viewer
            .map(|v| status.mentioned_users.contains(&v))
            .unwrap_or(false);
        match status.privacy {
            Privacy::Followers if !(is_author || viewer_follows_author) => return false,
            Privacy::Direct if !(is_author || is_mentioned) => return false,
            _ => (),
        }
        if self.following_only && !(is_author || viewer_follows_author) {
            return false;
        }
        if self.local_authors_only && !author.is_local() {
            return false;
        }
        if let Some(types) = &self.status_types {
            if !types.contains(&status.status_type) {
                return false;
            }
        }
        if let Some(works) = &self.works {
            let about = status.works().any(|w| works.contains(&w));
            if !about {
                return false;
            }
        }
        if let Some(a) = self.author {
            if status.author != a {
                return false;
            }
        }
        true
    }
}

/// Object-safe trait abstracting over the application's database for the queries bookstreams needs
///
/// It may seem appealing to hand back richer objects (or to let callers compose queries), but
/// keeping this to a small, fixed vocabulary lets each application implement it with whatever
/// indices it has lying around.
#[async_trait]
pub trait Backend {
    /// Retrieve a status by ID; None means there is no such status
    async fn status(&self, id: &StatusId) -> Result<Option<Status>, Error>;
    /// Retrieve a user by ID; None means there is no such user
    async fn user(&self, id: &UserId) -> Result<Option<User>, Error>;
    /// All users local to this instance, active or not
    async fn local_users(&self) -> Result<Vec<User>, Error>;
    /// All users (local or remote) who are active & discoverable
    async fn discoverable_users(&self) -> Result<Vec<User>, Error>;
    /// Stream the statuses matching `query`, newest first
    async fn statuses(&self, query: &StatusQuery) -> Result<StatusStream<'_>, Error>;
    /// Boosts of `boosted` created strictly before `before`
    async fn boosts_of(
        &self,
        boosted: &StatusId,
        before: &DateTime<Utc>,
    ) -> Result<Vec<Status>, Error>;
    /// The users following `user`
    async fn followers_of(&self, user: &UserId) -> Result<HashSet<UserId>, Error>;
    /// The users `user` follows
    async fn following_of(&self, user: &UserId) -> Result<HashSet<UserId>, Error>;
    /// True if `follower` follows `followee`
    async fn is_following(&self, follower: &UserId, followee: &UserId) -> Result<bool, Error>;
    /// Users to whom `user` has sent a follow request that is still pending
    async fn follow_requests_from(&self, user: &UserId) -> Result<HashSet<UserId>, Error>;
    /// True if `blocker` blocks `blocked` (one direction only)
    async fn is_blocking(&self, blocker: &UserId, blocked: &UserId) -> Result<bool, Error>;
    /// Everyone `user` blocks together with everyone who blocks `user`
    async fn block_relations(&self, user: &UserId) -> Result<HashSet<UserId>, Error>;
    /// Users having any edition of `work` on any of their shelves
    async fn users_with_work_on_shelf(&self, work: &WorkId) -> Result<HashSet<UserId>, Error>;
    /// The works `user` has on their shelves
    async fn shelved_works(&self, user: &UserId) -> Result<HashSet<WorkId>, Error>;
}
