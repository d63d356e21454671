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

//! # bookstreams models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational. Note that none of them are *owned* by bookstreams: users, statuses & works all
//! live in the surrounding application's database. What we have here is just enough of each to
//! decide who should see what.

use std::{collections::HashSet, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid privacy level"))]
    BadPrivacy { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid status type"))]
    BadStatusType { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid identifier: {source}"))]
    BadId {
        text: String,
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

// All three identifier types are just the surrounding application's integer primary keys; the
// newtypes are there to keep me from handing a status ID to something expecting a user.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> $name {
                $name(id)
            }
            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<u64>()
                    .map($name)
                    .context(BadIdSnafu { text: s.to_string() })
            }
        }
    };
}

define_id!(
    /// Identifies a user, local or remote
    UserId
);
define_id!(
    /// Identifies a status; boosts are statuses, too
    StatusId
);
define_id!(
    /// Identifies a *work* (as opposed to a particular edition of that work)
    WorkId
);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Privacy                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Who may see a status
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Unlisted,
    Followers,
    Direct,
}

impl Display for Privacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Privacy::Public => "public",
                Privacy::Unlisted => "unlisted",
                Privacy::Followers => "followers",
                Privacy::Direct => "direct",
            }
        )
    }
}

impl FromStr for Privacy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Privacy::Public),
            "unlisted" => Ok(Privacy::Unlisted),
            "followers" => Ok(Privacy::Followers),
            "direct" => Ok(Privacy::Direct),
            _ => BadPrivacySnafu {
                text: s.to_string(),
            }
            .fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           StatusType                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sort of thing a status is
///
/// A plain [Note](StatusType::Note) is what most of the Fediverse would call a "post"; everything
/// else is either about a book or app-generated.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum StatusType {
    Note,
    GeneratedNote,
    Comment,
    Quotation,
    Review,
    Rating,
    Boost,
}

impl StatusType {
    /// True if this status carries a rating, a review or a comment on a book
    pub fn is_review_like(&self) -> bool {
        matches!(
            self,
            StatusType::Review | StatusType::Rating | StatusType::Comment
        )
    }
}

impl Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                StatusType::Note => "Note",
                StatusType::GeneratedNote => "GeneratedNote",
                StatusType::Comment => "Comment",
                StatusType::Quotation => "Quotation",
                StatusType::Review => "Review",
                StatusType::Rating => "Rating",
                StatusType::Boost => "Boost",
            }
        )
    }
}

impl FromStr for StatusType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Note" => Ok(StatusType::Note),
            "GeneratedNote" => Ok(StatusType::GeneratedNote),
            "Comment" => Ok(StatusType::Comment),
            "Quotation" => Ok(StatusType::Quotation),
            "Review" => Ok(StatusType::Review),
            "Rating" => Ok(StatusType::Rating),
            "Boost" => Ok(StatusType::Boost),
            _ => BadStatusTypeSnafu {
                text: s.to_string(),
            }
            .fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              User                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The parts of a user salient to fan-out
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    id: UserId,
    /// True if this user has an account on this instance (i.e. we maintain streams for them)
    local: bool,
    active: bool,
    /// True if this user is willing to be suggested to others
    discoverable: bool,
}

impl User {
    pub fn new(id: UserId, local: bool, active: bool, discoverable: bool) -> User {
        User {
            id,
            local,
            active,
            discoverable,
        }
    }
    pub fn id(&self) -> UserId {
        self.id
    }
    pub fn is_local(&self) -> bool {
        self.local
    }
    pub fn is_active(&self) -> bool {
        self.active
    }
    pub fn is_discoverable(&self) -> bool {
        self.discoverable
    }
    pub fn set_discoverable(&mut self, discoverable: bool) {
        self.discoverable = discoverable;
    }
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Status                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A status, as far as the streams are concerned
///
/// A boost is represented as a [Status] of type [StatusType::Boost] whose `boosted` field names the
/// status being re-surfaced; its author is the booster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Status {
    pub id: StatusId,
    pub author: UserId,
    pub privacy: Privacy,
    pub status_type: StatusType,
    pub published: DateTime<Utc>,
    /// When this status was written to *our* database; for remote statuses, this may be well after
    /// `published`
    pub created: DateTime<Utc>,
    pub mentioned_users: HashSet<UserId>,
    /// The work a comment, quotation or review is about
    pub book: Option<WorkId>,
    pub mentioned_works: Vec<WorkId>,
    pub boosted: Option<StatusId>,
    /// Tombstone flag; deleted statuses are retained, but must never appear in a stream
    pub deleted: bool,
}

impl Status {
    /// Convenience constructor for a plain status published "now"
    pub fn new(id: StatusId, author: UserId, privacy: Privacy, status_type: StatusType) -> Status {
        let now = Utc::now();
        Status {
            id,
            author,
            privacy,
            status_type,
            published: now,
            created: now,
            mentioned_users: HashSet::new(),
            book: None,
            mentioned_works: Vec::new(),
            boosted: None,
            deleted: false,
        }
    }
    pub fn published_at(mut self, published: DateTime<Utc>) -> Status {
        self.published = published;
        self.created = published;
        self
    }
    pub fn mentioning(mut self, users: impl IntoIterator<Item = UserId>) -> Status {
        self.mentioned_users.extend(users);
        self
    }
    pub fn about(mut self, work: WorkId) -> Status {
        self.book = Some(work);
        self
    }
    pub fn mentioning_works(mut self, works: impl IntoIterator<Item = WorkId>) -> Status {
        self.mentioned_works.extend(works);
        self
    }
    pub fn boosting(mut self, boosted: StatusId) -> Status {
        self.boosted = Some(boosted);
        self
    }
    /// Every work this status is about or mentions, its book first
    pub fn works(&self) -> impl Iterator<Item = WorkId> + '_ {
        self.book.iter().chain(self.mentioned_works.iter()).copied()
    }
    pub fn is_boost(&self) -> bool {
        matches!(self.status_type, StatusType::Boost)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn privacy_round_trips_through_text() {
        for p in [
            Privacy::Public,
            Privacy::Unlisted,
            Privacy::Followers,
            Privacy::Direct,
        ] {
            assert_eq!(p.to_string().parse::<Privacy>().unwrap(), p);
        }
        assert!("friends".parse::<Privacy>().is_err());
    }

    #[test]
    fn ids() {
        let id = "42".parse::<UserId>().unwrap();
        assert_eq!(id, UserId::new(42));
        assert_eq!(format!("{id}"), "42");
        assert!("forty-two".parse::<StatusId>().is_err());
    }

    #[test]
    fn works_and_types() {
        let mut s = Status::new(
            StatusId::new(1),
            UserId::new(1),
            Privacy::Public,
            StatusType::Comment,
        );
        assert_eq!(s.works().next(), None);
        s.mentioned_works = vec![WorkId::new(7), WorkId::new(8)];
        let s = s.about(WorkId::new(3));
        assert_eq!(
            s.works().collect::<Vec<WorkId>>(),
            vec![WorkId::new(3), WorkId::new(7), WorkId::new(8)]
        );
        assert!(StatusType::Rating.is_review_like());
        assert!(!StatusType::Quotation.is_review_like());
    }
}
