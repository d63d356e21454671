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

//! # streams
//!
//! Per-stream policy.
//!
//! Every local user gets one instance of each kind of stream: their home timeline (themselves &
//! the people they follow), the local & federated timelines (public statuses from this instance,
//! and from everywhere, respectively), a books stream (public statuses about works they've
//! shelved) & a reviews stream (reviews, ratings & comments).
//!
//! The kinds differ in exactly two respects: who should see a given status (its [audience]), and
//! what a given user should see when their stream is built from scratch (the [query] handed to the
//! source of truth). Both are answered here by matching on [StreamKind]; everything else (keys,
//! ranking, trimming) is shared.
//!
//! [audience]: StreamKind::audience
//! [query]: StreamKind::query_for_user

use std::{collections::HashSet, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};

use crate::{
    entities::{Privacy, Status, StatusType, UserId},
    storage::{self, StatusQuery, StatusStream},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a stream kind"))]
    BadStreamKind { text: String, backtrace: Backtrace },
    #[snafu(display("While computing the {kind} audience: {source}"))]
    Audience {
        kind: StreamKind,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While building the {kind} stream for {user}: {source}"))]
    Query {
        kind: StreamKind,
        user: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Privacy levels that may appear in a stream at all (plain direct notes are filtered out by the
/// query itself)
const STREAMABLE: [Privacy; 4] = [
    Privacy::Public,
    Privacy::Unlisted,
    Privacy::Followers,
    Privacy::Direct,
];

/// The closed set of stream kinds
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Home,
    Local,
    Federated,
    Books,
    Reviews,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StreamKind::all()
            .into_iter()
            .find(|kind| kind.key() == s)
            .context(BadStreamKindSnafu {
                text: s.to_string(),
            })
    }
}

/// Publication time as fractional seconds since the Unix epoch
pub fn rank(status: &Status) -> f64 {
    status.published.timestamp_micros() as f64 / 1_000_000.0
}

impl StreamKind {
    pub fn all() -> [StreamKind; 5] {
        [
            StreamKind::Home,
            StreamKind::Local,
            StreamKind::Federated,
            StreamKind::Books,
            StreamKind::Reviews,
        ]
    }
    /// The name of this stream, as it appears in store keys
    pub fn key(&self) -> &'static str {
        match self {
            StreamKind::Home => "home",
            StreamKind::Local => "local",
            StreamKind::Federated => "federated",
            StreamKind::Books => "books",
            StreamKind::Reviews => "reviews",
        }
    }
    /// The store key for `user`'s instance of this stream, e.g. "42-home"
    pub fn stream_id(&self, user: &UserId) -> String {
        format!("{}-{}", user, self.key())
    }
    pub fn unread_id(&self, user: &UserId) -> String {
        format!("{}-unread", self.stream_id(user))
    }
    pub fn unread_by_type_id(&self, user: &UserId) -> String {
        format!("{}-unread-by-type", self.stream_id(user))
    }
    /// Compute the set of users whose instance of this stream should contain `status`
    ///
    /// Only local, active users are ever returned. Anyone blocking or blocked by the author is
    /// excluded regardless of any other consideration.
    pub async fn audience(
        &self,
        storage: &(dyn storage::Backend + Send + Sync),
        status: &Status,
    ) -> Result<HashSet<UserId>> {
        // Cheap checks first
        let precondition = match self {
            StreamKind::Local | StreamKind::Federated => status.privacy == Privacy::Public,
            StreamKind::Books => {
                status.privacy == Privacy::Public && status.works().next().is_some()
            }
            StreamKind::Reviews => status.status_type.is_review_like(),
            StreamKind::Home => true,
        };
        if !precondition {
            return Ok(HashSet::new());
        }

        let Some(author) = storage
            .user(&status.author)
            .await
            .context(AudienceSnafu { kind: *self })?
        else {
            warn!(
                "Status {} names author {}, who doesn't exist; it will be seen by no one",
                status.id, status.author
            );
            return Ok(HashSet::new());
        };
        if !author.is_active() {
            debug!("{} is inactive; status {} goes nowhere", author.id(), status.id);
            return Ok(HashSet::new());
        }

        if matches!(self, StreamKind::Local) && !author.is_local() {
            return Ok(HashSet::new());
        }

        let mut audience = self.base_audience(storage, status).await?;

        match self {
            StreamKind::Home => {
                if !audience.is_empty() {
                    let mut followers = storage
                        .followers_of(&status.author)
                        .await
                        .context(AudienceSnafu { kind: *self })?;
                    followers.insert(status.author);
                    audience.retain(|u| followers.contains(u));
                }
            }
            StreamKind::Books => {
                // Anyone with *any* of the works this status refers to on their shelves
                let mut shelvers = HashSet::new();
                if !audience.is_empty() {
                    for work in status.works() {
                        shelvers.extend(
                            storage
                                .users_with_work_on_shelf(&work)
                                .await
                                .context(AudienceSnafu { kind: *self })?,
                        );
                    }
                }
                audience.retain(|u| shelvers.contains(u));
            }
            StreamKind::Local | StreamKind::Federated | StreamKind::Reviews => (),
        }

        Ok(audience)
    }
    /// The rule every stream starts from
    async fn base_audience(
        &self,
        storage: &(dyn storage::Backend + Send + Sync),
        status: &Status,
    ) -> Result<HashSet<UserId>> {
        // Direct messages never appear in streams; direct comments, reviews & so forth do.
        if status.privacy == Privacy::Direct && status.status_type == StatusType::Note {
            return Ok(HashSet::new());
        }

        let blocked = storage
            .block_relations(&status.author)
            .await
            .context(AudienceSnafu { kind: *self })?;
        let mut audience = storage
            .local_users()
            .await
            .context(AudienceSnafu { kind: *self })?
            .into_iter()
            .filter(|u| u.is_active() && !blocked.contains(&u.id()))
            .map(|u| u.id())
            .collect::<HashSet<UserId>>();

        match status.privacy {
            Privacy::Direct => {
                audience.retain(|u| *u == status.author || status.mentioned_users.contains(u));
            }
            Privacy::Followers => {
                let followers = storage
                    .followers_of(&status.author)
                    .await
                    .context(AudienceSnafu { kind: *self })?;
                audience.retain(|u| *u == status.author || followers.contains(u));
            }
            Privacy::Public | Privacy::Unlisted => (),
        }

        Ok(audience)
    }
    /// Describe everything `user` should currently see in this stream
    pub async fn query_for_user(
        &self,
        storage: &(dyn storage::Backend + Send + Sync),
        user: &UserId,
    ) -> Result<StatusQuery> {
        let base = StatusQuery::for_viewer(*user).with_privacy(&STREAMABLE);
        Ok(match self {
            StreamKind::Home => StatusQuery {
                following_only: true,
                ..base
            },
            StreamKind::Local => StatusQuery {
                local_authors_only: true,
                ..base.with_privacy(&[Privacy::Public])
            },
            StreamKind::Federated => base.with_privacy(&[Privacy::Public]),
            StreamKind::Books => {
                let works = storage
                    .shelved_works(user)
                    .await
                    .context(QuerySnafu {
                        kind: *self,
                        user: *user,
                    })?;
                StatusQuery {
                    works: Some(works),
                    ..base.with_privacy(&[Privacy::Public])
                }
            }
            StreamKind::Reviews => StatusQuery {
                status_types: Some(vec![
                    StatusType::Review,
                    StatusType::Rating,
                    StatusType::Comment,
                ]),
                ..base
            },
        })
    }
    /// Stream everything `user` should currently see in this stream, newest first
    pub async fn items_for_user<'a>(
        &self,
        storage: &'a (dyn storage::Backend + Send + Sync),
        user: &UserId,
    ) -> Result<StatusStream<'a>> {
        let query = self.query_for_user(storage, user).await?;
        storage.statuses(&query).await.context(QuerySnafu {
            kind: *self,
            user: *user,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{TimeZone, Utc};

    use crate::{
        entities::{StatusId, User, WorkId},
        memory::InMemory,
    };

    const A: UserId = UserId::new(1);
    const B: UserId = UserId::new(2);
    const C: UserId = UserId::new(3);
    const D: UserId = UserId::new(4);
    const R: UserId = UserId::new(5);

    /// A, B, C & D are local; R is remote. B & C follow A, R follows A.
    fn fixture() -> InMemory {
        let db = InMemory::new();
        for u in [A, B, C, D] {
            db.add_user(User::new(u, true, true, true));
        }
        db.add_user(User::new(R, false, true, true));
        db.follow(&B, &A);
        db.follow(&C, &A);
        db.follow(&R, &A);
        db
    }

    fn set(users: &[UserId]) -> HashSet<UserId> {
        users.iter().copied().collect()
    }

    #[test]
    fn keys() {
        assert_eq!(StreamKind::Home.stream_id(&UserId::new(42)), "42-home");
        assert_eq!(
            StreamKind::Books.unread_id(&UserId::new(42)),
            "42-books-unread"
        );
        assert_eq!(
            "federated".parse::<StreamKind>().unwrap(),
            StreamKind::Federated
        );
        assert!("suggestions".parse::<StreamKind>().is_err());
    }

    #[test]
    fn rank_is_publication_time() {
        let s = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Note)
            .published_at(Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap());
        assert_eq!(rank(&s), 1_700_000_000.5);
    }

    #[tokio::test]
    async fn followers_only_home_audience() {
        let db = fixture();
        let s = Status::new(StatusId::new(1), A, Privacy::Followers, StatusType::Note);
        assert_eq!(
            StreamKind::Home.audience(&db, &s).await.unwrap(),
            set(&[A, B, C])
        );
        // Local & federated only take public statuses
        assert!(StreamKind::Local.audience(&db, &s).await.unwrap().is_empty());
        assert!(StreamKind::Federated
            .audience(&db, &s)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn public_statuses() {
        let db = fixture();
        let s = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Note);
        // D doesn't follow A, so it's not in their home stream
        assert_eq!(
            StreamKind::Home.audience(&db, &s).await.unwrap(),
            set(&[A, B, C])
        );
        assert_eq!(
            StreamKind::Local.audience(&db, &s).await.unwrap(),
            set(&[A, B, C, D])
        );
        // Remote authors never appear locally
        let r = Status::new(StatusId::new(2), R, Privacy::Public, StatusType::Note);
        assert!(StreamKind::Local.audience(&db, &r).await.unwrap().is_empty());
        assert_eq!(
            StreamKind::Federated.audience(&db, &r).await.unwrap(),
            set(&[A, B, C, D])
        );
        // Reviews only take reviews, ratings & comments
        assert!(StreamKind::Reviews
            .audience(&db, &s)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn direct_messages() {
        let db = fixture();
        let dm =
            Status::new(StatusId::new(1), A, Privacy::Direct, StatusType::Note).mentioning([B, D]);
        for kind in StreamKind::all() {
            assert!(kind.audience(&db, &dm).await.unwrap().is_empty());
        }
        let review =
            Status::new(StatusId::new(2), A, Privacy::Direct, StatusType::Review).mentioning([B, D]);
        assert_eq!(
            StreamKind::Reviews.audience(&db, &review).await.unwrap(),
            set(&[A, B, D])
        );
        // ...but home is still restricted to followers
        assert_eq!(
            StreamKind::Home.audience(&db, &review).await.unwrap(),
            set(&[A, B])
        );
    }

    #[tokio::test]
    async fn blocks_are_absolute() {
        let db = fixture();
        db.block(&C, &A);
        let s = Status::new(StatusId::new(1), A, Privacy::Direct, StatusType::Comment)
            .mentioning([C]);
        for kind in StreamKind::all() {
            assert!(!kind.audience(&db, &s).await.unwrap().contains(&C));
        }
    }

    #[tokio::test]
    async fn books() {
        let db = fixture();
        let work = WorkId::new(100);
        db.shelve(&B, &work);
        db.shelve(&D, &work);
        let s = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Review).about(work);
        assert_eq!(
            StreamKind::Books.audience(&db, &s).await.unwrap(),
            set(&[B, D])
        );
        let s = Status::new(StatusId::new(2), A, Privacy::Public, StatusType::Note);
        assert!(StreamKind::Books.audience(&db, &s).await.unwrap().is_empty());

        let query = StreamKind::Books.query_for_user(&db, &B).await.unwrap();
        assert_eq!(query.works, Some(HashSet::from([work])));
        assert_eq!(query.privacy, vec![Privacy::Public]);
    }

    #[tokio::test]
    async fn books_take_every_work_mentioned() {
        let db = fixture();
        let (w7, w8) = (WorkId::new(7), WorkId::new(8));
        db.shelve(&B, &w8);
        db.shelve(&C, &w7);
        let s = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Comment)
            .mentioning_works([w7, w8]);
        assert_eq!(
            StreamKind::Books.audience(&db, &s).await.unwrap(),
            set(&[B, C])
        );
    }

    #[tokio::test]
    async fn inactive_authors_see_nobody() {
        let db = fixture();
        let e = UserId::new(6);
        db.add_user(User::new(e, true, false, true));
        let s = Status::new(StatusId::new(1), e, Privacy::Public, StatusType::Review);
        for kind in StreamKind::all() {
            assert!(kind.audience(&db, &s).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn missing_authors_see_nobody() {
        let db = fixture();
        let s = Status::new(
            StatusId::new(1),
            UserId::new(99),
            Privacy::Public,
            StatusType::Note,
        );
        assert!(StreamKind::Federated
            .audience(&db, &s)
            .await
            .unwrap()
            .is_empty());
    }
}
