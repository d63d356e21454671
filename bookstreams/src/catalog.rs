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

//! # catalog
//!
//! The [StreamCatalog] is the registry of active [StreamKind]s together with the operations that
//! apply some change in the world to every one of them.
//!
//! Adds are scoped to the audience of the status being added, as computed *now*. Removals on
//! deletion are not: by the time a status is deleted its audience may well have changed (someone
//! unfollowed, say), so we remove it from every local user's instance of every active stream.
//!
//! Nothing here is authoritative; any stream can be rebuilt from the source of truth via
//! [StreamCatalog::populate_store].

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::Arc,
};

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info, warn};

use crate::{
    entities::{Privacy, Status, StatusId, StatusType, UserId, WorkId},
    kv::{self, Pipeline},
    ranked::RankedStore,
    storage::{self, StatusQuery},
    streams::{self, rank, StreamKind},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to update the streams: {source}"))]
    Store {
        #[snafu(backtrace)]
        source: kv::Error,
    },
    #[snafu(display("{source}"))]
    Stream {
        #[snafu(backtrace)]
        source: streams::Error,
    },
    #[snafu(display("While querying the source of truth: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The {kind} stream is not active"))]
    Inactive {
        kind: StreamKind,
        backtrace: Backtrace,
    },
}

impl Error {
    /// True if this error was caused by the key-value store being unreachable (in which case a
    /// retry may well succeed)
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Store {
                source: kv::Error::StoreUnavailable { .. }
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Config                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn default_max_stream_length() -> NonZeroUsize {
    // Known good
    NonZeroUsize::new(200).unwrap()
}

fn default_active_streams() -> Vec<StreamKind> {
    StreamKind::all().to_vec()
}

fn default_suggestions_max_length() -> NonZeroUsize {
    // Known good
    NonZeroUsize::new(10).unwrap()
}

/// Stream configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// The maximum number of statuses retained in any one user's instance of any stream
    #[serde(rename = "max-stream-length", default = "default_max_stream_length")]
    pub max_stream_length: NonZeroUsize,
    #[serde(rename = "active-streams", default = "default_active_streams")]
    pub active_streams: Vec<StreamKind>,
    /// The maximum number of suggested users retained for any one viewer
    #[serde(
        rename = "suggestions-max-length",
        default = "default_suggestions_max_length"
    )]
    pub suggestions_max_length: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_stream_length: default_max_stream_length(),
            active_streams: default_active_streams(),
            suggestions_max_length: default_suggestions_max_length(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         StreamCatalog                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The registry of active stream kinds, and uniform dispatch over them
///
/// Built once at startup & shared by reference thereafter.
pub struct StreamCatalog {
    kinds: Vec<StreamKind>,
    store: RankedStore,
    storage: Arc<dyn storage::Backend + Send + Sync>,
}

impl std::fmt::Debug for StreamCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCatalog")
            .field("kinds", &self.kinds)
            .field("store", &self.store)
            .finish()
    }
}

impl StreamCatalog {
    pub fn new(
        kinds: impl IntoIterator<Item = StreamKind>,
        kv: Arc<dyn kv::Backend + Send + Sync>,
        storage: Arc<dyn storage::Backend + Send + Sync>,
        max_length: NonZeroUsize,
    ) -> StreamCatalog {
        let mut kinds = kinds.into_iter().collect::<Vec<StreamKind>>();
        kinds.sort();
        kinds.dedup();
        StreamCatalog {
            kinds,
            store: RankedStore::new(kv, Some(max_length)),
            storage,
        }
    }
    pub fn from_config(
        config: &Config,
        kv: Arc<dyn kv::Backend + Send + Sync>,
        storage: Arc<dyn storage::Backend + Send + Sync>,
    ) -> StreamCatalog {
        StreamCatalog::new(
            config.active_streams.iter().copied(),
            kv,
            storage,
            config.max_stream_length,
        )
    }
    pub fn kinds(&self) -> &[StreamKind] {
        &self.kinds
    }
    pub fn is_active(&self, kind: StreamKind) -> bool {
        self.kinds.contains(&kind)
    }
    pub fn store(&self) -> &RankedStore {
        &self.store
    }
    pub fn storage(&self) -> &(dyn storage::Backend + Send + Sync) {
        self.storage.as_ref()
    }
    fn check_active(&self, kind: StreamKind) -> Result<()> {
        ensure!(self.is_active(kind), InactiveSnafu { kind });
        Ok(())
    }
    async fn local_user_ids(&self) -> Result<Vec<UserId>> {
        Ok(self
            .storage
            .local_users()
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|u| u.id())
            .collect())
    }
    async fn is_local(&self, user: &UserId) -> Result<bool> {
        Ok(self
            .storage
            .user(user)
            .await
            .context(StorageSnafu)?
            .map(|u| u.is_local())
            .unwrap_or(false))
    }
    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        self.store.execute(pipeline).await.context(StoreSnafu)
    }
    /// Fan `status` out to every audience member of every active stream, bumping their unread
    /// counts
    ///
    /// Returns the number of stores written.
    pub async fn on_status_created(&self, status: &Status) -> Result<usize> {
        let mut pipeline = Pipeline::new();
        let mut writes = 0;
        for kind in &self.kinds {
            let audience = kind
                .audience(self.storage(), status)
                .await
                .context(StreamSnafu)?;
            debug!(
                "Status {} goes to {} {} streams",
                status.id,
                audience.len(),
                kind
            );
            self.store.add_to(
                &mut pipeline,
                audience.iter().map(|u| kind.stream_id(u)),
                status.id.get(),
                rank(status),
            );
            audience.iter().for_each(|u| {
                self.store
                    .increment_counter_to(&mut pipeline, &kind.unread_id(u));
                pipeline.hincrby(
                    &kind.unread_by_type_id(u),
                    &status.status_type.to_string(),
                    1,
                );
            });
            writes += audience.len();
        }
        self.execute(pipeline).await?;
        Ok(writes)
    }
    /// Remove `status` from every local user's instance of every active stream
    pub async fn on_status_deleted(&self, status: &StatusId) -> Result<usize> {
        let users = self.local_user_ids().await?;
        let mut pipeline = Pipeline::new();
        for kind in &self.kinds {
            self.store.remove_from(
                &mut pipeline,
                users.iter().map(|u| kind.stream_id(u)),
                status.get(),
            );
        }
        self.execute(pipeline).await?;
        Ok(users.len() * self.kinds.len())
    }
    /// Surface `boost` in its audience's streams, in place of the status it boosts
    ///
    /// For each stream, the original & any earlier boosts of it are removed from the boost's
    /// audience *before* the boost is added, all in one pipeline. Boosts don't count as unread.
    pub async fn on_boost_created(&self, boost: &Status) -> Result<usize> {
        let Some(boosted) = boost.boosted else {
            warn!("Status {} is not a boost; ignoring", boost.id);
            return Ok(0);
        };
        let earlier = self
            .storage
            .boosts_of(&boosted, &boost.created)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|s| s.id != boost.id)
            .map(|s| s.id.get())
            .collect::<Vec<u64>>();

        let mut pipeline = Pipeline::new();
        let mut writes = 0;
        for kind in &self.kinds {
            let keys = kind
                .audience(self.storage(), boost)
                .await
                .context(StreamSnafu)?
                .iter()
                .map(|u| kind.stream_id(u))
                .collect::<Vec<String>>();
            self.store
                .remove_from(&mut pipeline, keys.iter(), boosted.get());
            earlier.iter().for_each(|id| {
                self.store.remove_from(&mut pipeline, keys.iter(), *id);
            });
            self.store
                .add_to(&mut pipeline, keys.iter(), boost.id.get(), rank(boost));
            writes += keys.len();
        }
        self.execute(pipeline).await?;
        Ok(writes)
    }
    /// Remove `boost` everywhere, & put the status it boosted back where it belongs (without
    /// touching unread counts)
    pub async fn on_boost_deleted(&self, boost: &StatusId, boosted: &StatusId) -> Result<usize> {
        let users = self.local_user_ids().await?;
        let original = self
            .storage
            .status(boosted)
            .await
            .context(StorageSnafu)?
            .filter(|s| !s.deleted);
        let mut pipeline = Pipeline::new();
        let mut writes = 0;
        for kind in &self.kinds {
            self.store.remove_from(
                &mut pipeline,
                users.iter().map(|u| kind.stream_id(u)),
                boost.get(),
            );
            if let Some(original) = &original {
                let audience = kind
                    .audience(self.storage(), original)
                    .await
                    .context(StreamSnafu)?;
                self.store.add_to(
                    &mut pipeline,
                    audience.iter().map(|u| kind.stream_id(u)),
                    original.id.get(),
                    rank(original),
                );
                writes += audience.len();
            }
        }
        self.execute(pipeline).await?;
        Ok(writes)
    }
    /// Add to `viewer`'s instance of `kind` the statuses matching `query`
    async fn bulk_add_query(
        &self,
        pipeline: &mut Pipeline,
        kind: StreamKind,
        viewer: &UserId,
        query: &StatusQuery,
    ) -> Result<usize> {
        let limit = self
            .store
            .max_length()
            .map(NonZeroUsize::get)
            .unwrap_or(usize::MAX);
        let items = self
            .storage
            .statuses(query)
            .await
            .context(StorageSnafu)?
            .take(limit)
            .map_ok(|s| (s.id.get(), rank(&s)))
            .try_collect::<Vec<(u64, f64)>>()
            .await
            .context(StorageSnafu)?;
        Ok(self
            .store
            .bulk_add_to(pipeline, &kind.stream_id(viewer), items))
    }
    /// Remove from `viewer`'s instances of `kinds` everything authored by `author`
    ///
    /// We work from what's actually in each store rather than from what the source of truth says
    /// `viewer` can see, since the latter has, by definition, just changed.
    async fn remove_authored_by(
        &self,
        pipeline: &mut Pipeline,
        kinds: &[StreamKind],
        viewer: &UserId,
        author: &UserId,
    ) -> Result<usize> {
        let mut authors: HashMap<u64, Option<UserId>> = HashMap::new();
        let mut removed = 0;
        for kind in kinds {
            let key = kind.stream_id(viewer);
            let members = self.store.read(&key).await.context(StoreSnafu)?;
            let mut doomed = Vec::new();
            for member in members {
                let by = match authors.get(&member) {
                    Some(by) => *by,
                    None => {
                        let by = self
                            .storage
                            .status(&StatusId::new(member))
                            .await
                            .context(StorageSnafu)?
                            .map(|s| s.author);
                        authors.insert(member, by);
                        by
                    }
                };
                if by == Some(*author) {
                    doomed.push(member);
                }
            }
            removed += doomed.len();
            self.store.bulk_remove_to(pipeline, &key, doomed);
        }
        Ok(removed)
    }
    /// `follower` has just followed `followee`: backfill `follower`'s home stream
    pub async fn on_user_followed(&self, follower: &UserId, followee: &UserId) -> Result<usize> {
        if !self.is_active(StreamKind::Home) || !self.is_local(follower).await? {
            return Ok(0);
        }
        let query = StreamKind::Home
            .query_for_user(self.storage(), follower)
            .await
            .context(StreamSnafu)?
            .by(*followee);
        let mut pipeline = Pipeline::new();
        let n = self
            .bulk_add_query(&mut pipeline, StreamKind::Home, follower, &query)
            .await?;
        self.execute(pipeline).await?;
        Ok(n)
    }
    /// `follower` has just unfollowed `followee`: remove `followee`'s statuses from `follower`'s
    /// home stream
    pub async fn on_user_unfollowed(&self, follower: &UserId, followee: &UserId) -> Result<usize> {
        if !self.is_active(StreamKind::Home) || !self.is_local(follower).await? {
            return Ok(0);
        }
        let mut pipeline = Pipeline::new();
        let n = self
            .remove_authored_by(&mut pipeline, &[StreamKind::Home], follower, followee)
            .await?;
        self.execute(pipeline).await?;
        Ok(n)
    }
    /// `blocker` has just blocked `blocked`: scrub each party's statuses from the other's streams
    pub async fn on_user_blocked(&self, blocker: &UserId, blocked: &UserId) -> Result<usize> {
        let mut pipeline = Pipeline::new();
        let mut n = 0;
        for (viewer, author) in [(blocker, blocked), (blocked, blocker)] {
            if self.is_local(viewer).await? {
                n += self
                    .remove_authored_by(&mut pipeline, &self.kinds, viewer, author)
                    .await?;
            }
        }
        self.execute(pipeline).await?;
        Ok(n)
    }
    /// `blocker` has just unblocked `blocked`: restore each party's public statuses to the other's
    /// local & federated streams
    ///
    /// Home streams are left alone (blocking severed any follows, so there's nothing to restore
    /// until someone follows again). If a block remains in the other direction, this is a no-op.
    pub async fn on_user_unblocked(&self, blocker: &UserId, blocked: &UserId) -> Result<usize> {
        let still_blocked = self
            .storage
            .is_blocking(blocker, blocked)
            .await
            .context(StorageSnafu)?
            || self
                .storage
                .is_blocking(blocked, blocker)
                .await
                .context(StorageSnafu)?;
        if still_blocked {
            info!(
                "{} & {} are still blocked; not restoring any statuses",
                blocker, blocked
            );
            return Ok(0);
        }
        let mut pipeline = Pipeline::new();
        let mut n = 0;
        for (viewer, author) in [(blocker, blocked), (blocked, blocker)] {
            if !self.is_local(viewer).await? {
                continue;
            }
            for kind in [StreamKind::Local, StreamKind::Federated] {
                if !self.is_active(kind) {
                    continue;
                }
                let query = kind
                    .query_for_user(self.storage(), viewer)
                    .await
                    .context(StreamSnafu)?
                    .by(*author);
                n += self
                    .bulk_add_query(&mut pipeline, kind, viewer, &query)
                    .await?;
            }
        }
        self.execute(pipeline).await?;
        Ok(n)
    }
    /// `user` has shelved `work`: add public statuses about it to their books stream
    pub async fn on_book_shelved(&self, user: &UserId, work: &WorkId) -> Result<usize> {
        if !self.is_active(StreamKind::Books) || !self.is_local(user).await? {
            return Ok(0);
        }
        let query = StatusQuery {
            works: Some(HashSet::from([*work])),
            ..StatusQuery::for_viewer(*user).with_privacy(&[Privacy::Public])
        };
        let mut pipeline = Pipeline::new();
        let n = self
            .bulk_add_query(&mut pipeline, StreamKind::Books, user, &query)
            .await?;
        self.execute(pipeline).await?;
        Ok(n)
    }
    /// `user` has taken `work` off their shelves: remove public statuses about it from their books
    /// stream, unless they also refer to some other work still on `user`'s shelves
    pub async fn on_book_unshelved(&self, user: &UserId, work: &WorkId) -> Result<usize> {
        if !self.is_active(StreamKind::Books) || !self.is_local(user).await? {
            return Ok(0);
        }
        let shelved = self
            .storage
            .shelved_works(user)
            .await
            .context(StorageSnafu)?;
        let query = StatusQuery {
            works: Some(HashSet::from([*work])),
            ..StatusQuery::for_viewer(*user).with_privacy(&[Privacy::Public])
        };
        let doomed = self
            .storage
            .statuses(&query)
            .await
            .context(StorageSnafu)?
            .try_filter(|s| futures::future::ready(!s.works().any(|w| shelved.contains(&w))))
            .map_ok(|s| s.id.get())
            .try_collect::<Vec<u64>>()
            .await
            .context(StorageSnafu)?;
        let n = doomed.len();
        self.store
            .bulk_remove(&StreamKind::Books.stream_id(user), doomed)
            .await
            .context(StoreSnafu)?;
        Ok(n)
    }
    /// Build every active stream for a new user from scratch
    pub async fn on_account_created(&self, user: &UserId) -> Result<usize> {
        if !self.is_local(user).await? {
            debug!("{} is not local; no streams to build", user);
            return Ok(0);
        }
        let mut n = 0;
        for kind in &self.kinds {
            n += self.populate_store(*kind, user).await?;
        }
        Ok(n)
    }
    /// Replace `user`'s instance of `kind` with what the source of truth says it should hold
    ///
    /// Unread counts are not touched.
    pub async fn populate_store(&self, kind: StreamKind, user: &UserId) -> Result<usize> {
        self.check_active(kind)?;
        let query = kind
            .query_for_user(self.storage(), user)
            .await
            .context(StreamSnafu)?;
        let mut pipeline = Pipeline::new();
        pipeline.del(&kind.stream_id(user));
        let n = self
            .bulk_add_query(&mut pipeline, kind, user, &query)
            .await?;
        self.execute(pipeline).await?;
        Ok(n)
    }
    /// Rebuild `kind` for every active local user
    pub async fn populate_all(&self, kind: StreamKind) -> Result<usize> {
        self.check_active(kind)?;
        let users = self
            .storage
            .local_users()
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|u| u.is_active())
            .collect::<Vec<_>>();
        let mut n = 0;
        for user in &users {
            n += self.populate_store(kind, &user.id()).await?;
        }
        info!("Populated {} {} streams with {} statuses", users.len(), kind, n);
        Ok(n)
    }
    /// The IDs in `user`'s instance of `kind`, newest first
    ///
    /// Reading a timeline does *not* mark it read; see [mark_read](StreamCatalog::mark_read).
    pub async fn get_timeline(&self, user: &UserId, kind: StreamKind) -> Result<Vec<StatusId>> {
        self.check_active(kind)?;
        Ok(self
            .store
            .read(&kind.stream_id(user))
            .await
            .context(StoreSnafu)?
            .into_iter()
            .map(StatusId::new)
            .collect())
    }
    pub async fn get_timeline_with_scores(
        &self,
        user: &UserId,
        kind: StreamKind,
    ) -> Result<Vec<(StatusId, f64)>> {
        self.check_active(kind)?;
        Ok(self
            .store
            .read_with_scores(&kind.stream_id(user))
            .await
            .context(StoreSnafu)?
            .into_iter()
            .map(|(id, score)| (StatusId::new(id), score))
            .collect())
    }
    pub async fn get_unread_count(&self, user: &UserId, kind: StreamKind) -> Result<i64> {
        self.check_active(kind)?;
        self.store
            .get_counter(&kind.unread_id(user))
            .await
            .context(StoreSnafu)
    }
    pub async fn get_unread_count_by_type(
        &self,
        user: &UserId,
        kind: StreamKind,
    ) -> Result<HashMap<StatusType, i64>> {
        self.check_active(kind)?;
        Ok(self
            .store
            .kv()
            .hgetall(&kind.unread_by_type_id(user))
            .await
            .context(StoreSnafu)?
            .into_iter()
            .filter_map(|(field, count)| match field.parse::<StatusType>() {
                Ok(status_type) => Some((status_type, count)),
                Err(err) => {
                    warn!("Ignoring unread count for {}: {}", field, err);
                    None
                }
            })
            .collect())
    }
    /// Reset `user`'s unread counts for `kind`
    pub async fn mark_read(&self, user: &UserId, kind: StreamKind) -> Result<()> {
        self.check_active(kind)?;
        let mut pipeline = Pipeline::new();
        pipeline
            .set(&kind.unread_id(user), 0)
            .del(&kind.unread_by_type_id(user));
        self.execute(pipeline).await
    }
    /// Delete every instance of each of `kinds`, along with their unread counts
    ///
    /// Returns the number of keys deleted.
    pub async fn erase(&self, kinds: &[StreamKind]) -> Result<usize> {
        let mut pipeline = Pipeline::new();
        for kind in kinds {
            for pattern in [format!("*-{}", kind.key()), format!("*-{}-unread*", kind.key())] {
                self.store
                    .kv()
                    .keys(&pattern)
                    .await
                    .context(StoreSnafu)?
                    .iter()
                    .for_each(|key| {
                        pipeline.del(key);
                    });
            }
        }
        let n = pipeline.len();
        self.execute(pipeline).await?;
        info!("Erased {} keys", n);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{Duration, Utc};

    use crate::{
        entities::User,
        memory::{InMemory, InMemoryKv},
    };

    const A: UserId = UserId::new(1);
    const B: UserId = UserId::new(2);
    const C: UserId = UserId::new(3);
    const D: UserId = UserId::new(4);

    fn setup(max_length: usize) -> (Arc<InMemory>, Arc<InMemoryKv>, StreamCatalog) {
        let db = Arc::new(InMemory::new());
        for u in [A, B, C, D] {
            db.add_user(User::new(u, true, true, true));
        }
        let kv = Arc::new(InMemoryKv::new());
        let catalog = StreamCatalog::new(
            StreamKind::all(),
            kv.clone(),
            db.clone(),
            NonZeroUsize::new(max_length).unwrap(),
        );
        (db, kv, catalog)
    }

    fn post(id: u64, author: UserId, privacy: Privacy, minutes_ago: i64) -> Status {
        Status::new(StatusId::new(id), author, privacy, StatusType::Note)
            .published_at(Utc::now() - Duration::minutes(minutes_ago))
    }

    fn ids(v: &[u64]) -> Vec<StatusId> {
        v.iter().copied().map(StatusId::new).collect()
    }

    #[tokio::test]
    async fn create_then_delete() {
        let (db, _, catalog) = setup(200);
        db.follow(&B, &A);
        let s = post(1, A, Privacy::Public, 0);
        db.add_status(s.clone());
        catalog.on_status_created(&s).await.unwrap();
        // Idempotent
        catalog.on_status_created(&s).await.unwrap();
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Home).await.unwrap(),
            ids(&[1])
        );
        assert!(catalog
            .get_timeline(&C, StreamKind::Home)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            catalog.get_timeline(&C, StreamKind::Local).await.unwrap(),
            ids(&[1])
        );
        assert_eq!(
            catalog
                .get_unread_count_by_type(&B, StreamKind::Home)
                .await
                .unwrap()
                .get(&StatusType::Note),
            Some(&2)
        );

        // B unfollows A; the status is no longer in B's audience, but deletion must still reach
        // B's home stream
        db.unfollow(&B, &A);
        db.delete_status(&s.id);
        catalog.on_status_deleted(&s.id).await.unwrap();
        for u in [A, B, C, D] {
            for kind in StreamKind::all() {
                assert!(catalog.get_timeline(&u, kind).await.unwrap().is_empty());
            }
        }
    }

    #[tokio::test]
    async fn unread_counts() {
        let (db, _, catalog) = setup(200);
        db.follow(&B, &A);
        assert_eq!(catalog.get_unread_count(&B, StreamKind::Home).await.unwrap(), 0);
        for i in 1..=3 {
            let s = post(i, A, Privacy::Followers, 0);
            db.add_status(s.clone());
            catalog.on_status_created(&s).await.unwrap();
        }
        let s = post(4, C, Privacy::Public, 0);
        db.add_status(s.clone());
        catalog.on_status_created(&s).await.unwrap();
        assert_eq!(catalog.get_unread_count(&B, StreamKind::Home).await.unwrap(), 3);
        // Reading doesn't reset
        catalog.get_timeline(&B, StreamKind::Home).await.unwrap();
        assert_eq!(catalog.get_unread_count(&B, StreamKind::Home).await.unwrap(), 3);
        catalog.mark_read(&B, StreamKind::Home).await.unwrap();
        assert_eq!(catalog.get_unread_count(&B, StreamKind::Home).await.unwrap(), 0);
        assert!(catalog
            .get_unread_count_by_type(&B, StreamKind::Home)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn follow_backfills_home() {
        let (db, _, catalog) = setup(200);
        for (i, p) in [
            Privacy::Public,
            Privacy::Unlisted,
            Privacy::Followers,
            Privacy::Direct,
        ]
        .into_iter()
        .enumerate()
        {
            db.add_status(post(i as u64 + 1, A, p, 10 - i as i64));
        }
        assert!(catalog
            .get_timeline(&B, StreamKind::Home)
            .await
            .unwrap()
            .is_empty());
        db.follow(&B, &A);
        catalog.on_user_followed(&B, &A).await.unwrap();
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Home).await.unwrap(),
            ids(&[3, 2, 1])
        );
        // Bulk population never touches unread counts
        assert_eq!(catalog.get_unread_count(&B, StreamKind::Home).await.unwrap(), 0);

        db.unfollow(&B, &A);
        catalog.on_user_unfollowed(&B, &A).await.unwrap();
        assert!(catalog
            .get_timeline(&B, StreamKind::Home)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn block_and_unblock() {
        let (db, _, catalog) = setup(200);
        db.follow(&B, &A);
        let s = post(1, A, Privacy::Public, 5);
        let t = post(2, B, Privacy::Public, 4);
        for x in [&s, &t] {
            db.add_status(x.clone());
            catalog.on_status_created(x).await.unwrap();
        }
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Local).await.unwrap(),
            ids(&[2, 1])
        );

        db.block(&A, &B);
        catalog.on_user_blocked(&A, &B).await.unwrap();
        for kind in StreamKind::all() {
            assert!(!catalog
                .get_timeline(&B, kind)
                .await
                .unwrap()
                .contains(&s.id));
            assert!(!catalog
                .get_timeline(&A, kind)
                .await
                .unwrap()
                .contains(&t.id));
        }

        db.unblock(&A, &B);
        catalog.on_user_unblocked(&A, &B).await.unwrap();
        for kind in [StreamKind::Local, StreamKind::Federated] {
            assert_eq!(catalog.get_timeline(&B, kind).await.unwrap(), ids(&[2, 1]));
            assert_eq!(catalog.get_timeline(&A, kind).await.unwrap(), ids(&[2, 1]));
        }
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Home).await.unwrap(),
            ids(&[2])
        );
    }

    #[tokio::test]
    async fn unblock_with_a_remaining_block() {
        let (db, _, catalog) = setup(200);
        db.add_status(post(1, A, Privacy::Public, 5));
        db.block(&A, &B);
        db.block(&B, &A);
        db.unblock(&A, &B);
        assert_eq!(catalog.on_user_unblocked(&A, &B).await.unwrap(), 0);
        assert!(catalog
            .get_timeline(&B, StreamKind::Local)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn boosts_supersede() {
        let (db, _, catalog) = setup(200);
        let (x, y) = (C, D);
        db.follow(&B, &A);
        db.follow(&B, &x);
        db.follow(&B, &y);
        let now = Utc::now();
        let original = post(1, A, Privacy::Public, 30);
        db.add_status(original.clone());
        catalog.on_status_created(&original).await.unwrap();

        let boost_x = Status::new(StatusId::new(2), x, Privacy::Public, StatusType::Boost)
            .boosting(original.id)
            .published_at(now - Duration::minutes(20));
        db.add_status(boost_x.clone());
        catalog.on_boost_created(&boost_x).await.unwrap();
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Home).await.unwrap(),
            ids(&[2])
        );

        let boost_y = Status::new(StatusId::new(3), y, Privacy::Public, StatusType::Boost)
            .boosting(original.id)
            .published_at(now - Duration::minutes(10));
        db.add_status(boost_y.clone());
        catalog.on_boost_created(&boost_y).await.unwrap();
        let timeline = catalog
            .get_timeline_with_scores(&B, StreamKind::Home)
            .await
            .unwrap();
        assert_eq!(timeline, vec![(boost_y.id, rank(&boost_y))]);

        db.purge_status(&boost_y.id);
        catalog
            .on_boost_deleted(&boost_y.id, &original.id)
            .await
            .unwrap();
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Home).await.unwrap(),
            ids(&[1])
        );
    }

    fn typed(
        id: u64,
        author: UserId,
        privacy: Privacy,
        status_type: StatusType,
        minutes_ago: i64,
    ) -> Status {
        Status::new(StatusId::new(id), author, privacy, status_type)
            .published_at(Utc::now() - Duration::minutes(minutes_ago))
    }

    #[tokio::test]
    async fn rebuild_matches_fan_out() {
        let (db, _, catalog) = setup(200);
        let remote = UserId::new(5);
        let inactive = UserId::new(6);
        db.add_user(User::new(remote, false, true, true));
        db.add_user(User::new(inactive, true, false, true));
        db.follow(&B, &A);
        db.follow(&C, &B);
        let (w7, w8) = (WorkId::new(7), WorkId::new(8));
        db.shelve(&B, &w8);
        db.shelve(&D, &w7);
        let statuses = vec![
            post(1, A, Privacy::Public, 50),
            post(2, A, Privacy::Followers, 49),
            post(3, B, Privacy::Unlisted, 48),
            post(4, C, Privacy::Public, 47),
            post(5, D, Privacy::Followers, 46),
            // D doesn't follow A; a mention doesn't put this in D's home stream
            post(6, A, Privacy::Public, 45).mentioning([D]),
            // B has only the second of these works on their shelves
            typed(7, C, Privacy::Public, StatusType::Comment, 44).mentioning_works([w7, w8]),
            // D is mentioned, but doesn't follow A
            typed(8, A, Privacy::Followers, StatusType::Review, 43).mentioning([D]),
            typed(9, B, Privacy::Direct, StatusType::Review, 42).mentioning([C]),
            post(10, A, Privacy::Direct, 41).mentioning([B]),
            typed(11, D, Privacy::Public, StatusType::Rating, 40).about(w8),
            typed(12, remote, Privacy::Public, StatusType::Review, 39),
            post(13, inactive, Privacy::Public, 38),
            typed(14, A, Privacy::Public, StatusType::Quotation, 37).about(w7),
        ];
        for s in &statuses {
            db.add_status(s.clone());
            catalog.on_status_created(s).await.unwrap();
        }

        let timeline = |u: UserId, kind: StreamKind| {
            let catalog = &catalog;
            async move { catalog.get_timeline(&u, kind).await.unwrap() }
        };
        assert!(!timeline(D, StreamKind::Home).await.contains(&StatusId::new(6)));
        assert!(timeline(B, StreamKind::Books).await.contains(&StatusId::new(7)));
        assert!(!timeline(D, StreamKind::Reviews).await.contains(&StatusId::new(8)));
        assert_eq!(timeline(C, StreamKind::Reviews).await, ids(&[12, 11, 9, 7]));
        assert_eq!(timeline(B, StreamKind::Books).await, ids(&[11, 7]));
        assert_eq!(timeline(D, StreamKind::Books).await, ids(&[14, 7]));
        assert_eq!(timeline(B, StreamKind::Local).await, ids(&[14, 11, 7, 6, 4, 1]));
        assert_eq!(
            timeline(B, StreamKind::Federated).await,
            ids(&[14, 12, 11, 7, 6, 4, 1])
        );

        for u in [A, B, C, D] {
            for kind in StreamKind::all() {
                let fanned = catalog.get_timeline(&u, kind).await.unwrap();
                catalog.populate_store(kind, &u).await.unwrap();
                assert_eq!(
                    catalog.get_timeline(&u, kind).await.unwrap(),
                    fanned,
                    "{u}'s {kind} stream"
                );
            }
        }
    }

    #[tokio::test]
    async fn capacity_holds_through_fan_out() {
        let (db, _, catalog) = setup(3);
        for i in 0..10 {
            let s = post(i + 1, A, Privacy::Public, 100 - i as i64);
            db.add_status(s.clone());
            catalog.on_status_created(&s).await.unwrap();
        }
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Local).await.unwrap(),
            ids(&[10, 9, 8])
        );
        assert_eq!(catalog.populate_all(StreamKind::Federated).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn shelving() {
        let (db, _, catalog) = setup(200);
        let work = WorkId::new(7);
        let s = post(1, A, Privacy::Public, 5).about(work);
        db.add_status(s.clone());
        catalog.on_status_created(&s).await.unwrap();
        assert!(catalog
            .get_timeline(&B, StreamKind::Books)
            .await
            .unwrap()
            .is_empty());
        db.shelve(&B, &work);
        catalog.on_book_shelved(&B, &work).await.unwrap();
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Books).await.unwrap(),
            ids(&[1])
        );
        db.unshelve(&B, &work);
        catalog.on_book_unshelved(&B, &work).await.unwrap();
        assert!(catalog
            .get_timeline(&B, StreamKind::Books)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unshelving_keeps_statuses_about_other_shelved_works() {
        let (db, _, catalog) = setup(200);
        let (w7, w8) = (WorkId::new(7), WorkId::new(8));
        db.shelve(&B, &w7);
        db.shelve(&B, &w8);
        let both = post(1, A, Privacy::Public, 5).about(w7).mentioning_works([w8]);
        let one = post(2, A, Privacy::Public, 4).about(w7);
        for s in [&both, &one] {
            db.add_status(s.clone());
            catalog.on_status_created(s).await.unwrap();
        }
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Books).await.unwrap(),
            ids(&[2, 1])
        );
        db.unshelve(&B, &w7);
        assert_eq!(catalog.on_book_unshelved(&B, &w7).await.unwrap(), 1);
        let after = catalog.get_timeline(&B, StreamKind::Books).await.unwrap();
        assert_eq!(after, ids(&[1]));
        catalog.populate_store(StreamKind::Books, &B).await.unwrap();
        assert_eq!(
            catalog.get_timeline(&B, StreamKind::Books).await.unwrap(),
            after
        );
    }

    #[tokio::test]
    async fn erasing() {
        let (db, kv, catalog) = setup(200);
        let s = post(1, A, Privacy::Public, 5);
        db.add_status(s.clone());
        catalog.on_status_created(&s).await.unwrap();
        catalog.erase(&[StreamKind::Local]).await.unwrap();
        use crate::kv::Backend;
        assert!(kv.keys("*-local*").await.unwrap().is_empty());
        assert!(!kv.keys("*-federated").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outages_surface() {
        let (db, kv, catalog) = setup(200);
        let s = post(1, A, Privacy::Public, 5);
        db.add_status(s.clone());
        kv.set_unavailable(true);
        let err = catalog.on_status_created(&s).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn inactive_streams() {
        let db = Arc::new(InMemory::new());
        let catalog = StreamCatalog::new(
            [StreamKind::Home],
            Arc::new(InMemoryKv::new()),
            db,
            NonZeroUsize::new(10).unwrap(),
        );
        assert!(matches!(
            catalog.get_timeline(&A, StreamKind::Books).await,
            Err(Error::Inactive { .. })
        ));
    }
}
