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

//! # suggested
//!
//! Suggested follows.
//!
//! Each local user gets a short, ranked list of other users they might like to follow, kept in a
//! [RankedStore] just like the streams. A candidate is ranked first by the number of people the
//! viewer follows who also follow the candidate ("mutuals"), then by the number of works they both
//! have on their shelves.
//!
//! ## Rank encoding
//!
//! The store wants a single score per member, so the two counts are packed into one float:
//!
//! ```text
//! rank = mutuals + (1 - 1/(shared_books + 1))
//! ```
//!
//! The fractional part is always in [0, 1), so ordering by rank is ordering by mutuals, then by
//! shared books. [SuggestionRank] is the decoded form; [SuggestionRank::score] &
//! [SuggestionRank::from_score] convert between the two.

use std::{collections::HashSet, num::NonZeroUsize, sync::Arc};

use itertools::Itertools;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};

use crate::{
    entities::UserId,
    kv::{self, Pipeline},
    ranked::RankedStore,
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{score} is not a valid suggestion rank"))]
    RankDecode { score: f64, backtrace: Backtrace },
    #[snafu(display("Failed to update suggestions: {source}"))]
    Store {
        #[snafu(backtrace)]
        source: kv::Error,
    },
    #[snafu(display("While querying the source of truth: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How far a decoded shared-book count may stray from an integer & still be taken as one
///
/// Encoding leaves an error of about one ulp in the score, which `1/(1-f)` magnifies by
/// (shared_books + 1)², so the tolerance scales with both counts. Decoding is exact while
/// (shared_books + 1)² · (mutuals + 1) stays below 2^49; past that, neighbouring shared-book
/// counts share a score & we refuse to guess.
fn decode_tolerance(mutuals: f64, shared_books: f64) -> f64 {
    (4.0 * (shared_books + 1.0).powi(2) * (mutuals + 1.0) * f64::EPSILON).max(1e-9)
}

/// A suggestion's rank, decoded
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SuggestionRank {
    pub mutuals: u64,
    pub shared_books: u64,
}

impl SuggestionRank {
    pub fn new(mutuals: u64, shared_books: u64) -> SuggestionRank {
        SuggestionRank {
            mutuals,
            shared_books,
        }
    }
    /// Pack this rank into a single, sortable score
    pub fn score(&self) -> f64 {
        self.mutuals as f64 + (1.0 - 1.0 / (self.shared_books as f64 + 1.0))
    }
    /// Unpack a score produced by [score](SuggestionRank::score)
    pub fn try_from_score(score: f64) -> Result<SuggestionRank> {
        ensure!(score.is_finite() && score >= 0.0, RankDecodeSnafu { score });
        let mutuals = score.floor();
        let fraction = score - mutuals;
        // 1 - 1/(x+1) = f => x = 1/(1-f) - 1
        let shared_books = 1.0 / (1.0 - fraction) - 1.0;
        let rounded = shared_books.round();
        let tolerance = decode_tolerance(mutuals, rounded);
        ensure!(
            tolerance < 0.5 && (shared_books - rounded).abs() <= tolerance,
            RankDecodeSnafu { score }
        );
        Ok(SuggestionRank {
            mutuals: mutuals as u64,
            shared_books: rounded as u64,
        })
    }
    /// As [try_from_score](SuggestionRank::try_from_score), falling back to zero/zero
    ///
    /// This is only ever used for display, so a garbled score shouldn't be fatal.
    pub fn from_score(score: f64) -> SuggestionRank {
        SuggestionRank::try_from_score(score).unwrap_or_else(|err| {
            warn!("{}; displaying it as zero", err);
            SuggestionRank::default()
        })
    }
}

/// The suggested-users cache
pub struct SuggestedUsers {
    store: RankedStore,
    storage: Arc<dyn storage::Backend + Send + Sync>,
}

impl std::fmt::Debug for SuggestedUsers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuggestedUsers")
            .field("store", &self.store)
            .finish()
    }
}

impl SuggestedUsers {
    pub fn new(
        kv: Arc<dyn kv::Backend + Send + Sync>,
        storage: Arc<dyn storage::Backend + Send + Sync>,
        max_length: NonZeroUsize,
    ) -> SuggestedUsers {
        SuggestedUsers {
            store: RankedStore::new(kv, Some(max_length)),
            storage,
        }
    }
    pub fn store_id(user: &UserId) -> String {
        format!("{}-suggestions", user)
    }
    /// How well `candidate` suits `viewer`
    pub async fn rank(&self, viewer: &UserId, candidate: &UserId) -> Result<SuggestionRank> {
        let following = self
            .storage
            .following_of(viewer)
            .await
            .context(StorageSnafu)?;
        let followers = self
            .storage
            .followers_of(candidate)
            .await
            .context(StorageSnafu)?;
        let mine = self
            .storage
            .shelved_works(viewer)
            .await
            .context(StorageSnafu)?;
        let theirs = self
            .storage
            .shelved_works(candidate)
            .await
            .context(StorageSnafu)?;
        Ok(SuggestionRank::new(
            following
                .intersection(&followers)
                .filter(|u| *u != viewer)
                .count() as u64,
            mine.intersection(&theirs).count() as u64,
        ))
    }
    /// Everyone who might reasonably be suggested to `viewer`: local, active, discoverable users
    /// other than `viewer` whom `viewer` neither follows, nor has asked to follow, nor is in a
    /// block relation with
    pub async fn candidates_for(&self, viewer: &UserId) -> Result<Vec<UserId>> {
        let mut excluded = self
            .storage
            .following_of(viewer)
            .await
            .context(StorageSnafu)?;
        excluded.extend(
            self.storage
                .follow_requests_from(viewer)
                .await
                .context(StorageSnafu)?,
        );
        excluded.extend(
            self.storage
                .block_relations(viewer)
                .await
                .context(StorageSnafu)?,
        );
        excluded.insert(*viewer);
        Ok(self
            .storage
            .discoverable_users()
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|u| u.is_local() && u.is_active() && !excluded.contains(&u.id()))
            .map(|u| u.id())
            .collect())
    }
    /// The viewers whose suggestion lists `candidate` might belong in: local users who don't
    /// already follow `candidate` & aren't in a block relation with them
    async fn viewers_for(&self, candidate: &UserId) -> Result<Vec<UserId>> {
        let mut excluded = self
            .storage
            .followers_of(candidate)
            .await
            .context(StorageSnafu)?;
        excluded.extend(
            self.storage
                .block_relations(candidate)
                .await
                .context(StorageSnafu)?,
        );
        excluded.insert(*candidate);
        Ok(self
            .storage
            .local_users()
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|u| u.is_active() && !excluded.contains(&u.id()))
            .map(|u| u.id())
            .collect())
    }
    /// Rebuild `viewer`'s suggestions from scratch
    pub async fn populate(&self, viewer: &UserId) -> Result<usize> {
        let mut ranked = Vec::new();
        for candidate in self.candidates_for(viewer).await? {
            ranked.push((candidate, self.rank(viewer, &candidate).await?.score()));
        }
        let key = SuggestedUsers::store_id(viewer);
        let mut pipeline = Pipeline::new();
        pipeline.del(&key);
        let n = self.store.bulk_add_to(
            &mut pipeline,
            &key,
            ranked
                .into_iter()
                .sorted_by(|l, r| r.1.total_cmp(&l.1).then(l.0.cmp(&r.0)))
                .map(|(u, score)| (u.get(), score)),
        );
        self.store.execute(pipeline).await.context(StoreSnafu)?;
        debug!("Populated {} suggestions for {}", n, viewer);
        Ok(n)
    }
    /// Re-compute `candidate`'s rank in every viewer's list
    ///
    /// When `update_only` is set, only lists already holding `candidate` are touched; otherwise
    /// `candidate` is added (subject to trimming) to every list it might belong in.
    pub async fn rerank(&self, candidate: &UserId, update_only: bool) -> Result<usize> {
        let mut pipeline = Pipeline::new();
        let viewers = self.viewers_for(candidate).await?;
        for viewer in &viewers {
            let score = self.rank(viewer, candidate).await?.score();
            let key = [SuggestedUsers::store_id(viewer)];
            if update_only {
                self.store
                    .rerank_to(&mut pipeline, key, candidate.get(), score);
            } else {
                self.store.add_to(&mut pipeline, key, candidate.get(), score);
            }
        }
        self.store.execute(pipeline).await.context(StoreSnafu)?;
        Ok(viewers.len())
    }
    /// Remove `candidate` from every local user's list
    pub async fn remove_everywhere(&self, candidate: &UserId) -> Result<()> {
        let keys = self
            .storage
            .local_users()
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|u| SuggestedUsers::store_id(&u.id()))
            .collect::<Vec<String>>();
        self.store
            .remove(keys, candidate.get())
            .await
            .context(StoreSnafu)
    }
    pub async fn remove_suggestion(&self, viewer: &UserId, suggested: &UserId) -> Result<()> {
        self.store
            .remove([SuggestedUsers::store_id(viewer)], suggested.get())
            .await
            .context(StoreSnafu)
    }
    /// The top `n` suggestions for `viewer`, best first
    ///
    /// An empty list is built on demand.
    pub async fn get_suggestions(
        &self,
        viewer: &UserId,
        n: usize,
    ) -> Result<Vec<(UserId, SuggestionRank)>> {
        let key = SuggestedUsers::store_id(viewer);
        let mut members = self
            .store
            .read_with_scores(&key)
            .await
            .context(StoreSnafu)?;
        if members.is_empty() && self.is_local(viewer).await? {
            self.populate(viewer).await?;
            members = self
                .store
                .read_with_scores(&key)
                .await
                .context(StoreSnafu)?;
        }
        Ok(members
            .into_iter()
            .take(n)
            .map(|(u, score)| (UserId::new(u), SuggestionRank::from_score(score)))
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
    /// `follower` now follows `followee`: there's no point in suggesting `followee` to `follower`
    /// any longer, and `followee`'s mutuals have changed for everyone else
    pub async fn on_user_followed(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.remove_suggestion(follower, followee).await?;
        self.rerank(followee, true).await?;
        Ok(())
    }
    pub async fn on_user_unfollowed(&self, _follower: &UserId, followee: &UserId) -> Result<()> {
        self.rerank(followee, true).await?;
        Ok(())
    }
    pub async fn on_user_blocked(&self, blocker: &UserId, blocked: &UserId) -> Result<()> {
        let mut pipeline = Pipeline::new();
        self.store.remove_from(
            &mut pipeline,
            [SuggestedUsers::store_id(blocker)],
            blocked.get(),
        );
        self.store.remove_from(
            &mut pipeline,
            [SuggestedUsers::store_id(blocked)],
            blocker.get(),
        );
        self.store.execute(pipeline).await.context(StoreSnafu)
    }
    /// `user` shelved or unshelved a work; their shared-book counts have changed
    pub async fn on_shelf_changed(&self, user: &UserId) -> Result<()> {
        self.rerank(user, true).await?;
        Ok(())
    }
    /// `user` has toggled whether they wish to be suggested to others
    pub async fn on_discoverability_changed(&self, user: &UserId) -> Result<()> {
        let suggestible = self
            .storage
            .user(user)
            .await
            .context(StorageSnafu)?
            .map(|u| u.is_local() && u.is_active() && u.is_discoverable())
            .unwrap_or(false);
        if suggestible {
            self.rerank(user, false).await?;
        } else {
            self.remove_everywhere(user).await?;
        }
        Ok(())
    }
    /// Build suggestions for a new user, & offer the new user to everyone else (if they're
    /// discoverable)
    pub async fn on_account_created(&self, user: &UserId) -> Result<()> {
        let Some(u) = self.storage.user(user).await.context(StorageSnafu)? else {
            warn!("No such user {}; not building suggestions", user);
            return Ok(());
        };
        if !u.is_local() {
            return Ok(());
        }
        self.populate(user).await?;
        if u.is_active() && u.is_discoverable() {
            self.rerank(user, false).await?;
        }
        Ok(())
    }
}

/// The IDs in a list of suggestions
pub fn suggested_ids(suggestions: &[(UserId, SuggestionRank)]) -> HashSet<UserId> {
    suggestions.iter().map(|(u, _)| *u).collect()
}
