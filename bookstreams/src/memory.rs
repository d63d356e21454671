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

//! # memory
//!
//! In-memory implementations of both [kv::Backend] and [storage::Backend].
//!
//! [kv::Backend]: crate::kv::Backend
//! [storage::Backend]: crate::storage::Backend
//!
//! These are primarily for testing, but they're also handy for standing-up the engine without a
//! Redis server or a database. [InMemoryKv] tries to mirror Redis' semantics closely, right down to
//! the tie-break on equal scores (members compare lexicographically as their decimal
//! representations, which is what Redis does with the strings we hand it).

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use snafu::{prelude::*, Backtrace};

use crate::{
    entities::{Status, StatusId, User, UserId, WorkId},
    kv::{self, Op, Pipeline},
    storage::{self, StatusQuery, StatusStream},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The in-memory store has been marked unavailable"))]
    Unavailable { backtrace: Backtrace },
    #[snafu(display("The in-memory store's lock was poisoned"))]
    Poisoned { backtrace: Backtrace },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          InMemoryKv                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
enum Value {
    SortedSet(HashMap<u64, f64>),
    Counter(i64),
    Hash(HashMap<String, i64>),
}

/// Order (member, score) pairs the way Redis does: ascending score, ties broken by the member's
/// byte-wise representation
fn redis_order(lhs: &(u64, f64), rhs: &(u64, f64)) -> Ordering {
    lhs.1
        .total_cmp(&rhs.1)
        .then_with(|| lhs.0.to_string().cmp(&rhs.0.to_string()))
}

/// Glob matching supporting only `*`, which is all we need for key patterns
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts = pattern.split('*').collect::<Vec<&str>>();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !text.starts_with(first) || text.len() < first.len() + last.len() || !text.ends_with(last) {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

/// An in-memory sorted-set key-value store
#[derive(Debug, Default)]
pub struct InMemoryKv {
    map: RwLock<HashMap<String, Value>>,
    unavailable: AtomicBool,
}

impl InMemoryKv {
    pub fn new() -> InMemoryKv {
        InMemoryKv::default()
    }
    /// Simulate an outage; while set, every operation fails with
    /// [StoreUnavailable](kv::Error::StoreUnavailable)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }
    fn check(&self) -> kv::Result<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            Err(kv::Error::unavailable(UnavailableSnafu.build()))
        } else {
            Ok(())
        }
    }
    fn wrong_type(key: &str) -> kv::Error {
        kv::UnexpectedSnafu {
            key: key.to_owned(),
            message: "WRONGTYPE Operation against a key holding the wrong kind of value",
        }
        .build()
    }
    fn apply(map: &mut HashMap<String, Value>, op: Op) -> kv::Result<()> {
        match op {
            Op::ZAdd {
                key,
                member,
                score,
                only_existing,
            } => {
                let entry = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::SortedSet(HashMap::new()));
                match entry {
                    Value::SortedSet(set) => {
                        if !only_existing || set.contains_key(&member) {
                            set.insert(member, score);
                        }
                    }
                    _ => return Err(InMemoryKv::wrong_type(&key)),
                }
                // `ZADD XX` against an absent key must not leave an empty set behind
                if matches!(map.get(&key), Some(Value::SortedSet(set)) if set.is_empty()) {
                    map.remove(&key);
                }
            }
            Op::ZRem { key, member } => {
                let now_empty = match map.get_mut(&key) {
                    Some(Value::SortedSet(set)) => {
                        set.remove(&member);
                        set.is_empty()
                    }
                    Some(_) => return Err(InMemoryKv::wrong_type(&key)),
                    None => false,
                };
                if now_empty {
                    map.remove(&key);
                }
            }
            Op::ZRemRangeByRank { key, start, stop } => {
                let now_empty = match map.get_mut(&key) {
                    Some(Value::SortedSet(set)) => {
                        let len = set.len() as isize;
                        let start = if start < 0 { (len + start).max(0) } else { start };
                        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
                        if start <= stop && start < len {
                            let mut members =
                                set.iter().map(|(m, s)| (*m, *s)).collect::<Vec<_>>();
                            members.sort_by(redis_order);
                            members[start as usize..=stop as usize]
                                .iter()
                                .for_each(|(m, _)| {
                                    set.remove(m);
                                });
                        }
                        set.is_empty()
                    }
                    Some(_) => return Err(InMemoryKv::wrong_type(&key)),
                    None => false,
                };
                if now_empty {
                    map.remove(&key);
                }
            }
            Op::Incr { key } => match map.entry(key.clone()).or_insert(Value::Counter(0)) {
                Value::Counter(n) => *n += 1,
                _ => return Err(InMemoryKv::wrong_type(&key)),
            },
            Op::Set { key, value } => {
                map.insert(key, Value::Counter(value));
            }
            Op::HIncrBy { key, field, delta } => {
                match map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Hash(HashMap::new()))
                {
                    Value::Hash(h) => *h.entry(field).or_insert(0) += delta,
                    _ => return Err(InMemoryKv::wrong_type(&key)),
                }
            }
            Op::Del { key } => {
                map.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl kv::Backend for InMemoryKv {
    async fn execute(&self, pipeline: Pipeline) -> kv::Result<()> {
        self.check()?;
        let mut map = self
            .map
            .write()
            .map_err(|_| kv::Error::unavailable(PoisonedSnafu.build()))?;
        // Like a Redis pipeline, an error part-way through leaves the earlier operations applied.
        pipeline
            .into_ops()
            .into_iter()
            .try_for_each(|op| InMemoryKv::apply(&mut map, op))
    }
    async fn zrevrange(&self, key: &str) -> kv::Result<Vec<(u64, f64)>> {
        self.check()?;
        let map = self
            .map
            .read()
            .map_err(|_| kv::Error::unavailable(PoisonedSnafu.build()))?;
        match map.get(key) {
            Some(Value::SortedSet(set)) => {
                let mut members = set.iter().map(|(m, s)| (*m, *s)).collect::<Vec<_>>();
                members.sort_by(|l, r| redis_order(r, l));
                Ok(members)
            }
            Some(_) => Err(InMemoryKv::wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }
    async fn zcard(&self, key: &str) -> kv::Result<usize> {
        self.check()?;
        let map = self
            .map
            .read()
            .map_err(|_| kv::Error::unavailable(PoisonedSnafu.build()))?;
        match map.get(key) {
            Some(Value::SortedSet(set)) => Ok(set.len()),
            Some(_) => Err(InMemoryKv::wrong_type(key)),
            None => Ok(0),
        }
    }
    async fn get(&self, key: &str) -> kv::Result<i64> {
        self.check()?;
        let map = self
            .map
            .read()
            .map_err(|_| kv::Error::unavailable(PoisonedSnafu.build()))?;
        match map.get(key) {
            Some(Value::Counter(n)) => Ok(*n),
            Some(_) => Err(InMemoryKv::wrong_type(key)),
            None => Ok(0),
        }
    }
    async fn hgetall(&self, key: &str) -> kv::Result<HashMap<String, i64>> {
        self.check()?;
        let map = self
            .map
            .read()
            .map_err(|_| kv::Error::unavailable(PoisonedSnafu.build()))?;
        match map.get(key) {
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(InMemoryKv::wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }
    async fn keys(&self, pattern: &str) -> kv::Result<Vec<String>> {
        self.check()?;
        let map = self
            .map
            .read()
            .map_err(|_| kv::Error::unavailable(PoisonedSnafu.build()))?;
        Ok(map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           InMemory                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    statuses: BTreeMap<StatusId, Status>,
    // (follower, followee)
    follows: HashSet<(UserId, UserId)>,
    // (requester, requestee)
    follow_requests: HashSet<(UserId, UserId)>,
    // (blocker, blocked)
    blocks: HashSet<(UserId, UserId)>,
    shelves: HashMap<UserId, HashSet<WorkId>>,
}

/// An in-memory source of truth
///
/// The mutators here do *not* notify anyone; the caller is playing the part of the application &
/// is responsible for publishing the corresponding events.
#[derive(Debug, Default)]
pub struct InMemory {
    state: RwLock<State>,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, storage::Error> {
        self.state
            .read()
            .map_err(|_| storage::Error::new(PoisonedSnafu.build()))
    }
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        // Only reachable from test & demo code, where a poisoned lock means a test already panicked
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }
    pub fn add_user(&self, user: User) {
        self.write().users.insert(user.id(), user);
    }
    pub fn set_discoverable(&self, user: &UserId, discoverable: bool) {
        if let Some(u) = self.write().users.get_mut(user) {
            u.set_discoverable(discoverable);
        }
    }
    pub fn add_status(&self, status: Status) {
        self.write().statuses.insert(status.id, status);
    }
    /// Tombstone a status
    pub fn delete_status(&self, status: &StatusId) {
        if let Some(s) = self.write().statuses.get_mut(status) {
            s.deleted = true;
        }
    }
    /// Remove a status outright (boosts are deleted this way)
    pub fn purge_status(&self, status: &StatusId) -> Option<Status> {
        self.write().statuses.remove(status)
    }
    pub fn follow(&self, follower: &UserId, followee: &UserId) {
        let mut state = self.write();
        state.follow_requests.remove(&(*follower, *followee));
        state.follows.insert((*follower, *followee));
    }
    pub fn unfollow(&self, follower: &UserId, followee: &UserId) {
        self.write().follows.remove(&(*follower, *followee));
    }
    pub fn request_follow(&self, requester: &UserId, requestee: &UserId) {
        self.write()
            .follow_requests
            .insert((*requester, *requestee));
    }
    /// Blocking also severs follows in both directions, as the application does
    pub fn block(&self, blocker: &UserId, blocked: &UserId) {
        let mut state = self.write();
        state.follows.remove(&(*blocker, *blocked));
        state.follows.remove(&(*blocked, *blocker));
        state.blocks.insert((*blocker, *blocked));
    }
    pub fn unblock(&self, blocker: &UserId, blocked: &UserId) {
        self.write().blocks.remove(&(*blocker, *blocked));
    }
    pub fn shelve(&self, user: &UserId, work: &WorkId) {
        self.write().shelves.entry(*user).or_default().insert(*work);
    }
    pub fn unshelve(&self, user: &UserId, work: &WorkId) {
        if let Some(works) = self.write().shelves.get_mut(user) {
            works.remove(work);
        }
    }
}

#[async_trait]
impl storage::Backend for InMemory {
    async fn status(&self, id: &StatusId) -> Result<Option<Status>, storage::Error> {
        Ok(self.read()?.statuses.get(id).cloned())
    }
    async fn user(&self, id: &UserId) -> Result<Option<User>, storage::Error> {
        Ok(self.read()?.users.get(id).cloned())
    }
    async fn local_users(&self) -> Result<Vec<User>, storage::Error> {
        let mut users = self
            .read()?
            .users
            .values()
            .filter(|u| u.is_local())
            .cloned()
            .collect::<Vec<User>>();
        users.sort_by_key(|u| u.id());
        Ok(users)
    }
    async fn discoverable_users(&self) -> Result<Vec<User>, storage::Error> {
        let mut users = self
            .read()?
            .users
            .values()
            .filter(|u| u.is_active() && u.is_discoverable())
            .cloned()
            .collect::<Vec<User>>();
        users.sort_by_key(|u| u.id());
        Ok(users)
    }
    async fn statuses(&self, query: &StatusQuery) -> Result<StatusStream<'_>, storage::Error> {
        let mut matches = {
            let state = self.read()?;
            state
                .statuses
                .values()
                .filter(|status| {
                    let Some(author) = state.users.get(&status.author) else {
                        return false;
                    };
                    let (follows, blocked) = match query.viewer {
                        Some(v) => (
                            state.follows.contains(&(v, status.author)),
                            state.blocks.contains(&(v, status.author))
                                || state.blocks.contains(&(status.author, v)),
                        ),
                        None => (false, false),
                    };
                    query.matches(status, author, follows, blocked)
                })
                .cloned()
                .collect::<Vec<Status>>()
        };
        matches.sort_by(|l, r| r.published.cmp(&l.published).then(r.id.cmp(&l.id)));
        Ok(Box::pin(stream::iter(matches.into_iter().map(Ok))))
    }
    async fn boosts_of(
        &self,
        boosted: &StatusId,
        before: &DateTime<Utc>,
    ) -> Result<Vec<Status>, storage::Error> {
        Ok(self
            .read()?
            .statuses
            .values()
            .filter(|s| s.boosted == Some(*boosted) && s.created < *before)
            .cloned()
            .collect())
    }
    async fn followers_of(&self, user: &UserId) -> Result<HashSet<UserId>, storage::Error> {
        Ok(self
            .read()?
            .follows
            .iter()
            .filter_map(|(follower, followee)| (followee == user).then_some(*follower))
            .collect())
    }
    async fn following_of(&self, user: &UserId) -> Result<HashSet<UserId>, storage::Error> {
        Ok(self
            .read()?
            .follows
            .iter()
            .filter_map(|(follower, followee)| (follower == user).then_some(*followee))
            .collect())
    }
    async fn is_following(
        &self,
        follower: &UserId,
        followee: &UserId,
    ) -> Result<bool, storage::Error> {
        Ok(self.read()?.follows.contains(&(*follower, *followee)))
    }
    async fn follow_requests_from(
        &self,
        user: &UserId,
    ) -> Result<HashSet<UserId>, storage::Error> {
        Ok(self
            .read()?
            .follow_requests
            .iter()
            .filter_map(|(requester, requestee)| (requester == user).then_some(*requestee))
            .collect())
    }
    async fn is_blocking(&self, blocker: &UserId, blocked: &UserId) -> Result<bool, storage::Error> {
        Ok(self.read()?.blocks.contains(&(*blocker, *blocked)))
    }
    async fn block_relations(&self, user: &UserId) -> Result<HashSet<UserId>, storage::Error> {
        Ok(self
            .read()?
            .blocks
            .iter()
            .filter_map(|(blocker, blocked)| {
                if blocker == user {
                    Some(*blocked)
                } else if blocked == user {
                    Some(*blocker)
                } else {
                    None
                }
            })
            .collect())
    }
    async fn users_with_work_on_shelf(
        &self,
        work: &WorkId,
    ) -> Result<HashSet<UserId>, storage::Error> {
        Ok(self
            .read()?
            .shelves
            .iter()
            .filter_map(|(user, works)| works.contains(work).then_some(*user))
            .collect())
    }
    async fn shelved_works(&self, user: &UserId) -> Result<HashSet<WorkId>, storage::Error> {
        Ok(self
            .read()?
            .shelves
            .get(user)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use futures::TryStreamExt;

    use crate::{
        entities::{Privacy, StatusType},
        kv::Backend as KvBackend,
        storage::Backend as StorageBackend,
    };

    #[test]
    fn globs() {
        assert!(glob_match("*-home", "12-home"));
        assert!(!glob_match("*-home", "12-home-unread"));
        assert!(glob_match("*-home*", "12-home-unread"));
        assert!(glob_match("12-*-unread", "12-books-unread"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("a*b*c", "acb"));
    }

    #[tokio::test]
    async fn sorted_sets_behave_like_redis() {
        let kv = InMemoryKv::new();
        let mut p = Pipeline::new();
        p.zadd("k", 1, 1.0)
            .zadd("k", 2, 3.0)
            .zadd("k", 3, 2.0)
            .zadd("k", 1, 4.0) // update, not duplicate
            .zadd_xx("k", 9, 9.0) // absent: no-op
            .zadd_xx("absent", 9, 9.0);
        kv.execute(p).await.unwrap();
        assert_eq!(
            kv.zrevrange("k").await.unwrap(),
            vec![(1, 4.0), (2, 3.0), (3, 2.0)]
        );
        assert_eq!(kv.zcard("absent").await.unwrap(), 0);
        assert!(kv.keys("*").await.unwrap() == vec!["k".to_string()]);

        // Keep the top two
        let mut p = Pipeline::new();
        p.zremrangebyrank("k", 0, -3);
        kv.execute(p).await.unwrap();
        assert_eq!(kv.zrevrange("k").await.unwrap(), vec![(1, 4.0), (2, 3.0)]);

        // Trimming a set smaller than the bound is a no-op
        let mut p = Pipeline::new();
        p.zremrangebyrank("k", 0, -11);
        kv.execute(p).await.unwrap();
        assert_eq!(kv.zcard("k").await.unwrap(), 2);

        // Ties break on the member's textual representation: "10" < "9"
        let mut p = Pipeline::new();
        p.zadd("t", 9, 1.0).zadd("t", 10, 1.0).zremrangebyrank("t", 0, -2);
        kv.execute(p).await.unwrap();
        assert_eq!(kv.zrevrange("t").await.unwrap(), vec![(9, 1.0)]);
    }

    #[tokio::test]
    async fn counters_and_hashes() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.get("c").await.unwrap(), 0);
        let mut p = Pipeline::new();
        p.incr("c").incr("c").hincrby("h", "Review", 1).hincrby("h", "Review", 2);
        kv.execute(p).await.unwrap();
        assert_eq!(kv.get("c").await.unwrap(), 2);
        assert_eq!(kv.hgetall("h").await.unwrap().get("Review"), Some(&3));
        let mut p = Pipeline::new();
        p.set("c", 0).del("h");
        kv.execute(p).await.unwrap();
        assert_eq!(kv.get("c").await.unwrap(), 0);
        assert!(kv.hgetall("h").await.unwrap().is_empty());
        // Wrong type
        let mut p = Pipeline::new();
        p.zadd("c", 1, 1.0);
        assert!(matches!(
            kv.execute(p).await,
            Err(kv::Error::Unexpected { key, .. }) if key == "c"
        ));
    }

    #[tokio::test]
    async fn outages() {
        let kv = InMemoryKv::new();
        kv.set_unavailable(true);
        assert!(matches!(
            kv.zrevrange("k").await,
            Err(kv::Error::StoreUnavailable { .. })
        ));
        kv.set_unavailable(false);
        assert!(kv.zrevrange("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn privacy_filtering() {
        let db = InMemory::new();
        let (a, b, c) = (UserId::new(1), UserId::new(2), UserId::new(3));
        for u in [a, b, c] {
            db.add_user(User::new(u, true, true, true));
        }
        db.follow(&b, &a);
        db.add_status(Status::new(
            StatusId::new(1),
            a,
            Privacy::Followers,
            StatusType::Note,
        ));
        db.add_status(
            Status::new(StatusId::new(2), a, Privacy::Direct, StatusType::Comment)
                .mentioning([c]),
        );
        let ids = |v: Vec<Status>| v.into_iter().map(|s| s.id.get()).collect::<Vec<u64>>();

        let seen_by_b = db
            .statuses(&StatusQuery::for_viewer(b))
            .await
            .unwrap()
            .try_collect::<Vec<Status>>()
            .await
            .unwrap();
        assert_eq!(ids(seen_by_b), vec![1]);

        let seen_by_c = db
            .statuses(&StatusQuery::for_viewer(c))
            .await
            .unwrap()
            .try_collect::<Vec<Status>>()
            .await
            .unwrap();
        assert_eq!(ids(seen_by_c), vec![2]);

        db.block(&a, &b);
        let seen_by_b = db
            .statuses(&StatusQuery::for_viewer(b))
            .await
            .unwrap()
            .try_collect::<Vec<Status>>()
            .await
            .unwrap();
        assert!(seen_by_b.is_empty());
        assert!(!db.is_following(&b, &a).await.unwrap());
        assert_eq!(db.block_relations(&b).await.unwrap(), HashSet::from([a]));
    }
}
