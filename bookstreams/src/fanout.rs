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

//! # fanout
//!
//! Wiring between the application & the streams.
//!
//! ## Publishing
//!
//! Whenever something changes that might affect someone's streams (a status is posted, a user
//! follows another, a book is shelved...) the application calls the corresponding `notify_...`
//! method on a [Notifier]. This does nothing more than enqueue an [Event] naming the affected
//! entities by ID; it never touches the key-value store.
//!
//! ## Processing
//!
//! A background [Processor] (see [background_tasks]) drains the [EventQueue], handing each [Event]
//! to [Fanout::handle]. Handlers re-fetch whatever they need from the source of truth, so it
//! doesn't matter how long an event sat in the queue, or whether it's been seen before: a status
//! that has been deleted by the time its "created" event is handled is simply removed everywhere.
//!
//! The queue has two lanes: back-dated statuses (imports, or statuses arriving late from other
//! instances) go in the low-priority lane so that they can't hold up fresh ones. The high lane is
//! always drained first.
//!
//! Events concerning the same status (its creation, deletion, or a boost of it) carry a sequencing
//! key. No two events with the same key are ever in flight at once, and they're handed out in the
//! order in which they were dequeued, so (e.g.) a boost & its deletion can't race one another.
//!
//! Failed events are retried (ahead of anything else with the same key) up to
//! [max_retries](background_tasks::Config::max_retries) times, then dropped with an error.
//!
//! [Processor]: background_tasks::Processor

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use snafu::{prelude::*, Backtrace};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    background_tasks::{self, Processor, Receiver, Sender, Task},
    catalog::{self, StreamCatalog},
    counter_add,
    entities::{Status, StatusId, StatusType, UserId, WorkId},
    histogram_observe,
    metrics::{self, Instruments, Sort},
    storage,
    streams::StreamKind,
    suggested::{self, SuggestedUsers, SuggestionRank},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Catalog {
        #[snafu(backtrace)]
        source: catalog::Error,
    },
    #[snafu(display("{source}"))]
    Suggestions {
        #[snafu(backtrace)]
        source: suggested::Error,
    },
    #[snafu(display("While re-fetching from the source of truth: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish an event: {source}"))]
    Publish {
        #[snafu(source(from(background_tasks::Error, Box::new)))]
        source: Box<background_tasks::Error>,
    },
    #[snafu(display("The event queue has been closed"))]
    QueueClosed { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("fanout.events.processed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("fanout.events.retried", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("fanout.events.dropped", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("fanout.store.writes", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("fanout.store.removals", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("fanout.event.duration", Sort::FloatHistogram) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Events                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Something happened that may affect someone's streams or suggestions
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    StatusCreated(StatusId),
    StatusDeleted(StatusId),
    BoostCreated { boost: StatusId, boosted: StatusId },
    BoostDeleted { boost: StatusId, boosted: StatusId },
    UserFollowed { follower: UserId, followee: UserId },
    UserUnfollowed { follower: UserId, followee: UserId },
    UserBlocked { blocker: UserId, blocked: UserId },
    UserUnblocked { blocker: UserId, blocked: UserId },
    AccountCreated(UserId),
    BookShelved { user: UserId, work: WorkId },
    BookUnshelved { user: UserId, work: WorkId },
    DiscoverabilityChanged(UserId),
}

impl Event {
    /// Events bearing the same key are processed one at a time, in order
    ///
    /// Boosts are keyed on the status they boost, since that's the entry they contend over.
    pub fn sequence_key(&self) -> Option<StatusId> {
        match self {
            Event::StatusCreated(id) | Event::StatusDeleted(id) => Some(*id),
            Event::BoostCreated { boosted, .. } | Event::BoostDeleted { boosted, .. } => {
                Some(*boosted)
            }
            _ => None,
        }
    }
    /// True for events that only ever take statuses out of stores
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Event::StatusDeleted(_)
                | Event::UserUnfollowed { .. }
                | Event::UserBlocked { .. }
                | Event::BookUnshelved { .. }
        )
    }
    pub fn name(&self) -> &'static str {
        match self {
            Event::StatusCreated(_) => "status-created",
            Event::StatusDeleted(_) => "status-deleted",
            Event::BoostCreated { .. } => "boost-created",
            Event::BoostDeleted { .. } => "boost-deleted",
            Event::UserFollowed { .. } => "user-followed",
            Event::UserUnfollowed { .. } => "user-unfollowed",
            Event::UserBlocked { .. } => "user-blocked",
            Event::UserUnblocked { .. } => "user-unblocked",
            Event::AccountCreated(_) => "account-created",
            Event::BookShelved { .. } => "book-shelved",
            Event::BookUnshelved { .. } => "book-unshelved",
            Event::DiscoverabilityChanged(_) => "discoverability-changed",
        }
    }
}

/// Queue priority
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lane {
    High,
    Low,
}

impl Lane {
    /// Statuses published more than a day ago, or written to our database after they were
    /// published, are back-dated & go in the low-priority lane
    pub fn for_status(status: &Status, now: DateTime<Utc>) -> Lane {
        if status.published < now - chrono::Duration::days(1) || status.created > status.published
        {
            Lane::Low
        } else {
            Lane::High
        }
    }
}

/// An [Event], as a [Task]
#[derive(Clone, Debug)]
pub struct EventTask {
    event: Event,
    lane: Lane,
}

impl EventTask {
    pub fn new(event: Event, lane: Lane) -> EventTask {
        EventTask { event, lane }
    }
}

#[async_trait]
impl Task<Arc<Fanout>> for EventTask {
    async fn exec(self: Box<Self>, fanout: Arc<Fanout>) -> background_tasks::Result<()> {
        fanout
            .handle(&self.event)
            .await
            .map_err(background_tasks::Error::new)
    }
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Fanout                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The fan-out engine: applies [Event]s to the streams & suggestions, and serves reads
pub struct Fanout {
    catalog: StreamCatalog,
    suggestions: SuggestedUsers,
    instruments: Arc<Instruments>,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("catalog", &self.catalog)
            .field("suggestions", &self.suggestions)
            .finish()
    }
}

impl Fanout {
    pub fn new(
        catalog: StreamCatalog,
        suggestions: SuggestedUsers,
        instruments: Arc<Instruments>,
    ) -> Fanout {
        Fanout {
            catalog,
            suggestions,
            instruments,
        }
    }
    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }
    pub fn suggestions(&self) -> &SuggestedUsers {
        &self.suggestions
    }
    /// Re-fetch `id`; None if it's gone or tombstoned
    async fn live_status(&self, id: &StatusId) -> Result<Option<Status>> {
        Ok(self
            .catalog
            .storage()
            .status(id)
            .await
            .context(StorageSnafu)?
            .filter(|s| !s.deleted))
    }
    /// Apply `event`
    #[instrument(skip(self))]
    pub async fn handle(&self, event: &Event) -> Result<()> {
        let start = Instant::now();
        let result = self.dispatch(event).await;
        histogram_observe!(
            self.instruments,
            "fanout.event.duration",
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("event", event.name())]
        );
        let writes = result?;
        debug!("{} touched {} stores", event.name(), writes);
        counter_add!(
            self.instruments,
            "fanout.events.processed",
            1,
            &[KeyValue::new("event", event.name())]
        );
        if event.is_removal() {
            counter_add!(self.instruments, "fanout.store.removals", writes as u64, &[]);
        } else {
            counter_add!(self.instruments, "fanout.store.writes", writes as u64, &[]);
        }
        Ok(())
    }
    async fn dispatch(&self, event: &Event) -> Result<usize> {
        match event {
            Event::StatusCreated(id) | Event::BoostCreated { boost: id, .. } => {
                match self.live_status(id).await? {
                    None => {
                        info!("Status {} was deleted before it could be fanned out", id);
                        self.catalog.on_status_deleted(id).await.context(CatalogSnafu)
                    }
                    Some(status) if status.is_boost() => {
                        self.catalog.on_boost_created(&status).await.context(CatalogSnafu)
                    }
                    Some(status) => self
                        .catalog
                        .on_status_created(&status)
                        .await
                        .context(CatalogSnafu),
                }
            }
            Event::StatusDeleted(id) => self.catalog.on_status_deleted(id).await.context(CatalogSnafu),
            Event::BoostDeleted { boost, boosted } => self
                .catalog
                .on_boost_deleted(boost, boosted)
                .await
                .context(CatalogSnafu),
            Event::UserFollowed { follower, followee } => {
                let n = self
                    .catalog
                    .on_user_followed(follower, followee)
                    .await
                    .context(CatalogSnafu)?;
                self.suggestions
                    .on_user_followed(follower, followee)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(n)
            }
            Event::UserUnfollowed { follower, followee } => {
                let n = self
                    .catalog
                    .on_user_unfollowed(follower, followee)
                    .await
                    .context(CatalogSnafu)?;
                self.suggestions
                    .on_user_unfollowed(follower, followee)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(n)
            }
            Event::UserBlocked { blocker, blocked } => {
                let n = self
                    .catalog
                    .on_user_blocked(blocker, blocked)
                    .await
                    .context(CatalogSnafu)?;
                self.suggestions
                    .on_user_blocked(blocker, blocked)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(n)
            }
            Event::UserUnblocked { blocker, blocked } => self
                .catalog
                .on_user_unblocked(blocker, blocked)
                .await
                .context(CatalogSnafu),
            Event::AccountCreated(user) => {
                let n = self
                    .catalog
                    .on_account_created(user)
                    .await
                    .context(CatalogSnafu)?;
                self.suggestions
                    .on_account_created(user)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(n)
            }
            Event::BookShelved { user, work } => {
                let n = self
                    .catalog
                    .on_book_shelved(user, work)
                    .await
                    .context(CatalogSnafu)?;
                self.suggestions
                    .on_shelf_changed(user)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(n)
            }
            Event::BookUnshelved { user, work } => {
                let n = self
                    .catalog
                    .on_book_unshelved(user, work)
                    .await
                    .context(CatalogSnafu)?;
                self.suggestions
                    .on_shelf_changed(user)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(n)
            }
            Event::DiscoverabilityChanged(user) => {
                self.suggestions
                    .on_discoverability_changed(user)
                    .await
                    .context(SuggestionsSnafu)?;
                Ok(0)
            }
        }
    }
    pub async fn get_timeline(&self, user: &UserId, kind: StreamKind) -> Result<Vec<StatusId>> {
        self.catalog
            .get_timeline(user, kind)
            .await
            .context(CatalogSnafu)
    }
    pub async fn get_unread_count(&self, user: &UserId, kind: StreamKind) -> Result<i64> {
        self.catalog
            .get_unread_count(user, kind)
            .await
            .context(CatalogSnafu)
    }
    pub async fn get_unread_count_by_type(
        &self,
        user: &UserId,
        kind: StreamKind,
    ) -> Result<HashMap<StatusType, i64>> {
        self.catalog
            .get_unread_count_by_type(user, kind)
            .await
            .context(CatalogSnafu)
    }
    pub async fn mark_read(&self, user: &UserId, kind: StreamKind) -> Result<()> {
        self.catalog.mark_read(user, kind).await.context(CatalogSnafu)
    }
    pub async fn get_suggestions(
        &self,
        user: &UserId,
        n: usize,
    ) -> Result<Vec<(UserId, SuggestionRank)>> {
        self.suggestions
            .get_suggestions(user, n)
            .await
            .context(SuggestionsSnafu)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the queue                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
struct Envelope {
    event: Event,
    lane: Lane,
    attempts: u32,
}

#[derive(Debug)]
struct Lanes {
    high: UnboundedReceiver<Envelope>,
    low: UnboundedReceiver<Envelope>,
    /// Dequeued, but waiting on an earlier event with the same key
    parked: VecDeque<Envelope>,
    in_flight: HashMap<u64, Envelope>,
    busy: HashSet<StatusId>,
}

impl Lanes {
    fn is_idle(&self) -> bool {
        self.high.is_empty()
            && self.low.is_empty()
            && self.parked.is_empty()
            && self.in_flight.is_empty()
    }
    /// Pull the first parked envelope whose key is free & which isn't queued behind another
    /// parked envelope with the same key
    fn unpark(&mut self) -> Option<Envelope> {
        let mut blocked = HashSet::new();
        let idx = self.parked.iter().position(|env| match env.event.sequence_key() {
            Some(key) if self.busy.contains(&key) || blocked.contains(&key) => {
                blocked.insert(key);
                false
            }
            _ => true,
        })?;
        self.parked.remove(idx)
    }
    /// Pull the next runnable envelope from the lanes, parking any that must wait
    fn receive(&mut self) -> Option<Envelope> {
        loop {
            let env = self.high.try_recv().or_else(|_| self.low.try_recv()).ok()?;
            match env.event.sequence_key() {
                Some(key)
                    if self.busy.contains(&key)
                        || self
                            .parked
                            .iter()
                            .any(|p| p.event.sequence_key() == Some(key)) =>
                {
                    debug!("Parking {:?} behind an earlier event", env.event);
                    self.parked.push_back(env);
                }
                _ => return Some(env),
            }
        }
    }
    fn release(&mut self, cookie: u64) -> Option<Envelope> {
        let env = self.in_flight.remove(&cookie)?;
        if let Some(key) = env.event.sequence_key() {
            self.busy.remove(&key);
        }
        Some(env)
    }
    /// Release a failed envelope &, if it has attempts left, park it at the front of the line
    ///
    /// Both happen under the one borrow, so the queue never looks idle (nor the envelope's key
    /// free) while a retry is pending.
    fn fail(&mut self, cookie: u64, max_retries: u32) -> Option<Disposition> {
        let mut env = self.release(cookie)?;
        if env.attempts < max_retries {
            env.attempts += 1;
            let retry = Disposition::Retry {
                event: env.event.clone(),
                attempt: env.attempts,
            };
            self.parked.push_front(env);
            Some(retry)
        } else {
            Some(Disposition::GiveUp {
                event: env.event,
                attempts: env.attempts,
            })
        }
    }
}

/// What became of a failed event
#[derive(Debug)]
enum Disposition {
    Retry { event: Event, attempt: u32 },
    GiveUp { event: Event, attempts: u32 },
}

/// The receiving half of the event queue
#[derive(Debug)]
pub struct EventQueue {
    lanes: Mutex<Lanes>,
    next_cookie: AtomicU64,
    max_retries: u32,
    instruments: Arc<Instruments>,
}

/// The publishing half of the event queue
#[derive(Clone, Debug)]
pub struct Notifier {
    high: UnboundedSender<Envelope>,
    low: UnboundedSender<Envelope>,
}

impl EventQueue {
    pub fn new(max_retries: u32, instruments: Arc<Instruments>) -> (Notifier, Arc<EventQueue>) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        (
            Notifier {
                high: high_tx,
                low: low_tx,
            },
            Arc::new(EventQueue {
                lanes: Mutex::new(Lanes {
                    high: high_rx,
                    low: low_rx,
                    parked: VecDeque::new(),
                    in_flight: HashMap::new(),
                    busy: HashSet::new(),
                }),
                next_cookie: AtomicU64::new(0),
                max_retries,
                instruments,
            }),
        )
    }
    /// Take the next event ready to be processed, marking it in flight
    async fn dequeue(&self) -> Option<(u64, Event, Lane)> {
        let mut lanes = self.lanes.lock().await;
        let env = lanes.unpark().or_else(|| lanes.receive())?;
        if let Some(key) = env.event.sequence_key() {
            lanes.busy.insert(key);
        }
        let cookie = self.next_cookie.fetch_add(1, Ordering::SeqCst);
        let (event, lane) = (env.event.clone(), env.lane);
        lanes.in_flight.insert(cookie, env);
        Some((cookie, event, lane))
    }
    async fn release(&self, cookie: u64) -> Option<Envelope> {
        self.lanes.lock().await.release(cookie)
    }
    /// True if nothing is queued, parked or in flight
    pub async fn is_idle(&self) -> bool {
        self.lanes.lock().await.is_idle()
    }
    /// Wait up to `timeout` for the queue to drain; returns whether it did
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_idle().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_idle().await
    }
}

#[async_trait]
impl Receiver<Arc<Fanout>> for EventQueue {
    type TaskId = u64;
    async fn mark_complete(&self, cookie: u64) -> background_tasks::Result<()> {
        if self.release(cookie).await.is_none() {
            warn!("Completed event {} was not in flight", cookie);
        }
        Ok(())
    }
    async fn mark_failed(
        &self,
        cookie: u64,
        err: background_tasks::Error,
    ) -> background_tasks::Result<()> {
        let disposition = self.lanes.lock().await.fail(cookie, self.max_retries);
        match disposition {
            None => warn!("Failed event {} was not in flight", cookie),
            Some(Disposition::Retry { event, attempt }) => {
                warn!(
                    "{:?} failed ({}); retrying (attempt {} of {})",
                    event, err, attempt, self.max_retries
                );
                counter_add!(self.instruments, "fanout.events.retried", 1, &[]);
            }
            Some(Disposition::GiveUp { event, attempts }) => {
                error!(
                    "{:?} failed ({}) after {} retries; giving up",
                    event, err, attempts
                );
                counter_add!(self.instruments, "fanout.events.dropped", 1, &[]);
            }
        }
        Ok(())
    }
    async fn take_task(
        &self,
    ) -> background_tasks::Result<Option<(Box<dyn Task<Arc<Fanout>>>, u64)>> {
        Ok(self.dequeue().await.map(|(cookie, event, lane)| {
            (
                Box::new(EventTask::new(event, lane)) as Box<dyn Task<Arc<Fanout>>>,
                cookie,
            )
        }))
    }
}

#[async_trait]
impl Sender<Arc<Fanout>, EventTask> for Notifier {
    async fn send(&self, task: EventTask) -> background_tasks::Result<()> {
        let lane = match task.lane {
            Lane::High => &self.high,
            Lane::Low => &self.low,
        };
        lane.send(Envelope {
            event: task.event,
            lane: task.lane,
            attempts: 0,
        })
        .map_err(|_| background_tasks::Error::new(QueueClosedSnafu.build()))
    }
}

impl Notifier {
    async fn publish(&self, event: Event, lane: Lane) -> Result<()> {
        self.send(EventTask::new(event, lane))
            .await
            .context(PublishSnafu)
    }
    /// `status` has been written to the database
    pub async fn notify_status_created(&self, status: &Status) -> Result<()> {
        if status.is_boost() {
            return self.notify_boost_created(status).await;
        }
        self.publish(
            Event::StatusCreated(status.id),
            Lane::for_status(status, Utc::now()),
        )
        .await
    }
    pub async fn notify_status_deleted(&self, status: &StatusId) -> Result<()> {
        self.publish(Event::StatusDeleted(*status), Lane::High).await
    }
    pub async fn notify_boost_created(&self, boost: &Status) -> Result<()> {
        let Some(boosted) = boost.boosted else {
            warn!("Status {} boosts nothing; treating it as a status", boost.id);
            return self
                .publish(
                    Event::StatusCreated(boost.id),
                    Lane::for_status(boost, Utc::now()),
                )
                .await;
        };
        self.publish(
            Event::BoostCreated {
                boost: boost.id,
                boosted,
            },
            Lane::for_status(boost, Utc::now()),
        )
        .await
    }
    pub async fn notify_boost_deleted(&self, boost: &StatusId, boosted: &StatusId) -> Result<()> {
        self.publish(
            Event::BoostDeleted {
                boost: *boost,
                boosted: *boosted,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_user_followed(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.publish(
            Event::UserFollowed {
                follower: *follower,
                followee: *followee,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_user_unfollowed(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.publish(
            Event::UserUnfollowed {
                follower: *follower,
                followee: *followee,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_user_blocked(&self, blocker: &UserId, blocked: &UserId) -> Result<()> {
        self.publish(
            Event::UserBlocked {
                blocker: *blocker,
                blocked: *blocked,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_user_unblocked(&self, blocker: &UserId, blocked: &UserId) -> Result<()> {
        self.publish(
            Event::UserUnblocked {
                blocker: *blocker,
                blocked: *blocked,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_account_created(&self, user: &UserId) -> Result<()> {
        self.publish(Event::AccountCreated(*user), Lane::High).await
    }
    pub async fn notify_book_shelved(&self, user: &UserId, work: &WorkId) -> Result<()> {
        self.publish(
            Event::BookShelved {
                user: *user,
                work: *work,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_book_unshelved(&self, user: &UserId, work: &WorkId) -> Result<()> {
        self.publish(
            Event::BookUnshelved {
                user: *user,
                work: *work,
            },
            Lane::High,
        )
        .await
    }
    pub async fn notify_discoverability_changed(&self, user: &UserId) -> Result<()> {
        self.publish(Event::DiscoverabilityChanged(*user), Lane::High)
            .await
    }
}

/// Stand-up the whole pipeline: returns the [Notifier] on which to publish events, the
/// [EventQueue] (mostly useful for waiting on it to drain), and the running [Processor]
pub fn start(
    fanout: Arc<Fanout>,
    config: background_tasks::Config,
    instruments: Arc<Instruments>,
) -> (Notifier, Arc<EventQueue>, Processor) {
    let (notifier, queue) = EventQueue::new(config.max_retries, instruments.clone());
    let processor = background_tasks::new(queue.clone(), fanout, Some(config), instruments);
    (notifier, queue, processor)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::num::NonZeroUsize;

    use chrono::Duration as ChronoDuration;

    use crate::{
        entities::{Privacy, User},
        memory::{InMemory, InMemoryKv},
    };

    const A: UserId = UserId::new(1);
    const B: UserId = UserId::new(2);
    const C: UserId = UserId::new(3);

    fn instruments() -> Arc<Instruments> {
        Arc::new(Instruments::new("bookstreams"))
    }

    #[test]
    fn lanes() {
        let now = Utc::now();
        let fresh = Status::new(StatusId::new(1), A, Privacy::Public, StatusType::Note);
        assert_eq!(Lane::for_status(&fresh, now), Lane::High);
        let old = fresh.clone().published_at(now - ChronoDuration::days(3));
        assert_eq!(Lane::for_status(&old, now), Lane::Low);
        let mut late = fresh.clone().published_at(now - ChronoDuration::minutes(5));
        late.created = now;
        assert_eq!(Lane::for_status(&late, now), Lane::Low);
    }

    #[tokio::test]
    async fn high_lane_first() {
        let (notifier, queue) = EventQueue::new(3, instruments());
        notifier
            .publish(Event::StatusCreated(StatusId::new(1)), Lane::Low)
            .await
            .unwrap();
        notifier
            .publish(Event::StatusCreated(StatusId::new(2)), Lane::High)
            .await
            .unwrap();
        let (_, first, lane) = queue.dequeue().await.unwrap();
        assert_eq!(first, Event::StatusCreated(StatusId::new(2)));
        assert_eq!(lane, Lane::High);
        let (_, second, _) = queue.dequeue().await.unwrap();
        assert_eq!(second, Event::StatusCreated(StatusId::new(1)));
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn same_status_events_are_sequenced() {
        let (notifier, queue) = EventQueue::new(3, instruments());
        let (one, two) = (StatusId::new(1), StatusId::new(2));
        notifier.notify_status_deleted(&one).await.unwrap();
        notifier.notify_boost_deleted(&StatusId::new(9), &one).await.unwrap();
        notifier.notify_status_deleted(&two).await.unwrap();

        let (c1, e1, _) = queue.dequeue().await.unwrap();
        assert_eq!(e1, Event::StatusDeleted(one));
        // The boost deletion must wait on the first event
        let (c2, e2, _) = queue.dequeue().await.unwrap();
        assert_eq!(e2, Event::StatusDeleted(two));
        assert!(queue.dequeue().await.is_none());
        assert!(!queue.is_idle().await);

        queue.mark_complete(c1).await.unwrap();
        let (c3, e3, _) = queue.dequeue().await.unwrap();
        assert_eq!(
            e3,
            Event::BoostDeleted {
                boost: StatusId::new(9),
                boosted: one
            }
        );
        queue.mark_complete(c2).await.unwrap();
        queue.mark_complete(c3).await.unwrap();
        assert!(queue.is_idle().await);
    }

    #[test]
    fn failed_events_never_leave_the_queue_idle() {
        let (_high_tx, high) = mpsc::unbounded_channel();
        let (_low_tx, low) = mpsc::unbounded_channel();
        let mut lanes = Lanes {
            high,
            low,
            parked: VecDeque::new(),
            in_flight: HashMap::new(),
            busy: HashSet::new(),
        };
        let one = StatusId::new(1);
        let in_flight = |lanes: &mut Lanes, cookie: u64, attempts: u32| {
            lanes.in_flight.insert(
                cookie,
                Envelope {
                    event: Event::StatusDeleted(one),
                    lane: Lane::High,
                    attempts,
                },
            );
            lanes.busy.insert(one);
        };

        in_flight(&mut lanes, 7, 0);
        assert!(matches!(
            lanes.fail(7, 1),
            Some(Disposition::Retry { attempt: 1, .. })
        ));
        // Released & parked in the same step
        assert!(!lanes.is_idle());
        assert!(!lanes.busy.contains(&one));
        assert_eq!(lanes.unpark().map(|env| env.attempts), Some(1));

        in_flight(&mut lanes, 8, 1);
        assert!(matches!(
            lanes.fail(8, 1),
            Some(Disposition::GiveUp { attempts: 1, .. })
        ));
        assert!(lanes.is_idle());
        assert!(lanes.fail(9, 1).is_none());
    }

    #[tokio::test]
    async fn failures_are_retried_then_dropped() {
        #[derive(Debug, Snafu)]
        enum Oops {
            #[snafu(display("oops"))]
            Oops,
        }

        let (notifier, queue) = EventQueue::new(2, instruments());
        let one = StatusId::new(1);
        notifier.notify_status_deleted(&one).await.unwrap();
        notifier
            .notify_boost_deleted(&StatusId::new(2), &one)
            .await
            .unwrap();
        for _ in 0..3 {
            let (cookie, event, _) = queue.dequeue().await.unwrap();
            // The retry goes ahead of the parked boost deletion
            assert_eq!(event, Event::StatusDeleted(one));
            queue
                .mark_failed(cookie, background_tasks::Error::new(Oops::Oops))
                .await
                .unwrap();
        }
        let (cookie, event, _) = queue.dequeue().await.unwrap();
        assert!(matches!(event, Event::BoostDeleted { .. }));
        queue.mark_complete(cookie).await.unwrap();
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn end_to_end() {
        let db = Arc::new(InMemory::new());
        for u in [A, B, C] {
            db.add_user(User::new(u, true, true, true));
        }
        let kv = Arc::new(InMemoryKv::new());
        let instruments = instruments();
        let fanout = Arc::new(Fanout::new(
            StreamCatalog::new(
                StreamKind::all(),
                kv.clone(),
                db.clone(),
                NonZeroUsize::new(200).unwrap(),
            ),
            SuggestedUsers::new(kv, db.clone(), NonZeroUsize::new(10).unwrap()),
            instruments.clone(),
        ));
        let (notifier, queue, processor) = start(
            fanout.clone(),
            background_tasks::Config {
                sleep_duration: Duration::from_millis(10),
                ..Default::default()
            },
            instruments,
        );

        db.follow(&B, &A);
        notifier.notify_user_followed(&B, &A).await.unwrap();
        let s = Status::new(StatusId::new(1), A, Privacy::Followers, StatusType::Note);
        db.add_status(s.clone());
        notifier.notify_status_created(&s).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(
            fanout.get_timeline(&B, StreamKind::Home).await.unwrap(),
            vec![s.id]
        );
        assert!(fanout
            .get_timeline(&C, StreamKind::Home)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(fanout.get_unread_count(&B, StreamKind::Home).await.unwrap(), 1);
        fanout.mark_read(&B, StreamKind::Home).await.unwrap();
        assert_eq!(fanout.get_unread_count(&B, StreamKind::Home).await.unwrap(), 0);

        // A status deleted before its creation is handled is removed, not added
        let t = Status::new(StatusId::new(2), A, Privacy::Public, StatusType::Note);
        db.add_status(t.clone());
        db.delete_status(&t.id);
        notifier.notify_status_created(&t).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert!(!fanout
            .get_timeline(&C, StreamKind::Local)
            .await
            .unwrap()
            .contains(&t.id));

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
