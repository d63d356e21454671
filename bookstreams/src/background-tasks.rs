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

//! # Background Task Processing
//!
//! Fan-out is expensive (a single status may land in thousands of streams) and never needs to
//! happen before the request that caused it returns. So the application *publishes* a change & a
//! background processor applies it to the streams "nearline": as soon as possible, best-effort.
//!
//! This module is the generic half of that arrangement. A [Receiver] hands out [Task]s along with a
//! cookie identifying each; [new] spawns a [Processor] that drives up to
//! [max_concurrent_tasks](Config::max_concurrent_tasks) of them at a time, reporting each back to
//! the [Receiver] as complete or failed. Ordering, prioritization & retries are entirely the
//! [Receiver]'s business; see [fanout](crate::fanout) for the one we actually use.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, warn};

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mark a task complete: {source}"))]
    Completion {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to pick-up a new task: {source}"))]
    Take {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Tried to remove an unknown task Id"))]
    TaskId { backtrace: Backtrace },
    #[snafu(display("The task timed out: {source}"))]
    TaskTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Trait defining a "task" for our purposes.
///
/// Note that the `exec()` method consumes the task.
// Must be object-safe so that `process()` can handle tasks generically; hence the generic
// parameter at the trait level & the `Box<Self>` receiver.
#[async_trait]
pub trait Task<C>: Send {
    /// Consume this task by converting it into a `Future` yielding a `Result<()>`.
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    fn timeout(&self) -> Option<Duration>;
}

/// Trait defining the ability to collect, or "send" [Task]s.
///
/// Generic over the [Task] type (rather than making `send()` generic) so that implementors can
/// constrain the sort of [Task]s they accept.
#[async_trait]
pub trait Sender<C, T: Task<C>> {
    async fn send(&self, task: T) -> Result<()>;
}

/// Trait defining the ability to harvest, or "receive" [Task]s generically.
///
/// A [Receiver] moves [Task] trait objects out of its queue along with a "cookie" identifying each,
/// and is told, later on, how each one fared.
#[async_trait]
pub trait Receiver<C> {
    type TaskId: Send + 'static;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()>;
    /// The task identified by `cookie` failed with `error`; whether to try again is up to the
    /// implementation
    async fn mark_failed(&self, cookie: Self::TaskId, error: Error) -> Result<()>;
    /// Take the next task ready to run, if any
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<C, T: Receiver<C> + Send + Sync> Receiver<C> for Arc<T> {
    type TaskId = T::TaskId;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.as_ref().mark_complete(cookie).await
    }
    async fn mark_failed(&self, cookie: Self::TaskId, error: Error) -> Result<()> {
        self.as_ref().mark_failed(cookie, error).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        self.as_ref().take_task().await
    }
}

/// [Processor] is the type managing the ongoing processing of background tasks. Await it, or call
/// `shutdown()` to signal it to stop & collect the result.
#[pin_project]
pub struct Processor {
    // This               👇 must match the return type of `process()`
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the processing task to shutdown, and wait up to `timeout` for it to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Amount of time to sleep when we have no tasks in process
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
    /// The number of times a failed task will be re-attempted before being abandoned
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 16,
            sleep_duration: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(5),
            pickup_timeout: Duration::from_millis(1000),
            max_retries: 3,
        }
    }
}

inventory::submit! { metrics::Registration::new("background.processor.tasks.completed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.failed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.inflight", Sort::IntegralGauge) }

/// Process background tasks. `receiver` is a [Receiver] from which we can draw tasks. `config`
/// holds configuration parameters for the algorithm. `shutdown` is a [Notify] instance the caller
/// can use to signal this function to exit.
async fn process<C: Clone + Send + 'static, R: Receiver<C>>(
    receiver: R,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let mut tasks: HashMap<Id, R::TaskId> = HashMap::new();
    let mut futures = JoinSet::new();
    let mut done = false;
    while !done {
        // Fill up to capacity with whatever the receiver has ready:
        while futures.len() < config.max_concurrent_tasks {
            match receiver.take_task().await.context(TakeSnafu)? {
                Some((task, cookie)) => {
                    let id = futures
                        .spawn(tokio::time::timeout(
                            task.timeout().unwrap_or(config.default_timeout),
                            task.exec(context.clone()),
                        ))
                        .id();
                    tasks.insert(id, cookie);
                }
                None => break,
            }
        }

        gauge_setu!(
            instruments,
            "background.processor.tasks.inflight",
            futures.len() as u64,
            &[]
        );

        if !futures.is_empty() {
            tokio::select! {
                result = futures.join_next_with_id() => {
                    match result {
                        Some(Ok((id, outcome))) => {
                            let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                            match outcome
                                .map_err(|err| TaskTimeoutSnafu.into_error(err))
                                .and_then(|result| result)
                            {
                                Ok(()) => {
                                    receiver.mark_complete(cookie).await.context(CompletionSnafu)?;
                                    counter_add!(instruments, "background.processor.tasks.completed", 1, &[]);
                                }
                                Err(err) => {
                                    warn!("Background task failed: {err}");
                                    counter_add!(instruments, "background.processor.tasks.failed", 1, &[]);
                                    receiver.mark_failed(cookie, err).await.context(CompletionSnafu)?;
                                }
                            }
                        },
                        Some(Err(err)) => {
                            // The task panicked (or was cancelled); that's a failure like any other
                            let cookie = tasks.remove(&err.id()).context(TaskIdSnafu)?;
                            counter_add!(instruments, "background.processor.tasks.failed", 1, &[]);
                            receiver
                                .mark_failed(cookie, JoinSnafu.into_error(err))
                                .await
                                .context(CompletionSnafu)?;
                        },
                        None => unreachable!(), // Precluded by `.is_empty()`, above.
                    }
                },
                // A long-running task shouldn't keep us from picking-up new tasks.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified()=> {
                    done = true;
                }
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (), // Loop around & try again
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    }

    debug!("Waiting on {} in-flight tasks", futures.len());
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Spawn a new [Processor] draining `receiver`.
pub fn new<C: Clone + Send + 'static, R: Receiver<C> + Send + 'static>(
    receiver: R,
    context: C,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        context,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Processor {
        processor,
        shutdown,
    }
}

#[cfg(test)]
mod mock {

    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;

    #[derive(Debug, Snafu)]
    enum Boom {
        #[snafu(display("boom"))]
        Boom,
    }

    enum Job {
        Sleep(Duration),
        Fail,
        Panic,
    }

    #[async_trait]
    impl Task<Arc<AtomicUsize>> for Job {
        async fn exec(self: Box<Self>, runs: Arc<AtomicUsize>) -> Result<()> {
            runs.fetch_add(1, Ordering::SeqCst);
            match *self {
                Job::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(())
                }
                Job::Fail => Err(Error::new(Boom::Boom)),
                Job::Panic => panic!("task panicked"),
            }
        }
        fn timeout(&self) -> Option<Duration> {
            match self {
                Job::Sleep(_) => Some(Duration::from_millis(500)),
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct Queue {
        jobs: Mutex<VecDeque<(Job, u64)>>,
        next: Mutex<u64>,
        completed: Mutex<Vec<u64>>,
        failed: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Receiver<Arc<AtomicUsize>> for Queue {
        type TaskId = u64;
        async fn mark_complete(&self, cookie: u64) -> Result<()> {
            self.completed.lock().unwrap().push(cookie);
            Ok(())
        }
        async fn mark_failed(&self, cookie: u64, _error: Error) -> Result<()> {
            self.failed.lock().unwrap().push(cookie);
            Ok(())
        }
        async fn take_task(&self) -> Result<Option<(Box<dyn Task<Arc<AtomicUsize>>>, u64)>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .pop_front()
                .map(|(job, id)| (Box::new(job) as Box<dyn Task<_>>, id)))
        }
    }

    #[async_trait]
    impl Sender<Arc<AtomicUsize>, Job> for Queue {
        async fn send(&self, job: Job) -> Result<()> {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            self.jobs.lock().unwrap().push_back((job, *next));
            Ok(())
        }
    }

    #[tokio::test]
    async fn outcomes_are_reported() {
        let queue = Arc::new(Queue::default());
        let runs = Arc::new(AtomicUsize::new(0));
        for job in [
            Job::Sleep(Duration::from_millis(50)),
            Job::Fail,
            Job::Sleep(Duration::from_secs(5)), // times out
            Job::Panic,
            Job::Sleep(Duration::from_millis(10)),
        ] {
            queue.send(job).await.unwrap();
        }
        let processor = new(
            queue.clone(),
            runs.clone(),
            Some(Config {
                sleep_duration: Duration::from_millis(10),
                ..Default::default()
            }),
            Arc::new(Instruments::new("bookstreams")),
        );
        tokio::time::sleep(Duration::from_millis(1500)).await;
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        let mut completed = queue.completed.lock().unwrap().clone();
        completed.sort();
        assert_eq!(completed, vec![1, 5]);
        let mut failed = queue.failed.lock().unwrap().clone();
        failed.sort();
        assert_eq!(failed, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn shutdown_when_idle() {
        let processor = new(
            Arc::new(Queue::default()),
            Arc::new(AtomicUsize::new(0)),
            None,
            Arc::new(Instruments::new("bookstreams")),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(processor.shutdown(Duration::from_secs(1)).await.is_ok());
    }
}
