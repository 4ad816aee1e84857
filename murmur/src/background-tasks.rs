// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of murmur.
//
// murmur is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// murmur is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with murmur.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Background Task Processing
//!
//! [axum] makes no provision for compute outside the context of handling an HTTP request, yet
//! murmur needs to do quite a bit of it: every message posted has to be copied onto the timeline of
//! each of its author's followers, and every new follow edge triggers a backfill. None of that
//! should sit on the "hot path" of the request that caused it.
//!
//! One could of course just [tokio::spawn] each piece of work, but that leaves no bound on how much
//! work can be outstanding at once, no way to know what was in flight at shutdown, and no single
//! place to observe how it all went. Instead, this module provides:
//!
//! - a bounded queue of [Task]s; [Submitter::submit] never blocks, and fails immediately should
//!   the queue be full (or closed)
//! - a single [Processor] that drains the queue, driving at most `max-concurrent-tasks` at once,
//!   each under its [Deadline]
//!
//! On shutdown, the processor stops accepting new work, then gives whatever's queued and in flight
//! `shutdown-timeout` to finish before abandoning it.
//!
//! # Durability
//!
//! There is none: the queue lives in memory, and whatever's in it when the process dies is lost.
//! For fan-out that's an acceptable trade (timelines are derived data), but it does mean that a
//! crash between the authoritative write and fan-out leaves followers' timelines short.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use pin_project::pin_project;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Notify,
    },
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Abandoned {abandoned} task(s) that didn't complete before shutdown"))]
    Abandoned { abandoned: usize },
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("The task queue has been closed"))]
    Closed { backtrace: Backtrace },
    #[snafu(display("The task queue is full"))]
    Full { backtrace: Backtrace },
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
/// Any [Send] type that can convert itself into an async function yielding a `Result<()>` will do.
/// Note that `exec()` consumes the task.
// Must be object-safe, so that the queue can hold `Box<dyn Task<C>>`; that's why the context type
// is a trait parameter rather than a method parameter.
/// How long a task may run before the processor gives up on it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Deadline {
    /// The processor's `task-timeout`
    Default,
    After(Duration),
    /// No wall-clock cap; the task must bound each of its own steps
    Unbounded,
}

#[async_trait]
pub trait Task<C>: Send {
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    fn deadline(&self) -> Deadline;
    /// Short, human-readable label used when logging this task
    fn name(&self) -> &'static str;
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "task-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// The number of tasks that may be waiting for pick-up before submissions are refused
    #[serde(rename = "queue-depth")]
    pub queue_depth: usize,
    /// Amount of time to wait for queued & in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 16,
            queue_depth: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

inventory::submit! { metrics::Registration::new("background.tasks.submitted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.tasks.rejected", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.tasks.completed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.tasks.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("background.tasks.inflight", Sort::IntegralGauge) }

/// The sending side of the task queue
///
/// Cheap to clone; the [Processor] exits once every [Submitter] has been dropped and the queue
/// has drained.
pub struct Submitter<C> {
    tx: mpsc::Sender<Box<dyn Task<C>>>,
    instruments: Arc<Instruments>,
}

impl<C> Clone for Submitter<C> {
    fn clone(&self) -> Self {
        Submitter {
            tx: self.tx.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<C> Submitter<C> {
    /// Enqueue `task` without waiting; fails if the queue is full or the processor has shut down
    pub fn submit(&self, task: Box<dyn Task<C>>) -> Result<()> {
        let name = task.name();
        match self.tx.try_send(task) {
            Ok(_) => {
                counter_add!(self.instruments, "background.tasks.submitted", 1, &[]);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!("The task queue is full; dropping a {name} task.");
                counter_add!(self.instruments, "background.tasks.rejected", 1, &[]);
                FullSnafu.fail()
            }
            Err(TrySendError::Closed(_)) => {
                warn!("The task queue is closed; dropping a {name} task.");
                counter_add!(self.instruments, "background.tasks.rejected", 1, &[]);
                ClosedSnafu.fail()
            }
        }
    }
}

/// [Processor] is the type managing the ongoing processing of background tasks.
// Need not be cheaply clonable; it'll be held in one place & used to shut down processing.
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
    /// Signal the processor to shut down & wait up to `timeout` for it to exit
    ///
    /// The processor applies its own `shutdown-timeout` to draining work; `timeout` here is the
    /// caller's bound on the whole affair.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    ///
    /// This is convenient when waiting on the processor along with other futures (in a
    /// `tokio::select!` invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

type Outcome = (&'static str, std::result::Result<Result<()>, tokio::time::error::Elapsed>);

fn spawn_task<C: Send + 'static>(
    futures: &mut JoinSet<Outcome>,
    task: Box<dyn Task<C>>,
    context: C,
    config: &Config,
) {
    let name = task.name();
    let deadline = match task.deadline() {
        Deadline::Default => Some(config.default_timeout),
        Deadline::After(timeout) => Some(timeout),
        Deadline::Unbounded => None,
    };
    futures.spawn(async move {
        let exec = task.exec(context);
        let outcome = match deadline {
            Some(timeout) => tokio::time::timeout(timeout, exec).await,
            None => Ok(exec.await),
        };
        (name, outcome)
    });
}

/// Log & count the outcome of a single task; nothing a task does can bring down the processor
fn record(result: std::result::Result<Outcome, JoinError>, instruments: &Instruments) {
    match result {
        Ok((name, Ok(Ok(())))) => {
            debug!("{name} task completed.");
            counter_add!(instruments, "background.tasks.completed", 1, &[]);
        }
        Ok((name, Ok(Err(err)))) => {
            error!("{name} task failed: {err:?}");
            counter_add!(instruments, "background.tasks.failed", 1, &[]);
        }
        Ok((name, Err(_))) => {
            error!("{name} task timed-out.");
            counter_add!(instruments, "background.tasks.failed", 1, &[]);
        }
        Err(err) => {
            error!("A task failed to run to completion: {err:?}");
            counter_add!(instruments, "background.tasks.failed", 1, &[]);
        }
    }
}

/// Run whatever's left in the (closed) queue, along with everything in flight, to completion
async fn drain<C: Clone + Send + Sync + 'static>(
    rx: &mut mpsc::Receiver<Box<dyn Task<C>>>,
    futures: &mut JoinSet<Outcome>,
    context: &C,
    config: &Config,
    instruments: &Instruments,
) {
    let mut exhausted = false;
    while !exhausted || !futures.is_empty() {
        tokio::select! {
            task = rx.recv(), if !exhausted && futures.len() < config.max_concurrent_tasks => {
                match task {
                    Some(task) => spawn_task(futures, task, context.clone(), config),
                    None => exhausted = true,
                }
            },
            Some(result) = futures.join_next(), if !futures.is_empty() => {
                record(result, instruments);
            }
        }
    }
}

/// Process background tasks. `rx` is the receiving end of the task queue. `config` holds
/// configuration parameters for the algorithm. `shutdown` is a [Notify] instance the caller
/// can use to signal this function to exit.
async fn process<C: Clone + Send + Sync + 'static>(
    mut rx: mpsc::Receiver<Box<dyn Task<C>>>,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let mut futures: JoinSet<Outcome> = JoinSet::new();
    let mut done = false;
    while !done {
        gauge_setu!(
            instruments,
            "background.tasks.inflight",
            futures.len() as u64,
            &[]
        );
        tokio::select! {
            // Only pick-up new work when we've got room for it; otherwise, it waits in the queue
            task = rx.recv(), if futures.len() < config.max_concurrent_tasks => {
                match task {
                    Some(task) => spawn_task(&mut futures, task, context.clone(), &config),
                    None => {
                        debug!("All submitters have gone away.");
                        done = true;
                    }
                }
            },
            Some(result) = futures.join_next(), if !futures.is_empty() => {
                record(result, &instruments);
            },
            _ = shutdown.notified() => {
                info!("Background task processor shutting down.");
                done = true;
            }
        }
    } // End processing loop.

    // Refuse new work, but give what we've already accepted a chance to complete:
    rx.close();
    let drained = tokio::time::timeout(
        config.shutdown_timeout,
        drain(&mut rx, &mut futures, &context, &config, &instruments),
    )
    .await;
    gauge_setu!(
        instruments,
        "background.tasks.inflight",
        futures.len() as u64,
        &[]
    );
    match drained {
        Ok(_) => Ok(()),
        Err(_) => {
            let mut abandoned = futures.len();
            while rx.try_recv().is_ok() {
                abandoned += 1;
            }
            futures.abort_all();
            warn!("Abandoning {abandoned} background task(s) at shutdown.");
            AbandonedSnafu { abandoned }.fail()
        }
    }
}

/// Create a new task queue; return the sending side along with the [Processor] consuming it
pub fn new<C: Clone + Send + Sync + 'static>(
    context: C,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> (Submitter<C>, Processor) {
    let mut config = config.unwrap_or_default();
    config.max_concurrent_tasks = config.max_concurrent_tasks.max(1);
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        rx,
        context,
        config,
        shutdown.clone(),
        instruments.clone(),
    ));
    (
        Submitter { tx, instruments },
        Processor {
            processor,
            shutdown,
        },
    )
}
