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

//! # Timeline fan-out
//!
//! ## Introduction
//!
//! murmur answers "what's on my home timeline?" with a single-partition read. The price of that is
//! paid at write time: every time a message is posted, a copy of it has to be written to the
//! timeline of every one of its author's followers ("fan-out on write"), and every time a follow
//! edge is created, the new follower's timeline has to be seeded with the followee's recent
//! messages ("backfill").
//!
//! This module implements both, along with the [Dispatcher] through which request handlers hand
//! off that work to the [background task processor](crate::background_tasks).
//!
//! ## Failure
//!
//! Fan-out is best-effort. Each per-follower write is bounded by `store-timeout` and its failure
//! is caught, logged & counted on its own; one bad write never prevents the others. Nothing is
//! retried, and nothing is reported back to the request that triggered the work (it's long gone).
//!
//! Since every store call is bounded individually (follower lookups page by page), the tasks
//! themselves run with no overall deadline; however many followers an author has, they all get
//! the message.
//!
//! ## The follow/post race
//!
//! Suppose F follows A at about the same time A posts m. Delivery of m reads A's followers; the
//! backfill for F reads A's recent messages. Should delivery see F *and* the backfill see m, F's
//! timeline gets m twice, which the upsert's (owner, message) key collapses into one row. Should
//! delivery miss F (because the follow edge hadn't yet become visible to it) *and* the backfill
//! miss m (because m hadn't yet become visible to it), F never gets m. That gap is accepted: the
//! only tool used here is the idempotent upsert, and closing it would need ordering the stores
//! don't offer.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, error, warn};

use crate::{
    background_tasks::{self, Deadline, Processor, Submitter, Task},
    counter_add,
    entities::{Message, TimelineEntry, UserId},
    metrics::{self, Instruments, Sort},
    storage::{self, Repositories},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to resolve the followers of {author}: {source}"))]
    Followers {
        author: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the recent messages of {author}: {source}"))]
    Recent {
        author: UserId,
        source: storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Fan-out configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The number of a followee's most recent messages copied onto a new follower's timeline
    #[serde(rename = "backfill-window")]
    pub backfill_window: usize,
    /// The maximum number of timeline writes one task will have outstanding at once
    #[serde(rename = "write-concurrency")]
    pub write_concurrency: usize,
    /// Bound on any single store call made during fan-out
    #[serde(rename = "store-timeout")]
    pub store_timeout: Duration,
    #[serde(flatten)]
    pub processor: background_tasks::Config,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backfill_window: 100,
            write_concurrency: 16,
            store_timeout: Duration::from_secs(2),
            processor: background_tasks::Config::default(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           statistics                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("fanout.deliveries", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.backfills", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.entries.written", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.entries.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.lookups.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fanout.tasks.rejected", Sort::IntegralCounter) }

/// Running totals kept by the fan-out engine
///
/// These duplicate the OTel counters, but are available in-process, which is handy for tests &
/// for the daemon's shutdown summary.
#[derive(Debug, Default)]
pub struct Stats {
    deliveries: AtomicU64,
    backfills: AtomicU64,
    entries_written: AtomicU64,
    entries_failed: AtomicU64,
    lookups_failed: AtomicU64,
    tasks_rejected: AtomicU64,
}

/// A point-in-time copy of [Stats]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub deliveries: u64,
    pub backfills: u64,
    pub entries_written: u64,
    pub entries_failed: u64,
    pub lookups_failed: u64,
    pub tasks_rejected: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            backfills: self.backfills.load(Ordering::Relaxed),
            entries_written: self.entries_written.load(Ordering::Relaxed),
            entries_failed: self.entries_failed.load(Ordering::Relaxed),
            lookups_failed: self.lookups_failed.load(Ordering::Relaxed),
            tasks_rejected: self.tasks_rejected.load(Ordering::Relaxed),
        }
    }
}

/// The result of one delivery or backfill
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FanOutReport {
    /// Timeline writes attempted
    pub attempted: usize,
    /// ...of which succeeded
    pub written: usize,
    /// ...of which failed (including timeouts)
    pub failed: usize,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            context                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything a fan-out task needs
#[derive(Clone)]
pub struct Context {
    pub repos: Repositories,
    pub config: Config,
    pub instruments: Arc<Instruments>,
    pub stats: Arc<Stats>,
}

impl Context {
    pub fn new(repos: Repositories, config: Config, instruments: Arc<Instruments>) -> Context {
        Context {
            repos,
            config,
            instruments,
            stats: Arc::new(Stats::default()),
        }
    }
    /// Run `f` under this context's `store-timeout`
    async fn bounded<T>(
        &self,
        f: impl std::future::Future<Output = storage::Result<T>>,
    ) -> storage::Result<T> {
        storage::bounded(Some(self.config.store_timeout), f).await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            fan-out                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Account for a single timeline write
fn tally(
    context: &Context,
    mut report: FanOutReport,
    owner: &UserId,
    result: storage::Result<()>,
) -> FanOutReport {
    match result {
        Ok(()) => {
            report.written += 1;
            context.stats.entries_written.fetch_add(1, Ordering::Relaxed);
            counter_add!(context.instruments, "fanout.entries.written", 1, &[]);
        }
        Err(err) => {
            if err.is_transient() {
                warn!("Failed to write to {owner}'s timeline: {err}");
            } else {
                error!("Failed to write to {owner}'s timeline: {err:?}");
            }
            report.failed += 1;
            context.stats.entries_failed.fetch_add(1, Ordering::Relaxed);
            counter_add!(context.instruments, "fanout.entries.failed", 1, &[]);
        }
    }
    report
}

/// Upsert `entries`, at most `write-concurrency` at a time, each under `store-timeout`
///
/// Each write is accounted for as it completes, so a batch that's dropped part-way through has
/// still recorded everything it did.
async fn write_entries(context: &Context, entries: Vec<TimelineEntry>) -> FanOutReport {
    let report = FanOutReport {
        attempted: entries.len(),
        ..Default::default()
    };
    stream::iter(entries)
        .map(|entry| async move {
            let result = context
                .bounded(context.repos.timelines.upsert_entry(&entry))
                .await;
            (entry, result)
        })
        .buffer_unordered(context.config.write_concurrency.max(1))
        .fold(report, |report, (entry, result)| {
            future::ready(tally(context, report, entry.owner_id(), result))
        })
        .await
}

/// Copy `message` onto the timeline of each of its author's followers
///
/// An error is returned only if the follower set couldn't be resolved at all; individual write
/// failures are reflected in the [FanOutReport].
#[tracing::instrument(skip(context, message), fields(message_id = %message.id(), author = %message.author_id()))]
pub async fn deliver_message(context: &Context, message: &Message) -> Result<FanOutReport> {
    context.stats.deliveries.fetch_add(1, Ordering::Relaxed);
    counter_add!(context.instruments, "fanout.deliveries", 1, &[]);

    let followers: HashSet<UserId> = context
        .repos
        .follows
        .followers_of(message.author_id(), Some(context.config.store_timeout))
        .await
        .map_err(|err| {
            context.stats.lookups_failed.fetch_add(1, Ordering::Relaxed);
            counter_add!(context.instruments, "fanout.lookups.failed", 1, &[]);
            err
        })
        .context(FollowersSnafu {
            author: message.author_id().clone(),
        })?;

    let entries: Vec<TimelineEntry> = followers
        .iter()
        // A self-edge that got past the request layer is ignored
        .filter(|follower| *follower != message.author_id())
        .map(|follower| TimelineEntry::for_owner(follower, message))
        .collect();

    let report = write_entries(context, entries).await;
    if report.failed > 0 {
        error!(
            "Delivered to {} of {} followers; {} failed.",
            report.written, report.attempted, report.failed
        );
    } else {
        debug!("Delivered to {} followers.", report.written);
    }
    Ok(report)
}

/// Seed `follower`'s timeline with up to `backfill-window` of `following`'s most recent messages
///
/// A self-follow is a no-op.
#[tracing::instrument(skip(context))]
pub async fn backfill(
    context: &Context,
    follower: &UserId,
    following: &UserId,
) -> Result<FanOutReport> {
    if follower == following {
        debug!("Ignoring a self-follow.");
        return Ok(FanOutReport::default());
    }

    context.stats.backfills.fetch_add(1, Ordering::Relaxed);
    counter_add!(context.instruments, "fanout.backfills", 1, &[]);

    let recent = context
        .bounded(
            context
                .repos
                .messages
                .recent_by_author(following, context.config.backfill_window),
        )
        .await
        .map_err(|err| {
            context.stats.lookups_failed.fetch_add(1, Ordering::Relaxed);
            counter_add!(context.instruments, "fanout.lookups.failed", 1, &[]);
            err
        })
        .context(RecentSnafu {
            author: following.clone(),
        })?;

    let entries = recent
        .iter()
        .map(|message| TimelineEntry::for_owner(follower, message))
        .collect();

    let report = write_entries(context, entries).await;
    if report.failed > 0 {
        error!(
            "Backfilled {} of {} messages; {} failed.",
            report.written, report.attempted, report.failed
        );
    } else {
        debug!("Backfilled {} messages.", report.written);
    }
    Ok(report)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct DeliverMessage {
    message: Message,
}

#[async_trait]
impl Task<Context> for DeliverMessage {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        deliver_message(&context, &self.message)
            .await
            .map(|_| ())
            .map_err(background_tasks::Error::new)
    }
    // Every store call is already bounded; a cap on the whole would truncate large deliveries
    fn deadline(&self) -> Deadline {
        Deadline::Unbounded
    }
    fn name(&self) -> &'static str {
        "deliver-message"
    }
}

struct Backfill {
    follower: UserId,
    following: UserId,
}

#[async_trait]
impl Task<Context> for Backfill {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        backfill(&context, &self.follower, &self.following)
            .await
            .map(|_| ())
            .map_err(background_tasks::Error::new)
    }
    fn deadline(&self) -> Deadline {
        Deadline::Unbounded
    }
    fn name(&self) -> &'static str {
        "backfill"
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Dispatcher                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Fire-and-forget entry point to fan-out
///
/// Both `on_*` methods return as soon as the work has been queued (or refused, should the queue be
/// full); the caller learns nothing of how it went.
#[derive(Clone)]
pub struct Dispatcher {
    submitter: Submitter<Context>,
    stats: Arc<Stats>,
    instruments: Arc<Instruments>,
}

impl Dispatcher {
    /// Start fan-out processing; the returned [Processor] is used to shut it down
    pub fn new(context: Context) -> (Dispatcher, Processor) {
        let stats = context.stats.clone();
        let instruments = context.instruments.clone();
        let config = context.config.processor.clone();
        let (submitter, processor) =
            background_tasks::new(context, Some(config), instruments.clone());
        (
            Dispatcher {
                submitter,
                stats,
                instruments,
            },
            processor,
        )
    }
    fn submit(&self, task: Box<dyn Task<Context>>) {
        if let Err(err) = self.submitter.submit(task) {
            self.stats.tasks_rejected.fetch_add(1, Ordering::Relaxed);
            counter_add!(self.instruments, "fanout.tasks.rejected", 1, &[]);
            warn!("Fan-out work dropped: {err}");
        }
    }
    /// `message` has been durably written; copy it onto its author's followers' timelines
    pub fn on_message_created(&self, message: Message) {
        self.submit(Box::new(DeliverMessage { message }));
    }
    /// `follower` now follows `following`; backfill `follower`'s timeline
    pub fn on_follow_created(&self, follower: UserId, following: UserId) {
        if follower == following {
            debug!("Ignoring a self-follow by {follower}.");
            return;
        }
        self.submit(Box::new(Backfill {
            follower,
            following,
        }));
    }
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use crate::{
        entities::{Content, MessageId},
        memory::MemoryStore,
        storage::{FollowRepository, MessageRepository, TimelineRepository},
    };

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn content(s: &str) -> Content {
        Content::new(s, 280).unwrap()
    }

    fn context_for(repos: Repositories, config: Config) -> Context {
        Context::new(repos, config, Arc::new(Instruments::new("murmur")))
    }

    /// Fails writes to a chosen set of owners' timelines & (optionally) stalls the rest
    struct Flaky {
        inner: Arc<MemoryStore>,
        failing: HashSet<UserId>,
        stalling: HashSet<UserId>,
    }

    #[async_trait]
    impl TimelineRepository for Flaky {
        async fn upsert_entry(&self, entry: &TimelineEntry) -> storage::Result<()> {
            if self.failing.contains(entry.owner_id()) {
                return Err(storage::Error::unavailable(std::io::Error::other(
                    "injected failure",
                )));
            }
            if self.stalling.contains(entry.owner_id()) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.upsert_entry(entry).await
        }
        async fn recent_for_owner(
            &self,
            owner: &UserId,
            limit: usize,
        ) -> storage::Result<Vec<TimelineEntry>> {
            self.inner.recent_for_owner(owner, limit).await
        }
    }

    /// A follower index that lags the follow table, as an eventually-consistent secondary index
    /// may
    struct Lagging {
        inner: Arc<MemoryStore>,
        hidden: Mutex<HashSet<UserId>>,
    }

    #[async_trait]
    impl FollowRepository for Lagging {
        async fn put_follow(&self, edge: &crate::entities::FollowEdge) -> storage::Result<()> {
            self.inner.put_follow(edge).await
        }
        async fn followers_of(
            &self,
            user: &UserId,
            page_timeout: Option<Duration>,
        ) -> storage::Result<HashSet<UserId>> {
            let hidden = self.hidden.lock().unwrap().clone();
            Ok(self
                .inner
                .followers_of(user, page_timeout)
                .await?
                .into_iter()
                .filter(|f| !hidden.contains(f))
                .collect())
        }
        async fn following(&self, user: &UserId) -> storage::Result<HashSet<UserId>> {
            self.inner.following(user).await
        }
    }

    /// Takes `delay` over every timeline write
    struct Sluggish {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl TimelineRepository for Sluggish {
        async fn upsert_entry(&self, entry: &TimelineEntry) -> storage::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.upsert_entry(entry).await
        }
        async fn recent_for_owner(
            &self,
            owner: &UserId,
            limit: usize,
        ) -> storage::Result<Vec<TimelineEntry>> {
            self.inner.recent_for_owner(owner, limit).await
        }
    }

    /// A follower index served ten at a time, each page taking `delay`
    struct SlowPages {
        followers: Vec<UserId>,
        delay: Duration,
        seen: Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl FollowRepository for SlowPages {
        async fn put_follow(&self, _: &crate::entities::FollowEdge) -> storage::Result<()> {
            Ok(())
        }
        async fn followers_of(
            &self,
            _: &UserId,
            page_timeout: Option<Duration>,
        ) -> storage::Result<HashSet<UserId>> {
            *self.seen.lock().unwrap() = page_timeout;
            let mut result = HashSet::new();
            for page in self.followers.chunks(10) {
                let page = storage::bounded(page_timeout, async {
                    tokio::time::sleep(self.delay).await;
                    Ok(page.to_vec())
                })
                .await?;
                result.extend(page);
            }
            Ok(result)
        }
        async fn following(&self, _: &UserId) -> storage::Result<HashSet<UserId>> {
            Ok(HashSet::new())
        }
    }

    async fn timeline_ids(store: &MemoryStore, owner: &UserId) -> Vec<MessageId> {
        store
            .recent_for_owner(owner, 1000)
            .await
            .unwrap()
            .iter()
            .map(|e| e.message_id())
            .collect()
    }

    #[tokio::test]
    async fn delivery_reaches_every_follower() {
        let store = Arc::new(MemoryStore::with_page_size(7));
        let a1 = uid("A1");
        for i in 0..50 {
            store.create_follow(&uid(&format!("U{i}")), &a1).await.unwrap();
        }
        let context = context_for(Repositories::from_backend(store.clone()), Config::default());
        let m = store.create_message(&a1, content("hello")).await.unwrap();

        let report = deliver_message(&context, &m).await.unwrap();
        assert_eq!(
            report,
            FanOutReport {
                attempted: 50,
                written: 50,
                failed: 0
            }
        );
        for i in 0..50 {
            assert_eq!(timeline_ids(&store, &uid(&format!("U{i}"))).await, vec![m.id()]);
        }
        // The author's own timeline is untouched
        assert!(timeline_ids(&store, &a1).await.is_empty());
        assert_eq!(context.stats.snapshot().entries_written, 50);
    }

    #[tokio::test]
    async fn delivery_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        let u1 = uid("U1");
        store.create_follow(&u1, &a1).await.unwrap();
        let context = context_for(Repositories::from_backend(store.clone()), Config::default());
        let m = store.create_message(&a1, content("hello")).await.unwrap();

        deliver_message(&context, &m).await.unwrap();
        deliver_message(&context, &m).await.unwrap();
        assert_eq!(store.timeline_len(&u1).await, 1);
    }

    #[tokio::test]
    async fn backfill_takes_only_the_most_recent() {
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        let u1 = uid("U1");
        let mut posted = Vec::new();
        for i in 0..5 {
            let m = Message::with_timestamp(
                &a1,
                content(&format!("m{i}")),
                Utc.timestamp_opt(100 + i, 0).unwrap(),
            );
            store.put_message(&m).await.unwrap();
            posted.push(m);
        }
        let context = context_for(
            Repositories::from_backend(store.clone()),
            Config {
                backfill_window: 3,
                ..Default::default()
            },
        );

        let report = backfill(&context, &u1, &a1).await.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(
            timeline_ids(&store, &u1).await,
            vec![posted[4].id(), posted[3].id(), posted[2].id()]
        );
    }

    #[tokio::test]
    async fn backfill_of_a_silent_author_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let context = context_for(Repositories::from_backend(store.clone()), Config::default());
        let report = backfill(&context, &uid("U1"), &uid("A1")).await.unwrap();
        assert_eq!(report, FanOutReport::default());
    }

    #[tokio::test]
    async fn self_follow_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        store.create_message(&a1, content("hello")).await.unwrap();
        let context = context_for(Repositories::from_backend(store.clone()), Config::default());

        let report = backfill(&context, &a1, &a1).await.unwrap();
        assert_eq!(report, FanOutReport::default());
        assert!(timeline_ids(&store, &a1).await.is_empty());

        // A self-edge that slipped into the store is ignored on delivery, too
        store.create_follow(&a1, &a1).await.unwrap();
        let m = store.create_message(&a1, content("again")).await.unwrap();
        let report = deliver_message(&context, &m).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(timeline_ids(&store, &a1).await.is_empty());
    }

    #[tokio::test]
    async fn partial_failure_is_contained() {
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        for u in ["U1", "U2", "U3", "U4"] {
            store.create_follow(&uid(u), &a1).await.unwrap();
        }
        let repos = Repositories {
            messages: store.clone(),
            follows: store.clone(),
            timelines: Arc::new(Flaky {
                inner: store.clone(),
                failing: HashSet::from([uid("U2")]),
                stalling: HashSet::from([uid("U3")]),
            }),
        };
        let context = context_for(
            repos,
            Config {
                store_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let m = store.create_message(&a1, content("hello")).await.unwrap();

        let report = deliver_message(&context, &m).await.unwrap();
        assert_eq!(
            report,
            FanOutReport {
                attempted: 4,
                written: 2,
                failed: 2
            }
        );
        assert_eq!(timeline_ids(&store, &uid("U1")).await, vec![m.id()]);
        assert!(timeline_ids(&store, &uid("U2")).await.is_empty());
        assert!(timeline_ids(&store, &uid("U3")).await.is_empty());
        assert_eq!(timeline_ids(&store, &uid("U4")).await, vec![m.id()]);
        let stats = context.stats.snapshot();
        assert_eq!(stats.entries_failed, 2);
        assert_eq!(stats.entries_written, 2);
    }

    #[tokio::test]
    async fn dispatcher_end_to_end() {
        // A1 has followers U1 & U2, posts "hello"; U3 then follows A1 & gets it via backfill
        let store = Arc::new(MemoryStore::new());
        let (a1, u1, u2, u3) = (uid("A1"), uid("U1"), uid("U2"), uid("U3"));
        store.create_follow(&u1, &a1).await.unwrap();
        store.create_follow(&u2, &a1).await.unwrap();

        let context = context_for(
            Repositories::from_backend(store.clone()),
            Config {
                backfill_window: 10,
                ..Default::default()
            },
        );
        let (dispatcher, processor) = Dispatcher::new(context);

        let m1 = Message::with_timestamp(&a1, content("hello"), Utc.timestamp_opt(100, 0).unwrap());
        store.put_message(&m1).await.unwrap();
        dispatcher.on_message_created(m1.clone());

        store.create_follow(&u3, &a1).await.unwrap();
        dispatcher.on_follow_created(u3.clone(), a1.clone());
        // Both triggers can race for U3 if fan-out for m1 sees the new edge; either way, one row
        dispatcher.on_message_created(m1.clone());

        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        for owner in [&u1, &u2, &u3] {
            let entries = store.recent_for_owner(owner, 10).await.unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].message_id(), m1.id());
            assert_eq!(entries[0].author_id(), &a1);
            assert_eq!(entries[0].content().as_ref(), "hello");
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.backfills, 1);
        assert_eq!(stats.tasks_rejected, 0);
    }

    #[tokio::test]
    async fn dispatcher_ignores_self_follow() {
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        store.create_message(&a1, content("hello")).await.unwrap();
        let (dispatcher, processor) = Dispatcher::new(context_for(
            Repositories::from_backend(store.clone()),
            Config::default(),
        ));
        dispatcher.on_follow_created(a1.clone(), a1.clone());
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(dispatcher.stats().backfills, 0);
        assert!(timeline_ids(&store, &a1).await.is_empty());
    }

    #[tokio::test]
    async fn dispatcher_counts_rejections() {
        let store = Arc::new(MemoryStore::new());
        let (dispatcher, processor) = Dispatcher::new(context_for(
            Repositories::from_backend(store.clone()),
            Config {
                processor: background_tasks::Config {
                    queue_depth: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
        ));
        let a1 = uid("A1");
        // Nothing yields between these, so the processor can't pick anything up
        for i in 0..3 {
            dispatcher.on_message_created(Message::new(&a1, content(&format!("m{i}"))));
        }
        assert_eq!(dispatcher.stats().tasks_rejected, 2);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(dispatcher.stats().deliveries, 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_write_one_row() {
        let store = Arc::new(MemoryStore::new());
        let (a1, f) = (uid("A1"), uid("F"));
        let context = context_for(Repositories::from_backend(store.clone()), Config::default());

        // The edge commits & the message commits; both triggers then run concurrently & both see
        // everything
        store.create_follow(&f, &a1).await.unwrap();
        let m = store.create_message(&a1, content("hello")).await.unwrap();
        let (delivered, backfilled) =
            tokio::join!(deliver_message(&context, &m), backfill(&context, &f, &a1));
        assert_eq!(delivered.unwrap().written, 1);
        assert_eq!(backfilled.unwrap().written, 1);

        assert_eq!(timeline_ids(&store, &f).await, vec![m.id()]);
        assert_eq!(store.timeline_len(&f).await, 1);
    }

    #[tokio::test]
    async fn follow_post_race_can_miss() {
        // F follows A1; the backfill runs before A1 has posted anything. A1 then posts m, but the
        // delivery reads a follower index that hasn't caught-up with F's edge. F never gets m.
        let store = Arc::new(MemoryStore::new());
        let (a1, f) = (uid("A1"), uid("F"));
        let follows = Arc::new(Lagging {
            inner: store.clone(),
            hidden: Mutex::new(HashSet::new()),
        });
        let context = context_for(
            Repositories {
                messages: store.clone(),
                follows: follows.clone(),
                timelines: store.clone(),
            },
            Config::default(),
        );

        follows.hidden.lock().unwrap().insert(f.clone());
        follows.create_follow(&f, &a1).await.unwrap();
        assert_eq!(backfill(&context, &f, &a1).await.unwrap().attempted, 0);

        let m = store.create_message(&a1, content("hello")).await.unwrap();
        assert_eq!(deliver_message(&context, &m).await.unwrap().attempted, 0);
        assert!(timeline_ids(&store, &f).await.is_empty());

        // Once the index catches-up, the next message gets through; m stays missing
        follows.hidden.lock().unwrap().clear();
        let m2 = store.create_message(&a1, content("again")).await.unwrap();
        deliver_message(&context, &m2).await.unwrap();
        assert_eq!(timeline_ids(&store, &f).await, vec![m2.id()]);
    }

    #[tokio::test]
    async fn long_deliveries_outlast_the_task_timeout() {
        // One hundred writes at 10ms apiece, one at a time, take far longer than `task-timeout`
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        let followers: Vec<UserId> = (0..100).map(|i| uid(&format!("U{i}"))).collect();
        for f in &followers {
            store.create_follow(f, &a1).await.unwrap();
        }
        let context = context_for(
            Repositories {
                messages: store.clone(),
                follows: store.clone(),
                timelines: Arc::new(Sluggish {
                    inner: store.clone(),
                    delay: Duration::from_millis(10),
                }),
            },
            Config {
                write_concurrency: 1,
                processor: background_tasks::Config {
                    default_timeout: Duration::from_millis(100),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let (dispatcher, processor) = Dispatcher::new(context);
        let m = store.create_message(&a1, content("hello")).await.unwrap();
        dispatcher.on_message_created(m.clone());
        processor.shutdown(Duration::from_secs(10)).await.unwrap();

        for f in &followers {
            assert_eq!(timeline_ids(&store, f).await, vec![m.id()]);
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.entries_written, 100);
        assert_eq!(stats.entries_failed, 0);
    }

    #[tokio::test]
    async fn dropped_batches_still_account_for_their_writes() {
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        let followers: Vec<UserId> = (0..100).map(|i| uid(&format!("U{i}"))).collect();
        for f in &followers {
            store.create_follow(f, &a1).await.unwrap();
        }
        let context = context_for(
            Repositories {
                messages: store.clone(),
                follows: store.clone(),
                timelines: Arc::new(Sluggish {
                    inner: store.clone(),
                    delay: Duration::from_millis(20),
                }),
            },
            Config {
                write_concurrency: 1,
                ..Default::default()
            },
        );
        let m = store.create_message(&a1, content("hello")).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(150), deliver_message(&context, &m))
                .await
                .is_err()
        );

        let mut rows = 0;
        for f in &followers {
            rows += store.timeline_len(f).await as u64;
        }
        let written = context.stats.snapshot().entries_written;
        assert!(written > 0);
        assert!(written < 100);
        assert!(rows >= written && rows - written <= 1);
    }

    #[tokio::test]
    async fn follower_lookups_are_bounded_per_page() {
        // Ten pages at 30ms apiece; each is well inside `store-timeout`, the whole is not
        let store = Arc::new(MemoryStore::new());
        let a1 = uid("A1");
        let followers: Vec<UserId> = (0..100).map(|i| uid(&format!("U{i}"))).collect();
        let follows = Arc::new(SlowPages {
            followers: followers.clone(),
            delay: Duration::from_millis(30),
            seen: Mutex::new(None),
        });
        let store_timeout = Duration::from_millis(100);
        let context = context_for(
            Repositories {
                messages: store.clone(),
                follows: follows.clone(),
                timelines: store.clone(),
            },
            Config {
                store_timeout,
                ..Default::default()
            },
        );
        let m = store.create_message(&a1, content("hello")).await.unwrap();

        let report = deliver_message(&context, &m).await.unwrap();
        assert_eq!(report.written, 100);
        assert_eq!(*follows.seen.lock().unwrap(), Some(store_timeout));
        for f in &followers {
            assert_eq!(timeline_ids(&store, f).await, vec![m.id()]);
        }

        // A single page that stalls past the bound still fails the lookup
        let stalled = Arc::new(SlowPages {
            followers,
            delay: Duration::from_millis(300),
            seen: Mutex::new(None),
        });
        let context = context_for(
            Repositories {
                messages: store.clone(),
                follows: stalled,
                timelines: store.clone(),
            },
            Config {
                store_timeout,
                ..Default::default()
            },
        );
        assert!(matches!(
            deliver_message(&context, &m).await,
            Err(Error::Followers { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_follow_graph_is_reported() {
        struct Down;
        #[async_trait]
        impl FollowRepository for Down {
            async fn put_follow(
                &self,
                _: &crate::entities::FollowEdge,
            ) -> storage::Result<()> {
                Err(storage::Error::unavailable(std::io::Error::other("down")))
            }
            async fn followers_of(
                &self,
                _: &UserId,
                _: Option<Duration>,
            ) -> storage::Result<HashSet<UserId>> {
                Err(storage::Error::unavailable(std::io::Error::other("down")))
            }
            async fn following(&self, _: &UserId) -> storage::Result<HashSet<UserId>> {
                Err(storage::Error::unavailable(std::io::Error::other("down")))
            }
        }
        let store = Arc::new(MemoryStore::new());
        let context = context_for(
            Repositories {
                messages: store.clone(),
                follows: Arc::new(Down),
                timelines: store.clone(),
            },
            Config::default(),
        );
        let m = Message::new(&uid("A1"), content("hello"));
        assert!(matches!(
            deliver_message(&context, &m).await,
            Err(Error::Followers { .. })
        ));
        assert_eq!(context.stats.snapshot().lookups_failed, 1);
    }
}
