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

//! # feed
//!
//! The murmur service proper: validate the request, commit the authoritative write, then hand
//! off to the [Dispatcher]. Errors in the first two steps go back to the caller; whatever happens
//! in the third doesn't.

use std::{sync::Arc, time::Instant};

use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info};

use crate::{
    counter_add,
    entities::{self, Content, FollowEdge, Message, TimelineEntry, UserId},
    fan_out::Dispatcher,
    histogram_record,
    metrics::{self, Instruments, Sort},
    storage::{self, Repositories},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    BadUserId { source: entities::Error },
    #[snafu(display("Content is required"))]
    NoContent { source: entities::Error },
    #[snafu(display("Content too long"))]
    ContentTooLong { source: entities::Error },
    #[snafu(display("Cannot follow yourself"))]
    SelfFollow { user: UserId, backtrace: Backtrace },
    #[snafu(display("Storage error: {source}"))]
    Store { source: storage::Error },
}

impl Error {
    /// True if the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Error::Store { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Request limits
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Page size when the caller doesn't ask for one (or asks for nonsense)
    #[serde(rename = "default-limit")]
    pub default_limit: usize,
    /// Largest page size a caller may ask for
    #[serde(rename = "max-limit")]
    pub max_limit: usize,
    /// Longest message accepted, in grapheme clusters
    #[serde(rename = "max-message-length")]
    pub max_message_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            default_limit: 20,
            max_limit: 100,
            max_message_length: entities::DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

impl Limits {
    /// Resolve a caller-supplied page size
    ///
    /// Absent, unparsable & non-positive values get the default; anything over the maximum is
    /// clamped to it.
    pub fn page_size(&self, requested: Option<&str>) -> usize {
        match requested.and_then(|s| s.trim().parse::<i64>().ok()) {
            Some(n) if n > 0 => (n as u64).min(self.max_limit as u64) as usize,
            _ => self.default_limit.min(self.max_limit),
        }
    }
}

inventory::submit! { metrics::Registration::new("feed.messages.posted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feed.messages.rejected", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feed.follows.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feed.follows.rejected", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feed.timelines.served", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feed.store.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feed.messages.post.duration", Sort::Histogram) }
inventory::submit! { metrics::Registration::new("feed.messages.read.duration", Sort::Histogram) }
inventory::submit! { metrics::Registration::new("feed.messages.read.count", Sort::Histogram) }
inventory::submit! { metrics::Registration::new("feed.follows.duration", Sort::Histogram) }
inventory::submit! { metrics::Registration::new("feed.timelines.duration", Sort::Histogram) }
inventory::submit! { metrics::Registration::new("feed.timelines.count", Sort::Histogram) }

pub struct Feed {
    repos: Repositories,
    dispatcher: Dispatcher,
    limits: Limits,
    instruments: Arc<Instruments>,
}

impl Feed {
    pub fn new(
        repos: Repositories,
        dispatcher: Dispatcher,
        limits: Limits,
        instruments: Arc<Instruments>,
    ) -> Feed {
        Feed {
            repos,
            dispatcher,
            limits,
            instruments,
        }
    }
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
    pub fn limits(&self) -> &Limits {
        &self.limits
    }
    fn store_failure(&self, err: storage::Error) -> Error {
        counter_add!(self.instruments, "feed.store.failures", 1, &[]);
        Error::Store { source: err }
    }
    fn elapsed(&self, name: &str, start: Instant) {
        histogram_record!(self.instruments, name, start.elapsed().as_secs_f64(), &[]);
    }
    /// Post `text` on behalf of `author`
    ///
    /// On success the message is durable; delivery to followers is under way, but not done.
    pub async fn post_message(&self, author: &UserId, text: &str) -> Result<Message> {
        let start = Instant::now();
        let result = self.do_post_message(author, text).await;
        self.elapsed("feed.messages.post.duration", start);
        result
    }
    async fn do_post_message(&self, author: &UserId, text: &str) -> Result<Message> {
        let content =
            Content::new(text, self.limits.max_message_length).map_err(|err| {
                counter_add!(self.instruments, "feed.messages.rejected", 1, &[]);
                match err {
                    entities::Error::EmptyContent { .. } => Error::NoContent { source: err },
                    _ => Error::ContentTooLong { source: err },
                }
            })?;
        let message = self
            .repos
            .messages
            .create_message(author, content)
            .await
            .map_err(|err| self.store_failure(err))?;
        counter_add!(self.instruments, "feed.messages.posted", 1, &[]);
        debug!("{} posted {}", author, message.id());
        self.dispatcher.on_message_created(message.clone());
        Ok(message)
    }
    /// Record that `follower` follows `following`
    pub async fn follow(&self, follower: &UserId, following: &str) -> Result<FollowEdge> {
        let start = Instant::now();
        let result = self.do_follow(follower, following).await;
        self.elapsed("feed.follows.duration", start);
        result
    }
    async fn do_follow(&self, follower: &UserId, following: &str) -> Result<FollowEdge> {
        let following = UserId::new(following)
            .context(BadUserIdSnafu)
            .inspect_err(|_| {
                counter_add!(self.instruments, "feed.follows.rejected", 1, &[]);
            })?;
        if *follower == following {
            counter_add!(self.instruments, "feed.follows.rejected", 1, &[]);
            return SelfFollowSnafu { user: following }.fail();
        }
        let edge = self
            .repos
            .follows
            .create_follow(follower, &following)
            .await
            .map_err(|err| self.store_failure(err))?;
        counter_add!(self.instruments, "feed.follows.created", 1, &[]);
        info!("{} now follows {}", follower, following);
        self.dispatcher
            .on_follow_created(follower.clone(), following);
        Ok(edge)
    }
    /// `owner`'s home timeline, newest first
    pub async fn timeline(&self, owner: &UserId, limit: usize) -> Result<Vec<TimelineEntry>> {
        let start = Instant::now();
        let result = self
            .repos
            .timelines
            .recent_for_owner(owner, limit)
            .await;
        self.elapsed("feed.timelines.duration", start);
        let entries = result.map_err(|err| self.store_failure(err))?;
        counter_add!(self.instruments, "feed.timelines.served", 1, &[]);
        histogram_record!(self.instruments, "feed.timelines.count", entries.len() as f64, &[]);
        Ok(entries)
    }
    /// `author`'s own messages, newest first
    pub async fn messages_by(&self, author: &UserId, limit: usize) -> Result<Vec<Message>> {
        let start = Instant::now();
        let result = self.repos.messages.recent_by_author(author, limit).await;
        self.elapsed("feed.messages.read.duration", start);
        let messages = result.map_err(|err| self.store_failure(err))?;
        histogram_record!(self.instruments, "feed.messages.read.count", messages.len() as f64, &[]);
        Ok(messages)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{collections::HashSet, time::Duration};

    use crate::{
        background_tasks::Processor,
        fan_out::{self, Context},
        memory::MemoryStore,
        storage::FollowRepository,
    };

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn feed(store: Arc<MemoryStore>, limits: Limits) -> (Feed, Processor) {
        let instruments = Arc::new(Instruments::new("murmur"));
        let repos = Repositories::from_backend(store);
        let (dispatcher, processor) = Dispatcher::new(Context::new(
            repos.clone(),
            fan_out::Config::default(),
            instruments.clone(),
        ));
        (Feed::new(repos, dispatcher, limits, instruments), processor)
    }

    #[test]
    fn page_sizes() {
        let limits = Limits::default();
        assert_eq!(limits.page_size(None), 20);
        assert_eq!(limits.page_size(Some("5")), 5);
        assert_eq!(limits.page_size(Some("0")), 20);
        assert_eq!(limits.page_size(Some("-3")), 20);
        assert_eq!(limits.page_size(Some("lots")), 20);
        assert_eq!(limits.page_size(Some("1000")), 100);
    }

    #[tokio::test]
    async fn post_validates() {
        let store = Arc::new(MemoryStore::new());
        let (feed, processor) = feed(
            store.clone(),
            Limits {
                max_message_length: 5,
                ..Default::default()
            },
        );
        let a1 = uid("A1");
        let err = feed.post_message(&a1, "  ").await.unwrap_err();
        assert!(matches!(err, Error::NoContent { .. }));
        assert_eq!(err.to_string(), "Content is required");
        let err = feed.post_message(&a1, "too long").await.unwrap_err();
        assert!(matches!(err, Error::ContentTooLong { .. }));
        assert_eq!(err.to_string(), "Content too long");
        assert!(err.is_client_error());
        let m = feed.post_message(&a1, "short").await.unwrap();
        assert_eq!(feed.messages_by(&a1, 10).await.unwrap(), vec![m]);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn follow_then_read() {
        let store = Arc::new(MemoryStore::new());
        let (feed, processor) = feed(store.clone(), Limits::default());
        let (a1, u1) = (uid("A1"), uid("U1"));

        let early = feed.post_message(&a1, "before").await.unwrap();
        assert!(matches!(
            feed.follow(&u1, "U1").await,
            Err(Error::SelfFollow { .. })
        ));
        assert!(matches!(
            feed.follow(&u1, "").await,
            Err(Error::BadUserId { .. })
        ));
        let edge = feed.follow(&u1, "A1").await.unwrap();
        assert_eq!(edge.following_id(), &a1);
        assert_eq!(
            store.following(&u1).await.unwrap(),
            HashSet::from([a1.clone()])
        );
        assert_eq!(
            store.followers_of(&a1, None).await.unwrap(),
            HashSet::from([u1.clone()])
        );

        // Let the backfill land before posting again, so delivery sees the edge
        tokio::time::sleep(Duration::from_millis(100)).await;
        let late = feed.post_message(&a1, "after").await.unwrap();
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        let ids: Vec<_> = feed
            .timeline(&u1, 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.message_id())
            .collect();
        assert_eq!(ids, vec![late.id(), early.id()]);
        assert!(feed.timeline(&a1, 10).await.unwrap().is_empty());
    }
}
