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

//! # storage
//!
//! Abstractions for the murmur storage layer.
//!
//! There are three repositories, one per table: messages, follow edges & timeline entries. Each is
//! an object-safe trait so that the rest of murmur can hold them as `Arc<dyn ... + Send + Sync>`
//! without caring whether they're backed by ScyllaDB, DynamoDB, or a hash map. A backend
//! implementing all three is a [Backend].
//!
//! None of these operations are transactional across rows; the only atomicity anyone relies upon
//! is that of a single-row write.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

use crate::entities::{Content, FollowEdge, Message, TimelineEntry, UserId};

/// Failure modes of a storage operation
///
/// Backends convert their native errors into one of these three buckets; callers decide how to
/// proceed from the bucket alone. Note that "not found" is not among them: a range query that
/// matches nothing is simply an empty result.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The store couldn't be reached, or refused the request; transient
    #[snafu(display("The store is unavailable: {source}"))]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    /// A row couldn't be encoded or decoded; retrying won't help
    #[snafu(display("Malformed row: {source}"))]
    Serialization {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    /// The store didn't answer within its bound; transient
    #[snafu(display("The store failed to respond within {bound:?}"))]
    Timeout {
        bound: Duration,
        backtrace: Backtrace,
    },
}

/// Discriminant-only view of [Error]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    StoreUnavailable,
    Serialization,
    Timeout,
}

impl Error {
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Unavailable {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn serialization(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Serialization {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn timeout(bound: Duration) -> Error {
        Error::Timeout {
            bound,
            backtrace: Backtrace::capture(),
        }
    }
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unavailable { .. } => ErrorKind::StoreUnavailable,
            Error::Serialization { .. } => ErrorKind::Serialization,
            Error::Timeout { .. } => ErrorKind::Timeout,
        }
    }
    /// True if the same call might succeed later
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Serialization)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Run `f` under `timeout`, if there is one, mapping expiry to [Error::Timeout]
pub async fn bounded<T>(
    timeout: Option<Duration>,
    f: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(bound) => tokio::time::timeout(bound, f)
            .await
            .unwrap_or_else(|_| Err(Error::timeout(bound))),
        None => f.await,
    }
}

/// Persistence for [Message]s, keyed by author
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Write `message`; re-writing the same message is harmless
    async fn put_message(&self, message: &Message) -> Result<()>;
    /// Up to `limit` of `author`'s messages, newest first
    async fn recent_by_author(&self, author: &UserId, limit: usize) -> Result<Vec<Message>>;
    /// Mint a new [Message] (fresh id, current time) and persist it
    async fn create_message(&self, author: &UserId, content: Content) -> Result<Message> {
        let message = Message::new(author, content);
        self.put_message(&message).await?;
        Ok(message)
    }
}

/// Persistence for the follow graph
///
/// Both the forward ("who does X follow") and reverse ("who follows X") lookups must page through
/// the store internally; a caller asking after a user with a million followers gets a million
/// followers.
#[async_trait]
pub trait FollowRepository: Send + Sync {
    /// Write `edge` by its natural key; writing an edge that's already there is not an error
    async fn put_follow(&self, edge: &FollowEdge) -> Result<()>;
    /// Everyone following `user`
    ///
    /// `page_timeout` bounds each round-trip to the store, not the scan as a whole, so that a
    /// large follower set can't time itself out.
    async fn followers_of(
        &self,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> Result<HashSet<UserId>>;
    /// Everyone `user` follows
    async fn following(&self, user: &UserId) -> Result<HashSet<UserId>>;
    async fn create_follow(&self, follower: &UserId, following: &UserId) -> Result<FollowEdge> {
        let edge = FollowEdge::new(follower, following);
        self.put_follow(&edge).await?;
        Ok(edge)
    }
}

/// Persistence for the denormalized, per-viewer home timelines
#[async_trait]
pub trait TimelineRepository: Send + Sync {
    /// Write `entry`, keyed on (owner, message id); a second write of the same key overwrites the
    /// first
    async fn upsert_entry(&self, entry: &TimelineEntry) -> Result<()>;
    /// Up to `limit` of the entries on `owner`'s timeline, newest first
    async fn recent_for_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<TimelineEntry>>;
}

/// A store implementing all three repositories
pub trait Backend: MessageRepository + FollowRepository + TimelineRepository {}

impl<T> Backend for T where T: MessageRepository + FollowRepository + TimelineRepository {}

/// The three repositories, bundled
///
/// They needn't share a backend; the fan-out tests, for instance, wrap only the timeline
/// repository in a fault-injecting layer.
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<dyn MessageRepository>,
    pub follows: Arc<dyn FollowRepository>,
    pub timelines: Arc<dyn TimelineRepository>,
}

impl Repositories {
    /// Serve all three repositories from a single `backend`
    pub fn from_backend<B: Backend + 'static>(backend: Arc<B>) -> Repositories {
        Repositories {
            messages: backend.clone(),
            follows: backend.clone(),
            timelines: backend,
        }
    }
}
