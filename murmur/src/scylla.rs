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

//! # scylla
//!
//! [Storage] implementation for ScyllaDB.
//!
//! [Storage]: crate::storage
//!
//! All tables live in the `murmur` keyspace:
//!
//! - `messages`: partitioned by author, clustered newest-first on `(created_at, id)`
//! - `follows`: partitioned by follower, clustered on the followed user
//! - `followers`: the same edges, partitioned the other way; CQL has no cheap reverse lookup, so we
//!   write both
//! - `timeline`: partitioned by owner, clustered newest-first on `(created_at, message_id)`
//!
//! Since a timeline row's clustering key is derived solely from the message, an `INSERT` of the
//! same (owner, message) lands on the same row; CQL inserts are upserts, so that's all the
//! idempotency we need.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use enum_map::{Enum, EnumMap};
use futures::{stream, StreamExt, TryStreamExt};
use itertools::Itertools;
use scylla::{prepared_statement::PreparedStatement, SessionBuilder};
use secrecy::ExposeSecret;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tap::Pipe;
use tracing::{debug, info};

use crate::{
    entities::{FollowEdge, Message, TimelineEntry, UserId},
    storage::{self, FollowRepository, MessageRepository, TimelineRepository},
    util::Credentials,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("On conversion, {count} was too large to be converted to an i32: {source}"))]
    CountOOR {
        count: usize,
        source: std::num::TryFromIntError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::transport::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Schema statement {stmt} failed: {source}"))]
    Schema {
        stmt: String,
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

pub const KEYSPACE: &str = "murmur";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  murmur ScyllaDB session type                                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The set of prepared statements used by murmur
///
/// Serves both as a mnemonic tag for each statement & as the key type of the [EnumMap] holding
/// them.
#[derive(Clone, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertMessage,
    RecentMessages,
    InsertFollow,
    InsertFollower,
    SelectFollowing,
    SelectFollowers,
    UpsertTimeline,
    RecentTimeline,
}

/// Statements in the same order as [PreparedStatements]
const STATEMENTS: [&str; 8] = [
    "insert into messages (author_id,created_at,id,content) values (?,?,?,?)",
    "select id,author_id,content,created_at from messages where author_id=? limit ?",
    "insert into follows (follower_id,following_id,created_at) values (?,?,?) if not exists",
    "insert into followers (following_id,follower_id,created_at) values (?,?,?) if not exists",
    "select following_id from follows where follower_id=?",
    "select follower_id from followers where following_id=?",
    "insert into timeline (owner_id,created_at,message_id,author_id,content) values (?,?,?,?,?)",
    "select message_id,owner_id,author_id,content,created_at from timeline where owner_id=? limit ?",
];

/// DDL for the murmur keyspace; `{replication}` is replaced with the replication factor
const SCHEMA: [&str; 5] = [
    "create keyspace if not exists murmur with replication = {'class': 'NetworkTopologyStrategy', 'replication_factor': {replication}}",
    "create table if not exists murmur.messages (author_id text, created_at timestamp, id uuid, content text, primary key ((author_id), created_at, id)) with clustering order by (created_at desc, id desc)",
    "create table if not exists murmur.follows (follower_id text, following_id text, created_at timestamp, primary key ((follower_id), following_id))",
    "create table if not exists murmur.followers (following_id text, follower_id text, created_at timestamp, primary key ((following_id), follower_id))",
    "create table if not exists murmur.timeline (owner_id text, created_at timestamp, message_id uuid, author_id text, content text, primary key ((owner_id), created_at, message_id)) with clustering order by (created_at desc, message_id desc)",
];

async fn connect(
    hosts: &[String],
    credentials: &Option<Credentials>,
) -> Result<::scylla::Session> {
    let mut builder = SessionBuilder::new().known_nodes(hosts);
    if let Some(Credentials((user, pass))) = credentials {
        builder = builder.user(user.expose_secret(), pass.expose_secret())
    }
    builder.build().await.context(NewSessionSnafu)
}

/// Create the murmur keyspace & tables, if they're not already there
pub async fn create_schema(
    hosts: &[String],
    credentials: &Option<Credentials>,
    replication: u32,
) -> Result<()> {
    let scylla = connect(hosts, credentials).await?;
    for stmt in SCHEMA {
        let stmt = stmt.replace("{replication}", &replication.to_string());
        scylla
            .query_unpaged(stmt.as_str(), ())
            .await
            .context(SchemaSnafu { stmt: stmt.clone() })?;
    }
    info!("Schema in place on {}", hosts.iter().join(","));
    Ok(())
}

/// `murmur`-specific ScyllaDB Session type
pub struct Session {
    session: ::scylla::Session,
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
}

impl Session {
    async fn prepare(scylla: &::scylla::Session, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    /// Connect to `hosts` (which must parse as socket addresses) & prepare our statements
    pub async fn new(hosts: &[String], credentials: &Option<Credentials>) -> Result<Session> {
        let scylla = connect(hosts, credentials).await?;
        scylla
            .use_keyspace(KEYSPACE, false)
            .await
            .context(KeyspaceSnafu)?;

        let prepared_statements = stream::iter(STATEMENTS)
            .then(|s| async { Self::prepare(&scylla, s).await })
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<PreparedStatement>>>()?;
        let prepared_statements: [PreparedStatement; 8] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        debug!("Connected to ScyllaDB at {}", hosts.iter().join(","));
        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
        })
    }

    /// Stream every row of a single-column query over `user`, paging as we go
    ///
    /// The driver does the paging; `page_timeout` bounds each wait on it.
    async fn user_ids(
        &self,
        which: PreparedStatements,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> storage::Result<HashSet<UserId>> {
        let mut rows = storage::bounded(page_timeout, async {
            self.session
                .execute_iter(self.prepared_statements[which].clone(), (user,))
                .await
                .map_err(storage::Error::unavailable)
        })
        .await?
        .rows_stream::<(UserId,)>()
        .map_err(storage::Error::serialization)?;
        let mut result = HashSet::new();
        while let Some((id,)) = storage::bounded(page_timeout, async {
            rows.try_next().await.map_err(storage::Error::unavailable)
        })
        .await?
        {
            result.insert(id);
        }
        Ok(result)
    }
}

fn row_limit(limit: usize) -> storage::Result<i32> {
    i32::try_from(limit).map_err(|err| {
        CountOORSnafu { count: limit }
            .into_error(err)
            .pipe(storage::Error::serialization)
    })
}

#[async_trait]
impl MessageRepository for Session {
    async fn put_message(&self, message: &Message) -> storage::Result<()> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertMessage],
                (
                    message.author_id(),
                    message.created_at(),
                    message.id(),
                    message.content(),
                ),
            )
            .await
            .map_err(storage::Error::unavailable)?;
        Ok(())
    }
    async fn recent_by_author(
        &self,
        author: &UserId,
        limit: usize,
    ) -> storage::Result<Vec<Message>> {
        // CQL refuses `limit 0`
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::RecentMessages],
                (author, row_limit(limit)?),
            )
            .await
            .map_err(storage::Error::unavailable)?
            .into_rows_result()
            .map_err(storage::Error::serialization)?
            .rows::<Message>()
            .map_err(storage::Error::serialization)?
            .collect::<std::result::Result<Vec<Message>, _>>()
            .map_err(storage::Error::serialization)
    }
}

#[async_trait]
impl FollowRepository for Session {
    async fn put_follow(&self, edge: &FollowEdge) -> storage::Result<()> {
        // `if not exists` keeps the original `created_at` should the edge already be there. The
        // two writes aren't atomic; the reverse table is written second, so a failure between them
        // leaves an edge the fan-out can't see, just as a lagging index would.
        for (stmt, (a, b)) in [
            (
                PreparedStatements::InsertFollow,
                (edge.follower_id(), edge.following_id()),
            ),
            (
                PreparedStatements::InsertFollower,
                (edge.following_id(), edge.follower_id()),
            ),
        ] {
            self.session
                .execute_unpaged(&self.prepared_statements[stmt], (a, b, edge.created_at()))
                .await
                .map_err(storage::Error::unavailable)?;
        }
        Ok(())
    }
    async fn followers_of(
        &self,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> storage::Result<HashSet<UserId>> {
        self.user_ids(PreparedStatements::SelectFollowers, user, page_timeout)
            .await
    }
    async fn following(&self, user: &UserId) -> storage::Result<HashSet<UserId>> {
        self.user_ids(PreparedStatements::SelectFollowing, user, None)
            .await
    }
}

#[async_trait]
impl TimelineRepository for Session {
    async fn upsert_entry(&self, entry: &TimelineEntry) -> storage::Result<()> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::UpsertTimeline],
                (
                    entry.owner_id(),
                    entry.created_at(),
                    entry.message_id(),
                    entry.author_id(),
                    entry.content(),
                ),
            )
            .await
            .map_err(storage::Error::unavailable)?;
        Ok(())
    }
    async fn recent_for_owner(
        &self,
        owner: &UserId,
        limit: usize,
    ) -> storage::Result<Vec<TimelineEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::RecentTimeline],
                (owner, row_limit(limit)?),
            )
            .await
            .map_err(storage::Error::unavailable)?
            .into_rows_result()
            .map_err(storage::Error::serialization)?
            .rows::<TimelineEntry>()
            .map_err(storage::Error::serialization)?
            .collect::<std::result::Result<Vec<TimelineEntry>, _>>()
            .map_err(storage::Error::serialization)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statements_line_up() {
        assert_eq!(STATEMENTS.len(), PreparedStatements::LENGTH);
        assert!(STATEMENTS[PreparedStatements::InsertFollow.into_usize()].ends_with("if not exists"));
        assert!(STATEMENTS[PreparedStatements::RecentTimeline.into_usize()].contains("from timeline"));
        assert!(SCHEMA.iter().skip(1).all(|s| s.contains("murmur.")));
    }

    #[test]
    fn limits() {
        assert_eq!(row_limit(20).unwrap(), 20);
        assert!(row_limit(usize::MAX).is_err());
    }
}
