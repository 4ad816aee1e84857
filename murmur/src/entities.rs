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

//! # murmur entities
//!
//! ## Introduction
//!
//! The handful of types everything else in murmur is built on: users (well, their identifiers),
//! messages, follow edges, and the denormalized timeline rows the fan-out engine produces.
//!
//! [Message]s and [FollowEdge]s are *authoritative*: they're written synchronously on behalf of a
//! request. [TimelineEntry]s are *derived*: each one records the fact that its owner followed the
//! message's author at some point at-or-before the message was posted. None of these are ever
//! updated once written.

use std::{cmp::Ordering, fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use scylla::{
    deserialize::{DeserializationError, DeserializeValue, FrameSlice, TypeCheckError},
    frame::response::result::ColumnType,
    serialize::{
        value::SerializeValue,
        writers::{CellWriter, WrittenCellProof},
        SerializationError,
    },
    DeserializeRow,
};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Message content may not be empty"))]
    EmptyContent { backtrace: Backtrace },
    #[snafu(display("Message content is {len} characters long; the maximum is {max}"))]
    ContentTooLong {
        len: usize,
        max: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("{text:?} is not a valid user id"))]
    BadUserId { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_de_err(err: impl std::error::Error + Send + Sync + 'static) -> DeserializationError {
    DeserializationError::new(err)
}

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare a newtype around [Uuid] to serve as an opaque identifier
///
/// We're on a NoSQL store with no auto-increment column, so identifiers are assigned here. The
/// generated type implements [Display] (hyphenated, which is also what `serde` produces) as well as
/// the ScyllaDB [DeserializeValue] & [SerializeValue] traits.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
        // The derive macros don't handle newtype structs.
        impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for $type_name {
            fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
                Uuid::type_check(typ)
            }
            fn deserialize(
                typ: &'metadata ColumnType<'metadata>,
                v: Option<FrameSlice<'frame>>,
            ) -> StdResult<Self, DeserializationError> {
                Ok(Self(<Uuid as DeserializeValue>::deserialize(typ, v)?))
            }
        }
        impl SerializeValue for $type_name {
            fn serialize<'b>(
                &self,
                typ: &ColumnType<'_>,
                writer: CellWriter<'b>,
            ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
                SerializeValue::serialize(&self.0, typ, writer)
            }
        }
    };
}

define_id!(MessageId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             UserId                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

const MAX_USER_ID_LENGTH: usize = 128;

fn check_user_id(s: &str) -> bool {
    !s.is_empty()
        && s.chars().count() <= MAX_USER_ID_LENGTH
        && !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// A refined type identifying a murmur user
///
/// User management lives elsewhere; as far as murmur is concerned a user is just an opaque,
/// non-empty string of at most 128 characters containing neither whitespace nor control
/// characters.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Construct a [UserId] by copying from a `&str`; to move a [String] in, use [TryFrom].
    pub fn new(text: &str) -> Result<UserId> {
        check_user_id(text)
            .then(|| UserId(text.to_owned()))
            .context(BadUserIdSnafu {
                text: text.to_owned(),
            })
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for UserId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// By hand, so that deserializing an illegal id fails
impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        UserId::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for UserId {
    fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
        String::type_check(typ)
    }
    fn deserialize(
        typ: &'metadata ColumnType<'metadata>,
        v: Option<FrameSlice<'frame>>,
    ) -> StdResult<Self, DeserializationError> {
        UserId::try_from(<String as DeserializeValue>::deserialize(typ, v)?).map_err(mk_de_err)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        UserId::new(s)
    }
}

impl SerializeValue for UserId {
    fn serialize<'b>(
        &self,
        typ: &ColumnType<'_>,
        writer: CellWriter<'b>,
    ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
        SerializeValue::serialize(&self.0, typ, writer)
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if check_user_id(&text) {
            Ok(UserId(text))
        } else {
            BadUserIdSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Content                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Default upper bound on message length, in grapheme clusters
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 280;

/// The text of a message
///
/// Length is measured in extended grapheme clusters, not bytes, so that a post full of emoji isn't
/// penalized for its encoding.
///
/// Unlike [UserId], [Deserialize] is derived: the maximum length is a matter of configuration, and
/// rows written under a more generous configuration must remain readable.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Content(String);

impl Content {
    /// Validate `text` as message content no more than `max` graphemes in length
    pub fn new(text: &str, max: usize) -> Result<Content> {
        ensure!(!text.trim().is_empty(), EmptyContentSnafu);
        let len = text.graphemes(true).count();
        ensure!(len <= max, ContentTooLongSnafu { len, max });
        Ok(Content(text.to_owned()))
    }
}

impl AsRef<str> for Content {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Content {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for Content {
    fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
        String::type_check(typ)
    }
    fn deserialize(
        typ: &'metadata ColumnType<'metadata>,
        v: Option<FrameSlice<'frame>>,
    ) -> StdResult<Self, DeserializationError> {
        Ok(Content(<String as DeserializeValue>::deserialize(typ, v)?))
    }
}

impl Display for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SerializeValue for Content {
    fn serialize<'b>(
        &self,
        typ: &ColumnType<'_>,
        writer: CellWriter<'b>,
    ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
        SerializeValue::serialize(&self.0, typ, writer)
    }
}

impl TryFrom<String> for Content {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        Content::new(&text, DEFAULT_MAX_CONTENT_LENGTH)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          RecencyKey                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sort key imposing a total, *newest first* order on messages & timeline entries
///
/// Timestamps alone won't do (two messages can share a timestamp), so ties are broken on the
/// message id. Deriving [Ord] would give an ascending sort; we want descending, so newer keys
/// compare as [Ordering::Less].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RecencyKey {
    created_at: DateTime<Utc>,
    id: MessageId,
}

impl RecencyKey {
    pub fn new(created_at: DateTime<Utc>, id: MessageId) -> RecencyKey {
        RecencyKey { created_at, id }
    }
    /// Render this key as a string whose lexicographic order is *ascending* in time
    ///
    /// Stores that order their sort keys as byte strings (DynamoDB) are queried in reverse to get
    /// the newest rows first.
    pub fn as_sort_key(&self) -> String {
        format!("{:020}#{}", self.created_at.timestamp_micros(), self.id)
    }
}

impl Ord for RecencyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for RecencyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Message                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A message posted by a user
#[derive(Clone, Debug, Deserialize, DeserializeRow, Eq, PartialEq, Serialize)]
pub struct Message {
    id: MessageId,
    #[serde(rename = "user_id")]
    author_id: UserId,
    content: Content,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Mint a new [Message], assigning it a fresh id and stamping it with the current time
    pub fn new(author_id: &UserId, content: Content) -> Message {
        Message::with_timestamp(author_id, content, Utc::now())
    }
    pub fn with_timestamp(
        author_id: &UserId,
        content: Content,
        created_at: DateTime<Utc>,
    ) -> Message {
        Message {
            id: MessageId::new(),
            author_id: author_id.clone(),
            content,
            created_at,
        }
    }
    pub fn author_id(&self) -> &UserId {
        &self.author_id
    }
    pub fn content(&self) -> &Content {
        &self.content
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn id(&self) -> MessageId {
        self.id
    }
    pub fn recency_key(&self) -> RecencyKey {
        RecencyKey::new(self.created_at, self.id)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           FollowEdge                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A directed "follows" relationship; `follower_id` follows `following_id`
///
/// The pair (follower, following) is the natural key. Self-edges should never get this far (the
/// request layer refuses them), but nothing downstream breaks if one does.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FollowEdge {
    follower_id: UserId,
    following_id: UserId,
    created_at: DateTime<Utc>,
}

impl FollowEdge {
    pub fn new(follower_id: &UserId, following_id: &UserId) -> FollowEdge {
        FollowEdge {
            follower_id: follower_id.clone(),
            following_id: following_id.clone(),
            created_at: Utc::now(),
        }
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn follower_id(&self) -> &UserId {
        &self.follower_id
    }
    pub fn following_id(&self) -> &UserId {
        &self.following_id
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TimelineEntry                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One row of a user's home timeline: a copy of a [Message] materialized for `owner_id`
///
/// Keyed on (owner_id, message_id); writing the same pair twice is an overwrite, not a duplicate.
#[derive(Clone, Debug, Deserialize, DeserializeRow, Eq, PartialEq, Serialize)]
pub struct TimelineEntry {
    message_id: MessageId,
    #[serde(rename = "user_id")]
    owner_id: UserId,
    author_id: UserId,
    content: Content,
    created_at: DateTime<Utc>,
}

impl TimelineEntry {
    /// Materialize `message` on `owner`'s timeline
    pub fn for_owner(owner: &UserId, message: &Message) -> TimelineEntry {
        TimelineEntry {
            message_id: message.id,
            owner_id: owner.clone(),
            author_id: message.author_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
    pub fn author_id(&self) -> &UserId {
        &self.author_id
    }
    pub fn content(&self) -> &Content {
        &self.content
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
    pub fn owner_id(&self) -> &UserId {
        &self.owner_id
    }
    pub fn recency_key(&self) -> RecencyKey {
        RecencyKey::new(self.created_at, self.message_id)
    }
}
