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

//! # dynamodb
//!
//! [Storage] implementation for DynamoDB (or ScyllaDB over its Alternator interface).
//!
//! [Storage]: crate::storage
//!
//! ## Tables
//!
//! | table      | partition key | sort key       | notes                                           |
//! |------------|---------------|----------------|-------------------------------------------------|
//! | `messages` | `user_id`     | `sk`           | `sk` is the message's [RecencyKey] sort key     |
//! | `follows`  | `follower_id` | `following_id` | GSI `followers_by_following` reverses the keys  |
//! | `timeline` | `user_id`     | `sk`           | `user_id` is the *owner* of the timeline        |
//!
//! [RecencyKey]: crate::entities::RecencyKey
//!
//! The sort key for timeline rows is derived solely from the message (its timestamp & id), so the
//! row key is a function of (owner, message id), and a second put of the same entry lands on the
//! same row.
//!
//! Queries page internally: DynamoDB returns at most 1MB per response, and the caller is owed
//! everything they asked for.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region};
use aws_sdk_dynamodb::{
    config::{http::HttpResponse, Credentials as AwsCredentials},
    error::SdkError,
    operation::{create_table::CreateTableError, put_item::PutItemError},
    types::{
        AttributeDefinition, AttributeValue, BillingMode, GlobalSecondaryIndex, KeySchemaElement,
        KeyType, Projection, ProjectionType, ScalarAttributeType,
    },
};
use serde::{Deserialize, Serialize};
use serde_dynamo::aws_sdk_dynamodb_1::{from_items, to_item};
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tap::Pipe;
use tracing::{debug, info};
use url::Url;

use crate::{
    entities::{FollowEdge, Message, RecencyKey, TimelineEntry, UserId},
    storage::{self, FollowRepository, MessageRepository, TimelineRepository},
    util::Credentials,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build a table definition: {source}"))]
    Build {
        source: aws_sdk_dynamodb::error::BuildError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create table {table}: {source}"))]
    CreateTable {
        table: String,
        source: SdkError<CreateTableError, HttpResponse>,
        backtrace: Backtrace,
    },
    #[snafu(display("No endpoint URLs specified"))]
    NoEndpoints { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// Name of the global secondary index on `follows` keyed by `following_id`
pub const FOLLOWERS_INDEX: &str = "followers_by_following";

const SORT_KEY: &str = "sk";

/// Where to find DynamoDB
///
/// If you're truly talking to DynamoDB in AWS, give a region. If you're talking to ScyllaDB over
/// the Alternator interface (or to DynamoDB Local), give one or more endpoint URLs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Location {
    Region(String),
    Endpoints(Vec<Url>),
}

/// Table names
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Tables {
    pub messages: String,
    pub follows: String,
    pub timeline: String,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            messages: "messages".to_owned(),
            follows: "follows".to_owned(),
            timeline: "timeline".to_owned(),
        }
    }
}

/// Number of follow edges to request per page when resolving followers
const FOLLOW_PAGE_SIZE: i32 = 500;

pub struct Client {
    client: ::aws_sdk_dynamodb::Client,
    tables: Tables,
}

impl Client {
    pub async fn new(
        location: &Location,
        credentials: &Option<Credentials>,
        tables: &Tables,
    ) -> Result<Client> {
        use secrecy::ExposeSecret;
        let creds = credentials.as_ref().map(|Credentials((id, secret))| {
            AwsCredentials::new(
                id.expose_secret(),
                secret.expose_secret(),
                None,
                None,
                "murmur",
            )
        });

        let config = match location {
            Location::Region(region) => {
                let region_provider =
                    RegionProviderChain::first_try(Some(Region::new(region.clone())))
                        .or_default_provider()
                        .or_else(Region::new("us-west-2"));
                let mut loader = aws_config::from_env().region(region_provider);
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
            Location::Endpoints(endpoints) => {
                // Client-side load-balancing across Alternator nodes is future work; for now, talk
                // to the first.
                let ep_url = endpoints.first().context(NoEndpointsSnafu)?;
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .endpoint_url(ep_url.as_str())
                    .region(Region::new("us-west-2"));
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
        };
        Ok(Client {
            client: ::aws_sdk_dynamodb::Client::new(&config),
            tables: tables.clone(),
        })
    }

    /// Create the murmur tables; tables that already exist are left alone
    pub async fn create_schema(&self) -> Result<()> {
        fn attr(name: &str) -> Result<AttributeDefinition> {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .context(BuildSnafu)
        }
        fn key(name: &str, key_type: KeyType) -> Result<KeySchemaElement> {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .context(BuildSnafu)
        }

        for table in [&self.tables.messages, &self.tables.timeline] {
            self.create_table(
                self.client
                    .create_table()
                    .table_name(table)
                    .attribute_definitions(attr("user_id")?)
                    .attribute_definitions(attr(SORT_KEY)?)
                    .key_schema(key("user_id", KeyType::Hash)?)
                    .key_schema(key(SORT_KEY, KeyType::Range)?),
                table,
            )
            .await?;
        }

        let index = GlobalSecondaryIndex::builder()
            .index_name(FOLLOWERS_INDEX)
            .key_schema(key("following_id", KeyType::Hash)?)
            .key_schema(key("follower_id", KeyType::Range)?)
            .projection(
                Projection::builder()
                    .projection_type(ProjectionType::All)
                    .build(),
            )
            .build()
            .context(BuildSnafu)?;
        self.create_table(
            self.client
                .create_table()
                .table_name(&self.tables.follows)
                .attribute_definitions(attr("follower_id")?)
                .attribute_definitions(attr("following_id")?)
                .key_schema(key("follower_id", KeyType::Hash)?)
                .key_schema(key("following_id", KeyType::Range)?)
                .global_secondary_indexes(index),
            &self.tables.follows,
        )
        .await
    }

    async fn create_table(
        &self,
        builder: aws_sdk_dynamodb::operation::create_table::builders::CreateTableFluentBuilder,
        table: &str,
    ) -> Result<()> {
        match builder.billing_mode(BillingMode::PayPerRequest).send().await {
            Ok(_) => {
                info!("Created table {table}.");
                Ok(())
            }
            Err(SdkError::ServiceError(ref inner))
                if matches!(inner.err(), CreateTableError::ResourceInUseException(_)) =>
            {
                info!("Table {table} already exists.");
                Ok(())
            }
            Err(err) => Err(CreateTableSnafu { table }.into_error(err)),
        }
    }
}

/// Serialize `value` to an item & add the sort key
fn item_with_sort_key<T: Serialize>(
    value: &T,
    key: &RecencyKey,
) -> storage::Result<HashMap<String, AttributeValue>> {
    let mut item: HashMap<String, AttributeValue> =
        to_item(value).map_err(storage::Error::serialization)?;
    item.insert(SORT_KEY.to_owned(), AttributeValue::S(key.as_sort_key()));
    Ok(item)
}

#[async_trait]
impl MessageRepository for Client {
    async fn put_message(&self, message: &Message) -> storage::Result<()> {
        self.client
            .put_item()
            .table_name(&self.tables.messages)
            .set_item(Some(item_with_sort_key(message, &message.recency_key())?))
            .send()
            .await
            .map_err(storage::Error::unavailable)?;
        Ok(())
    }
    async fn recent_by_author(
        &self,
        author: &UserId,
        limit: usize,
    ) -> storage::Result<Vec<Message>> {
        let mut messages: Vec<Message> = Vec::new();
        let mut start = None;
        while messages.len() < limit {
            let out = self
                .client
                .query()
                .table_name(&self.tables.messages)
                .key_condition_expression("user_id = :u")
                .expression_attribute_values(":u", AttributeValue::S(author.to_string()))
                .scan_index_forward(false)
                .limit(i32::try_from(limit - messages.len()).unwrap_or(i32::MAX))
                .set_exclusive_start_key(start)
                .send()
                .await
                .map_err(storage::Error::unavailable)?;
            if let Some(items) = out.items {
                messages.extend(
                    from_items::<Message>(items).map_err(storage::Error::serialization)?,
                );
            }
            match out.last_evaluated_key {
                Some(key) if !key.is_empty() => start = Some(key),
                _ => break,
            }
        }
        messages.truncate(limit);
        Ok(messages)
    }
}

impl Client {
    /// Page through `follows` (or its reverse index) for every edge whose partition key `attr`
    /// equals `user`; return the *other* end of each edge
    async fn scan_edges(
        &self,
        index: Option<&str>,
        attr: &str,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> storage::Result<HashSet<UserId>> {
        let mut result = HashSet::new();
        let mut start = None;
        let mut pages = 0;
        loop {
            let query = self
                .client
                .query()
                .table_name(&self.tables.follows)
                .set_index_name(index.map(str::to_owned))
                .key_condition_expression(format!("{attr} = :u"))
                .expression_attribute_values(":u", AttributeValue::S(user.to_string()))
                .limit(FOLLOW_PAGE_SIZE)
                .set_exclusive_start_key(start);
            let out = storage::bounded(page_timeout, async {
                query.send().await.map_err(storage::Error::unavailable)
            })
            .await?;
            pages += 1;
            if let Some(items) = out.items {
                from_items::<FollowEdge>(items)
                    .map_err(storage::Error::serialization)?
                    .into_iter()
                    .map(|edge| {
                        if index.is_some() {
                            edge.follower_id().clone()
                        } else {
                            edge.following_id().clone()
                        }
                    })
                    .pipe(|ids| result.extend(ids));
            }
            match out.last_evaluated_key {
                Some(key) if !key.is_empty() => start = Some(key),
                _ => break,
            }
        }
        debug!("Read {} edges for {} in {} page(s)", result.len(), user, pages);
        Ok(result)
    }
}

#[async_trait]
impl FollowRepository for Client {
    async fn put_follow(&self, edge: &FollowEdge) -> storage::Result<()> {
        let item: HashMap<String, AttributeValue> =
            to_item(edge).map_err(storage::Error::serialization)?;
        // Write by natural key; should the edge already exist, keep the original
        match self
            .client
            .put_item()
            .table_name(&self.tables.follows)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(follower_id)")
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ref inner))
                if matches!(inner.err(), PutItemError::ConditionalCheckFailedException(_)) =>
            {
                debug!(
                    "{} already follows {}",
                    edge.follower_id(),
                    edge.following_id()
                );
                Ok(())
            }
            Err(err) => Err(storage::Error::unavailable(err)),
        }
    }
    async fn followers_of(
        &self,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> storage::Result<HashSet<UserId>> {
        self.scan_edges(Some(FOLLOWERS_INDEX), "following_id", user, page_timeout)
            .await
    }
    async fn following(&self, user: &UserId) -> storage::Result<HashSet<UserId>> {
        self.scan_edges(None, "follower_id", user, None).await
    }
}

#[async_trait]
impl TimelineRepository for Client {
    async fn upsert_entry(&self, entry: &TimelineEntry) -> storage::Result<()> {
        self.client
            .put_item()
            .table_name(&self.tables.timeline)
            .set_item(Some(item_with_sort_key(entry, &entry.recency_key())?))
            .send()
            .await
            .map_err(storage::Error::unavailable)?;
        Ok(())
    }
    async fn recent_for_owner(
        &self,
        owner: &UserId,
        limit: usize,
    ) -> storage::Result<Vec<TimelineEntry>> {
        let mut entries: Vec<TimelineEntry> = Vec::new();
        let mut start = None;
        while entries.len() < limit {
            let out = self
                .client
                .query()
                .table_name(&self.tables.timeline)
                .key_condition_expression("user_id = :u")
                .expression_attribute_values(":u", AttributeValue::S(owner.to_string()))
                .scan_index_forward(false)
                .limit(i32::try_from(limit - entries.len()).unwrap_or(i32::MAX))
                .set_exclusive_start_key(start)
                .send()
                .await
                .map_err(storage::Error::unavailable)?;
            if let Some(items) = out.items {
                entries.extend(
                    from_items::<TimelineEntry>(items).map_err(storage::Error::serialization)?,
                );
            }
            match out.last_evaluated_key {
                Some(key) if !key.is_empty() => start = Some(key),
                _ => break,
            }
        }
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::entities::Content;

    #[test]
    fn items_carry_keys() {
        let author = UserId::new("A1").unwrap();
        let owner = UserId::new("U1").unwrap();
        let message = Message::new(&author, Content::new("hello", 280).unwrap());

        let item = item_with_sort_key(&message, &message.recency_key()).unwrap();
        assert_eq!(item.get("user_id"), Some(&AttributeValue::S("A1".to_owned())));
        assert_eq!(
            item.get(SORT_KEY),
            Some(&AttributeValue::S(message.recency_key().as_sort_key()))
        );
        // The sort key is ignored on the way back
        let back: Vec<Message> = from_items(vec![item]).unwrap();
        assert_eq!(back, vec![message.clone()]);

        let entry = TimelineEntry::for_owner(&owner, &message);
        let item = item_with_sort_key(&entry, &entry.recency_key()).unwrap();
        assert_eq!(item.get("user_id"), Some(&AttributeValue::S("U1".to_owned())));
        assert_eq!(item.get("author_id"), Some(&AttributeValue::S("A1".to_owned())));
        // Same message, same owner => same key
        let again = item_with_sort_key(&entry.clone(), &entry.recency_key()).unwrap();
        assert_eq!(item.get(SORT_KEY), again.get(SORT_KEY));
    }

    #[test]
    fn locations() {
        #[derive(Deserialize)]
        struct Holder {
            location: Location,
        }
        let h: Holder = toml::from_str(r#"location = { Region = "us-east-1" }"#).unwrap();
        assert!(matches!(h.location, Location::Region(r) if r == "us-east-1"));
        let h: Holder =
            toml::from_str(r#"location = { Endpoints = ["http://localhost:8043"] }"#).unwrap();
        assert!(matches!(h.location, Location::Endpoints(v) if v.len() == 1));
    }
}
