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

//! # In-memory storage
//!
//! A [Backend](crate::storage::Backend) that keeps everything in process. It's what the unit
//! tests run against, and it's a perfectly serviceable store for a single-instance deployment that
//! doesn't mind losing everything on restart.
//!
//! It's laid out the way the NoSQL backends lay out their tables: messages are partitioned by
//! author & clustered newest-first, the follow graph is held twice (once per direction, standing in
//! for the secondary index), and timelines are partitioned by owner. The follower index is read in
//! pages of `page_size` so that the repository contract ("page internally, never truncate") is
//! exercised here too.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{
    entities::{FollowEdge, Message, MessageId, RecencyKey, TimelineEntry, UserId},
    storage::{self, FollowRepository, MessageRepository, Result, TimelineRepository},
};

/// One owner's timeline
///
/// `by_id` is the primary key (owner, message id); `by_recency` is the clustering order. Both are
/// kept in step so that upserting an entry that's already present replaces it rather than adding a
/// second row.
#[derive(Debug, Default)]
struct Timeline {
    by_id: HashMap<MessageId, RecencyKey>,
    by_recency: BTreeMap<RecencyKey, TimelineEntry>,
}

impl Timeline {
    fn upsert(&mut self, entry: &TimelineEntry) {
        let key = entry.recency_key();
        if let Some(old) = self.by_id.insert(entry.message_id(), key) {
            self.by_recency.remove(&old);
        }
        self.by_recency.insert(key, entry.clone());
    }
}

/// The in-memory store
#[derive(Debug)]
pub struct MemoryStore {
    messages: RwLock<HashMap<UserId, BTreeMap<RecencyKey, Message>>>,
    // follower -> following
    following: RwLock<HashMap<UserId, BTreeMap<UserId, FollowEdge>>>,
    // following -> follower
    followers: RwLock<HashMap<UserId, BTreeMap<UserId, FollowEdge>>>,
    timelines: RwLock<HashMap<UserId, Timeline>>,
    page_size: usize,
}

const DEFAULT_PAGE_SIZE: usize = 256;

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
    pub fn with_page_size(page_size: usize) -> MemoryStore {
        MemoryStore {
            messages: RwLock::new(HashMap::new()),
            following: RwLock::new(HashMap::new()),
            followers: RwLock::new(HashMap::new()),
            timelines: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }
    /// Total number of rows on `owner`'s timeline
    pub async fn timeline_len(&self, owner: &UserId) -> usize {
        self.timelines
            .read()
            .await
            .get(owner)
            .map(|t| t.by_id.len())
            .unwrap_or(0)
    }
    /// Read one page of the index `index`, starting strictly after `start`
    async fn page(
        &self,
        index: &RwLock<HashMap<UserId, BTreeMap<UserId, FollowEdge>>>,
        user: &UserId,
        start: Option<&UserId>,
    ) -> (Vec<UserId>, Option<UserId>) {
        let guard = index.read().await;
        let Some(edges) = guard.get(user) else {
            return (Vec::new(), None);
        };
        let page: Vec<UserId> = match start {
            Some(start) => edges
                .range::<UserId, _>((
                    std::ops::Bound::Excluded(start),
                    std::ops::Bound::Unbounded,
                ))
                .take(self.page_size)
                .map(|(k, _)| k.clone())
                .collect(),
            None => edges.keys().take(self.page_size).cloned().collect(),
        };
        let last = if page.len() == self.page_size {
            page.last().cloned()
        } else {
            None
        };
        (page, last)
    }
    /// Read every edge for `user` from `index`, a page at a time, each page under `page_timeout`
    async fn scan(
        &self,
        index: &RwLock<HashMap<UserId, BTreeMap<UserId, FollowEdge>>>,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> Result<HashSet<UserId>> {
        let mut result = HashSet::new();
        let mut start: Option<UserId> = None;
        let mut pages = 0;
        loop {
            let (page, last) = storage::bounded(page_timeout, async {
                Ok(self.page(index, user, start.as_ref()).await)
            })
            .await?;
            pages += 1;
            result.extend(page);
            match last {
                Some(last) => start = Some(last),
                None => break,
            }
        }
        trace!("Read {} edges for {} in {} page(s)", result.len(), user, pages);
        Ok(result)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        self.messages
            .write()
            .await
            .entry(message.author_id().clone())
            .or_default()
            .insert(message.recency_key(), message.clone());
        Ok(())
    }
    async fn recent_by_author(&self, author: &UserId, limit: usize) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .get(author)
            .map(|m| m.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl FollowRepository for MemoryStore {
    async fn put_follow(&self, edge: &FollowEdge) -> Result<()> {
        // Keep the first edge written, as a conditional put on the natural key would.
        self.following
            .write()
            .await
            .entry(edge.follower_id().clone())
            .or_default()
            .entry(edge.following_id().clone())
            .or_insert_with(|| edge.clone());
        self.followers
            .write()
            .await
            .entry(edge.following_id().clone())
            .or_default()
            .entry(edge.follower_id().clone())
            .or_insert_with(|| edge.clone());
        Ok(())
    }
    async fn followers_of(
        &self,
        user: &UserId,
        page_timeout: Option<Duration>,
    ) -> Result<HashSet<UserId>> {
        self.scan(&self.followers, user, page_timeout).await
    }
    async fn following(&self, user: &UserId) -> Result<HashSet<UserId>> {
        self.scan(&self.following, user, None).await
    }
}

#[async_trait]
impl TimelineRepository for MemoryStore {
    async fn upsert_entry(&self, entry: &TimelineEntry) -> Result<()> {
        self.timelines
            .write()
            .await
            .entry(entry.owner_id().clone())
            .or_default()
            .upsert(entry);
        Ok(())
    }
    async fn recent_for_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<TimelineEntry>> {
        Ok(self
            .timelines
            .read()
            .await
            .get(owner)
            .map(|t| t.by_recency.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{TimeZone, Utc};

    use crate::entities::Content;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn msg(author: &UserId, text: &str, secs: i64) -> Message {
        Message::with_timestamp(
            author,
            Content::new(text, 280).unwrap(),
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn messages_newest_first() {
        let store = MemoryStore::new();
        let a1 = uid("A1");
        for (i, secs) in [300, 100, 200].into_iter().enumerate() {
            store
                .put_message(&msg(&a1, &format!("m{i}"), secs))
                .await
                .unwrap();
        }
        let recent = store.recent_by_author(&a1, 10).await.unwrap();
        let times: Vec<i64> = recent.iter().map(|m| m.created_at().timestamp()).collect();
        assert_eq!(times, vec![300, 200, 100]);

        assert_eq!(store.recent_by_author(&a1, 2).await.unwrap().len(), 2);
        assert!(store.recent_by_author(&a1, 0).await.unwrap().is_empty());
        assert!(store
            .recent_by_author(&uid("nobody"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn create_message_stamps() {
        let store = MemoryStore::new();
        let a1 = uid("A1");
        let m = store
            .create_message(&a1, Content::new("hello", 280).unwrap())
            .await
            .unwrap();
        let recent = store.recent_by_author(&a1, 10).await.unwrap();
        assert_eq!(recent, vec![m]);
    }

    #[tokio::test]
    async fn follows_page_without_truncation() {
        let store = MemoryStore::with_page_size(3);
        let a1 = uid("A1");
        for i in 0..10 {
            store.create_follow(&uid(&format!("U{i}")), &a1).await.unwrap();
        }
        // Idempotent on the natural key
        store.create_follow(&uid("U0"), &a1).await.unwrap();

        let followers = store
            .followers_of(&a1, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(followers.len(), 10);
        assert!(followers.contains(&uid("U9")));

        let following = store.following(&uid("U3")).await.unwrap();
        assert_eq!(following, HashSet::from([a1.clone()]));
        assert!(store.followers_of(&uid("U3"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeline_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let a1 = uid("A1");
        let u1 = uid("U1");
        let m1 = msg(&a1, "one", 100);
        let m2 = msg(&a1, "two", 200);

        for _ in 0..3 {
            store
                .upsert_entry(&TimelineEntry::for_owner(&u1, &m1))
                .await
                .unwrap();
        }
        store
            .upsert_entry(&TimelineEntry::for_owner(&u1, &m2))
            .await
            .unwrap();

        assert_eq!(store.timeline_len(&u1).await, 2);
        let entries = store.recent_for_owner(&u1, 10).await.unwrap();
        let ids: Vec<MessageId> = entries.iter().map(|e| e.message_id()).collect();
        assert_eq!(ids, vec![m2.id(), m1.id()]);
        assert!(store.recent_for_owner(&a1, 10).await.unwrap().is_empty());
    }
}
