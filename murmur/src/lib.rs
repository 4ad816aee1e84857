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

//! # murmur
//!
//! A social feed service: users post short messages, follow one another, and read a home timeline
//! made up of the messages of everyone they follow.
//!
//! Timelines are materialized on write. Posting a message commits it & then, in the background,
//! copies it onto the timeline of each of the author's followers ([fan_out]); following someone
//! copies their recent messages onto the new follower's timeline. Reading a timeline is thus a
//! single-partition range query.
//!
//! The daemon itself, `murmurd`, is a thin shell around this library: it reads configuration,
//! picks a storage backend & serves [api::make_router].
pub mod api;
#[path = "background-tasks.rs"]
pub mod background_tasks;
pub mod dynamodb;
pub mod entities;
#[path = "fan-out.rs"]
pub mod fan_out;
pub mod feed;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod murmur;
pub mod scylla;
pub mod storage;
pub mod util;
