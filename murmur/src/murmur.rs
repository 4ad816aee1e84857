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

//! # murmur application state

use std::sync::Arc;

use opentelemetry_prometheus_text_exporter::PrometheusExporter;

use crate::{feed::Feed, metrics::Instruments};

/// Application state available to all handlers
pub struct Murmur {
    pub feed: Feed,
    pub instruments: Arc<Instruments>,
    pub exporter: PrometheusExporter,
}
