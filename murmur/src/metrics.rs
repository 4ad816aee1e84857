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

//! # murmur metrics
//!
//! murmur collects metrics through [OpenTelemetry]. OTel advises that "instruments" (counters,
//! gauges & so forth) be created once and re-used, which raises the question of where to keep
//! them. Rather than hang a field per metric off the application state, or maintain a central
//! list of metric names, each module declares the metrics it uses next to the code that uses them:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("feed.messages.posted", Sort::IntegralCounter) }
//! // ...
//! counter_add!(instruments, "feed.messages.posted", 1, &[]);
//! ```
//!
//! Histograms take `f64`s; durations go in as seconds, counts as-is.
//!
//! [Instruments::new] walks the [inventory] of [Registration]s, panics on duplicate names, and
//! builds every instrument up-front so that recording never needs `&mut self`.
//!
//! Looking-up an unregistered name, or recording a gauge value against a counter, panics. Those are
//! logic errors, and every metric name in murmur is exercised by at least one unit test.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
    /// `Histogram<f64>`; durations are recorded in seconds
    Histogram,
}

/// The type of thing being inventoried
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if two [Registration]s share a name
pub fn check_metric_names() {
    let mut names: HashSet<&'static str> = HashSet::new();
    inventory::iter::<Registration>
        .into_iter()
        .for_each(|reg| {
            if !names.insert(reg.name()) {
                panic!("The metric name {} was registered twice", reg.name());
            }
        });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
    HistogramF64(Histogram<f64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map = HashMap::new();
        inventory::iter::<Registration>
            .into_iter()
            .for_each(|reg| match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(entry) => {
                    entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                        Sort::Histogram => {
                            Instrument::HistogramF64(meter.f64_histogram(reg.name()).build())
                        }
                    });
                }
            });
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
    // panics if `name` doesn't name a histogram
    pub fn record(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        if let Some(Instrument::HistogramF64(h)) = self.map.get(name) {
            h.record(value, attributes);
        } else {
            panic!("{} does not name a histogram", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

#[macro_export]
macro_rules! histogram_record {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.record($name, $value, $attrs);
    };
}
