// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of bookstreams.
//
// bookstreams is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// bookstreams is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with bookstreams.  If
// not, see <http://www.gnu.org/licenses/>.

//! # bookstreams metrics
//!
//! bookstreams reports metrics through [OpenTelemetry]; whoever embeds us is responsible for
//! installing a meter provider (absent one, the global no-op provider swallows everything).
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! OTel wants instruments built once & re-used, which raises the question of where to keep them.
//! Rather than a central list, each metric is declared next to the code that reports it:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("fanout.events.processed", Sort::IntegralCounter) }
//! // ...
//! counter_add!(instruments, "fanout.events.processed", 1, &[]);
//! ```
//!
//! [Instruments::new] walks the [inventory] of registrations & builds every instrument up front,
//! so that reporting needs only a shared reference. A name registered twice, a name never
//! registered, or a name used as the wrong sort of instrument are all programming errors, and
//! panic.

use std::collections::{hash_map::Entry, HashMap};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
    /// `Histogram<f64>`
    FloatHistogram,
}

/// A metric declaration, collected through [inventory]
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

enum Instrument {
    Counter(Counter<u64>),
    Gauge(Gauge<u64>),
    Histogram(Histogram<f64>),
}

/// Every registered OTel instrument, keyed by name
pub struct Instruments {
    meter: Meter,
    map: HashMap<&'static str, Instrument>,
}

impl std::fmt::Debug for Instruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruments")
            .field("names", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Instruments {
    /// Build all registered instruments on a meter named `prefix`; panics on duplicate names
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map = HashMap::new();
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(entry) => {
                    entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::Counter(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::Gauge(meter.u64_gauge(reg.name()).build())
                        }
                        Sort::FloatHistogram => {
                            Instrument::Histogram(meter.f64_histogram(reg.name()).build())
                        }
                    });
                }
            }
        });
        Instruments { meter, map }
    }
    pub fn meter(&self) -> &Meter {
        &self.meter
    }
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::Counter(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::Gauge(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a gauge", name),
        }
    }
    pub fn observe(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::Histogram(h)) => h.record(value, attributes),
            _ => panic!("{} does not name a histogram", name),
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
macro_rules! histogram_observe {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.observe($name, $value, $attrs);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    inventory::submit! { Registration::new("test.metrics.counter", Sort::IntegralCounter) }

    #[test]
    fn registered_instruments_are_built() {
        let instruments = Instruments::new("bookstreams-test");
        assert!(instruments.contains("test.metrics.counter"));
        assert!(!instruments.contains("test.metrics.nope"));
        counter_add!(instruments, "test.metrics.counter", 1, &[]);
    }

    #[test]
    #[should_panic]
    fn wrong_sort_panics() {
        let instruments = Instruments::new("bookstreams-test");
        gauge_setu!(instruments, "test.metrics.counter", 1, &[]);
    }
}
