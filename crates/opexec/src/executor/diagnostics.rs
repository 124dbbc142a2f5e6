//! Selection counters owned by an [`ExecutorContext`](super::ExecutorContext).
//!
//! Counting is off unless the context enables it, in which case every [`Diagnostics::scope`]
//! guard records a call and its inclusive duration under its phase name, and
//! [`Diagnostics::cache_event`] counts hits and misses per cache.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStat {
    pub calls: u64,
    pub inclusive_ns: u128,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStat {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub phases: BTreeMap<String, PhaseStat>,
    pub caches: BTreeMap<String, CacheStat>,
}

#[derive(Default)]
struct Counters {
    phases: BTreeMap<&'static str, PhaseStat>,
    caches: BTreeMap<&'static str, CacheStat>,
}

pub struct Diagnostics {
    enabled: bool,
    counters: Mutex<Counters>,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scope(&self, phase: &'static str) -> ScopeGuard<'_> {
        ScopeGuard {
            owner: self,
            phase,
            start: self.enabled.then(Instant::now),
        }
    }

    pub fn cache_event(&self, cache: &'static str, hit: bool) {
        if !self.enabled {
            return;
        }
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        let entry = counters.caches.entry(cache).or_default();
        if hit {
            entry.hits = entry.hits.saturating_add(1);
        } else {
            entry.misses = entry.misses.saturating_add(1);
        }
    }

    fn record(&self, phase: &'static str, elapsed: Duration) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        let entry = counters.phases.entry(phase).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.inclusive_ns = entry.inclusive_ns.saturating_add(elapsed.as_nanos());
    }

    pub fn report(&self) -> DiagnosticsReport {
        let Ok(counters) = self.counters.lock() else {
            return DiagnosticsReport::default();
        };
        DiagnosticsReport {
            phases: counters
                .phases
                .iter()
                .map(|(name, stat)| (name.to_string(), *stat))
                .collect(),
            caches: counters
                .caches
                .iter()
                .map(|(name, stat)| (name.to_string(), *stat))
                .collect(),
        }
    }

    pub fn report_json(&self) -> Option<String> {
        serde_json::to_string(&self.report()).ok()
    }

    /// Emits the collected counters and clears them.
    pub fn teardown(&self) {
        if !self.enabled {
            return;
        }
        if let Some(json) = self.report_json() {
            info!("executor counters: {json}");
        }
        if let Ok(mut counters) = self.counters.lock() {
            *counters = Counters::default();
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub struct ScopeGuard<'a> {
    owner: &'a Diagnostics,
    phase: &'static str,
    start: Option<Instant>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            self.owner.record(self.phase, start.elapsed());
        }
    }
}
