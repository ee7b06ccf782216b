//! Process-wide counters and timed scopes for the compile path.
//!
//! Counters are cheap enough to stay on in every build. Scopes log their elapsed time at
//! `trace` level and accumulate it per name; [`snapshot`] returns the current totals.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Cache,
    Compile,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Cache => "cache",
            EventKind::Compile => "compile",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub count: u64,
    pub total: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEntry {
    pub kind: EventKind,
    pub name: &'static str,
    pub stats: EventStats,
}

struct Profiler {
    entries: Mutex<HashMap<(EventKind, &'static str), EventStats>>,
}

impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, kind: EventKind, name: &'static str, elapsed: Duration) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stats = entries.entry((kind, name)).or_default();
        stats.count += 1;
        stats.total += elapsed;
    }
}

#[inline]
pub fn cache_event(name: &'static str) {
    Profiler::instance().record(EventKind::Cache, name, Duration::ZERO);
}

#[must_use = "the scope is timed until the guard is dropped"]
pub struct ScopeGuard {
    name: &'static str,
    start: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::trace!("{} took {:?}", self.name, elapsed);
        Profiler::instance().record(EventKind::Compile, self.name, elapsed);
    }
}

#[inline]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        name,
        start: Instant::now(),
    }
}

/// Number of times `name` was recorded under `kind` since the last [`reset`].
pub fn event_count(kind: EventKind, name: &'static str) -> u64 {
    let entries = Profiler::instance()
        .entries
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    entries.get(&(kind, name)).map_or(0, |stats| stats.count)
}

/// All recorded entries, sorted by kind then name.
pub fn snapshot() -> Vec<ProfileEntry> {
    let entries = Profiler::instance()
        .entries
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut out: Vec<ProfileEntry> = entries
        .iter()
        .map(|(&(kind, name), &stats)| ProfileEntry { kind, name, stats })
        .collect();
    out.sort_by(|a, b| (a.kind, a.name).cmp(&(b.kind, b.name)));
    out
}

pub fn reset() {
    Profiler::instance()
        .entries
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

pub struct Report(pub Vec<ProfileEntry>);

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<8} {:<28} {:>8} {:>14}", "kind", "name", "count", "total")?;
        for entry in &self.0 {
            writeln!(
                f,
                "{:<8} {:<28} {:>8} {:>14.3?}",
                entry.kind.as_str(),
                entry.name,
                entry.stats.count,
                entry.stats.total
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_events_and_scopes() {
        cache_event("profiling_test_event");
        cache_event("profiling_test_event");
        {
            let _scope = compile_scope("profiling_test_scope");
        }
        assert!(event_count(EventKind::Cache, "profiling_test_event") >= 2);
        assert!(event_count(EventKind::Compile, "profiling_test_scope") >= 1);
        let report = Report(snapshot()).to_string();
        assert!(report.contains("profiling_test_scope"));
    }
}
