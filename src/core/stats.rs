//! Code generation counters.
//!
//! Counters are process-wide atomics shared by concurrent compilations. With
//! statistics disabled, updates are a single branch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    CompiledUnits,
    CompileFailures,
    InsnsLowered,
    ConstantsFolded,
    SpillSlots,
    CodeBytes,
    LabelsPatched,
    GcRefs,
    Invalidations,
    ArenaExhausted,
}

impl Counter {
    pub const COUNT: usize = 10;

    pub const ALL: [Counter; Counter::COUNT] = [
        Counter::CompiledUnits,
        Counter::CompileFailures,
        Counter::InsnsLowered,
        Counter::ConstantsFolded,
        Counter::SpillSlots,
        Counter::CodeBytes,
        Counter::LabelsPatched,
        Counter::GcRefs,
        Counter::Invalidations,
        Counter::ArenaExhausted,
    ];

    pub fn description(self) -> &'static str {
        match self {
            Counter::CompiledUnits => "Units compiled",
            Counter::CompileFailures => "Compilations failed",
            Counter::InsnsLowered => "Instructions after lowering",
            Counter::ConstantsFolded => "Constants folded",
            Counter::SpillSlots => "Spill slots",
            Counter::CodeBytes => "Code size",
            Counter::LabelsPatched => "Branches patched",
            Counter::GcRefs => "Embedded GC references",
            Counter::Invalidations => "Units invalidated",
            Counter::ArenaExhausted => "Arena exhaustions",
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    enabled: bool,
    counters: [AtomicU64; Counter::COUNT],
}

impl Stats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: Default::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if !self.enabled {
            return;
        }
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut values = [0; Counter::COUNT];
        for counter in Counter::ALL {
            values[counter as usize] = self.get(counter);
        }
        StatsSnapshot { values }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; Counter::COUNT],
}

impl StatsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize]
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Code Generation Statistics:")?;
        for counter in Counter::ALL {
            let value = self.get(counter);
            if counter == Counter::CodeBytes {
                writeln!(f, "  {}: {} bytes", counter.description(), value)?;
            } else {
                writeln!(f, "  {}: {}", counter.description(), value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stats_stay_zero() {
        let stats = Stats::new(false);
        stats.incr(Counter::CompiledUnits);
        stats.add(Counter::CodeBytes, 100);
        assert_eq!(stats.get(Counter::CompiledUnits), 0);
        assert_eq!(stats.get(Counter::CodeBytes), 0);
    }

    #[test]
    fn test_enabled_stats_count() {
        let stats = Stats::new(true);
        stats.incr(Counter::CompiledUnits);
        stats.incr(Counter::CompiledUnits);
        stats.add(Counter::CodeBytes, 42);

        let snap = stats.snapshot();
        assert_eq!(snap.get(Counter::CompiledUnits), 2);
        let text = snap.to_string();
        assert!(text.contains("Units compiled: 2"), "{text}");
        assert!(text.contains("Code size: 42 bytes"), "{text}");
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = std::sync::Arc::new(Stats::new(true));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.incr(Counter::LabelsPatched);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.get(Counter::LabelsPatched), 4000);
    }
}
