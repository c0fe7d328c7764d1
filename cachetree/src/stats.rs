use std::io::{self, Write};

use serde::{Deserialize, Serialize};

/// Traffic counters for one cache. All monotonically non-decreasing; the
/// engine updates them on every access and exposes this struct as the
/// snapshot a reporter consumes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub read_accesses: u64,
    pub read_misses: u64,
    pub write_accesses: u64,
    pub write_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub writebacks: u64,
}

impl CacheStats {
    pub fn total_accesses(&self) -> u64 {
        self.read_accesses + self.write_accesses
    }

    pub fn total_misses(&self) -> u64 {
        self.read_misses + self.write_misses
    }

    /// Combined miss rate as a percentage; 0.0 for an untouched cache.
    pub fn miss_rate(&self) -> f64 {
        if self.total_accesses() == 0 {
            return 0.0;
        }
        100.0 * self.total_misses() as f64 / self.total_accesses() as f64
    }
}

/// A named snapshot, one per cache in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub name: String,
    #[serde(flatten)]
    pub stats: CacheStats,
}

/// The result of replaying a trace, ordered leaves first (I$, D$, then L2$).
/// Serialisable so drivers can emit it as JSON and tests can compare against
/// expected output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyResult {
    pub caches: Vec<CacheSnapshot>,
}

/// Writes the labeled counter block for one cache. A cache that saw no
/// accesses emits nothing.
pub fn write_stats<W: Write>(out: &mut W, name: &str, stats: &CacheStats) -> io::Result<()> {
    if stats.total_accesses() == 0 {
        return Ok(());
    }
    writeln!(out, "{name} {:<23}{}", "Bytes Read:", stats.bytes_read)?;
    writeln!(out, "{name} {:<23}{}", "Bytes Written:", stats.bytes_written)?;
    writeln!(out, "{name} {:<23}{}", "Read Accesses:", stats.read_accesses)?;
    writeln!(out, "{name} {:<23}{}", "Write Accesses:", stats.write_accesses)?;
    writeln!(out, "{name} {:<23}{}", "Read Misses:", stats.read_misses)?;
    writeln!(out, "{name} {:<23}{}", "Write Misses:", stats.write_misses)?;
    writeln!(out, "{name} {:<23}{}", "Writebacks:", stats.writebacks)?;
    writeln!(out, "{name} {:<23}{:.3}%", "Miss Rate:", stats.miss_rate())
}
