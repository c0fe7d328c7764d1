use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::warn;

use crate::cache::{CacheRef, CacheSim, WritePolicy};
use crate::config::{CacheLevelConfig, HierarchyConfig};
use crate::stats::{write_stats, CacheSnapshot, HierarchyResult};

/// One memory event produced by the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// Owns the cache tree and drives it from a trace.
///
/// Fetches go to the I-cache and loads/stores to the D-cache; when an L2 is
/// configured, both L1s use it as their miss handler. Events aimed at an
/// unconfigured cache are dropped. Supports calling [`simulate`] multiple
/// times; counters and the measured simulation time accumulate.
///
/// [`simulate`]: Simulator::simulate
pub struct Simulator {
    icache: Option<CacheRef>,
    dcache: Option<CacheRef>,
    l2: Option<CacheRef>,
    simulation_time: Duration,
}

impl Simulator {
    /// Builds and wires the hierarchy a configuration describes.
    ///
    /// # Arguments
    ///
    /// * `config`: A hierarchy configuration, usually resulting from parsing
    ///   JSON
    ///
    /// returns: Simulator
    pub fn new(config: &HierarchyConfig) -> Self {
        let l2 = config.l2.as_ref().map(|level| build_cache(level, "L2$"));
        let icache = config.icache.as_ref().map(|level| build_cache(level, "I$"));
        let dcache = config.dcache.as_ref().map(|level| build_cache(level, "D$"));
        if let Some(l2) = &l2 {
            for l1 in [&icache, &dcache].into_iter().flatten() {
                l1.borrow_mut().set_miss_handler(Rc::clone(l2));
            }
            if icache.is_none() && dcache.is_none() {
                warn!("L2 is configured without an L1 above it and will see no traffic");
            }
        }
        Self {
            icache,
            dcache,
            l2,
            simulation_time: Duration::new(0, 0),
        }
    }

    /// Enables or disables the per-miss stderr line on every cache.
    pub fn set_log(&mut self, log: bool) {
        for cache in self.nodes() {
            cache.borrow_mut().set_log(log);
        }
    }

    /// Routes a single traced event to the cache interested in it.
    pub fn trace(&mut self, kind: AccessKind, addr: u64, bytes: u64) {
        let (target, store) = match kind {
            AccessKind::Fetch => (&self.icache, false),
            AccessKind::Load => (&self.dcache, false),
            AccessKind::Store => (&self.dcache, true),
        };
        if let Some(cache) = target {
            cache.borrow_mut().access(addr, bytes, store);
        }
    }

    /// Replays a whole text trace.
    ///
    /// Each line is `fetch|load|store <hex-addr> <bytes>`; blank lines and
    /// `#` comments are skipped. The input is borrowed as raw bytes so a
    /// memory-mapped file can be fed in directly.
    ///
    /// # Arguments
    ///
    /// * `bytes`: The trace text
    ///
    /// returns: Result<HierarchyResult, String>
    pub fn simulate(&mut self, bytes: &[u8]) -> Result<HierarchyResult, String> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| format!("trace is not valid UTF-8: {e}"))?;
        let start = Instant::now();
        for (number, line) in text.lines().enumerate() {
            let event = parse_trace_line(line)
                .map_err(|e| format!("trace line {}: {e}", number + 1))?;
            if let Some((kind, addr, bytes)) = event {
                self.trace(kind, addr, bytes);
            }
        }
        self.simulation_time += start.elapsed();
        Ok(self.snapshot())
    }

    /// Counter snapshot for every configured cache, leaves first.
    pub fn snapshot(&self) -> HierarchyResult {
        HierarchyResult {
            caches: self
                .nodes()
                .map(|cache| {
                    let cache = cache.borrow();
                    CacheSnapshot {
                        name: cache.name().to_string(),
                        stats: cache.stats().clone(),
                    }
                })
                .collect(),
        }
    }

    /// Writes the labeled report for the whole hierarchy, leaves before the
    /// shared level so L1 numbers appear above the L2 traffic they caused.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for cache in self.nodes() {
            let cache = cache.borrow();
            write_stats(out, cache.name(), cache.stats())?;
        }
        Ok(())
    }

    /// Wall-clock time spent inside [`simulate`] so far.
    ///
    /// [`simulate`]: Simulator::simulate
    pub fn get_execution_time(&self) -> &Duration {
        &self.simulation_time
    }

    fn nodes(&self) -> impl Iterator<Item = &CacheRef> {
        [self.icache.as_ref(), self.dcache.as_ref(), self.l2.as_ref()]
            .into_iter()
            .flatten()
    }
}

fn build_cache(level: &CacheLevelConfig, default_name: &str) -> CacheRef {
    let name = level.name.as_deref().unwrap_or(default_name);
    let mut cache = CacheSim::new(&level.geometry, name);
    if level.write_through {
        cache.set_write_policy(WritePolicy::WriteThrough);
    }
    Rc::new(RefCell::new(cache))
}

/// Parses one trace line into an event; `Ok(None)` for blanks and comments.
fn parse_trace_line(line: &str) -> Result<Option<(AccessKind, u64, u64)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut fields = line.split_whitespace();
    let kind = match fields.next() {
        Some("fetch") => AccessKind::Fetch,
        Some("load") => AccessKind::Load,
        Some("store") => AccessKind::Store,
        Some(other) => return Err(format!("unknown operation '{other}'")),
        None => return Ok(None),
    };
    let addr_text = fields
        .next()
        .ok_or_else(|| "missing address field".to_string())?;
    let addr = u64::from_str_radix(addr_text.trim_start_matches("0x"), 16)
        .map_err(|e| format!("bad address '{addr_text}': {e}"))?;
    let size_text = fields
        .next()
        .ok_or_else(|| "missing size field".to_string())?;
    let bytes = size_text
        .parse::<u64>()
        .map_err(|e| format!("bad size '{size_text}': {e}"))?;
    if let Some(extra) = fields.next() {
        return Err(format!("trailing field '{extra}'"));
    }
    Ok(Some((kind, addr, bytes)))
}
