use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

use crate::config::{CacheSpec, ConfigError};
use crate::replacement::{Lfsr, ReplacementPolicy};
use crate::stats::CacheStats;

/// Flag bit marking a slot as holding a real line.
pub const VALID: u64 = 1 << 63;
/// Flag bit marking a line as modified since fill.
pub const DIRTY: u64 = 1 << 62;

const FLAGS: u64 = VALID | DIRTY;

/// Shared handle to a cache node, used for the downstream link. The driver
/// owns the tree; a cache only holds this non-exclusive reference to the
/// level below it.
pub type CacheRef = Rc<RefCell<CacheSim>>;

/// What a cache does with stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Stores dirty the local line; modified data leaves the cache only when
    /// the line is evicted.
    #[default]
    WriteBack,
    /// Stores are forwarded straight to the next level and never dirty a
    /// line.
    WriteThrough,
}

/// Tag storage, picked once at construction.
///
/// Both layouts hold the same 64-bit words: `VALID | DIRTY | block address`,
/// where the block address is the access address shifted right by
/// `idx_shift`. Packing the flags into the top bits keeps a slot to one
/// machine word and makes the hit check a single masked compare.
enum TagStore {
    /// Flat `sets x ways` array, scanned linearly within the indexed set.
    /// Empty slots are all-zero. The parallel `priority` array carries LRU
    /// ages (0 = most recent).
    SetAssociative { tags: Vec<u64>, priority: Vec<u64> },
    /// Keyed storage for the single-set, many-way shape where a linear scan
    /// would be wasteful. Holds at most `ways` entries, keyed by block
    /// address. An ordered map keeps victim selection deterministic for a
    /// given access history.
    FullyAssociative {
        lines: BTreeMap<u64, u64>,
        priority: BTreeMap<u64, u64>,
    },
}

/// Position of a matched slot, re-derived rather than borrowed so the access
/// engine can keep mutating the cache between probe and dirty-marking.
#[derive(Clone, Copy)]
enum Slot {
    Way(usize),
    Key(u64),
}

/// One node in the cache hierarchy.
///
/// Geometry is fixed at construction; all mutation goes through [`access`].
/// Nodes are passive and single-threaded: an access does not return until
/// every writeback and fill it triggered has completed down the chain. A
/// level shared between threads must be wrapped in a mutex by the host.
///
/// [`access`]: CacheSim::access
pub struct CacheSim {
    name: String,
    sets: u64,
    ways: u64,
    line_size: u64,
    idx_shift: u32,
    policy: ReplacementPolicy,
    write_policy: WritePolicy,
    store: TagStore,
    lfsr: Lfsr,
    miss_handler: Option<CacheRef>,
    stats: CacheStats,
    log: bool,
}

impl CacheSim {
    pub fn new(spec: &CacheSpec, name: impl Into<String>) -> Self {
        let name = name.into();
        let store = if spec.is_fully_associative() {
            TagStore::FullyAssociative {
                lines: BTreeMap::new(),
                priority: BTreeMap::new(),
            }
        } else {
            let slots = (spec.sets * spec.ways) as usize;
            TagStore::SetAssociative {
                tags: vec![0; slots],
                priority: vec![0; slots],
            }
        };
        debug!(
            "{name}: {} sets x {} ways x {} byte lines, {:?} replacement",
            spec.sets, spec.ways, spec.line_size, spec.policy
        );
        Self {
            name,
            sets: spec.sets,
            ways: spec.ways,
            line_size: spec.line_size,
            idx_shift: spec.line_size.trailing_zeros(),
            policy: spec.policy,
            write_policy: WritePolicy::default(),
            store,
            lfsr: Lfsr::new(),
            miss_handler: None,
            stats: CacheStats::default(),
            log: false,
        }
    }

    /// Builds a cache straight from the `sets:ways:blocksize[:lru]` grammar.
    pub fn from_config(config: &str, name: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(&config.parse()?, name))
    }

    /// Attaches the downstream cache that services fills and absorbs
    /// writebacks. The links must form a DAG; a cycle panics on the first
    /// miss.
    pub fn set_miss_handler(&mut self, handler: CacheRef) {
        self.miss_handler = Some(handler);
    }

    /// Enables the per-miss diagnostic line on stderr.
    pub fn set_log(&mut self, log: bool) {
        self.log = log;
    }

    pub fn set_write_policy(&mut self, policy: WritePolicy) {
        self.write_policy = policy;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    pub fn is_fully_associative(&self) -> bool {
        matches!(self.store, TagStore::FullyAssociative { .. })
    }

    /// Number of lines currently resident.
    pub fn resident_lines(&self) -> usize {
        match &self.store {
            TagStore::SetAssociative { tags, .. } => {
                tags.iter().filter(|&&word| word & VALID != 0).count()
            }
            TagStore::FullyAssociative { lines, .. } => lines.len(),
        }
    }

    /// Non-mutating probe: is the line containing `addr` resident?
    pub fn contains(&self, addr: u64) -> bool {
        let block = addr >> self.idx_shift;
        match &self.store {
            TagStore::SetAssociative { tags, .. } => {
                let base = self.set_base(block);
                tags[base..base + self.ways as usize]
                    .iter()
                    .any(|&word| word & !DIRTY == block | VALID)
            }
            TagStore::FullyAssociative { lines, .. } => {
                lines.get(&block).is_some_and(|&word| word & VALID != 0)
            }
        }
    }

    /// Runs one memory access against this cache.
    ///
    /// Counts the access and its bytes (taken verbatim, never capped to the
    /// line size), decides hit or miss, and on a miss victimizes a slot,
    /// forwards the writeback for a dirty victim and the fill for the
    /// missing line downstream, and re-marks stores dirty. An access that
    /// spans a line boundary is still a single probe of the line containing
    /// `addr`.
    ///
    /// # Arguments
    ///
    /// * `addr`: The accessed address; any 64-bit value is valid input
    /// * `bytes`: The size of the access in bytes
    /// * `store`: true for writes, false for reads and fetches
    pub fn access(&mut self, addr: u64, bytes: u64, store: bool) {
        if store {
            self.stats.write_accesses += 1;
            self.stats.bytes_written += bytes;
        } else {
            self.stats.read_accesses += 1;
            self.stats.bytes_read += bytes;
        }

        if let Some(slot) = self.check_tag(addr) {
            if store {
                match self.write_policy {
                    WritePolicy::WriteBack => self.mark_dirty(slot),
                    WritePolicy::WriteThrough => self.forward(self.line_base(addr), true),
                }
            }
            return;
        }

        if store {
            self.stats.write_misses += 1;
        } else {
            self.stats.read_misses += 1;
        }
        if self.log {
            eprintln!(
                "{} {} miss {:#x}",
                self.name,
                if store { "write" } else { "read" },
                addr
            );
        }

        let victim = self.victimize(addr);
        if self.write_policy == WritePolicy::WriteBack && victim & FLAGS == FLAGS {
            let dirty_addr = (victim & !FLAGS) << self.idx_shift;
            self.forward(dirty_addr, true);
            self.stats.writebacks += 1;
        }

        self.forward(self.line_base(addr), false);

        if store {
            match self.write_policy {
                // victimize may have reordered the set, so re-derive the slot
                // instead of trusting a stale handle
                WritePolicy::WriteBack => match self.check_tag(addr) {
                    Some(slot) => self.mark_dirty(slot),
                    None => panic!(
                        "{}: line installed for {addr:#x} missing on re-probe",
                        self.name
                    ),
                },
                WritePolicy::WriteThrough => self.forward(self.line_base(addr), true),
            }
        }
    }

    /// Probes for `addr` and returns the matching slot, updating LRU ages on
    /// a hit. Counters are the caller's business.
    fn check_tag(&mut self, addr: u64) -> Option<Slot> {
        let block = addr >> self.idx_shift;
        let sets = self.sets;
        let ways = self.ways as usize;
        let lru = self.policy == ReplacementPolicy::Lru;
        match &mut self.store {
            TagStore::SetAssociative { tags, priority } => {
                let tag = block | VALID;
                let base = ((block & (sets - 1)) * ways as u64) as usize;
                let hit = (0..ways).find(|&way| tags[base + way] & !DIRTY == tag)?;
                if lru {
                    let prev = priority[base + hit];
                    for age in &mut priority[base..base + ways] {
                        if *age < prev {
                            *age += 1;
                        }
                    }
                    priority[base + hit] = 0;
                }
                Some(Slot::Way(base + hit))
            }
            TagStore::FullyAssociative { lines, priority } => {
                let word = *lines.get(&block)?;
                if word & VALID == 0 {
                    return None;
                }
                if lru {
                    let prev = priority.get(&block).copied().unwrap_or(0);
                    for (&key, age) in priority.iter_mut() {
                        if key != block && *age < prev {
                            *age += 1;
                        }
                    }
                    priority.insert(block, 0);
                }
                Some(Slot::Key(block))
            }
        }
    }

    /// Picks a victim slot for `addr`, installs the new tag there (VALID,
    /// clean) and returns the evicted word. For a slot that was empty the
    /// returned word has no flags set and the caller treats it as a no-op.
    fn victimize(&mut self, addr: u64) -> u64 {
        let block = addr >> self.idx_shift;
        let sets = self.sets;
        let ways = self.ways as usize;
        let policy = self.policy;
        match &mut self.store {
            TagStore::SetAssociative { tags, priority } => {
                let base = ((block & (sets - 1)) * ways as u64) as usize;
                let way = match policy {
                    ReplacementPolicy::Lru => {
                        // Age the whole set, then take the oldest. Untouched
                        // slots keep aging, so cold slots fill before any
                        // resident line is evicted.
                        let mut max_age = 0;
                        let mut oldest = 0;
                        for (way, age) in priority[base..base + ways].iter_mut().enumerate() {
                            *age += 1;
                            if *age > max_age {
                                max_age = *age;
                                oldest = way;
                            }
                        }
                        priority[base + oldest] = 0;
                        oldest
                    }
                    ReplacementPolicy::Random => (self.lfsr.next() as usize) % ways,
                };
                debug_assert!(
                    tags[base..base + ways]
                        .iter()
                        .all(|&word| word & !DIRTY != block | VALID),
                    "{}: tag for {addr:#x} already resident at install",
                    self.name
                );
                let victim = tags[base + way];
                tags[base + way] = block | VALID;
                victim
            }
            TagStore::FullyAssociative { lines, priority } => {
                let full = lines.len() == ways;
                let mut victim = 0;
                match policy {
                    ReplacementPolicy::Lru => {
                        // Age every resident line on every fill, not just
                        // when evicting, so the ages stay a strict
                        // last-touch order.
                        let mut max_age = 0;
                        let mut oldest = None;
                        for (&key, age) in priority.iter_mut() {
                            *age += 1;
                            if *age > max_age {
                                max_age = *age;
                                oldest = Some(key);
                            }
                        }
                        if full {
                            if let Some(key) = oldest {
                                victim = lines.remove(&key).unwrap_or(0);
                                priority.remove(&key);
                            }
                        }
                        lines.insert(block, block | VALID);
                        priority.insert(block, 0);
                    }
                    ReplacementPolicy::Random => {
                        if full {
                            let ordinal = (self.lfsr.next() as usize) % ways;
                            if let Some(&key) = lines.keys().nth(ordinal) {
                                victim = lines.remove(&key).unwrap_or(0);
                            }
                        }
                        lines.insert(block, block | VALID);
                    }
                }
                victim
            }
        }
    }

    fn mark_dirty(&mut self, slot: Slot) {
        match (&mut self.store, slot) {
            (TagStore::SetAssociative { tags, .. }, Slot::Way(index)) => tags[index] |= DIRTY,
            (TagStore::FullyAssociative { lines, .. }, Slot::Key(key)) => {
                match lines.get_mut(&key) {
                    Some(word) => *word |= DIRTY,
                    None => unreachable!("dirty mark for a line that is not resident"),
                }
            }
            _ => unreachable!("slot handle does not match tag store layout"),
        }
    }

    /// Forwards a request for one whole line to the downstream cache, if any.
    fn forward(&self, addr: u64, store: bool) {
        if let Some(handler) = &self.miss_handler {
            handler.borrow_mut().access(addr, self.line_size, store);
        }
    }

    fn line_base(&self, addr: u64) -> u64 {
        addr & !(self.line_size - 1)
    }

    fn set_base(&self, block: u64) -> usize {
        ((block & (self.sets - 1)) * self.ways) as usize
    }
}

#[cfg(test)]
impl CacheSim {
    /// Asserts the structural invariants: occupied slots are VALID, DIRTY
    /// implies VALID, the keyed store never exceeds `ways` entries, LRU ages
    /// of occupied slots form a permutation of 0..k, and the counters stay
    /// mutually consistent.
    pub(crate) fn validate_invariants(&self) {
        let lru = self.policy == ReplacementPolicy::Lru;
        match &self.store {
            TagStore::SetAssociative { tags, priority } => {
                for set in 0..self.sets as usize {
                    let base = set * self.ways as usize;
                    let slots = &tags[base..base + self.ways as usize];
                    let mut occupied_ages = Vec::new();
                    for (way, &word) in slots.iter().enumerate() {
                        if word == 0 {
                            continue;
                        }
                        assert!(word & VALID != 0, "occupied slot without VALID in set {set}");
                        if lru {
                            occupied_ages.push(priority[base + way]);
                        }
                    }
                    if lru {
                        occupied_ages.sort_unstable();
                        let expected: Vec<u64> = (0..occupied_ages.len() as u64).collect();
                        assert_eq!(occupied_ages, expected, "LRU ages not a permutation in set {set}");
                    }
                }
                for &word in tags {
                    assert!(word & DIRTY == 0 || word & VALID != 0, "DIRTY slot without VALID");
                }
            }
            TagStore::FullyAssociative { lines, priority } => {
                assert!(lines.len() <= self.ways as usize, "keyed store over capacity");
                for &word in lines.values() {
                    assert!(word & VALID != 0, "resident entry without VALID");
                }
                if lru {
                    let keys: Vec<u64> = lines.keys().copied().collect();
                    let age_keys: Vec<u64> = priority.keys().copied().collect();
                    assert_eq!(keys, age_keys, "age map out of step with lines");
                    let mut ages: Vec<u64> = priority.values().copied().collect();
                    ages.sort_unstable();
                    let expected: Vec<u64> = (0..ages.len() as u64).collect();
                    assert_eq!(ages, expected, "LRU ages not a permutation");
                }
            }
        }
        assert!(self.stats.read_misses <= self.stats.read_accesses);
        assert!(self.stats.write_misses <= self.stats.write_accesses);
        assert!(self.stats.writebacks <= self.stats.total_misses());
    }
}
