use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::replacement::ReplacementPolicy;

/// Geometry and replacement policy for a single cache, written as
/// `sets:ways:blocksize` or `sets:ways:blocksize:lru`.
///
/// `sets` must be a power of two, `ways` at least 1, and `blocksize` a power
/// of two no smaller than 8. Without the trailing keyword the cache replaces
/// at random.
///
/// # Examples
///
/// ```
/// use cachetree::config::CacheSpec;
/// let spec: CacheSpec = "64:4:64:lru".parse().unwrap();
/// assert_eq!(spec.sets, 64);
/// assert_eq!(spec.line_size, 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct CacheSpec {
    pub sets: u64,
    pub ways: u64,
    pub line_size: u64,
    pub policy: ReplacementPolicy,
}

impl CacheSpec {
    /// A single set with more than four ways is tracked as a keyed map
    /// instead of a scanned array.
    pub fn is_fully_associative(&self) -> bool {
        self.sets == 1 && self.ways > 4
    }
}

impl FromStr for CacheSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = s.split(':').collect();
        let policy = match fields.len() {
            3 => ReplacementPolicy::Random,
            4 if fields[3] == "lru" => ReplacementPolicy::Lru,
            4 => return Err(ConfigError::UnknownPolicy(fields[3].to_string())),
            n => return Err(ConfigError::FieldCount(n)),
        };
        let int = |text: &str| {
            text.parse::<u64>()
                .map_err(|_| ConfigError::NotAnInteger(text.to_string()))
        };
        let sets = int(fields[0])?;
        let ways = int(fields[1])?;
        let line_size = int(fields[2])?;
        if !sets.is_power_of_two() {
            return Err(ConfigError::SetCount(sets));
        }
        if ways == 0 {
            return Err(ConfigError::ZeroWays);
        }
        if line_size < 8 || !line_size.is_power_of_two() {
            return Err(ConfigError::LineSize(line_size));
        }
        Ok(Self {
            sets,
            ways,
            line_size,
            policy,
        })
    }
}

impl TryFrom<String> for CacheSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, ConfigError> {
        value.parse()
    }
}

/// A malformed cache configuration. Fatal at construction: no cache is built
/// from a geometry that fails these checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    FieldCount(usize),
    NotAnInteger(String),
    SetCount(u64),
    ZeroWays,
    LineSize(u64),
    UnknownPolicy(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FieldCount(n) => {
                write!(f, "expected sets:ways:blocksize[:lru], found {n} fields")
            }
            ConfigError::NotAnInteger(text) => {
                write!(
                    f,
                    "'{text}' is not an unsigned integer in sets:ways:blocksize[:lru]"
                )
            }
            ConfigError::SetCount(sets) => {
                write!(f, "sets must be a power of two, got {sets}")
            }
            ConfigError::ZeroWays => write!(f, "ways must be at least 1"),
            ConfigError::LineSize(size) => {
                write!(f, "blocksize must be a power of two of at least 8, got {size}")
            }
            ConfigError::UnknownPolicy(word) => {
                write!(f, "unknown replacement policy '{word}', the only keyword is 'lru'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// One level of the simulated hierarchy.
#[derive(Debug, Deserialize)]
pub struct CacheLevelConfig {
    /// Label used in the report. Defaults to the conventional name of the
    /// slot this level occupies (`I$`, `D$`, `L2$`).
    #[serde(default)]
    pub name: Option<String>,
    pub geometry: CacheSpec,
    /// Stores forward through to the next level instead of dirtying lines.
    #[serde(default)]
    pub write_through: bool,
}

/// The whole hierarchy: optional split L1 caches and an optional shared L2.
///
/// Every field may be omitted; events for an unconfigured cache are dropped
/// by the tracer.
#[derive(Debug, Default, Deserialize)]
pub struct HierarchyConfig {
    #[serde(default)]
    pub icache: Option<CacheLevelConfig>,
    #[serde(default)]
    pub dcache: Option<CacheLevelConfig>,
    #[serde(default)]
    pub l2: Option<CacheLevelConfig>,
}
