use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How many consecutive necessitation steps a proof may contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NecessitationLimit {
    /// Proofs only use detachment.
    Disabled,

    /// At most this many `N` in a row.
    Bounded(u32),

    Unbounded,
}

impl NecessitationLimit {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, NecessitationLimit::Disabled | NecessitationLimit::Bounded(0))
    }

    /// Whether a run of `count` consecutive necessitations is allowed.
    pub fn allows(&self, count: u32) -> bool {
        match self {
            NecessitationLimit::Disabled => count == 0,
            NecessitationLimit::Bounded(limit) => count <= *limit,
            NecessitationLimit::Unbounded => true,
        }
    }

    /// The distance between two consecutive proof lengths that can hold proofs.
    /// Detachment alone only reaches odd lengths.
    pub fn step(&self) -> u32 {
        if self.is_enabled() {
            1
        } else {
            2
        }
    }
}

impl fmt::Display for NecessitationLimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NecessitationLimit::Disabled => write!(f, "0"),
            NecessitationLimit::Bounded(n) => write!(f, "{}", n),
            NecessitationLimit::Unbounded => write!(f, "unbounded"),
        }
    }
}

impl FromStr for NecessitationLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unbounded" | "-1" => Ok(NecessitationLimit::Unbounded),
            "0" | "off" => Ok(NecessitationLimit::Disabled),
            other => other
                .parse::<u32>()
                .map(NecessitationLimit::Bounded)
                .map_err(|_| format!("invalid necessitation limit: '{}'", other)),
        }
    }
}

/// Whether collected lengths get their schema-redundant conclusions removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedundancyFilter {
    Enabled,

    /// Lengths from this one on are accumulated without the schema pass.
    DisabledFrom(u32),
}

impl RedundancyFilter {
    pub fn applies_to(&self, length: u32) -> bool {
        match self {
            RedundancyFilter::Enabled => true,
            RedundancyFilter::DisabledFrom(from) => length < *from,
        }
    }

    pub fn unfiltered_from(&self, length: u32) -> Option<u32> {
        match self {
            RedundancyFilter::DisabledFrom(from) if length >= *from => Some(*from),
            _ => None,
        }
    }
}

/// Settings for a single process enumerating proofs.
/// This is built once at startup and handed to everything that needs it.
#[derive(Clone, Debug)]
pub struct EnumerationConfig {
    pub necessitation: NecessitationLimit,

    /// The number of evaluation threads.
    pub workers: usize,

    /// The maximum number of candidates waiting in each worker queue.
    pub queue_capacity: usize,

    /// How often the balancer looks at queue depths.
    pub balance_interval: Duration,

    pub redundancy_filter: RedundancyFilter,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        EnumerationConfig {
            necessitation: NecessitationLimit::Disabled,
            workers: available_workers(),
            queue_capacity: 4096,
            balance_interval: Duration::from_millis(10),
            redundancy_filter: RedundancyFilter::Enabled,
        }
    }
}

/// Settings for the multi-process schema filter.
#[derive(Clone, Debug)]
pub struct DistributedConfig {
    /// A rank offers 1/reserve_denominator of its remaining slice to its peers.
    pub reserve_denominator: u64,

    /// Slices smaller than this are not split further.
    pub min_workload: u64,

    /// How often the timer nudges the communicator.
    pub poll_interval: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig {
            reserve_denominator: 8,
            min_workload: 64,
            poll_interval: Duration::from_millis(2),
        }
    }
}

pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_necessitation_step() {
        assert_eq!(NecessitationLimit::Disabled.step(), 2);
        assert_eq!(NecessitationLimit::Bounded(0).step(), 2);
        assert_eq!(NecessitationLimit::Bounded(1).step(), 1);
        assert_eq!(NecessitationLimit::Unbounded.step(), 1);
    }

    #[test]
    fn test_necessitation_allows() {
        assert!(NecessitationLimit::Bounded(2).allows(2));
        assert!(!NecessitationLimit::Bounded(2).allows(3));
        assert!(!NecessitationLimit::Disabled.allows(1));
        assert!(NecessitationLimit::Unbounded.allows(1000));
    }

    #[test]
    fn test_parse_necessitation() {
        assert_eq!("unbounded".parse(), Ok(NecessitationLimit::Unbounded));
        assert_eq!("0".parse(), Ok(NecessitationLimit::Disabled));
        assert_eq!("3".parse(), Ok(NecessitationLimit::Bounded(3)));
        assert!("x".parse::<NecessitationLimit>().is_err());
    }

    #[test]
    fn test_redundancy_filter() {
        let filter = RedundancyFilter::DisabledFrom(9);
        assert!(filter.applies_to(7));
        assert!(!filter.applies_to(9));
        assert_eq!(filter.unfiltered_from(11), Some(9));
        assert_eq!(filter.unfiltered_from(7), None);
    }
}
