use crate::config::DistributedConfig;

/// Multiplier of the shuffle. It is odd, so the map is a bijection on u64.
pub const SHUFFLE_MULTIPLIER: u64 = 6364136223846793005;
pub const SHUFFLE_INCREMENT: u64 = 1442695040888963407;

pub fn shuffle_key(index: u64) -> u64 {
    index
        .wrapping_mul(SHUFFLE_MULTIPLIER)
        .wrapping_add(SHUFFLE_INCREMENT)
}

/// A fixed permutation of the candidate indices.
/// Candidates are stored roughly in order of cost, so contiguous positions of the shuffled
/// order have about the same expected cost.
#[derive(Clone, Debug)]
pub struct ShuffledOrder {
    order: Vec<u64>,
}

impl ShuffledOrder {
    pub fn new(count: u64) -> ShuffledOrder {
        let mut order: Vec<u64> = (0..count).collect();
        order.sort_unstable_by_key(|&i| shuffle_key(i));
        ShuffledOrder { order }
    }

    pub fn len(&self) -> u64 {
        self.order.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The candidate index at this position.
    pub fn index_at(&self, position: u64) -> Option<u64> {
        self.order.get(position as usize).copied()
    }
}

/// The positions `[first, end)` initially assigned to a rank.
pub fn static_split(count: u64, size: usize, rank: usize) -> (u64, u64) {
    let size = size.max(1) as u128;
    let rank = rank as u128;
    let count = count as u128;
    let first = count * rank / size;
    let end = count * (rank + 1) / size;
    (first as u64, end as u64)
}

/// The positions a rank is responsible for.
/// The active range is being worked on. The reservable range, right after it, may be handed
/// to another rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSlice {
    first: u64,
    end: u64,
    reservable: Option<(u64, u64)>,
    denominator: u64,
    min_workload: u64,
}

impl WorkloadSlice {
    pub fn new(first: u64, end: u64, config: &DistributedConfig) -> WorkloadSlice {
        let mut slice = WorkloadSlice {
            first,
            end: end.max(first),
            reservable: None,
            denominator: config.reserve_denominator.max(2),
            min_workload: config.min_workload,
        };
        slice.split();
        slice
    }

    // Moves the tail of the active range into the reservable range, unless the active range
    // is too small or something is already reservable.
    fn split(&mut self) {
        if self.reservable.is_some() {
            return;
        }
        let remaining = self.end - self.first;
        if remaining < self.min_workload {
            return;
        }
        let reserved = remaining / self.denominator;
        if reserved == 0 {
            return;
        }
        self.reservable = Some((self.end - reserved, self.end));
        self.end -= reserved;
    }

    /// The next position to work on.
    /// Once the active range is used up, the rank takes its own reservable range back.
    pub fn next_position(&mut self) -> Option<u64> {
        if self.first >= self.end {
            let (first, end) = self.reservable.take()?;
            self.first = first;
            self.end = end;
            self.split();
        }
        let position = self.first;
        self.first += 1;
        Some(position)
    }

    /// The range offered to peers. Empty if there is none.
    pub fn reservable(&self) -> (u64, u64) {
        self.reservable.unwrap_or((0, 0))
    }

    /// Hands the reservable range to a peer, if it is still exactly `[first, end)`.
    /// On success the remaining active range gets split again.
    pub fn grant(&mut self, first: u64, end: u64) -> bool {
        if first >= end || self.reservable != Some((first, end)) {
            return false;
        }
        self.reservable = None;
        self.split();
        true
    }

    /// Takes over a range granted by a peer.
    pub fn adopt(&mut self, first: u64, end: u64) {
        debug_assert!(self.first >= self.end && self.reservable.is_none());
        self.first = first;
        self.end = end.max(first);
        self.split();
    }

    /// Positions left in the active range.
    pub fn active_len(&self) -> u64 {
        self.end - self.first
    }
}
