/// One side of a detachment, as far as lengths go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LengthSlot {
    /// A representative proof of exactly this length.
    Known(u32),

    /// Any proof longer than the known limit.
    Open,
}

/// The lengths that can hold proofs, up to and including the known limit.
/// Without necessitation, only odd lengths are possible.
pub fn known_lengths(known_limit: u32, necessitation_enabled: bool) -> Vec<u32> {
    (1..=known_limit)
        .filter(|l| necessitation_enabled || l % 2 == 1)
        .collect()
}

/// Every ordered pair of sub-proof lengths (major, minor) for a detachment that yields a
/// proof longer than `known_limit`.
/// Pairs of two known lengths are only included when they reach past the limit.
/// Any pair involving an open slot always does.
///
/// Without necessitation, and for odd `known_limit`, there are ((k + 6)^2 - 17) / 8 pairs.
pub fn proof_length_combinations(
    known_limit: u32,
    necessitation_enabled: bool,
) -> Vec<(LengthSlot, LengthSlot)> {
    let mut slots: Vec<LengthSlot> = known_lengths(known_limit, necessitation_enabled)
        .into_iter()
        .map(LengthSlot::Known)
        .collect();
    slots.push(LengthSlot::Open);

    let min_length = |slot: LengthSlot| match slot {
        LengthSlot::Known(l) => l,
        LengthSlot::Open => known_limit + 1,
    };

    let mut answer = vec![];
    for &major in &slots {
        for &minor in &slots {
            if 1 + min_length(major) + min_length(minor) > known_limit {
                answer.push((major, minor));
            }
        }
    }
    answer
}
