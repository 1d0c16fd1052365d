use std::fmt;

use crate::axiom::AxiomSet;
use crate::kernel::atom::VarId;
use crate::kernel::formula::Formula;
use crate::kernel::unifier::detach;

/// The rule symbol for condensed detachment.
pub const DETACH: char = 'D';

/// The rule symbol for necessitation.
pub const NECESSITATE: char = 'N';

/// Identifies a proof string of a `RepresentativeTable` without copying it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProofRef {
    /// A position among all representatives, ordered by length and then within each length.
    Known(usize),

    /// One of the axioms, by position in the axiom set.
    Axiom(u8),

    /// Entry `index` of the representatives of one length.
    Generated { length: u16, index: u64 },
}

/// Why a proof string doesn't describe a valid derivation.
/// Invalid candidates are expected in large numbers, so none of these are fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    Empty,
    UnknownSymbol(char, usize),

    /// A rule at this position had nothing to consume.
    MissingPremise(usize),

    /// The major premise of a detachment at this position isn't an implication.
    NotAnImplication(usize),

    UnificationFailure(usize),

    /// This many formulas were left over at the end.
    Unconsumed(usize),
}

impl fmt::Display for ProofError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProofError::Empty => write!(f, "empty proof"),
            ProofError::UnknownSymbol(c, i) => write!(f, "unknown symbol '{}' at {}", c, i),
            ProofError::MissingPremise(i) => write!(f, "missing premise for rule at {}", i),
            ProofError::NotAnImplication(i) => {
                write!(f, "major premise of detachment at {} is not an implication", i)
            }
            ProofError::UnificationFailure(i) => {
                write!(f, "premises of detachment at {} do not unify", i)
            }
            ProofError::Unconsumed(n) => write!(f, "{} formulas left unconsumed", n),
        }
    }
}

impl std::error::Error for ProofError {}

/// The result of running a proof string.
#[derive(Clone, Debug)]
pub struct Derivation {
    /// Canonicalized, so its variables start at zero.
    pub conclusion: Formula,
}

impl Derivation {
    pub fn key(&self) -> String {
        self.conclusion.to_polish()
    }
}

/// Runs a proof string as a stack machine, reading from right to left.
/// An axiom pushes a fresh copy of itself. `D` pops the major premise, then the minor
/// premise, and pushes the detached consequent. `N` wraps the top formula in □.
/// The proof is valid if exactly one formula is left.
pub fn parse_proof_string(candidate: &str, axioms: &AxiomSet) -> Result<Derivation, ProofError> {
    if candidate.is_empty() {
        return Err(ProofError::Empty);
    }
    let mut stack: Vec<Formula> = Vec::with_capacity(candidate.len() / 2 + 1);
    let mut next_var: VarId = 0;
    for (i, c) in candidate.char_indices().rev() {
        match c {
            DETACH => {
                let major = stack.pop().ok_or(ProofError::MissingPremise(i))?;
                let minor = stack.pop().ok_or(ProofError::MissingPremise(i))?;
                if major.as_implication().is_none() {
                    return Err(ProofError::NotAnImplication(i));
                }
                let consequent = detach(&major, &minor).ok_or(ProofError::UnificationFailure(i))?;
                stack.push(consequent);
            }
            NECESSITATE => {
                let inner = stack.pop().ok_or(ProofError::MissingPremise(i))?;
                stack.push(Formula::necessity(inner));
            }
            _ => {
                let index = axioms
                    .index_of(c)
                    .ok_or(ProofError::UnknownSymbol(c, i))?;
                let (instance, span) = axioms
                    .instantiate(index, next_var)
                    .ok_or(ProofError::UnknownSymbol(c, i))?;
                next_var += span;
                stack.push(instance);
            }
        }
    }
    match stack.len() {
        1 => {
            let conclusion = stack.pop().ok_or(ProofError::Empty)?.canonical();
            Ok(Derivation { conclusion })
        }
        n => Err(ProofError::Unconsumed(n)),
    }
}

/// The number of `N` symbols the proof starts with.
pub fn leading_necessitations(proof: &str) -> u32 {
    proof.chars().take_while(|c| *c == NECESSITATE).count() as u32
}

/// Orders proofs by length, then lexicographically.
/// This is the order used to pick a representative among proofs of the same conclusion.
pub fn proof_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// All representative proofs, grouped by length.
/// A length is published once and never changes afterwards.
#[derive(Clone, Debug, Default)]
pub struct RepresentativeTable {
    by_length: Vec<Vec<String>>,

    // The axiom symbols, in axiom set order.
    axioms: Vec<String>,
}

impl RepresentativeTable {
    pub fn new() -> RepresentativeTable {
        RepresentativeTable {
            by_length: vec![],
            axioms: vec![],
        }
    }

    /// A table with just the axioms at length one.
    pub fn with_axioms(axioms: &AxiomSet) -> RepresentativeTable {
        let mut table = RepresentativeTable::new();
        let symbols = axioms.proof_strings();
        table.publish(1, symbols.clone());
        table.axioms = symbols;
        table
    }

    pub fn publish(&mut self, length: u32, mut proofs: Vec<String>) {
        let i = length as usize;
        if i >= self.by_length.len() {
            self.by_length.resize(i + 1, vec![]);
        }
        debug_assert!(proofs.iter().all(|p| p.len() == i));
        proofs.sort();
        self.by_length[i] = proofs;
    }

    pub fn get(&self, length: u32) -> &[String] {
        self.by_length
            .get(length as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn resolve(&self, proof_ref: ProofRef) -> Option<&str> {
        match proof_ref {
            ProofRef::Axiom(i) => self.axioms.get(i as usize).map(|a| a.as_str()),
            ProofRef::Generated { length, index } => usize::try_from(index)
                .ok()
                .and_then(|i| self.get(length as u32).get(i))
                .map(|p| p.as_str()),
            ProofRef::Known(mut index) => {
                for proofs in &self.by_length {
                    if index < proofs.len() {
                        return Some(proofs[index].as_str());
                    }
                    index -= proofs.len();
                }
                None
            }
        }
    }

    /// The position of entry `index` of this length among all representatives.
    pub fn known_ref(&self, length: u32, index: usize) -> Option<ProofRef> {
        let row = self.by_length.get(length as usize)?;
        if index >= row.len() {
            return None;
        }
        let offset: usize = self.by_length[..length as usize].iter().map(|v| v.len()).sum();
        Some(ProofRef::Known(offset + index))
    }

    /// The highest length that has been published.
    pub fn known_limit(&self) -> u32 {
        self.by_length.len().saturating_sub(1) as u32
    }

    /// Total number of representatives over all lengths.
    pub fn total(&self) -> usize {
        self.by_length.iter().map(|v| v.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &String)> {
        self.by_length
            .iter()
            .enumerate()
            .flat_map(|(l, proofs)| proofs.iter().map(move |p| (l as u32, p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conclusion(proof: &str) -> String {
        parse_proof_string(proof, &AxiomSet::standard()).unwrap().key()
    }

    #[test]
    fn test_axioms_prove_themselves() {
        assert_eq!(conclusion("1"), "C0C1.0");
        assert_eq!(conclusion("3"), "CCN0N1C1.0");
    }

    #[test]
    fn test_detachment() {
        assert_eq!(conclusion("D11"), "C0C1C2.1");
        assert_eq!(conclusion("D21"), "CC0.1C0.0");
        assert_eq!(conclusion("DD211"), "C0.0");
    }

    #[test]
    fn test_necessitation() {
        assert_eq!(conclusion("N1"), "LC0C1.0");
        assert_eq!(conclusion("NN2"), "LLCC0C1.2CC0.1C0.2");
    }

    #[test]
    fn test_invalid_proofs() {
        let axioms = AxiomSet::standard();
        assert_eq!(
            parse_proof_string("D31", &axioms).unwrap_err(),
            ProofError::UnificationFailure(0)
        );
        assert_eq!(
            parse_proof_string("D1", &axioms).unwrap_err(),
            ProofError::MissingPremise(0)
        );
        assert_eq!(
            parse_proof_string("12", &axioms).unwrap_err(),
            ProofError::Unconsumed(2)
        );
        assert_eq!(
            parse_proof_string("D1x", &axioms).unwrap_err(),
            ProofError::UnknownSymbol('x', 2)
        );
        assert_eq!(
            parse_proof_string("DN11", &axioms).unwrap_err(),
            ProofError::NotAnImplication(0)
        );
    }

    #[test]
    fn test_leading_necessitations() {
        assert_eq!(leading_necessitations("NND11"), 2);
        assert_eq!(leading_necessitations("D1N1"), 0);
    }

    #[test]
    fn test_proof_order() {
        use std::cmp::Ordering;
        assert_eq!(proof_order("D11", "1"), Ordering::Greater);
        assert_eq!(proof_order("D12", "D21"), Ordering::Less);
    }

    #[test]
    fn test_table_publish_sorts() {
        let mut table = RepresentativeTable::with_axioms(&AxiomSet::standard());
        table.publish(3, vec!["D21".to_string(), "D11".to_string()]);
        assert_eq!(table.get(3), &["D11".to_string(), "D21".to_string()]);
        assert!(table.get(2).is_empty());
        assert!(table.get(99).is_empty());
        assert_eq!(table.known_limit(), 3);
        assert_eq!(table.total(), 5);
    }

    #[test]
    fn test_resolve_references() {
        let mut table = RepresentativeTable::with_axioms(&AxiomSet::standard());
        table.publish(3, vec!["D21".to_string(), "D11".to_string()]);
        assert_eq!(table.resolve(ProofRef::Axiom(2)), Some("3"));
        assert_eq!(table.resolve(ProofRef::Axiom(3)), None);
        assert_eq!(
            table.resolve(ProofRef::Generated { length: 3, index: 1 }),
            Some("D21")
        );
        assert_eq!(table.resolve(ProofRef::Generated { length: 2, index: 0 }), None);

        // Positions run through the axioms first.
        assert_eq!(table.resolve(ProofRef::Known(3)), Some("D11"));
        assert_eq!(table.resolve(ProofRef::Known(5)), None);
        assert_eq!(table.known_ref(3, 1), Some(ProofRef::Known(4)));
        assert_eq!(table.known_ref(3, 2), None);
        let all: Vec<&str> = (0..table.total())
            .filter_map(|i| table.resolve(ProofRef::Known(i)))
            .collect();
        let iterated: Vec<&str> = table.iter().map(|(_, p)| p.as_str()).collect();
        assert_eq!(all, iterated);
    }
}
