use std::fmt;

use crate::kernel::atom::VarId;
use crate::kernel::formula::{Formula, FormulaError};

/// Axioms are named by single characters, digits first.
pub const AXIOM_IDS: &str = "123456789abcdefghijklmnopqrstuvwxyz";

/// The three-axiom base system, in order 1, 2, 3.
const STANDARD_AXIOMS: [&str; 3] = ["CpCqp", "CCpCqrCCpqCpr", "CCNpNqCqp"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Axiom {
    pub id: char,
    pub formula: Formula,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxiomError {
    Empty,
    TooMany(usize),
    Formula(usize, FormulaError),
}

impl fmt::Display for AxiomError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AxiomError::Empty => write!(f, "no axioms given"),
            AxiomError::TooMany(n) => write!(
                f,
                "{} axioms given, but at most {} are supported",
                n,
                AXIOM_IDS.len()
            ),
            AxiomError::Formula(i, e) => write!(f, "axiom {}: {}", i + 1, e),
        }
    }
}

impl std::error::Error for AxiomError {}

/// The fixed set of axiom schemas for a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxiomSet {
    axioms: Vec<Axiom>,

    /// Indexed by the byte value of the id, for fast lookup while parsing proofs.
    by_char: Vec<Option<u8>>,

    standard: bool,
}

impl AxiomSet {
    pub fn standard() -> AxiomSet {
        let formulas = STANDARD_AXIOMS
            .iter()
            .filter_map(|s| Formula::parse_polish(s).ok())
            .collect();
        let mut set = AxiomSet::from_formulas(formulas);
        set.standard = true;
        set
    }

    fn from_formulas(formulas: Vec<Formula>) -> AxiomSet {
        let mut by_char = vec![None; 128];
        let axioms: Vec<Axiom> = formulas
            .into_iter()
            .zip(AXIOM_IDS.chars())
            .enumerate()
            .map(|(i, (formula, id))| {
                by_char[id as usize] = Some(i as u8);
                Axiom {
                    id,
                    formula: formula.canonical(),
                }
            })
            .collect();
        AxiomSet {
            axioms,
            by_char,
            standard: false,
        }
    }

    /// Parses a comma-separated list of formulas in prefix notation.
    pub fn parse_list(text: &str) -> Result<AxiomSet, AxiomError> {
        let parts: Vec<&str> = text
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(AxiomError::Empty);
        }
        if parts.len() > AXIOM_IDS.len() {
            return Err(AxiomError::TooMany(parts.len()));
        }
        let mut formulas = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            formulas.push(Formula::parse_polish(part).map_err(|e| AxiomError::Formula(i, e))?);
        }
        let mut set = AxiomSet::from_formulas(formulas);
        set.standard = set == AxiomSet::standard_unflagged();
        Ok(set)
    }

    fn standard_unflagged() -> AxiomSet {
        let mut set = AxiomSet::standard();
        set.standard = false;
        set
    }

    pub fn len(&self) -> usize {
        self.axioms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axioms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Axiom> {
        self.axioms.iter()
    }

    pub fn get(&self, index: u8) -> Option<&Axiom> {
        self.axioms.get(index as usize)
    }

    /// The index of the axiom with this id.
    pub fn index_of(&self, id: char) -> Option<u8> {
        self.by_char.get(id as usize).copied().flatten()
    }

    /// A copy of the axiom whose variables start at `offset`, plus the number of ids it uses.
    pub fn instantiate(&self, index: u8, offset: VarId) -> Option<(Formula, VarId)> {
        let axiom = self.get(index)?;
        Some((axiom.formula.shifted(offset), axiom.formula.variable_span()))
    }

    /// The proof strings of length one.
    pub fn proof_strings(&self) -> Vec<String> {
        self.axioms.iter().map(|a| a.id.to_string()).collect()
    }

    /// "default" for the standard system, otherwise a hash of the canonical axiom listing.
    pub fn fingerprint(&self) -> String {
        if self.standard {
            return "default".to_string();
        }
        let listing: Vec<String> = self.axioms.iter().map(|a| a.formula.to_polish()).collect();
        blake3::hash(listing.join(",").as_bytes())
            .to_hex()
            .to_string()
    }

    /// A human-readable listing, one axiom per line.
    pub fn describe(&self) -> Vec<String> {
        self.axioms
            .iter()
            .map(|a| format!("{}: {} = {}", a.id, a.formula.to_polish(), a.formula))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_axioms() {
        let axioms = AxiomSet::standard();
        assert_eq!(axioms.len(), 3);
        assert_eq!(axioms.fingerprint(), "default");
        assert_eq!(axioms.index_of('2'), Some(1));
        assert_eq!(axioms.index_of('D'), None);
        assert_eq!(axioms.get(2).unwrap().formula.to_polish(), "CCN0N1C1.0");
    }

    #[test]
    fn test_parsed_standard_is_recognized() {
        let axioms = AxiomSet::parse_list("C0C1.0, CC0C1.2CC0.1C0.2, CCN0N1C1.0").unwrap();
        assert_eq!(axioms.fingerprint(), "default");
    }

    #[test]
    fn test_custom_fingerprint_is_stable() {
        let a = AxiomSet::parse_list("CpCqp,CCpCqrCCpqCpr").unwrap();
        let b = AxiomSet::parse_list("CqCpq,CCqCrpCCqrCqp").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_too_many_axioms() {
        let list = vec!["CpCqp"; 36].join(",");
        assert_eq!(AxiomSet::parse_list(&list), Err(AxiomError::TooMany(36)));
        assert_eq!(AxiomSet::parse_list(" , "), Err(AxiomError::Empty));
    }

    #[test]
    fn test_instantiate_renames() {
        let axioms = AxiomSet::standard();
        let (formula, span) = axioms.instantiate(1, 5).unwrap();
        assert_eq!(formula.to_polish(), "CC5C6.7CC5.6C5.7");
        assert_eq!(span, 3);
    }
}
