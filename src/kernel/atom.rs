use std::fmt;

pub type VarId = u32;

/// The fixed operator signature formulas are built from.
/// Each operator is written as a single uppercase letter in prefix notation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operator {
    /// Material implication, the only operator detachment cares about.
    Implication,
    Negation,
    /// The modal "necessarily", introduced by the necessitation rule.
    Necessity,
    Conjunction,
    Disjunction,
    Equivalence,
}

impl Operator {
    pub fn arity(self) -> usize {
        match self {
            Operator::Negation | Operator::Necessity => 1,
            Operator::Implication
            | Operator::Conjunction
            | Operator::Disjunction
            | Operator::Equivalence => 2,
        }
    }

    pub fn from_char(c: char) -> Option<Operator> {
        match c {
            'C' => Some(Operator::Implication),
            'N' => Some(Operator::Negation),
            'L' => Some(Operator::Necessity),
            'K' => Some(Operator::Conjunction),
            'A' => Some(Operator::Disjunction),
            'E' => Some(Operator::Equivalence),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        match self {
            Operator::Implication => 'C',
            Operator::Negation => 'N',
            Operator::Necessity => 'L',
            Operator::Conjunction => 'K',
            Operator::Disjunction => 'A',
            Operator::Equivalence => 'E',
        }
    }

    /// The symbol used when printing in infix notation.
    pub fn infix_symbol(self) -> &'static str {
        match self {
            Operator::Implication => "→",
            Operator::Negation => "¬",
            Operator::Necessity => "□",
            Operator::Conjunction => "∧",
            Operator::Disjunction => "∨",
            Operator::Equivalence => "↔",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// An atom is the head of a formula node.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Atom {
    Variable(VarId),
    Operator(Operator),
}

impl Atom {
    pub fn is_variable(&self) -> bool {
        matches!(self, Atom::Variable(_))
    }

    pub fn arity(&self) -> usize {
        match self {
            Atom::Variable(_) => 0,
            Atom::Operator(op) => op.arity(),
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Atom::Variable(i) => write!(f, "x{}", i),
            Atom::Operator(op) => write!(f, "{}", op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_chars_round_trip() {
        for c in "CNLKAE".chars() {
            let op = Operator::from_char(c).unwrap();
            assert_eq!(op.to_char(), c);
        }
        assert_eq!(Operator::from_char('D'), None);
    }

    #[test]
    fn test_operator_arity() {
        assert_eq!(Operator::Implication.arity(), 2);
        assert_eq!(Operator::Necessity.arity(), 1);
        assert_eq!(Atom::Variable(3).arity(), 0);
    }
}
