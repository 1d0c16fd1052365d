use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::kernel::atom::{Atom, Operator, VarId};

/// Errors from reading a formula in prefix notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    UnexpectedEnd,
    TrailingInput(usize),
    UnknownCharacter(char, usize),
    /// Letter variables and numeric variables can't be combined in one formula.
    MixedVariables,
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormulaError::UnexpectedEnd => write!(f, "formula ended unexpectedly"),
            FormulaError::TrailingInput(pos) => {
                write!(f, "unexpected trailing input at position {}", pos)
            }
            FormulaError::UnknownCharacter(c, pos) => {
                write!(f, "unknown character '{}' at position {}", c, pos)
            }
            FormulaError::MixedVariables => {
                write!(f, "letter and numeric variables cannot be mixed")
            }
        }
    }
}

impl std::error::Error for FormulaError {}

struct Node {
    head: Atom,
    args: Vec<Formula>,

    /// The number of nodes in this formula, counting variables.
    size: u32,

    max_variable: Option<VarId>,
}

/// An immutable formula tree.
/// Nodes are reference counted, so cloning a formula is cheap and substitutions share every
/// subtree they leave untouched.
#[derive(Clone)]
pub struct Formula(Arc<Node>);

impl Formula {
    pub fn variable(id: VarId) -> Formula {
        Formula(Arc::new(Node {
            head: Atom::Variable(id),
            args: vec![],
            size: 1,
            max_variable: Some(id),
        }))
    }

    pub fn compound(op: Operator, args: Vec<Formula>) -> Formula {
        debug_assert_eq!(op.arity(), args.len());
        let size = 1 + args.iter().map(|a| a.size()).sum::<u32>();
        let max_variable = args.iter().filter_map(|a| a.max_variable()).max();
        Formula(Arc::new(Node {
            head: Atom::Operator(op),
            args,
            size,
            max_variable,
        }))
    }

    pub fn implication(antecedent: Formula, consequent: Formula) -> Formula {
        Formula::compound(Operator::Implication, vec![antecedent, consequent])
    }

    pub fn necessity(inner: Formula) -> Formula {
        Formula::compound(Operator::Necessity, vec![inner])
    }

    pub fn head(&self) -> Atom {
        self.0.head
    }

    pub fn args(&self) -> &[Formula] {
        &self.0.args
    }

    pub fn size(&self) -> u32 {
        self.0.size
    }

    pub fn max_variable(&self) -> Option<VarId> {
        self.0.max_variable
    }

    /// The number of distinct variable ids this formula could use, assuming ids start at zero.
    pub fn variable_span(&self) -> VarId {
        self.max_variable().map_or(0, |m| m + 1)
    }

    pub fn as_variable(&self) -> Option<VarId> {
        match self.0.head {
            Atom::Variable(i) => Some(i),
            Atom::Operator(_) => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.0.head.is_variable()
    }

    pub fn operator(&self) -> Option<Operator> {
        match self.0.head {
            Atom::Operator(op) => Some(op),
            Atom::Variable(_) => None,
        }
    }

    /// Splits an implication into its antecedent and consequent.
    pub fn as_implication(&self) -> Option<(&Formula, &Formula)> {
        match (self.operator(), self.args()) {
            (Some(Operator::Implication), [left, right]) => Some((left, right)),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Formula) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Rebuilds the formula with every variable passed through `f`.
    /// Subtrees without variables are shared rather than copied.
    pub fn map_variables(&self, f: &mut impl FnMut(VarId) -> VarId) -> Formula {
        match self.0.head {
            Atom::Variable(i) => {
                let j = f(i);
                if i == j {
                    self.clone()
                } else {
                    Formula::variable(j)
                }
            }
            Atom::Operator(op) => {
                if self.max_variable().is_none() {
                    return self.clone();
                }
                let args = self.args().iter().map(|a| a.map_variables(f)).collect();
                Formula::compound(op, args)
            }
        }
    }

    /// Adds `offset` to every variable id.
    /// This is how an axiom gets a fresh instance for each use in a derivation.
    pub fn shifted(&self, offset: VarId) -> Formula {
        if offset == 0 {
            return self.clone();
        }
        self.map_variables(&mut |i| i + offset)
    }

    /// Renumbers variables in order of first appearance, starting at zero.
    /// Two formulas that differ only by variable names have the same canonical form.
    pub fn canonical(&self) -> Formula {
        let mut renaming: HashMap<VarId, VarId> = HashMap::new();
        self.map_variables(&mut |i| {
            let next = renaming.len() as VarId;
            *renaming.entry(i).or_insert(next)
        })
    }

    /// The canonical key of this formula, which identifies it up to variable renaming.
    pub fn key(&self) -> String {
        self.canonical().to_polish()
    }

    /// Prefix notation. Variables are decimal numbers, with a '.' between two consecutive ones.
    pub fn to_polish(&self) -> String {
        let mut answer = String::with_capacity(2 * self.size() as usize);
        self.write_polish(&mut answer);
        answer
    }

    fn write_polish(&self, out: &mut String) {
        match self.0.head {
            Atom::Variable(i) => {
                if out.ends_with(|c: char| c.is_ascii_digit()) {
                    out.push('.');
                }
                out.push_str(&i.to_string());
            }
            Atom::Operator(op) => {
                out.push(op.to_char());
                for arg in self.args() {
                    arg.write_polish(out);
                }
            }
        }
    }

    /// Reads a formula in prefix notation.
    /// Variables are either decimal numbers ("C0C1.0") or lowercase letters ("CpCqp").
    /// Letters are numbered in order of first appearance.
    pub fn parse_polish(text: &str) -> Result<Formula, FormulaError> {
        let chars: Vec<char> = text.trim().chars().collect();
        let mut parser = PolishParser {
            chars: &chars,
            pos: 0,
            letters: HashMap::new(),
            saw_digits: false,
        };
        let formula = parser.parse()?;
        if parser.pos < chars.len() {
            return Err(FormulaError::TrailingInput(parser.pos));
        }
        Ok(formula)
    }
}

struct PolishParser<'a> {
    chars: &'a [char],
    pos: usize,
    letters: HashMap<char, VarId>,
    saw_digits: bool,
}

impl PolishParser<'_> {
    fn parse(&mut self) -> Result<Formula, FormulaError> {
        let c = *self.chars.get(self.pos).ok_or(FormulaError::UnexpectedEnd)?;
        if let Some(op) = Operator::from_char(c) {
            self.pos += 1;
            let mut args = Vec::with_capacity(op.arity());
            for _ in 0..op.arity() {
                args.push(self.parse()?);
            }
            return Ok(Formula::compound(op, args));
        }
        if c.is_ascii_digit() {
            if !self.letters.is_empty() {
                return Err(FormulaError::MixedVariables);
            }
            self.saw_digits = true;
            let start = self.pos;
            let mut id: VarId = 0;
            while let Some(d) = self.chars.get(self.pos).and_then(|c| c.to_digit(10)) {
                id = id
                    .checked_mul(10)
                    .and_then(|x| x.checked_add(d))
                    .ok_or(FormulaError::UnknownCharacter(c, start))?;
                self.pos += 1;
            }
            // A dot only separates two numeric variables.
            if self.chars.get(self.pos) == Some(&'.') {
                self.pos += 1;
            }
            return Ok(Formula::variable(id));
        }
        if c.is_ascii_lowercase() {
            if self.saw_digits {
                return Err(FormulaError::MixedVariables);
            }
            self.pos += 1;
            let next = self.letters.len() as VarId;
            let id = *self.letters.entry(c).or_insert(next);
            return Ok(Formula::variable(id));
        }
        Err(FormulaError::UnknownCharacter(c, self.pos))
    }
}

impl PartialEq for Formula {
    fn eq(&self, other: &Formula) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.0.head == other.0.head && self.0.size == other.0.size && self.0.args == other.0.args
    }
}

impl Eq for Formula {}

impl Hash for Formula {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.head.hash(state);
        for arg in self.args() {
            arg.hash(state);
        }
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_polish())
    }
}

/// Infix notation, without parentheses around the outermost operator.
impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_infix(self, f, true)
    }
}

fn write_infix(formula: &Formula, f: &mut fmt::Formatter, outermost: bool) -> fmt::Result {
    match (formula.head(), formula.args()) {
        (Atom::Variable(i), _) => write!(f, "{}", i),
        (Atom::Operator(op), [inner]) => {
            write!(f, "{}", op.infix_symbol())?;
            write_infix(inner, f, false)
        }
        (Atom::Operator(op), [left, right]) => {
            if !outermost {
                write!(f, "(")?;
            }
            write_infix(left, f, false)?;
            write!(f, "{}", op.infix_symbol())?;
            write_infix(right, f, false)?;
            if !outermost {
                write!(f, ")")?;
            }
            Ok(())
        }
        (Atom::Operator(op), _) => write!(f, "{}", op),
    }
}
