use std::fmt;

use crate::kernel::atom::VarId;
use crate::kernel::formula::Formula;

// A Substitution maps variable ids to formulas.
// Bindings are triangular: a bound formula may itself contain bound variables, so lookups
// have to chase chains until they reach an unbound variable or an operator node.
// Nothing is applied eagerly. The only formula that ever gets rebuilt is the one the caller
// asks for via apply.
#[derive(Clone, Default)]
pub struct Substitution {
    bindings: Vec<Option<Formula>>,
}

impl Substitution {
    pub fn new() -> Substitution {
        Substitution { bindings: vec![] }
    }

    pub fn get(&self, id: VarId) -> Option<&Formula> {
        self.bindings.get(id as usize).and_then(|b| b.as_ref())
    }

    /// The number of bound variables.
    pub fn len(&self) -> usize {
        self.bindings.iter().filter(|b| b.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bind(&mut self, id: VarId, formula: Formula) {
        let i = id as usize;
        if i >= self.bindings.len() {
            self.bindings.resize(i + 1, None);
        }
        self.bindings[i] = Some(formula);
    }

    // Follows variable bindings until reaching something unbound or compound.
    fn resolve<'a>(&'a self, mut formula: &'a Formula) -> &'a Formula {
        while let Some(bound) = formula.as_variable().and_then(|v| self.get(v)) {
            formula = bound;
        }
        formula
    }

    // Whether the variable appears in the formula, after resolving bindings.
    fn occurs(&self, id: VarId, formula: &Formula) -> bool {
        let formula = self.resolve(formula);
        match formula.as_variable() {
            Some(v) => v == id,
            None => formula.args().iter().any(|arg| self.occurs(id, arg)),
        }
    }

    /// Extends this substitution so that the two formulas become equal.
    /// Returns false if that's impossible. On failure the substitution is left partially
    /// extended and shouldn't be reused.
    pub fn unify(&mut self, left: &Formula, right: &Formula) -> bool {
        let mut work = vec![(left.clone(), right.clone())];
        while let Some((a, b)) = work.pop() {
            let a = self.resolve(&a).clone();
            let b = self.resolve(&b).clone();
            if a.ptr_eq(&b) {
                continue;
            }
            match (a.as_variable(), b.as_variable()) {
                (Some(x), Some(y)) if x == y => {}
                (Some(x), _) => {
                    if self.occurs(x, &b) {
                        return false;
                    }
                    self.bind(x, b);
                }
                (None, Some(y)) => {
                    if self.occurs(y, &a) {
                        return false;
                    }
                    self.bind(y, a);
                }
                (None, None) => {
                    if a.head() != b.head() {
                        return false;
                    }
                    for (l, r) in a.args().iter().zip(b.args()) {
                        work.push((l.clone(), r.clone()));
                    }
                }
            }
        }
        true
    }

    /// Applies the substitution completely.
    /// Subtrees that the substitution doesn't touch are shared with the input.
    pub fn apply(&self, formula: &Formula) -> Formula {
        if formula.max_variable().is_none() {
            return formula.clone();
        }
        let resolved = self.resolve(formula);
        let op = match resolved.operator() {
            Some(op) => op,
            None => return resolved.clone(),
        };
        let args: Vec<Formula> = resolved.args().iter().map(|a| self.apply(a)).collect();
        if args.iter().zip(resolved.args()).all(|(new, old)| new.ptr_eq(old)) {
            return resolved.clone();
        }
        Formula::compound(op, args)
    }
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for (i, binding) in self.bindings.iter().enumerate() {
            if let Some(formula) = binding {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "x{} -> {}", i, formula.to_polish())?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Finds a most general unifier of the two formulas, if there is one.
/// The formulas are expected to use disjoint variables when they come from independent
/// derivations; shared variables are treated as the same variable.
pub fn try_unify(left: &Formula, right: &Formula) -> Option<Substitution> {
    let mut substitution = Substitution::new();
    if substitution.unify(left, right) {
        Some(substitution)
    } else {
        None
    }
}

/// Condensed detachment.
/// Unifies the antecedent of the conditional with the minor premise and returns the
/// consequent under the unifier. Returns None if the conditional isn't an implication or the
/// two don't unify.
pub fn detach(conditional: &Formula, minor: &Formula) -> Option<Formula> {
    let (antecedent, consequent) = conditional.as_implication()?;
    let substitution = try_unify(antecedent, minor)?;
    Some(substitution.apply(consequent))
}
