use std::fmt;

use crate::kernel::atom::VarId;
use crate::kernel::formula::Formula;

// A VariableMap maintains a mapping from variables to formulas, allowing us to turn a more
// general formula into a more specific one by substituting variables.
// Only the general side gets substituted. Variables of the specific formula are treated as
// constants, so the two formulas may reuse the same variable ids.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct VariableMap {
    map: Vec<Option<Formula>>,
}

impl VariableMap {
    pub fn new() -> VariableMap {
        VariableMap { map: Vec::new() }
    }

    pub fn get_mapping(&self, i: VarId) -> Option<&Formula> {
        self.map.get(i as usize).and_then(|f| f.as_ref())
    }

    pub fn match_var(&mut self, var_id: VarId, special: &Formula) -> bool {
        let i = var_id as usize;
        if i >= self.map.len() {
            self.map.resize(i + 1, None);
        }
        match &self.map[i] {
            None => {
                self.map[i] = Some(special.clone());
                true
            }
            Some(general) => general == special,
        }
    }

    /// Extends the map so that it sends `general` to `special`, if possible.
    pub fn match_formulas(&mut self, general: &Formula, special: &Formula) -> bool {
        if let Some(i) = general.as_variable() {
            return self.match_var(i, special);
        }
        // A general formula can never be smaller than its instances.
        if general.size() > special.size() || general.head() != special.head() {
            return false;
        }
        general
            .args()
            .iter()
            .zip(special.args())
            .all(|(g, s)| self.match_formulas(g, s))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Formula)> {
        self.map
            .iter()
            .enumerate()
            .filter_map(|(i, opt)| opt.as_ref().map(|f| (i, f)))
    }

    /// Unmapped variables are kept as-is.
    pub fn specialize(&self, formula: &Formula) -> Formula {
        if let Some(i) = formula.as_variable() {
            return match self.get_mapping(i) {
                Some(replacement) => replacement.clone(),
                None => formula.clone(),
            };
        }
        match formula.operator() {
            Some(op) => Formula::compound(
                op,
                formula.args().iter().map(|a| self.specialize(a)).collect(),
            ),
            None => formula.clone(),
        }
    }
}

impl fmt::Display for VariableMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for (i, formula) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "x{} -> {}", i, formula.to_polish())?;
            first = false;
        }
        write!(f, ")")
    }
}

/// Whether some substitution of the variables of `general` turns it into `specific`.
/// Every formula is a schema of itself.
pub fn is_schema_of(general: &Formula, specific: &Formula) -> bool {
    VariableMap::new().match_formulas(general, specific)
}
