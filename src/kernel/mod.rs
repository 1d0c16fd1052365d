pub mod atom;
pub mod formula;
pub mod unifier;
pub mod variable_map;
