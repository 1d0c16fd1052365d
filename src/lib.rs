pub mod axiom;
pub mod balancer;
pub mod collector;
pub mod config;
pub mod distributed;
pub mod generator;
pub mod kernel;
pub mod proof;
pub mod registry;
pub mod schema_index;
pub mod store;

#[cfg(test)]
mod tests;
