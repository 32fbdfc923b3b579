// src/lib.rs
pub mod adapters;
pub mod alerts;
pub mod consolidation;
pub mod coordinator;
pub mod ensemble;
pub mod error;
pub mod grading;
pub mod lock;
pub mod models;
pub mod sources;
pub mod store;
pub mod utils;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
