//! Composition root: wires the tree, providers, dependency waits, readiness
//! and status watches into deploy and teardown of whole instances.

pub mod engine;

pub use engine::SyncEngine;
