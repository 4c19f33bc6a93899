//! Git plumbing: credentials, output parsing and the per-repository engine.

pub mod auth;
pub mod parse;
pub mod repository;
pub mod types;

pub use repository::GitRepositoryEngine;
pub use types::*;
