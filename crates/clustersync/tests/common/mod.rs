//! Shared test utilities for clustersync integration tests.
//!
//! - `TestHarness`: a sync engine wired to a local bare git remote
//! - builders for instances, manifests and status reports

pub mod builders;
pub mod harness;

// Each test binary uses a different subset.
#[allow(unused_imports)]
pub use builders::*;
#[allow(unused_imports)]
pub use harness::TestHarness;
