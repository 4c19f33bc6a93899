//! Desired-state tree client.
//!
//! The tree itself lives in an external hierarchical store; this module
//! reproduces the handle/level contract the engine relies on and ships an
//! in-memory store for embedding and tests.

pub mod app_context;
pub mod error;
pub mod memory;
pub mod reference;
pub mod store;
pub mod types;

pub use app_context::{AppContext, Handle};
pub use error::ContextError;
pub use memory::MemoryContextStore;
pub use reference::ContextReference;
pub use store::ContextStore;
pub use types::{
    AppContextStatus, AppDependencies, AppOrder, ClusterReadyStatus, CompositeAppMeta,
    InstructionKind, LogicalCloudInfo, ResourceDependencies, ResourceOrder,
};
