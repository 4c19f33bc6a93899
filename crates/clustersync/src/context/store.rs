//! Storage contract behind the desired-state tree.

use async_trait::async_trait;
use serde_json::Value;

use super::error::Result;

/// Hierarchical key-value store backing the desired-state tree.
///
/// Keys are `/`-terminated handle strings. Implementations must make each
/// single-key write atomic; the tree never relies on multi-key transactions.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Writes `value` at `key`, replacing any existing value.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Reads the value at `key`. Returns `ContextError::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Value>;

    /// Returns true if a value is stored at `key`.
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Lists every key starting with `prefix`, in lexical order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}
