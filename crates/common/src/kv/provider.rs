use std::fmt::{Debug, Display};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single value held by the store, along with the revision that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvNode {
    /// Full key, `<prefix>/<id>`
    pub key: String,
    pub value: String,
    /// Store-wide revision of the last write to this key
    pub modified_index: u64,
}

impl KvNode {
    /// The last path segment of the key
    pub fn id(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError<T> {
    #[error("unhandled kv provider error: {0}")]
    Provider(#[from] T),
    #[error("key not found: {0}")]
    NotFound(String),
    /// A compare-and-swap found a different value than expected
    #[error("compare failed for key: {0}")]
    Conflict(String),
    #[error("key already exists: {0}")]
    AlreadyExists(String),
}

/// Build the full key for an id under a prefix
pub fn key_for(prefix: &str, id: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), id)
}

/// Linearizable key-value store backing cluster-wide state.
///
/// Keys are grouped under prefixes. Alongside the values a provider keeps a
///  secondary name -> id index per prefix so records can be found by their
///  human-readable name as well as by their opaque id.
#[async_trait]
pub trait KvProvider: Send + Sync + std::fmt::Debug + Clone + 'static {
    type Error: Display + Debug + Send + Sync + 'static;

    /// Read the node stored at `<prefix>/<id>`
    ///
    /// Should fail with `KvError::NotFound` when no value is stored.
    async fn get_by_id(&self, prefix: &str, id: &str) -> Result<KvNode, KvError<Self::Error>>;

    /// Unconditionally create or overwrite `<prefix>/<id>`
    async fn set(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>>;

    /// Create `<prefix>/<id>`, failing with `KvError::AlreadyExists` if present
    async fn create(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>>;

    /// Replace the value at `<prefix>/<id>` only if it currently equals `expected`
    ///
    /// Should fail with the following errors to be considered correct:
    /// * `Err(KvError::NotFound)` - nothing is stored at the key
    /// * `Err(KvError::Conflict)` - the stored value differs from `expected`;
    ///   the store is left untouched
    async fn compare_and_swap(
        &self,
        prefix: &str,
        id: &str,
        expected: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>>;

    /// Remove `<prefix>/<id>`, failing with `KvError::NotFound` if absent
    async fn delete(&self, prefix: &str, id: &str) -> Result<(), KvError<Self::Error>>;

    /// List the direct children of a prefix, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError<Self::Error>>;

    /// Point `name` at `id` within the prefix's name index
    async fn add_to_index(
        &self,
        prefix: &str,
        name: &str,
        id: &str,
    ) -> Result<(), KvError<Self::Error>>;

    /// Remove `name` from the prefix's name index
    async fn delete_from_index(&self, prefix: &str, name: &str)
        -> Result<(), KvError<Self::Error>>;

    /// Resolve `name` to an id through the prefix's name index
    async fn find_id(&self, prefix: &str, name: &str) -> Result<String, KvError<Self::Error>>;

    /// Read a node by reference, where the reference is either an id or a
    ///  name held in the index.
    ///
    /// Ids that look like UUIDs are read directly. Anything else goes through
    ///  the index first, falling back to treating the reference as an id.
    async fn get(&self, prefix: &str, reference: &str) -> Result<KvNode, KvError<Self::Error>> {
        if Uuid::parse_str(reference).is_ok() {
            return self.get_by_id(prefix, reference).await;
        }
        let id = match self.find_id(prefix, reference).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    prefix = prefix,
                    reference = reference,
                    error = %e,
                    "kv: failed to find by index, getting by ref"
                );
                reference.to_string()
            }
        };
        self.get_by_id(prefix, &id).await
    }

    /// Store a value and index it under `name`.
    ///
    /// The value write is authoritative; a failure to update the index is
    ///  logged and does not fail the call.
    async fn create_with_index(
        &self,
        prefix: &str,
        id: &str,
        name: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        let node = self.set(prefix, id, value).await?;
        if let Err(e) = self.add_to_index(prefix, name, id).await {
            tracing::error!(
                prefix = prefix,
                name = name,
                id = id,
                error = %e,
                "kv: failed to create index"
            );
        }
        Ok(node)
    }
}
