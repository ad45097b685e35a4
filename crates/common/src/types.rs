use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved subvolume every dot's content lives under.
pub const DEFAULT_SUBVOLUME: &str = "__default__";

/// Namespace assumed when a volume name carries none.
pub const ADMIN_NAMESPACE: &str = "admin";

/// Opaque identifier of a replicated filesystem (a dot or one of its branches).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilesystemId(String);

impl FilesystemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FilesystemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FilesystemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Human-readable name of a dot: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeName {
    pub namespace: String,
    pub name: String,
}

impl VolumeName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Render the name, omitting the namespace when it is the admin one
    pub fn string_without_admin(&self) -> String {
        if self.namespace == ADMIN_NAMESPACE {
            self.name.clone()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Registry record tying a filesystem id to its name and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopLevelFilesystem {
    pub filesystem_id: FilesystemId,
    pub name: VolumeName,
    pub owner_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_display() {
        let admin = VolumeName::new(ADMIN_NAMESPACE, "data");
        assert_eq!(admin.to_string(), "admin/data");
        assert_eq!(admin.string_without_admin(), "data");

        let other = VolumeName::new("alice", "data");
        assert_eq!(other.string_without_admin(), "alice/data");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        assert_ne!(FilesystemId::generate(), FilesystemId::generate());
    }
}
