use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of access being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionKind {
    Read,
    Create,
    Update,
    Delete,
    Share,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 5] = [
        PermissionKind::Read,
        PermissionKind::Create,
        PermissionKind::Update,
        PermissionKind::Delete,
        PermissionKind::Share,
    ];

    /// Kinds whose commit-time checks are evaluated at call time as well.
    ///
    /// Reads, deletes and shares do not observe later mutations, so there
    /// is nothing to wait for.
    pub fn is_inline_only(&self) -> bool {
        matches!(
            self,
            PermissionKind::Read | PermissionKind::Delete | PermissionKind::Share
        )
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionKind::Read => write!(f, "READ"),
            PermissionKind::Create => write!(f, "CREATE"),
            PermissionKind::Update => write!(f, "UPDATE"),
            PermissionKind::Delete => write!(f, "DELETE"),
            PermissionKind::Share => write!(f, "SHARE"),
        }
    }
}

/// Whether permission checks run at all for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Active,
    /// Every check passes. Reserved for trusted internal callers.
    Bypass,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_only_kinds() {
        assert!(PermissionKind::Read.is_inline_only());
        assert!(PermissionKind::Delete.is_inline_only());
        assert!(PermissionKind::Share.is_inline_only());
        assert!(!PermissionKind::Create.is_inline_only());
        assert!(!PermissionKind::Update.is_inline_only());
    }

    #[test]
    fn display_is_uppercase() {
        let names: Vec<String> = PermissionKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["READ", "CREATE", "UPDATE", "DELETE", "SHARE"]);
    }
}
