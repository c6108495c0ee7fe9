//! Owner/guest and edit/view roles, fixed for the lifetime of a session.

use serde::{Deserialize, Serialize};

/// What a session may do with the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    Edit,
    View,
}

/// Role assignment checked by every mutating entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionGate {
    is_owner: bool,
    permission: Permission,
}

impl PermissionGate {
    pub fn new(is_owner: bool, permission: Permission) -> Self {
        Self {
            is_owner,
            permission,
        }
    }

    /// `read_only` forces view regardless of the granted permission.
    pub fn from_options(read_only: bool, is_owner: bool, permission: Permission) -> Self {
        let permission = if read_only { Permission::View } else { permission };
        Self::new(is_owner, permission)
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn can_mutate(&self) -> bool {
        self.permission == Permission::Edit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_cannot_mutate() {
        assert!(!PermissionGate::new(false, Permission::View).can_mutate());
        assert!(PermissionGate::new(false, Permission::Edit).can_mutate());
    }

    #[test]
    fn test_read_only_overrides_permission() {
        let gate = PermissionGate::from_options(true, true, Permission::Edit);
        assert!(!gate.can_mutate());
        assert!(gate.is_owner());
        assert_eq!(gate.permission(), Permission::View);
    }
}
