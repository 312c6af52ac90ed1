//! Static role → permission table.
//!
//! Roles outside the table (including every `Other` role) carry the
//! empty permission set.

use crate::domain::ApiKeyRole;

/// Actions an API key can be authorized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    SessionCreate,
    SessionRead,
    SessionUpdate,
    SessionRevoke,
    SessionList,
    TokenValidate,
    ApiKeyManage,
    ClusterRead,
    MetricsRead,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::SessionCreate => "session.create",
            Permission::SessionRead => "session.read",
            Permission::SessionUpdate => "session.update",
            Permission::SessionRevoke => "session.revoke",
            Permission::SessionList => "session.list",
            Permission::TokenValidate => "token.validate",
            Permission::ApiKeyManage => "apikey.manage",
            Permission::ClusterRead => "cluster.read",
            Permission::MetricsRead => "metrics.read",
        }
    }
}

/// Permission grants per role. Ordered most-privileged first, purely for
/// readability; lookup is by role name.
const ROLE_GRANTS: &[(&str, &[Permission])] = &[
    (
        "admin",
        &[
            Permission::SessionCreate,
            Permission::SessionRead,
            Permission::SessionUpdate,
            Permission::SessionRevoke,
            Permission::SessionList,
            Permission::TokenValidate,
            Permission::ApiKeyManage,
            Permission::ClusterRead,
            Permission::MetricsRead,
        ],
    ),
    (
        "issuer",
        &[
            Permission::SessionCreate,
            Permission::SessionRead,
            Permission::SessionUpdate,
            Permission::SessionRevoke,
            Permission::SessionList,
            Permission::TokenValidate,
        ],
    ),
    (
        "validator",
        &[Permission::TokenValidate, Permission::SessionRead],
    ),
    ("metrics", &[Permission::MetricsRead, Permission::ClusterRead]),
];

/// Whether `role` grants `perm`.
pub fn role_grants(role: &ApiKeyRole, perm: Permission) -> bool {
    ROLE_GRANTS
        .iter()
        .find(|(name, _)| *name == role.as_str())
        .is_some_and(|(_, grants)| grants.contains(&perm))
}
