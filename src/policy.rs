//! Authorization collaborator.
//!
//! The cache core never decides who may read or mutate live data; it asks an
//! injected [`AccessPolicy`] for a verdict. The real implementation lives in
//! the Aula session layer and maps a user session to a role for the resource
//! scope in question.

/// The kind of access being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Mutate,
}

/// Black-box role/permission check consulted before every request-path
/// operation on cached or live data.
pub trait AccessPolicy: Send + Sync {
    fn allow(&self, action: Action, table: &str) -> bool;
}

/// Policy that grants everything. Used by tools and tests.
pub struct PermitAll;

impl AccessPolicy for PermitAll {
    fn allow(&self, _action: Action, _table: &str) -> bool {
        true
    }
}

/// Policy that denies everything. Used to verify enforcement in tests.
pub struct DenyAll;

impl AccessPolicy for DenyAll {
    fn allow(&self, _action: Action, _table: &str) -> bool {
        false
    }
}
