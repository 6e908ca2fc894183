//! Authorizer port.
//!
//! Permission logic lives outside the scheduler. The only question asked is
//! whether a principal may act on tasks it does not own.

use std::collections::HashSet;

pub trait Authorizer: Send + Sync {
    fn is_admin(&self, principal: &str) -> bool;
}

/// Nobody is an administrator; only owners may act on their tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnly;

impl Authorizer for OwnerOnly {
    fn is_admin(&self, _principal: &str) -> bool {
        false
    }
}

/// Fixed set of administrator principals.
#[derive(Debug, Clone, Default)]
pub struct StaticAdmins {
    admins: HashSet<String>,
}

impl StaticAdmins {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for StaticAdmins {
    fn is_admin(&self, principal: &str) -> bool {
        self.admins.contains(principal)
    }
}
