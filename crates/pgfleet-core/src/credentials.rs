//! Database identities and single-read credential handles.
//!
//! Credentials are never written to the registry. The planner generates
//! them, returns them to the allocation caller, and passes the workload
//! executor a [`CredentialHandle`] that yields the secret exactly once.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::collaborators::{CollaboratorError, CollaboratorResult};

/// Deterministic database name and login role for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseIdentity {
    pub database_name: String,
    pub user: String,
}

/// Login credentials for a tenant database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One-shot hand-off of credentials to a collaborator.
///
/// Clones share the same slot, so the secret can be taken once across all
/// of them. The scope names the tenant/pool pair the handle was issued for.
#[derive(Clone)]
pub struct CredentialHandle {
    scope: String,
    slot: Arc<Mutex<Option<Credentials>>>,
}

impl CredentialHandle {
    pub fn new(scope: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            scope: scope.into(),
            slot: Arc::new(Mutex::new(Some(credentials))),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Take the credentials. Fails if they were already taken.
    pub fn take(&self) -> CollaboratorResult<Credentials> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
            .ok_or_else(|| CollaboratorError::CredentialConsumed(self.scope.clone()))
    }

    pub fn is_consumed(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("scope", &self.scope)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            user: "u_abc".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn handle_yields_once() {
        let handle = CredentialHandle::new("tenant-1@pool-1", creds());
        assert!(!handle.is_consumed());

        let first = handle.take().unwrap();
        assert_eq!(first.password, "hunter2");
        assert!(handle.is_consumed());

        let second = handle.take();
        assert!(matches!(second, Err(CollaboratorError::CredentialConsumed(s)) if s == "tenant-1@pool-1"));
    }

    #[test]
    fn clones_share_the_slot() {
        let handle = CredentialHandle::new("scope", creds());
        let clone = handle.clone();
        clone.take().unwrap();
        assert!(handle.take().is_err());
    }

    #[test]
    fn debug_never_prints_password() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("hunter2"));
    }
}
