//! Tenant database names and passwords.
//!
//! Names are derived from `customer:tenant` so the same tenant always maps
//! to the same database and role; passwords are random per allocation.

use rand::Rng;
use sha2::{Digest, Sha256};

use pgfleet_core::DatabaseIdentity;

/// Length of generated database and role names.
pub const IDENTIFIER_LEN: usize = 32;

const PASSWORD_BYTES: usize = 24;

/// Deterministic database name and role for a tenant.
///
/// Both are `IDENTIFIER_LEN` lower-case alphanumeric characters starting
/// with a letter, so they are valid unquoted PostgreSQL identifiers.
pub fn database_identity(customer_id: &str, tenant_id: &str) -> DatabaseIdentity {
    let digest = hex::encode(Sha256::digest(format!("{customer_id}:{tenant_id}").as_bytes()));
    DatabaseIdentity {
        database_name: format!("db{}", &digest[..IDENTIFIER_LEN - 2]),
        user: format!("u{}", &digest[..IDENTIFIER_LEN - 1]),
    }
}

/// A fresh random password (hex-encoded).
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}
