//! External policy reader (C9, §6): two booleans read once at startup and
//! held thereafter as plain fields on the root context, not re-read.

use crate::store::{Store, XenstoreError};

fn secureboot_path(domid: u32) -> String {
    format!("/local/domain/{domid}/platform/secureboot")
}

fn auth_enforce_path(domid: u32) -> String {
    format!("/local/domain/{domid}/platform/auth-enforce")
}

/// Runtime policy read once at startup (§4.6 step 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub secureboot: bool,
    pub auth_enforce: bool,
}

/// Reads the secure-boot and auth-enforce booleans for `domid`.
///
/// `secureboot` is enabled only by the literal string `"true"`; anything
/// else (including absence) means disabled. `auth_enforce` is disabled
/// only by the literal string `"false"`; anything else, or absence, means
/// enforced (§6).
pub fn read_policy(store: &dyn Store, domid: u32) -> Result<Policy, XenstoreError> {
    let secureboot = store.read(&secureboot_path(domid))?.as_deref() == Some("true");
    let auth_enforce = store.read(&auth_enforce_path(domid))?.as_deref() != Some("false");
    Ok(Policy { secureboot, auth_enforce })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn defaults_to_secureboot_off_and_auth_enforce_on() {
        let store = MemoryStore::new();
        assert_eq!(read_policy(&store, 1).unwrap(), Policy { secureboot: false, auth_enforce: true });
    }

    #[test]
    fn explicit_values_are_honored() {
        let store = MemoryStore::seeded(&[
            ("/local/domain/2/platform/secureboot", "true"),
            ("/local/domain/2/platform/auth-enforce", "false"),
        ]);
        assert_eq!(read_policy(&store, 2).unwrap(), Policy { secureboot: true, auth_enforce: false });
    }

    #[test]
    fn unrecognized_auth_enforce_value_still_enforces() {
        let store = MemoryStore::seeded(&[("/local/domain/3/platform/auth-enforce", "maybe")]);
        assert!(read_policy(&store, 3).unwrap().auth_enforce);
    }
}
