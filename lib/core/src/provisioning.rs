//! First-boot key provisioning (C8): installs vendor-supplied secure-boot
//! keys into an empty store. Runs once, only when `Backend::init` reports
//! `InitResult::FirstBoot`.

use crate::auth::{name_deployed_mode, name_kek, name_pk, EFI_GLOBAL_VARIABLE_GUID, EFI_IMAGE_SECURITY_DATABASE_GUID};
use crate::store::{StoreError, VariableStore};
use crate::time::EfiTime;
use crate::variable::VariableAttributes;

const AUTHENTICATED_NV: VariableAttributes = VariableAttributes::from_bits_truncate(
    VariableAttributes::NON_VOLATILE.bits()
        | VariableAttributes::BOOTSERVICE_ACCESS.bits()
        | VariableAttributes::RUNTIME_ACCESS.bits()
        | VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS.bits(),
);

/// DER-encoded key material supplied via `--arg pk-path:`/`kek-path:`/
/// `db-path:`/`dbx-path:`; a key whose path argument was absent is `None`
/// and left unprovisioned.
#[derive(Default)]
pub struct VendorKeys {
    pub pk: Option<Vec<u8>>,
    pub kek: Option<Vec<u8>>,
    pub db: Option<Vec<u8>>,
    pub dbx: Option<Vec<u8>>,
}

fn name_db() -> Vec<u16> {
    "db".encode_utf16().collect()
}
fn name_dbx() -> Vec<u16> {
    "dbx".encode_utf16().collect()
}

/// Installs `keys` into `store`, treating each as a locally-trusted
/// bootstrap write rather than an authenticated one (it arrives from the
/// host's own filesystem, not a guest request, so there is no
/// `EFI_VARIABLE_AUTHENTICATION_2` envelope to verify). Installed in
/// content-then-PK order so the store is never briefly in Setup mode with
/// a dangling KEK/db that references a PK it doesn't yet have.
pub fn provision_first_boot(store: &mut VariableStore, keys: &VendorKeys) -> Result<(), StoreError> {
    if let Some(dbx) = &keys.dbx {
        store.upsert(&name_dbx(), EFI_IMAGE_SECURITY_DATABASE_GUID, AUTHENTICATED_NV, EfiTime::ZERO, dbx.clone())?;
    }
    if let Some(db) = &keys.db {
        store.upsert(&name_db(), EFI_IMAGE_SECURITY_DATABASE_GUID, AUTHENTICATED_NV, EfiTime::ZERO, db.clone())?;
    }
    if let Some(kek) = &keys.kek {
        store.upsert(&name_kek(), EFI_GLOBAL_VARIABLE_GUID, AUTHENTICATED_NV, EfiTime::ZERO, kek.clone())?;
    }
    if let Some(pk) = &keys.pk {
        // Cached as the PK's own trust anchor, exactly like a runtime
        // authenticated write would (`process_authenticated_write`), so a
        // later SetVariable on PK must match this cert rather than falling
        // into `TrustPolicy::AcceptAny`.
        store.upsert_preserving_cert(&name_pk(), EFI_GLOBAL_VARIABLE_GUID, AUTHENTICATED_NV, EfiTime::ZERO, pk.clone(), Some(pk.clone()))?;
    }
    Ok(())
}

/// `true` once a PK has been provisioned, used by the supervisor to decide
/// whether the store has left Setup mode after provisioning runs.
pub fn is_enrolled(store: &VariableStore) -> bool {
    store.lookup(&name_pk(), &EFI_GLOBAL_VARIABLE_GUID).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisions_only_supplied_keys() {
        let mut store = VariableStore::new();
        let keys = VendorKeys { pk: Some(vec![1]), kek: None, db: Some(vec![2]), dbx: None };
        provision_first_boot(&mut store, &keys).unwrap();

        assert!(is_enrolled(&store));
        assert!(store.lookup(&name_kek(), &EFI_GLOBAL_VARIABLE_GUID).is_none());
        assert!(store.lookup(&name_db(), &EFI_IMAGE_SECURITY_DATABASE_GUID).is_some());
        assert!(store.lookup(&name_dbx(), &EFI_IMAGE_SECURITY_DATABASE_GUID).is_none());
    }

    #[test]
    fn provisioned_pk_is_cached_as_its_own_trust_anchor() {
        let mut store = VariableStore::new();
        let keys = VendorKeys { pk: Some(b"vendor-pk-cert".to_vec()), kek: None, db: None, dbx: None };
        provision_first_boot(&mut store, &keys).unwrap();

        let stored = store.lookup(&name_pk(), &EFI_GLOBAL_VARIABLE_GUID).unwrap();
        assert_eq!(stored.cert.as_deref(), Some(b"vendor-pk-cert".as_slice()));
    }

    #[test]
    fn empty_vendor_keys_leaves_store_in_setup_mode() {
        let mut store = VariableStore::new();
        provision_first_boot(&mut store, &VendorKeys::default()).unwrap();
        assert!(!is_enrolled(&store));
        assert!(store.lookup(&name_deployed_mode(), &EFI_GLOBAL_VARIABLE_GUID).is_none());
    }
}
