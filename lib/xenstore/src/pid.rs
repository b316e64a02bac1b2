//! PID publication into the orchestration store (C10, §6, §10.5): written
//! once at init, removed on every teardown path once reached —
//! unconditionally, closing the leak the original implementation had on
//! some error paths.

use sentinel::log;

use crate::store::{Store, XenstoreError};

fn pid_path(domid: u32) -> String {
    format!("/local/domain/{domid}/varstored-pid")
}

pub fn publish_pid(store: &mut dyn Store, domid: u32, pid: u32) -> Result<(), XenstoreError> {
    store.write(&pid_path(domid), &pid.to_string())
}

/// Idempotent: called on every teardown path once the publish phase was
/// reached, including after a later acquisition step failed.
pub fn remove_pid(store: &mut dyn Store, domid: u32) {
    if let Err(err) = store.remove(&pid_path(domid)) {
        log!(Warning, "failed to remove PID node for domain {domid}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn publish_then_remove() {
        let mut store = MemoryStore::new();
        publish_pid(&mut store, 5, 4242).unwrap();
        assert_eq!(store.read(&pid_path(5)).unwrap(), Some("4242".to_string()));
        remove_pid(&mut store, 5);
        assert_eq!(store.read(&pid_path(5)).unwrap(), None);
    }

    #[test]
    fn removing_an_unpublished_pid_does_not_panic() {
        let mut store = MemoryStore::new();
        remove_pid(&mut store, 9);
    }
}
