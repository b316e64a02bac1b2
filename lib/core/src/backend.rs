//! The backend interface (C7, §4.7): hands the store a serialized snapshot
//! on save and receives one back on load, with no aliasing between the two.

use std::collections::HashMap;

use thiserror::Error;
use uguid::Guid;

use crate::store::VariableStore;
use crate::time::EfiTime;
use crate::variable::VariableAttributes;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend argument {key:?} is invalid: {reason}")]
    InvalidArg { key: String, reason: String },
    #[error("required backend argument {0:?} is missing")]
    MissingArg(&'static str),
    #[error("failed to load durable state: {0}")]
    LoadFailed(String),
    #[error("failed to persist durable state: {0}")]
    SaveFailed(String),
}

/// Outcome of [`Backend::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitResult {
    /// No prior snapshot existed; the store starts empty and first-boot
    /// key provisioning (C8) should run.
    FirstBoot,
    /// A prior snapshot was loaded successfully.
    Success,
    /// A prior snapshot exists but could not be loaded.
    Failure,
}

/// A single persisted variable record, independent of any particular wire
/// or on-disk encoding (§6 "Persisted state layout").
#[derive(Debug, Clone)]
pub struct PersistedVariable {
    pub name: Vec<u16>,
    pub vendor: Guid,
    pub attributes: VariableAttributes,
    pub timestamp: EfiTime,
    pub data: Vec<u8>,
    pub cert: Option<Vec<u8>>,
}

/// Storage backend for the variable store (C7). Implementations own
/// durability; the store itself is backend-agnostic.
pub trait Backend: Send {
    /// Accepts one `--arg key:value` pair. Returns `false` for a key this
    /// backend does not recognize.
    fn parse_arg(&mut self, key: &str, value: &str) -> bool;

    /// Called once after all `--arg` options are parsed; validates that
    /// required arguments are present.
    fn check_args(&self) -> Result<(), BackendError>;

    /// Loads durable state, or declares an empty store on first boot.
    fn init(&mut self) -> Result<(InitResult, Vec<PersistedVariable>), BackendError>;

    /// Restores from a snapshot written by a prior `save`, used when
    /// `--resume` is passed instead of a fresh `init`.
    fn resume(&mut self) -> Result<Vec<PersistedVariable>, BackendError>;

    /// Persists the given records. Invoked once, on clean shutdown.
    fn save(&mut self, records: &[PersistedVariable]) -> Result<(), BackendError>;

    /// Optional write-through hook, called after every successful
    /// `SetVariable`. The default implementation does nothing.
    fn set_variable(&mut self, _name: &[u16], _vendor: &Guid, _attrs: VariableAttributes, _timestamp: EfiTime, _data: &[u8]) {}
}

/// Converts a [`VariableStore`] into the backend-agnostic record list used
/// by [`Backend::save`], in enumeration order.
pub fn snapshot(store: &VariableStore) -> Vec<PersistedVariable> {
    store
        .iter()
        .map(|(key, var)| PersistedVariable {
            name: key.name.clone(),
            vendor: key.vendor,
            attributes: var.attributes,
            timestamp: var.timestamp,
            data: var.data.clone(),
            cert: var.cert.clone(),
        })
        .collect()
}

/// Rebuilds a [`VariableStore`] from records produced by [`snapshot`] or
/// returned from [`Backend::init`]/[`Backend::resume`], preserving
/// enumeration order.
pub fn restore(records: Vec<PersistedVariable>) -> VariableStore {
    let mut store = VariableStore::new();
    for record in records {
        let _ = store.upsert_preserving_cert(&record.name, record.vendor, record.attributes, record.timestamp, record.data, record.cert);
    }
    store
}

/// In-memory backend used by tests and `--nonpersistent` runs: `init`
/// always reports `FirstBoot` unless primed with [`MemoryBackend::seeded`],
/// and `save`/`resume` round-trip through an in-process buffer rather than
/// any filesystem or orchestration-store path.
#[derive(Default)]
pub struct MemoryBackend {
    args: HashMap<String, String>,
    saved: Option<Vec<PersistedVariable>>,
    seed: Option<Vec<PersistedVariable>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primes the backend as if a prior process had already saved
    /// `records`, so the next `init`/`resume` observes them.
    pub fn seeded(records: Vec<PersistedVariable>) -> Self {
        Self { args: HashMap::new(), saved: None, seed: Some(records) }
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

impl Backend for MemoryBackend {
    fn parse_arg(&mut self, key: &str, value: &str) -> bool {
        self.args.insert(key.to_string(), value.to_string());
        true
    }

    fn check_args(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn init(&mut self) -> Result<(InitResult, Vec<PersistedVariable>), BackendError> {
        match self.seed.take() {
            Some(records) => Ok((InitResult::Success, records)),
            None => Ok((InitResult::FirstBoot, Vec::new())),
        }
    }

    fn resume(&mut self) -> Result<Vec<PersistedVariable>, BackendError> {
        self.saved.clone().ok_or_else(|| BackendError::LoadFailed("no prior save() to resume from".to_string()))
    }

    fn save(&mut self, records: &[PersistedVariable]) -> Result<(), BackendError> {
        self.saved = Some(records.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn first_boot_when_not_seeded() {
        let mut backend = MemoryBackend::new();
        let (result, records) = backend.init().unwrap();
        assert_eq!(result, InitResult::FirstBoot);
        assert!(records.is_empty());
    }

    #[test]
    fn round_trips_through_save_and_resume() {
        let mut store = VariableStore::new();
        store
            .upsert(&name("Test"), Guid::from_bytes([1; 16]), VariableAttributes::BOOTSERVICE_ACCESS, EfiTime::ZERO, vec![1, 2, 3])
            .unwrap();

        let mut backend = MemoryBackend::new();
        backend.save(&snapshot(&store)).unwrap();

        let resumed = restore(backend.resume().unwrap());
        assert_eq!(resumed.lookup(&name("Test"), &Guid::from_bytes([1; 16])).unwrap().data, vec![1, 2, 3]);
    }

    #[test]
    fn seeded_backend_reports_success_on_init() {
        let record = PersistedVariable {
            name: name("Seed"),
            vendor: Guid::from_bytes([2; 16]),
            attributes: VariableAttributes::BOOTSERVICE_ACCESS,
            timestamp: EfiTime::ZERO,
            data: vec![9],
            cert: None,
        };
        let mut backend = MemoryBackend::seeded(vec![record]);
        let (result, records) = backend.init().unwrap();
        assert_eq!(result, InitResult::Success);
        assert_eq!(records.len(), 1);
    }
}
