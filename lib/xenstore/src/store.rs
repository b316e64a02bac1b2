//! A narrow client trait for the orchestration store (xenstore), plus an
//! in-memory test double. Only string read/write/remove at a path is
//! needed by this service.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XenstoreError {
    #[error("failed to open the orchestration-store connection: {0}")]
    OpenFailed(String),
    #[error("write to {path} failed: {reason}")]
    WriteFailed { path: String, reason: String },
    #[error("remove of {path} failed: {reason}")]
    RemoveFailed { path: String, reason: String },
}

pub trait Store: Send {
    fn read(&self, path: &str) -> Result<Option<String>, XenstoreError>;
    fn write(&mut self, path: &str, value: &str) -> Result<(), XenstoreError>;
    fn remove(&mut self, path: &str) -> Result<(), XenstoreError>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(pairs: &[(&str, &str)]) -> Self {
        let mut store = Self::new();
        for (path, value) in pairs {
            store.entries.insert((*path).to_string(), (*value).to_string());
        }
        store
    }
}

impl Store for MemoryStore {
    fn read(&self, path: &str) -> Result<Option<String>, XenstoreError> {
        Ok(self.entries.get(path).cloned())
    }

    fn write(&mut self, path: &str, value: &str) -> Result<(), XenstoreError> {
        self.entries.insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), XenstoreError> {
        self.entries.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_value() {
        let mut store = MemoryStore::new();
        store.write("/local/domain/1/foo", "bar").unwrap();
        assert_eq!(store.read("/local/domain/1/foo").unwrap(), Some("bar".to_string()));
        store.remove("/local/domain/1/foo").unwrap();
        assert_eq!(store.read("/local/domain/1/foo").unwrap(), None);
    }
}
