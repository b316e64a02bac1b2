//! The variable store (C2, §4.2): a map from (name, vendor) to [`Variable`]
//! with insertion-order enumeration and the quota/attribute invariants
//! every mutation must uphold.

use std::collections::HashMap;

use sentinel::log;
use thiserror::Error;
use uguid::Guid;
use varstore_wire::NAME_LIMIT;

use crate::time::EfiTime;
use crate::variable::{Variable, VariableAttributes, VariableKey};

/// Per-variable data size limit (§3).
pub const MAX_VARIABLE_SIZE: usize = 32 * 1024;

/// Aggregate quota across all `NON_VOLATILE` variables (§3). Also used, by
/// implementation choice, as the budget for the volatile namespace, since
/// the distilled spec does not separately bound it.
pub const MAX_AGGREGATE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("variable not found")]
    NotFound,
    #[error("no more variables to enumerate")]
    NoMoreEntries,
    #[error("name exceeds {NAME_LIMIT} code units: got {got}")]
    NameTooLong { got: usize },
    #[error("variable name must not be empty")]
    NameEmpty,
    #[error("attribute bit {bit} is reserved and rejected on write")]
    ReservedAttribute { bit: &'static str },
    #[error("RUNTIME_ACCESS requires BOOTSERVICE_ACCESS")]
    RuntimeRequiresBootservice,
    #[error("ENHANCED_AUTHENTICATED_ACCESS is not implemented")]
    EnhancedAuthUnsupported,
    #[error("variable data of {len} bytes exceeds the {MAX_VARIABLE_SIZE}-byte per-variable limit")]
    VariableTooLarge { len: usize },
    #[error("write needs {needed} bytes but only {remaining} remain in the aggregate quota")]
    QuotaExceeded { needed: usize, remaining: usize },
    #[error("attribute set does not match the existing record")]
    AttributeMismatch,
    #[error("append timestamp is older than the stored timestamp")]
    AppendTimestampRegression,
}

/// Validates attribute legality shared by both `upsert` and `append`
/// (§4.2's invariant list).
fn validate_attributes(attrs: VariableAttributes) -> Result<(), StoreError> {
    if attrs.contains(VariableAttributes::ENHANCED_AUTHENTICATED_ACCESS) {
        return Err(StoreError::EnhancedAuthUnsupported);
    }
    if attrs.contains(VariableAttributes::AUTHENTICATED_WRITE_ACCESS) {
        return Err(StoreError::ReservedAttribute { bit: "AUTHENTICATED_WRITE_ACCESS" });
    }
    if attrs.contains(VariableAttributes::RUNTIME_ACCESS) && !attrs.contains(VariableAttributes::BOOTSERVICE_ACCESS) {
        return Err(StoreError::RuntimeRequiresBootservice);
    }
    Ok(())
}

fn validate_name(name: &[u16]) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::NameEmpty);
    }
    if name.len() > NAME_LIMIT {
        return Err(StoreError::NameTooLong { got: name.len() });
    }
    Ok(())
}

/// `true` when a write with these attributes and this data length deletes
/// the targeted variable (§3, §4.4 SET).
#[must_use]
pub fn is_delete_request(attrs: VariableAttributes, data_len: usize) -> bool {
    data_len == 0
        || !attrs.intersects(VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS)
}

pub struct VariableStore {
    order: Vec<VariableKey>,
    entries: HashMap<VariableKey, Variable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self { order: Vec::new(), entries: HashMap::new() }
    }

    pub fn lookup(&self, name: &[u16], vendor: &Guid) -> Option<&Variable> {
        self.entries.get(&VariableKey::new(name.to_vec(), *vendor))
    }

    fn accounted_total(&self, mask: VariableAttributes, exclude: Option<&VariableKey>) -> usize {
        self.order
            .iter()
            .filter(|key| Some(*key) != exclude)
            .filter_map(|key| self.entries.get(key).map(|v| (key, v)))
            .filter(|(_, v)| v.attributes.contains(VariableAttributes::NON_VOLATILE) == mask.contains(VariableAttributes::NON_VOLATILE))
            .map(|(key, v)| v.accounted_size(&key.name))
            .sum()
    }

    /// Replaces (or creates) the variable at `key` atomically: either the
    /// whole record is visible afterwards, or none of it is.
    pub fn upsert(
        &mut self,
        name: &[u16],
        vendor: Guid,
        attrs: VariableAttributes,
        timestamp: EfiTime,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        validate_name(name)?;
        validate_attributes(attrs)?;
        if data.len() > MAX_VARIABLE_SIZE {
            return Err(StoreError::VariableTooLarge { len: data.len() });
        }

        let key = VariableKey::new(name.to_vec(), vendor);
        let needed = data.len() + key.name.len() * 2;
        let total_excluding_self = self.accounted_total(attrs, Some(&key));
        if total_excluding_self + needed > MAX_AGGREGATE_SIZE {
            let remaining = MAX_AGGREGATE_SIZE.saturating_sub(total_excluding_self);
            return Err(StoreError::QuotaExceeded { needed, remaining });
        }

        let variable = Variable { attributes: attrs, data, timestamp, cert: None };
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, variable);
        Ok(())
    }

    /// Like [`upsert`](Self::upsert) but preserves the existing record's
    /// cached authentication certificate, used when a write succeeds
    /// authentication against it (trust-on-first-use, §4.3).
    pub fn upsert_preserving_cert(
        &mut self,
        name: &[u16],
        vendor: Guid,
        attrs: VariableAttributes,
        timestamp: EfiTime,
        data: Vec<u8>,
        cert: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        self.upsert(name, vendor, attrs, timestamp, data)?;
        if let Some(variable) = self.entries.get_mut(&VariableKey::new(name.to_vec(), vendor)) {
            variable.cert = cert;
        }
        Ok(())
    }

    /// Concatenates `data` onto the existing record (§4.2).
    pub fn append(
        &mut self,
        name: &[u16],
        vendor: Guid,
        attrs: VariableAttributes,
        timestamp: EfiTime,
        data: &[u8],
    ) -> Result<(), StoreError> {
        validate_name(name)?;
        validate_attributes(attrs)?;

        let key = VariableKey::new(name.to_vec(), vendor);
        let existing = self.entries.get(&key).ok_or(StoreError::NotFound)?;
        if existing.attributes.without_append() != attrs.without_append() {
            return Err(StoreError::AttributeMismatch);
        }
        if timestamp < existing.timestamp {
            return Err(StoreError::AppendTimestampRegression);
        }

        let mut combined = existing.data.clone();
        combined.extend_from_slice(data);
        let cert = existing.cert.clone();
        self.upsert_preserving_cert(name, vendor, existing.attributes, timestamp, combined, cert)
    }

    pub fn remove(&mut self, name: &[u16], vendor: &Guid) -> Result<(), StoreError> {
        let key = VariableKey::new(name.to_vec(), *vendor);
        if self.entries.remove(&key).is_none() {
            return Err(StoreError::NotFound);
        }
        self.order.retain(|k| k != &key);
        log!(Debug, "removed variable ({} code units)", key.name.len());
        Ok(())
    }

    /// Deterministic enumeration used by GetNextVariableName (§4.2).
    /// An empty `name` returns the first entry; a name that names nothing
    /// in the store fails with `NotFound`.
    pub fn iter_after(&self, name: &[u16], vendor: &Guid) -> Result<Option<VariableKey>, StoreError> {
        if name.is_empty() {
            return Ok(self.order.first().cloned());
        }
        let key = VariableKey::new(name.to_vec(), *vendor);
        let index = self.order.iter().position(|k| k == &key).ok_or(StoreError::NotFound)?;
        Ok(self.order.get(index + 1).cloned())
    }

    /// `(max_storage, remaining, max_variable_size)` for QueryVariableInfo
    /// (§4.4), scoped to the NON_VOLATILE-ness of `attrs`.
    pub fn remaining_storage(&self, attrs: VariableAttributes) -> (u64, u64, u64) {
        let used = self.accounted_total(attrs, None);
        let remaining = MAX_AGGREGATE_SIZE.saturating_sub(used);
        (MAX_AGGREGATE_SIZE as u64, remaining as u64, MAX_VARIABLE_SIZE as u64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VariableKey, &Variable)> {
        self.order.iter().filter_map(move |key| self.entries.get(key).map(|v| (key, v)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}
