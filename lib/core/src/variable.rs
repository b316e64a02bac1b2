//! The `Variable` entity and its attribute flags (§3), named the same way
//! as the firmware-side runtime-services client this service answers to.

use bitflags::bitflags;
use uguid::Guid;

use crate::time::EfiTime;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct VariableAttributes: u32 {
        /// Variable is maintained across a power cycle.
        const NON_VOLATILE = 0x01;

        /// Variable is accessible while boot services are available.
        const BOOTSERVICE_ACCESS = 0x02;

        /// Variable is accessible while runtime services are available.
        const RUNTIME_ACCESS = 0x04;

        /// Variable is stored in the portion of NVR allocated for error
        /// records.
        const HARDWARE_ERROR_RECORD = 0x08;

        /// Deprecated; rejected on write.
        const AUTHENTICATED_WRITE_ACCESS = 0x10;

        /// Variable payload begins with an `EFI_VARIABLE_AUTHENTICATION_2`
        /// structure.
        const TIME_BASED_AUTHENTICATED_WRITE_ACCESS = 0x20;

        /// Never returned by GetVariable; when passed to SetVariable the
        /// payload is appended to the current value.
        const APPEND_WRITE = 0x40;

        /// Variable payload begins with an `EFI_VARIABLE_AUTHENTICATION_3`
        /// structure. Not implemented; rejected as `Unsupported` (§11 (b)).
        const ENHANCED_AUTHENTICATED_ACCESS = 0x80;
    }
}

impl VariableAttributes {
    /// The attribute set with `APPEND_WRITE` cleared, used when comparing
    /// an incoming write's attributes against a stored record's (§4.2).
    #[must_use]
    pub fn without_append(self) -> Self {
        self.difference(Self::APPEND_WRITE)
    }

    #[must_use]
    pub fn is_authenticated(self) -> bool {
        self.contains(Self::TIME_BASED_AUTHENTICATED_WRITE_ACCESS)
    }
}

/// Uniquely identifies a variable within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    pub name: Vec<u16>,
    pub vendor: Guid,
}

impl VariableKey {
    pub fn new(name: Vec<u16>, vendor: Guid) -> Self {
        Self { name, vendor }
    }
}

/// A stored UEFI variable (§3).
#[derive(Debug, Clone)]
pub struct Variable {
    pub attributes: VariableAttributes,
    pub data: Vec<u8>,
    /// Meaningful only when `TIME_BASED_AUTHENTICATED_WRITE_ACCESS` is set;
    /// zeroed otherwise.
    pub timestamp: EfiTime,
    /// Certificate bound to the last accepted authenticated write, cached
    /// so later writes to the same variable can be checked against it
    /// (trust-on-first-use, §4.3 step 3).
    pub cert: Option<Vec<u8>>,
}

impl Variable {
    /// Bytes this variable contributes to the aggregate NON_VOLATILE quota
    /// (§3): its data plus its name, in wire encoding.
    pub fn accounted_size(&self, name: &[u16]) -> usize {
        self.data.len() + name.len() * 2
    }
}
