//! UEFI status codes (§4.4), modeled the same way the firmware-side client
//! code this service talks to models `EFI_STATUS`: a transparent newtype
//! over the raw integer with a fixed set of named constants and a high
//! error bit.

use c_enum::c_enum;

c_enum! {
    #[derive(Debug, Default)]
    pub enum EfiStatus: u64 {
        Success             = 0
        InvalidParameter    = Self::ERROR_BIT | 2
        Unsupported         = Self::ERROR_BIT | 3
        BufferTooSmall      = Self::ERROR_BIT | 5
        WriteProtected       = Self::ERROR_BIT | 8
        OutOfResources      = Self::ERROR_BIT | 9
        NotFound            = Self::ERROR_BIT | 0x0E
        SecurityViolation   = Self::ERROR_BIT | 0x1A
    }
}

impl EfiStatus {
    pub const ERROR_BIT: u64 = 1 << 63;

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        self.raw() & Self::ERROR_BIT != 0
    }
}

impl From<crate::store::StoreError> for EfiStatus {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError as E;
        match err {
            E::NotFound => EfiStatus::NotFound,
            E::NoMoreEntries => EfiStatus::NotFound,
            E::NameTooLong { .. } | E::NameEmpty | E::ReservedAttribute { .. } | E::RuntimeRequiresBootservice => {
                EfiStatus::InvalidParameter
            }
            E::EnhancedAuthUnsupported => EfiStatus::Unsupported,
            E::VariableTooLarge { .. } | E::QuotaExceeded { .. } => EfiStatus::OutOfResources,
            E::AttributeMismatch => EfiStatus::InvalidParameter,
            E::AppendTimestampRegression => EfiStatus::SecurityViolation,
        }
    }
}

impl From<varstore_wire::WireError> for EfiStatus {
    fn from(_: varstore_wire::WireError) -> Self {
        EfiStatus::InvalidParameter
    }
}

impl From<crate::auth::AuthError> for EfiStatus {
    fn from(err: crate::auth::AuthError) -> Self {
        use crate::auth::AuthError as E;
        match err {
            E::TimestampNotMonotonic | E::SignatureInvalid | E::UntrustedSigner | E::MalformedCertificate(_) => {
                EfiStatus::SecurityViolation
            }
            E::NotAllowedInDeployedMode => EfiStatus::WriteProtected,
        }
    }
}
