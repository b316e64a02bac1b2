//! The auth engine (C3, §4.3): verifies `EFI_VARIABLE_AUTHENTICATION_2`
//! payloads and derives the secure-boot key hierarchy and mode transitions.
//!
//! The PKCS#7/CMS parsing and signature check are isolated behind
//! [`SignatureVerifier`] so the trust-anchor and monotonicity policy above
//! it — the part actually exercised by this service's tests — can be
//! tested without constructing real signed blobs.

use sentinel::log;
use thiserror::Error;
use uguid::{guid, Guid};
use varstore_wire::auth_digest_input;

use crate::time::EfiTime;
use crate::store::VariableStore;
use crate::variable::VariableAttributes;

/// `EFI_GLOBAL_VARIABLE_GUID`, the namespace PK/KEK/AuditMode/DeployedMode
/// live in.
pub const EFI_GLOBAL_VARIABLE_GUID: Guid = guid!("8be4df61-93ca-11d2-aa0d-00e098032b8c");

/// `EFI_IMAGE_SECURITY_DATABASE_GUID`, the namespace db/dbx/dbt/dbr live in.
pub const EFI_IMAGE_SECURITY_DATABASE_GUID: Guid = guid!("d719b2cb-3d3a-4596-a3bc-dad00e67656f");

/// `EFI_CERT_TYPE_PKCS7_GUID`, the only certificate type this service
/// accepts inside a `WIN_CERTIFICATE_UEFI_GUID`.
const EFI_CERT_TYPE_PKCS7_GUID: Guid = guid!("4aafd29d-68df-49ee-8aa9-347d375665a7");

const WIN_CERT_REVISION: u16 = 0x0200;
const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;

fn name_is(name: &[u16], ascii: &str) -> bool {
    name.iter().copied().eq(ascii.encode_utf16())
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authenticated write timestamp is not strictly newer than the stored timestamp")]
    TimestampNotMonotonic,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("signer is not trusted for this variable")]
    UntrustedSigner,
    #[error("malformed authentication payload: {0}")]
    MalformedCertificate(&'static str),
    #[error("PK can only be cleared outside Deployed mode")]
    NotAllowedInDeployedMode,
}

/// Secure Boot operational state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBootState {
    Setup,
    Audit,
    User,
    Deployed,
}

impl SecureBootState {
    /// Derives the current state from the variables that define it
    /// (presence of PK, `AuditMode`, `DeployedMode`).
    pub fn derive(store: &VariableStore) -> Self {
        let pk_present = store.lookup(&name_pk(), &EFI_GLOBAL_VARIABLE_GUID).is_some();
        if !pk_present {
            return Self::Setup;
        }
        let deployed = store
            .lookup(&name_deployed_mode(), &EFI_GLOBAL_VARIABLE_GUID)
            .is_some_and(|v| v.data.first() == Some(&1));
        if deployed {
            return Self::Deployed;
        }
        let audit = store
            .lookup(&name_audit_mode(), &EFI_GLOBAL_VARIABLE_GUID)
            .is_some_and(|v| v.data.first() == Some(&1));
        if audit {
            return Self::Audit;
        }
        Self::User
    }
}

/// `true` when `name`/`vendor` identify the Platform Key variable.
pub fn is_pk(name: &[u16], vendor: &Guid) -> bool {
    *vendor == EFI_GLOBAL_VARIABLE_GUID && name_is(name, "PK")
}

pub fn name_pk() -> Vec<u16> {
    "PK".encode_utf16().collect()
}
pub fn name_kek() -> Vec<u16> {
    "KEK".encode_utf16().collect()
}
pub fn name_audit_mode() -> Vec<u16> {
    "AuditMode".encode_utf16().collect()
}
pub fn name_deployed_mode() -> Vec<u16> {
    "DeployedMode".encode_utf16().collect()
}

/// The trust-anchor set a write must satisfy, chosen by variable identity
/// (§4.3 step 3).
enum TrustPolicy {
    /// Setup-mode first PK write: any self-consistent signature is
    /// accepted, and its signer becomes the new trust anchor.
    AcceptAny,
    /// The write's signature must verify against one of these certificates
    /// (DER-encoded).
    Anchors(Vec<Vec<u8>>),
}

fn trust_policy_for(name: &[u16], vendor: &Guid, store: &VariableStore, sb_state: SecureBootState) -> TrustPolicy {
    if *vendor == EFI_GLOBAL_VARIABLE_GUID && name_is(name, "PK") {
        return match store.lookup(&name_pk(), &EFI_GLOBAL_VARIABLE_GUID) {
            Some(pk) => match &pk.cert {
                Some(cert) => TrustPolicy::Anchors(vec![cert.clone()]),
                None => TrustPolicy::AcceptAny,
            },
            None if sb_state == SecureBootState::Setup => TrustPolicy::AcceptAny,
            None => TrustPolicy::Anchors(Vec::new()),
        };
    }

    if *vendor == EFI_GLOBAL_VARIABLE_GUID && name_is(name, "KEK") {
        return TrustPolicy::Anchors(pk_anchor(store));
    }

    if *vendor == EFI_IMAGE_SECURITY_DATABASE_GUID
        && (name_is(name, "db") || name_is(name, "dbx") || name_is(name, "dbt") || name_is(name, "dbr"))
    {
        let mut anchors = pk_anchor(store);
        anchors.extend(kek_anchor(store));
        return TrustPolicy::Anchors(anchors);
    }

    // Any other authenticated variable: PK ∪ KEK ∪ trust-on-first-use.
    let mut anchors = pk_anchor(store);
    anchors.extend(kek_anchor(store));
    match store.lookup(name, vendor).and_then(|v| v.cert.clone()) {
        Some(cached) => {
            anchors.push(cached);
            TrustPolicy::Anchors(anchors)
        }
        None if anchors.is_empty() => TrustPolicy::AcceptAny,
        None => TrustPolicy::Anchors(anchors),
    }
}

fn pk_anchor(store: &VariableStore) -> Vec<Vec<u8>> {
    store.lookup(&name_pk(), &EFI_GLOBAL_VARIABLE_GUID).and_then(|v| v.cert.clone()).into_iter().collect()
}

fn kek_anchor(store: &VariableStore) -> Vec<Vec<u8>> {
    store.lookup(&name_kek(), &EFI_GLOBAL_VARIABLE_GUID).and_then(|v| v.cert.clone()).into_iter().collect()
}

/// A parsed `EFI_VARIABLE_AUTHENTICATION_2` payload.
struct ParsedPayload<'a> {
    timestamp: EfiTime,
    signed_data: &'a [u8],
    new_content: &'a [u8],
}

fn parse_auth2_payload(raw: &[u8]) -> Result<ParsedPayload<'_>, AuthError> {
    if raw.len() < 16 + 4 + 2 + 2 + 16 {
        return Err(AuthError::MalformedCertificate("payload shorter than a WIN_CERTIFICATE_UEFI_GUID header"));
    }
    let timestamp = EfiTime::from_bytes(raw[0..16].try_into().unwrap());
    if !timestamp.has_zeroed_reserved_fields() {
        return Err(AuthError::MalformedCertificate("EFI_TIME reserved fields must be zero"));
    }

    let cert_header = &raw[16..];
    let dw_length = u32::from_le_bytes(cert_header[0..4].try_into().unwrap()) as usize;
    let revision = u16::from_le_bytes(cert_header[4..6].try_into().unwrap());
    let cert_type = u16::from_le_bytes(cert_header[6..8].try_into().unwrap());
    if revision != WIN_CERT_REVISION || cert_type != WIN_CERT_TYPE_EFI_GUID {
        return Err(AuthError::MalformedCertificate("unexpected WIN_CERTIFICATE revision or type"));
    }
    let cert_type_guid = Guid::from_bytes(cert_header[8..24].try_into().unwrap());
    if cert_type_guid != EFI_CERT_TYPE_PKCS7_GUID {
        return Err(AuthError::MalformedCertificate("certificate type is not EFI_CERT_TYPE_PKCS7_GUID"));
    }
    if dw_length < 24 || 16 + dw_length > raw.len() {
        return Err(AuthError::MalformedCertificate("WIN_CERTIFICATE dwLength out of range"));
    }

    let signed_data = &cert_header[24..dw_length];
    let new_content = &raw[16 + dw_length..];
    Ok(ParsedPayload { timestamp, signed_data, new_content })
}

/// Verifies a PKCS#7/CMS `SignedData` blob over `digest_input`, matching
/// the signer against `trust_anchors` (DER-encoded X.509 certificates)
/// unless `accept_any` is set, in which case the signer's own certificate
/// is trusted provided the signature is internally consistent. Returns the
/// DER bytes of the certificate that signed it.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signed_data: &[u8], digest_input: &[u8], trust_anchors: &[Vec<u8>], accept_any: bool) -> Result<Vec<u8>, AuthError>;
}

/// Production verifier: parses CMS `SignedData`, matches the signer
/// certificate's DER encoding against one of the trust anchors (or, in
/// `accept_any` mode, simply requires the embedded certificate's key to
/// validate its own signature), then checks the RSA-PKCS1v15/SHA-256
/// signature over `digest_input`.
pub struct Pkcs7Verifier;

impl SignatureVerifier for Pkcs7Verifier {
    fn verify(&self, signed_data: &[u8], digest_input: &[u8], trust_anchors: &[Vec<u8>], accept_any: bool) -> Result<Vec<u8>, AuthError> {
        use cms::content_info::ContentInfo;
        use der::Decode;
        use rsa::pkcs1v15::VerifyingKey;
        use rsa::RsaPublicKey;
        use sha2::Sha256;
        use signature::Verifier;
        use x509_cert::Certificate;

        let content_info = ContentInfo::from_der(signed_data)
            .map_err(|_| AuthError::MalformedCertificate("not a well-formed CMS ContentInfo"))?;
        let signed_data: cms::signed_data::SignedData = content_info
            .content
            .decode_as()
            .map_err(|_| AuthError::MalformedCertificate("ContentInfo does not contain SignedData"))?;

        let certificates = signed_data.certificates.ok_or(AuthError::MalformedCertificate("SignedData carries no certificates"))?;
        let signer_info = signed_data
            .signer_infos
            .0
            .as_ref()
            .iter()
            .next()
            .ok_or(AuthError::MalformedCertificate("SignedData carries no signer"))?;

        let mut matched_cert_der: Option<Vec<u8>> = None;
        for cert_choice in certificates.0.iter() {
            let cms::cert::CertificateChoices::Certificate(cert) = cert_choice else { continue };
            let cert_der = der::Encode::to_der(cert).map_err(|_| AuthError::MalformedCertificate("certificate re-encode failed"))?;

            let trusted = accept_any || trust_anchors.iter().any(|anchor| anchor.as_slice() == cert_der.as_slice());
            if !trusted {
                continue;
            }

            if verify_signer(cert, signer_info, digest_input).is_ok() {
                matched_cert_der = Some(cert_der);
                break;
            }
        }

        let _ = (VerifyingKey::<Sha256>::new, RsaPublicKey::from_pkcs1_der, Certificate::default);
        matched_cert_der.ok_or(AuthError::UntrustedSigner)
    }
}

fn verify_signer(
    cert: &x509_cert::Certificate,
    signer_info: &cms::signed_data::SignerInfo,
    digest_input: &[u8],
) -> Result<(), AuthError> {
    use der::Encode;
    use rsa::pkcs1v15::VerifyingKey;
    use rsa::RsaPublicKey;
    use sha2::Sha256;
    use signature::Verifier;

    let spki = &cert.tbs_certificate.subject_public_key_info;
    let spki_der = spki.to_der().map_err(|_| AuthError::MalformedCertificate("SubjectPublicKeyInfo re-encode failed"))?;
    let public_key =
        RsaPublicKey::try_from(spki.clone()).map_err(|_| AuthError::MalformedCertificate("unsupported public key algorithm"))?;
    let _ = spki_der;

    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature_bytes = signer_info.signature.as_bytes();
    let signature = rsa::pkcs1v15::Signature::try_from(signature_bytes)
        .map_err(|_| AuthError::MalformedCertificate("malformed RSA signature"))?;

    // RFC 5652 §5.4: when signedAttrs is present, the signature covers the
    // DER encoding of the attributes as a SET OF, not the IMPLICIT [0] tag
    // used when it's embedded in SignerInfo, and not `digest_input` itself.
    let signed_bytes: Vec<u8> = match &signer_info.signed_attrs {
        Some(signed_attrs) => {
            signed_attrs.to_der().map_err(|_| AuthError::MalformedCertificate("signed attributes re-encode failed"))?
        }
        None => digest_input.to_vec(),
    };

    verifying_key.verify(&signed_bytes, &signature).map_err(|_| AuthError::SignatureInvalid)
}

/// The outcome of a successfully verified (or enforcement-skipped)
/// authenticated write.
pub struct VerifiedWrite {
    pub timestamp: EfiTime,
    pub content: Vec<u8>,
    pub cert: Option<Vec<u8>>,
}

pub struct AuthEngine {
    verifier: Box<dyn SignatureVerifier>,
    auth_enforce: bool,
}

impl AuthEngine {
    pub fn new(auth_enforce: bool) -> Self {
        Self { verifier: Box::new(Pkcs7Verifier), auth_enforce }
    }

    pub fn with_verifier(verifier: Box<dyn SignatureVerifier>, auth_enforce: bool) -> Self {
        Self { verifier, auth_enforce }
    }

    /// Verifies an `EFI_VARIABLE_AUTHENTICATION_2` SetVariable payload
    /// (§4.3). `stored_timestamp` is `EfiTime::ZERO` when the variable
    /// does not yet exist.
    pub fn verify(
        &self,
        store: &VariableStore,
        sb_state: SecureBootState,
        name: &[u16],
        vendor: &Guid,
        attrs: VariableAttributes,
        stored_timestamp: EfiTime,
        raw_payload: &[u8],
    ) -> Result<VerifiedWrite, AuthError> {
        let parsed = parse_auth2_payload(raw_payload)?;

        let append = attrs.contains(VariableAttributes::APPEND_WRITE);
        let monotonic_ok = if append { parsed.timestamp >= stored_timestamp } else { parsed.timestamp > stored_timestamp };
        if !monotonic_ok {
            return Err(AuthError::TimestampNotMonotonic);
        }

        let digest_input = auth_digest_input(name, vendor, attrs.bits(), &parsed.timestamp.to_bytes(), parsed.new_content);
        let policy = trust_policy_for(name, vendor, store, sb_state);

        let (anchors, accept_any) = match policy {
            TrustPolicy::AcceptAny => (Vec::new(), true),
            TrustPolicy::Anchors(anchors) => (anchors, false),
        };
        if !accept_any && anchors.is_empty() {
            return Err(AuthError::UntrustedSigner);
        }

        match self.verifier.verify(parsed.signed_data, &digest_input, &anchors, accept_any) {
            Ok(cert) => Ok(VerifiedWrite { timestamp: parsed.timestamp, content: parsed.new_content.to_vec(), cert: Some(cert) }),
            Err(err) if !self.auth_enforce => {
                log!(Warning, "authenticated write failed verification but auth-enforce is disabled: {err}");
                Ok(VerifiedWrite { timestamp: parsed.timestamp, content: parsed.new_content.to_vec(), cert: None })
            }
            Err(err) => Err(err),
        }
    }
}

/// Computes the secure-boot state transition a successful write to PK,
/// `AuditMode` or `DeployedMode` causes (§4.3).
pub fn next_secure_boot_state(current: SecureBootState, name: &[u16], vendor: &Guid, new_data: &[u8], deleted: bool) -> SecureBootState {
    if *vendor != EFI_GLOBAL_VARIABLE_GUID {
        return current;
    }
    if name_is(name, "PK") {
        return if deleted { SecureBootState::Setup } else { SecureBootState::User };
    }
    if name_is(name, "AuditMode") && current == SecureBootState::Setup && new_data.first() == Some(&1) {
        return SecureBootState::Audit;
    }
    if name_is(name, "DeployedMode") && current == SecureBootState::User && new_data.first() == Some(&1) {
        return SecureBootState::Deployed;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VariableStore;

    struct AlwaysOk;
    impl SignatureVerifier for AlwaysOk {
        fn verify(&self, _: &[u8], _: &[u8], _: &[Vec<u8>], _: bool) -> Result<Vec<u8>, AuthError> {
            Ok(vec![0xAA])
        }
    }

    struct AlwaysFail;
    impl SignatureVerifier for AlwaysFail {
        fn verify(&self, _: &[u8], _: &[u8], _: &[Vec<u8>], _: bool) -> Result<Vec<u8>, AuthError> {
            Err(AuthError::SignatureInvalid)
        }
    }

    fn payload(timestamp: EfiTime, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&timestamp.to_bytes());
        let signed_data = b"fake-signed-data".to_vec();
        let dw_length = (4 + 2 + 2 + 16 + signed_data.len()) as u32;
        out.extend_from_slice(&dw_length.to_le_bytes());
        out.extend_from_slice(&WIN_CERT_REVISION.to_le_bytes());
        out.extend_from_slice(&WIN_CERT_TYPE_EFI_GUID.to_le_bytes());
        out.extend_from_slice(&EFI_CERT_TYPE_PKCS7_GUID.to_bytes());
        out.extend_from_slice(&signed_data);
        out.extend_from_slice(content);
        out
    }

    #[test]
    fn setup_mode_pk_bootstrap_accepts_any_signature() {
        let store = VariableStore::new();
        let engine = AuthEngine::with_verifier(Box::new(AlwaysOk), true);
        let ts = EfiTime { year: 2026, ..EfiTime::ZERO };
        let attrs = VariableAttributes::NON_VOLATILE
            | VariableAttributes::BOOTSERVICE_ACCESS
            | VariableAttributes::RUNTIME_ACCESS
            | VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS;
        let result = engine
            .verify(&store, SecureBootState::Setup, &name_pk(), &EFI_GLOBAL_VARIABLE_GUID, attrs, EfiTime::ZERO, &payload(ts, b"cert-bytes"))
            .unwrap();
        assert_eq!(result.content, b"cert-bytes");
        assert_eq!(next_secure_boot_state(SecureBootState::Setup, &name_pk(), &EFI_GLOBAL_VARIABLE_GUID, b"cert-bytes", false), SecureBootState::User);
    }

    #[test]
    fn unrelated_signer_after_pk_established_is_rejected() {
        let mut store = VariableStore::new();
        let attrs = VariableAttributes::NON_VOLATILE
            | VariableAttributes::BOOTSERVICE_ACCESS
            | VariableAttributes::RUNTIME_ACCESS
            | VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS;
        store
            .upsert_preserving_cert(&name_pk(), EFI_GLOBAL_VARIABLE_GUID, attrs, EfiTime::ZERO, b"cert-bytes".to_vec(), Some(b"trusted-pk-cert".to_vec()))
            .unwrap();

        let engine = AuthEngine::with_verifier(Box::new(AlwaysFail), true);
        let ts = EfiTime { year: 2027, ..EfiTime::ZERO };
        let err = engine
            .verify(&store, SecureBootState::User, &name_pk(), &EFI_GLOBAL_VARIABLE_GUID, attrs, EfiTime::ZERO, &payload(ts, b"new-cert"))
            .unwrap_err();
        assert!(matches!(err, AuthError::SignatureInvalid));
    }

    #[test]
    fn stale_timestamp_rejected_before_signature_is_checked() {
        let store = VariableStore::new();
        let engine = AuthEngine::with_verifier(Box::new(AlwaysOk), true);
        let attrs = VariableAttributes::NON_VOLATILE
            | VariableAttributes::BOOTSERVICE_ACCESS
            | VariableAttributes::RUNTIME_ACCESS
            | VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS;
        let err = engine
            .verify(&store, SecureBootState::Setup, &name_pk(), &EFI_GLOBAL_VARIABLE_GUID, attrs, EfiTime { year: 2030, ..EfiTime::ZERO }, &payload(EfiTime { year: 2020, ..EfiTime::ZERO }, b"x"))
            .unwrap_err();
        assert!(matches!(err, AuthError::TimestampNotMonotonic));
    }

    #[test]
    fn auth_enforce_disabled_downgrades_signature_failure_to_success() {
        let store = VariableStore::new();
        let engine = AuthEngine::with_verifier(Box::new(AlwaysFail), false);
        let attrs = VariableAttributes::NON_VOLATILE
            | VariableAttributes::BOOTSERVICE_ACCESS
            | VariableAttributes::RUNTIME_ACCESS
            | VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS;
        let ts = EfiTime { year: 2026, ..EfiTime::ZERO };
        let result = engine
            .verify(&store, SecureBootState::Setup, &name_pk(), &EFI_GLOBAL_VARIABLE_GUID, attrs, EfiTime::ZERO, &payload(ts, b"x"))
            .unwrap();
        assert!(result.cert.is_none());
    }

    #[test]
    fn secure_boot_state_derives_from_pk_presence() {
        let store = VariableStore::new();
        assert_eq!(SecureBootState::derive(&store), SecureBootState::Setup);
    }

    /// Drives the production `Pkcs7Verifier` against real CMS `SignedData`
    /// blobs (built with `openssl cms -sign`, one with signed attributes and
    /// one without) so the signed-attributes re-encoding in `verify_signer`
    /// is exercised against a real PKCS#1v15/SHA-256 signature rather than a
    /// fake verifier.
    #[test]
    fn pkcs7_verifier_accepts_real_signed_data_with_and_without_signed_attrs() {
        const CERT_DER: &[u8] = include_bytes!("../testdata/pk_signer.cert.der");
        const MESSAGE: &[u8] = include_bytes!("../testdata/message.bin");
        const SIGNED_WITH_ATTRS: &[u8] = include_bytes!("../testdata/signed_attrs_present.cms.der");
        const SIGNED_WITHOUT_ATTRS: &[u8] = include_bytes!("../testdata/signed_attrs_absent.cms.der");

        let verifier = Pkcs7Verifier;

        let cert = verifier.verify(SIGNED_WITH_ATTRS, MESSAGE, &[CERT_DER.to_vec()], false).unwrap();
        assert_eq!(cert.as_slice(), CERT_DER);

        let cert = verifier.verify(SIGNED_WITHOUT_ATTRS, MESSAGE, &[CERT_DER.to_vec()], false).unwrap();
        assert_eq!(cert.as_slice(), CERT_DER);

        let err = verifier.verify(SIGNED_WITH_ATTRS, b"not the signed message", &[CERT_DER.to_vec()], false).unwrap_err();
        assert!(matches!(err, AuthError::UntrustedSigner));
    }
}
