//! The durable `Backend` implementation (C7): serializes the variable
//! store to a single local state file using the length-prefixed record
//! layout described in §6 "Persisted state layout", reusing the C1 wire
//! cursor rather than inventing a second codec.
//!
//! Named for the orchestration database the real service of this kind
//! persists through; this workspace's version targets a local file given
//! via `--backend xapidb --arg path:<file>` since no such database is
//! available here (see DESIGN.md).

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use varstore_core::{Backend, BackendError, EfiTime, InitResult, PersistedVariable, VariableAttributes};
use varstore_wire::{Reader, Writer};

const MAGIC: u32 = 0x5653_4442; // "VSDB"
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum XapidbError {
    #[error("corrupt database header: expected magic {expected:#x}, got {got:#x}")]
    BadMagic { expected: u32, got: u32 },
    #[error("unsupported database version {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Wire(#[from] varstore_wire::WireError),
}

impl From<XapidbError> for BackendError {
    fn from(err: XapidbError) -> Self {
        BackendError::LoadFailed(err.to_string())
    }
}

/// Serializes the store to, and restores it from, a single file path
/// given via `--arg path:<file>`.
#[derive(Default)]
pub struct XapidbBackend {
    path: Option<PathBuf>,
}

impl XapidbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn path(&self) -> Result<&PathBuf, BackendError> {
        self.path.as_ref().ok_or(BackendError::MissingArg("path"))
    }

    fn encode(records: &[PersistedVariable]) -> Vec<u8> {
        let estimate: usize = records
            .iter()
            .map(|r| 8 + r.name.len() * 2 + 16 + 4 + 8 + 16 + 8 + r.data.len() + 1 + 8 + r.cert.as_ref().map_or(0, Vec::len))
            .sum();
        let mut buf = vec![0u8; estimate + 256];

        let mut w = Writer::new(&mut buf);
        w.write_u32(MAGIC).expect("preallocated buffer covers the header");
        w.write_u32(VERSION).expect("preallocated buffer covers the header");
        for record in records {
            w.write_name(&record.name).expect("preallocated buffer covers every record");
            w.write_guid(&record.vendor).expect("preallocated buffer covers every record");
            w.write_u32(record.attributes.bits()).expect("preallocated buffer covers every record");
            w.write_data(&record.timestamp.to_bytes()).expect("preallocated buffer covers every record");
            w.write_data(&record.data).expect("preallocated buffer covers every record");
            w.write_bool(record.cert.is_some()).expect("preallocated buffer covers every record");
            if let Some(cert) = &record.cert {
                w.write_data(cert).expect("preallocated buffer covers every record");
            }
        }
        w.write_name(&[]).expect("terminator always fits");

        let written = w.position();
        buf.truncate(written);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Vec<PersistedVariable>, XapidbError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u32()?;
        if magic != MAGIC {
            return Err(XapidbError::BadMagic { expected: MAGIC, got: magic });
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(XapidbError::UnsupportedVersion(version));
        }

        let mut records = Vec::new();
        loop {
            let name = r.read_name()?;
            if name.is_empty() {
                break;
            }
            let vendor = r.read_guid()?;
            let attributes = VariableAttributes::from_bits_truncate(r.read_u32()?);
            let timestamp_bytes = r.read_data()?;
            let timestamp_bytes: [u8; 16] =
                timestamp_bytes.try_into().map_err(|got: Vec<u8>| XapidbError::Corrupt(format!("timestamp is {} bytes, expected 16", got.len())))?;
            let timestamp = EfiTime::from_bytes(timestamp_bytes);
            let data = r.read_data()?;
            let cert = if r.read_bool()? { Some(r.read_data()?) } else { None };
            records.push(PersistedVariable { name, vendor, attributes, timestamp, data, cert });
        }
        Ok(records)
    }
}

impl Backend for XapidbBackend {
    fn parse_arg(&mut self, key: &str, value: &str) -> bool {
        if key == "path" {
            self.path = Some(PathBuf::from(value));
            true
        } else {
            false
        }
    }

    fn check_args(&self) -> Result<(), BackendError> {
        self.path()?;
        Ok(())
    }

    fn init(&mut self) -> Result<(InitResult, Vec<PersistedVariable>), BackendError> {
        let path = self.path()?.clone();
        match fs::read(&path) {
            Ok(bytes) => Ok((InitResult::Success, Self::decode(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok((InitResult::FirstBoot, Vec::new())),
            Err(err) => Err(BackendError::LoadFailed(err.to_string())),
        }
    }

    fn resume(&mut self) -> Result<Vec<PersistedVariable>, BackendError> {
        let path = self.path()?.clone();
        let bytes = fs::read(&path).map_err(|err| BackendError::LoadFailed(err.to_string()))?;
        Ok(Self::decode(&bytes)?)
    }

    fn save(&mut self, records: &[PersistedVariable]) -> Result<(), BackendError> {
        let path = self.path()?.clone();
        fs::write(&path, Self::encode(records)).map_err(|err| BackendError::SaveFailed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uguid::Guid;

    fn name(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn sample_records() -> Vec<PersistedVariable> {
        vec![
            PersistedVariable {
                name: name("Test"),
                vendor: Guid::from_bytes([1; 16]),
                attributes: VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS,
                timestamp: EfiTime::ZERO,
                data: vec![1, 2, 3],
                cert: None,
            },
            PersistedVariable {
                name: name("PK"),
                vendor: Guid::from_bytes([2; 16]),
                attributes: VariableAttributes::NON_VOLATILE
                    | VariableAttributes::BOOTSERVICE_ACCESS
                    | VariableAttributes::RUNTIME_ACCESS
                    | VariableAttributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS,
                timestamp: EfiTime { year: 2026, ..EfiTime::ZERO },
                data: vec![0xAA; 32],
                cert: Some(vec![0xBB; 16]),
            },
        ]
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let records = sample_records();
        let bytes = XapidbBackend::encode(&records);
        let decoded = XapidbBackend::decode(&bytes).unwrap();

        assert_eq!(decoded.len(), records.len());
        assert_eq!(decoded[0].name, records[0].name);
        assert_eq!(decoded[1].cert, records[1].cert);
        assert_eq!(decoded[1].timestamp, records[1].timestamp);
    }

    #[test]
    fn init_without_a_file_is_first_boot() {
        let mut backend = XapidbBackend::new();
        let path = std::env::temp_dir().join(format!("varstore-xapidb-test-missing-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        backend.parse_arg("path", path.to_str().unwrap());
        let (result, records) = backend.init().unwrap();
        assert_eq!(result, InitResult::FirstBoot);
        assert!(records.is_empty());
    }

    #[test]
    fn save_then_resume_round_trips_through_the_filesystem() {
        let path = std::env::temp_dir().join(format!("varstore-xapidb-test-{}", std::process::id()));
        let mut backend = XapidbBackend::new();
        backend.parse_arg("path", path.to_str().unwrap());

        backend.save(&sample_records()).unwrap();
        let resumed = backend.resume().unwrap();
        assert_eq!(resumed.len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_path_argument_fails_check_args() {
        let backend = XapidbBackend::new();
        assert!(matches!(backend.check_args(), Err(BackendError::MissingArg("path"))));
    }
}
