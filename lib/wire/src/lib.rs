//! Wire codec for the UEFI variable-service command channel.
//!
//! A request or response is a stream of primitives read from, or written
//! to, a single shared byte buffer via a cursor. Every integer is
//! little-endian; `uintn` is always serialized as 64 bits regardless of
//! the host's pointer width, since the guest and the service may not
//! agree on it.

use thiserror::Error;
use uguid::Guid;

/// Maximum number of UCS-2 code units in a variable name, not counting the
/// trailing null code unit that the wire encoding still carries.
pub const NAME_LIMIT: usize = 1024;

/// A platform-width unsigned integer, always carried as 64 bits on the wire.
pub type Uintn = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too small to read: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("response exceeds buffer: need {needed} bytes, have {available}")]
    OutOfResources { needed: usize, available: usize },
    #[error("name exceeds {NAME_LIMIT} code units: got {got}")]
    NameTooLong { got: usize },
    #[error("name is missing its trailing null code unit")]
    NameNotTerminated,
}

/// A read cursor over a request buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::BufferTooSmall { needed: len, available: self.remaining() });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_uintn(&mut self) -> Result<Uintn, WireError> {
        self.read_u64()
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_guid(&mut self) -> Result<Guid, WireError> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Guid::from_bytes(bytes))
    }

    /// Reads a `uintn`-length-prefixed byte string.
    pub fn read_data(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_uintn()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a length-prefixed UCS-2 name, including its trailing null code
    /// unit, and returns the logical name with the null stripped.
    ///
    /// An empty name (zero code units) decodes to an empty `Vec`; callers
    /// use that to mean "start of enumeration" for `GetNextVariableName`.
    pub fn read_name(&mut self) -> Result<Vec<u16>, WireError> {
        let raw = self.read_data()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        if raw.len() % 2 != 0 {
            return Err(WireError::BufferTooSmall { needed: raw.len() + 1, available: raw.len() });
        }
        let units: Vec<u16> = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        let Some((&0, rest)) = units.split_last() else {
            return Err(WireError::NameNotTerminated);
        };
        if rest.len() > NAME_LIMIT {
            return Err(WireError::NameTooLong { got: rest.len() });
        }
        Ok(rest.to_vec())
    }
}

/// A write cursor over a response buffer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if self.buf.len() - self.pos < bytes.len() {
            return Err(WireError::OutOfResources {
                needed: bytes.len(),
                available: self.buf.len() - self.pos,
            });
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), WireError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), WireError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_uintn(&mut self, value: Uintn) -> Result<(), WireError> {
        self.write_u64(value)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), WireError> {
        self.put(&[value as u8])
    }

    pub fn write_guid(&mut self, guid: &Guid) -> Result<(), WireError> {
        self.put(&guid.to_bytes())
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.write_uintn(data.len() as Uintn)?;
        self.put(data)
    }

    /// Writes a UCS-2 name, appending the trailing null code unit the wire
    /// format requires.
    pub fn write_name(&mut self, name: &[u16]) -> Result<(), WireError> {
        let mut raw = Vec::with_capacity((name.len() + 1) * 2);
        for unit in name {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        raw.extend_from_slice(&0u16.to_le_bytes());
        self.write_data(&raw)
    }
}

/// Digest input for an authenticated write (§4.3 step 2): the byte
/// concatenation `name (no trailing null) || vendor || attributes (LE) ||
/// timestamp || new_content`, independent of the request/response framing
/// above.
pub fn auth_digest_input(name: &[u16], vendor: &Guid, attributes: u32, timestamp: &[u8; 16], content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() * 2 + 16 + 4 + 16 + content.len());
    for unit in name {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf.extend_from_slice(&vendor.to_bytes());
    buf.extend_from_slice(&attributes.to_le_bytes());
    buf.extend_from_slice(timestamp);
    buf.extend_from_slice(content);
    buf
}
