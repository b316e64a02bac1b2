//! I/O-request server registration (§4.6 steps 4-6, 11): creating the
//! server, mapping its two pages, enabling it, and registering the PIO
//! trap address it should wake the service for.

use thiserror::Error;

use crate::ring::{BufferedRing, SyncRing};

#[derive(Debug, Error)]
pub enum IoservError {
    #[error("failed to create the I/O-request server: {0}")]
    CreateFailed(String),
    #[error("failed to map I/O-request server pages: {0}")]
    MapFailed(String),
    #[error("failed to enable the I/O-request server: {0}")]
    EnableFailed(String),
    #[error("failed to register PIO trap at port {port:#x}: {reason}")]
    RegisterTrapFailed { port: u16, reason: String },
}

/// Opaque identifier for a created I/O-request server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoservId(pub u32);

/// The two page frame numbers and the buffered-io event-channel port an
/// I/O-request server hands back on creation (§4.6 step 4).
#[derive(Debug, Clone, Copy)]
pub struct IoservHandle {
    pub ioservid: IoservId,
    pub sync_pfn: u64,
    pub buffered_pfn: u64,
    pub buffered_port: u32,
}

/// The two shared pages once mapped read-write (§4.6 step 5).
pub struct MappedPages {
    pub sync_ring: SyncRing,
    pub buffered_ring: BufferedRing,
}

/// The slice of `libxenctrl`'s I/O-request-server surface this service
/// consumes.
pub trait IoreqServerControl: Send {
    fn create(&mut self, domid: u32) -> Result<IoservHandle, IoservError>;
    fn map_pages(&mut self, handle: IoservHandle, vcpus: usize) -> Result<MappedPages, IoservError>;
    fn enable(&mut self, handle: IoservHandle) -> Result<(), IoservError>;
    fn register_pio_trap(&mut self, handle: IoservHandle, port_address: u16) -> Result<(), IoservError>;
    fn destroy(&mut self, handle: IoservHandle) -> Result<(), IoservError>;
}

/// Fake server for tests: hands back freshly allocated in-process rings
/// instead of mapping real hypervisor pages.
#[derive(Default)]
pub struct MockIoreqServerControl {
    next_id: u32,
    pub created: Vec<IoservId>,
    pub enabled: Vec<IoservId>,
    pub destroyed: Vec<IoservId>,
    pub registered_ports: Vec<u16>,
}

impl MockIoreqServerControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoreqServerControl for MockIoreqServerControl {
    fn create(&mut self, _domid: u32) -> Result<IoservHandle, IoservError> {
        self.next_id += 1;
        let ioservid = IoservId(self.next_id);
        self.created.push(ioservid);
        Ok(IoservHandle { ioservid, sync_pfn: 0x1000 + u64::from(self.next_id), buffered_pfn: 0x2000 + u64::from(self.next_id), buffered_port: 100 + self.next_id })
    }

    fn map_pages(&mut self, _handle: IoservHandle, vcpus: usize) -> Result<MappedPages, IoservError> {
        Ok(MappedPages { sync_ring: SyncRing::new(vcpus), buffered_ring: BufferedRing::new() })
    }

    fn enable(&mut self, handle: IoservHandle) -> Result<(), IoservError> {
        self.enabled.push(handle.ioservid);
        Ok(())
    }

    fn register_pio_trap(&mut self, _handle: IoservHandle, port_address: u16) -> Result<(), IoservError> {
        self.registered_ports.push(port_address);
        Ok(())
    }

    fn destroy(&mut self, handle: IoservHandle) -> Result<(), IoservError> {
        self.destroyed.push(handle.ioservid);
        Ok(())
    }
}
