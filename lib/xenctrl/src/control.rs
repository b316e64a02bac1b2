//! The slice of the hypervisor's domain-control interface this service
//! consumes (§1 "hypervisor control library"): opening a handle and
//! querying a domain's vCPU count and I/O-request-server readiness.
//!
//! Modeled as a capability trait, per §9's "Shared memory with hypervisor"
//! redesign note, rather than exposing hypercall plumbing directly to the
//! lifecycle supervisor.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XenctrlError {
    #[error("failed to open the control interface: {0}")]
    OpenFailed(String),
    #[error("domain {0} does not exist")]
    NoSuchDomain(u32),
    #[error("hypercall {call} failed: {reason}")]
    HypercallFailed { call: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct DomainInfo {
    pub domid: u32,
    pub vcpus: u32,
}

pub trait ControlInterface: Send {
    fn domain_info(&self, domid: u32) -> Result<DomainInfo, XenctrlError>;

    /// `true` once `NR_IOREQ_SERVER_PAGES` is non-zero — the guest
    /// firmware readiness barrier the lifecycle supervisor polls (§4.6
    /// step 3).
    fn ioreq_server_pages_ready(&self, domid: u32) -> Result<bool, XenctrlError>;
}

/// A fake control interface for tests: domains and readiness are
/// preconfigured rather than queried from a real hypervisor.
#[derive(Default)]
pub struct MockControlInterface {
    domains: HashMap<u32, DomainInfo>,
    pages_ready: HashMap<u32, bool>,
}

impl MockControlInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domid: u32, vcpus: u32) -> Self {
        self.domains.insert(domid, DomainInfo { domid, vcpus });
        self.pages_ready.insert(domid, true);
        self
    }

    pub fn set_pages_ready(&mut self, domid: u32, ready: bool) {
        self.pages_ready.insert(domid, ready);
    }
}

impl ControlInterface for MockControlInterface {
    fn domain_info(&self, domid: u32) -> Result<DomainInfo, XenctrlError> {
        self.domains.get(&domid).copied().ok_or(XenctrlError::NoSuchDomain(domid))
    }

    fn ioreq_server_pages_ready(&self, domid: u32) -> Result<bool, XenctrlError> {
        self.domains.get(&domid).ok_or(XenctrlError::NoSuchDomain(domid))?;
        Ok(*self.pages_ready.get(&domid).unwrap_or(&false))
    }
}
