//! The lifecycle supervisor (C6, §4.6): ordered acquisition of every
//! external resource the service needs, and symmetric reverse teardown —
//! driven by an explicit phase ordinal rather than nested `Result`
//! unwinding, so a failure partway through acquisition always releases
//! exactly what was acquired, in reverse order.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use sentinel::log;
use thiserror::Error;

use varstore_core::backend::{restore, InitResult};
use varstore_core::provisioning::{provision_first_boot, VendorKeys};
use varstore_core::{Backend, BackendError, StoreError, VariableStore};
use xenctrl::{ControlInterface, EventChannel, EvtchnError, IoreqServerControl, IoservError, IoservHandle, LocalPort, XenctrlError};
use xenstore::{publish_pid, read_policy, remove_pid, Pidfile, PidfileError, Store, XenstoreError};

use crate::context::RootContext;
use crate::dispatcher::Dispatcher;

/// How often §4.6 step 3 re-checks `NR_IOREQ_SERVER_PAGES`.
const GUEST_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Caps the otherwise-unbounded readiness poll so a guest that never comes
/// up fails acquisition instead of hanging the process forever.
const GUEST_READY_MAX_ATTEMPTS: u32 = 100;

/// The 13 named phases of §3 "Lifecycle Phase", reached in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Uninitialized,
    InterfaceOpen,
    ServerRegistered,
    SharedIoPageMapped,
    BufferedIoPageMapped,
    ServerEnabled,
    PortArrayAllocated,
    EvtchnOpen,
    PortsBound,
    BufPortBound,
    PortInitialized,
    WrotePid,
    Initialized,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to query domain info: {0}")]
    DomainInfo(#[source] XenctrlError),
    #[error("failed to query I/O-request-server page readiness: {0}")]
    GuestReadyQuery(#[source] XenctrlError),
    #[error("timed out waiting for the guest's I/O-request-server pages to be ready")]
    GuestNotReady,
    #[error("failed to create the I/O-request server: {0}")]
    CreateServer(#[source] IoservError),
    #[error("failed to map I/O-request server pages: {0}")]
    MapPages(#[source] IoservError),
    #[error("failed to enable the I/O-request server: {0}")]
    EnableServer(#[source] IoservError),
    #[error("failed to bind an interdomain event-channel port: {0}")]
    BindPort(#[source] EvtchnError),
    #[error("failed to bind the buffered-io event-channel port: {0}")]
    BindBufferedPort(#[source] EvtchnError),
    #[error("failed to register the PIO trap: {0}")]
    RegisterTrap(#[source] IoservError),
    #[error("failed to read external policy: {0}")]
    Policy(#[source] XenstoreError),
    #[error("failed to load durable state: {0}")]
    Backend(#[source] BackendError),
    #[error("first-boot key provisioning failed: {0}")]
    Provisioning(#[source] StoreError),
    #[error("failed to publish the process id: {0}")]
    PublishPid(#[source] XenstoreError),
    #[error("failed to acquire the pidfile: {0}")]
    Pidfile(#[source] PidfileError),
}

/// Everything acquisition needs: the capability objects, plus the
/// arguments that shape how the store comes up (resume vs. fresh,
/// first-boot vendor keys, the port address the dispatcher will watch).
pub struct LifecycleSupervisor {
    domid: u32,
    base_port_address: u16,
    pidfile_path: PathBuf,
    resume: bool,
    vendor_keys: VendorKeys,

    control: Box<dyn ControlInterface>,
    ioserv: Box<dyn IoreqServerControl>,
    evtchn: Box<dyn EventChannel>,
    xenstore: Box<dyn Store>,

    phase: Phase,
    ioserv_handle: Option<IoservHandle>,
    vcpu_ports: Vec<LocalPort>,
    buffered_port: LocalPort,
    pidfile: Option<Pidfile>,
}

impl LifecycleSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domid: u32,
        base_port_address: u16,
        pidfile_path: PathBuf,
        resume: bool,
        vendor_keys: VendorKeys,
        control: Box<dyn ControlInterface>,
        ioserv: Box<dyn IoreqServerControl>,
        evtchn: Box<dyn EventChannel>,
        xenstore: Box<dyn Store>,
    ) -> Self {
        Self {
            domid,
            base_port_address,
            pidfile_path,
            resume,
            vendor_keys,
            control,
            ioserv,
            evtchn,
            xenstore,
            phase: Phase::Uninitialized,
            ioserv_handle: None,
            vcpu_ports: Vec::new(),
            buffered_port: LocalPort::UNBOUND,
            pidfile: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The event channel the dispatcher's main loop waits and notifies on
    /// — the same interface the supervisor bound the vCPU and buffered
    /// ports through during acquisition.
    pub fn evtchn_mut(&mut self) -> &mut dyn EventChannel {
        self.evtchn.as_mut()
    }

    /// Runs the forward sequence of §4.6. On success, hands back the root
    /// context and dispatcher the main loop drives; on failure, tears down
    /// whatever was acquired before propagating the error.
    pub fn initialize(&mut self, backend: Box<dyn Backend>) -> Result<(RootContext, Dispatcher), LifecycleError> {
        match self.initialize_inner(backend) {
            Ok(ready) => Ok(ready),
            Err(err) => {
                log!(Critical, "lifecycle acquisition failed at phase {:?}: {err}", self.phase);
                self.teardown();
                Err(err)
            }
        }
    }

    fn initialize_inner(&mut self, mut backend: Box<dyn Backend>) -> Result<(RootContext, Dispatcher), LifecycleError> {
        // Step 1: the control interface is already open by construction.
        self.phase = Phase::InterfaceOpen;

        // Step 2: query domain info.
        let domain = self.control.domain_info(self.domid).map_err(LifecycleError::DomainInfo)?;

        // Step 3: guest firmware readiness barrier.
        self.wait_for_guest_ready()?;

        // Step 4: create the I/O-request server.
        let handle = self.ioserv.create(self.domid).map_err(LifecycleError::CreateServer)?;
        self.ioserv_handle = Some(handle);
        self.phase = Phase::ServerRegistered;

        // Step 5: map the two shared pages.
        let mapped = self.ioserv.map_pages(handle, domain.vcpus as usize).map_err(LifecycleError::MapPages)?;
        self.phase = Phase::SharedIoPageMapped;
        self.phase = Phase::BufferedIoPageMapped;

        // Step 6: enable the server.
        self.ioserv.enable(handle).map_err(LifecycleError::EnableServer)?;
        self.phase = Phase::ServerEnabled;

        // Step 7: allocate the per-vCPU port table.
        self.vcpu_ports = vec![LocalPort::UNBOUND; domain.vcpus as usize];
        self.phase = Phase::PortArrayAllocated;

        // Step 8: the event-channel interface is already open by construction.
        self.phase = Phase::EvtchnOpen;

        // Step 9: bind one interdomain port per vCPU.
        for vcpu in 0..domain.vcpus as usize {
            let remote_port = handle.buffered_port + vcpu as u32 + 1;
            let port = self.evtchn.bind_interdomain(self.domid, remote_port).map_err(LifecycleError::BindPort)?;
            self.vcpu_ports[vcpu] = port;
        }
        self.phase = Phase::PortsBound;

        // Step 10: bind the buffered-io port.
        self.buffered_port = self.evtchn.bind_interdomain(self.domid, handle.buffered_port).map_err(LifecycleError::BindBufferedPort)?;
        self.phase = Phase::BufPortBound;

        // Step 11: register the PIO trap.
        self.ioserv.register_pio_trap(handle, self.base_port_address).map_err(LifecycleError::RegisterTrap)?;
        self.phase = Phase::PortInitialized;

        // Step 12: read policy, load durable state, provision on first boot.
        let policy = read_policy(self.xenstore.as_ref(), self.domid).map_err(LifecycleError::Policy)?;
        let store = self.load_store(backend.as_mut())?;

        // Step 13: publish identity. The phase advances as soon as the
        // xenstore node is written so a subsequent pidfile failure still
        // triggers its removal on teardown.
        publish_pid(self.xenstore.as_mut(), self.domid, std::process::id()).map_err(LifecycleError::PublishPid)?;
        self.phase = Phase::WrotePid;
        let pidfile = Pidfile::acquire(&self.pidfile_path, std::process::id()).map_err(LifecycleError::Pidfile)?;
        self.pidfile = Some(pidfile);

        self.phase = Phase::Initialized;

        let ctx = RootContext::new(store, policy, backend);
        let dispatcher = Dispatcher::new(mapped.sync_ring, mapped.buffered_ring, self.base_port_address, self.vcpu_ports.clone(), self.buffered_port);
        Ok((ctx, dispatcher))
    }

    fn wait_for_guest_ready(&self) -> Result<(), LifecycleError> {
        for attempt in 0..GUEST_READY_MAX_ATTEMPTS {
            if self.control.ioreq_server_pages_ready(self.domid).map_err(LifecycleError::GuestReadyQuery)? {
                return Ok(());
            }
            if attempt + 1 < GUEST_READY_MAX_ATTEMPTS {
                thread::sleep(GUEST_READY_POLL_INTERVAL);
            }
        }
        Err(LifecycleError::GuestNotReady)
    }

    fn load_store(&self, backend: &mut dyn Backend) -> Result<VariableStore, LifecycleError> {
        if self.resume {
            let records = backend.resume().map_err(LifecycleError::Backend)?;
            return Ok(restore(records));
        }

        let (result, records) = backend.init().map_err(LifecycleError::Backend)?;
        if result == InitResult::Failure {
            return Err(LifecycleError::Backend(BackendError::LoadFailed("a prior snapshot exists but could not be loaded".to_string())));
        }

        let mut store = restore(records);
        if result == InitResult::FirstBoot {
            provision_first_boot(&mut store, &self.vendor_keys).map_err(LifecycleError::Provisioning)?;
        }
        Ok(store)
    }

    /// Strictly reverse teardown: releases exactly the resources acquired
    /// at or above the current phase, then resets to `Uninitialized`.
    /// Idempotent — safe to call more than once.
    pub fn teardown(&mut self) {
        if self.phase >= Phase::WrotePid {
            remove_pid(self.xenstore.as_mut(), self.domid);
        }
        self.pidfile = None;

        if self.phase >= Phase::BufPortBound && self.buffered_port.is_bound() {
            if let Err(err) = self.evtchn.unbind(self.buffered_port) {
                log!(Warning, "failed to unbind buffered-io port: {err}");
            }
            self.buffered_port = LocalPort::UNBOUND;
        }

        if self.phase >= Phase::PortsBound {
            for port in self.vcpu_ports.drain(..) {
                if port.is_bound() {
                    if let Err(err) = self.evtchn.unbind(port) {
                        log!(Warning, "failed to unbind vCPU port: {err}");
                    }
                }
            }
        }

        if self.phase >= Phase::ServerRegistered {
            if let Some(handle) = self.ioserv_handle.take() {
                if let Err(err) = self.ioserv.destroy(handle) {
                    log!(Warning, "failed to destroy I/O-request server: {err}");
                }
            }
        }

        self.phase = Phase::Uninitialized;
    }
}
