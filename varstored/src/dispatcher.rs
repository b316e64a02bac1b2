//! The I/O dispatcher (C5, §4.5): drains both hypervisor rings, decodes a
//! `IOREQ_TYPE_PIO` write to the registered port as "the shared request
//! page now holds a command", invokes the command handler, and signals
//! completion back through the matching event-channel port.

use std::time::Duration;

use sentinel::log;
use xenctrl::{BufferedRing, EventChannel, IoreqKind, IoreqState, LocalPort, RingError, SyncRing};

use crate::context::RootContext;
use crate::handler;

/// Size of the shared request/response page (§3 "Request buffer").
pub const SHMEM_SIZE: usize = 16 * 1024;

/// The per-vCPU and buffered-ring plumbing the lifecycle supervisor hands
/// the dispatcher once acquisition completes.
pub struct Dispatcher {
    sync_ring: SyncRing,
    buffered_ring: BufferedRing,
    base_port_address: u16,
    vcpu_ports: Vec<LocalPort>,
    buffered_port: LocalPort,
    /// The command channel's own page, distinct from the two ioreq pages:
    /// the PIO write only signals "ready", the guest's actual request and
    /// this service's response travel through here.
    shared_page: Vec<u8>,
}

impl Dispatcher {
    pub fn new(sync_ring: SyncRing, buffered_ring: BufferedRing, base_port_address: u16, vcpu_ports: Vec<LocalPort>, buffered_port: LocalPort) -> Self {
        Self { sync_ring, buffered_ring, base_port_address, vcpu_ports, buffered_port, shared_page: vec![0u8; SHMEM_SIZE] }
    }

    /// Test/simulation accessor: the shared command page a test can write
    /// a request into before driving the ring.
    pub fn shared_page_mut(&mut self) -> &mut [u8] {
        &mut self.shared_page
    }

    pub fn sync_ring_mut(&mut self) -> &mut SyncRing {
        &mut self.sync_ring
    }

    pub fn buffered_ring_mut(&mut self) -> &mut BufferedRing {
        &mut self.buffered_ring
    }

    /// Drains every vCPU's synchronous slot and the buffered ring once,
    /// invoking the command handler for every `PIO` write that targets the
    /// registered base port address. Returns the number of commands
    /// processed.
    pub fn poll_once(&mut self, ctx: &mut RootContext, evtchn: &mut dyn EventChannel) -> usize {
        let mut processed = 0;

        for vcpu in 0..self.sync_ring.vcpus() {
            if self.service_sync_slot(ctx, evtchn, vcpu) {
                processed += 1;
            }
        }

        while let Some(request) = self.buffered_ring.pop() {
            if self.is_targeted_pio_write(request.kind, request.dir_write, false, request.addr) {
                handler::handle(ctx, &self.shared_page.clone(), &mut self.shared_page);
                if let Err(err) = evtchn.notify(self.buffered_port) {
                    log!(Warning, "failed to notify buffered-io port: {err}");
                }
                processed += 1;
            }
        }

        processed
    }

    fn service_sync_slot(&mut self, ctx: &mut RootContext, evtchn: &mut dyn EventChannel, vcpu: usize) -> bool {
        let slot = match self.sync_ring.take_ready(vcpu) {
            Ok(Some(slot)) => slot,
            Ok(None) => return false,
            Err(RingError::NoSuchVcpu(_)) => return false,
            Err(err) => {
                log!(Warning, "unexpected ring state on vCPU {vcpu}: {err}");
                return false;
            }
        };

        if self.is_targeted_pio_write(slot.kind, slot.dir_write, slot.data_is_ptr, slot.addr) {
            let request = self.shared_page.clone();
            handler::handle(ctx, &request, &mut self.shared_page);
        }
        // Non-matching request types (MMIO copy, PCI config, time-offset,
        // invalidate) are acknowledged but otherwise ignored (§4.5).

        if let Err(err) = self.sync_ring.complete(vcpu, 0) {
            log!(Warning, "failed to complete vCPU {vcpu} slot: {err}");
            return false;
        }

        let port = self.vcpu_ports.get(vcpu).copied().unwrap_or(LocalPort::UNBOUND);
        if port.is_bound() {
            if let Err(err) = evtchn.notify(port) {
                log!(Warning, "failed to notify vCPU {vcpu} port: {err}");
            }
        }
        true
    }

    fn is_targeted_pio_write(&self, kind: IoreqKind, dir_write: bool, data_is_ptr: bool, addr: u64) -> bool {
        kind == IoreqKind::Pio && dir_write && !data_is_ptr && addr == u64::from(self.base_port_address)
    }

    /// Blocks on the event channel for up to `timeout`, then drains
    /// whatever slots the wakeup indicated might be ready. Returns the
    /// number of commands processed; an empty result after `timeout`
    /// elapses is routine, not an error (§5 "Suspension points").
    pub fn wait_and_poll(&mut self, ctx: &mut RootContext, evtchn: &mut dyn EventChannel, timeout: Duration) -> usize {
        match evtchn.wait(timeout) {
            Ok(ports) if ports.is_empty() => 0,
            Ok(_) => self.poll_once(ctx, evtchn),
            Err(err) => {
                log!(Warning, "event-channel wait failed: {err}");
                0
            }
        }
    }
}
