//! The two shared-page rings (§4.5, §5 "Memory ordering"): a per-vCPU
//! synchronous slot ring and a lock-free SPSC buffered ring.
//!
//! In production these slots live in pages the hypervisor maps into this
//! process; here they are owned, in-process memory so the ring logic can
//! be exercised without a real hypervisor. The `fence` calls mark exactly
//! where a real mapped-memory implementation would need the same
//! acquire/release discipline against the hypervisor's writes.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use c_enum::c_enum;
use thiserror::Error;

c_enum! {
    #[derive(Debug, Default)]
    pub enum IoreqState: u32 {
        None = 0
        Ready = 1
        InProcess = 2
        RespReady = 3
    }
}

c_enum! {
    #[derive(Debug, Default)]
    pub enum IoreqKind: u8 {
        Pio = 0
        Copy = 1
        PciConfig = 2
        Invalidate = 5
        TimeOffset = 7
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("no such vCPU slot: {0}")]
    NoSuchVcpu(usize),
    #[error("slot is not in the expected state for this operation")]
    WrongState,
    #[error("buffered ring has no room for this entry")]
    BufferedRingFull,
}

/// One virtual CPU's synchronous I/O request slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoreqSlot {
    pub state: IoreqState,
    pub dir_write: bool,
    pub kind: IoreqKind,
    pub size: u32,
    pub addr: u64,
    pub data: u64,
    pub data_is_ptr: bool,
    pub df: bool,
    pub count: u32,
}

/// The synchronous ring: one slot per vCPU, walked through
/// `Ready -> InProcess -> RespReady` by the service.
pub struct SyncRing {
    slots: Vec<IoreqSlot>,
}

impl SyncRing {
    pub fn new(vcpus: usize) -> Self {
        Self { slots: vec![IoreqSlot::default(); vcpus] }
    }

    pub fn vcpus(&self) -> usize {
        self.slots.len()
    }

    /// Test/simulation helper standing in for the hypervisor posting a
    /// request into `vcpu`'s slot.
    pub fn post_request(&mut self, vcpu: usize, slot: IoreqSlot) -> Result<(), RingError> {
        let entry = self.slots.get_mut(vcpu).ok_or(RingError::NoSuchVcpu(vcpu))?;
        *entry = IoreqSlot { state: IoreqState::Ready, ..slot };
        fence(Ordering::Release);
        Ok(())
    }

    /// Reads a `Ready` slot and transitions it to `InProcess`. Returns
    /// `None` when the slot has nothing pending.
    pub fn take_ready(&mut self, vcpu: usize) -> Result<Option<IoreqSlot>, RingError> {
        let slot = self.slots.get(vcpu).ok_or(RingError::NoSuchVcpu(vcpu))?;
        if slot.state != IoreqState::Ready {
            return Ok(None);
        }
        // Request fields must be read before the state transition is made
        // visible, so the hypervisor never observes InProcess with stale data.
        let request = *slot;
        fence(Ordering::Acquire);
        self.slots[vcpu].state = IoreqState::InProcess;
        fence(Ordering::Release);
        Ok(Some(request))
    }

    /// Writes the response data and transitions the slot to `RespReady`.
    /// The caller notifies the vCPU's bound event-channel port afterward.
    pub fn complete(&mut self, vcpu: usize, data: u64) -> Result<(), RingError> {
        let slot = self.slots.get_mut(vcpu).ok_or(RingError::NoSuchVcpu(vcpu))?;
        if slot.state != IoreqState::InProcess {
            return Err(RingError::WrongState);
        }
        slot.data = data;
        // Response fields must be visible before the state transition that
        // tells the hypervisor they're ready to read.
        fence(Ordering::Release);
        slot.state = IoreqState::RespReady;
        fence(Ordering::Release);
        Ok(())
    }

    #[cfg(test)]
    fn state(&self, vcpu: usize) -> IoreqState {
        self.slots[vcpu].state
    }
}

/// Number of slots in the buffered ring, matching the hypervisor's fixed
/// page layout.
pub const IOREQ_BUFFER_SLOT_NUM: usize = 511;

#[derive(Debug, Clone, Copy, Default)]
struct BufferedEntry {
    kind: IoreqKind,
    dir_write: bool,
    size: u32,
    addr: u64,
    data32: u32,
}

/// A decoded buffered-ring entry: up to a 64-bit `data` value, which spans
/// two physical slots when `size == 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedRequest {
    pub kind: IoreqKind,
    pub dir_write: bool,
    pub addr: u64,
    pub size: u32,
    pub data: u64,
}

/// The buffered ring: a lock-free SPSC queue of write-only requests too
/// small to warrant a full synchronous round trip (MMIO byte writes,
/// mostly). `read_pointer`/`write_pointer` wrap around; slot index is the
/// pointer modulo [`IOREQ_BUFFER_SLOT_NUM`].
pub struct BufferedRing {
    slots: [BufferedEntry; IOREQ_BUFFER_SLOT_NUM],
    read_pointer: AtomicU32,
    write_pointer: AtomicU32,
}

impl BufferedRing {
    pub fn new() -> Self {
        Self { slots: [BufferedEntry::default(); IOREQ_BUFFER_SLOT_NUM], read_pointer: AtomicU32::new(0), write_pointer: AtomicU32::new(0) }
    }

    fn occupied(&self) -> u32 {
        self.write_pointer.load(Ordering::Relaxed).wrapping_sub(self.read_pointer.load(Ordering::Relaxed))
    }

    /// Producer-side test/simulation helper standing in for the
    /// hypervisor. `size` must be 1, 2, 4 or 8; an 8-byte entry occupies
    /// two consecutive slots, with the high 32 bits of `data` in the
    /// second.
    pub fn push(&mut self, kind: IoreqKind, dir_write: bool, addr: u64, size: u32, data: u64) -> Result<(), RingError> {
        let slots_needed = if size == 8 { 2 } else { 1 };
        if self.occupied() as usize + slots_needed > IOREQ_BUFFER_SLOT_NUM {
            return Err(RingError::BufferedRingFull);
        }

        let write = self.write_pointer.load(Ordering::Relaxed);
        self.slots[write as usize % IOREQ_BUFFER_SLOT_NUM] = BufferedEntry { kind, dir_write, size, addr, data32: data as u32 };
        if slots_needed == 2 {
            let second = write.wrapping_add(1);
            self.slots[second as usize % IOREQ_BUFFER_SLOT_NUM] =
                BufferedEntry { kind, dir_write, size, addr, data32: (data >> 32) as u32 };
        }
        // Every slot written above must be observable before the pointer
        // advance that announces them is.
        fence(Ordering::Release);
        self.write_pointer.store(write.wrapping_add(slots_needed as u32), Ordering::Release);
        Ok(())
    }

    /// Consumer-side: pops one logical request, advancing `read_pointer`
    /// only after the whole request (both slots of a `size == 8` pair) has
    /// been consumed. Never reads past `write_pointer`.
    pub fn pop(&mut self) -> Option<BufferedRequest> {
        let write = self.write_pointer.load(Ordering::Acquire);
        let read = self.read_pointer.load(Ordering::Relaxed);
        if read == write {
            return None;
        }

        let first = self.slots[read as usize % IOREQ_BUFFER_SLOT_NUM];
        let slots_consumed = if first.size == 8 { 2 } else { 1 };
        if slots_consumed == 2 && write.wrapping_sub(read) < 2 {
            // The second half of an atomic pair hasn't landed yet.
            return None;
        }

        let data = if slots_consumed == 2 {
            let second = self.slots[read.wrapping_add(1) as usize % IOREQ_BUFFER_SLOT_NUM];
            u64::from(first.data32) | (u64::from(second.data32) << 32)
        } else {
            u64::from(first.data32)
        };

        self.read_pointer.store(read.wrapping_add(slots_consumed as u32), Ordering::Release);
        Some(BufferedRequest { kind: first.kind, dir_write: first.dir_write, addr: first.addr, size: first.size, data })
    }
}

impl Default for BufferedRing {
    fn default() -> Self {
        Self::new()
    }
}
