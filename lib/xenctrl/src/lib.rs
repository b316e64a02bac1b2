//! The hypervisor control capability (C6's acquisition targets, C5's ring
//! protocol): only the slice of domain control, I/O-request-server
//! registration, event channels, and shared-page rings the command
//! handler and lifecycle supervisor consume.
//!
//! Every surface here is a trait with a `Mock*` test implementation; there
//! is no FFI to a real hypervisor in this workspace (§1's "hypervisor
//! control library" is specified only by the capabilities it is called
//! through).

pub mod control;
pub mod evtchn;
pub mod ioreq;
pub mod ring;

pub use control::{ControlInterface, DomainInfo, MockControlInterface, XenctrlError};
pub use evtchn::{EventChannel, EvtchnError, LocalPort, MockEventChannel};
pub use ioreq::{IoservError, IoservHandle, IoservId, IoreqServerControl, MappedPages, MockIoreqServerControl};
pub use ring::{BufferedRequest, BufferedRing, IoreqKind, IoreqSlot, IoreqState, RingError, SyncRing, IOREQ_BUFFER_SLOT_NUM};
