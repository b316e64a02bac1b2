//! Event-channel interface (§4.6 steps 7-10): per-vCPU interdomain port
//! binding plus the buffered-io port, and the blocking wait the main loop
//! polls on (§5 "Suspension points").

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvtchnError {
    #[error("failed to open the event-channel interface: {0}")]
    OpenFailed(String),
    #[error("failed to bind interdomain port: {0}")]
    BindFailed(String),
    #[error("port {0:?} is not bound")]
    NotBound(LocalPort),
}

/// Locally-bound event-channel port. `UNBOUND` is the sentinel the
/// per-vCPU port table (§4.6 step 7) is initialized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalPort(pub u32);

impl LocalPort {
    pub const UNBOUND: LocalPort = LocalPort(u32::MAX);

    pub fn is_bound(self) -> bool {
        self != Self::UNBOUND
    }
}

pub trait EventChannel: Send {
    fn bind_interdomain(&mut self, domid: u32, remote_port: u32) -> Result<LocalPort, EvtchnError>;
    fn unbind(&mut self, port: LocalPort) -> Result<(), EvtchnError>;
    fn notify(&mut self, port: LocalPort) -> Result<(), EvtchnError>;

    /// Blocks up to `timeout` for a pending notification on any bound
    /// port; returns the ports that fired, or an empty `Vec` on timeout.
    fn wait(&mut self, timeout: Duration) -> Result<Vec<LocalPort>, EvtchnError>;
}

/// A fake event channel for tests: notifications are queued by the test
/// rather than delivered by a real hypervisor, and `wait` drains whatever
/// is queued without actually sleeping.
#[derive(Default)]
pub struct MockEventChannel {
    next_port: u32,
    bound: Vec<LocalPort>,
    pending: VecDeque<LocalPort>,
}

impl MockEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper simulating the hypervisor signaling `port`.
    pub fn fire(&mut self, port: LocalPort) {
        self.pending.push_back(port);
    }
}

impl EventChannel for MockEventChannel {
    fn bind_interdomain(&mut self, _domid: u32, _remote_port: u32) -> Result<LocalPort, EvtchnError> {
        self.next_port += 1;
        let port = LocalPort(self.next_port);
        self.bound.push(port);
        Ok(port)
    }

    fn unbind(&mut self, port: LocalPort) -> Result<(), EvtchnError> {
        let before = self.bound.len();
        self.bound.retain(|p| *p != port);
        if self.bound.len() == before {
            return Err(EvtchnError::NotBound(port));
        }
        Ok(())
    }

    fn notify(&mut self, port: LocalPort) -> Result<(), EvtchnError> {
        if !self.bound.contains(&port) {
            return Err(EvtchnError::NotBound(port));
        }
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Vec<LocalPort>, EvtchnError> {
        Ok(self.pending.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_sentinel_reports_unbound() {
        assert!(!LocalPort::UNBOUND.is_bound());
        assert!(LocalPort(0).is_bound());
    }

    #[test]
    fn wait_drains_fired_ports() {
        let mut chan = MockEventChannel::new();
        let port = chan.bind_interdomain(1, 9).unwrap();
        chan.fire(port);
        chan.fire(LocalPort(999));
        let fired = chan.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(fired, vec![port, LocalPort(999)]);
        assert!(chan.wait(Duration::from_secs(5)).unwrap().is_empty());
    }

    #[test]
    fn notifying_an_unbound_port_is_an_error() {
        let mut chan = MockEventChannel::new();
        assert!(matches!(chan.notify(LocalPort(42)), Err(EvtchnError::NotBound(_))));
    }
}
