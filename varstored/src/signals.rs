//! Signal handling (§9 "Signal handling" redesign note): TERM/INT/HUP/ABRT
//! and USR1 are blocked from asynchronous delivery and instead read off a
//! `signalfd`, so the main loop observes them as `SignalKind` messages
//! polled alongside the event channel rather than as async-signal-unsafe
//! code running inside a handler.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use thiserror::Error;

/// What a delivered signal means to the lifecycle supervisor (§6 "Signals").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// TERM, INT, HUP, ABRT: tear down and exit.
    Terminate(Signal),
    /// USR1: reserved hook, kept for compatibility, otherwise a no-op.
    Reserved,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to block signals for synchronous delivery: {0}")]
    Block(#[source] nix::Error),
    #[error("failed to create the signalfd: {0}")]
    CreateFd(#[source] nix::Error),
    #[error("failed to read a pending signal: {0}")]
    Read(#[source] nix::Error),
}

const TERMINATING: [Signal; 4] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGABRT];

/// Owns the process's signal mask and the `signalfd` reading from it.
/// Dropping this restores nothing — the mask stays blocked for the
/// process's remaining lifetime, which is fine since the only reader left
/// standing should be this one.
pub struct SignalSource {
    fd: SignalFd,
}

impl SignalSource {
    /// Blocks TERM/INT/HUP/ABRT/USR1 on the calling thread and opens a
    /// `signalfd` to read them back synchronously.
    pub fn install() -> Result<Self, SignalError> {
        let mut mask = SigSet::empty();
        for sig in TERMINATING {
            mask.add(sig);
        }
        mask.add(Signal::SIGUSR1);
        mask.thread_block().map_err(SignalError::Block)?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(SignalError::CreateFd)?;
        Ok(Self { fd })
    }

    /// Non-blocking: `None` means no signal is currently pending.
    pub fn poll(&mut self) -> Result<Option<SignalKind>, SignalError> {
        match self.fd.read_signal() {
            Ok(Some(info)) => Ok(Some(classify(info.ssi_signo))),
            Ok(None) => Ok(None),
            Err(err) => Err(SignalError::Read(err)),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn classify(signo: u32) -> SignalKind {
    for sig in TERMINATING {
        if signo == sig as u32 {
            return SignalKind::Terminate(sig);
        }
    }
    SignalKind::Reserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn usr1_is_classified_as_reserved() {
        let mut source = SignalSource::install().unwrap();
        raise(Signal::SIGUSR1).unwrap();
        let kind = source.poll().unwrap();
        assert_eq!(kind, Some(SignalKind::Reserved));
    }

    #[test]
    fn term_is_classified_as_terminate() {
        let mut source = SignalSource::install().unwrap();
        raise(Signal::SIGTERM).unwrap();
        let kind = source.poll().unwrap();
        assert_eq!(kind, Some(SignalKind::Terminate(Signal::SIGTERM)));
    }

    #[test]
    fn polling_with_nothing_pending_returns_none() {
        let mut source = SignalSource::install().unwrap();
        assert_eq!(source.poll().unwrap(), None);
    }
}
