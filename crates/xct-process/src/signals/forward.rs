//! Forwarding of parent signals to a child

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::registry::{RegistrationId, SignalRegistry};
use crate::error::Result;

/// Forwards signals received by this process to one child until dropped.
///
/// Forwarding stops as soon as [`mark_exited`](Self::mark_exited) is called,
/// so a reaped pid that the OS hands out again is never signalled.
pub struct SignalForwarder {
    pid: Pid,
    running: Arc<AtomicBool>,
    registrations: Vec<RegistrationId>,
}

impl SignalForwarder {
    /// Register forwarding to `pid` for each of `signals`.
    ///
    /// Signals the parent currently ignores are skipped. If any registration
    /// fails, the ones already made are removed again.
    pub fn start(pid: Pid, signals: &[Signal]) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let registrations = if signals.is_empty() {
            Vec::new()
        } else {
            let flag = Arc::clone(&running);
            SignalRegistry::global().register_many(
                signals,
                Arc::new(move |signal: Signal| {
                    if !flag.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!(pid = %pid, signal = ?signal, "Forwarding signal to child");
                    if let Err(errno) = kill(pid, signal) {
                        warn!(pid = %pid, signal = ?signal, error = %errno, "Failed to forward signal");
                    }
                }),
                false,
            )?
        };

        Ok(Self {
            pid,
            running,
            registrations,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Number of signals actually being forwarded
    pub fn forwarded_count(&self) -> usize {
        self.registrations.len()
    }

    /// Stop forwarding; the child has been reaped.
    pub fn mark_exited(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.mark_exited();
        let registry = SignalRegistry::global();
        for id in self.registrations.drain(..) {
            if let Err(e) = registry.unregister(id) {
                warn!(pid = %self.pid, error = %e, "Failed to unregister signal forwarding");
            }
        }
    }
}

impl std::fmt::Debug for SignalForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalForwarder")
            .field("pid", &self.pid)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_drop_unregisters() {
        let registry = SignalRegistry::global();
        let before = registry.callback_count(Signal::SIGWINCH);
        let forwarder = SignalForwarder::start(Pid::this(), &[Signal::SIGWINCH]).unwrap();
        assert_eq!(forwarder.forwarded_count(), 1);
        assert_eq!(registry.callback_count(Signal::SIGWINCH), before + 1);
        drop(forwarder);
        assert_eq!(registry.callback_count(Signal::SIGWINCH), before);
    }

    #[test]
    fn test_no_signals_registers_nothing() {
        let forwarder = SignalForwarder::start(Pid::this(), &[]).unwrap();
        assert_eq!(forwarder.forwarded_count(), 0);
    }
}
