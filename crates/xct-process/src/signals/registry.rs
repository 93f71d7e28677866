//! Process-wide signal callback registry
//!
//! One OS-level handler per signal, installed while at least one callback is
//! registered. The handler only writes the signal number to a self-pipe; a
//! dispatch thread reads it, runs the callbacks newest first and then chains
//! to the disposition that was in place before the registry took over.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{raise, SigSet, Signal};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ProcessError, Result};
use crate::sys;

/// Callback run on the dispatch thread when a registered signal arrives
pub type SignalCallback = Arc<dyn Fn(Signal) + Send + Sync>;

/// Write end of the self-pipe; -1 until the dispatcher is running.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

static GLOBAL: OnceLock<SignalRegistry> = OnceLock::new();

extern "C" fn handle_signal(signo: libc::c_int) {
    let saved = Errno::last_raw();
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe; the pipe is non-blocking so a
        // full pipe drops the wakeup instead of hanging the handler.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    Errno::set_raw(saved);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SA_RESTORER: libc::c_int = 0x0400_0000;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SA_RESTORER: libc::c_int = 0;

/// A raw signal disposition (handler, flags and mask)
#[derive(Clone, Copy)]
pub struct Disposition {
    raw: libc::sigaction,
}

impl Disposition {
    /// Read the disposition currently installed for `signal`.
    pub fn current(signal: Signal) -> Result<Self> {
        // SAFETY: a zeroed sigaction is a valid out-parameter.
        let mut raw: libc::sigaction = unsafe { mem::zeroed() };
        Errno::result(unsafe { libc::sigaction(signal as libc::c_int, ptr::null(), &mut raw) })
            .map_err(ProcessError::system("sigaction"))?;
        Ok(Self { raw })
    }

    /// The registry's handler, keeping the mask of `original`.
    fn registry_handler(original: &Disposition, signal: Signal) -> Self {
        // SAFETY: all-zero is a valid sigaction before we fill it in.
        let mut raw: libc::sigaction = unsafe { mem::zeroed() };
        raw.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        raw.sa_mask = original.raw.sa_mask;
        raw.sa_flags = libc::SA_RESTART;
        if !original.mask_contains(signal) {
            raw.sa_flags |= libc::SA_NODEFER;
        }
        Self { raw }
    }

    fn install(&self, signal: Signal) -> Result<()> {
        Errno::result(unsafe { libc::sigaction(signal as libc::c_int, &self.raw, ptr::null_mut()) })
            .map(drop)
            .map_err(ProcessError::system("sigaction"))
    }

    pub fn is_ignored(&self) -> bool {
        self.raw.sa_sigaction == libc::SIG_IGN
    }

    pub fn is_default(&self) -> bool {
        self.raw.sa_sigaction == libc::SIG_DFL
    }

    /// Handler address (or `SIG_DFL`/`SIG_IGN`)
    pub fn handler(&self) -> usize {
        self.raw.sa_sigaction as usize
    }

    /// Flags, without the libc-managed restorer bit
    pub fn flags(&self) -> libc::c_int {
        self.raw.sa_flags & !SA_RESTORER
    }

    pub fn mask_contains(&self, signal: Signal) -> bool {
        // SAFETY: the mask is a fully initialised sigset_t.
        unsafe { libc::sigismember(&self.raw.sa_mask, signal as libc::c_int) == 1 }
    }
}

impl PartialEq for Disposition {
    fn eq(&self, other: &Self) -> bool {
        self.handler() == other.handler()
            && self.flags() == other.flags()
            && Signal::iterator().all(|s| self.mask_contains(s) == other.mask_contains(s))
    }
}

impl Eq for Disposition {}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask: Vec<Signal> = Signal::iterator().filter(|s| self.mask_contains(*s)).collect();
        f.debug_struct("Disposition")
            .field("handler", &format_args!("{:#x}", self.handler()))
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("mask", &mask)
            .finish()
    }
}

/// Handle returned by [`SignalRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct SignalEntry {
    original: Disposition,
    installed: Disposition,
    callbacks: Vec<(RegistrationId, SignalCallback)>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<Signal, SignalEntry>,
    next_id: u64,
    dispatcher_started: bool,
}

/// Process-wide table of signal callbacks
pub struct SignalRegistry {
    state: Mutex<RegistryState>,
}

impl SignalRegistry {
    /// The registry shared by the whole process
    pub fn global() -> &'static SignalRegistry {
        GLOBAL.get_or_init(|| SignalRegistry {
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Register `callback` for `signal`.
    ///
    /// Returns `Ok(None)` without touching anything when the signal is
    /// ignored (judged on the disposition the registry first captured) and
    /// `bypass_if_ignored` is false.
    pub fn register(
        &'static self,
        signal: Signal,
        callback: SignalCallback,
        bypass_if_ignored: bool,
    ) -> Result<Option<RegistrationId>> {
        let mut state = self.state.lock();
        self.ensure_dispatcher(&mut state)?;

        let current = Disposition::current(signal)?;
        let id = RegistrationId(state.next_id);

        match state.entries.get_mut(&signal) {
            Some(entry) => {
                if current != entry.installed {
                    return Err(ProcessError::SignalHandlerChangedExternally { signal });
                }
                if entry.original.is_ignored() && !bypass_if_ignored {
                    return Ok(None);
                }
                entry.callbacks.push((id, callback));
            }
            None => {
                if current.is_ignored() && !bypass_if_ignored {
                    return Ok(None);
                }
                Disposition::registry_handler(&current, signal).install(signal)?;
                let installed = match Disposition::current(signal) {
                    Ok(installed) => installed,
                    Err(e) => {
                        let _ = current.install(signal);
                        return Err(e);
                    }
                };
                debug!(signal = ?signal, original = ?current, "Installed signal handler");
                state.entries.insert(
                    signal,
                    SignalEntry {
                        original: current,
                        installed,
                        callbacks: vec![(id, callback)],
                    },
                );
            }
        }

        state.next_id += 1;
        Ok(Some(id))
    }

    /// Register one callback for several signals, all or nothing.
    pub fn register_many(
        &'static self,
        signals: &[Signal],
        callback: SignalCallback,
        bypass_if_ignored: bool,
    ) -> Result<Vec<RegistrationId>> {
        let mut ids = Vec::with_capacity(signals.len());
        for &signal in signals {
            match self.register(signal, Arc::clone(&callback), bypass_if_ignored) {
                Ok(Some(id)) => ids.push(id),
                Ok(None) => {}
                Err(e) => {
                    for id in ids {
                        if let Err(rollback) = self.unregister(id) {
                            warn!(error = %rollback, "Failed to roll back signal registration");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    /// Remove a callback. Removing the last one for a signal restores the
    /// original disposition. Returns false for unknown ids.
    pub fn unregister(&self, id: RegistrationId) -> Result<bool> {
        let mut state = self.state.lock();

        let Some((&signal, entry)) = state
            .entries
            .iter_mut()
            .find(|(_, entry)| entry.callbacks.iter().any(|(cid, _)| *cid == id))
        else {
            return Ok(false);
        };

        entry.callbacks.retain(|(cid, _)| *cid != id);
        if entry.callbacks.is_empty() {
            entry.original.install(signal)?;
            debug!(signal = ?signal, "Restored original signal disposition");
            state.entries.remove(&signal);
        }
        Ok(true)
    }

    /// Number of callbacks currently registered for `signal`
    pub fn callback_count(&self, signal: Signal) -> usize {
        self.state
            .lock()
            .entries
            .get(&signal)
            .map_or(0, |entry| entry.callbacks.len())
    }

    fn ensure_dispatcher(&'static self, state: &mut RegistryState) -> Result<()> {
        if state.dispatcher_started {
            return Ok(());
        }

        let (read, write) = sys::cloexec_pipe()?;
        sys::set_nonblocking(write.as_raw_fd())?;
        let reader = File::from(read);

        std::thread::Builder::new()
            .name("xct-signal-dispatch".to_string())
            .spawn(move || self.dispatch_loop(reader))?;

        // The write end lives for the rest of the process.
        WAKE_FD.store(write.into_raw_fd(), Ordering::Relaxed);
        state.dispatcher_started = true;
        Ok(())
    }

    fn dispatch_loop(&self, mut reader: File) {
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match Signal::try_from(byte as libc::c_int) {
                            Ok(signal) => self.dispatch(signal),
                            Err(e) => warn!(signo = byte, error = %e, "Unknown signal on self-pipe"),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Signal dispatcher stopped");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, signal: Signal) {
        let callbacks: Vec<SignalCallback> = {
            let state = self.state.lock();
            state
                .entries
                .get(&signal)
                .map(|entry| entry.callbacks.iter().rev().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        trace!(signal = ?signal, callbacks = callbacks.len(), "Dispatching signal");

        for callback in callbacks {
            callback(signal);
        }

        let state = self.state.lock();
        let result = match state.entries.get(&signal) {
            Some(entry) => chain_to(signal, &entry.original, &entry.installed),
            // Unregistered since delivery: the original is back in place.
            None => match Disposition::current(signal) {
                Ok(current) if !current.is_ignored() => reraise(signal),
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!(signal = ?signal, error = %e, "Failed to chain to original signal disposition");
        }
    }
}

/// Run the original disposition for a signal the registry handler caught.
fn chain_to(signal: Signal, original: &Disposition, installed: &Disposition) -> Result<()> {
    if original.is_ignored() {
        return Ok(());
    }
    original.install(signal)?;
    let raised = reraise(signal);
    installed.install(signal)?;
    raised
}

fn reraise(signal: Signal) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(signal);
    set.thread_unblock()
        .map_err(ProcessError::system("pthread_sigmask"))?;
    raise(signal).map_err(ProcessError::system("raise"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler};
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    static ORIGINAL_HITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn counting_handler(_: libc::c_int) {
        ORIGINAL_HITS.fetch_add(1, Ordering::SeqCst);
    }

    fn install_custom(signal: Signal) -> Disposition {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGALRM);
        let action = SigAction::new(
            SigHandler::Handler(counting_handler),
            SaFlags::SA_RESTART | SaFlags::SA_ONSTACK,
            mask,
        );
        unsafe { sigaction(signal, &action) }.unwrap();
        Disposition::current(signal).unwrap()
    }

    fn noop() -> SignalCallback {
        Arc::new(|_: Signal| {})
    }

    #[test]
    #[serial]
    fn test_last_unregister_restores_original_exactly() {
        let registry = SignalRegistry::global();
        let original = install_custom(Signal::SIGUSR2);

        let first = registry.register(Signal::SIGUSR2, noop(), false).unwrap().unwrap();
        let second = registry.register(Signal::SIGUSR2, noop(), false).unwrap().unwrap();
        assert_ne!(first, second);
        assert_ne!(Disposition::current(Signal::SIGUSR2).unwrap(), original);
        assert_eq!(registry.callback_count(Signal::SIGUSR2), 2);

        assert!(registry.unregister(first).unwrap());
        assert_ne!(Disposition::current(Signal::SIGUSR2).unwrap(), original);
        assert_eq!(registry.callback_count(Signal::SIGUSR2), 1);

        assert!(registry.unregister(second).unwrap());
        let restored = Disposition::current(Signal::SIGUSR2).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.handler(), counting_handler as usize);
        assert!(restored.mask_contains(Signal::SIGALRM));
        assert_eq!(registry.callback_count(Signal::SIGUSR2), 0);

        assert!(!registry.unregister(second).unwrap());
    }

    #[test]
    #[serial]
    fn test_callbacks_run_newest_first_then_original() {
        let registry = SignalRegistry::global();
        install_custom(Signal::SIGUSR2);
        let before = ORIGINAL_HITS.load(Ordering::SeqCst);

        let (tx, rx) = mpsc::channel();
        let tx_old = tx.clone();
        let old = registry
            .register(Signal::SIGUSR2, Arc::new(move |_: Signal| tx_old.send("old").unwrap()), false)
            .unwrap()
            .unwrap();
        let new = registry
            .register(Signal::SIGUSR2, Arc::new(move |_: Signal| tx.send("new").unwrap()), false)
            .unwrap()
            .unwrap();

        raise(Signal::SIGUSR2).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), ("new", "old"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ORIGINAL_HITS.load(Ordering::SeqCst) == before {
            assert!(std::time::Instant::now() < deadline, "original handler never ran");
            std::thread::sleep(Duration::from_millis(10));
        }

        registry.unregister(new).unwrap();
        registry.unregister(old).unwrap();
    }

    #[test]
    #[serial]
    fn test_remaining_callback_still_fires_after_partial_unregister() {
        let registry = SignalRegistry::global();
        let original = install_custom(Signal::SIGUSR2);
        let before = ORIGINAL_HITS.load(Ordering::SeqCst);

        let (tx, rx) = mpsc::channel();
        let tx_a = tx.clone();
        let a = registry
            .register(Signal::SIGUSR2, Arc::new(move |_: Signal| tx_a.send("a").unwrap()), false)
            .unwrap()
            .unwrap();
        let b = registry
            .register(Signal::SIGUSR2, Arc::new(move |_: Signal| tx.send("b").unwrap()), false)
            .unwrap()
            .unwrap();
        assert!(registry.unregister(a).unwrap());

        raise(Signal::SIGUSR2).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "b");

        // the original runs after every callback, so nothing else is pending
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ORIGINAL_HITS.load(Ordering::SeqCst) == before {
            assert!(std::time::Instant::now() < deadline, "original handler never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(rx.try_recv().is_err());

        assert!(registry.unregister(b).unwrap());
        assert_eq!(Disposition::current(Signal::SIGUSR2).unwrap(), original);
    }

    #[test]
    #[serial]
    fn test_ignored_signal_needs_bypass() {
        let registry = SignalRegistry::global();
        unsafe { sigaction(Signal::SIGUSR1, &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty())) }
            .unwrap();

        assert!(registry.register(Signal::SIGUSR1, noop(), false).unwrap().is_none());
        assert!(Disposition::current(Signal::SIGUSR1).unwrap().is_ignored());

        let id = registry.register(Signal::SIGUSR1, noop(), true).unwrap().unwrap();
        assert!(!Disposition::current(Signal::SIGUSR1).unwrap().is_ignored());
        // still judged on the captured original, not on our handler
        assert!(registry.register(Signal::SIGUSR1, noop(), false).unwrap().is_none());

        registry.unregister(id).unwrap();
        assert!(Disposition::current(Signal::SIGUSR1).unwrap().is_ignored());
    }

    #[test]
    #[serial]
    fn test_external_change_is_detected() {
        let registry = SignalRegistry::global();
        install_custom(Signal::SIGUSR1);
        let id = registry.register(Signal::SIGUSR1, noop(), false).unwrap().unwrap();

        install_custom(Signal::SIGUSR1);
        let err = registry.register(Signal::SIGUSR1, noop(), false).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::SignalHandlerChangedExternally { signal: Signal::SIGUSR1 }
        ));

        registry.unregister(id).unwrap();
    }

    #[test]
    #[serial]
    fn test_register_many_rolls_back() {
        let registry = SignalRegistry::global();
        let original = install_custom(Signal::SIGUSR2);

        let err = registry
            .register_many(&[Signal::SIGUSR2, Signal::SIGKILL], noop(), false)
            .unwrap_err();
        assert_eq!(err.os_error(), Some(Errno::EINVAL));
        assert_eq!(registry.callback_count(Signal::SIGUSR2), 0);
        assert_eq!(Disposition::current(Signal::SIGUSR2).unwrap(), original);
    }
}
