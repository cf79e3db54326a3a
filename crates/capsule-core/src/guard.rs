//! Interrupt handling for the window in which a volume is decrypted.
//!
//! The guard owns a single cleanup closure. Whoever takes it first (a signal
//! or [`ShutdownGuard::disarm`]) decides its fate, so the lock path can run at
//! most once. The closure is taken and executed while the state lock is held,
//! which means a disarm racing a signal waits for the cleanup to finish
//! rather than interleaving with it.

use crate::error::{CapsuleError, CapsuleResult};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

pub type Cleanup = Box<dyn FnOnce() -> CapsuleResult<()> + Send>;

/// Signals that trigger the cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl ShutdownSignal {
    pub fn name(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
        }
    }

    /// Conventional `128 + signo` exit status.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Hangup => 129,
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

struct GuardState {
    cleanup: Mutex<Option<Cleanup>>,
    passthrough: AtomicBool,
}

impl GuardState {
    /// Run the cleanup if nobody has taken it yet. Returns whether it ran.
    fn fire(&self, signal: ShutdownSignal) -> bool {
        let mut slot = match self.cleanup.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(cleanup) = slot.take() else {
            return false;
        };
        eprintln!("\nreceived {}, locking volume...", signal.name());
        match cleanup() {
            Ok(()) => eprintln!("volume locked"),
            Err(err) => {
                warn!("shutdown cleanup failed: {err}");
                eprintln!("warning: failed to lock volume: {err}");
                eprintln!("run `capsule lock` to secure your credentials");
            }
        }
        true
    }

    /// Run `work` while holding the slot so a signal waits for it. With
    /// `release` the cleanup is dropped first and `work` replaces it. Returns
    /// `None` when a signal already took the cleanup.
    fn exclusive<R>(&self, release: bool, work: impl FnOnce() -> R) -> Option<R> {
        let mut slot = match self.cleanup.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.as_ref()?;
        if release {
            slot.take();
        }
        Some(work())
    }

    fn disarm(&self) -> bool {
        let mut slot = match self.cleanup.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take().is_some()
    }
}

/// Armed while a volume is mounted on behalf of the current command.
pub struct ShutdownGuard {
    state: Arc<GuardState>,
    stop_tx: Option<oneshot::Sender<()>>,
    listener: Option<JoinHandle<()>>,
}

impl ShutdownGuard {
    /// Install SIGINT, SIGTERM and SIGHUP handlers. On the first signal the
    /// cleanup runs and the process exits with the signal's status.
    pub fn arm<F>(cleanup: F) -> CapsuleResult<Self>
    where
        F: FnOnce() -> CapsuleResult<()> + Send + 'static,
    {
        let state = Arc::new(GuardState {
            cleanup: Mutex::new(Some(Box::new(cleanup))),
            passthrough: AtomicBool::new(false),
        });

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| CapsuleError::Driver(format!("signal runtime: {err}")))?;
        let (mut sigint, mut sigterm, mut sighup) = {
            let _ctx = runtime.enter();
            (
                signal(SignalKind::interrupt())?,
                signal(SignalKind::terminate())?,
                signal(SignalKind::hangup())?,
            )
        };
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let shared = Arc::clone(&state);
        let listener = thread::Builder::new()
            .name("capsule-guard".into())
            .spawn(move || {
                let listening = Arc::clone(&shared);
                let received = runtime.block_on(async move {
                    loop {
                        let signal = tokio::select! {
                            _ = &mut stop_rx => return None,
                            _ = sigint.recv() => ShutdownSignal::Interrupt,
                            _ = sigterm.recv() => ShutdownSignal::Terminate,
                            _ = sighup.recv() => ShutdownSignal::Hangup,
                        };
                        if signal == ShutdownSignal::Interrupt
                            && listening.passthrough.load(Ordering::SeqCst)
                        {
                            continue;
                        }
                        return Some(signal);
                    }
                });
                if let Some(signal) = received {
                    if shared.fire(signal) {
                        std::process::exit(signal.exit_code());
                    }
                }
            })?;

        info!("shutdown guard armed");
        Ok(Self {
            state,
            stop_tx: Some(stop_tx),
            listener: Some(listener),
        })
    }

    /// A guard with no signal listener. Cleanup only runs through
    /// [`ShutdownGuard::trigger`].
    pub fn manual<F>(cleanup: F) -> Self
    where
        F: FnOnce() -> CapsuleResult<()> + Send + 'static,
    {
        Self {
            state: Arc::new(GuardState {
                cleanup: Mutex::new(Some(Box::new(cleanup))),
                passthrough: AtomicBool::new(false),
            }),
            stop_tx: None,
            listener: None,
        }
    }

    /// While set, SIGINT belongs to the interactive session and is ignored.
    pub fn set_passthrough(&self, enabled: bool) {
        self.state.passthrough.store(enabled, Ordering::SeqCst);
    }

    /// Run the cleanup as if `signal` arrived, without exiting the process.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        if signal == ShutdownSignal::Interrupt && self.state.passthrough.load(Ordering::SeqCst) {
            return false;
        }
        self.state.fire(signal)
    }

    pub fn is_armed(&self) -> bool {
        match self.state.cleanup.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Run `work` with signals held off; the cleanup stays armed afterwards.
    /// `None` means a signal already ran the cleanup.
    pub fn hold<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        self.state.exclusive(false, work)
    }

    /// Run `work` in place of the cleanup, then stop listening. A signal
    /// arriving meanwhile waits and finds nothing left to do.
    pub fn complete_with<R>(mut self, work: impl FnOnce() -> R) -> Option<R> {
        let result = self.state.exclusive(true, work);
        if result.is_some() {
            info!("shutdown guard completed");
        }
        self.shutdown();
        result
    }

    /// Drop the cleanup without running it and stop listening for signals.
    pub fn disarm(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state.disarm() {
            info!("shutdown guard disarmed");
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Real handlers see every signal sent to the test process.
    static ARMED: Mutex<()> = Mutex::new(());

    fn counting_guard() -> (ShutdownGuard, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let guard = ShutdownGuard::manual(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (guard, runs)
    }

    #[test]
    fn two_signals_run_cleanup_once() {
        let (guard, runs) = counting_guard();
        assert!(guard.trigger(ShutdownSignal::Terminate));
        assert!(!guard.trigger(ShutdownSignal::Interrupt));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!guard.is_armed());
    }

    #[test]
    fn signal_after_disarm_is_ignored() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let guard = ShutdownGuard::manual(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let state = Arc::clone(&guard.state);
        guard.disarm();

        assert!(!state.fire(ShutdownSignal::Hangup));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_triggers_fire_once() {
        let (guard, runs) = counting_guard();
        let guard = Arc::new(guard);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                thread::spawn(move || guard.trigger(ShutdownSignal::Terminate))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn passthrough_ignores_interrupt_only() {
        let (guard, runs) = counting_guard();
        guard.set_passthrough(true);
        assert!(!guard.trigger(ShutdownSignal::Interrupt));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(guard.trigger(ShutdownSignal::Hangup));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_cleanup_still_counts_as_fired() {
        let guard = ShutdownGuard::manual(|| Err(CapsuleError::Driver("busy".into())));
        assert!(guard.trigger(ShutdownSignal::Terminate));
        assert!(!guard.trigger(ShutdownSignal::Terminate));
    }

    #[test]
    fn signal_during_completion_waits_and_skips_cleanup() {
        let (guard, runs) = counting_guard();
        let state = Arc::clone(&guard.state);
        let work_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&work_runs);

        let racer = guard.complete_with(|| {
            let racer = thread::spawn(move || state.fire(ShutdownSignal::Terminate));
            thread::sleep(std::time::Duration::from_millis(50));
            counter.fetch_add(1, Ordering::SeqCst);
            racer
        });
        let fired = racer.unwrap().join().unwrap();

        assert!(!fired);
        assert_eq!(work_runs.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_after_signal_does_nothing() {
        let (guard, runs) = counting_guard();
        assert!(guard.trigger(ShutdownSignal::Terminate));
        assert!(guard.complete_with(|| ()).is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hold_keeps_cleanup_armed() {
        let (guard, runs) = counting_guard();
        assert_eq!(guard.hold(|| 7), Some(7));
        assert!(guard.is_armed());
        assert!(guard.trigger(ShutdownSignal::Hangup));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(guard.hold(|| 7).is_none());
    }

    #[test]
    fn armed_listener_ignores_interrupt_in_passthrough() {
        let _serial = ARMED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (_, runs) = counting_guard();
        let counter = Arc::clone(&runs);
        let guard = ShutdownGuard::arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        guard.set_passthrough(true);
        let status = std::process::Command::new("kill")
            .args(["-INT", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        thread::sleep(std::time::Duration::from_millis(200));

        assert!(guard.is_armed());
        guard.disarm();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn armed_guard_disarms_cleanly() {
        let _serial = ARMED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (_, runs) = counting_guard();
        let counter = Arc::clone(&runs);
        let guard = ShutdownGuard::arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert!(guard.is_armed());
        guard.disarm();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
