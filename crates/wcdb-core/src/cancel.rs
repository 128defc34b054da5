//! Cooperative cancellation.
//!
//! A `CancellationSignal` is a flag plus at most one listener. Long-running
//! operations poll it between steps; a handle attaches a listener that
//! interrupts the native connection so a blocked step returns early.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct State {
    canceled: bool,
    cancel_in_progress: bool,
    listener: Option<Listener>,
    remote: Option<CancellationTransport>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// A cancellation token shared between the canceller and the operation.
///
/// Clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

/// Forwards cancellation to a signal that may not be attached to an
/// operation yet.
#[derive(Clone)]
pub struct CancellationTransport {
    signal: CancellationSignal,
}

impl CancellationTransport {
    /// Cancel the signal behind this transport.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.signal.is_canceled()
    }
}

impl fmt::Debug for CancellationTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTransport")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no `cancel()` is running its callbacks.
    fn wait_for_cancel_finished<'a>(&'a self, mut state: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        while state.cancel_in_progress {
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    /// Return `Err(Error::Cancelled)` once the signal has fired.
    pub fn throw_if_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Fire the signal.
    ///
    /// The listener and the remote transport run outside the lock, exactly
    /// once. Later calls are no-ops.
    pub fn cancel(&self) {
        let (listener, remote) = {
            let mut state = self.lock();
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.cancel_in_progress = true;
            (state.listener.clone(), state.remote.clone())
        };
        tracing::debug!(
            listener = listener.is_some(),
            remote = remote.is_some(),
            "cancellation signal fired"
        );

        if let Some(listener) = listener {
            listener();
        }
        if let Some(remote) = remote {
            remote.cancel();
        }

        let mut state = self.lock();
        state.cancel_in_progress = false;
        self.inner.done.notify_all();
    }

    /// Install or clear the listener.
    ///
    /// Blocks while a concurrent `cancel()` is running callbacks. When the
    /// signal has already fired, the new listener is invoked before this
    /// returns.
    pub fn set_on_cancel_listener<F>(&self, listener: Option<F>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: Option<Listener> = listener.map(|f| Arc::new(f) as Listener);
        let fire = {
            let state = self.lock();
            let mut state = self.wait_for_cancel_finished(state);
            state.listener = listener.clone();
            if state.canceled { listener } else { None }
        };
        if let Some(listener) = fire {
            listener();
        }
    }

    /// Remove the listener, waiting for any in-flight invocation.
    pub fn clear_on_cancel_listener(&self) {
        let state = self.lock();
        let mut state = self.wait_for_cancel_finished(state);
        state.listener = None;
    }

    /// Forward this signal's cancellation to `remote`.
    ///
    /// A signal that already fired cancels the remote immediately.
    pub fn set_remote(&self, remote: Option<CancellationTransport>) {
        let fire = {
            let state = self.lock();
            let mut state = self.wait_for_cancel_finished(state);
            state.remote = remote.clone();
            if state.canceled { remote } else { None }
        };
        if let Some(remote) = fire {
            remote.cancel();
        }
    }

    /// Create a transport backed by a fresh signal.
    pub fn create_transport() -> CancellationTransport {
        CancellationTransport {
            signal: CancellationSignal::new(),
        }
    }

    /// Recover the signal behind a transport created by `create_transport`.
    pub fn from_transport(transport: &CancellationTransport) -> CancellationSignal {
        transport.signal.clone()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancel_fires_listener_once() {
        let signal = CancellationSignal::new();
        let (count, listener) = counter();
        signal.set_on_cancel_listener(Some(listener));
        signal.cancel();
        signal.cancel();
        assert!(signal.is_canceled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(signal.throw_if_canceled(), Err(Error::Cancelled)));
    }

    #[test]
    fn listener_after_cancel_fires_immediately() {
        let signal = CancellationSignal::new();
        signal.cancel();
        let (count, listener) = counter();
        signal.set_on_cancel_listener(Some(listener));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleared_listener_not_invoked() {
        let signal = CancellationSignal::new();
        let (count, listener) = counter();
        signal.set_on_cancel_listener(Some(listener));
        signal.clear_on_cancel_listener();
        signal.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transport_cancels_attached_signal() {
        let transport = CancellationSignal::create_transport();
        let remote_side = CancellationSignal::from_transport(&transport);
        let local = CancellationSignal::new();
        local.set_remote(Some(transport.clone()));
        assert!(!remote_side.is_canceled());
        local.cancel();
        assert!(remote_side.is_canceled());
        assert!(transport.is_canceled());
    }

    #[test]
    fn remote_set_after_cancel_is_canceled() {
        let local = CancellationSignal::new();
        local.cancel();
        let transport = CancellationSignal::create_transport();
        local.set_remote(Some(transport.clone()));
        assert!(transport.is_canceled());
    }

    #[test]
    fn concurrent_register_and_cancel_invokes_once() {
        for _ in 0..200 {
            let signal = CancellationSignal::new();
            let (count, listener) = counter();
            let s1 = signal.clone();
            let s2 = signal.clone();
            let registrar = thread::spawn(move || s1.set_on_cancel_listener(Some(listener)));
            let canceller = thread::spawn(move || s2.cancel());
            registrar.join().unwrap();
            canceller.join().unwrap();
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
