use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use slab::Slab;

/// A one-shot broadcast event. Once fired it stays fired,
/// and every waiter (registered before or after the firing)
/// observes it exactly once.
#[derive(Default)]
pub struct Signal {
    fired: AtomicBool,
    read_wakers: Mutex<Slab<Waker>>,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            fired: AtomicBool::new(false),
            read_wakers: Mutex::new(Slab::new()),
        }
    }

    /// Fire the signal and wake everything waiting on it.
    /// Returns `false` if it had already been fired.
    pub fn fire(&self) -> bool {
        let mut list = self.read_wakers.lock();
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        // No waiter can register any more: they check the
        // flag under the same lock.
        for w in list.drain() {
            w.wake();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// A future resolving once the signal has fired.
    pub fn wait(&self) -> Wait<'_> {
        Wait { signal: self, key: None }
    }

    fn poll_wait(&self, key: &mut Option<usize>, cx: &mut Context) -> Poll<()> {
        if self.is_fired() {
            // `fire` drained the slab, so any key we held is stale.
            *key = None;
            return Poll::Ready(());
        }

        let mut map = self.read_wakers.lock();
        if self.fired.load(Ordering::Acquire) {
            *key = None;
            return Poll::Ready(());
        }
        match key {
            Some(id) => match map.get_mut(*id) {
                Some(slot) => {
                    if !slot.will_wake(cx.waker()) {
                        *slot = cx.waker().clone();
                    }
                }
                // If we have a key, it must be valid.
                None => unreachable!("waiter key outlived its registration"),
            },
            None => *key = Some(map.insert(cx.waker().clone())),
        }
        Poll::Pending
    }

    fn deregister(&self, key: usize) {
        let mut map = self.read_wakers.lock();
        if !self.fired.load(Ordering::Acquire) {
            map.try_remove(key);
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("fired", &self.is_fired()).finish()
    }
}

/// Future returned by [`Signal::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct Wait<'a> {
    signal: &'a Signal,
    key: Option<usize>,
}

impl<'a> Future for Wait<'a> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = &mut *self;
        this.signal.poll_wait(&mut this.key, cx)
    }
}

impl<'a> Drop for Wait<'a> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.signal.deregister(key);
        }
    }
}

/// A cloneable handle to a shared [`Signal`], used to tell
/// an invocation to stop waiting. Cancelling never reaches
/// the computation itself.
#[derive(Clone, Default, Debug)]
pub struct CancellationSignal(Arc<Signal>);

impl CancellationSignal {
    pub fn new() -> Self {
        CancellationSignal(Arc::new(Signal::new()))
    }

    /// Trigger cancellation. Returns `false` if it was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        self.0.fire()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_fired()
    }

    pub fn cancelled(&self) -> Wait<'_> {
        self.0.wait()
    }
}
