//! Timeout-bounded invocation of a fallible computation.
//!
//! The computation is spawned as a detached task and raced
//! against a [`CancellationSignal`] (or a timer). Whichever
//! resolves first decides what the caller sees.
//!
//! ## Resource caveat
//!
//! Cancellation is _not_ cooperative. A computation that has
//! started always runs to completion, even after the caller
//! received [`InvokeError::DeadlineExceeded`]; its result is
//! then dropped. A computation that never returns therefore
//! leaks its task (or blocking thread) for good.
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{select, Either};
use futures::Future;

use crate::error::InvokeError;
use crate::signal::CancellationSignal;
use crate::spawner::{Blocker, FuncSpawner, Spawner, Timer};

/// Races computations against cancellation. Holds no state
/// besides the spawner; each call gets its own completion
/// channel.
#[derive(Clone, Debug, Default)]
pub struct TimedInvoker<Sp> {
    spawner: Sp,
}

impl<Sp> TimedInvoker<Sp> {
    pub fn new(spawner: Sp) -> Self {
        TimedInvoker { spawner }
    }

    pub fn spawner(&self) -> &Sp {
        &self.spawner
    }
}

impl<Sp: Spawner<()>> TimedInvoker<Sp> {
    /// Run `computation` and wait for it, or for `signal`,
    /// whichever comes first. An already cancelled signal
    /// returns `DeadlineExceeded` immediately, although the
    /// computation is still launched.
    pub async fn invoke<T, E, F>(
        &self,
        computation: F,
        signal: &CancellationSignal,
    ) -> Result<T, InvokeError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let completion = self.launch(computation);
        race(completion, signal.cancelled()).await
    }

    fn launch<T, E, F>(&self, computation: F) -> oneshot::Receiver<Result<T, E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        log::trace!("launching computation");
        let _detached = self.spawner.spawn(async move {
            publish(tx, computation.await);
        });
        rx
    }
}

impl<Sp: Spawner<()> + Timer> TimedInvoker<Sp> {
    /// Same as [`invoke`](Self::invoke) with a signal firing
    /// once `timeout` has elapsed.
    pub async fn invoke_with_timeout<T, E, F>(
        &self,
        computation: F,
        timeout: Duration,
    ) -> Result<T, InvokeError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let completion = self.launch(computation);
        race(completion, self.spawner.sleep(timeout)).await
    }
}

impl<Sp: FuncSpawner<()>> TimedInvoker<Sp> {
    /// Like [`invoke`](Self::invoke), but the computation is a
    /// blocking closure run on a thread of its own.
    pub async fn invoke_func<T, E, F>(
        &self,
        computation: F,
        signal: &CancellationSignal,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let completion = self.launch_func(computation);
        race(completion, signal.cancelled()).await
    }

    fn launch_func<T, E, F>(&self, computation: F) -> oneshot::Receiver<Result<T, E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        log::trace!("launching blocking computation");
        let _detached = self.spawner.spawn_func(move || publish(tx, computation()));
        rx
    }
}

impl<Sp: FuncSpawner<()> + Timer> TimedInvoker<Sp> {
    pub async fn invoke_func_with_timeout<T, E, F>(
        &self,
        computation: F,
        timeout: Duration,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let completion = self.launch_func(computation);
        race(completion, self.spawner.sleep(timeout)).await
    }
}

impl<Sp: FuncSpawner<()> + Timer + Blocker> TimedInvoker<Sp> {
    /// Blocks the current thread on
    /// [`invoke_func_with_timeout`](Self::invoke_func_with_timeout).
    /// Meant for callers outside of any async context.
    pub fn invoke_blocking<T, E, F>(
        &self,
        computation: F,
        timeout: Duration,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.spawner
            .block_on(self.invoke_func_with_timeout(computation, timeout))
    }
}

fn publish<T>(tx: oneshot::Sender<T>, out: T) {
    if tx.send(out).is_err() {
        log::debug!("caller stopped waiting; discarding late result");
    }
}

/// Resolve to the computation's result unless `cancelled`
/// gets there first. Ties go to the cancellation.
async fn race<T, E, C>(
    completion: oneshot::Receiver<Result<T, E>>,
    cancelled: C,
) -> Result<T, InvokeError<E>>
where
    C: Future<Output = ()> + Unpin,
{
    match select(cancelled, completion).await {
        Either::Left(((), _)) => {
            log::debug!("deadline exceeded before the computation finished");
            Err(InvokeError::DeadlineExceeded)
        }
        Either::Right((Ok(Ok(value)), _)) => Ok(value),
        Either::Right((Ok(Err(e)), _)) => Err(InvokeError::Computation(e)),
        Either::Right((Err(oneshot::Canceled), _)) => {
            log::debug!("computation dropped its result channel");
            Err(InvokeError::Aborted)
        }
    }
}
