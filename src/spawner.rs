//! Runtime glue for the invoker and the parallel mapper. Every task this
//! crate starts goes through one of these traits, so the same primitives run
//! unchanged on async-std or tokio.
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Future;

/// Spawns a detached `'static` future. Dropping the returned handle must not
/// cancel the task.
pub trait Spawner<T> {
    type FutureOutput;
    type SpawnHandle: Future<Output = Self::FutureOutput> + Send + 'static;
    fn spawn<F: Future<Output = T> + Send + 'static>(&self, f: F) -> Self::SpawnHandle;
}

/// Runs a blocking closure on a thread of its own (or one borrowed from the
/// runtime's blocking pool).
pub trait FuncSpawner<T> {
    type FutureOutput;
    type SpawnHandle: Future<Output = Self::FutureOutput> + Send + 'static;
    fn spawn_func<F: FnOnce() -> T + Send + 'static>(&self, f: F) -> Self::SpawnHandle;
}

pub trait Blocker {
    fn block_on<T, F: Future<Output = T>>(&self, f: F) -> T;
}

pub trait Timer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[cfg(feature = "use-async-std")]
pub mod use_async_std {
    use super::*;
    use async_std::task::{block_on, sleep, spawn, spawn_blocking, JoinHandle};
    use futures::FutureExt;

    #[derive(Default, Clone, Copy, Debug)]
    pub struct AsyncStdSpawner;

    impl<T: Send + 'static> Spawner<T> for AsyncStdSpawner {
        type FutureOutput = T;
        type SpawnHandle = JoinHandle<T>;

        fn spawn<F: Future<Output = T> + Send + 'static>(&self, f: F) -> Self::SpawnHandle {
            spawn(f)
        }
    }
    impl<T: Send + 'static> FuncSpawner<T> for AsyncStdSpawner {
        type FutureOutput = T;
        type SpawnHandle = JoinHandle<T>;

        fn spawn_func<F: FnOnce() -> T + Send + 'static>(&self, f: F) -> Self::SpawnHandle {
            spawn_blocking(f)
        }
    }
    impl Blocker for AsyncStdSpawner {
        fn block_on<T, F: Future<Output = T>>(&self, f: F) -> T {
            block_on(f)
        }
    }
    impl Timer for AsyncStdSpawner {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            sleep(duration).boxed()
        }
    }
}

#[cfg(feature = "use-tokio")]
pub mod use_tokio {
    use super::*;
    use std::sync::Arc;
    use tokio::{
        runtime::{Handle, Runtime},
        task::{self as tokio_task, block_in_place},
    };

    pub struct TokioSpawner(Option<TokioRuntime>);

    impl Clone for TokioSpawner {
        fn clone(&self) -> Self {
            Self(self.0.as_ref().map(|rt| match rt {
                TokioRuntime::ByHandle(handle) => TokioRuntime::ByHandle(handle.clone()),
                TokioRuntime::Owned(runtime) => TokioRuntime::Owned(runtime.clone()),
            }))
        }
    }

    const RUNTIME_INVARIANT_ERR: &str =
        "invariant: runtime must be available during the spawner's lifetime";

    impl Drop for TokioSpawner {
        /// Shut the owned runtime down once the last clone is gone.
        fn drop(&mut self) {
            if let Some(TokioRuntime::Owned(rt)) = self.0.take() {
                if let Some(rt) = Arc::into_inner(rt) {
                    rt.shutdown_background()
                }
            }
        }
    }

    impl TokioSpawner {
        pub fn new(rt_handle: Handle) -> Self {
            Self(Some(TokioRuntime::ByHandle(rt_handle)))
        }

        /// Build a spawner that owns a fresh multi-threaded runtime. Clones
        /// share it; it is shut down in the background once the last clone
        /// is dropped.
        pub fn owned() -> std::io::Result<Self> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            Ok(Self(Some(TokioRuntime::Owned(Arc::new(runtime)))))
        }

        fn handle(&self) -> &Handle {
            match &self.0.as_ref().expect(RUNTIME_INVARIANT_ERR) {
                TokioRuntime::ByHandle(handle) => handle,
                TokioRuntime::Owned(runtime) => runtime.handle(),
            }
        }
    }

    impl std::fmt::Debug for TokioSpawner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let kind = match self.0 {
                Some(TokioRuntime::ByHandle(_)) => "handle",
                Some(TokioRuntime::Owned(_)) => "owned",
                None => "gone",
            };
            f.debug_tuple("TokioSpawner").field(&kind).finish()
        }
    }

    /// Variants of supplied tokio runtime.
    /// Is needed because runtime can be either passed or created.
    enum TokioRuntime {
        /// User provides its own runtime, we'll refer to it by handle.
        ByHandle(Handle),
        /// We've created our own ad-hoc runtime, shared by all clones.
        Owned(Arc<Runtime>),
    }

    // By default, `TokioSpawner` operates on globally available runtime.
    // Ad-hoc runtime would only be created if it is not available globally.
    // Newly created runtime would be destroyed when its last clone is gone.
    impl Default for TokioSpawner {
        fn default() -> Self {
            if let Ok(handle) = Handle::try_current() {
                return Self::new(handle);
            }
            Self::owned().expect("failed to build an ad-hoc tokio runtime")
        }
    }

    impl<T: Send + 'static> Spawner<T> for TokioSpawner {
        type FutureOutput = Result<T, tokio_task::JoinError>;
        type SpawnHandle = tokio_task::JoinHandle<T>;

        fn spawn<F: Future<Output = T> + Send + 'static>(&self, f: F) -> Self::SpawnHandle {
            self.handle().spawn(f)
        }
    }

    impl<T: Send + 'static> FuncSpawner<T> for TokioSpawner {
        type FutureOutput = Result<T, tokio_task::JoinError>;
        type SpawnHandle = tokio_task::JoinHandle<T>;

        fn spawn_func<F: FnOnce() -> T + Send + 'static>(&self, f: F) -> Self::SpawnHandle {
            self.handle().spawn_blocking(f)
        }
    }

    impl Blocker for TokioSpawner {
        fn block_on<T, F: Future<Output = T>>(&self, f: F) -> T {
            block_in_place(|| match self.0.as_ref().expect(RUNTIME_INVARIANT_ERR) {
                TokioRuntime::ByHandle(handle) => handle.block_on(f),
                // if runtime is owned, `block_on` must be called directly on it,
                // not via it's handle. Otherwise, future won't be able to run IO-tasks.
                TokioRuntime::Owned(runtime) => runtime.block_on(f),
            })
        }
    }

    impl Timer for TokioSpawner {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            // The timer binds to the runtime at construction, so enter it first.
            let _guard = self.handle().enter();
            Box::pin(tokio::time::sleep(duration))
        }
    }
}
