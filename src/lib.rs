//! Small coordination primitives for async code running on
//! the [async-std][async_std] or [tokio][tokio] executors:
//!
//! - [`TimedInvoker`] runs a fallible computation and gives
//!   up waiting when a [`CancellationSignal`] fires or a
//!   timeout elapses.
//! - [`MemoCache`] memoizes a computation per key, running it
//!   at most once no matter how many callers ask at the same
//!   time ("single-flight").
//! - [`ParallelMap`] maps a [`Stream`][Stream] with one worker
//!   per element and yields results in completion order.
//!
//! ## Motivation
//!
//! Each of these is a few lines of channel juggling when
//! written inline, and each has one race that is easy to get
//! wrong: completion versus cancellation, two callers both
//! deciding they are the first, or closing an output before
//! the last worker has published. This crate gets the race
//! right once.
//!
//! ## Usage
//!
//! ``` rust
//! use std::time::Duration;
//! use async_flight::{AsyncStdInvoker, InvokeError, MemoCache};
//!
//! #[async_std::main]
//! async fn main() {
//!     let invoker = AsyncStdInvoker::default();
//!     let slow = invoker.invoke_with_timeout(async {
//!         async_std::task::sleep(Duration::from_millis(200)).await;
//!         Ok::<_, ()>(42)
//!     }, Duration::from_millis(10)).await;
//!     assert_eq!(slow, Err(InvokeError::DeadlineExceeded));
//!
//!     let lengths = MemoCache::new(|word: String| async move {
//!         Ok::<_, ()>(word.len())
//!     });
//!     assert_eq!(lengths.get("hello".into()).await, Ok(5));
//! }
//! ```
//!
//! Streams are mapped through a [`ParallelMap`] bound to a
//! spawner:
//!
//! ``` rust
//! use async_flight::AsyncStdParallelMap;
//! use futures::StreamExt;
//!
//! #[async_std::main]
//! async fn main() {
//!     let mapper = AsyncStdParallelMap::default();
//!     let source = futures::stream::iter(1..=4);
//!     let mut out: Vec<i32> = mapper
//!         .map(source, |x| async move { x * 2 })
//!         .collect()
//!         .await;
//!     out.sort();
//!     assert_eq!(out, vec![2, 4, 6, 8]);
//! }
//! ```
//!
//! ## Runtimes
//!
//! Spawning goes through the traits in [`spawner`]. The
//! `use-async-std` feature (on by default) provides
//! [`AsyncStdSpawner`]; `use-tokio` provides
//! [`TokioSpawner`], which attaches to the current runtime
//! or, outside of one, owns an ad-hoc runtime for its
//! lifetime.
//!
//! ## Limitations
//!
//! Nothing here cancels a computation that has started.
//! [`TimedInvoker`] only stops _waiting_; the computation runs
//! on and its result is dropped. [`MemoCache`] never evicts
//! and never retries a cached error. [`ParallelMap`] does not
//! bound its fan-out. These are deliberate: see the module
//! docs of [`invoker`], [`memo`] and [`parallel`] for what
//! they cost.
//!
//! [Stream]: futures::Stream
#[macro_use]
mod utils;

pub mod error;
pub mod invoker;
pub mod memo;
pub mod parallel;
pub mod signal;
pub mod spawner;

pub use error::InvokeError;
pub use invoker::TimedInvoker;
pub use memo::MemoCache;
pub use parallel::{BlockingIter, ParallelMap, ParallelStream};
pub use signal::{CancellationSignal, Signal};

cfg_async_std! {
    pub use spawner::use_async_std::AsyncStdSpawner;
    pub type AsyncStdInvoker = TimedInvoker<AsyncStdSpawner>;
    pub type AsyncStdParallelMap = ParallelMap<AsyncStdSpawner>;
}

cfg_tokio! {
    pub use spawner::use_tokio::TokioSpawner;
    pub type TokioInvoker = TimedInvoker<TokioSpawner>;
    pub type TokioParallelMap = ParallelMap<TokioSpawner>;
}

#[cfg(all(test, feature = "use-async-std"))]
mod tests;
