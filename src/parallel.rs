//! Unordered parallel mapping over a [`Stream`].
//!
//! A single coordinator task pulls the source one element
//! at a time and hands every element to a worker of its own.
//! Workers publish into a shared channel as soon as they are
//! done, so the output order follows completion, not input.
//! Once the source is exhausted the coordinator joins every
//! worker and only then closes the output.
//!
//! ## Caveats
//!
//! Fan-out is unbounded: a source with a million elements
//! gets a million workers. Results are buffered without
//! bound too; a consumer that holds on to the
//! [`ParallelStream`] without draining it lets them pile up.
//! Dropping the stream discards whatever is published
//! afterwards, but never stops a running worker.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::stream::{FusedStream, FuturesUnordered};
use futures::{Future, Stream, StreamExt};
use pin_project::pin_project;

use crate::spawner::{Blocker, FuncSpawner, Spawner};

/// Spawns the coordinator and workers of a parallel map on
/// `Sp`.
#[derive(Clone, Debug, Default)]
pub struct ParallelMap<Sp> {
    spawner: Sp,
}

impl<Sp> ParallelMap<Sp> {
    pub fn new(spawner: Sp) -> Self {
        ParallelMap { spawner }
    }

    pub fn spawner(&self) -> &Sp {
        &self.spawner
    }
}

impl<Sp> ParallelMap<Sp>
where
    Sp: Spawner<()> + Clone + Send + Sync + 'static,
{
    /// Apply the async `map_fn` to every element of `source`,
    /// each on its own task.
    pub fn map<S, F, Fut, U>(&self, source: S, map_fn: F) -> ParallelStream<U>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        F: Fn(S::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
        U: Send + 'static,
    {
        let map_fn = Arc::new(map_fn);
        let spawner = self.spawner.clone();
        self.coordinate(source, move |item, tx| {
            let map_fn = map_fn.clone();
            spawner.spawn(async move {
                publish(&tx, (*map_fn)(item).await);
            })
        })
    }

    /// Spawn the coordinator. `dispatch` starts the worker for
    /// one element and returns its join handle; it is the only
    /// place that decides how workers are scheduled.
    fn coordinate<S, U, D, H>(&self, source: S, mut dispatch: D) -> ParallelStream<U>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        U: Send + 'static,
        D: FnMut(S::Item, mpsc::UnboundedSender<U>) -> H + Send + 'static,
        H: Future + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded();
        let _coordinator = self.spawner.spawn(async move {
            let source = source.fuse();
            futures::pin_mut!(source);
            let mut workers = FuturesUnordered::new();
            let mut pulled = 0usize;

            // Reap finished workers while pulling, so an endless
            // source does not accumulate join handles. An empty
            // worker set reports itself terminated and is skipped.
            loop {
                futures::select! {
                    item = source.next() => match item {
                        Some(item) => {
                            pulled += 1;
                            log::trace!("dispatching element #{}", pulled);
                            workers.push(dispatch(item, tx.clone()));
                        }
                        None => break,
                    },
                    _ = workers.select_next_some() => {}
                }
            }

            while workers.next().await.is_some() {}
            log::trace!("joined {} workers; closing output", pulled);
            drop(tx);
        });
        ParallelStream::new(rx)
    }
}

impl<Sp> ParallelMap<Sp>
where
    Sp: Spawner<()> + FuncSpawner<()> + Clone + Send + Sync + 'static,
{
    /// Apply the blocking `map_fn` to every element of
    /// `source`, each on a blocking thread of its own.
    pub fn map_blocking<S, F, U>(&self, source: S, map_fn: F) -> ParallelStream<U>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        F: Fn(S::Item) -> U + Send + Sync + 'static,
        U: Send + 'static,
    {
        let map_fn = Arc::new(map_fn);
        let spawner = self.spawner.clone();
        self.coordinate(source, move |item, tx| {
            let map_fn = map_fn.clone();
            spawner.spawn_func(move || publish(&tx, (*map_fn)(item)))
        })
    }
}

fn publish<U>(tx: &mpsc::UnboundedSender<U>, out: U) {
    if tx.unbounded_send(out).is_err() {
        log::debug!("output stream dropped; discarding result");
    }
}

/// The output of a [`ParallelMap`]. Yields results in
/// completion order and ends once every worker has finished.
#[pin_project]
#[must_use = "streams do nothing unless polled"]
pub struct ParallelStream<U> {
    #[pin]
    rx: mpsc::UnboundedReceiver<U>,
    produced: usize,
    done: bool,
}

impl<U> ParallelStream<U> {
    fn new(rx: mpsc::UnboundedReceiver<U>) -> Self {
        ParallelStream {
            rx,
            produced: 0,
            done: false,
        }
    }

    /// Number of results yielded so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume the stream from blocking code, parking the
    /// current thread on `blocker` between results.
    pub fn into_blocking_iter<B: Blocker>(self, blocker: B) -> BlockingIter<U, B> {
        BlockingIter {
            stream: self,
            blocker,
        }
    }
}

impl<U> Stream for ParallelStream<U> {
    type Item = U;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        let poll = this.rx.poll_next(cx);
        match &poll {
            Poll::Ready(Some(_)) => *this.produced += 1,
            Poll::Ready(None) => *this.done = true,
            Poll::Pending => {}
        }
        poll
    }
}

impl<U> FusedStream for ParallelStream<U> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<U> std::fmt::Debug for ParallelStream<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStream")
            .field("produced", &self.produced)
            .field("done", &self.done)
            .finish()
    }
}

/// Blocking iterator over a [`ParallelStream`].
pub struct BlockingIter<U, B> {
    stream: ParallelStream<U>,
    blocker: B,
}

impl<U, B: Blocker> Iterator for BlockingIter<U, B> {
    type Item = U;

    fn next(&mut self) -> Option<U> {
        let stream = &mut self.stream;
        self.blocker.block_on(stream.next())
    }
}
