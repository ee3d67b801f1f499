use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_std::task::{sleep, spawn};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};

use crate::spawner::{Blocker, Spawner};
use crate::{
    AsyncStdInvoker, AsyncStdParallelMap, CancellationSignal, InvokeError, MemoCache,
    ParallelMap,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| femme::with_level(log::LevelFilter::Debug));
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[async_std::test]
async fn invoke_returns_value() {
    init_logging();
    let invoker = AsyncStdInvoker::default();
    let signal = CancellationSignal::new();

    let out = invoker.invoke(async { Ok::<_, String>(7) }, &signal).await;
    assert_eq!(out, Ok(7));

    let out = invoker
        .invoke(async { Err::<u8, _>("bad input".to_string()) }, &signal)
        .await;
    assert_eq!(out, Err(InvokeError::Computation("bad input".to_string())));
    assert!(!signal.is_cancelled());
}

#[async_std::test]
async fn deadline_exceeded_but_computation_finishes() {
    init_logging();
    let invoker = AsyncStdInvoker::default();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();

    let start = Instant::now();
    let out = invoker
        .invoke_with_timeout(
            async move {
                sleep(ms(150)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, ()>("late")
            },
            ms(20),
        )
        .await;
    assert_eq!(out, Err(InvokeError::DeadlineExceeded));
    assert!(start.elapsed() < ms(150));
    assert!(!finished.load(Ordering::SeqCst));

    // Not interrupted: its side effect still lands.
    sleep(ms(300)).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[async_std::test]
async fn cancelled_signal_returns_immediately() {
    init_logging();
    let invoker = AsyncStdInvoker::default();
    let signal = CancellationSignal::new();
    signal.cancel();

    let launched = Arc::new(AtomicUsize::new(0));
    let counter = launched.clone();
    let start = Instant::now();
    let out = invoker
        .invoke(
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(ms(500)).await;
                Ok::<_, ()>(())
            },
            &signal,
        )
        .await;
    assert!(out.unwrap_err().is_deadline_exceeded());
    assert!(start.elapsed() < ms(250));

    sleep(ms(50)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 1);
}

#[async_std::test]
async fn cancel_from_another_task() {
    init_logging();
    let invoker = AsyncStdInvoker::default();
    let signal = CancellationSignal::new();
    let canceller = signal.clone();
    spawn(async move {
        sleep(ms(30)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let out = invoker
        .invoke_func(
            || {
                std::thread::sleep(ms(300));
                Ok::<_, ()>(1)
            },
            &signal,
        )
        .await;
    assert_eq!(out, Err(InvokeError::DeadlineExceeded));
    assert!(start.elapsed() < ms(250));
}

#[async_std::test]
async fn blocking_computation_wins() {
    init_logging();
    let invoker = AsyncStdInvoker::default();
    let out = invoker
        .invoke_func_with_timeout(
            || {
                std::thread::sleep(ms(10));
                Err::<(), _>(io_error())
            },
            ms(500),
        )
        .await;
    let err = out.unwrap_err().into_computation().unwrap();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

fn io_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "missing")
}

#[test]
fn invoke_from_blocking_code() {
    init_logging();
    let invoker = AsyncStdInvoker::default();
    assert_eq!(invoker.invoke_blocking(|| Ok::<_, ()>(3), ms(500)), Ok(3));
    let out = invoker
        .spawner()
        .block_on(invoker.invoke_with_timeout(async { Ok::<_, ()>(4) }, ms(500)));
    assert_eq!(out, Ok(4));
    assert_eq!(
        invoker.invoke_blocking(
            || {
                std::thread::sleep(ms(200));
                Ok::<_, ()>(3)
            },
            ms(10)
        ),
        Err(InvokeError::DeadlineExceeded)
    );
}

#[async_std::test]
async fn cache_single_flight_per_key() {
    init_logging();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = Arc::new(MemoCache::new(move |word: String| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(ms(200)).await;
            Ok::<_, ()>(word.len())
        }
    }));

    let start = Instant::now();
    let mut handles = Vec::new();
    for word in ["hello", "hello", "hello", "world", "hello", "hello"] {
        let cache = cache.clone();
        handles.push(spawn(async move { cache.get(word.to_string()).await }));
    }
    for h in handles {
        assert_eq!(h.await, Ok(5));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // Two keys computed side by side, not one after the other.
    assert!(start.elapsed() < ms(350));
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.get("hello".to_string()).await, Ok(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[async_std::test]
async fn cache_shares_errors_with_waiters() {
    init_logging();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = Arc::new(MemoCache::new(move |key: u32| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(ms(50)).await;
            Err::<u32, _>(format!("key {} failed on call {}", key, call))
        }
    }));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            spawn(async move { cache.get(9).await })
        })
        .collect();
    for h in handles {
        assert_eq!(h.await, Err("key 9 failed on call 0".to_string()));
    }
    assert_eq!(cache.get(9).await, Err("key 9 failed on call 0".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[async_std::test]
async fn parallel_map_unordered() {
    init_logging();
    let mapper = AsyncStdParallelMap::default();
    let source = futures::stream::iter(vec![ms(300), ms(100), ms(200)]);

    let start = Instant::now();
    let mut stream = mapper.map(source, |d| async move {
        sleep(d).await;
        d
    });
    let mut out = Vec::new();
    while let Some(d) = stream.next().await {
        out.push(d);
    }
    let elapsed = start.elapsed();

    // Completion order, not input order.
    assert_eq!(out, vec![ms(100), ms(200), ms(300)]);
    assert_eq!(stream.produced(), 3);
    assert!(stream.is_done());
    assert!(elapsed >= ms(300));
    assert!(elapsed < ms(550));
}

#[async_std::test]
async fn parallel_map_empty_source() {
    init_logging();
    let mapper = AsyncStdParallelMap::default();
    let mut stream = mapper.map(futures::stream::empty::<u8>(), |x| async move { x });
    assert_eq!(stream.next().await, None);
    assert_eq!(stream.produced(), 0);
    // Fused: keeps reporting exhaustion.
    assert_eq!(stream.next().await, None);
}

#[async_std::test]
async fn parallel_map_each_element_once() {
    init_logging();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mapper = AsyncStdParallelMap::default();
    let out: Vec<u64> = mapper
        .map(futures::stream::iter(0..100u64), move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { x * x }
        })
        .collect()
        .await;

    let mut out = out;
    out.sort_unstable();
    let expected: Vec<u64> = (0..100u64).map(|x| x * x).collect();
    assert_eq!(out, expected);
    assert_eq!(calls.load(Ordering::SeqCst), 100);
}

#[async_std::test]
async fn parallel_map_blocking_fans_out() {
    init_logging();
    let mapper = AsyncStdParallelMap::default();
    let start = Instant::now();
    let out: HashSet<usize> = mapper
        .map_blocking(futures::stream::iter(0..16usize), |x| {
            std::thread::sleep(ms(200));
            x
        })
        .collect()
        .await;
    assert_eq!(out, (0..16).collect::<HashSet<_>>());
    assert!(start.elapsed() < ms(800));
}

#[async_std::test]
async fn parallel_map_stages_chain() {
    init_logging();
    let mapper = AsyncStdParallelMap::default();
    let first = mapper.map(futures::stream::iter(1..=5u32), |x| async move { x + 1 });
    let second = mapper.map_blocking(first, |x| x * 10);
    let out: HashSet<u32> = second.collect().await;
    assert_eq!(out, [20, 30, 40, 50, 60].into_iter().collect::<HashSet<_>>());
}

#[test]
fn parallel_stream_from_blocking_code() {
    init_logging();
    let mapper = AsyncStdParallelMap::default();
    let stream = mapper.map_blocking(futures::stream::iter(vec!["a", "bb", "ccc"]), str::len);
    let mut out: Vec<usize> = stream.into_blocking_iter(*mapper.spawner()).collect();
    out.sort_unstable();
    assert_eq!(out, vec![1, 2, 3]);
}

/// Spawns on async-std and counts the join handles it hands
/// out as they get dropped.
#[derive(Clone, Default)]
struct CountingSpawner {
    released: Arc<AtomicUsize>,
}

struct CountedHandle<T> {
    inner: BoxFuture<'static, T>,
    released: Arc<AtomicUsize>,
}

impl<T> Future for CountedHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<T> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> Drop for CountedHandle<T> {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T: Send + 'static> Spawner<T> for CountingSpawner {
    type FutureOutput = T;
    type SpawnHandle = CountedHandle<T>;

    fn spawn<F: Future<Output = T> + Send + 'static>(&self, f: F) -> Self::SpawnHandle {
        CountedHandle {
            inner: spawn(f).boxed(),
            released: self.released.clone(),
        }
    }
}

#[async_std::test]
async fn parallel_map_reaps_workers_of_endless_source() {
    init_logging();
    let spawner = CountingSpawner::default();
    let mapper = ParallelMap::new(spawner.clone());
    let source = futures::stream::iter(0..5u32).chain(futures::stream::pending());
    let mut stream = mapper.map(source, |x| async move { x * 2 });

    let mut out = Vec::new();
    for _ in 0..5 {
        out.push(stream.next().await.unwrap());
    }
    out.sort_unstable();
    assert_eq!(out, vec![0, 2, 4, 6, 8]);

    sleep(ms(200)).await;
    // The coordinator's handle, dropped on spawn, plus all
    // five finished workers, while the source is still open.
    assert_eq!(spawner.released.load(Ordering::SeqCst), 6);
    assert!(!stream.is_done());
}

#[cfg(feature = "use-tokio")]
mod tokio_runtime {
    use super::*;
    use crate::{TokioInvoker, TokioParallelMap};

    #[tokio::test(flavor = "multi_thread")]
    async fn invoke_with_timeout() {
        init_logging();
        let invoker = TokioInvoker::default();
        let out = invoker
            .invoke_with_timeout(
                async {
                    tokio::time::sleep(ms(200)).await;
                    Ok::<_, ()>(1)
                },
                ms(20),
            )
            .await;
        assert_eq!(out, Err(InvokeError::DeadlineExceeded));

        let out = invoker
            .invoke_with_timeout(async { Ok::<_, ()>(2) }, ms(500))
            .await;
        assert_eq!(out, Ok(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_computation_aborts() {
        init_logging();
        let invoker = TokioInvoker::default();
        let out = invoker
            .invoke_func_with_timeout(
                || -> Result<(), ()> { panic!("computation blew up") },
                ms(500),
            )
            .await;
        assert_eq!(out, Err(InvokeError::Aborted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_map_on_tokio() {
        init_logging();
        let mapper = TokioParallelMap::default();
        let start = Instant::now();
        let out: HashSet<u64> = mapper
            .map(futures::stream::iter(vec![30u64, 10, 20]), |d| async move {
                tokio::time::sleep(ms(d * 10)).await;
                d
            })
            .collect()
            .await;
        assert_eq!(out, [10, 20, 30].into_iter().collect::<HashSet<_>>());
        assert!(start.elapsed() < ms(550));
    }

    #[test]
    fn owned_runtime_outlives_dropped_mapper() {
        init_logging();
        let mapper = TokioParallelMap::default();
        let blocker = mapper.spawner().clone();
        let stream = mapper.map(futures::stream::iter(1..=3u32), |x| async move {
            tokio::time::sleep(ms(50)).await;
            x
        });
        drop(mapper);

        let mut out: Vec<u32> = stream.into_blocking_iter(blocker).collect();
        out.sort_unstable();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn owned_runtime_shared_by_invoker_clones() {
        init_logging();
        let invoker = TokioInvoker::default();
        let clone = invoker.clone();
        drop(invoker);

        let out = clone.invoke_blocking(
            || {
                std::thread::sleep(ms(20));
                Ok::<_, ()>(1)
            },
            ms(500),
        );
        assert_eq!(out, Ok(1));
    }
}
