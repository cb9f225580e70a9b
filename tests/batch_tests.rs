//! These tests cover how loaders collect keys into batch calls, and how the
//! results of those calls are distributed back to each request.

use batchloader::{AwaitError, BatchResult, LoadError, Loader, LoaderOptions, Scheduler};
use futures::future::{self, Ready};
use futures_timer::Delay;
use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

mod common;

use common::{recording, Calls};

async fn identity(keys: Vec<u32>) -> BatchResult<u32, String> {
    Ok(keys.into_iter().map(Ok).collect())
}

/// Odd keys succeed; even keys fail individually.
fn odd_only(keys: Vec<u32>) -> Ready<BatchResult<u32, String>> {
    future::ready(Ok(keys
        .into_iter()
        .map(|key| match key % 2 {
            1 => Ok(key),
            _ => Err(format!("{} is even", key)),
        })
        .collect()))
}

/// A future that returns pending the first N times it is polled, waking
/// itself each time, then returns Ready.
#[derive(Debug, Clone)]
struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

#[test]
fn simple_test() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let loader = Loader::new(&scheduler, recording(&calls, identity));

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);

    assert_eq!(loader.pending_len(), 2);
    assert!(scheduler.has_pending());

    let (res1, res2) = scheduler
        .block_on(async move { (fut1.await, fut2.await) })
        .unwrap();

    assert_eq!(res1, Ok(1));
    assert_eq!(res2, Ok(2));
    assert_eq!(*calls.borrow(), vec![vec![1, 2]]);
    assert_eq!(loader.pending_len(), 0);
}

#[test]
fn low_key_test() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let loader = Loader::with_options(
        &scheduler,
        LoaderOptions::default().with_max_batch_size(2),
        recording(&calls, identity),
    );

    let values = scheduler.wait(loader.load_many(vec![1, 2, 3])).unwrap();

    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(*calls.borrow(), vec![vec![1, 2], vec![3]]);
}

#[test]
fn test_duplicate_keys() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let loader = Loader::new(&scheduler, recording(&calls, identity));

    let fut1 = loader.load(10);
    let fut2 = loader.load(10);
    let fut3 = loader.load(20);

    assert!(fut1.ptr_eq(&fut2));
    assert!(!fut1.ptr_eq(&fut3));

    let values = scheduler
        .wait(future::try_join3(fut1, fut2, fut3))
        .unwrap();

    assert_eq!(values, (10, 10, 20));
    assert_eq!(*calls.borrow(), vec![vec![10, 20]]);
}

#[test]
fn test_batching_disabled() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let loader = Loader::with_options(
        &scheduler,
        LoaderOptions::default().with_batch(false),
        recording(&calls, identity),
    );

    // Each load is dispatched before it returns
    let fut1 = loader.load(1);
    assert_eq!(*calls.borrow(), vec![vec![1]]);
    assert_eq!(loader.pending_len(), 0);

    let fut2 = loader.load(2);
    let fut3 = loader.load(3);
    assert_eq!(*calls.borrow(), vec![vec![1], vec![2], vec![3]]);

    let values = scheduler
        .wait(future::try_join3(fut1, fut2, fut3))
        .unwrap();
    assert_eq!(values, (1, 2, 3));
}

#[test]
fn test_continuations_share_a_batch() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let loader = Loader::new(&scheduler, recording(&calls, identity));

    loader.prime(&0, Ok(100));

    let task_loader = loader.clone();
    let (res1, res2, res3) = scheduler
        .block_on(async move {
            let loader = task_loader;

            futures::join!(
                // A continuation of an already settled future
                async {
                    match loader.load(0).await {
                        Ok(base) => loader.load(base + 1).await,
                        Err(err) => Err(err),
                    }
                },
                // A task that yields a few times before loading
                async {
                    Skipper::new(3).await;
                    loader.load(2).await
                },
                loader.load(3),
            )
        })
        .unwrap();

    assert_eq!(res1, Ok(101));
    assert_eq!(res2, Ok(2));
    assert_eq!(res3, Ok(3));

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);

    let mut keys = calls[0].clone();
    keys.sort_unstable();
    assert_eq!(keys, vec![2, 3, 101]);
}

#[test]
fn test_loads_after_dispatch_get_a_new_batch() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let loader = Loader::new(&scheduler, recording(&calls, identity));

    let task_loader = loader.clone();
    let res = scheduler
        .block_on(async move {
            match task_loader.load(1).await {
                Ok(first) => task_loader.load(first + 1).await,
                Err(err) => Err(err),
            }
        })
        .unwrap();

    assert_eq!(res, Ok(2));
    assert_eq!(*calls.borrow(), vec![vec![1], vec![2]]);
}

#[test]
fn test_per_key_errors() {
    let scheduler = Scheduler::new();
    let loader = Loader::new(&scheduler, odd_only);

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    let fut3 = loader.load(3);

    scheduler.await_all().unwrap();

    assert_eq!(fut1.peek(), Some(Ok(1)));
    assert_eq!(
        fut2.peek(),
        Some(Err(LoadError::Failed("2 is even".to_string())))
    );
    assert_eq!(fut3.peek(), Some(Ok(3)));

    // load_many rejects with the first error
    assert_eq!(
        scheduler.wait(loader.load_many(vec![1, 4, 3])),
        Err(AwaitError::Rejected(LoadError::Failed(
            "4 is even".to_string()
        )))
    );
}

#[test]
fn test_chunk_failures_are_isolated() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();

    let fail_on_3 = |keys: Vec<u32>| -> Ready<BatchResult<u32, String>> {
        future::ready(match keys.contains(&3) {
            true => Err("chunk failed".to_string()),
            false => Ok(keys.into_iter().map(Ok).collect()),
        })
    };

    let loader = Loader::with_options(
        &scheduler,
        LoaderOptions::default().with_max_batch_size(2),
        recording(&calls, fail_on_3),
    );

    let futs: Vec<_> = (1..=5).map(|key| loader.load(key)).collect();
    scheduler.await_all().unwrap();

    let failed = Err(LoadError::Failed("chunk failed".to_string()));
    let results: Vec<_> = futs.iter().map(|fut| fut.peek()).collect();

    assert_eq!(
        results,
        vec![
            Some(Ok(1)),
            Some(Ok(2)),
            Some(failed.clone()),
            Some(failed),
            Some(Ok(5)),
        ]
    );
    assert_eq!(*calls.borrow(), vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[test]
fn test_chunk_failure_evicts_cache() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();
    let attempts = Rc::new(Cell::new(0));

    let flaky = {
        let attempts = attempts.clone();

        move |keys: Vec<u32>| -> Ready<BatchResult<u32, String>> {
            attempts.set(attempts.get() + 1);

            future::ready(match attempts.get() {
                1 => Err("temporarily unavailable".to_string()),
                _ => Ok(keys.into_iter().map(Ok).collect()),
            })
        }
    };

    let loader = Loader::new(&scheduler, recording(&calls, flaky));

    let failed = loader.load(1);
    assert_eq!(
        scheduler.wait(failed.clone()),
        Err(AwaitError::Rejected(LoadError::Failed(
            "temporarily unavailable".to_string()
        )))
    );

    // The failed future is not served from the cache anymore
    let retried = loader.load(1);
    assert!(!retried.ptr_eq(&failed));
    assert_eq!(scheduler.wait(retried), Ok(1));
    assert_eq!(*calls.borrow(), vec![vec![1], vec![1]]);
}

#[test]
fn test_chunk_failure_keeps_replaced_entry() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();

    let slow_failure = |_keys: Vec<u32>| async {
        Delay::new(Duration::from_millis(20)).await;
        let failed: BatchResult<u32, String> = Err("unavailable".to_string());
        failed
    };

    let loader = Loader::new(&scheduler, recording(&calls, slow_failure));

    // Dispatch the batch, leaving it waiting on its timer
    let failing = loader.load(1);
    scheduler.await_all().unwrap();
    assert!(!failing.is_settled());

    // Replace the cached entry while the batch is in flight
    loader.clear(&1).prime(&1, Ok(10));
    let replacement = loader.load(1);
    assert!(!replacement.ptr_eq(&failing));

    assert_eq!(
        scheduler.wait(failing),
        Err(AwaitError::Rejected(LoadError::Failed(
            "unavailable".to_string()
        )))
    );

    // The failure only evicts its own entry
    let cached = loader.load(1);
    assert!(cached.ptr_eq(&replacement));
    assert_eq!(cached.peek(), Some(Ok(10)));
    assert_eq!(*calls.borrow(), vec![vec![1]]);
}

#[test]
fn test_length_mismatch() {
    let scheduler = Scheduler::new();
    let calls = Calls::default();

    let drop_first = |keys: Vec<u32>| -> Ready<BatchResult<u32, String>> {
        future::ready(Ok(keys.into_iter().skip(1).map(Ok).collect()))
    };

    let loader = Loader::new(&scheduler, recording(&calls, drop_first));

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    scheduler.await_all().unwrap();

    let mismatch = Err(LoadError::LengthMismatch { keys: 2, values: 1 });
    assert_eq!(fut1.peek(), Some(mismatch.clone()));
    assert_eq!(fut2.peek(), Some(mismatch));

    // Both keys were evicted, so they're requested again
    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    scheduler.await_all().unwrap();

    assert!(fut1.is_settled());
    assert!(fut2.is_settled());
    assert_eq!(*calls.borrow(), vec![vec![1, 2], vec![1, 2]]);
}
