//! Backpressure, deadline and retry integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use taskcore::config::WorkerPoolConfig;
use taskcore::core::{
    executor_fn, CancelReason, OutcomeKind, PoolError, RetryPolicy, Task, TaskContext, WorkerPool,
};
use tokio_util::sync::CancellationToken;

fn config(workers: usize, capacity: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new()
        .with_worker_count(workers)
        .with_queue_capacity(capacity)
}

// ============================================================================
// INTAKE BACKPRESSURE
// ============================================================================

/// Capacity 0: each submit is a direct hand-off, so the third submit cannot
/// complete before the first two tasks have run.
#[test]
fn test_rendezvous_submit_waits_for_worker() {
    println!("\n=== test_rendezvous_submit_waits_for_worker ===");

    let pool = WorkerPool::new(
        config(1, 0),
        executor_fn(|n: u32, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(n)
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    let started = Instant::now();
    pool.submit(Task::new(1)).unwrap();
    pool.submit(Task::new(2)).unwrap();
    pool.submit(Task::new(3)).unwrap();
    let elapsed = started.elapsed();
    println!("Third submit returned after {elapsed:?}");
    assert!(elapsed >= Duration::from_millis(200), "submit returned after {elapsed:?}");

    pool.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(outcomes.filter(|o| o.is_success()).count(), 3);

    println!("=== test_rendezvous_submit_waits_for_worker PASSED ===\n");
}

/// Capacity 0 with two workers: two submits are taken at once, the third
/// waits for a worker to come free.
#[test]
fn test_rendezvous_two_workers() {
    println!("\n=== test_rendezvous_two_workers ===");

    let pool = WorkerPool::new(
        config(2, 0),
        executor_fn(|n: u32, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(n)
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    let started = Instant::now();
    pool.submit(Task::new(1)).unwrap();
    pool.submit(Task::new(2)).unwrap();
    let two_taken = started.elapsed();
    pool.submit(Task::new(3)).unwrap();
    let third = started.elapsed();
    println!("Two submits after {two_taken:?}, third after {third:?}");
    assert!(third >= Duration::from_millis(100), "third submit returned after {third:?}");

    let mut done = 0;
    while done < 3 {
        let outcome = outcomes.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.is_success());
        done += 1;
    }
    let total = started.elapsed();
    println!("All three finished after {total:?}");
    assert!(total >= Duration::from_millis(200), "finished after {total:?}");

    pool.shutdown(Duration::from_secs(5)).unwrap();

    println!("=== test_rendezvous_two_workers PASSED ===\n");
}

/// Capacity 0 with a busy worker: a non-blocking submit is turned away.
#[test]
fn test_rendezvous_try_submit_rejects_when_busy() {
    let gate = CancellationToken::new();
    let (started_tx, started_rx) = unbounded();
    let exec_gate = gate.clone();
    let pool = WorkerPool::new(
        config(1, 0),
        executor_fn(move |n: u32, _ctx| {
            let gate = exec_gate.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                gate.cancelled().await;
                Ok(n)
            }
        }),
    )
    .unwrap();
    pool.start().unwrap();

    pool.submit(Task::new(1)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let err = pool.try_submit(Task::new(2)).unwrap_err();
    assert_eq!(err.error, PoolError::QueueFull);

    gate.cancel();
    pool.shutdown(Duration::from_secs(5)).unwrap();
}

/// Capacity 1, one busy worker, one queued task: the next try_submit fails
/// at once and the rejected task comes back intact.
#[test]
fn test_full_queue_rejects_immediately() {
    let gate = CancellationToken::new();
    let (started_tx, started_rx) = unbounded();
    let exec_gate = gate.clone();
    let pool = WorkerPool::new(
        config(1, 1),
        executor_fn(move |n: u32, _ctx| {
            let gate = exec_gate.clone();
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(n);
                gate.cancelled().await;
                Ok(n)
            }
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    pool.try_submit(Task::new(1)).unwrap();
    assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    pool.try_submit(Task::new(2)).unwrap();

    let started = Instant::now();
    let err = pool.try_submit(Task::new(3)).unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(err.is_queue_full());
    assert_eq!(err.to_string(), "task queue is full");
    let task = err.into_task();
    assert_eq!(*task.payload(), 3);
    assert!(task.deadline().is_none());

    let stats = pool.stats();
    assert_eq!(stats.rejected_tasks, 1);
    assert_eq!(stats.submitted_tasks, 2);

    gate.cancel();
    pool.shutdown(Duration::from_secs(5)).unwrap();
    // The rejected task never produced an outcome.
    assert_eq!(outcomes.count(), 2);
}

#[test]
fn test_submit_with_retry_gives_up_then_succeeds() {
    let gate = CancellationToken::new();
    let (started_tx, started_rx) = unbounded();
    let exec_gate = gate.clone();
    let pool = Arc::new(
        WorkerPool::new(
            config(1, 1),
            executor_fn(move |n: u32, _ctx| {
                let gate = exec_gate.clone();
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(n);
                    gate.cancelled().await;
                    Ok(n)
                }
            }),
        )
        .unwrap(),
    );
    pool.start().unwrap();
    pool.submit(Task::new(1)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    pool.submit(Task::new(2)).unwrap();

    let started = Instant::now();
    let err = pool
        .submit_with_retry(Task::new(3), &RetryPolicy::fixed(3, Duration::from_millis(10)))
        .unwrap_err();
    assert!(err.is_queue_full());
    assert!(started.elapsed() >= Duration::from_millis(20));

    let retrying = {
        let pool = Arc::clone(&pool);
        let task = err.into_task();
        thread::spawn(move || {
            pool.submit_with_retry(task, &RetryPolicy::fixed(200, Duration::from_millis(10)))
        })
    };
    thread::sleep(Duration::from_millis(30));
    gate.cancel();
    assert!(retrying.join().unwrap().is_ok());

    pool.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(pool.stats().completed_tasks, 3);
}

#[tokio::test]
async fn test_submit_with_retry_async() {
    let gate = CancellationToken::new();
    let exec_gate = gate.clone();
    let pool = WorkerPool::new(
        config(1, 1),
        executor_fn(move |n: u32, _ctx| {
            let gate = exec_gate.clone();
            async move {
                gate.cancelled().await;
                Ok(n)
            }
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    pool.submit(Task::new(1)).unwrap();
    // Fill the single slot; the worker may or may not have taken task 1 yet.
    while pool.try_submit(Task::new(2)).is_ok() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let opener = {
        let gate = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            gate.cancel();
        })
    };
    let policy = RetryPolicy {
        max_attempts: 100,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        multiplier: 1.5,
    };
    pool.submit_with_retry_async(Task::new(3), &policy).await.unwrap();
    opener.await.unwrap();

    pool.shutdown(Duration::from_secs(5)).unwrap();
    let mut count = 0;
    while let Some(outcome) = outcomes.recv_async().await {
        assert!(outcome.is_success());
        count += 1;
    }
    assert!(count >= 3);
}

#[test]
fn test_retry_does_not_retry_closed_pool() {
    let pool = WorkerPool::new(config(1, 1), executor_fn(|n: u32, _ctx| async move { Ok(n) })).unwrap();
    pool.start().unwrap();
    pool.shutdown(Duration::from_secs(5)).unwrap();

    let started = Instant::now();
    let err = pool
        .submit_with_retry(Task::new(1), &RetryPolicy::fixed(10, Duration::from_millis(100)))
        .unwrap_err();
    assert_eq!(err.error, PoolError::PoolClosed);
    assert!(started.elapsed() < Duration::from_millis(100));
}

// ============================================================================
// DEADLINES
// ============================================================================

/// A task whose deadline has already passed is cancelled without running.
#[test]
fn test_expired_task_never_runs() {
    let calls = Arc::new(AtomicU64::new(0));
    let exec_calls = Arc::clone(&calls);
    let pool = WorkerPool::new(
        config(1, 4),
        executor_fn(move |n: u32, _ctx| {
            exec_calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    let id = pool
        .submit(Task::new(1).with_deadline(Instant::now()))
        .unwrap();
    let outcome = outcomes.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.task_id, id);
    assert_eq!(outcome.cancel_reason(), Some(CancelReason::DeadlineExceeded));
    assert_eq!(outcome.run_time(), Duration::ZERO);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    pool.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(pool.stats().cancelled_tasks, 1);
}

/// Tasks that expire while queued behind a slow one are skipped.
#[test]
fn test_task_expires_in_queue() {
    let pool = WorkerPool::new(
        config(1, 4),
        executor_fn(|ms: u64, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    pool.submit(Task::new(100)).unwrap();
    let late = pool
        .submit(Task::new(1).with_timeout(Duration::from_millis(20)))
        .unwrap();
    pool.shutdown(Duration::from_secs(5)).unwrap();

    for outcome in outcomes {
        if outcome.task_id == late {
            assert_eq!(outcome.cancel_reason(), Some(CancelReason::DeadlineExceeded));
        } else {
            assert!(outcome.is_success());
        }
    }
}

/// A cooperative payload stops at its deadline and is reported cancelled.
#[test]
fn test_running_task_observes_deadline() {
    let pool = WorkerPool::new(
        config(1, 4),
        executor_fn(|(): (), ctx: TaskContext| async move {
            tokio::select! {
                () = ctx.cancelled() => anyhow::bail!("stopped at deadline"),
                () = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
            }
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    let started = Instant::now();
    pool.submit(Task::new(()).with_timeout(Duration::from_millis(50))).unwrap();
    let outcome = outcomes.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.cancel_reason(), Some(CancelReason::DeadlineExceeded));
    assert!(outcome.run_time() >= Duration::from_millis(40));

    pool.shutdown(Duration::from_secs(5)).unwrap();
}

/// The configured default timeout applies to tasks without a deadline.
#[test]
fn test_default_timeout_applies() {
    let pool = WorkerPool::new(
        config(1, 4).with_default_task_timeout(Duration::from_millis(30)),
        executor_fn(|(): (), ctx: TaskContext| async move {
            assert!(ctx.meta().deadline.is_some());
            ctx.cancelled().await;
            Err::<(), _>(anyhow::anyhow!("cancelled"))
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    pool.submit(Task::new(())).unwrap();
    let outcome = outcomes.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.cancel_reason(), Some(CancelReason::DeadlineExceeded));

    pool.shutdown(Duration::from_secs(5)).unwrap();
}

/// A payload that finishes successfully after its deadline keeps its value.
#[test]
fn test_late_success_is_kept() {
    let pool = WorkerPool::new(
        config(1, 4),
        executor_fn(|n: u32, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(n)
        }),
    )
    .unwrap();
    pool.start().unwrap();
    let outcomes = pool.outcomes();

    pool.submit(Task::new(5).with_timeout(Duration::from_millis(20))).unwrap();
    pool.shutdown(Duration::from_secs(5)).unwrap();

    let outcome = outcomes.recv().unwrap();
    match outcome.kind {
        OutcomeKind::Succeeded(v) => assert_eq!(v, 5),
        other => panic!("expected success, got {other:?}"),
    }
}
