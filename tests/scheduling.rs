//! Scheduled workload tests: firing, timing, cancellation and item sweep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use spindle::{WorkerPool, Workload};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_run_immediately_runs_once_and_finishes() {
    let pool = WorkerPool::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let task = {
        let runs = runs.clone();
        pool.run_immediately(Workload::function(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        }))
    };

    assert!(wait_until(Duration::from_secs(5), || task.finished()));
    assert!(task.started());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The cleanup sweep eventually removes the finished item.
    assert!(wait_until(Duration::from_secs(5), || !pool.has_active_tasks()));
}

#[test]
fn test_run_at_does_not_fire_early() {
    let pool = WorkerPool::new(2).unwrap();
    let fired = Arc::new(Mutex::new(None));
    let when = Instant::now() + Duration::from_millis(150);

    {
        let fired = fired.clone();
        pool.run_at(
            Workload::function(move || {
                *fired.lock().unwrap() = Some(Instant::now());
            }),
            when,
        );
    }

    assert!(wait_until(Duration::from_secs(5), || {
        fired.lock().unwrap().is_some()
    }));
    let at = fired.lock().unwrap().unwrap();
    // Timers never fire before their deadline (up to timer resolution).
    assert!(at + Duration::from_millis(1) >= when);
}

#[test]
fn test_run_after_delay() {
    let pool = WorkerPool::new(1).unwrap();
    let fired = Arc::new(Mutex::new(None));
    let submitted = Instant::now();

    {
        let fired = fired.clone();
        pool.run_after(
            Workload::function(move || {
                *fired.lock().unwrap() = Some(Instant::now());
            }),
            Duration::from_millis(100),
        );
    }

    assert!(wait_until(Duration::from_secs(5), || {
        fired.lock().unwrap().is_some()
    }));
    let at = fired.lock().unwrap().unwrap();
    assert!(at.duration_since(submitted) + Duration::from_millis(1) >= Duration::from_millis(100));
}

#[test]
fn test_cancel_before_firing() {
    let pool = WorkerPool::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let task = {
        let runs = runs.clone();
        pool.run_after(
            Workload::function(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .with_callback(move |status| {
                let _ = tx.send(status);
            }),
            Duration::from_secs(1),
        )
    };

    task.cancel();

    let status = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion callback after cancel");
    assert!(status.is_cancelled(), "expected cancellation, got {status}");

    // Exactly one callback invocation.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(!task.started());
    assert!(wait_until(Duration::from_secs(5), || task.finished()));
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let pool = WorkerPool::new(1).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let task = {
        let runs = runs.clone();
        pool.run_immediately(Workload::function(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        }))
    };

    assert!(wait_until(Duration::from_secs(5), || task.finished()));
    task.cancel();
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(task.started());
    assert!(task.finished());
}

#[test]
fn test_completion_callback_success_on_normal_run() {
    let pool = WorkerPool::new(1).unwrap();
    let (tx, rx) = mpsc::channel();

    pool.run_immediately(Workload::function(|| {}).with_callback(move |status| {
        let _ = tx.send(status);
    }));

    let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(status.is_success());
}
