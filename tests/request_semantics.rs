//! End-to-end behavior of requests: sharing, failure fan-out,
//! cancellation rules, and the request-aware lock.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use blockflow::{Request, RequestError, RequestLock, RequestPool, Scheduler};
use common::{init_test_logging, Gate};

fn scheduler(workers: usize) -> Scheduler {
    init_test_logging();
    Scheduler::builder().num_workers(workers).build()
}

#[test]
fn shared_dependency_executes_once() {
    let scheduler = scheduler(4);
    let executions = Arc::new(AtomicUsize::new(0));
    let tally = Arc::clone(&executions);
    let dependency = Request::new(&scheduler, async move {
        tally.fetch_add(1, Ordering::SeqCst);
        Ok(7u32)
    });

    let mut pool = RequestPool::new();
    for _ in 0..100 {
        let dependency = dependency.clone();
        pool.add(Request::new(&scheduler, async move {
            let value = dependency.join().await?;
            assert_eq!(value, 7);
            Ok(())
        }))
        .unwrap();
    }
    pool.wait_all().unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

#[test]
fn failure_reaches_every_waiter() {
    let scheduler = scheduler(4);
    let gate = Gate::new();
    let body_gate = gate.clone();
    let failing: Request<u32> = Request::new(&scheduler, async move {
        body_gate.wait().await;
        Err(RequestError::failed(std::io::Error::other("disk gone")))
    });
    failing.submit();

    let mut waiters = RequestPool::new();
    for _ in 0..8 {
        let failing = failing.clone();
        waiters
            .add(Request::new(&scheduler, async move {
                match failing.join().await {
                    Err(RequestError::Failed(_)) => Ok(true),
                    other => panic!("expected stored failure, got {other:?}"),
                }
            }))
            .unwrap();
    }
    waiters.submit_all();
    gate.open();
    waiters.wait_all().unwrap();
    scheduler.shutdown();
}

#[test]
fn cancellation_cascades_into_children() {
    let scheduler = scheduler(2);
    let gate = Gate::new();
    let child_gate = gate.clone();
    let parent_gate = gate.clone();
    let (send_child, recv_child) = mpsc::channel::<Request<()>>();

    let child_scheduler = scheduler.clone();
    let parent = Request::new(&scheduler, async move {
        let child = Request::new(&child_scheduler, async move {
            child_gate.wait().await;
            Ok(())
        });
        child.submit();
        send_child.send(child).unwrap();
        parent_gate.wait().await;
        Ok(())
    });
    let cancelled = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&cancelled);
    parent.notify_cancelled(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    });
    parent.submit();

    let child = recv_child
        .recv_timeout(Duration::from_secs(5))
        .expect("parent never started");
    parent.cancel();
    assert!(parent.is_cancelled());
    assert!(child.is_cancelled(), "cancellation did not cascade");

    gate.open();
    while !parent.is_finished() {
        std::thread::yield_now();
    }
    scheduler.shutdown();
}

#[test]
fn foreign_waiter_blocks_cancellation() {
    let scheduler = scheduler(2);
    let gate = Gate::new();
    let body_gate = gate.clone();
    let request = Request::new(&scheduler, async move {
        body_gate.wait().await;
        Ok(11u32)
    });
    request.submit();

    let waiter = {
        let request = request.clone();
        std::thread::spawn(move || request.wait())
    };
    // Give the waiter time to register before trying to cancel.
    std::thread::sleep(Duration::from_millis(30));
    request.cancel();
    assert!(!request.is_cancelled());

    gate.open();
    assert_eq!(waiter.join().unwrap().unwrap(), 11);
    scheduler.shutdown();
}

#[test]
fn waiting_on_cancelled_request_is_an_error() {
    let scheduler = scheduler(2);
    let gate = Gate::new();
    let body_gate = gate.clone();
    let target = Request::new(&scheduler, async move {
        body_gate.wait().await;
        Ok(())
    });
    target.submit();
    // Let the worker claim it so it suspends at the gate.
    std::thread::sleep(Duration::from_millis(30));
    target.cancel();
    assert!(target.is_cancelled());

    let observed = {
        let target = target.clone();
        Request::new(&scheduler, async move { target.join().await })
    };
    let error = observed.wait().unwrap_err();
    assert!(matches!(error, RequestError::InvalidRequest));

    gate.open();
    scheduler.shutdown();
}

#[test]
fn waiting_on_self_is_a_circular_wait() {
    let scheduler = scheduler(2);
    let slot: Arc<Mutex<Option<Request<()>>>> = Arc::new(Mutex::new(None));
    let own = Arc::clone(&slot);
    let request = Request::new(&scheduler, async move {
        let me = own.lock().unwrap().clone().expect("handle stored");
        me.join().await
    });
    *slot.lock().unwrap() = Some(request.clone());
    request.submit();
    let error = request.wait().unwrap_err();
    assert!(matches!(error, RequestError::CircularWait));
    scheduler.shutdown();
}

#[test]
fn pending_waiters_veto_cancellation() {
    let scheduler = scheduler(2);
    let gate = Gate::new();
    let body_gate = gate.clone();
    let dependency = Request::new(&scheduler, async move {
        body_gate.wait().await;
        Ok(1u32)
    });
    dependency.submit();

    let dep = dependency.clone();
    let waiter = Request::new(&scheduler, async move { dep.join().await });
    waiter.submit();
    // Wait until the waiter is registered as pending on the dependency.
    std::thread::sleep(Duration::from_millis(30));

    // The waiter itself is not cancelled, so the dependency must refuse.
    dependency.cancel();
    assert!(!dependency.is_cancelled());

    gate.open();
    assert_eq!(waiter.wait().unwrap(), 1);
    scheduler.shutdown();
}

#[test]
fn lock_serializes_tasks_and_threads() {
    let scheduler = scheduler(4);
    let lock = Arc::new(RequestLock::new(0u64));

    let mut pool = RequestPool::new();
    for _ in 0..16 {
        let lock = Arc::clone(&lock);
        pool.add(Request::new(&scheduler, async move {
            for _ in 0..50 {
                let mut guard = lock.lock().await;
                let snapshot = *guard;
                std::hint::black_box(snapshot);
                *guard = snapshot + 1;
            }
            Ok(())
        }))
        .unwrap();
    }
    pool.submit_all();

    let mut threads = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        threads.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let mut guard = lock.lock_blocking();
                let snapshot = *guard;
                std::hint::black_box(snapshot);
                *guard = snapshot + 1;
            }
        }));
    }

    pool.wait_all().unwrap();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(*lock.lock_blocking(), 16 * 50 + 4 * 50);
    scheduler.shutdown();
}

#[test]
fn lock_wakes_waiters_in_arrival_order() {
    let scheduler = scheduler(4);
    let lock = Arc::new(RequestLock::new(()));
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    // Hold the lock so every contender below queues up behind it.
    let held = lock.lock_blocking();

    let mut pool = RequestPool::new();
    let mut enqueue_task = |id: usize| {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        let request = Request::new(&scheduler, async move {
            let guard = lock.lock().await;
            order.lock().unwrap().push(id);
            drop(guard);
            Ok(())
        });
        request.submit();
        pool.add(request).unwrap();
        // Let the worker poll it onto the queue before the next arrival.
        std::thread::sleep(Duration::from_millis(30));
    };

    enqueue_task(0);
    enqueue_task(1);
    let thread = {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            let guard = lock.lock_blocking();
            order.lock().unwrap().push(2);
            drop(guard);
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    enqueue_task(3);

    drop(held);
    pool.wait_all().unwrap();
    thread.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    scheduler.shutdown();
}

#[test]
fn deep_dependency_chain_completes() {
    let scheduler = scheduler(2);
    // Deeper than the inline-adoption limit, forcing the tail of the
    // chain onto the pool.
    let mut tail = Request::new(&scheduler, async { Ok(0u64) });
    for _ in 0..100 {
        let prev = tail.clone();
        tail = Request::new(&scheduler, async move {
            let below = prev.join().await?;
            Ok(below + 1)
        });
    }
    assert_eq!(tail.wait().unwrap(), 100);
    scheduler.shutdown();
}
