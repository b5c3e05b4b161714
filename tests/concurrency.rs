/// Concurrency guard integration tests
///
/// These tests drive real threads through the container and check the locking
/// guarantees: exclusive singletons never run two calls at once, readers share,
/// writers exclude, and calls on one session key are serialized.

use ferrous_container::{
    AccessTimeout, CancellationToken, ComponentDescriptor, ConcurrencyMode, Container, ContainerError, ErrorKind,
    Invocation, MethodSpec, SessionKey,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

// ===== Test Beans =====

/// Tracks how many calls are inside the bean at the same time.
#[derive(Debug, Default)]
struct Occupancy {
    inside: AtomicUsize,
    peak: AtomicUsize,
    writer_peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Occupancy {
    fn visit(&self, hold: Duration) -> usize {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(hold);
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Like `visit`, also recording how crowded the bean was while a writer ran.
    fn write(&self, hold: Duration) -> usize {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.writer_peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(hold);
        self.writer_peak.fetch_max(self.inside.load(Ordering::SeqCst), Ordering::SeqCst);
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn singleton(mode: ConcurrencyMode, occupancy: Arc<Occupancy>) -> ComponentDescriptor {
    let read_gauge = occupancy.clone();
    let write_gauge = occupancy.clone();
    ComponentDescriptor::singleton("Ledger", || ())
        .concurrency(mode)
        .access_timeout(AccessTimeout::Unbounded)
        .method("touch", move |_: &(), _ctx| Ok(occupancy.visit(Duration::from_millis(10))))
        .method_spec(MethodSpec::new("read").read_locked(), move |_: &(), _ctx| {
            Ok(read_gauge.visit(Duration::from_millis(30)))
        })
        .method_spec(MethodSpec::new("write").write_locked(), move |_: &(), _ctx| {
            Ok(write_gauge.write(Duration::from_millis(30)))
        })
        .build()
}

fn hammer(container: &Container, method: &str, threads: usize, calls: usize) -> Vec<Result<(), ContainerError>> {
    let barrier = Barrier::new(threads);
    let mut results = Vec::new();
    crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = &barrier;
                s.spawn(move |_| {
                    barrier.wait();
                    (0..calls)
                        .map(|_| container.dispatch("Ledger", method, None, ()).map(|_| ()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            results.extend(handle.join().unwrap());
        }
    })
    .unwrap();
    results
}

// ===== Mutual Exclusion =====

#[test]
fn exclusive_singleton_serializes_every_call() {
    let occupancy = Arc::new(Occupancy::default());
    let container = Container::builder()
        .deploy(singleton(ConcurrencyMode::Exclusive, occupancy.clone()))
        .build()
        .unwrap();

    let results = hammer(&container, "touch", 8, 4);

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(occupancy.calls.load(Ordering::SeqCst), 32);
    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_singleton_shares_read_locks() {
    let occupancy = Arc::new(Occupancy::default());
    let container = Container::builder()
        .deploy(singleton(ConcurrencyMode::Concurrent, occupancy.clone()))
        .build()
        .unwrap();

    let results = hammer(&container, "read", 4, 2);

    assert!(results.iter().all(Result::is_ok));
    assert!(occupancy.peak.load(Ordering::SeqCst) > 1, "readers should overlap");
}

#[test]
fn exclusive_mode_honours_read_hint() {
    let occupancy = Arc::new(Occupancy::default());
    let container = Container::builder()
        .deploy(singleton(ConcurrencyMode::Exclusive, occupancy.clone()))
        .build()
        .unwrap();

    hammer(&container, "read", 4, 2);
    assert!(occupancy.peak.load(Ordering::SeqCst) > 1);
}

#[test]
fn writers_exclude_readers() {
    let occupancy = Arc::new(Occupancy::default());
    let container = Container::builder()
        .deploy(singleton(ConcurrencyMode::Concurrent, occupancy.clone()))
        .build()
        .unwrap();

    crossbeam_utils::thread::scope(|s| {
        for i in 0..6 {
            let container = &container;
            s.spawn(move |_| {
                let method = if i % 2 == 0 { "write" } else { "read" };
                for _ in 0..3 {
                    container.dispatch("Ledger", method, None, ()).unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(occupancy.writer_peak.load(Ordering::SeqCst), 1);
    assert_eq!(occupancy.calls.load(Ordering::SeqCst), 18);
    assert_eq!(occupancy.inside.load(Ordering::SeqCst), 0);
}

// ===== Session Serialization =====

fn session_component(occupancy: Arc<Occupancy>) -> ComponentDescriptor {
    ComponentDescriptor::session("Cart", || ())
        .concurrency(ConcurrencyMode::Concurrent)
        .access_timeout(AccessTimeout::Unbounded)
        .method_spec(MethodSpec::new("peek").read_locked(), move |_: &(), _ctx| {
            Ok(occupancy.visit(Duration::from_millis(20)))
        })
        .build()
}

#[test]
fn calls_on_one_session_never_overlap() {
    let occupancy = Arc::new(Occupancy::default());
    let container = Container::builder().deploy(session_component(occupancy.clone())).build().unwrap();
    let key = container.create_session("Cart").unwrap();

    crossbeam_utils::thread::scope(|s| {
        for _ in 0..5 {
            let container = &container;
            let key = &key;
            s.spawn(move |_| {
                for _ in 0..3 {
                    container.dispatch("Cart", "peek", Some(key), ()).unwrap();
                }
            });
        }
    })
    .unwrap();

    // Read hints do not apply to session-affine instances.
    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);
    assert_eq!(occupancy.calls.load(Ordering::SeqCst), 15);
    assert_eq!(container.component_stats("Cart").unwrap().lifecycle.created, 1);
}

#[test]
fn different_sessions_run_in_parallel() {
    let occupancy = Arc::new(Occupancy::default());
    let container = Container::builder().deploy(session_component(occupancy.clone())).build().unwrap();

    let barrier = Barrier::new(4);
    crossbeam_utils::thread::scope(|s| {
        for i in 0..4 {
            let container = &container;
            let barrier = &barrier;
            s.spawn(move |_| {
                let key = SessionKey::new(format!("client-{}", i));
                barrier.wait();
                container.dispatch("Cart", "peek", Some(&key), ()).unwrap();
            });
        }
    })
    .unwrap();

    assert!(occupancy.peak.load(Ordering::SeqCst) > 1);
    assert_eq!(container.component_stats("Cart").unwrap().store.live, 4);
}

#[test]
fn session_component_requires_a_key() {
    let container = Container::builder()
        .deploy(session_component(Arc::new(Occupancy::default())))
        .build()
        .unwrap();
    let err = container.dispatch("Cart", "peek", None, ()).unwrap_err();
    assert!(matches!(err, ContainerError::MissingSessionKey(_)));
}

// ===== Timeout Classification =====

fn slow_singleton(timeout: AccessTimeout) -> ComponentDescriptor {
    ComponentDescriptor::singleton("Ledger", || ())
        .access_timeout(timeout)
        .method("slow", |_: &(), _ctx| {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .build()
}

#[test]
fn busy_lock_with_bounded_timeout_times_out() {
    let container = Container::builder()
        .deploy(slow_singleton(AccessTimeout::from_millis(50)))
        .build()
        .unwrap();

    crossbeam_utils::thread::scope(|s| {
        let holder = s.spawn(|_| container.dispatch("Ledger", "slow", None, ()).map(|_| ()));
        thread::sleep(Duration::from_millis(40));

        let started = Instant::now();
        let err = container.dispatch("Ledger", "slow", None, ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(holder.join().unwrap().is_ok());
    })
    .unwrap();

    let stats = container.component_stats("Ledger").unwrap();
    assert_eq!(stats.invocations.timeouts, 1);
    // A timed-out caller never discards the instance.
    assert_eq!(stats.lifecycle.destroyed, 0);
}

#[test]
fn zero_timeout_fails_without_waiting() {
    let container = Container::builder()
        .deploy(slow_singleton(AccessTimeout::Unbounded))
        .build()
        .unwrap();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| container.dispatch("Ledger", "slow", None, ()).unwrap());
        thread::sleep(Duration::from_millis(40));

        let started = Instant::now();
        let err = container
            .invoke(Invocation::new("Ledger", "slow").with_timeout(AccessTimeout::Immediate))
            .unwrap_err();
        assert!(matches!(err, ContainerError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
    })
    .unwrap();
}

#[test]
fn cancellation_abandons_the_wait() {
    let container = Container::builder()
        .deploy(slow_singleton(AccessTimeout::Unbounded))
        .build()
        .unwrap();
    let token = CancellationToken::new();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| container.dispatch("Ledger", "slow", None, ()).unwrap());
        thread::sleep(Duration::from_millis(30));

        let waiter = {
            let token = token.clone();
            let container = &container;
            s.spawn(move |_| container.invoke(Invocation::new("Ledger", "slow").with_cancellation(token)))
        };
        thread::sleep(Duration::from_millis(30));
        token.cancel();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    })
    .unwrap();
}
