// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end behaviour of effects evaluated on a real runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use effio::{
    sequence, tuple2, Effect, Either, Error, ExitCase, PoolConfig, RepeatPolicy, RetryPolicy,
    Runtime,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

fn runtime() -> Runtime {
    init_tracing();
    Runtime::with_config(PoolConfig::new().with_core_threads(4)).unwrap()
}

fn after<T: Clone + Send + Sync + 'static>(millis: u64, value: T) -> Effect<T> {
    Effect::sleep(Duration::from_millis(millis)).map(move |()| value.clone())
}

#[test]
fn deep_flat_map_chain_is_stack_safe() {
    let rt = runtime();
    let mut program = Effect::pure(0u64);
    for _ in 0..100_000 {
        program = program.flat_map(|x| Effect::pure(x + 1));
    }
    assert_eq!(rt.run_sync(&program).unwrap(), 100_000);
}

#[test]
fn right_nested_chain_runs_and_drops() {
    let rt = runtime();
    let mut program = Effect::pure(0u64);
    for _ in 0..100_000 {
        program = Effect::unit().and_then(&program);
    }
    assert_eq!(rt.run_sync(&program).unwrap(), 0);
    drop(program);
}

#[test]
fn recursive_loop_is_stack_safe() {
    fn count(n: u64, acc: u64) -> Effect<u64> {
        if n == 0 {
            Effect::pure(acc)
        } else {
            Effect::unit().flat_map(move |()| count(n - 1, acc + n))
        }
    }
    let rt = runtime();
    assert_eq!(rt.run_sync(&count(200_000, 0)).unwrap(), 200_000 * 200_001 / 2);
}

#[test]
fn descriptions_rerun_their_effects() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let effect = Effect::delay(move || Ok(c.fetch_add(1, Ordering::SeqCst) + 1));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(rt.run_sync(&effect).unwrap(), 1);
    assert_eq!(rt.run_sync(&effect).unwrap(), 2);
}

#[test]
fn race_picks_the_faster_side() {
    let rt = runtime();
    let winner = rt.run_sync(&after(10, 10).race(&after(100, "b"))).unwrap();
    assert_eq!(winner, Either::Left(10));

    let winner = rt.run_sync(&after(100, 10).race(&after(10, "b"))).unwrap();
    assert_eq!(winner, Either::Right("b"));
}

#[test]
fn race_interrupts_the_loser() {
    let rt = runtime();
    let finished = Arc::new(AtomicUsize::new(0));
    let f = finished.clone();
    let slow = Effect::delay(move || {
        effio::sleep(Duration::from_millis(500))?;
        f.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let winner = rt.run_sync(&after(10, 1).race(&slow)).unwrap();
    assert!(winner.is_left());
    thread::sleep(Duration::from_millis(700));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[test]
fn timeout_fails_slow_effects() {
    let rt = runtime();
    let start = Instant::now();
    let result = rt.run_sync(&after(5_000, 1).timeout(Duration::from_millis(50)));
    assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(50)));
    assert!(start.elapsed() < Duration::from_secs(2));

    let result = rt.run_sync(&after(10, 1).timeout(Duration::from_secs(5)));
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn race_is_decided_by_a_failing_winner() {
    let rt = runtime();
    let failing = Effect::sleep(Duration::from_millis(10))
        .and_then(&Effect::<i32>::raise(Error::msg("fast failure")));
    let result = rt.run_sync(&failing.race(&after(300, "slow")));
    assert_eq!(result.unwrap_err().to_string(), "fast failure");
}

#[test]
fn timeout_interrupts_the_slow_side() {
    let rt = runtime();
    let finished = Arc::new(AtomicUsize::new(0));
    let f = finished.clone();
    let slow = Effect::delay(move || {
        effio::sleep(Duration::from_millis(500))?;
        f.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    });
    let result = rt.run_sync(&slow.timeout(Duration::from_millis(50)));
    assert!(matches!(result, Err(Error::Timeout(_))));
    thread::sleep(Duration::from_millis(700));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[test]
fn timeout_to_switches_to_fallback() {
    let rt = runtime();
    let program = after(5_000, "slow").timeout_to(Duration::from_millis(20), &Effect::pure("fallback"));
    assert_eq!(rt.run_sync(&program).unwrap(), "fallback");
}

fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Effect<&'static str> {
    Effect::delay(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(Error::msg(format!("attempt {} failed", n + 1)))
        } else {
            Ok("hola")
        }
    })
}

#[test]
fn retry_succeeds_after_exactly_enough_attempts() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let program = flaky(3, calls.clone()).retry(RetryPolicy::fixed(3, Duration::from_millis(100)));
    let start = Instant::now();
    assert_eq!(rt.run_sync(&program).unwrap(), "hola");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn retry_gives_up_with_the_last_failure() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let program = flaky(3, calls.clone()).retry(RetryPolicy::fixed(2, Duration::from_millis(10)));
    let err = rt.run_sync(&program).unwrap_err();
    assert_eq!(err.to_string(), "attempt 3 failed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn repeat_returns_last_value_and_stops_on_failure() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let counter = Effect::delay(move || Ok(c.fetch_add(1, Ordering::SeqCst)));
    let program = counter.repeat(RepeatPolicy::new(4, Duration::from_millis(5)));
    assert_eq!(rt.run_sync(&program).unwrap(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let calls = Arc::new(AtomicUsize::new(0));
    let program = flaky(0, calls.clone())
        .flat_map({
            let calls = calls.clone();
            move |v| {
                if calls.load(Ordering::SeqCst) >= 2 {
                    Effect::raise(Error::msg("stop"))
                } else {
                    Effect::pure(v)
                }
            }
        })
        .repeat(RepeatPolicy::new(10, Duration::ZERO));
    assert!(rt.run_sync(&program).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn tuple2_runs_on_different_threads() {
    let rt = runtime();
    let work = Effect::delay(|| {
        effio::sleep(Duration::from_millis(100))?;
        Ok(thread::current().id())
    });
    for _ in 0..2 {
        let (a, b) = rt.run_sync(&tuple2(&work, &work)).unwrap();
        assert_ne!(a, b);
    }
}

#[test]
fn sequence_reports_the_first_failure() {
    let rt = runtime();
    let program = sequence(vec![
        after(50, 1),
        Effect::sleep(Duration::from_millis(10)).and_then(&Effect::raise(Error::msg("early"))),
        Effect::sleep(Duration::from_millis(30)).and_then(&Effect::raise(Error::msg("late"))),
    ]);
    let err = rt.run_sync(&program).unwrap_err();
    assert_eq!(err.to_string(), "early");
}

#[derive(Debug, PartialEq)]
enum Event {
    Acquired,
    Used,
    Released(&'static str),
}

fn exit_name(exit: &ExitCase) -> &'static str {
    match exit {
        ExitCase::Completed => "completed",
        ExitCase::Failed(_) => "failed",
        ExitCase::Cancelled => "cancelled",
    }
}

fn tracked<T: Send + 'static>(
    log: Arc<Mutex<Vec<Event>>>,
    body: impl Fn() -> Effect<T> + Send + Sync + 'static,
) -> Effect<T> {
    let (a, u, r) = (log.clone(), log.clone(), log);
    let acquire = Effect::delay(move || {
        a.lock().unwrap().push(Event::Acquired);
        Ok(())
    });
    Effect::bracket(
        &acquire,
        move |()| {
            u.lock().unwrap().push(Event::Used);
            body()
        },
        move |(), exit| {
            let r = r.clone();
            Effect::delay(move || {
                r.lock().unwrap().push(Event::Released(exit_name(&exit)));
                Ok(())
            })
        },
    )
}

#[test]
fn bracket_releases_once_after_success_and_failure() {
    let rt = runtime();
    let log = Arc::new(Mutex::new(Vec::new()));
    let ok = tracked(log.clone(), || Effect::pure(7));
    assert_eq!(rt.run_sync(&ok).unwrap(), 7);
    assert_eq!(
        *log.lock().unwrap(),
        vec![Event::Acquired, Event::Used, Event::Released("completed")]
    );

    let log = Arc::new(Mutex::new(Vec::new()));
    let failing = tracked(log.clone(), || Effect::<i32>::raise(Error::msg("use failed")));
    let err = rt.run_sync(&failing).unwrap_err();
    assert_eq!(err.to_string(), "use failed");
    assert_eq!(
        *log.lock().unwrap(),
        vec![Event::Acquired, Event::Used, Event::Released("failed")]
    );
}

#[test]
fn bracket_keeps_use_failure_when_release_fails() {
    let rt = runtime();
    let program = Effect::bracket(
        &Effect::unit(),
        |()| Effect::<u8>::raise(Error::msg("use failed")),
        |(), _| Effect::raise(Error::msg("release failed")),
    );
    assert_eq!(rt.run_sync(&program).unwrap_err().to_string(), "use failed");

    let program = Effect::bracket(
        &Effect::unit(),
        |()| Effect::pure(1u8),
        |(), _| Effect::raise(Error::msg("release failed")),
    );
    assert_eq!(rt.run_sync(&program).unwrap_err().to_string(), "release failed");
}

#[test]
fn bracket_releases_when_cancelled_mid_use() {
    let rt = runtime();
    let log = Arc::new(Mutex::new(Vec::new()));
    let held = tracked(log.clone(), || Effect::<()>::never());
    let program = held.fork().flat_map(|fiber| {
        Effect::sleep(Duration::from_millis(30))
            .and_then(&fiber.cancel())
            .and_then(&fiber.join().attempt())
    });
    let joined = rt.run_sync(&program).unwrap();
    assert!(matches!(joined, Err(Error::Cancelled)));
    assert_eq!(
        *log.lock().unwrap(),
        vec![Event::Acquired, Event::Used, Event::Released("cancelled")]
    );
}

#[test]
fn cancelled_is_not_recoverable() {
    let rt = runtime();
    let recovered = Arc::new(AtomicUsize::new(0));
    let r = recovered.clone();
    let guarded = Effect::<u8>::never().handle_error_with(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Effect::pure(0)
    });
    let handle = rt.run_async(&guarded);
    thread::sleep(Duration::from_millis(20));
    assert!(handle.cancel(true));
    assert!(matches!(handle.wait(), Err(Error::Cancelled)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recovered.load(Ordering::SeqCst), 0);
}

#[test]
fn panics_become_failures() {
    let rt = runtime();
    let program = Effect::pure(1).map(|x: i32| -> i32 { panic!("bad map {x}") });
    assert!(matches!(rt.run_sync(&program), Err(Error::Panicked(m)) if m == "bad map 1"));

    let program = Effect::<u8>::async_(|_cb| panic!("bad register"));
    assert!(matches!(rt.run_sync(&program), Err(Error::Panicked(_))));
}

#[test]
fn async_bridges_callbacks_from_other_threads() {
    let rt = runtime();
    let program = Effect::<u32>::async_(|cb| {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            cb.success(5u32);
            cb.success(6u32);
        });
    })
    .map(|x| x * 2);
    assert_eq!(rt.run_sync(&program).unwrap(), 10);
}

#[test]
fn dropped_callback_ends_the_fiber() {
    let rt = runtime();
    let program = Effect::<u8>::async_(|cb| drop(cb));
    assert!(matches!(rt.run_sync(&program), Err(Error::Cancelled)));

    let later = Effect::<u8>::async_(|cb| {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            drop(cb);
        });
    });
    assert!(matches!(rt.run_sync(&later), Err(Error::Cancelled)));
}

#[test]
fn never_waits_for_cancellation() {
    let rt = runtime();
    let program = Effect::<u8>::never().timeout(Duration::from_millis(30));
    assert!(matches!(rt.run_sync(&program), Err(Error::Timeout(_))));
}

#[test]
fn attempt_and_recover() {
    let rt = runtime();
    let failing = Effect::<i32>::raise(Error::Timeout(Duration::from_millis(1)));
    assert!(rt.run_sync(&failing.attempt()).unwrap().is_err());
    assert_eq!(rt.run_sync(&failing.recover(|e| e.is_timeout().then_some(3))).unwrap(), 3);
    let other = Effect::<i32>::raise(Error::msg("nope"));
    assert!(rt.run_sync(&other.recover(|e| e.is_timeout().then_some(3))).is_err());
    assert_eq!(
        rt.run_sync(&other.recover_with(|_| Some(after(5, 9)))).unwrap(),
        9
    );
}

#[test]
fn guarantee_and_on_error_run_finalizers() {
    let rt = runtime();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let finalizer = Effect::delay(move || {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let failing = Effect::<u8>::raise(Error::msg("x"));
    assert!(rt.run_sync(&failing.guarantee(&finalizer)).is_err());
    assert!(rt.run_sync(&Effect::pure(1u8).guarantee(&finalizer)).is_ok());
    let f = finalizer.clone();
    assert!(rt.run_sync(&failing.on_error(move |_| f.clone())).is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}
