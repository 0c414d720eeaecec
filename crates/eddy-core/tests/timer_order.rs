//! Timer fairness end-to-end: same-deadline callbacks fire in the order
//! the timers were armed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eddy_core::timer::{ClockKind, SteadyClock};
use eddy_core::{reactor, Runtime, RuntimeConfig};

fn one_shard_runtime() -> Runtime {
    let config = RuntimeConfig {
        smp: Some(1),
        memory: Some(256 << 20),
        reserve_memory: Some(0),
        thread_affinity: false,
        ..RuntimeConfig::default()
    };
    Runtime::start(config).expect("runtime boots")
}

#[test]
fn thousand_same_deadline_timers_fire_in_insertion_order() {
    let rt = one_shard_runtime();
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&order);
    rt.run_on(0, Duration::from_secs(10), move || {
        let deadline = SteadyClock::now() + 50_000_000; // 50 ms out
        for i in 0..1000 {
            let sink = Arc::clone(&sink);
            reactor::arm_timer_at(ClockKind::Steady, deadline, None, move || {
                sink.lock().unwrap().push(i);
            });
        }
        Ok(())
    })
    .unwrap();

    let mut fired = 0;
    for _ in 0..500 {
        fired = order.lock().unwrap().len();
        if fired == 1000 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fired, 1000, "only {fired} callbacks fired");

    let seen = order.lock().unwrap();
    assert!(
        seen.windows(2).all(|w| w[0] < w[1]),
        "callbacks fired out of insertion order"
    );
    drop(seen);

    rt.stop().unwrap();
}

#[test]
fn periodic_timer_fires_k_times_over_k_periods() {
    let rt = one_shard_runtime();
    let count = Arc::new(Mutex::new(0u32));

    let c = Arc::clone(&count);
    rt.run_on(0, Duration::from_secs(10), move || {
        let c2 = Arc::clone(&c);
        let handle = reactor::arm_periodic(
            ClockKind::Steady,
            Duration::from_millis(10),
            move || {
                *c2.lock().unwrap() += 1;
            },
        );
        // Cancel after ~5 periods.
        reactor::arm_timer(ClockKind::Steady, Duration::from_millis(55), move || {
            reactor::cancel_timer(handle);
        });
        Ok(())
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(120));
    let fired = *count.lock().unwrap();
    assert!(
        (4..=6).contains(&fired),
        "periodic timer fired {fired} times over 5 periods"
    );

    rt.stop().unwrap();
}

#[test]
fn cancelled_timer_never_fires() {
    let rt = one_shard_runtime();
    let fired = Arc::new(Mutex::new(false));

    let f = Arc::clone(&fired);
    rt.run_on(0, Duration::from_secs(10), move || {
        let f2 = Arc::clone(&f);
        let handle = reactor::arm_timer(
            ClockKind::Steady,
            Duration::from_millis(20),
            move || {
                *f2.lock().unwrap() = true;
            },
        );
        assert!(reactor::cancel_timer(handle));
        Ok(())
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(60));
    assert!(!*fired.lock().unwrap(), "cancelled timer fired");

    rt.stop().unwrap();
}
