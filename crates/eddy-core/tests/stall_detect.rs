//! End-to-end stall detection: a task that hogs the reactor gets reported;
//! normal operation afterwards stays quiet.

use std::time::Duration;

use eddy_core::timer::SteadyClock;
use eddy_core::{reactor, Runtime, RuntimeConfig};

#[test]
fn busy_looping_task_is_reported_once() {
    let config = RuntimeConfig {
        smp: Some(1),
        memory: Some(256 << 20),
        reserve_memory: Some(0),
        thread_affinity: false,
        blocked_reactor_notify: Duration::from_millis(10),
        ..RuntimeConfig::default()
    };
    let rt = Runtime::start(config).expect("runtime boots");

    // Queue a task that busy-loops for 3x the stall threshold.
    rt.run_on(0, Duration::from_secs(10), || {
        reactor::spawn_fn(eddy_core::sched::MAIN_QUEUE, || {
            let until = SteadyClock::now() + 30_000_000;
            while SteadyClock::now() < until {
                std::hint::black_box(0u64);
            }
        });
        Ok(())
    })
    .unwrap();

    // The watchdog fires while the task spins.
    let mut stalls = 0;
    for _ in 0..100 {
        stalls = rt
            .run_on(0, Duration::from_secs(10), || Ok(reactor::stall_count()))
            .unwrap();
        if stalls >= 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(stalls >= 1, "no stall recorded for a 30 ms busy loop");

    // Healthy traffic afterwards adds no records.
    for _ in 0..50 {
        rt.run_on(0, Duration::from_secs(10), || Ok(())).unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    let after = rt
        .run_on(0, Duration::from_secs(10), || Ok(reactor::stall_count()))
        .unwrap();
    assert_eq!(after, stalls, "stalls recorded during normal operation");

    rt.stop().unwrap();
}
