use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pacer::{RateScheduler, TimingPolicy, clock::ManualClock, scheduler::log_errors};

type Calls = Arc<Mutex<Vec<(u64, i32)>>>;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

// Records `(virtual time, argument)` for every execution.
fn recorder(clock: &Arc<ManualClock>) -> (Calls, impl Fn(i32) -> i32 + Send + Sync + 'static) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let clock = Arc::clone(clock);
    let func = move |arg| {
        sink.lock()
            .unwrap()
            .push((clock.elapsed().as_millis() as u64, arg));
        arg
    };
    (calls, func)
}

#[test]
fn burst_executes_once_with_last_arguments() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(clock.clone(), TimingPolicy::debounce().wait(ms(100)), func);

    assert_eq!(debounced.run(1), None);
    clock.advance(ms(30));
    assert_eq!(debounced.run(2), None);
    clock.advance(ms(30));
    assert_eq!(debounced.run(3), None);

    clock.advance(ms(99));
    assert!(calls.lock().unwrap().is_empty(), "Quiet period restarted by every call");
    clock.advance(ms(1));
    assert_eq!(*calls.lock().unwrap(), vec![(160, 3)]);

    clock.advance(ms(1000));
    assert_eq!(calls.lock().unwrap().len(), 1, "Only one trailing execution");
}

#[test]
fn leading_only_executes_first_call() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(
        clock.clone(),
        TimingPolicy::debounce()
            .wait(ms(100))
            .leading(true)
            .trailing(false),
        func,
    );

    assert_eq!(debounced.run(1), Some(1), "Leading edge runs synchronously");
    clock.advance(ms(40));
    assert_eq!(debounced.run(2), None);
    clock.advance(ms(40));
    assert_eq!(debounced.run(3), None);
    clock.advance(ms(500));

    assert_eq!(*calls.lock().unwrap(), vec![(0, 1)]);
    assert!(!debounced.is_pending());
}

#[test]
fn leading_and_trailing_execute_both_edges() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(
        clock.clone(),
        TimingPolicy::debounce().wait(ms(100)).leading(true),
        func,
    );

    debounced.run(1);
    clock.advance(ms(50));
    debounced.run(2);
    clock.advance(ms(100));

    assert_eq!(*calls.lock().unwrap(), vec![(0, 1), (150, 2)]);

    // The burst ended, so the next call is a leading edge again.
    assert_eq!(debounced.run(3), Some(3));
}

#[test]
fn max_wait_bounds_continuous_bursts() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(
        clock.clone(),
        TimingPolicy::debounce().wait(ms(1000)).max_wait(ms(2000)),
        func,
    );

    for i in 0..10 {
        debounced.run(i);
        clock.advance(ms(200));
    }

    let calls = calls.lock().unwrap();
    assert!(!calls.is_empty(), "max_wait must force an execution");
    assert!(calls[0].0 <= 2000, "Executed at {}ms", calls[0].0);
    assert_eq!(calls[0], (2000, 9));
}

#[test]
fn cancel_prevents_execution_but_keeps_arguments() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(clock.clone(), TimingPolicy::debounce().wait(ms(100)), func);

    debounced.run(7);
    assert!(debounced.is_pending());
    debounced.cancel();
    assert!(!debounced.is_pending());
    clock.advance(ms(1000));
    assert!(calls.lock().unwrap().is_empty());

    assert_eq!(debounced.flush(), Some(7), "Arguments survive cancel");
}

#[test]
fn flush_executes_now_and_disarms_timer() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(clock.clone(), TimingPolicy::debounce().wait(ms(100)), func);

    debounced.run(1);
    clock.advance(ms(20));
    debounced.run(2);

    assert_eq!(debounced.flush(), Some(2));
    assert_eq!(*calls.lock().unwrap(), vec![(20, 2)]);
    assert_eq!(clock.pending_timers(), 0);

    clock.advance(ms(1000));
    assert_eq!(calls.lock().unwrap().len(), 1, "Timer never fires after flush");
}

#[test]
fn flush_reinvokes_with_last_arguments() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(clock.clone(), TimingPolicy::debounce().wait(ms(100)), func);

    assert_eq!(debounced.flush(), None, "Nothing to execute before the first run");

    debounced.run(4);
    clock.advance(ms(100));
    assert_eq!(debounced.flush(), Some(4));
    assert_eq!(*calls.lock().unwrap(), vec![(100, 4), (100, 4)]);
}

#[test]
fn deferred_execution_uses_latest_function() {
    let clock = Arc::new(ManualClock::new());
    let debounced = RateScheduler::debounce(
        clock.clone(),
        TimingPolicy::debounce().wait(ms(100)),
        |x: i32| x,
    );
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    debounced.on_deferred(move |r| sink.lock().unwrap().push(r));

    debounced.run(3);
    debounced.set_fn(|x| x * 100);
    clock.advance(ms(100));

    assert_eq!(*results.lock().unwrap(), vec![300]);
}

#[test]
fn deferred_errors_reach_the_sink() {
    let clock = Arc::new(ManualClock::new());
    let debounced = RateScheduler::debounce(
        clock.clone(),
        TimingPolicy::debounce().wait(ms(10)),
        |x: i32| if x < 0 { Err(format!("negative: {x}")) } else { Ok(x) },
    );
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    debounced.on_deferred(move |r: Result<i32, String>| {
        if let Err(e) = r {
            sink.lock().unwrap().push(e);
        }
    });

    debounced.run(-1);
    clock.advance(ms(10));
    assert_eq!(*errors.lock().unwrap(), vec!["negative: -1".to_string()]);

    // The logging sink accepts the same results without panicking.
    debounced.on_deferred(log_errors::<i32, String>());
    debounced.run(-2);
    clock.advance(ms(10));
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn immediate_errors_are_returned_to_caller() {
    let clock = Arc::new(ManualClock::new());
    let debounced = RateScheduler::debounce(
        clock.clone(),
        TimingPolicy::debounce().wait(ms(10)).leading(true),
        |x: i32| if x < 0 { Err("negative") } else { Ok(x) },
    );

    assert_eq!(debounced.run(-5), Some(Err("negative")));
    assert_eq!(debounced.flush(), Some(Err("negative")));
}

#[test]
fn dropping_last_handle_cancels_timer() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(clock.clone(), TimingPolicy::debounce().wait(ms(100)), func);
    let clone = debounced.clone();

    debounced.run(1);
    drop(debounced);
    assert_eq!(clock.pending_timers(), 1, "A clone keeps the scheduler alive");

    drop(clone);
    assert_eq!(clock.pending_timers(), 0);
    clock.advance(ms(1000));
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn swapped_policy_applies_to_next_calls() {
    let clock = Arc::new(ManualClock::new());
    let (calls, func) = recorder(&clock);
    let debounced = RateScheduler::debounce(clock.clone(), TimingPolicy::debounce().wait(ms(100)), func);

    debounced.run(1);
    debounced.set_policy(TimingPolicy::debounce().wait(ms(300)));
    clock.advance(ms(100));
    assert_eq!(*calls.lock().unwrap(), vec![(100, 1)], "Armed timer keeps its deadline");

    debounced.run(2);
    clock.advance(ms(299));
    assert_eq!(calls.lock().unwrap().len(), 1);
    clock.advance(ms(1));
    assert_eq!(calls.lock().unwrap().last(), Some(&(400, 2)));
    assert_eq!(debounced.policy().wait, ms(300));
}
