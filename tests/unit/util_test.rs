//! Tests for utility functions

use std::time::Duration;
use tickwork::util::{init_tracing, now_ms, Clock, ManualClock, MonotonicClock};

#[test]
fn test_manual_clock_only_moves_when_advanced() {
    let clock = ManualClock::new();
    let start = clock.now();
    assert_eq!(clock.now(), start);

    let shared = clock.clone();
    shared.advance(Duration::from_millis(250));
    assert_eq!(clock.now().duration_since(start), Duration::from_millis(250));
}

#[test]
fn test_monotonic_clock_and_wall_time() {
    let clock = MonotonicClock;
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
    assert!(now_ms() > 0);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
}
