//! Edge decay guard: a market whose realised edge under-delivers is
//! disabled on its own; healthy markets keep trading.

use rust_decimal_macros::dec;

use arb_bot::edge_decay::{EdgeDecayGuard, RoundTripTracker};

#[test]
fn underdelivering_market_disabled_after_min_trades() {
    let mut guard = EdgeDecayGuard::new(30, dec!(0.5), 15);

    // 40 round trips at a realised/predicted ratio of 0.3 on m1, while m2
    // delivers what it promised.
    for _ in 0..40 {
        guard.record("m1", dec!(0.02), dec!(0.006));
        guard.record("m2", dec!(0.02), dec!(0.019));
    }

    assert_eq!(guard.quality("m1"), Some(dec!(0.3)));
    assert!(guard.should_disable("m1"));
    assert!(!guard.should_disable("m2"));
}

#[test]
fn disable_fires_only_once_samples_suffice() {
    let mut guard = EdgeDecayGuard::new(30, dec!(0.5), 15);
    for i in 0..14 {
        guard.record("m1", dec!(0.02), dec!(0.006));
        assert!(!guard.should_disable("m1"), "sample {i} should not trip");
    }
    guard.record("m1", dec!(0.02), dec!(0.006));
    assert!(guard.should_disable("m1"));
}

#[test]
fn round_trips_feed_guard_through_tracker() {
    let mut guard = EdgeDecayGuard::new(30, dec!(0.5), 3);
    let mut tracker = RoundTripTracker::new();

    for i in 0..3 {
        let corr = format!("arb-{i}");
        tracker.register_leg(&corr, "m1", "tok-y", dec!(0.02), 2);
        tracker.register_leg(&corr, "m1", "tok-n", dec!(0.02), 2);
        // Paying up on both legs erodes nearly the whole edge.
        tracker.record_fill(&corr, "tok-y", dec!(0.487), dec!(100), dec!(0));
        tracker.record_fill(&corr, "tok-n", dec!(0.507), dec!(100), dec!(0));
        tracker.close_leg(&corr, "tok-y");
        let result = tracker.close_leg(&corr, "tok-n").unwrap();
        assert_eq!(result.realized, dec!(0.006));
        guard.record(&result.market_id, result.predicted, result.realized);
    }

    assert_eq!(guard.quality("m1"), Some(dec!(0.3)));
    assert!(guard.should_disable("m1"));
}

#[test]
fn reenabling_resets_history() {
    let mut guard = EdgeDecayGuard::new(30, dec!(0.5), 5);
    for _ in 0..10 {
        guard.record("m1", dec!(0.02), dec!(0.001));
    }
    assert!(guard.should_disable("m1"));
    // The `markets on` path clears the ring so the market gets a fresh
    // verdict instead of being instantly re-disabled.
    guard.reset("m1");
    assert!(!guard.should_disable("m1"));
}
