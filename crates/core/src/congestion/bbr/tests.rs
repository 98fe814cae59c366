use std::time::Duration;

use super::*;
use crate::congestion::CongestionControl;
use crate::simulation::VirtualTime;

fn controller(gain: f64, time: &VirtualTime) -> BbrController<VirtualTime> {
    let config = BbrConfig {
        cwnd_gain: gain,
        ..Default::default()
    };
    BbrController::new_with_time_source(config, 1, 10_000, time.clone())
}

#[test]
fn grows_by_one_without_rtt_sample() {
    let time = VirtualTime::new();
    let bbr = controller(2.0, &time);
    for _ in 0..4 {
        time.advance(Duration::from_millis(10));
        bbr.on_round_success();
    }
    assert_eq!(bbr.window(), 5);
    assert!(bbr.min_rtt().is_none());
}

#[test]
fn unit_gain_sets_window_to_bdp() {
    let time = VirtualTime::new();
    let bbr = controller(1.0, &time);

    // One round delivered over 100ms is 10 rounds/s; with a 500ms min RTT
    // the BDP is 5 rounds.
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.max_bw(), 10.0);
    assert_eq!(bbr.window(), 5);

    // Same rate again: target equals the window, nothing changes.
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.window(), 5);
}

#[test]
fn default_config_sizes_window_to_bdp() {
    let time = VirtualTime::new();
    let bbr = BbrController::new_with_time_source(BbrConfig::default(), 1, 10_000, time.clone());
    // 10 rounds/s × 500ms = 5
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.window(), 5);
    assert_eq!(bbr.target_window(), Some(5));
}

#[test]
fn higher_gain_scales_bdp() {
    let time = VirtualTime::new();
    let bbr = controller(2.0, &time);
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.window(), 10);
}

#[test]
fn window_never_shrinks_on_success() {
    let time = VirtualTime::new();
    let bbr = controller(1.0, &time);
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.window(), 5);

    // A much slower sample lowers nothing: the filter keeps the max and the
    // window only ever rises to the target.
    time.advance(Duration::from_secs(2));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.window(), 5);
}

#[test]
fn timeout_halves_and_discards_bandwidth() {
    let time = VirtualTime::new();
    let bbr = controller(2.0, &time);
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(500));
    assert_eq!(bbr.window(), 10);

    bbr.on_round_timeout();
    assert_eq!(bbr.window(), 5);
    assert_eq!(bbr.max_bw(), 0.0);
    assert_eq!(bbr.min_rtt(), Some(Duration::from_millis(500)));

    let stats = bbr.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.peak_window, 10);
}

#[test]
fn repeated_timeouts_keep_window_at_one() {
    let time = VirtualTime::new();
    let bbr = controller(2.0, &time);
    for _ in 0..10 {
        bbr.on_round_timeout();
        assert_eq!(bbr.window(), 1);
    }
}

#[test]
fn zero_interval_successes_accumulate() {
    let time = VirtualTime::new();
    let bbr = controller(1.0, &time);
    time.advance(Duration::from_millis(100));
    bbr.on_round_success_with_rtt(Duration::from_millis(1000));
    // 10 rounds/s × 1s = 10
    assert_eq!(bbr.window(), 10);

    // Three deliveries at the same instant are folded into the next sample.
    bbr.on_round_success();
    bbr.on_round_success();
    bbr.on_round_success();
    time.advance(Duration::from_millis(100));
    bbr.on_round_success();
    // 4 rounds over 100ms = 40 rounds/s × 1s
    assert_eq!(bbr.window(), 40);
}
