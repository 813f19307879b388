//! Pricing policy: pure functions over auction telemetry.
//!
//! Everything here is deterministic given its inputs and CPU-only; lanes call
//! these between suspension points. Telemetry timestamps are commit-clock
//! stamps carried on the recent-bid series.

use chrono::{DateTime, Duration, Utc};
use common::money::{round_money, round_to_step};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;

/// Lower clamp for the dynamic increment, in price units.
pub const MIN_INCREMENT: Decimal = dec!(1.00);
/// Upper clamp for the dynamic increment, in price units.
pub const MAX_INCREMENT: Decimal = dec!(500.00);

const BASE_INCREMENT: Decimal = dec!(5.00);

/// Window feeding the velocity factor.
const VELOCITY_WINDOW_MINUTES: i64 = 10;
/// Bids considered by the competition factor and the final-price projection.
const COMPETITION_WINDOW: usize = 20;
const PREDICTION_WINDOW: usize = 10;

/// One committed bid as the policy sees it.
#[derive(Debug, Clone)]
pub struct BidPoint {
    pub amount: Decimal,
    pub bidder_id: i64,
    pub at: DateTime<Utc>,
}

/// Inputs to the policy functions for one auction at one instant.
#[derive(Debug, Clone)]
pub struct Telemetry<'a> {
    pub starting_price: Decimal,
    pub current_price: Decimal,
    pub total_bids: i64,
    pub now: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Recent committed bids, oldest first. Callers supply up to the last 20.
    pub recent: &'a [BidPoint],
}

impl Telemetry<'_> {
    /// Whole minutes until the end of the auction, floored at zero.
    pub fn minutes_remaining(&self) -> i64 {
        (self.end_time - self.now).num_minutes().max(0)
    }
}

/// The minimum step above the current price for a manual bid.
///
/// Base 5.00 scaled by price-jump, velocity, time-pressure, and competition
/// factors, clamped to [1.00, 500.00], then rounded to the step meaningful
/// at the current price band.
pub fn bid_increment(t: &Telemetry<'_>) -> Decimal {
    let raw = BASE_INCREMENT
        * price_jump_factor(t.starting_price, t.current_price)
        * velocity_factor(t.recent, t.now)
        * time_pressure_factor(t.minutes_remaining())
        * competition_factor(t.recent);
    let clamped = raw.clamp(MIN_INCREMENT, MAX_INCREMENT);
    round_to_step(clamped, price_step(t.current_price))
}

/// The conservative increment used for automatic counter-bids:
/// `max(1.00, 0.7 × bid_increment)`, rounded to whole price units.
pub fn proxy_increment(t: &Telemetry<'_>) -> Decimal {
    let conservative = (bid_increment(t) * dec!(0.7)).max(MIN_INCREMENT);
    round_to_step(conservative, dec!(1))
}

/// Lowest amount the next manual bid can carry.
pub fn suggested_next_bid(t: &Telemetry<'_>) -> Decimal {
    round_money(t.current_price + bid_increment(t))
}

/// Project the closing price from the last up-to-10 bids' cadence.
///
/// Average inter-arrival time and average per-bid increment extrapolated over
/// the remaining window with a 0.8 decay. With fewer than 3 bids there is no
/// cadence to read, so fall back to `1.2 × current_price`.
pub fn predicted_final_price(t: &Telemetry<'_>) -> Decimal {
    let tail_start = t.recent.len().saturating_sub(PREDICTION_WINDOW);
    let tail = &t.recent[tail_start..];
    if tail.len() < 3 {
        return round_money(t.current_price * dec!(1.2));
    }

    let first = &tail[0];
    let last = &tail[tail.len() - 1];
    let spans = Decimal::from(tail.len() as i64 - 1);
    let span_seconds = (last.at - first.at).num_seconds();
    if span_seconds <= 0 {
        return round_money(t.current_price * dec!(1.2));
    }

    let avg_gap_seconds = Decimal::from(span_seconds) / spans;
    let avg_increment = (last.amount - first.amount) / spans;
    let remaining_seconds = Decimal::from((t.end_time - t.now).num_seconds().max(0));
    let projected_bids = remaining_seconds / avg_gap_seconds;

    let predicted = t.current_price + avg_increment * projected_bids * dec!(0.8);
    round_money(predicted.max(t.current_price))
}

fn price_jump_factor(starting: Decimal, current: Decimal) -> Decimal {
    if starting <= Decimal::ZERO {
        return dec!(1.0);
    }
    let ratio = current / starting;
    if ratio <= dec!(1.5) {
        dec!(1.0)
    } else if ratio <= dec!(2.0) {
        dec!(1.5)
    } else if ratio <= dec!(3.0) {
        dec!(2.0)
    } else if ratio <= dec!(5.0) {
        dec!(3.0)
    } else {
        dec!(4.0)
    }
}

fn velocity_factor(recent: &[BidPoint], now: DateTime<Utc>) -> Decimal {
    let cutoff = now - Duration::minutes(VELOCITY_WINDOW_MINUTES);
    let in_window = recent.iter().filter(|b| b.at >= cutoff).count();
    let per_minute = Decimal::from(in_window as i64) / Decimal::from(VELOCITY_WINDOW_MINUTES);
    if per_minute < dec!(0.5) {
        dec!(1.0)
    } else if per_minute < dec!(1.0) {
        dec!(1.2)
    } else if per_minute < dec!(2.0) {
        dec!(1.5)
    } else if per_minute < dec!(5.0) {
        dec!(2.0)
    } else {
        dec!(3.0)
    }
}

fn time_pressure_factor(minutes_remaining: i64) -> Decimal {
    if minutes_remaining > 60 {
        dec!(1.0)
    } else if minutes_remaining > 30 {
        dec!(1.1)
    } else if minutes_remaining > 15 {
        dec!(1.3)
    } else if minutes_remaining > 5 {
        dec!(1.5)
    } else if minutes_remaining > 1 {
        dec!(2.0)
    } else {
        dec!(3.0)
    }
}

fn competition_factor(recent: &[BidPoint]) -> Decimal {
    let tail_start = recent.len().saturating_sub(COMPETITION_WINDOW);
    let distinct: HashSet<i64> = recent[tail_start..].iter().map(|b| b.bidder_id).collect();
    if distinct.len() <= 2 {
        dec!(1.0)
    } else if distinct.len() <= 4 {
        dec!(1.2)
    } else if distinct.len() <= 6 {
        dec!(1.4)
    } else if distinct.len() <= 10 {
        dec!(1.6)
    } else {
        dec!(2.0)
    }
}

/// Rounding step meaningful at the given price.
fn price_step(current: Decimal) -> Decimal {
    if current < dec!(100) {
        dec!(1)
    } else if current < dec!(500) {
        dec!(5)
    } else if current < dec!(1000) {
        dec!(10)
    } else if current < dec!(5000) {
        dec!(25)
    } else {
        dec!(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_telemetry<'a>(
        starting: Decimal,
        current: Decimal,
        minutes_remaining: i64,
        recent: &'a [BidPoint],
    ) -> Telemetry<'a> {
        let now: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        Telemetry {
            starting_price: starting,
            current_price: current,
            total_bids: recent.len() as i64,
            now,
            end_time: now + Duration::minutes(minutes_remaining),
            recent,
        }
    }

    fn make_points(specs: &[(i64, Decimal, i64)]) -> Vec<BidPoint> {
        // (bidder, amount, seconds before "now")
        let now: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        specs
            .iter()
            .map(|(bidder, amount, ago)| BidPoint {
                amount: *amount,
                bidder_id: *bidder,
                at: now - Duration::seconds(*ago),
            })
            .collect()
    }

    #[test]
    fn test_quiet_auction_base_increment() {
        // No velocity, no pressure, no competition: base 5.00 survives.
        let points = make_points(&[(1, dec!(110.00), 3600)]);
        let t = make_telemetry(dec!(100.00), dec!(110.00), 120, &points);
        assert_eq!(bid_increment(&t), dec!(5.00));
        assert_eq!(suggested_next_bid(&t), dec!(115.00));
    }

    #[test]
    fn test_proxy_increment_rounds_to_whole_units() {
        let points = make_points(&[]);
        let t = make_telemetry(dec!(100.00), dec!(100.00), 120, &points);
        // 0.7 × 5.00 = 3.50 → rounds to 4.
        assert_eq!(bid_increment(&t), dec!(5.00));
        assert_eq!(proxy_increment(&t), dec!(4.00));
    }

    #[test]
    fn test_proxy_increment_floor() {
        let points = make_points(&[]);
        let t = make_telemetry(dec!(10.00), dec!(10.00), 120, &points);
        // Increment clamps low but proxy floor stays at 1.00.
        assert!(proxy_increment(&t) >= dec!(1.00));
    }

    #[test]
    fn test_price_jump_bands() {
        let points = make_points(&[]);
        for (current, factor_times_base) in [
            (dec!(100.00), dec!(5.00)),  // ratio 1.0 → ×1.0, step 5
            (dec!(180.00), dec!(10.00)), // ratio 1.8 → ×1.5 = 7.5 → step 5 → 10
            (dec!(290.00), dec!(10.00)), // ratio 2.9 → ×2.0
            (dec!(450.00), dec!(15.00)), // ratio 4.5 → ×3.0
            (dec!(600.00), dec!(20.00)), // ratio 6.0 → ×4.0, step 10
        ] {
            let t = make_telemetry(dec!(100.00), current, 120, &points);
            assert_eq!(bid_increment(&t), factor_times_base, "current {current}");
        }
    }

    #[test]
    fn test_velocity_bands() {
        // 12 bids in the last 10 minutes from two bidders → 1.2/min → ×1.5.
        let specs: Vec<(i64, Decimal, i64)> = (0..12i64)
            .map(|i| (i % 2, dec!(150.00), i * 30))
            .collect();
        let points = make_points(&specs);
        let t = make_telemetry(dec!(140.00), dec!(150.00), 120, &points);
        assert_eq!(bid_increment(&t), dec!(10.00)); // 5 × 1.5 = 7.5 → step 5 → 10
    }

    #[test]
    fn test_time_pressure_bands() {
        let points = make_points(&[]);
        for (minutes, expected) in [
            (90i64, dec!(5.00)),  // ×1.0
            (45, dec!(6.00)),     // ×1.1 = 5.5 → step 1 (price < 100) → 6
            (20, dec!(7.00)),     // ×1.3 = 6.5 → 7
            (10, dec!(8.00)),     // ×1.5 = 7.5 → 8
            (3, dec!(10.00)),     // ×2.0
            (0, dec!(15.00)),     // ×3.0
        ] {
            let t = make_telemetry(dec!(90.00), dec!(90.00), minutes, &points);
            assert_eq!(bid_increment(&t), expected, "minutes {minutes}");
        }
    }

    #[test]
    fn test_competition_bands() {
        // Six distinct bidders in the last 20 bids → ×1.4.
        let specs: Vec<(i64, Decimal, i64)> = (0..6i64)
            .map(|i| (i, dec!(200.00), 3600 + i))
            .collect();
        let points = make_points(&specs);
        let t = make_telemetry(dec!(190.00), dec!(200.00), 120, &points);
        assert_eq!(bid_increment(&t), dec!(5.00)); // 5 × 1.4 = 7 → step 5 → 5
    }

    #[test]
    fn test_increment_upper_range() {
        // Every factor maxed: 5 × 4 × 3 × 3 × 2 = 360 → step 50 → 350,
        // comfortably inside the 500 clamp.
        let specs: Vec<(i64, Decimal, i64)> = (0..60i64)
            .map(|i| (i, dec!(90000.00), i * 5))
            .collect();
        let points = make_points(&specs);
        let t = make_telemetry(dec!(100.00), dec!(90000.00), 0, &points);
        let increment = bid_increment(&t);
        assert_eq!(increment, dec!(350.00));
        assert!(increment <= MAX_INCREMENT);
    }

    #[test]
    fn test_predicted_final_price_fallback() {
        let points = make_points(&[(1, dec!(110.00), 60), (2, dec!(120.00), 30)]);
        let t = make_telemetry(dec!(100.00), dec!(120.00), 60, &points);
        assert_eq!(predicted_final_price(&t), dec!(144.00)); // 1.2 × 120
    }

    #[test]
    fn test_predicted_final_price_projection() {
        // 5 bids 60s apart climbing 10 each; 10 minutes remaining.
        let specs: Vec<(i64, Decimal, i64)> = (0..5i64)
            .map(|i| (i % 2, dec!(100.00) + Decimal::from(10 * i), (4 - i) * 60))
            .collect();
        let points = make_points(&specs);
        let t = make_telemetry(dec!(100.00), dec!(140.00), 10, &points);
        // avg gap 60 s, avg increment 10, 600 s remaining → 10 projected bids.
        // 140 + 10 × 10 × 0.8 = 220.
        assert_eq!(predicted_final_price(&t), dec!(220.00));
    }

    #[test]
    fn test_predicted_never_below_current() {
        // Falling amounts would project downwards; result floors at current.
        let specs: Vec<(i64, Decimal, i64)> = (0..5i64)
            .map(|i| (i % 2, dec!(200.00) - Decimal::from(10 * i), (4 - i) * 60))
            .collect();
        let points = make_points(&specs);
        let t = make_telemetry(dec!(100.00), dec!(200.00), 10, &points);
        assert_eq!(predicted_final_price(&t), dec!(200.00));
    }
}
