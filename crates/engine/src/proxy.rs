//! Proxy engine: active maximum-bid intents and the counter-bid policy.
//!
//! A [`ProxyBook`] is owned by its auction's lane, so mutation is already
//! serialized; the book itself is plain in-memory state. `counter` is the
//! whole policy: given the price that just changed, decide which intent (if
//! any) fires next and at what amount.

use chrono::Utc;
use common::model::ProxyIntent;
use common::money::round_money;
use rust_decimal::Decimal;

/// An automatic bid the book wants enqueued on the lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterBid {
    pub intent_id: i64,
    pub bidder_id: i64,
    pub amount: Decimal,
}

/// Active proxy intents for one auction.
#[derive(Debug, Default)]
pub struct ProxyBook {
    intents: Vec<ProxyIntent>,
}

impl ProxyBook {
    pub fn new(intents: Vec<ProxyIntent>) -> Self {
        Self {
            intents: intents.into_iter().filter(|p| p.active).collect(),
        }
    }

    /// Insert or replace the intent for its (auction, bidder) pair.
    pub fn upsert(&mut self, intent: ProxyIntent) {
        if let Some(existing) = self
            .intents
            .iter_mut()
            .find(|p| p.bidder_id == intent.bidder_id)
        {
            *existing = intent;
        } else {
            self.intents.push(intent);
        }
    }

    pub fn deactivate(&mut self, bidder_id: i64) {
        self.intents.retain(|p| p.bidder_id != bidder_id);
    }

    pub fn clear(&mut self) {
        self.intents.clear();
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Record the highest amount actually bid on behalf of an intent.
    pub fn record_current(&mut self, intent_id: i64, amount: Decimal) {
        if let Some(intent) = self.intents.iter_mut().find(|p| p.id == intent_id) {
            intent.current_amount = amount;
            intent.updated_at = Utc::now();
        }
    }

    /// Compute the next automatic bid after a price change.
    ///
    /// * `price` — the price that just committed.
    /// * `last_bidder` — current leader; an intent held by the leader never
    ///   fires (it would bid against itself and trip the consecutive rule).
    /// * `trigger` — the bidder whose action caused this evaluation; `None`
    ///   when evaluating at set-intent time.
    /// * `increment` — the proxy increment at the current telemetry.
    ///
    /// With a single qualifying intent the counter is the minimum step above
    /// `price`. With rivals, the top intent outbids the runner-up's maximum
    /// by one increment, capped at its own maximum. Ties on `max_amount`
    /// break toward the earliest-created intent.
    pub fn counter(
        &self,
        price: Decimal,
        last_bidder: Option<i64>,
        trigger: Option<i64>,
        increment: Decimal,
    ) -> Option<CounterBid> {
        let mut eligible: Vec<&ProxyIntent> = self
            .intents
            .iter()
            .filter(|p| p.max_amount > price && Some(p.bidder_id) != trigger)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by(|a, b| {
            b.max_amount
                .cmp(&a.max_amount)
                .then(a.created_at.cmp(&b.created_at))
        });

        let top = eligible[0];
        if Some(top.bidder_id) == last_bidder {
            return None;
        }

        let floor = price + increment;
        let counter = if eligible.len() == 1 {
            floor
        } else {
            let second = eligible[1];
            (second.max_amount + increment)
                .min(top.max_amount)
                .max(floor)
        };

        if counter > top.max_amount {
            return None;
        }

        Some(CounterBid {
            intent_id: top.id,
            bidder_id: top.bidder_id,
            amount: round_money(counter),
        })
    }
}
