//! Persistence seam for the auction engine.
//!
//! [`AuctionStore`] is the single interface the engine writes through. Two
//! implementations ship: [`postgres::PgStore`] for production and
//! [`memory::MemoryStore`] for tests and local runs without a database.
//!
//! The store is deliberately dumb: business validation (liveness, increments,
//! the consecutive-bid rule) belongs to the per-auction lane. The store's job
//! is atomicity — a bid commit is one transaction that inserts the bid row,
//! flips the winning flag, bumps the auction counters, and appends the audit
//! row, or does none of those.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{Auction, AuctionStatus, Bid, BidKind, ProxyIntent, User};
use rust_decimal::Decimal;

/// Input for a bid commit. `at` is the commit clock stamp assigned by the
/// lane, stored verbatim so telemetry stays deterministic.
#[derive(Debug, Clone)]
pub struct NewBid {
    pub auction_id: i64,
    pub bidder_id: i64,
    pub amount: Decimal,
    pub kind: BidKind,
    pub at: DateTime<Utc>,
}

/// A committed bid together with the refreshed auction bid count.
#[derive(Debug, Clone)]
pub struct CommittedBid {
    pub bid: Bid,
    pub total_bids: i64,
}

/// Input for auction creation. Status is derived from `start_time` at the
/// moment of insertion.
#[derive(Debug, Clone)]
pub struct NewAuction {
    pub seller_id: i64,
    pub category_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub starting_price: Decimal,
    pub reserve_price: Option<Decimal>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl NewAuction {
    /// Status at insertion time: live if the start has passed, else upcoming.
    pub fn initial_status(&self, now: DateTime<Utc>) -> AuctionStatus {
        if self.start_time <= now {
            AuctionStatus::Live
        } else {
            AuctionStatus::Upcoming
        }
    }
}

/// Storage interface the engine writes through.
///
/// All writes for a given auction are funnelled through that auction's lane,
/// so implementations may assume a single logical writer per auction.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    async fn get_auction(&self, id: i64) -> Result<Option<Auction>>;

    async fn create_auction(&self, auction: NewAuction, now: DateTime<Utc>) -> Result<Auction>;

    /// Mark an auction cancelled. Fails with [`StoreError::Conflict`] if the
    /// auction already carries bids or is terminal.
    async fn cancel_auction(&self, id: i64) -> Result<()>;

    /// All auctions currently in `live` status, for restart reconstruction.
    async fn live_auctions(&self) -> Result<Vec<Auction>>;

    /// Promote every upcoming auction whose start has passed; returns the
    /// promoted rows.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<Auction>>;

    /// Identifiers of live auctions whose end has passed.
    async fn due_for_close(&self, now: DateTime<Utc>) -> Result<Vec<i64>>;

    /// Commit a bid in one transaction: clear the previous winning flag,
    /// insert the new winning bid, update the auction's price and bid count,
    /// append the audit row.
    async fn commit_bid(&self, bid: NewBid) -> Result<CommittedBid>;

    /// Most recent bids for an auction, newest first.
    async fn recent_bids(&self, auction_id: i64, limit: i64) -> Result<Vec<Bid>>;

    /// Finalize a close: status, winner, and current price are left as the
    /// lane observed them.
    async fn close_auction(&self, id: i64, winner_id: Option<i64>) -> Result<()>;

    /// Create or update the (auction, bidder) intent in place. An update
    /// keeps the original `created_at` so tie-breaks stay stable.
    async fn upsert_proxy(
        &self,
        auction_id: i64,
        bidder_id: i64,
        max_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ProxyIntent>;

    /// Record the highest amount bid on behalf of an intent.
    async fn set_proxy_current(&self, intent_id: i64, current_amount: Decimal) -> Result<()>;

    async fn deactivate_proxy(&self, auction_id: i64, bidder_id: i64) -> Result<()>;

    /// Deactivate every intent for an auction (at close or cancellation).
    async fn deactivate_auction_proxies(&self, auction_id: i64) -> Result<()>;

    async fn active_proxies(&self, auction_id: i64) -> Result<Vec<ProxyIntent>>;
}
