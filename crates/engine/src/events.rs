//! Broadcast event types.
//!
//! These serialize directly onto the wire: the broadcast hub serializes each
//! event once and fans the JSON out to every subscriber, so the shapes here
//! are part of the client protocol. Tag values and field names are a
//! compatibility contract.

use chrono::{DateTime, Utc};
use common::model::{AuctionStatus, BidKind};
use rust_decimal::Decimal;
use serde::Serialize;

/// An event produced by a lane or the lifecycle scheduler and fanned out to
/// an auction's subscriber set.
///
/// `seq` is assigned by the hub at publish time: a monotone per-auction
/// counter clients use to detect gaps. `YouWon` is user-directed rather than
/// auction-broadcast and carries no sequence number.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuctionEvent {
    #[serde(rename_all = "camelCase")]
    NewBid {
        auction_id: i64,
        bid_id: i64,
        amount: Decimal,
        bidder_id: i64,
        bidder_username: String,
        kind: BidKind,
        seq: u64,
        timestamp: DateTime<Utc>,
        total_bids: i64,
    },
    #[serde(rename_all = "camelCase")]
    AuctionTransition {
        auction_id: i64,
        status: AuctionStatus,
        seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    AuctionEnded {
        auction_id: i64,
        winner_id: Option<i64>,
        winner_username: Option<String>,
        amount: Option<Decimal>,
        seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    YouWon { auction_id: i64, amount: Decimal },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        auction_id: i64,
        user_id: i64,
        username: String,
        seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        auction_id: i64,
        user_id: i64,
        username: String,
        seq: u64,
    },
}

impl AuctionEvent {
    /// Hub hook: stamp the per-auction sequence number at publish time.
    pub(crate) fn set_seq(&mut self, value: u64) {
        match self {
            AuctionEvent::NewBid { seq, .. }
            | AuctionEvent::AuctionTransition { seq, .. }
            | AuctionEvent::AuctionEnded { seq, .. }
            | AuctionEvent::PeerJoined { seq, .. }
            | AuctionEvent::PeerLeft { seq, .. } => *seq = value,
            AuctionEvent::YouWon { .. } => {}
        }
    }

    /// Sequence number, if this event kind carries one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            AuctionEvent::NewBid { seq, .. }
            | AuctionEvent::AuctionTransition { seq, .. }
            | AuctionEvent::AuctionEnded { seq, .. }
            | AuctionEvent::PeerJoined { seq, .. }
            | AuctionEvent::PeerLeft { seq, .. } => Some(*seq),
            AuctionEvent::YouWon { .. } => None,
        }
    }
}
