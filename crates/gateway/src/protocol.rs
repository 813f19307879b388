//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication. Tag
//! values are snake_case, field names camelCase. Broadcast events
//! (`new_bid`, `auction_transition`, `auction_ended`, `you_won`,
//! `peer_joined`, `peer_left`) are serialized by the engine's broadcast hub
//! and forwarded verbatim; this module covers the remaining directed
//! messages.
//!
//! Amounts travel as decimal strings to keep binary floating-point off the
//! wire; the deserializer also accepts plain JSON numbers.

use chrono::{DateTime, Utc};
use common::model::{AuctionStatus, BidKind, RejectReason};
use engine::{AuctionView, BidSummary};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
///
/// `Authenticate` must be the first frame on a fresh connection; the five
/// remaining commands are available after the handshake and carry the
/// verified identity implicitly — a client cannot spoof another user by
/// field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinAuction { auction_id: i64 },
    #[serde(rename_all = "camelCase")]
    LeaveAuction { auction_id: i64 },
    #[serde(rename_all = "camelCase")]
    PlaceBid { auction_id: i64, amount: Decimal },
    #[serde(rename_all = "camelCase")]
    SetProxy { auction_id: i64, max_amount: Decimal },
    #[serde(rename_all = "camelCase")]
    CancelProxy { auction_id: i64 },
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Directed message sent from server to a single client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Authenticated { user_id: i64, username: String },
    AuctionState(AuctionStateData),
    #[serde(rename_all = "camelCase")]
    BidHistorySnapshot {
        auction_id: i64,
        /// Sequence number of the newest event covered by the snapshot;
        /// subsequent `new_bid` events continue at `lastSeq + 1`.
        last_seq: u64,
        /// Oldest first.
        bids: Vec<BidHistoryEntry>,
    },
    #[serde(rename_all = "camelCase")]
    BidRejected {
        auction_id: i64,
        reason: RejectReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum_bid: Option<Decimal>,
    },
    #[serde(rename_all = "camelCase")]
    ProxySet { auction_id: i64, max_amount: Decimal },
    #[serde(rename_all = "camelCase")]
    ProxyCancelled { auction_id: i64 },
    #[serde(rename_all = "camelCase")]
    ProxyRejected {
        auction_id: i64,
        reason: RejectReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum: Option<Decimal>,
    },
    Error { message: String },
}

/// Auction snapshot sent on every `join_auction`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionStateData {
    pub auction_id: i64,
    pub seller_id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub status: AuctionStatus,
    pub starting_price: Decimal,
    pub current_price: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub time_remaining_seconds: i64,
    pub total_bids: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<i64>,
    pub next_increment: Decimal,
    pub suggested_bid: Decimal,
    pub predicted_final_price: Decimal,
}

impl From<&AuctionView> for AuctionStateData {
    fn from(view: &AuctionView) -> Self {
        Self {
            auction_id: view.auction.id,
            seller_id: view.auction.seller_id,
            title: view.auction.title.clone(),
            description: view.auction.description.clone(),
            image_url: view.auction.image_url.clone(),
            status: view.auction.status,
            starting_price: view.auction.starting_price,
            current_price: view.auction.current_price,
            start_time: view.auction.start_time,
            end_time: view.auction.end_time,
            time_remaining_seconds: view.time_remaining_seconds,
            total_bids: view.auction.total_bid_count,
            winner_id: view.auction.winner_id,
            next_increment: view.next_increment,
            suggested_bid: view.suggested_bid,
            predicted_final_price: view.predicted_final_price,
        }
    }
}

/// One bid inside a history snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidHistoryEntry {
    pub bid_id: i64,
    pub bidder_id: i64,
    pub bidder_username: String,
    pub amount: Decimal,
    pub kind: BidKind,
    pub timestamp: DateTime<Utc>,
}

impl From<&BidSummary> for BidHistoryEntry {
    fn from(bid: &BidSummary) -> Self {
        Self {
            bid_id: bid.bid_id,
            bidder_id: bid.bidder_id,
            bidder_username: bid.bidder_username.clone(),
            amount: bid.amount,
            kind: bid.kind,
            timestamp: bid.created_at,
        }
    }
}

impl ServerMessage {
    /// Snapshot pair for a fresh join, built from one consistent view.
    pub fn snapshot_pair(view: &AuctionView) -> (ServerMessage, ServerMessage) {
        (
            ServerMessage::AuctionState(AuctionStateData::from(view)),
            ServerMessage::BidHistorySnapshot {
                auction_id: view.auction.id,
                last_seq: view.last_seq,
                bids: view.recent_bids.iter().map(BidHistoryEntry::from).collect(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_place_bid() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"place_bid","auctionId":7,"amount":"115.00"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::PlaceBid { auction_id, amount } => {
                assert_eq!(auction_id, 7);
                assert_eq!(amount, dec!(115.00));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_numeric_amount() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"set_proxy","auctionId":7,"maxAmount":200.5}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SetProxy { max_amount, .. } => {
                assert_eq!(max_amount, dec!(200.5));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_fails() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout","volume":11}"#).is_err());
    }

    #[test]
    fn test_bid_rejected_shape() {
        let msg = ServerMessage::BidRejected {
            auction_id: 7,
            reason: RejectReason::BelowMinimum,
            minimum_bid: Some(dec!(115.00)),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "bid_rejected");
        assert_eq!(json["reason"], "below_minimum");
        assert_eq!(json["minimumBid"], "115.00");
    }

    #[test]
    fn test_bid_rejected_omits_absent_minimum() {
        let msg = ServerMessage::BidRejected {
            auction_id: 7,
            reason: RejectReason::Consecutive,
            minimum_bid: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("minimumBid"));
    }
}
