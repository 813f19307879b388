//! Core domain types: users, auctions, bids, proxy intents, rejections.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error for parsing a persisted enum column back into its Rust type.
#[derive(Debug, Error)]
#[error("unrecognized {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// User role. Created and mutated only by the auth collaborator; the engine
/// reads it to gate seller-only operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Bidder,
    Seller,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Bidder => "bidder",
            Role::Seller => "seller",
            Role::Admin => "admin",
        }
    }

    /// Whether this role may create auctions.
    pub fn can_sell(&self) -> bool {
        matches!(self, Role::Seller | Role::Admin)
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bidder" => Ok(Role::Bidder),
            "seller" => Ok(Role::Seller),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered user, immutable for the engine's purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Auction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Upcoming,
    Live,
    Closed,
    Cancelled,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Upcoming => "upcoming",
            AuctionStatus::Live => "live",
            AuctionStatus::Closed => "closed",
            AuctionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further bids, ever.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuctionStatus::Closed | AuctionStatus::Cancelled)
    }
}

impl FromStr for AuctionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(AuctionStatus::Upcoming),
            "live" => Ok(AuctionStatus::Live),
            "closed" => Ok(AuctionStatus::Closed),
            "cancelled" => Ok(AuctionStatus::Cancelled),
            other => Err(UnknownVariant {
                kind: "auction status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An auction row. `current_price` equals `starting_price` until the first
/// bid commits and never decreases afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub id: i64,
    pub seller_id: i64,
    pub category_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub starting_price: Decimal,
    pub current_price: Decimal,
    pub reserve_price: Option<Decimal>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AuctionStatus,
    pub total_bid_count: i64,
    pub winner_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Auction {
    /// Seconds until `end_time`, floored at zero.
    pub fn time_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }
}

/// How a bid entered the system.
///
/// `Proxy` marks a counter-bid reacting to a specific manual bid; `Automatic`
/// marks a step-up evaluated at set-intent time. The distinction is
/// informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidKind {
    Manual,
    Proxy,
    Automatic,
}

impl BidKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidKind::Manual => "manual",
            BidKind::Proxy => "proxy",
            BidKind::Automatic => "automatic",
        }
    }

    /// Counter-bids placed on behalf of a proxy intent.
    pub fn is_auto(&self) -> bool {
        matches!(self, BidKind::Proxy | BidKind::Automatic)
    }
}

impl FromStr for BidKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BidKind::Manual),
            "proxy" => Ok(BidKind::Proxy),
            "automatic" => Ok(BidKind::Automatic),
            other => Err(UnknownVariant {
                kind: "bid kind",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed bid. At most one bid per auction carries `winning = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: i64,
    pub auction_id: i64,
    pub bidder_id: i64,
    pub amount: Decimal,
    pub kind: BidKind,
    pub winning: bool,
    pub created_at: DateTime<Utc>,
}

/// A standing instruction authorising automatic bids up to `max_amount`.
///
/// At most one active intent per (auction, bidder); `current_amount` tracks
/// the highest amount actually bid on behalf of this intent so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyIntent {
    pub id: i64,
    pub auction_id: i64,
    pub bidder_id: i64,
    pub max_amount: Decimal,
    pub current_amount: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stable rejection codes surfaced to clients. The wire representation of
/// these strings is a compatibility contract; do not rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AuthFailed,
    NotLive,
    SellerSelfBid,
    Consecutive,
    BelowMinimum,
    StorageFailure,
    NotFound,
    Forbidden,
    InvalidAmount,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AuthFailed => "auth_failed",
            RejectReason::NotLive => "not_live",
            RejectReason::SellerSelfBid => "seller_self_bid",
            RejectReason::Consecutive => "consecutive",
            RejectReason::BelowMinimum => "below_minimum",
            RejectReason::StorageFailure => "storage_failure",
            RejectReason::NotFound => "not_found",
            RejectReason::Forbidden => "forbidden",
            RejectReason::InvalidAmount => "invalid_amount",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed rejection returned synchronously to the originating command.
///
/// `minimum` is populated for `below_minimum` so clients can retry without
/// another round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub minimum: Option<Decimal>,
}

impl Rejection {
    pub fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            minimum: None,
        }
    }

    pub fn below_minimum(minimum: Decimal) -> Self {
        Self {
            reason: RejectReason::BelowMinimum,
            minimum: Some(minimum),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minimum {
            Some(min) => write!(f, "{} (minimum {})", self.reason, min),
            None => f.write_str(self.reason.as_str()),
        }
    }
}
