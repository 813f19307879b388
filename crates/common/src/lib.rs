//! Shared domain schema for the auction platform.
//!
//! Every crate in the workspace speaks these types: users, auctions, bids,
//! proxy intents, and the stable rejection codes surfaced to clients.

pub mod model;
pub mod money;

pub use model::{
    Auction, AuctionStatus, Bid, BidKind, ProxyIntent, RejectReason, Rejection, Role, User,
};
