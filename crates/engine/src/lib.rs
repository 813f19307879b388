//! The auction engine core.
//!
//! Authoritatively serializes bids against live auctions, drives automatic
//! (proxy) bidding, computes dynamic increments, manages lifecycle
//! transitions, and fans out ordered events to every subscriber.
//!
//! Structure:
//! - [`registry`] — runtime index of live auctions and their lanes
//! - [`lane`] — per-auction single-writer serialization
//! - [`proxy`] — maximum-bid intents and the counter-bid policy
//! - [`pricing`] — pure policy functions over telemetry
//! - [`lifecycle`] — wall-clock transition loop
//! - [`broadcast`] — per-auction subscriber sets with ordered fan-out

pub mod broadcast;
pub mod error;
pub mod events;
pub mod lane;
pub mod lifecycle;
pub mod pricing;
pub mod proxy;
pub mod registry;

pub use broadcast::{BroadcastHub, ConnectionId};
pub use error::{EngineError, Result};
pub use events::AuctionEvent;
pub use lane::{AuctionView, BidReceipt, BidSummary, CloseOutcome, LaneHandle, ProxyReceipt};
pub use lifecycle::LifecycleScheduler;
pub use registry::AuctionRegistry;

use std::time::Duration;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Depth of each lane's bounded command queue; arrivals beyond it apply
    /// back-pressure to the gateway.
    pub lane_buffer: usize,
    /// Recent bids retained per lane for telemetry and snapshots.
    pub recent_bids: usize,
    /// Lifecycle scheduler cadence.
    pub scheduler_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lane_buffer: 64,
            recent_bids: 20,
            scheduler_tick: Duration::from_secs(1),
        }
    }
}
