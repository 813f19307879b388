//! Auction registry: runtime index of live auctions and their lanes.
//!
//! Lanes are populated lazily on first reference, on lifecycle promotion,
//! and on restart reconstruction. Rows for closed auctions are evicted.

use crate::broadcast::BroadcastHub;
use crate::error::{EngineError, Result};
use crate::lane::{AuctionView, BidSummary, CloseOutcome, Lane, LaneHandle};
use crate::pricing::{self, BidPoint, Telemetry};
use crate::EngineConfig;
use chrono::Utc;
use common::model::{Auction, AuctionStatus, RejectReason, Rejection, Role, User};
use dashmap::DashMap;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::Arc;
use store::{AuctionStore, NewAuction, StoreError};
use tracing::{info, warn};

fn storage_rejection(err: StoreError) -> Rejection {
    warn!("storage failure: {}", err);
    Rejection::new(RejectReason::StorageFailure)
}

/// Runtime index of auctions. Cheap to clone via `Arc`.
pub struct AuctionRegistry {
    lanes: DashMap<i64, LaneHandle>,
    store: Arc<dyn AuctionStore>,
    hub: BroadcastHub,
    cfg: EngineConfig,
}

impl AuctionRegistry {
    pub fn new(store: Arc<dyn AuctionStore>, hub: BroadcastHub, cfg: EngineConfig) -> Self {
        Self {
            lanes: DashMap::new(),
            store,
            hub,
            cfg,
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Spawn (or fetch) the lane for a live auction.
    pub async fn ensure_lane(&self, auction: &Auction) -> Result<LaneHandle> {
        if let Some(handle) = self.lanes.get(&auction.id) {
            return Ok(handle.clone());
        }
        let handle = Lane::spawn(
            auction.clone(),
            self.store.clone(),
            self.hub.clone(),
            self.cfg.clone(),
        )
        .await?;
        // Another caller may have raced us; first insert wins, the loser's
        // task exits once its handle drops.
        let handle = self
            .lanes
            .entry(auction.id)
            .or_insert(handle)
            .clone();
        gauge!("engine_live_lanes").set(self.lanes.len() as f64);
        Ok(handle)
    }

    /// Resolve the lane for a bid-path command. Only live auctions have
    /// lanes; everything else rejects here.
    pub async fn lane(&self, auction_id: i64) -> std::result::Result<LaneHandle, Rejection> {
        if let Some(handle) = self.lanes.get(&auction_id) {
            return Ok(handle.clone());
        }
        let auction = self
            .store
            .get_auction(auction_id)
            .await
            .map_err(storage_rejection)?
            .ok_or_else(|| Rejection::new(RejectReason::NotFound))?;
        match auction.status {
            AuctionStatus::Live => self
                .ensure_lane(&auction)
                .await
                .map_err(|_| Rejection::new(RejectReason::StorageFailure)),
            _ => Err(Rejection::new(RejectReason::NotLive)),
        }
    }

    /// A consistent snapshot for `join_auction`: served by the lane when one
    /// is running, otherwise built from the store.
    pub async fn view(&self, auction_id: i64) -> std::result::Result<AuctionView, Rejection> {
        if let Some(handle) = self.lanes.get(&auction_id).map(|h| h.clone()) {
            if let Some(view) = handle.view().await {
                return Ok(view);
            }
        }

        let auction = self
            .store
            .get_auction(auction_id)
            .await
            .map_err(storage_rejection)?
            .ok_or_else(|| Rejection::new(RejectReason::NotFound))?;

        if auction.status == AuctionStatus::Live {
            if let Ok(handle) = self.ensure_lane(&auction).await {
                if let Some(view) = handle.view().await {
                    return Ok(view);
                }
            }
        }

        self.view_from_store(auction).await.map_err(storage_rejection)
    }

    async fn view_from_store(&self, auction: Auction) -> store::Result<AuctionView> {
        let now = Utc::now();
        let rows = self
            .store
            .recent_bids(auction.id, self.cfg.recent_bids as i64)
            .await?;

        let mut usernames: HashMap<i64, String> = HashMap::new();
        let mut recent_bids = Vec::with_capacity(rows.len());
        for bid in rows.iter().rev() {
            if !usernames.contains_key(&bid.bidder_id) {
                let name = match self.store.get_user(bid.bidder_id).await? {
                    Some(user) => user.username,
                    None => format!("user-{}", bid.bidder_id),
                };
                usernames.insert(bid.bidder_id, name);
            }
            recent_bids.push(BidSummary {
                bid_id: bid.id,
                bidder_id: bid.bidder_id,
                bidder_username: usernames[&bid.bidder_id].clone(),
                amount: bid.amount,
                kind: bid.kind,
                created_at: bid.created_at,
            });
        }

        let points: Vec<BidPoint> = recent_bids
            .iter()
            .map(|b| BidPoint {
                amount: b.amount,
                bidder_id: b.bidder_id,
                at: b.created_at,
            })
            .collect();
        let telemetry = Telemetry {
            starting_price: auction.starting_price,
            current_price: auction.current_price,
            total_bids: auction.total_bid_count,
            now,
            end_time: auction.end_time,
            recent: &points,
        };

        Ok(AuctionView {
            time_remaining_seconds: auction.time_remaining_seconds(now),
            next_increment: pricing::bid_increment(&telemetry),
            suggested_bid: pricing::suggested_next_bid(&telemetry),
            predicted_final_price: pricing::predicted_final_price(&telemetry),
            last_seq: self.hub.last_seq(auction.id),
            recent_bids,
            auction,
        })
    }

    /// Funnel a close through the auction's lane, then evict it.
    pub async fn close(&self, auction_id: i64) -> Result<CloseOutcome> {
        let handle = match self.lanes.get(&auction_id).map(|h| h.clone()) {
            Some(handle) => handle,
            None => {
                let auction = self
                    .store
                    .get_auction(auction_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Invalid(format!("auction {} not found", auction_id))
                    })?;
                if auction.status.is_terminal() {
                    return Ok(CloseOutcome {
                        auction_id,
                        winner: None,
                    });
                }
                self.ensure_lane(&auction).await?
            }
        };

        let outcome = handle.close().await?;
        self.evict(auction_id);
        self.hub.drop_channel(auction_id);
        Ok(outcome)
    }

    pub fn evict(&self, auction_id: i64) {
        self.lanes.remove(&auction_id);
        gauge!("engine_live_lanes").set(self.lanes.len() as f64);
    }

    /// Rebuild lanes for every live auction after a restart.
    pub async fn restore(&self) -> Result<usize> {
        let live = self.store.live_auctions().await?;
        let mut restored = 0;
        for auction in &live {
            match self.ensure_lane(auction).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("failed to restore lane for auction {}: {}", auction.id, e),
            }
        }
        info!("restored {} live auction lanes", restored);
        Ok(restored)
    }

    /// Create an auction on behalf of a seller. Status derives from
    /// `start_time`; a lane appears lazily once the auction is live.
    pub async fn create_auction(&self, seller: &User, auction: NewAuction) -> Result<Auction> {
        if !seller.role.can_sell() {
            return Err(EngineError::Invalid("only sellers may create auctions".into()));
        }
        if auction.seller_id != seller.id && seller.role != Role::Admin {
            return Err(EngineError::Invalid("seller mismatch".into()));
        }
        if !common::money::is_valid_amount(auction.starting_price) {
            return Err(EngineError::Invalid("starting price must be positive".into()));
        }
        if auction.end_time <= auction.start_time {
            return Err(EngineError::Invalid("end time must follow start time".into()));
        }
        let now = Utc::now();
        if auction.end_time <= now {
            return Err(EngineError::Invalid("end time already passed".into()));
        }
        let created = self.store.create_auction(auction, now).await?;
        info!(
            "auction {} created by seller {} ({})",
            created.id, created.seller_id, created.status
        );
        Ok(created)
    }

    /// Owner cancellation, serialized through the lane when one is running
    /// so it cannot interleave with an in-flight bid.
    pub async fn cancel_auction(
        &self,
        auction_id: i64,
        requester_id: i64,
        requester_role: Role,
    ) -> std::result::Result<(), Rejection> {
        if let Some(handle) = self.lanes.get(&auction_id).map(|h| h.clone()) {
            let result = handle.cancel(requester_id, requester_role).await;
            if result.is_ok() {
                self.evict(auction_id);
                self.hub.drop_channel(auction_id);
            }
            return result;
        }

        let auction = self
            .store
            .get_auction(auction_id)
            .await
            .map_err(storage_rejection)?
            .ok_or_else(|| Rejection::new(RejectReason::NotFound))?;
        if requester_id != auction.seller_id && requester_role != Role::Admin {
            return Err(Rejection::new(RejectReason::Forbidden));
        }
        if auction.status.is_terminal() {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        if auction.total_bid_count > 0 {
            return Err(Rejection::new(RejectReason::Forbidden));
        }

        self.store.cancel_auction(auction_id).await.map_err(|e| match e {
            StoreError::Conflict(_) => Rejection::new(RejectReason::Forbidden),
            StoreError::NotFound(_) => Rejection::new(RejectReason::NotFound),
            other => storage_rejection(other),
        })?;

        self.hub.publish(
            auction_id,
            crate::events::AuctionEvent::AuctionTransition {
                auction_id,
                status: AuctionStatus::Cancelled,
                seq: 0,
            },
        );
        info!("auction {} cancelled by user {}", auction_id, requester_id);
        Ok(())
    }
}
