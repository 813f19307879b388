//! Lifecycle scheduler: wall-clock driven status transitions.
//!
//! One periodic task promotes upcoming auctions to live and funnels closes
//! through the owning lanes. The loop is self-healing: a failed tick logs and
//! the next tick picks the missed transitions back up.

use crate::broadcast::BroadcastHub;
use crate::error::Result;
use crate::events::AuctionEvent;
use crate::registry::AuctionRegistry;
use chrono::{DateTime, Utc};
use common::model::AuctionStatus;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use store::AuctionStore;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Wall-clock transition loop.
pub struct LifecycleScheduler {
    store: Arc<dyn AuctionStore>,
    registry: Arc<AuctionRegistry>,
    hub: BroadcastHub,
    tick: Duration,
}

impl LifecycleScheduler {
    pub fn new(
        store: Arc<dyn AuctionStore>,
        registry: Arc<AuctionRegistry>,
        hub: BroadcastHub,
        tick: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            tick,
        }
    }

    /// Run the scheduler (blocking) until the shutdown channel fires.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("lifecycle scheduler running at {:?} cadence", self.tick);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("lifecycle scheduler received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick_once(Utc::now()).await {
                        error!("lifecycle tick failed: {}", e);
                    }
                }
            }
        }

        info!("lifecycle scheduler stopped");
    }

    /// One pass of both transitions. Public so tests can drive the clock.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<()> {
        for auction in self.store.promote_due(now).await? {
            info!("auction {} is now live", auction.id);
            if let Err(e) = self.registry.ensure_lane(&auction).await {
                warn!("failed to open lane for auction {}: {}", auction.id, e);
            }
            self.hub.publish(
                auction.id,
                AuctionEvent::AuctionTransition {
                    auction_id: auction.id,
                    status: AuctionStatus::Live,
                    seq: 0,
                },
            );
            counter!("engine_auctions_promoted_total").increment(1);
        }

        for auction_id in self.store.due_for_close(now).await? {
            match self.registry.close(auction_id).await {
                Ok(outcome) => {
                    info!(
                        "auction {} closed by scheduler, winner: {:?}",
                        auction_id,
                        outcome.winner.as_ref().map(|b| b.bidder_id)
                    );
                }
                Err(e) => {
                    // Retried on the next tick.
                    warn!("failed to close auction {}: {}", auction_id, e);
                }
            }
        }

        Ok(())
    }
}
