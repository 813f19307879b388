//! Per-auction serialization lane.
//!
//! Each live auction owns a single-writer task. Every mutation of that
//! auction — manual bids, automatic counter-bids, proxy intents, close,
//! cancellation — flows through the lane's bounded command channel in strict
//! arrival order, so the price is monotonically non-decreasing on the live
//! timeline and no bid can commit after a close is observed.
//!
//! A reactive counter-bid runs synchronously inside the command that
//! triggered it, so it commits before any queued external bid.

use crate::broadcast::BroadcastHub;
use crate::error::EngineError;
use crate::events::AuctionEvent;
use crate::pricing::{self, BidPoint, Telemetry};
use crate::proxy::ProxyBook;
use crate::EngineConfig;
use chrono::{DateTime, Utc};
use common::model::{
    Auction, AuctionStatus, Bid, BidKind, RejectReason, Rejection, Role,
};
use common::money::{is_valid_amount, round_money};
use metrics::counter;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use store::{AuctionStore, NewBid};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Acknowledgement for an accepted bid.
#[derive(Debug, Clone)]
pub struct BidReceipt {
    pub bid_id: i64,
    pub amount: Decimal,
}

/// Acknowledgement for an accepted proxy intent.
#[derive(Debug, Clone)]
pub struct ProxyReceipt {
    pub max_amount: Decimal,
}

/// Result of funnelling a close through the lane.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub auction_id: i64,
    pub winner: Option<Bid>,
}

/// One bid as remembered by the lane for snapshots and telemetry.
#[derive(Debug, Clone)]
pub struct BidSummary {
    pub bid_id: i64,
    pub bidder_id: i64,
    pub bidder_username: String,
    pub amount: Decimal,
    pub kind: BidKind,
    pub created_at: DateTime<Utc>,
}

/// A consistent read of the auction as of the lane's last commit.
#[derive(Debug, Clone)]
pub struct AuctionView {
    pub auction: Auction,
    pub time_remaining_seconds: i64,
    pub next_increment: Decimal,
    pub suggested_bid: Decimal,
    pub predicted_final_price: Decimal,
    pub last_seq: u64,
    /// Oldest first, at most the configured snapshot depth.
    pub recent_bids: Vec<BidSummary>,
}

pub(crate) enum LaneCommand {
    PlaceBid {
        bidder_id: i64,
        amount: Decimal,
        reply: oneshot::Sender<Result<BidReceipt, Rejection>>,
    },
    SetProxy {
        bidder_id: i64,
        max_amount: Decimal,
        reply: oneshot::Sender<Result<ProxyReceipt, Rejection>>,
    },
    CancelProxy {
        bidder_id: i64,
        reply: oneshot::Sender<Result<(), Rejection>>,
    },
    Cancel {
        requester_id: i64,
        requester_role: Role,
        reply: oneshot::Sender<Result<(), Rejection>>,
    },
    Close {
        reply: oneshot::Sender<Result<CloseOutcome, EngineError>>,
    },
    View {
        reply: oneshot::Sender<AuctionView>,
    },
}

/// Handle to a lane's command channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LaneHandle {
    auction_id: i64,
    tx: mpsc::Sender<LaneCommand>,
}

impl LaneHandle {
    pub fn auction_id(&self) -> i64 {
        self.auction_id
    }

    pub async fn place_bid(&self, bidder_id: i64, amount: Decimal) -> Result<BidReceipt, Rejection> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(LaneCommand::PlaceBid {
                bidder_id,
                amount,
                reply,
            })
            .await
            .is_err()
        {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        rx.await
            .unwrap_or_else(|_| Err(Rejection::new(RejectReason::NotLive)))
    }

    pub async fn set_proxy(
        &self,
        bidder_id: i64,
        max_amount: Decimal,
    ) -> Result<ProxyReceipt, Rejection> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(LaneCommand::SetProxy {
                bidder_id,
                max_amount,
                reply,
            })
            .await
            .is_err()
        {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        rx.await
            .unwrap_or_else(|_| Err(Rejection::new(RejectReason::NotLive)))
    }

    pub async fn cancel_proxy(&self, bidder_id: i64) -> Result<(), Rejection> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(LaneCommand::CancelProxy { bidder_id, reply })
            .await
            .is_err()
        {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        rx.await
            .unwrap_or_else(|_| Err(Rejection::new(RejectReason::NotLive)))
    }

    pub async fn cancel(&self, requester_id: i64, requester_role: Role) -> Result<(), Rejection> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(LaneCommand::Cancel {
                requester_id,
                requester_role,
                reply,
            })
            .await
            .is_err()
        {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        rx.await
            .unwrap_or_else(|_| Err(Rejection::new(RejectReason::NotLive)))
    }

    pub async fn close(&self) -> Result<CloseOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LaneCommand::Close { reply })
            .await
            .map_err(|_| EngineError::LaneClosed)?;
        rx.await.map_err(|_| EngineError::LaneClosed)?
    }

    pub async fn view(&self) -> Option<AuctionView> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(LaneCommand::View { reply }).await.ok()?;
        rx.await.ok()
    }
}

pub(crate) struct Lane {
    auction: Auction,
    last_bidder: Option<i64>,
    winning: Option<Bid>,
    /// Oldest first, capped at the configured depth.
    recent: VecDeque<BidSummary>,
    proxies: ProxyBook,
    quarantined: bool,
    usernames: HashMap<i64, String>,
    store: Arc<dyn AuctionStore>,
    hub: BroadcastHub,
    cfg: EngineConfig,
    rx: mpsc::Receiver<LaneCommand>,
}

impl Lane {
    /// Load the auction's runtime state and start the lane task.
    pub(crate) async fn spawn(
        auction: Auction,
        store: Arc<dyn AuctionStore>,
        hub: BroadcastHub,
        cfg: EngineConfig,
    ) -> store::Result<LaneHandle> {
        let auction_id = auction.id;
        let rows = store
            .recent_bids(auction_id, cfg.recent_bids as i64)
            .await?;
        let winning = rows.iter().find(|b| b.winning).cloned();
        let last_bidder = rows.first().map(|b| b.bidder_id);
        let proxies = ProxyBook::new(store.active_proxies(auction_id).await?);

        let mut usernames = HashMap::new();
        let mut recent = VecDeque::with_capacity(cfg.recent_bids);
        for bid in rows.iter().rev() {
            if !usernames.contains_key(&bid.bidder_id) {
                let name = match store.get_user(bid.bidder_id).await? {
                    Some(user) => user.username,
                    None => format!("user-{}", bid.bidder_id),
                };
                usernames.insert(bid.bidder_id, name);
            }
            let username = usernames[&bid.bidder_id].clone();
            recent.push_back(BidSummary {
                bid_id: bid.id,
                bidder_id: bid.bidder_id,
                bidder_username: username,
                amount: bid.amount,
                kind: bid.kind,
                created_at: bid.created_at,
            });
        }

        let (tx, rx) = mpsc::channel(cfg.lane_buffer);
        let lane = Lane {
            auction,
            last_bidder,
            winning,
            recent,
            proxies,
            quarantined: false,
            usernames,
            store,
            hub,
            cfg,
            rx,
        };
        tokio::spawn(lane.run());

        Ok(LaneHandle { auction_id, tx })
    }

    async fn run(mut self) {
        debug!("lane started for auction {}", self.auction.id);
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                LaneCommand::PlaceBid {
                    bidder_id,
                    amount,
                    reply,
                } => {
                    let now = Utc::now();
                    let result = self.commit_bid(bidder_id, amount, BidKind::Manual, now).await;
                    let accepted = result.is_ok();
                    let _ = reply.send(result);
                    if accepted {
                        self.run_auto_chain(BidKind::Proxy, self.last_bidder).await;
                    }
                }
                LaneCommand::SetProxy {
                    bidder_id,
                    max_amount,
                    reply,
                } => {
                    let result = self.apply_set_proxy(bidder_id, max_amount).await;
                    let accepted = result.is_ok();
                    let _ = reply.send(result);
                    if accepted {
                        // Trigger-less evaluation per the set-intent rule.
                        self.run_auto_chain(BidKind::Automatic, None).await;
                    }
                }
                LaneCommand::CancelProxy { bidder_id, reply } => {
                    let _ = reply.send(self.apply_cancel_proxy(bidder_id).await);
                }
                LaneCommand::Cancel {
                    requester_id,
                    requester_role,
                    reply,
                } => {
                    let _ = reply
                        .send(self.apply_cancel(requester_id, requester_role).await);
                }
                LaneCommand::Close { reply } => {
                    let _ = reply.send(self.apply_close().await);
                }
                LaneCommand::View { reply } => {
                    let _ = reply.send(self.view(Utc::now()));
                }
            }
        }
        debug!("lane stopped for auction {}", self.auction.id);
    }

    fn telemetry_points(&self) -> Vec<BidPoint> {
        self.recent
            .iter()
            .map(|b| BidPoint {
                amount: b.amount,
                bidder_id: b.bidder_id,
                at: b.created_at,
            })
            .collect()
    }

    fn telemetry<'a>(&self, points: &'a [BidPoint], now: DateTime<Utc>) -> Telemetry<'a> {
        Telemetry {
            starting_price: self.auction.starting_price,
            current_price: self.auction.current_price,
            total_bids: self.auction.total_bid_count,
            now,
            end_time: self.auction.end_time,
            recent: points,
        }
    }

    async fn username(&mut self, user_id: i64) -> String {
        if let Some(name) = self.usernames.get(&user_id) {
            return name.clone();
        }
        let name = match self.store.get_user(user_id).await {
            Ok(Some(user)) => user.username,
            _ => format!("user-{}", user_id),
        };
        self.usernames.insert(user_id, name.clone());
        name
    }

    /// Validation steps 1–4, then the transactional commit and fan-out.
    async fn commit_bid(
        &mut self,
        bidder_id: i64,
        amount: Decimal,
        kind: BidKind,
        now: DateTime<Utc>,
    ) -> Result<BidReceipt, Rejection> {
        if self.quarantined {
            return Err(Rejection::new(RejectReason::StorageFailure));
        }
        if self.auction.status != AuctionStatus::Live || now >= self.auction.end_time {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        if bidder_id == self.auction.seller_id {
            return Err(Rejection::new(RejectReason::SellerSelfBid));
        }
        if self.last_bidder == Some(bidder_id) {
            return Err(Rejection::new(RejectReason::Consecutive));
        }
        if !is_valid_amount(amount) {
            return Err(Rejection::new(RejectReason::InvalidAmount));
        }

        let points = self.telemetry_points();
        let telemetry = self.telemetry(&points, now);
        let required = if kind.is_auto() {
            pricing::proxy_increment(&telemetry)
        } else {
            pricing::bid_increment(&telemetry)
        };
        let minimum = round_money(self.auction.current_price + required);
        if amount < minimum {
            counter!("engine_bids_rejected_total", "reason" => "below_minimum").increment(1);
            return Err(Rejection::below_minimum(minimum));
        }

        let committed = match self
            .store
            .commit_bid(NewBid {
                auction_id: self.auction.id,
                bidder_id,
                amount,
                kind,
                at: now,
            })
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                warn!(
                    "bid commit failed for auction {}: {}",
                    self.auction.id, e
                );
                counter!("engine_bids_rejected_total", "reason" => "storage_failure")
                    .increment(1);
                return Err(Rejection::new(RejectReason::StorageFailure));
            }
        };

        if committed.bid.amount <= self.auction.current_price {
            // Price went down: invariant breach, fatal to the lane.
            self.quarantined = true;
            error!(
                "auction {} quarantined: committed {} at or below current {}",
                self.auction.id, committed.bid.amount, self.auction.current_price
            );
            return Err(Rejection::new(RejectReason::StorageFailure));
        }

        self.auction.current_price = committed.bid.amount;
        self.auction.total_bid_count = committed.total_bids;
        self.last_bidder = Some(bidder_id);
        self.winning = Some(committed.bid.clone());

        let username = self.username(bidder_id).await;
        self.recent.push_back(BidSummary {
            bid_id: committed.bid.id,
            bidder_id,
            bidder_username: username.clone(),
            amount,
            kind,
            created_at: now,
        });
        while self.recent.len() > self.cfg.recent_bids {
            self.recent.pop_front();
        }

        self.hub.publish(
            self.auction.id,
            AuctionEvent::NewBid {
                auction_id: self.auction.id,
                bid_id: committed.bid.id,
                amount,
                bidder_id,
                bidder_username: username,
                kind,
                seq: 0,
                timestamp: now,
                total_bids: committed.total_bids,
            },
        );
        counter!("engine_bids_committed_total").increment(1);

        Ok(BidReceipt {
            bid_id: committed.bid.id,
            amount,
        })
    }

    /// Drive the proxy reaction chain until the book rests. Each iteration
    /// strictly raises the price by at least one proxy increment and proxies
    /// cap at their maximum, so the chain is bounded.
    async fn run_auto_chain(&mut self, kind: BidKind, initial_trigger: Option<i64>) {
        let mut trigger = initial_trigger;
        loop {
            let now = Utc::now();
            let points = self.telemetry_points();
            let telemetry = self.telemetry(&points, now);
            let increment = pricing::proxy_increment(&telemetry);

            let counter_bid = match self.proxies.counter(
                self.auction.current_price,
                self.last_bidder,
                trigger,
                increment,
            ) {
                Some(counter_bid) => counter_bid,
                None => break,
            };

            match self
                .commit_bid(counter_bid.bidder_id, counter_bid.amount, kind, now)
                .await
            {
                Ok(_) => {
                    if let Err(e) = self
                        .store
                        .set_proxy_current(counter_bid.intent_id, counter_bid.amount)
                        .await
                    {
                        warn!(
                            "failed to record proxy progress on auction {}: {}",
                            self.auction.id, e
                        );
                    }
                    self.proxies
                        .record_current(counter_bid.intent_id, counter_bid.amount);
                    counter!("engine_auto_bids_total").increment(1);
                    trigger = self.last_bidder;
                }
                Err(rejection) => {
                    debug!(
                        "auto chain halted on auction {}: {}",
                        self.auction.id, rejection
                    );
                    break;
                }
            }
        }
    }

    async fn apply_set_proxy(
        &mut self,
        bidder_id: i64,
        max_amount: Decimal,
    ) -> Result<ProxyReceipt, Rejection> {
        let now = Utc::now();
        if self.quarantined {
            return Err(Rejection::new(RejectReason::StorageFailure));
        }
        if self.auction.status != AuctionStatus::Live || now >= self.auction.end_time {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        if bidder_id == self.auction.seller_id {
            return Err(Rejection::new(RejectReason::SellerSelfBid));
        }
        if !is_valid_amount(max_amount) {
            return Err(Rejection::new(RejectReason::InvalidAmount));
        }
        if max_amount <= self.auction.current_price {
            let points = self.telemetry_points();
            let telemetry = self.telemetry(&points, now);
            let minimum =
                round_money(self.auction.current_price + pricing::proxy_increment(&telemetry));
            return Err(Rejection::below_minimum(minimum));
        }

        let intent = self
            .store
            .upsert_proxy(self.auction.id, bidder_id, max_amount, now)
            .await
            .map_err(|e| {
                warn!(
                    "proxy upsert failed for auction {}: {}",
                    self.auction.id, e
                );
                Rejection::new(RejectReason::StorageFailure)
            })?;
        self.proxies.upsert(intent);
        counter!("engine_proxies_set_total").increment(1);

        Ok(ProxyReceipt { max_amount })
    }

    async fn apply_cancel_proxy(&mut self, bidder_id: i64) -> Result<(), Rejection> {
        self.store
            .deactivate_proxy(self.auction.id, bidder_id)
            .await
            .map_err(|e| {
                warn!(
                    "proxy deactivation failed for auction {}: {}",
                    self.auction.id, e
                );
                Rejection::new(RejectReason::StorageFailure)
            })?;
        self.proxies.deactivate(bidder_id);
        Ok(())
    }

    /// Owner cancellation. Only valid before any bid exists.
    async fn apply_cancel(
        &mut self,
        requester_id: i64,
        requester_role: Role,
    ) -> Result<(), Rejection> {
        if requester_id != self.auction.seller_id && requester_role != Role::Admin {
            return Err(Rejection::new(RejectReason::Forbidden));
        }
        if self.auction.status.is_terminal() {
            return Err(Rejection::new(RejectReason::NotLive));
        }
        if self.auction.total_bid_count > 0 {
            return Err(Rejection::new(RejectReason::Forbidden));
        }

        self.store.cancel_auction(self.auction.id).await.map_err(|e| {
            warn!("cancel failed for auction {}: {}", self.auction.id, e);
            match e {
                store::StoreError::Conflict(_) => Rejection::new(RejectReason::Forbidden),
                store::StoreError::NotFound(_) => Rejection::new(RejectReason::NotFound),
                _ => Rejection::new(RejectReason::StorageFailure),
            }
        })?;

        self.auction.status = AuctionStatus::Cancelled;
        if let Err(e) = self.store.deactivate_auction_proxies(self.auction.id).await {
            warn!(
                "proxy sweep after cancel failed for auction {}: {}",
                self.auction.id, e
            );
        }
        self.proxies.clear();

        self.hub.publish(
            self.auction.id,
            AuctionEvent::AuctionTransition {
                auction_id: self.auction.id,
                status: AuctionStatus::Cancelled,
                seq: 0,
            },
        );
        info!("auction {} cancelled by user {}", self.auction.id, requester_id);
        Ok(())
    }

    /// Finalize the auction. Idempotent: a repeated close reports the same
    /// outcome without touching the store again.
    async fn apply_close(&mut self) -> Result<CloseOutcome, EngineError> {
        if self.auction.status == AuctionStatus::Closed {
            return Ok(CloseOutcome {
                auction_id: self.auction.id,
                winner: self.winning.clone(),
            });
        }

        let winner = self.winning.clone();
        self.store
            .close_auction(self.auction.id, winner.as_ref().map(|b| b.bidder_id))
            .await?;

        if let Err(e) = self.store.deactivate_auction_proxies(self.auction.id).await {
            // The close itself is durable; intents are swept again on restart.
            warn!(
                "proxy sweep after close failed for auction {}: {}",
                self.auction.id, e
            );
        }
        self.proxies.clear();
        self.auction.status = AuctionStatus::Closed;
        self.auction.winner_id = winner.as_ref().map(|b| b.bidder_id);

        let winner_username = match &winner {
            Some(bid) => Some(self.username(bid.bidder_id).await),
            None => None,
        };
        self.hub.publish(
            self.auction.id,
            AuctionEvent::AuctionEnded {
                auction_id: self.auction.id,
                winner_id: winner.as_ref().map(|b| b.bidder_id),
                winner_username,
                amount: winner.as_ref().map(|b| b.amount),
                seq: 0,
            },
        );
        if let Some(bid) = &winner {
            self.hub.notify_user(
                bid.bidder_id,
                AuctionEvent::YouWon {
                    auction_id: self.auction.id,
                    amount: bid.amount,
                },
            );
        }

        counter!("engine_auctions_closed_total").increment(1);
        info!(
            "auction {} closed, winner: {:?}",
            self.auction.id,
            winner.as_ref().map(|b| b.bidder_id)
        );

        Ok(CloseOutcome {
            auction_id: self.auction.id,
            winner,
        })
    }

    fn view(&self, now: DateTime<Utc>) -> AuctionView {
        let points = self.telemetry_points();
        let telemetry = self.telemetry(&points, now);
        AuctionView {
            auction: self.auction.clone(),
            time_remaining_seconds: self.auction.time_remaining_seconds(now),
            next_increment: pricing::bid_increment(&telemetry),
            suggested_bid: pricing::suggested_next_bid(&telemetry),
            predicted_final_price: pricing::predicted_final_price(&telemetry),
            last_seq: self.hub.last_seq(self.auction.id),
            recent_bids: self.recent.iter().cloned().collect(),
        }
    }
}
