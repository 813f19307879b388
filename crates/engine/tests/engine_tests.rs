//! End-to-end engine scenarios against the in-memory store: lanes, proxy
//! chains, lifecycle transitions, and broadcast ordering.

use chrono::{Duration as ChronoDuration, Utc};
use common::model::{AuctionStatus, RejectReason, Role, User};
use engine::{AuctionRegistry, BroadcastHub, ConnectionId, EngineConfig, LifecycleScheduler};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use store::{AuctionStore, MemoryStore, NewAuction};
use tokio::sync::mpsc;

struct Rig {
    store: MemoryStore,
    hub: BroadcastHub,
    registry: Arc<AuctionRegistry>,
}

fn make_rig() -> Rig {
    let store = MemoryStore::new();
    let hub = BroadcastHub::new();
    let registry = Arc::new(AuctionRegistry::new(
        Arc::new(store.clone()),
        hub.clone(),
        EngineConfig::default(),
    ));
    Rig {
        store,
        hub,
        registry,
    }
}

impl Rig {
    async fn live_auction(&self, seller: &User, starting: Decimal) -> i64 {
        let now = Utc::now();
        self.store
            .create_auction(
                NewAuction {
                    seller_id: seller.id,
                    category_id: None,
                    title: "vintage synth".to_string(),
                    description: None,
                    image_url: None,
                    starting_price: starting,
                    reserve_price: None,
                    start_time: now - ChronoDuration::minutes(1),
                    end_time: now + ChronoDuration::hours(2),
                },
                now,
            )
            .await
            .unwrap()
            .id
    }

    fn subscribe(&self, user: &User) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self.hub.attach(user.id, &user.username, tx);
        (conn, rx)
    }

    /// Barrier: the lane answers `view` only after every queued command and
    /// its synchronous proxy chain have finished.
    async fn settle(&self, auction_id: i64) -> engine::AuctionView {
        self.registry.view(auction_id).await.unwrap()
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

fn new_bids(frames: &[serde_json::Value]) -> Vec<&serde_json::Value> {
    frames.iter().filter(|f| f["type"] == "new_bid").collect()
}

#[tokio::test]
async fn test_two_bidder_alternation() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let (conn, mut rx) = rig.subscribe(&b1);
    rig.hub.join(&conn, auction_id);

    let lane = rig.registry.lane(auction_id).await.unwrap();

    // Minimum for the first bid is 105; 110 clears it.
    assert!(lane.place_bid(b1.id, dec!(110.00)).await.is_ok());

    // Same bidder twice in a row.
    let rejection = lane.place_bid(b1.id, dec!(120.00)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::Consecutive);

    // 110 + 5 = 115 is exactly the minimum.
    assert!(lane.place_bid(b2.id, dec!(115.00)).await.is_ok());
    assert!(lane.place_bid(b1.id, dec!(120.00)).await.is_ok());

    // Below minimum returns the minimum to retry with.
    let rejection = lane.place_bid(b2.id, dec!(124.00)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::BelowMinimum);
    assert_eq!(rejection.minimum, Some(dec!(125.00)));

    let view = rig.settle(auction_id).await;
    assert_eq!(view.auction.current_price, dec!(120.00));
    assert_eq!(view.auction.total_bid_count, 3);

    // Exactly one winning bid: the newest, from b1.
    let bids = rig.store.recent_bids(auction_id, 10).await.unwrap();
    let winners: Vec<_> = bids.iter().filter(|b| b.winning).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].bidder_id, b1.id);
    assert_eq!(winners[0].amount, dec!(120.00));

    // Broadcast order: contiguous sequence numbers, strictly rising amounts.
    let frames = drain(&mut rx);
    let bid_frames = new_bids(&frames);
    assert_eq!(bid_frames.len(), 3);
    let seqs: Vec<u64> = bid_frames.iter().map(|f| f["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    let amounts: Vec<&str> = bid_frames
        .iter()
        .map(|f| f["amount"].as_str().unwrap())
        .collect();
    assert_eq!(amounts, vec!["110.00", "115.00", "120.00"]);
}

#[tokio::test]
async fn test_seller_self_bid_rejected() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    let rejection = lane.place_bid(seller.id, dec!(110.00)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::SellerSelfBid);

    let view = rig.settle(auction_id).await;
    assert_eq!(view.auction.current_price, dec!(100.00));
    assert_eq!(view.auction.total_bid_count, 0);
}

#[tokio::test]
async fn test_fresh_proxy_steps_up_once() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let (conn, mut rx) = rig.subscribe(&b1);
    rig.hub.join(&conn, auction_id);

    let lane = rig.registry.lane(auction_id).await.unwrap();
    let receipt = lane.set_proxy(b1.id, dec!(200.00)).await.unwrap();
    assert_eq!(receipt.max_amount, dec!(200.00));

    // Exactly one automatic step-up to 100 + 4, then the intent rests.
    let view = rig.settle(auction_id).await;
    assert_eq!(view.auction.current_price, dec!(104.00));
    assert_eq!(view.auction.total_bid_count, 1);

    let frames = drain(&mut rx);
    let bid_frames = new_bids(&frames);
    assert_eq!(bid_frames.len(), 1);
    assert_eq!(bid_frames[0]["kind"], "automatic");
    assert_eq!(bid_frames[0]["bidderId"], b1.id);
}

#[tokio::test]
async fn test_proxy_counters_manual_bid() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let (conn, mut rx) = rig.subscribe(&b2);
    rig.hub.join(&conn, auction_id);

    let lane = rig.registry.lane(auction_id).await.unwrap();
    lane.set_proxy(b1.id, dec!(200.00)).await.unwrap();
    rig.settle(auction_id).await; // auto-lead at 104

    // B2's manual 110 is countered inside the same lane turn: 110 + 4.
    assert!(lane.place_bid(b2.id, dec!(110.00)).await.is_ok());
    let view = rig.settle(auction_id).await;
    assert_eq!(view.auction.current_price, dec!(114.00));

    let bids = rig.store.recent_bids(auction_id, 10).await.unwrap();
    assert_eq!(bids[0].bidder_id, b1.id);
    assert!(bids[0].winning);

    // Counter-bid never exceeds the intent's maximum.
    for bid in bids.iter().filter(|b| b.kind.is_auto()) {
        assert!(bid.amount <= dec!(200.00));
    }

    let frames = drain(&mut rx);
    let kinds: Vec<&str> = new_bids(&frames)
        .iter()
        .map(|f| f["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["automatic", "manual", "proxy"]);
}

#[tokio::test]
async fn test_two_proxies_highest_max_wins() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();

    lane.set_proxy(b1.id, dec!(150.00)).await.unwrap();
    rig.settle(auction_id).await; // B1 auto-leads at 104

    lane.set_proxy(b2.id, dec!(200.00)).await.unwrap();
    let view = rig.settle(auction_id).await;

    // B2 jumps straight past B1's max: min(150 + 4, 200) = 154.
    assert_eq!(view.auction.current_price, dec!(154.00));
    let bids = rig.store.recent_bids(auction_id, 10).await.unwrap();
    assert_eq!(bids[0].bidder_id, b2.id);
    assert!(bids[0].winning);
}

#[tokio::test]
async fn test_close_finality_and_winner_notification() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let (watcher_conn, mut watcher_rx) = rig.subscribe(&b2);
    rig.hub.join(&watcher_conn, auction_id);
    // Winner holds a second, unsubscribed connection; you_won reaches it too.
    let (_winner_conn, mut winner_rx) = rig.subscribe(&b1);

    let lane = rig.registry.lane(auction_id).await.unwrap();
    assert!(lane.place_bid(b1.id, dec!(500.00)).await.is_ok());

    let outcome = rig.registry.close(auction_id).await.unwrap();
    assert_eq!(outcome.winner.as_ref().unwrap().bidder_id, b1.id);
    assert_eq!(outcome.winner.as_ref().unwrap().amount, dec!(500.00));

    // A bid arriving after close is observed rejects as not_live.
    let rejection = match rig.registry.lane(auction_id).await {
        Ok(lane) => lane.place_bid(b2.id, dec!(600.00)).await.unwrap_err(),
        Err(rejection) => rejection,
    };
    assert_eq!(rejection.reason, RejectReason::NotLive);

    let auction = rig.store.get_auction(auction_id).await.unwrap().unwrap();
    assert_eq!(auction.status, AuctionStatus::Closed);
    assert_eq!(auction.winner_id, Some(b1.id));

    let frames = drain(&mut watcher_rx);
    let ended: Vec<_> = frames
        .iter()
        .filter(|f| f["type"] == "auction_ended")
        .collect();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0]["winnerId"], b1.id);
    assert_eq!(ended[0]["amount"], "500.00");

    let winner_frames = drain(&mut winner_rx);
    let won: Vec<_> = winner_frames
        .iter()
        .filter(|f| f["type"] == "you_won")
        .collect();
    assert_eq!(won.len(), 1);
    assert_eq!(won[0]["amount"], "500.00");
}

#[tokio::test]
async fn test_close_without_bids_has_no_winner() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    rig.registry.lane(auction_id).await.unwrap();
    let outcome = rig.registry.close(auction_id).await.unwrap();
    assert!(outcome.winner.is_none());

    let auction = rig.store.get_auction(auction_id).await.unwrap().unwrap();
    assert_eq!(auction.status, AuctionStatus::Closed);
    assert_eq!(auction.winner_id, None);
}

#[tokio::test]
async fn test_proxies_deactivated_on_close() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    lane.set_proxy(b1.id, dec!(200.00)).await.unwrap();
    rig.settle(auction_id).await;

    rig.registry.close(auction_id).await.unwrap();
    assert!(rig.store.active_proxies(auction_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resync_snapshot_is_gapless() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    lane.place_bid(b1.id, dec!(110.00)).await.unwrap();
    lane.place_bid(b2.id, dec!(115.00)).await.unwrap();

    // Late joiner: subscribe first, then snapshot.
    let late = rig.store.add_user("late", Role::Bidder, true);
    let (conn, mut rx) = rig.subscribe(&late);
    rig.hub.join(&conn, auction_id);
    let view = rig.settle(auction_id).await;
    assert_eq!(view.last_seq, 2);
    assert_eq!(view.recent_bids.len(), 2);
    assert_eq!(view.recent_bids[0].amount, dec!(110.00));
    assert_eq!(view.recent_bids[1].amount, dec!(115.00));

    // The next event continues at lastSeq + 1.
    lane.place_bid(b1.id, dec!(120.00)).await.unwrap();
    rig.settle(auction_id).await;

    let frames = drain(&mut rx);
    let bid_frames = new_bids(&frames);
    assert_eq!(bid_frames.len(), 1);
    assert_eq!(bid_frames[0]["seq"].as_u64().unwrap(), view.last_seq + 1);
}

#[tokio::test]
async fn test_scheduler_promotes_and_closes() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let now = Utc::now();

    let auction = rig
        .store
        .create_auction(
            NewAuction {
                seller_id: seller.id,
                category_id: None,
                title: "estate clock".to_string(),
                description: None,
                image_url: None,
                starting_price: dec!(100.00),
                reserve_price: None,
                start_time: now + ChronoDuration::minutes(30),
                end_time: now + ChronoDuration::hours(1),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(auction.status, AuctionStatus::Upcoming);

    let (conn, mut rx) = rig.subscribe(&b1);
    rig.hub.join(&conn, auction.id);

    let scheduler = LifecycleScheduler::new(
        Arc::new(rig.store.clone()),
        rig.registry.clone(),
        rig.hub.clone(),
        std::time::Duration::from_secs(1),
    );

    // Bids before promotion reject as not_live.
    let rejection = match rig.registry.lane(auction.id).await {
        Ok(lane) => lane.place_bid(b1.id, dec!(110.00)).await.unwrap_err(),
        Err(rejection) => rejection,
    };
    assert_eq!(rejection.reason, RejectReason::NotLive);

    // Promotion tick.
    scheduler
        .tick_once(now + ChronoDuration::minutes(31))
        .await
        .unwrap();
    let promoted = rig.store.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(promoted.status, AuctionStatus::Live);

    let lane = rig.registry.lane(auction.id).await.unwrap();
    assert!(lane.place_bid(b1.id, dec!(110.00)).await.is_ok());

    // Closure tick.
    scheduler
        .tick_once(now + ChronoDuration::hours(2))
        .await
        .unwrap();
    let closed = rig.store.get_auction(auction.id).await.unwrap().unwrap();
    assert_eq!(closed.status, AuctionStatus::Closed);
    assert_eq!(closed.winner_id, Some(b1.id));

    // A second closure tick is a no-op, not an error.
    scheduler
        .tick_once(now + ChronoDuration::hours(3))
        .await
        .unwrap();

    let frames = drain(&mut rx);
    let types: Vec<&str> = frames
        .iter()
        .map(|f| f["type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"auction_transition"));
    assert!(types.contains(&"new_bid"));
    assert!(types.contains(&"auction_ended"));

    // Per-auction total order across event kinds.
    let seqs: Vec<u64> = frames
        .iter()
        .filter_map(|f| f["seq"].as_u64())
        .collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted);
}

#[tokio::test]
async fn test_owner_cancellation() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    rig.registry.lane(auction_id).await.unwrap();

    // A stranger cannot cancel.
    let rejection = rig
        .registry
        .cancel_auction(auction_id, b1.id, Role::Bidder)
        .await
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::Forbidden);

    // The owner can, while no bids exist.
    rig.registry
        .cancel_auction(auction_id, seller.id, Role::Seller)
        .await
        .unwrap();
    let auction = rig.store.get_auction(auction_id).await.unwrap().unwrap();
    assert_eq!(auction.status, AuctionStatus::Cancelled);

    // Terminal: no further bids.
    let rejection = rig.registry.lane(auction_id).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::NotLive);
}

#[tokio::test]
async fn test_cancellation_blocked_after_first_bid() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    lane.place_bid(b1.id, dec!(110.00)).await.unwrap();

    let rejection = rig
        .registry
        .cancel_auction(auction_id, seller.id, Role::Seller)
        .await
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::Forbidden);
}

#[tokio::test]
async fn test_restart_restore_rebuilds_lane_state() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    lane.place_bid(b1.id, dec!(110.00)).await.unwrap();

    // "Restart": a fresh registry over the same store.
    let hub = BroadcastHub::new();
    let registry = AuctionRegistry::new(
        Arc::new(rig.store.clone()),
        hub.clone(),
        EngineConfig::default(),
    );
    assert_eq!(registry.restore().await.unwrap(), 1);

    // The consecutive-bid rule survives the restart.
    let lane = registry.lane(auction_id).await.unwrap();
    let rejection = lane.place_bid(b1.id, dec!(120.00)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::Consecutive);
    assert!(lane.place_bid(b2.id, dec!(115.00)).await.is_ok());
}

#[tokio::test]
async fn test_proxy_rejected_at_or_below_current_price() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    let rejection = lane.set_proxy(b1.id, dec!(100.00)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::BelowMinimum);
    assert!(rejection.minimum.unwrap() > dec!(100.00));

    // Seller cannot set an intent on their own auction.
    let rejection = lane.set_proxy(seller.id, dec!(300.00)).await.unwrap_err();
    assert_eq!(rejection.reason, RejectReason::SellerSelfBid);
}

#[tokio::test]
async fn test_cancel_proxy_stops_countering() {
    let rig = make_rig();
    let seller = rig.store.add_user("seller", Role::Seller, true);
    let b1 = rig.store.add_user("b1", Role::Bidder, true);
    let b2 = rig.store.add_user("b2", Role::Bidder, true);
    let auction_id = rig.live_auction(&seller, dec!(100.00)).await;

    let lane = rig.registry.lane(auction_id).await.unwrap();
    lane.set_proxy(b1.id, dec!(200.00)).await.unwrap();
    rig.settle(auction_id).await; // auto-lead at 104

    lane.cancel_proxy(b1.id).await.unwrap();

    // No counter after cancellation; B2's bid stands.
    lane.place_bid(b2.id, dec!(110.00)).await.unwrap();
    let view = rig.settle(auction_id).await;
    assert_eq!(view.auction.current_price, dec!(110.00));

    let bids = rig.store.recent_bids(auction_id, 10).await.unwrap();
    assert_eq!(bids[0].bidder_id, b2.id);
    assert!(bids[0].winning);
}
