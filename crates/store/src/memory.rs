//! In-memory implementation of [`AuctionStore`].
//!
//! Backs the engine test suites and database-free local runs. Mirrors the
//! transactional semantics of the Postgres store closely enough that the
//! lane cannot tell them apart: a bid commit flips the winning flag, bumps
//! the counters, and appends the audit entry as one logical step.

use crate::error::{Result, StoreError};
use crate::{AuctionStore, CommittedBid, NewAuction, NewBid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{Auction, Bid, ProxyIntent, Role, User};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct AuditEntry {
    #[allow(dead_code)]
    bid_id: i64,
    price_before: Decimal,
    price_after: Decimal,
}

#[derive(Debug, Default)]
struct Inner {
    users: DashMap<i64, User>,
    auctions: DashMap<i64, Auction>,
    /// auction id -> bids in commit order (oldest first).
    bids: DashMap<i64, Vec<Bid>>,
    /// auction id -> proxy intents in creation order.
    proxies: DashMap<i64, Vec<ProxyIntent>>,
    /// auction id -> audit trail in commit order.
    history: DashMap<i64, Vec<AuditEntry>>,
    next_id: AtomicI64,
}

/// In-memory store. Cheap to clone; all clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Seed a user. Test fixture helper.
    pub fn add_user(&self, username: &str, role: Role, active: bool) -> User {
        let id = self.next_id();
        let user = User {
            id,
            username: username.to_string(),
            email: format!("{}@example.com", username),
            display_name: username.to_string(),
            role,
            active,
            created_at: Utc::now(),
        };
        self.inner.users.insert(id, user.clone());
        user
    }

    /// Audit trail length for an auction. Test observation helper.
    pub fn history_count(&self, auction_id: i64) -> usize {
        self.inner
            .history
            .get(&auction_id)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    /// Highest audited price for an auction. Test observation helper.
    pub fn last_audited_price(&self, auction_id: i64) -> Option<Decimal> {
        self.inner
            .history
            .get(&auction_id)
            .and_then(|h| h.last().map(|e| e.price_after))
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.inner.users.get(&id).map(|u| u.clone()))
    }

    async fn get_auction(&self, id: i64) -> Result<Option<Auction>> {
        Ok(self.inner.auctions.get(&id).map(|a| a.clone()))
    }

    async fn create_auction(&self, auction: NewAuction, now: DateTime<Utc>) -> Result<Auction> {
        let id = self.next_id();
        let status = auction.initial_status(now);
        let row = Auction {
            id,
            seller_id: auction.seller_id,
            category_id: auction.category_id,
            title: auction.title,
            description: auction.description,
            image_url: auction.image_url,
            starting_price: auction.starting_price,
            current_price: auction.starting_price,
            reserve_price: auction.reserve_price,
            start_time: auction.start_time,
            end_time: auction.end_time,
            status,
            total_bid_count: 0,
            winner_id: None,
            created_at: now,
        };
        self.inner.auctions.insert(id, row.clone());
        Ok(row)
    }

    async fn cancel_auction(&self, id: i64) -> Result<()> {
        let mut auction = self
            .inner
            .auctions
            .get_mut(&id)
            .ok_or(StoreError::NotFound("auction"))?;
        if auction.status.is_terminal() || auction.total_bid_count > 0 {
            return Err(StoreError::Conflict(
                "auction has bids or is terminal".to_string(),
            ));
        }
        auction.status = common::model::AuctionStatus::Cancelled;
        Ok(())
    }

    async fn live_auctions(&self) -> Result<Vec<Auction>> {
        Ok(self
            .inner
            .auctions
            .iter()
            .filter(|a| a.status == common::model::AuctionStatus::Live)
            .map(|a| a.clone())
            .collect())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<Auction>> {
        let mut promoted = Vec::new();
        for mut entry in self.inner.auctions.iter_mut() {
            if entry.status == common::model::AuctionStatus::Upcoming && entry.start_time <= now {
                entry.status = common::model::AuctionStatus::Live;
                promoted.push(entry.clone());
            }
        }
        Ok(promoted)
    }

    async fn due_for_close(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        Ok(self
            .inner
            .auctions
            .iter()
            .filter(|a| a.status == common::model::AuctionStatus::Live && a.end_time <= now)
            .map(|a| a.id)
            .collect())
    }

    async fn commit_bid(&self, bid: NewBid) -> Result<CommittedBid> {
        let mut auction = self
            .inner
            .auctions
            .get_mut(&bid.auction_id)
            .ok_or(StoreError::NotFound("auction"))?;

        let price_before = auction.current_price;
        let bid_id = self.next_id();
        let row = Bid {
            id: bid_id,
            auction_id: bid.auction_id,
            bidder_id: bid.bidder_id,
            amount: bid.amount,
            kind: bid.kind,
            winning: true,
            created_at: bid.at,
        };

        let mut bids = self.inner.bids.entry(bid.auction_id).or_default();
        for previous in bids.iter_mut() {
            previous.winning = false;
        }
        bids.push(row.clone());

        auction.current_price = bid.amount;
        auction.total_bid_count += 1;
        let total_bids = auction.total_bid_count;

        self.inner
            .history
            .entry(bid.auction_id)
            .or_default()
            .push(AuditEntry {
                bid_id,
                price_before,
                price_after: bid.amount,
            });

        Ok(CommittedBid {
            bid: row,
            total_bids,
        })
    }

    async fn recent_bids(&self, auction_id: i64, limit: i64) -> Result<Vec<Bid>> {
        let bids = match self.inner.bids.get(&auction_id) {
            Some(bids) => bids,
            None => return Ok(Vec::new()),
        };
        Ok(bids
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn close_auction(&self, id: i64, winner_id: Option<i64>) -> Result<()> {
        let mut auction = self
            .inner
            .auctions
            .get_mut(&id)
            .ok_or(StoreError::NotFound("auction"))?;
        auction.status = common::model::AuctionStatus::Closed;
        auction.winner_id = winner_id;
        Ok(())
    }

    async fn upsert_proxy(
        &self,
        auction_id: i64,
        bidder_id: i64,
        max_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ProxyIntent> {
        let mut proxies = self.inner.proxies.entry(auction_id).or_default();
        if let Some(existing) = proxies.iter_mut().find(|p| p.bidder_id == bidder_id) {
            existing.max_amount = max_amount;
            existing.active = true;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let intent = ProxyIntent {
            id: self.next_id(),
            auction_id,
            bidder_id,
            max_amount,
            current_amount: Decimal::ZERO,
            active: true,
            created_at: now,
            updated_at: now,
        };
        proxies.push(intent.clone());
        Ok(intent)
    }

    async fn set_proxy_current(&self, intent_id: i64, current_amount: Decimal) -> Result<()> {
        for mut proxies in self.inner.proxies.iter_mut() {
            if let Some(intent) = proxies.iter_mut().find(|p| p.id == intent_id) {
                intent.current_amount = current_amount;
                intent.updated_at = Utc::now();
                return Ok(());
            }
        }
        Err(StoreError::NotFound("proxy intent"))
    }

    async fn deactivate_proxy(&self, auction_id: i64, bidder_id: i64) -> Result<()> {
        if let Some(mut proxies) = self.inner.proxies.get_mut(&auction_id) {
            for intent in proxies.iter_mut() {
                if intent.bidder_id == bidder_id {
                    intent.active = false;
                }
            }
        }
        Ok(())
    }

    async fn deactivate_auction_proxies(&self, auction_id: i64) -> Result<()> {
        if let Some(mut proxies) = self.inner.proxies.get_mut(&auction_id) {
            for intent in proxies.iter_mut() {
                intent.active = false;
            }
        }
        Ok(())
    }

    async fn active_proxies(&self, auction_id: i64) -> Result<Vec<ProxyIntent>> {
        Ok(self
            .inner
            .proxies
            .get(&auction_id)
            .map(|proxies| proxies.iter().filter(|p| p.active).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::BidKind;
    use rust_decimal_macros::dec;

    async fn make_auction(store: &MemoryStore, seller_id: i64, starting: Decimal) -> Auction {
        let now = Utc::now();
        store
            .create_auction(
                NewAuction {
                    seller_id,
                    category_id: None,
                    title: "test lot".to_string(),
                    description: None,
                    image_url: None,
                    starting_price: starting,
                    reserve_price: None,
                    start_time: now - chrono::Duration::minutes(1),
                    end_time: now + chrono::Duration::hours(2),
                },
                now,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_bid_flips_winning_flag() {
        let store = MemoryStore::new();
        let seller = store.add_user("seller", Role::Seller, true);
        let auction = make_auction(&store, seller.id, dec!(100.00)).await;

        let first = store
            .commit_bid(NewBid {
                auction_id: auction.id,
                bidder_id: 10,
                amount: dec!(110.00),
                kind: BidKind::Manual,
                at: Utc::now(),
            })
            .await
            .unwrap();
        let second = store
            .commit_bid(NewBid {
                auction_id: auction.id,
                bidder_id: 11,
                amount: dec!(120.00),
                kind: BidKind::Manual,
                at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(first.total_bids, 1);
        assert_eq!(second.total_bids, 2);

        let bids = store.recent_bids(auction.id, 10).await.unwrap();
        assert_eq!(bids.len(), 2);
        // Newest first; only the newest is winning.
        assert!(bids[0].winning);
        assert!(!bids[1].winning);

        let refreshed = store.get_auction(auction.id).await.unwrap().unwrap();
        assert_eq!(refreshed.current_price, dec!(120.00));
        assert_eq!(refreshed.total_bid_count, 2);
        assert_eq!(store.history_count(auction.id), 2);
        assert_eq!(store.last_audited_price(auction.id), Some(dec!(120.00)));
    }

    #[tokio::test]
    async fn test_cancel_refuses_after_bids() {
        let store = MemoryStore::new();
        let seller = store.add_user("seller", Role::Seller, true);
        let auction = make_auction(&store, seller.id, dec!(50.00)).await;

        store
            .commit_bid(NewBid {
                auction_id: auction.id,
                bidder_id: 10,
                amount: dec!(55.00),
                kind: BidKind::Manual,
                at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(matches!(
            store.cancel_auction(auction.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_proxy_updates_in_place() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store
            .upsert_proxy(1, 10, dec!(150.00), now)
            .await
            .unwrap();
        let second = store
            .upsert_proxy(1, 10, dec!(200.00), now + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.max_amount, dec!(200.00));
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.active_proxies(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promote_and_close_due() {
        let store = MemoryStore::new();
        let seller = store.add_user("seller", Role::Seller, true);
        let now = Utc::now();
        let upcoming = store
            .create_auction(
                NewAuction {
                    seller_id: seller.id,
                    category_id: None,
                    title: "later".to_string(),
                    description: None,
                    image_url: None,
                    starting_price: dec!(10.00),
                    reserve_price: None,
                    start_time: now + chrono::Duration::minutes(5),
                    end_time: now + chrono::Duration::hours(1),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(upcoming.status, common::model::AuctionStatus::Upcoming);

        let promoted = store
            .promote_due(now + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].status, common::model::AuctionStatus::Live);

        let due = store
            .due_for_close(now + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(due, vec![upcoming.id]);
    }
}
