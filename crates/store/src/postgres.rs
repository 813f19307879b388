//! PostgreSQL implementation of [`AuctionStore`].
//!
//! Enum columns are stored as TEXT and parsed at the row boundary, so the
//! domain types in `common` stay free of database derives.

use crate::error::{Result, StoreError};
use crate::{AuctionStore, CommittedBid, NewAuction, NewBid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{Auction, Bid, ProxyIntent, User};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL-backed store. Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a bounded acquire timeout so a saturated pool surfaces
    /// as `storage_failure` instead of hanging a lane.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(map_db)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute the embedded schema, statement by statement.
    pub async fn initialize_schema(&self) -> Result<()> {
        let schema = include_str!("../sql/schema.sql");
        for statement in schema.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(map_db)?;
            }
        }
        info!("database schema initialized");
        Ok(())
    }
}

fn map_db(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        other => StoreError::Database(other),
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    display_name: String,
    role: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            username: row.username,
            email: row.email,
            display_name: row.display_name,
            role: row.role.parse()?,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuctionRow {
    id: i64,
    seller_id: i64,
    category_id: Option<i64>,
    title: String,
    description: Option<String>,
    image_url: Option<String>,
    starting_price: Decimal,
    current_price: Decimal,
    reserve_price: Option<Decimal>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    status: String,
    total_bid_count: i64,
    winner_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuctionRow> for Auction {
    type Error = StoreError;

    fn try_from(row: AuctionRow) -> Result<Self> {
        Ok(Auction {
            id: row.id,
            seller_id: row.seller_id,
            category_id: row.category_id,
            title: row.title,
            description: row.description,
            image_url: row.image_url,
            starting_price: row.starting_price,
            current_price: row.current_price,
            reserve_price: row.reserve_price,
            start_time: row.start_time,
            end_time: row.end_time,
            status: row.status.parse()?,
            total_bid_count: row.total_bid_count,
            winner_id: row.winner_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BidRow {
    id: i64,
    auction_id: i64,
    bidder_id: i64,
    amount: Decimal,
    kind: String,
    winning: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<BidRow> for Bid {
    type Error = StoreError;

    fn try_from(row: BidRow) -> Result<Self> {
        Ok(Bid {
            id: row.id,
            auction_id: row.auction_id,
            bidder_id: row.bidder_id,
            amount: row.amount,
            kind: row.kind.parse()?,
            winning: row.winning,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProxyRow {
    id: i64,
    auction_id: i64,
    bidder_id: i64,
    max_amount: Decimal,
    current_amount: Decimal,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProxyRow> for ProxyIntent {
    fn from(row: ProxyRow) -> Self {
        ProxyIntent {
            id: row.id,
            auction_id: row.auction_id,
            bidder_id: row.bidder_id,
            max_amount: row.max_amount,
            current_amount: row.current_amount,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// ============================================================================
// AuctionStore implementation
// ============================================================================

#[async_trait]
impl AuctionStore for PgStore {
    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db)?;
        row.map(User::try_from).transpose()
    }

    async fn get_auction(&self, id: i64) -> Result<Option<Auction>> {
        let row = sqlx::query_as::<_, AuctionRow>("SELECT * FROM auctions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db)?;
        row.map(Auction::try_from).transpose()
    }

    async fn create_auction(&self, auction: NewAuction, now: DateTime<Utc>) -> Result<Auction> {
        let status = auction.initial_status(now);
        let row = sqlx::query_as::<_, AuctionRow>(
            "INSERT INTO auctions \
             (seller_id, category_id, title, description, image_url, starting_price, \
              current_price, reserve_price, start_time, end_time, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $8, $9, $10, $11) \
             RETURNING *",
        )
        .bind(auction.seller_id)
        .bind(auction.category_id)
        .bind(&auction.title)
        .bind(&auction.description)
        .bind(&auction.image_url)
        .bind(auction.starting_price)
        .bind(auction.reserve_price)
        .bind(auction.start_time)
        .bind(auction.end_time)
        .bind(status.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db)?;
        Auction::try_from(row)
    }

    async fn cancel_auction(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE auctions SET status = 'cancelled' \
             WHERE id = $1 AND status IN ('upcoming', 'live') AND total_bid_count = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_db)?;

        if result.rows_affected() == 0 {
            match self.get_auction(id).await? {
                Some(_) => Err(StoreError::Conflict(
                    "auction has bids or is terminal".to_string(),
                )),
                None => Err(StoreError::NotFound("auction")),
            }
        } else {
            Ok(())
        }
    }

    async fn live_auctions(&self) -> Result<Vec<Auction>> {
        let rows =
            sqlx::query_as::<_, AuctionRow>("SELECT * FROM auctions WHERE status = 'live'")
                .fetch_all(&self.pool)
                .await
                .map_err(map_db)?;
        rows.into_iter().map(Auction::try_from).collect()
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<Auction>> {
        let rows = sqlx::query_as::<_, AuctionRow>(
            "UPDATE auctions SET status = 'live' \
             WHERE status = 'upcoming' AND start_time <= $1 \
             RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db)?;
        rows.into_iter().map(Auction::try_from).collect()
    }

    async fn due_for_close(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM auctions WHERE status = 'live' AND end_time <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(ids)
    }

    async fn commit_bid(&self, bid: NewBid) -> Result<CommittedBid> {
        let mut tx = self.pool.begin().await.map_err(map_db)?;

        let price_before = sqlx::query_scalar::<_, Decimal>(
            "SELECT current_price FROM auctions WHERE id = $1 FOR UPDATE",
        )
        .bind(bid.auction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?
        .ok_or(StoreError::NotFound("auction"))?;

        sqlx::query("UPDATE bids SET winning = FALSE WHERE auction_id = $1 AND winning = TRUE")
            .bind(bid.auction_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db)?;

        let bid_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO bids (auction_id, bidder_id, amount, kind, winning, created_at) \
             VALUES ($1, $2, $3, $4, TRUE, $5) \
             RETURNING id",
        )
        .bind(bid.auction_id)
        .bind(bid.bidder_id)
        .bind(bid.amount)
        .bind(bid.kind.as_str())
        .bind(bid.at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;

        let total_bids = sqlx::query_scalar::<_, i64>(
            "UPDATE auctions SET current_price = $2, total_bid_count = total_bid_count + 1 \
             WHERE id = $1 \
             RETURNING total_bid_count",
        )
        .bind(bid.auction_id)
        .bind(bid.amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;

        sqlx::query(
            "INSERT INTO bidding_history \
             (auction_id, bid_id, bidder_id, amount, kind, price_before, price_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(bid.auction_id)
        .bind(bid_id)
        .bind(bid.bidder_id)
        .bind(bid.amount)
        .bind(bid.kind.as_str())
        .bind(price_before)
        .bind(bid.amount)
        .bind(bid.at)
        .execute(&mut *tx)
        .await
        .map_err(map_db)?;

        tx.commit().await.map_err(map_db)?;

        Ok(CommittedBid {
            bid: Bid {
                id: bid_id,
                auction_id: bid.auction_id,
                bidder_id: bid.bidder_id,
                amount: bid.amount,
                kind: bid.kind,
                winning: true,
                created_at: bid.at,
            },
            total_bids,
        })
    }

    async fn recent_bids(&self, auction_id: i64, limit: i64) -> Result<Vec<Bid>> {
        let rows = sqlx::query_as::<_, BidRow>(
            "SELECT * FROM bids WHERE auction_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2",
        )
        .bind(auction_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db)?;
        rows.into_iter().map(Bid::try_from).collect()
    }

    async fn close_auction(&self, id: i64, winner_id: Option<i64>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE auctions SET status = 'closed', winner_id = $2 \
             WHERE id = $1 AND status IN ('live', 'closed')",
        )
        .bind(id)
        .bind(winner_id)
        .execute(&self.pool)
        .await
        .map_err(map_db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("auction"));
        }
        Ok(())
    }

    async fn upsert_proxy(
        &self,
        auction_id: i64,
        bidder_id: i64,
        max_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ProxyIntent> {
        let row = sqlx::query_as::<_, ProxyRow>(
            "INSERT INTO proxy_bids \
             (auction_id, bidder_id, max_amount, current_amount, active, created_at, updated_at) \
             VALUES ($1, $2, $3, 0, TRUE, $4, $4) \
             ON CONFLICT (auction_id, bidder_id) \
             DO UPDATE SET max_amount = EXCLUDED.max_amount, active = TRUE, \
                           updated_at = EXCLUDED.updated_at \
             RETURNING *",
        )
        .bind(auction_id)
        .bind(bidder_id)
        .bind(max_amount)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(row.into())
    }

    async fn set_proxy_current(&self, intent_id: i64, current_amount: Decimal) -> Result<()> {
        sqlx::query("UPDATE proxy_bids SET current_amount = $2, updated_at = NOW() WHERE id = $1")
            .bind(intent_id)
            .bind(current_amount)
            .execute(&self.pool)
            .await
            .map_err(map_db)?;
        Ok(())
    }

    async fn deactivate_proxy(&self, auction_id: i64, bidder_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE proxy_bids SET active = FALSE, updated_at = NOW() \
             WHERE auction_id = $1 AND bidder_id = $2 AND active",
        )
        .bind(auction_id)
        .bind(bidder_id)
        .execute(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(())
    }

    async fn deactivate_auction_proxies(&self, auction_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE proxy_bids SET active = FALSE, updated_at = NOW() \
             WHERE auction_id = $1 AND active",
        )
        .bind(auction_id)
        .execute(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(())
    }

    async fn active_proxies(&self, auction_id: i64) -> Result<Vec<ProxyIntent>> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            "SELECT * FROM proxy_bids WHERE auction_id = $1 AND active ORDER BY created_at",
        )
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(rows.into_iter().map(ProxyIntent::from).collect())
    }
}
