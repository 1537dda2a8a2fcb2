//! PostgreSQL entity store on a lazily connected pool of one.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bidtrack_core::{
    Auction, AuctionKey, AuctionStatus, Bid, BidFacts, ObservedListing, Seller, SellerFacts,
    SellerKey,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::{
    check_varchar, money, optional_money, EntityStore, StoreError, StoreResult, StoreTx,
    UpsertAction, UpsertedAuction,
};

/// Embedded DDL for the four tracker tables and their indexes.
pub const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

const AUCTION_SELECT: &str = r#"
    SELECT a.id, a.item_id, a.title, a.url, a.seller_id, s.ebay_user_id AS seller_user_id,
           a.search_pattern, a.description, a.condition, a.current_price,
           a.buy_it_now_price, a.shipping_cost, a.num_bids, a.auction_end_time,
           a.auction_start_time, a.auction_status, a.created_at, a.updated_at
      FROM auctions a
      JOIN sellers s ON a.seller_id = s.id
"#;

#[derive(Clone)]
pub struct PgStoreSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "ebay_tracker".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for PgStoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStoreSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    /// Build the store without touching the network. The first query opens
    /// the connection; a connection found broken before use is replaced.
    pub fn connect_lazy(settings: &PgStoreSettings) -> Self {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .database(&settings.database)
            .username(&settings.user)
            .password(&settings.password);
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.acquire_timeout)
            .test_before_acquire(true)
            .connect_lazy_with(options);
        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("database pool closed");
    }
}

/// Split the schema script into executable statements, skipping
/// comment-only fragments.
pub(crate) fn schema_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|chunk| {
        chunk
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with("--"))
    })
}

fn parse_status(raw: &str) -> StoreResult<AuctionStatus> {
    raw.parse::<AuctionStatus>().map_err(|err| StoreError::Corrupt {
        table: "auctions",
        detail: err.to_string(),
    })
}

fn auction_from_row(row: &PgRow) -> StoreResult<Auction> {
    let status: String = row.try_get("auction_status")?;
    Ok(Auction {
        key: AuctionKey(row.try_get("id")?),
        item_id: row.try_get("item_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        seller: SellerKey(row.try_get("seller_id")?),
        seller_user_id: row.try_get("seller_user_id")?,
        search_pattern: row.try_get("search_pattern")?,
        description: row.try_get("description")?,
        condition: row.try_get("condition")?,
        current_price: row.try_get("current_price")?,
        buy_it_now_price: row.try_get("buy_it_now_price")?,
        shipping_cost: row.try_get("shipping_cost")?,
        bid_count: row.try_get::<Option<i32>, _>("num_bids")?.unwrap_or(0),
        end_time: row.try_get("auction_end_time")?,
        start_time: row.try_get("auction_start_time")?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn seller_from_row(row: &PgRow) -> StoreResult<Seller> {
    Ok(Seller {
        key: SellerKey(row.try_get("id")?),
        user_id: row.try_get("ebay_user_id")?,
        rating: row.try_get("rating")?,
        feedback_score: row.try_get("feedback_score")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bid_from_row(auction: AuctionKey, row: &PgRow) -> StoreResult<Bid> {
    Ok(Bid {
        id: row.try_get("id")?,
        auction,
        amount: row.try_get("bid_amount")?,
        time: row.try_get("bid_time")?,
        bidder_id: row.try_get("bidder_id")?,
        winning: row.try_get::<Option<bool>, _>("winning_bid")?.unwrap_or(false),
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0usize;
        for statement in schema_statements(SCHEMA_SQL) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|err| match err {
                    sqlx::Error::Database(db) => StoreError::Schema(db.to_string()),
                    other => StoreError::Database(other),
                })?;
            applied += 1;
        }
        tx.commit().await?;
        info!(statements = applied, "database schema ensured");
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn list_active_auctions(&self) -> StoreResult<Vec<Auction>> {
        let sql = format!("{AUCTION_SELECT} WHERE a.auction_status = $1 ORDER BY a.auction_end_time, a.id");
        let rows = sqlx::query(&sql)
            .bind(AuctionStatus::Active.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(auction_from_row).collect()
    }

    async fn find_seller(&self, user_id: &str) -> StoreResult<Option<Seller>> {
        let row = sqlx::query(
            r#"
            SELECT id, ebay_user_id, rating, feedback_score, created_at, updated_at
              FROM sellers
             WHERE ebay_user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(seller_from_row).transpose()
    }

    async fn find_auction(&self, item_id: &str) -> StoreResult<Option<Auction>> {
        let sql = format!("{AUCTION_SELECT} WHERE a.item_id = $1");
        let row = sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(auction_from_row).transpose()
    }

    async fn item_specifics(&self, auction: AuctionKey) -> StoreResult<BTreeMap<String, String>> {
        let rows = sqlx::query(
            r#"
            SELECT spec_key, spec_value
              FROM item_specifics
             WHERE auction_id = $1
            "#,
        )
        .bind(auction.0)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("spec_key")?;
            let value: Option<String> = row.try_get("spec_value")?;
            out.insert(key, value.unwrap_or_default());
        }
        Ok(out)
    }

    async fn bids(&self, auction: AuctionKey) -> StoreResult<Vec<Bid>> {
        let rows = sqlx::query(
            r#"
            SELECT id, bid_amount, bid_time, bidder_id, winning_bid, created_at
              FROM bids
             WHERE auction_id = $1
             ORDER BY bid_time, id
            "#,
        )
        .bind(auction.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| bid_from_row(auction, row)).collect()
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn resolve_seller(&mut self, facts: &SellerFacts) -> StoreResult<SellerKey> {
        check_varchar("sellers.ebay_user_id", &facts.user_id)?;
        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO sellers (ebay_user_id, rating, feedback_score)
            VALUES ($1, $2, $3)
            ON CONFLICT (ebay_user_id) DO UPDATE
               SET rating = EXCLUDED.rating,
                   feedback_score = EXCLUDED.feedback_score,
                   updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&facts.user_id)
        .bind(facts.rating)
        .bind(facts.feedback_score)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(SellerKey(id))
    }

    async fn upsert_auction(
        &mut self,
        listing: &ObservedListing,
        seller: SellerKey,
    ) -> StoreResult<UpsertedAuction> {
        check_varchar("auctions.item_id", &listing.item_id)?;
        check_varchar("auctions.search_pattern", &listing.search_pattern)?;
        if let Some(condition) = &listing.condition {
            check_varchar("auctions.condition", condition)?;
        }
        let current_price = optional_money("auctions.current_price", listing.current_price)?;
        let buy_it_now_price = optional_money("auctions.buy_it_now_price", listing.buy_it_now_price)?;
        let shipping_cost = optional_money("auctions.shipping_cost", listing.shipping_cost)?;

        let existing = sqlx::query("SELECT id, auction_status FROM auctions WHERE item_id = $1 FOR UPDATE")
            .bind(&listing.item_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        if let Some(row) = existing {
            let key = AuctionKey(row.try_get("id")?);
            let status: String = row.try_get("auction_status")?;
            if parse_status(&status)? == AuctionStatus::Completed {
                return Ok(UpsertedAuction {
                    key,
                    action: UpsertAction::AlreadyCompleted,
                });
            }

            sqlx::query(
                r#"
                UPDATE auctions SET
                    title = $1,
                    url = $2,
                    seller_id = $3,
                    description = $4,
                    condition = $5,
                    current_price = $6,
                    buy_it_now_price = $7,
                    shipping_cost = $8,
                    num_bids = $9,
                    updated_at = NOW()
                WHERE id = $10
                "#,
            )
            .bind(&listing.title)
            .bind(&listing.url)
            .bind(seller.0)
            .bind(listing.description.as_deref())
            .bind(listing.condition.as_deref())
            .bind(current_price)
            .bind(buy_it_now_price)
            .bind(shipping_cost)
            .bind(listing.bid_count)
            .bind(key.0)
            .execute(&mut *self.tx)
            .await?;
            debug!(item_id = %listing.item_id, %key, "auction updated");
            return Ok(UpsertedAuction {
                key,
                action: UpsertAction::Updated,
            });
        }

        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO auctions (
                item_id, title, url, seller_id, search_pattern,
                description, condition, current_price, buy_it_now_price,
                shipping_cost, num_bids, auction_end_time, auction_start_time,
                auction_status
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            ) RETURNING id
            "#,
        )
        .bind(&listing.item_id)
        .bind(&listing.title)
        .bind(&listing.url)
        .bind(seller.0)
        .bind(&listing.search_pattern)
        .bind(listing.description.as_deref())
        .bind(listing.condition.as_deref())
        .bind(current_price)
        .bind(buy_it_now_price)
        .bind(shipping_cost)
        .bind(listing.bid_count)
        .bind(listing.end_time)
        .bind(listing.start_time)
        .bind(AuctionStatus::Active.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        let key = AuctionKey(id);
        debug!(item_id = %listing.item_id, %key, "auction inserted");
        Ok(UpsertedAuction {
            key,
            action: UpsertAction::Inserted,
        })
    }

    async fn replace_item_specifics(
        &mut self,
        auction: AuctionKey,
        specifics: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        for (key, value) in specifics {
            check_varchar("item_specifics.spec_key", key)?;
            sqlx::query(
                r#"
                INSERT INTO item_specifics (auction_id, spec_key, spec_value)
                VALUES ($1, $2, $3)
                ON CONFLICT (auction_id, spec_key)
                DO UPDATE SET spec_value = EXCLUDED.spec_value
                "#,
            )
            .bind(auction.0)
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn append_bid(&mut self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<bool> {
        let amount = money("bids.bid_amount", bid.amount)?;
        if let Some(bidder) = &bid.bidder_id {
            check_varchar("bids.bidder_id", bidder)?;
        }
        let result = sqlx::query(
            r#"
            INSERT INTO bids (auction_id, bid_amount, bid_time, bidder_id, winning_bid)
            SELECT $1, $2, $3, $4, FALSE
             WHERE NOT EXISTS (
                SELECT 1 FROM bids
                 WHERE auction_id = $1
                   AND bid_amount = $2
                   AND bid_time = $3
                   AND bidder_id IS NOT DISTINCT FROM $4
             )
            "#,
        )
        .bind(auction.0)
        .bind(amount)
        .bind(bid.time)
        .bind(bid.bidder_id.as_deref())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_winning_bid(&mut self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<()> {
        let amount = money("bids.bid_amount", bid.amount)?;
        if let Some(bidder) = &bid.bidder_id {
            check_varchar("bids.bidder_id", bidder)?;
        }
        let flagged = sqlx::query(
            r#"
            UPDATE bids SET winning_bid = TRUE
             WHERE auction_id = $1
               AND bid_amount = $2
               AND bid_time = $3
               AND bidder_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(auction.0)
        .bind(amount)
        .bind(bid.time)
        .bind(bid.bidder_id.as_deref())
        .execute(&mut *self.tx)
        .await?;

        if flagged.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO bids (auction_id, bid_amount, bid_time, bidder_id, winning_bid)
                VALUES ($1, $2, $3, $4, TRUE)
                "#,
            )
            .bind(auction.0)
            .bind(amount)
            .bind(bid.time)
            .bind(bid.bidder_id.as_deref())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn finalize_auction(
        &mut self,
        item_id: &str,
        final_price: Decimal,
        bid_count: i32,
    ) -> StoreResult<Option<AuctionKey>> {
        let final_price = money("auctions.current_price", final_price)?;
        let id: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE auctions SET
                auction_status = $1,
                current_price = $2,
                num_bids = $3,
                updated_at = NOW()
            WHERE item_id = $4
              AND auction_status = $5
            RETURNING id
            "#,
        )
        .bind(AuctionStatus::Completed.as_str())
        .bind(final_price)
        .bind(bid_count)
        .bind(item_id)
        .bind(AuctionStatus::Active.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id.map(AuctionKey))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_tables_and_indexes() {
        let statements: Vec<_> = schema_statements(SCHEMA_SQL).collect();
        assert_eq!(statements.len(), 9);
        assert_eq!(
            statements
                .iter()
                .filter(|s| s.contains("CREATE TABLE IF NOT EXISTS"))
                .count(),
            4
        );
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
        for index in [
            "idx_auctions_search_pattern",
            "idx_auctions_auction_end_time",
            "idx_auctions_auction_status",
            "idx_item_specifics_key",
            "idx_bids_auction_id",
        ] {
            assert!(SCHEMA_SQL.contains(index), "missing index {index}");
        }
    }

    #[test]
    fn settings_debug_redacts_password() {
        let settings = PgStoreSettings {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
