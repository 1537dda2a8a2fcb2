//! Entity store for bidtrack: schema ownership plus the transactional write
//! primitives the reconciler composes into one unit of work per item.

mod memory;
mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bidtrack_core::{Auction, AuctionKey, Bid, BidFacts, ObservedListing, Seller, SellerFacts, SellerKey};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

pub use memory::{MemoryCounts, MemoryStore};
pub use postgres::{PgEntityStore, PgStoreSettings, SCHEMA_SQL};

pub const CRATE_NAME: &str = "bidtrack-storage";

/// Width of every `VARCHAR(255)` column in the schema.
pub const VARCHAR_LIMIT: usize = 255;

/// Largest value a `NUMERIC(10, 2)` column accepts.
pub const MONEY_MAX: Decimal = Decimal::from_parts(1_410_065_407, 2, 0, false, 2);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("constraint violated on {column}: {detail}")]
    Constraint { column: &'static str, detail: String },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StoreError {
    /// True when the database could not be reached at all, as opposed to a
    /// statement being rejected for its data.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .is_some_and(|code| is_session_loss_sqlstate(&code)),
            StoreError::Database(
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed,
            ) => true,
            _ => false,
        }
    }
}

/// SQLSTATE codes the server reports when it is ending the session: class
/// `08` (connection exception) and the `57P0x` shutdown family.
pub fn is_session_loss_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What `upsert_auction` did with an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
    /// The row is already `completed`; nothing was written.
    AlreadyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertedAuction {
    pub key: AuctionKey,
    pub action: UpsertAction,
}

/// Durable storage for sellers, auctions, item specifics and bids.
///
/// Writes only happen through a [`StoreTx`] obtained from [`EntityStore::begin`],
/// so a caller can group every statement of one item into a single atomic unit.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Create all tables and indexes if absent. Safe on every startup.
    async fn ensure_schema(&self) -> StoreResult<()>;

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Snapshot of every `active` auction, joined with its seller's user id.
    async fn list_active_auctions(&self) -> StoreResult<Vec<Auction>>;

    async fn find_seller(&self, user_id: &str) -> StoreResult<Option<Seller>>;

    async fn find_auction(&self, item_id: &str) -> StoreResult<Option<Auction>>;

    async fn item_specifics(&self, auction: AuctionKey) -> StoreResult<BTreeMap<String, String>>;

    async fn bids(&self, auction: AuctionKey) -> StoreResult<Vec<Bid>>;
}

/// One open unit of work. Dropping it without [`StoreTx::commit`] discards
/// every write made through it.
#[async_trait]
pub trait StoreTx: Send {
    /// Look up a seller by user id, creating it if absent and refreshing
    /// rating, feedback and `updated_at` if present.
    async fn resolve_seller(&mut self, facts: &SellerFacts) -> StoreResult<SellerKey>;

    /// Insert the auction as `active`, or refresh its mutable fields while it
    /// is still active. A completed auction is never reopened.
    async fn upsert_auction(
        &mut self,
        listing: &ObservedListing,
        seller: SellerKey,
    ) -> StoreResult<UpsertedAuction>;

    /// Insert-or-overwrite each pair by `(auction, key)`. Keys absent from
    /// `specifics` are left untouched.
    async fn replace_item_specifics(
        &mut self,
        auction: AuctionKey,
        specifics: &BTreeMap<String, String>,
    ) -> StoreResult<()>;

    /// Insert a non-winning bid unless the same `(amount, time, bidder)` tuple
    /// already exists. Returns whether a row was inserted.
    async fn append_bid(&mut self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<bool>;

    /// Flag the bid as the winner, inserting it if it was never observed.
    async fn record_winning_bid(&mut self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<()>;

    /// Move an `active` auction to `completed` with its final price and bid
    /// count. Returns `None` when no active auction has this item id.
    async fn finalize_auction(
        &mut self,
        item_id: &str,
        final_price: Decimal,
        bid_count: i32,
    ) -> StoreResult<Option<AuctionKey>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Enforce a `VARCHAR(255)` column width.
pub(crate) fn check_varchar(column: &'static str, value: &str) -> StoreResult<()> {
    let len = value.chars().count();
    if len > VARCHAR_LIMIT {
        return Err(StoreError::Constraint {
            column,
            detail: format!("{len} characters exceeds {VARCHAR_LIMIT}"),
        });
    }
    Ok(())
}

/// Round to cents the way Postgres does and enforce the `NUMERIC(10, 2)`
/// range, so the value the store compares against is the value it persists.
pub(crate) fn money(column: &'static str, value: Decimal) -> StoreResult<Decimal> {
    let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    if rounded.abs() > MONEY_MAX {
        return Err(StoreError::Constraint {
            column,
            detail: format!("{value} does not fit NUMERIC(10, 2)"),
        });
    }
    Ok(rounded)
}

pub(crate) fn optional_money(column: &'static str, value: Option<Decimal>) -> StoreResult<Option<Decimal>> {
    value.map(|v| money(column, v)).transpose()
}
