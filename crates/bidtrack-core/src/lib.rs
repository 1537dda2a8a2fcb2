//! Core domain model for bidtrack: what a listing source observes and what the
//! entity store persists.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bidtrack-core";

/// Surrogate key of a persisted seller row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SellerKey(pub i32);

/// Surrogate key of a persisted auction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionKey(pub i32);

impl fmt::Display for SellerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seller#{}", self.0)
    }
}

impl fmt::Display for AuctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "auction#{}", self.0)
    }
}

/// Lifecycle of a tracked auction. Only ever moves `Active -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Active,
    Completed,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Active => "active",
            AuctionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown auction status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for AuctionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AuctionStatus::Active),
            "completed" => Ok(AuctionStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Why an observation was rejected before any write was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObservationError {
    #[error("{entity} is missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },
    #[error("`{field}` must not be negative (got {value})")]
    NegativeAmount { field: &'static str, value: Decimal },
    #[error("`{field}` must not be negative (got {value})")]
    NegativeCount { field: &'static str, value: i32 },
}

/// Seller attributes as seen on a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerFacts {
    #[serde(default)]
    pub user_id: String,
    pub rating: Option<f64>,
    pub feedback_score: Option<i32>,
}

/// One bid from an observed bid history.
///
/// `(amount, time, bidder_id)` is the natural identity of a bid within an
/// auction; the store never holds two rows with the same tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidFacts {
    pub amount: Decimal,
    pub time: DateTime<Utc>,
    pub bidder_id: Option<String>,
}

impl BidFacts {
    pub fn same_bid(&self, amount: Decimal, time: DateTime<Utc>, bidder_id: Option<&str>) -> bool {
        self.amount == amount && self.time == time && self.bidder_id.as_deref() == bidder_id
    }
}

/// An active listing as handed over by a listing source.
///
/// Missing required strings decode as empty and are rejected per item by
/// [`ObservedListing::validate`]. Records without a seller, bid count or end
/// time do not decode at all; sources drop those one record at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedListing {
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub seller: SellerFacts,
    #[serde(default)]
    pub search_pattern: String,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub current_price: Option<Decimal>,
    pub buy_it_now_price: Option<Decimal>,
    pub shipping_cost: Option<Decimal>,
    pub bid_count: i32,
    pub end_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub item_specifics: Option<BTreeMap<String, String>>,
    pub bids: Option<Vec<BidFacts>>,
}

impl ObservedListing {
    pub fn validate(&self) -> Result<(), ObservationError> {
        const ENTITY: &str = "listing";
        require(ENTITY, "item_id", &self.item_id)?;
        require(ENTITY, "title", &self.title)?;
        require(ENTITY, "url", &self.url)?;
        require(ENTITY, "seller.user_id", &self.seller.user_id)?;
        require(ENTITY, "search_pattern", &self.search_pattern)?;
        non_negative("current_price", self.current_price)?;
        non_negative("buy_it_now_price", self.buy_it_now_price)?;
        non_negative("shipping_cost", self.shipping_cost)?;
        non_negative_count("bid_count", self.bid_count)?;
        for bid in self.bids.iter().flatten() {
            non_negative("bids.amount", Some(bid.amount))?;
        }
        Ok(())
    }
}

/// A finished auction as handed over by a listing source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedCompletion {
    #[serde(default)]
    pub item_id: String,
    pub final_price: Decimal,
    pub bid_count: i32,
    pub bids: Option<Vec<BidFacts>>,
}

impl ObservedCompletion {
    pub fn validate(&self) -> Result<(), ObservationError> {
        require("completion", "item_id", &self.item_id)?;
        non_negative("final_price", Some(self.final_price))?;
        non_negative_count("bid_count", self.bid_count)?;
        for bid in self.bids.iter().flatten() {
            non_negative("bids.amount", Some(bid.amount))?;
        }
        Ok(())
    }

    /// The last bid of the observed history, taken as the winner.
    pub fn winning_bid(&self) -> Option<&BidFacts> {
        self.bids.as_deref().and_then(<[BidFacts]>::last)
    }
}

fn require(entity: &'static str, field: &'static str, value: &str) -> Result<(), ObservationError> {
    if value.trim().is_empty() {
        return Err(ObservationError::MissingField { entity, field });
    }
    Ok(())
}

fn non_negative(field: &'static str, value: Option<Decimal>) -> Result<(), ObservationError> {
    match value {
        Some(value) if value < Decimal::ZERO => {
            Err(ObservationError::NegativeAmount { field, value })
        }
        _ => Ok(()),
    }
}

fn non_negative_count(field: &'static str, value: i32) -> Result<(), ObservationError> {
    if value < 0 {
        return Err(ObservationError::NegativeCount { field, value });
    }
    Ok(())
}

/// Persisted seller row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seller {
    pub key: SellerKey,
    pub user_id: String,
    pub rating: Option<f64>,
    pub feedback_score: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted auction row, joined with its seller's business identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    pub key: AuctionKey,
    pub item_id: String,
    pub title: String,
    pub url: String,
    pub seller: SellerKey,
    pub seller_user_id: String,
    pub search_pattern: String,
    pub description: Option<String>,
    pub condition: Option<String>,
    pub current_price: Option<Decimal>,
    pub buy_it_now_price: Option<Decimal>,
    pub shipping_cost: Option<Decimal>,
    pub bid_count: i32,
    pub end_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub status: AuctionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted bid row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: i32,
    pub auction: AuctionKey,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
    pub bidder_id: Option<String>,
    pub winning: bool,
    pub created_at: DateTime<Utc>,
}
