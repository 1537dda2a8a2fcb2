//! In-process entity store with the same transactional and constraint
//! behaviour as the Postgres backend. Used by the reconciler and scheduler
//! tests, and by `bidtrack` runs that only need a dry pass over fixtures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bidtrack_core::{
    Auction, AuctionKey, AuctionStatus, Bid, BidFacts, ObservedListing, Seller, SellerFacts,
    SellerKey,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    check_varchar, money, optional_money, EntityStore, StoreError, StoreResult, StoreTx,
    UpsertAction, UpsertedAuction,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_seller: i32,
    next_auction: i32,
    next_bid: i32,
    sellers: BTreeMap<String, Seller>,
    auctions: BTreeMap<String, Auction>,
    item_specifics: BTreeMap<(AuctionKey, String), String>,
    bids: Vec<Bid>,
}

impl MemoryState {
    fn seller_by_key(&self, key: SellerKey) -> Option<&Seller> {
        self.sellers.values().find(|s| s.key == key)
    }

    fn auction_exists(&self, key: AuctionKey) -> bool {
        self.auctions.values().any(|a| a.key == key)
    }
}

/// Row counts per table, for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryCounts {
    pub sellers: usize,
    pub auctions: usize,
    pub item_specifics: usize,
    pub bids: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn counts(&self) -> MemoryCounts {
        let state = self.state.lock().await;
        MemoryCounts {
            sellers: state.sellers.len(),
            auctions: state.auctions.len(),
            item_specifics: state.item_specifics.len(),
            bids: state.bids.len(),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        self.check_available()?;
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }

    async fn list_active_auctions(&self) -> StoreResult<Vec<Auction>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut active: Vec<Auction> = state
            .auctions
            .values()
            .filter(|a| a.status == AuctionStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.end_time.cmp(&b.end_time).then(a.key.cmp(&b.key)));
        Ok(active)
    }

    async fn find_seller(&self, user_id: &str) -> StoreResult<Option<Seller>> {
        self.check_available()?;
        Ok(self.state.lock().await.sellers.get(user_id).cloned())
    }

    async fn find_auction(&self, item_id: &str) -> StoreResult<Option<Auction>> {
        self.check_available()?;
        Ok(self.state.lock().await.auctions.get(item_id).cloned())
    }

    async fn item_specifics(&self, auction: AuctionKey) -> StoreResult<BTreeMap<String, String>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .item_specifics
            .iter()
            .filter(|((owner, _), _)| *owner == auction)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn bids(&self, auction: AuctionKey) -> StoreResult<Vec<Bid>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut bids: Vec<Bid> = state
            .bids
            .iter()
            .filter(|b| b.auction == auction)
            .cloned()
            .collect();
        bids.sort_by(|a, b| a.time.cmp(&b.time).then(a.id.cmp(&b.id)));
        Ok(bids)
    }
}

/// Writes land in `staged`; commit swaps it in under the held lock.
struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

fn same_tuple(bid: &Bid, auction: AuctionKey, amount: Decimal, time: DateTime<Utc>, bidder: Option<&str>) -> bool {
    bid.auction == auction && bid.amount == amount && bid.time == time && bid.bidder_id.as_deref() == bidder
}

impl MemoryTx {
    fn bid_row(&mut self, auction: AuctionKey, bid: &BidFacts, amount: Decimal, winning: bool) -> Bid {
        self.staged.next_bid += 1;
        Bid {
            id: self.staged.next_bid,
            auction,
            amount,
            time: bid.time,
            bidder_id: bid.bidder_id.clone(),
            winning,
            created_at: Utc::now(),
        }
    }

    fn checked_bid(&self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<Decimal> {
        let amount = money("bids.bid_amount", bid.amount)?;
        if let Some(bidder) = &bid.bidder_id {
            check_varchar("bids.bidder_id", bidder)?;
        }
        if !self.staged.auction_exists(auction) {
            return Err(StoreError::Constraint {
                column: "bids.auction_id",
                detail: format!("{auction} does not exist"),
            });
        }
        Ok(amount)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn resolve_seller(&mut self, facts: &SellerFacts) -> StoreResult<SellerKey> {
        check_varchar("sellers.ebay_user_id", &facts.user_id)?;
        let now = Utc::now();
        if let Some(seller) = self.staged.sellers.get_mut(&facts.user_id) {
            seller.rating = facts.rating;
            seller.feedback_score = facts.feedback_score;
            seller.updated_at = now;
            return Ok(seller.key);
        }
        self.staged.next_seller += 1;
        let key = SellerKey(self.staged.next_seller);
        self.staged.sellers.insert(
            facts.user_id.clone(),
            Seller {
                key,
                user_id: facts.user_id.clone(),
                rating: facts.rating,
                feedback_score: facts.feedback_score,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(key)
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
        let seller_user_id = self
            .staged
            .seller_by_key(seller)
            .map(|s| s.user_id.clone())
            .ok_or_else(|| StoreError::Constraint {
                column: "auctions.seller_id",
                detail: format!("{seller} does not exist"),
            })?;
        let now = Utc::now();

        if let Some(existing) = self.staged.auctions.get_mut(&listing.item_id) {
            if existing.status == AuctionStatus::Completed {
                return Ok(UpsertedAuction {
                    key: existing.key,
                    action: UpsertAction::AlreadyCompleted,
                });
            }
            existing.title = listing.title.clone();
            existing.url = listing.url.clone();
            existing.seller = seller;
            existing.seller_user_id = seller_user_id;
            existing.description = listing.description.clone();
            existing.condition = listing.condition.clone();
            existing.current_price = current_price;
            existing.buy_it_now_price = buy_it_now_price;
            existing.shipping_cost = shipping_cost;
            existing.bid_count = listing.bid_count;
            existing.updated_at = now;
            return Ok(UpsertedAuction {
                key: existing.key,
                action: UpsertAction::Updated,
            });
        }

        self.staged.next_auction += 1;
        let key = AuctionKey(self.staged.next_auction);
        self.staged.auctions.insert(
            listing.item_id.clone(),
            Auction {
                key,
                item_id: listing.item_id.clone(),
                title: listing.title.clone(),
                url: listing.url.clone(),
                seller,
                seller_user_id,
                search_pattern: listing.search_pattern.clone(),
                description: listing.description.clone(),
                condition: listing.condition.clone(),
                current_price,
                buy_it_now_price,
                shipping_cost,
                bid_count: listing.bid_count,
                end_time: listing.end_time,
                start_time: listing.start_time,
                status: AuctionStatus::Active,
                created_at: now,
                updated_at: now,
            },
        );
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
            if !self.staged.auction_exists(auction) {
                return Err(StoreError::Constraint {
                    column: "item_specifics.auction_id",
                    detail: format!("{auction} does not exist"),
                });
            }
            self.staged
                .item_specifics
                .insert((auction, key.clone()), value.clone());
        }
        Ok(())
    }

    async fn append_bid(&mut self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<bool> {
        let amount = self.checked_bid(auction, bid)?;
        let bidder = bid.bidder_id.as_deref();
        if self
            .staged
            .bids
            .iter()
            .any(|b| same_tuple(b, auction, amount, bid.time, bidder))
        {
            return Ok(false);
        }
        let row = self.bid_row(auction, bid, amount, false);
        self.staged.bids.push(row);
        Ok(true)
    }

    async fn record_winning_bid(&mut self, auction: AuctionKey, bid: &BidFacts) -> StoreResult<()> {
        let amount = self.checked_bid(auction, bid)?;
        let bidder = bid.bidder_id.as_deref();
        let mut flagged = false;
        for row in self
            .staged
            .bids
            .iter_mut()
            .filter(|b| same_tuple(b, auction, amount, bid.time, bidder))
        {
            row.winning = true;
            flagged = true;
        }
        if !flagged {
            let row = self.bid_row(auction, bid, amount, true);
            self.staged.bids.push(row);
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
        match self.staged.auctions.get_mut(item_id) {
            Some(auction) if auction.status == AuctionStatus::Active => {
                auction.status = AuctionStatus::Completed;
                auction.current_price = Some(final_price);
                auction.bid_count = bid_count;
                auction.updated_at = Utc::now();
                Ok(Some(auction.key))
            }
            _ => Ok(None),
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
