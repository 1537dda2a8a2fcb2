#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bidtrack_adapters::{ListingSource, SourceError};
use bidtrack_core::{BidFacts, ObservedCompletion, ObservedListing, SellerFacts};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Notify;

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 18, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

pub fn listing(item_id: &str, seller: &str) -> ObservedListing {
    ObservedListing {
        item_id: item_id.to_string(),
        title: format!("NVIDIA GeForce RTX 3090 #{item_id}"),
        url: format!("https://www.ebay.com/itm/{item_id}"),
        seller: SellerFacts {
            user_id: seller.to_string(),
            rating: Some(99.2),
            feedback_score: Some(310),
        },
        search_pattern: "rtx 3090".to_string(),
        description: None,
        condition: Some("Used".to_string()),
        current_price: Some(dec!(100.00)),
        buy_it_now_price: None,
        shipping_cost: Some(dec!(15.00)),
        bid_count: 0,
        end_time: at(20, 0),
        start_time: None,
        item_specifics: None,
        bids: None,
    }
}

pub fn bid(amount: Decimal, time: DateTime<Utc>, bidder: Option<&str>) -> BidFacts {
    BidFacts {
        amount,
        time,
        bidder_id: bidder.map(str::to_string),
    }
}

pub fn completion(item_id: &str, final_price: Decimal, bids: Option<Vec<BidFacts>>) -> ObservedCompletion {
    ObservedCompletion {
        item_id: item_id.to_string(),
        final_price,
        bid_count: bids.as_ref().map_or(0, |b| b.len() as i32),
        bids,
    }
}

/// In-process listing source that replays fixed batches and counts calls.
#[derive(Default)]
pub struct ScriptedSource {
    active: Mutex<Vec<ObservedListing>>,
    completed: Mutex<Vec<ObservedCompletion>>,
    failures_left: AtomicUsize,
    active_calls: AtomicUsize,
    completed_calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
}

impl ScriptedSource {
    pub fn new(active: Vec<ObservedListing>, completed: Vec<ObservedCompletion>) -> Self {
        Self {
            active: Mutex::new(active),
            completed: Mutex::new(completed),
            ..Default::default()
        }
    }

    /// The first `n` active fetches fail as if the feed were down.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Active fetches block until the returned handle is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Notified every time an active fetch starts.
    pub fn entered(&self) -> Arc<Notify> {
        self.entered.clone()
    }

    pub fn set_active(&self, active: Vec<ObservedListing>) {
        *self.active.lock().expect("lock") = active;
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    pub fn completed_calls(&self) -> usize {
        self.completed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_active(
        &self,
        _pattern: &str,
        _lookahead_hours: u32,
    ) -> Result<Vec<ObservedListing>, SourceError> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::HttpStatus {
                status: 503,
                url: "scripted://listings/active".to_string(),
            });
        }
        Ok(self.active.lock().expect("lock").clone())
    }

    async fn fetch_completed(&self, _lookback_hours: u32) -> Result<Vec<ObservedCompletion>, SourceError> {
        self.completed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.completed.lock().expect("lock").clone())
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
