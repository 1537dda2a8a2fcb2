mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use bidtrack_core::AuctionStatus;
use bidtrack_storage::{EntityStore, MemoryStore};
use bidtrack_sync::Reconciler;
use common::{at, bid, completion, listing};
use rust_decimal_macros::dec;

fn reconciler() -> (MemoryStore, Reconciler) {
    let store = MemoryStore::new();
    let reconciler = Reconciler::new(Arc::new(store.clone()));
    (store, reconciler)
}

#[tokio::test]
async fn empty_batches_are_no_ops() {
    let (store, reconciler) = reconciler();
    let active = reconciler.apply_active_batch(&[]).await.expect("active");
    let completed = reconciler.apply_completed_batch(&[]).await.expect("completed");
    assert_eq!(active.processed(), 0);
    assert_eq!(completed.seen, 0);
    assert_eq!(store.counts().await.auctions, 0);
}

#[tokio::test]
async fn replaying_a_batch_converges_to_the_same_state() {
    let (store, reconciler) = reconciler();
    let mut first = listing("1001", "s1");
    first.item_specifics = Some(BTreeMap::from([("Brand".to_string(), "NVIDIA".to_string())]));
    first.bids = Some(vec![bid(dec!(95.00), at(12, 0), Some("b1"))]);
    let batch = vec![first, listing("1002", "s2")];

    let once = reconciler.apply_active_batch(&batch).await.expect("first pass");
    let counts_once = store.counts().await;
    let twice = reconciler.apply_active_batch(&batch).await.expect("second pass");

    assert_eq!(once.inserted, 2);
    assert_eq!(twice.inserted, 0);
    assert_eq!(twice.updated, 2);
    assert_eq!(store.counts().await, counts_once);
    assert_eq!(counts_once.sellers, 2);
    assert_eq!(counts_once.auctions, 2);
    assert_eq!(counts_once.item_specifics, 1);
    assert_eq!(counts_once.bids, 1);
}

#[tokio::test]
async fn business_keys_stay_unique_and_sellers_refresh() {
    let (store, reconciler) = reconciler();
    let mut relisted = listing("2001", "shared");
    relisted.seller.rating = Some(97.5);
    relisted.current_price = Some(dec!(130.00));
    let batch = vec![listing("2001", "shared"), listing("2002", "shared"), relisted];

    let report = reconciler.apply_active_batch(&batch).await.expect("batch");
    assert_eq!((report.inserted, report.updated), (2, 1));

    let counts = store.counts().await;
    assert_eq!(counts.sellers, 1);
    assert_eq!(counts.auctions, 2);
    let seller = store.find_seller("shared").await.expect("read").expect("seller");
    assert_eq!(seller.rating, Some(97.5));
    let auction = store.find_auction("2001").await.expect("read").expect("auction");
    assert_eq!(auction.current_price, Some(dec!(130.00)));
    assert_eq!(auction.seller_user_id, "shared");
}

#[tokio::test]
async fn item_specifics_merge_rather_than_replace() {
    let (store, reconciler) = reconciler();
    let mut first = listing("3001", "s1");
    first.item_specifics = Some(BTreeMap::from([("A".to_string(), "1".to_string())]));
    let mut second = listing("3001", "s1");
    second.item_specifics = Some(BTreeMap::from([("B".to_string(), "2".to_string())]));
    let mut third = listing("3001", "s1");
    third.item_specifics = Some(BTreeMap::from([("A".to_string(), "3".to_string())]));

    reconciler.apply_active_batch(&[first, second, third]).await.expect("batch");

    let key = store.find_auction("3001").await.expect("read").expect("auction").key;
    let specifics = store.item_specifics(key).await.expect("specifics");
    assert_eq!(
        specifics,
        BTreeMap::from([("A".to_string(), "3".to_string()), ("B".to_string(), "2".to_string())])
    );
}

#[tokio::test]
async fn bids_are_deduplicated_by_amount_time_and_bidder() {
    let (store, reconciler) = reconciler();
    let mut early = listing("4001", "s1");
    early.bids = Some(vec![bid(dec!(101.00), at(10, 0), Some("b1"))]);
    let mut later = listing("4001", "s1");
    later.bids = Some(vec![
        bid(dec!(101.00), at(10, 0), Some("b1")),
        bid(dec!(101.00), at(10, 5), Some("b1")),
        bid(dec!(110.00), at(10, 5), Some("b2")),
    ]);

    reconciler.apply_active_batch(&[early.clone()]).await.expect("early");
    reconciler.apply_active_batch(&[later]).await.expect("later");
    reconciler.apply_active_batch(&[early]).await.expect("replay");

    let key = store.find_auction("4001").await.expect("read").expect("auction").key;
    let bids = store.bids(key).await.expect("bids");
    assert_eq!(bids.len(), 3);
    assert!(bids.iter().all(|b| !b.winning));
}

#[tokio::test]
async fn malformed_item_is_skipped_and_the_rest_persist() {
    let (store, reconciler) = reconciler();
    let batch = vec![listing("5001", "s1"), listing("", "s2"), listing("5003", "s3")];

    let report = reconciler.apply_active_batch(&batch).await.expect("batch");

    assert_eq!(report.seen, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.skipped_items, vec![String::new()]);
    assert!(store.find_auction("5001").await.expect("read").is_some());
    assert!(store.find_auction("5003").await.expect("read").is_some());
    assert!(store.find_seller("s2").await.expect("read").is_none());
}

#[tokio::test]
async fn constraint_failure_rolls_back_the_whole_item() {
    let (store, reconciler) = reconciler();
    let mut oversized = listing("6002", "s-oversized");
    oversized.item_specifics = Some(BTreeMap::from([("k".repeat(300), "v".to_string())]));
    oversized.bids = Some(vec![bid(dec!(90.00), at(9, 0), None)]);
    let batch = vec![listing("6001", "s1"), oversized, listing("6003", "s3")];

    let report = reconciler.apply_active_batch(&batch).await.expect("batch");

    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped_items, vec!["6002".to_string()]);
    assert!(store.find_auction("6002").await.expect("read").is_none());
    assert!(store.find_seller("s-oversized").await.expect("read").is_none());
    assert_eq!(store.counts().await.bids, 0);
}

#[tokio::test]
async fn completion_records_only_the_last_bid_as_winner() {
    let (store, reconciler) = reconciler();
    let active = reconciler
        .apply_active_batch(&[listing("123", "s1")])
        .await
        .expect("active");
    assert_eq!(active.inserted, 1);
    let counts = store.counts().await;
    assert_eq!((counts.sellers, counts.auctions), (1, 1));
    let auction = store.find_auction("123").await.expect("read").expect("auction");
    assert_eq!(auction.status, AuctionStatus::Active);
    assert_eq!(auction.current_price, Some(dec!(100.00)));

    let history = vec![bid(dec!(120), at(19, 0), None), bid(dec!(150), at(19, 58), None)];
    let report = reconciler
        .apply_completed_batch(&[completion("123", dec!(150.00), Some(history))])
        .await
        .expect("completed");
    assert_eq!((report.finalized, report.winning_bids), (1, 1));

    let auction = store.find_auction("123").await.expect("read").expect("auction");
    assert_eq!(auction.status, AuctionStatus::Completed);
    assert_eq!(auction.current_price, Some(dec!(150.00)));
    assert_eq!(auction.bid_count, 2);

    let bids = store.bids(auction.key).await.expect("bids");
    assert_eq!(bids.len(), 1, "earlier bids of the completion are not inserted");
    assert_eq!(bids[0].amount, dec!(150));
    assert_eq!(bids[0].time, at(19, 58));
    assert!(bids[0].winning);
}

#[tokio::test]
async fn winning_bid_reuses_a_bid_seen_while_active() {
    let (store, reconciler) = reconciler();
    let mut observed = listing("124", "s1");
    observed.bids = Some(vec![
        bid(dec!(120), at(19, 0), Some("b1")),
        bid(dec!(150), at(19, 58), Some("b2")),
    ]);
    reconciler.apply_active_batch(&[observed.clone()]).await.expect("active");

    reconciler
        .apply_completed_batch(&[completion("124", dec!(150), observed.bids.clone())])
        .await
        .expect("completed");

    let key = store.find_auction("124").await.expect("read").expect("auction").key;
    let bids = store.bids(key).await.expect("bids");
    assert_eq!(bids.len(), 2);
    let winners: Vec<_> = bids.iter().filter(|b| b.winning).map(|b| b.amount).collect();
    assert_eq!(winners, vec![dec!(150)]);
}

#[tokio::test]
async fn completed_auctions_never_reopen() {
    let (store, reconciler) = reconciler();
    reconciler.apply_active_batch(&[listing("7001", "s1")]).await.expect("active");
    reconciler
        .apply_completed_batch(&[completion("7001", dec!(180.00), None)])
        .await
        .expect("completed");

    let mut stale = listing("7001", "s1");
    stale.current_price = Some(dec!(110.00));
    let replay = reconciler.apply_active_batch(&[stale]).await.expect("replay");
    assert_eq!(replay.unchanged, 1);

    let again = reconciler
        .apply_completed_batch(&[completion("7001", dec!(999.00), None)])
        .await
        .expect("second completion");
    assert_eq!((again.finalized, again.untracked), (0, 1));

    let auction = store.find_auction("7001").await.expect("read").expect("auction");
    assert_eq!(auction.status, AuctionStatus::Completed);
    assert_eq!(auction.current_price, Some(dec!(180.00)));
    assert!(store.list_active_auctions().await.expect("active").is_empty());
}

#[tokio::test]
async fn completion_for_unknown_item_is_benign() {
    let (store, reconciler) = reconciler();
    let report = reconciler
        .apply_completed_batch(&[
            completion("never-seen", dec!(50.00), Some(vec![bid(dec!(50), at(8, 0), None)])),
            completion("", dec!(1.00), None),
        ])
        .await
        .expect("completed");
    assert_eq!(report.untracked, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.counts().await.bids, 0);
}

#[tokio::test]
async fn losing_the_store_aborts_the_batch() {
    let (store, reconciler) = reconciler();
    store.set_unavailable(true);
    let err = reconciler
        .apply_active_batch(&[listing("8001", "s1")])
        .await
        .unwrap_err();
    assert!(err.is_connectivity());

    store.set_unavailable(false);
    let report = reconciler
        .apply_active_batch(&[listing("8001", "s1")])
        .await
        .expect("recovered");
    assert_eq!(report.inserted, 1);
}
