//! Applies observed batches to the entity store, one transaction per item.

use std::sync::Arc;

use bidtrack_core::{ObservationError, ObservedCompletion, ObservedListing};
use bidtrack_storage::{EntityStore, StoreError, StoreTx, UpsertAction};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a single item was skipped.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid observation: {0}")]
    Invalid(#[from] ObservationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub seen: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Re-observed after completion; left as stored.
    pub unchanged: usize,
    pub skipped: usize,
    pub skipped_items: Vec<String>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionReport {
    pub seen: usize,
    pub finalized: usize,
    /// Never tracked, or already completed.
    pub untracked: usize,
    pub winning_bids: usize,
    pub skipped: usize,
    pub skipped_items: Vec<String>,
}

enum CompletionOutcome {
    Untracked,
    Finalized { winning_bid: bool },
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Upsert every listing. A listing that cannot be written is logged and
    /// skipped; only losing the database aborts the batch.
    pub async fn apply_active_batch(&self, items: &[ObservedListing]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport {
            seen: items.len(),
            ..Default::default()
        };

        for (position, listing) in items.iter().enumerate() {
            match self.apply_listing(listing).await {
                Ok(UpsertAction::Inserted) => report.inserted += 1,
                Ok(UpsertAction::Updated) => report.updated += 1,
                Ok(UpsertAction::AlreadyCompleted) => {
                    debug!(item_id = %listing.item_id, "listing already completed; left as stored");
                    report.unchanged += 1;
                }
                Err(ReconcileError::Store(err)) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    warn!(item_id = %listing.item_id, position, error = %err, "skipping active listing");
                    report.skipped += 1;
                    report.skipped_items.push(listing.item_id.clone());
                }
            }
        }
        Ok(report)
    }

    /// Finalize every completion that matches a tracked active auction and
    /// record its winning bid. Unknown or already-completed items are counted
    /// as untracked.
    pub async fn apply_completed_batch(
        &self,
        items: &[ObservedCompletion],
    ) -> Result<CompletionReport, StoreError> {
        let mut report = CompletionReport {
            seen: items.len(),
            ..Default::default()
        };

        for (position, completion) in items.iter().enumerate() {
            match self.apply_completion(completion).await {
                Ok(CompletionOutcome::Untracked) => report.untracked += 1,
                Ok(CompletionOutcome::Finalized { winning_bid }) => {
                    report.finalized += 1;
                    if winning_bid {
                        report.winning_bids += 1;
                    }
                }
                Err(ReconcileError::Store(err)) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    warn!(item_id = %completion.item_id, position, error = %err, "skipping completion");
                    report.skipped += 1;
                    report.skipped_items.push(completion.item_id.clone());
                }
            }
        }
        Ok(report)
    }

    async fn apply_listing(&self, listing: &ObservedListing) -> Result<UpsertAction, ReconcileError> {
        listing.validate()?;
        let mut tx = self.store.begin().await?;
        match write_listing(&mut *tx, listing).await {
            Ok(action) => {
                tx.commit().await?;
                Ok(action)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(item_id = %listing.item_id, error = %rollback_err, "rollback failed");
                }
                Err(err.into())
            }
        }
    }

    async fn apply_completion(&self, completion: &ObservedCompletion) -> Result<CompletionOutcome, ReconcileError> {
        completion.validate()?;
        let mut tx = self.store.begin().await?;
        match write_completion(&mut *tx, completion).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(item_id = %completion.item_id, error = %rollback_err, "rollback failed");
                }
                Err(err.into())
            }
        }
    }
}

async fn write_listing(tx: &mut dyn StoreTx, listing: &ObservedListing) -> Result<UpsertAction, StoreError> {
    let seller = tx.resolve_seller(&listing.seller).await?;
    let upserted = tx.upsert_auction(listing, seller).await?;
    if upserted.action == UpsertAction::AlreadyCompleted {
        return Ok(upserted.action);
    }

    if let Some(specifics) = listing.item_specifics.as_ref().filter(|s| !s.is_empty()) {
        tx.replace_item_specifics(upserted.key, specifics).await?;
    }
    let mut appended = 0usize;
    for bid in listing.bids.iter().flatten() {
        if tx.append_bid(upserted.key, bid).await? {
            appended += 1;
        }
    }
    if appended > 0 {
        debug!(item_id = %listing.item_id, appended, "new bids recorded");
    }
    Ok(upserted.action)
}

/// Only the last bid of the observed history is written, flagged as the
/// winner. Earlier bids of a completion are not inserted.
async fn write_completion(
    tx: &mut dyn StoreTx,
    completion: &ObservedCompletion,
) -> Result<CompletionOutcome, StoreError> {
    let Some(key) = tx
        .finalize_auction(&completion.item_id, completion.final_price, completion.bid_count)
        .await?
    else {
        debug!(item_id = %completion.item_id, "completion for untracked or finished auction");
        return Ok(CompletionOutcome::Untracked);
    };

    let winning_bid = match completion.winning_bid() {
        Some(bid) => {
            tx.record_winning_bid(key, bid).await?;
            true
        }
        None => false,
    };
    Ok(CompletionOutcome::Finalized { winning_bid })
}
