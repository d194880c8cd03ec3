//! Per-wallet credit accounting for fulfilled assignments.
//!
//! Credits accrue continuously as `elapsed * rate` and are coalesced into a
//! single non-finalized ledger entry per wallet. Flushing finalizes entries
//! so they are never incremented again; confirmation from the metaverse API
//! removes them.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Credits granted per hour of fulfilled assignment time.
pub const CREDITS_PER_HOUR: f64 = 0.10;

/// One pending payment toward a wallet.
#[derive(Debug, Clone, Serialize)]
pub struct CreditTransaction {
    /// Transaction identity, echoed back by the metaverse API.
    pub id: Uuid,
    /// Destination wallet.
    pub wallet_id: Uuid,
    /// Accrued amount in credits.
    pub amount: f64,
    /// Finalized entries are immutable and awaiting confirmation.
    pub finalized: bool,
}

/// The ledger of pending assignment credits.
#[derive(Debug, Default)]
pub struct CreditLedger {
    entries: HashMap<Uuid, Vec<CreditTransaction>>,
}

impl CreditLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accrue credits for a wallet over an elapsed interval.
    ///
    /// Increments the wallet's non-finalized entry if one exists, otherwise
    /// opens a fresh one.
    pub fn accrue(&mut self, wallet_id: Uuid, elapsed: Duration) {
        let amount = elapsed.as_secs_f64() / 3600.0 * CREDITS_PER_HOUR;
        let entries = self.entries.entry(wallet_id).or_default();

        if let Some(open) = entries.iter_mut().find(|entry| !entry.finalized) {
            open.amount += amount;
        } else {
            entries.push(CreditTransaction {
                id: Uuid::new_v4(),
                wallet_id,
                amount,
                finalized: false,
            });
        }
    }

    /// Finalize every open entry and return the transactions to submit.
    ///
    /// Idempotent: entries finalized by an earlier flush are not returned
    /// again, and their amounts never change.
    pub fn flush(&mut self) -> Vec<CreditTransaction> {
        let mut newly_finalized = Vec::new();
        for entries in self.entries.values_mut() {
            for entry in entries.iter_mut().filter(|entry| !entry.finalized) {
                entry.finalized = true;
                newly_finalized.push(entry.clone());
            }
        }
        newly_finalized
    }

    /// Remove a confirmed transaction.
    pub fn confirm(&mut self, wallet_id: Uuid, transaction_id: Uuid) -> bool {
        let Some(entries) = self.entries.get_mut(&wallet_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != transaction_id);
        let removed = entries.len() != before;
        if removed {
            debug!(wallet = %wallet_id, transaction = %transaction_id, "credit transaction confirmed");
        }
        if entries.is_empty() {
            self.entries.remove(&wallet_id);
        }
        removed
    }

    /// Total unconfirmed credits for a wallet.
    #[must_use]
    pub fn pending_total(&self, wallet_id: Uuid) -> f64 {
        self.entries
            .get(&wallet_id)
            .map(|entries| entries.iter().map(|entry| entry.amount).sum())
            .unwrap_or(0.0)
    }
}
