//! Narrow contracts for the systems the settlement engine depends on but does not implement.

use prizeline_types::{Address, Amount, StandingEntry, TournamentId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Acknowledgment of a submitted transfer.
///
/// The reference is persisted on the PENDING record, so a watcher can be rebuilt from the
/// ledger after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferHandle {
    pub transaction_ref: String,
}

impl TransferHandle {
    pub fn new(transaction_ref: impl Into<String>) -> Self {
        Self {
            transaction_ref: transaction_ref.into(),
        }
    }
}

/// Irrevocable inclusion of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed_block: u64,
}

/// Failure reported by a [FundsTransfer].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Worth retrying (RPC hiccup, nonce race, rate limit).
    #[error("transient transfer failure: {0}")]
    Transient(String),
    /// Will not succeed as submitted (invalid destination, revert, payer mismatch).
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

/// Moves funds between accounts.
pub trait FundsTransfer: Clone + Send + Sync + 'static {
    /// Submit a transfer and return once the transfer system has acknowledged it.
    fn submit_transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> impl Future<Output = Result<TransferHandle, TransferError>> + Send;

    /// Resolve once the transfer is irrevocably included, or has definitely failed.
    ///
    /// Callers bound this with their own timeout.
    fn watch_confirmation(
        &self,
        handle: &TransferHandle,
    ) -> impl Future<Output = Result<Confirmation, TransferError>> + Send;
}

/// Reports how much an account can spend.
pub trait BalanceSource: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn available_balance(
        &self,
        account: &Address,
    ) -> impl Future<Output = Result<Amount, Self::Error>> + Send;
}

/// Supplies a tournament's final ranked standings.
pub trait StandingsSource: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn standings(
        &self,
        tournament_id: TournamentId,
    ) -> impl Future<Output = Result<Vec<StandingEntry>, Self::Error>> + Send;
}
