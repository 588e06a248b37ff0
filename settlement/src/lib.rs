//! Prizeline settlement layer.
//!
//! This crate turns a tournament's final standings and reward schedule into on-chain payouts,
//! and keeps an append-only ledger of every attempt.
//!
//! ## Components
//! - [schedule]: what each rank is owed ([RewardSchedule]).
//! - [ledger]: every payout attempt and its outcome ([Ledger]).
//! - [guard]: all-or-nothing funding check before a batch ([BalanceGuard]).
//! - [engine]: computes due payouts, submits them in rank order and reconciles confirmations
//!   ([SettlementEngine]).
//!
//! ## Consistency invariants
//! - A SUCCESS or FAILED record is never modified. A retry appends a new attempt.
//! - Submissions from one payer account are serialized; confirmations are watched
//!   concurrently and always end in a terminal state (SUCCESS, or FAILED after the timeout).
//! - The ledger is the only coordination state, so [SettlementEngine::recover] can resume
//!   after a crash.

use prizeline_types::{Address, Amount, Rank, TournamentId};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

mod backoff;
pub mod cancel;
pub mod collaborators;
pub mod engine;
pub mod guard;
pub mod ledger;
pub mod metrics;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
mod recovery;
pub mod schedule;
mod watcher;

pub use cancel::{cancellation, CancelHandle, CancelSignal};
pub use collaborators::{
    BalanceSource, Confirmation, FundsTransfer, StandingsSource, TransferError, TransferHandle,
};
pub use engine::{Confirmations, EngineConfig, PayerLocks, Recovery, Settlement, SettlementEngine};
pub use guard::{Authorization, BalanceGuard};
pub use ledger::{Ledger, LedgerError, MemoryLedger, SqliteStore, StatusUpdate};
pub use metrics::SettlementMetrics;
pub use schedule::{MemorySchedule, RewardSchedule, ScheduleError};

/// Boxed error returned by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for settlement operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no reward tiers configured for tournament {0}")]
    NotFound(TournamentId),
    #[error("no reward tier for tournament {tournament_id} rank {rank}")]
    TierNotFound {
        tournament_id: TournamentId,
        rank: Rank,
    },
    #[error("standings for tournament {tournament_id} are missing ranks {missing:?}")]
    IncompleteStandings {
        tournament_id: TournamentId,
        missing: Vec<Rank>,
    },
    #[error("invalid standings for tournament {tournament_id}: {reason}")]
    InvalidStandings {
        tournament_id: TournamentId,
        reason: String,
    },
    #[error("insufficient funds in {payer}: required {required}, available {available}")]
    InsufficientFunds {
        payer: Address,
        required: Amount,
        available: Amount,
    },
    #[error("tournament {tournament_id} rank {rank} is already settled")]
    AlreadySettled {
        tournament_id: TournamentId,
        rank: Rank,
    },
    #[error("tournament {tournament_id} rank {rank} has a payout awaiting confirmation")]
    PayoutInFlight {
        tournament_id: TournamentId,
        rank: Rank,
    },
    #[error("reward total for tournament {0} overflows")]
    AmountOverflow(TournamentId),
    #[error("standings unavailable for tournament {tournament_id}")]
    Standings {
        tournament_id: TournamentId,
        #[source]
        source: BoxError,
    },
    #[error("balance query failed for {payer}")]
    Balance {
        payer: Address,
        #[source]
        source: BoxError,
    },
    #[error("schedule error: {0}")]
    Schedule(ScheduleError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<ScheduleError> for Error {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::NotFound(tournament_id) => Error::NotFound(tournament_id),
            other => Error::Schedule(other),
        }
    }
}

/// Result type for settlement operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Wall-clock time in Unix milliseconds, as stored in [prizeline_types::PayoutRecord].
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
