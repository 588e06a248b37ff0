//! Common types used throughout prizeline.
//!
//! The data model mirrors the persisted shape of the payout ledger: a tournament's
//! [RewardTier]s say what is owed, its [StandingEntry]s say who is owed it, and each
//! [PayoutRecord] is one attempt at paying a single rank.

pub mod amount;
pub mod payout;
pub mod report;
pub mod schedule;

pub use amount::{Address, Amount, MAX_DECIMALS};
pub use payout::{FailureReason, PayoutId, PayoutRecord, PayoutStatus};
pub use report::{RecoveryReport, SettlementReport};
pub use schedule::{RewardTier, StandingEntry};

use thiserror::Error;

/// Identifier of a tournament.
pub type TournamentId = u64;

/// Final position in a tournament. Ranks start at 1.
pub type Rank = u32;

/// Errors raised while parsing or validating model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),
    #[error("amount {value:?} has more than {decimals} fractional digits")]
    TooPrecise { value: String, decimals: u32 },
    #[error("unsupported decimals: {0} (max {MAX_DECIMALS})")]
    UnsupportedDecimals(u32),
    #[error("amount overflow")]
    Overflow,
    #[error("rank must be >= 1")]
    InvalidRank,
    #[error("address must not be empty")]
    EmptyAddress,
    #[error("unknown payout status: {0:?}")]
    UnknownStatus(String),
}

/// Ensure `rank` is a valid (1-based) position.
pub fn validate_rank(rank: Rank) -> Result<(), Error> {
    if rank == 0 {
        return Err(Error::InvalidRank);
    }
    Ok(())
}
