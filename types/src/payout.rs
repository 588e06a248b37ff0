use crate::{Address, Amount, Error, Rank, TournamentId};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Lifecycle state of a [PayoutRecord].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Success,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Success => "SUCCESS",
            PayoutStatus::Failed => "FAILED",
        }
    }

    /// Terminal records are never modified again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, PayoutStatus::Pending)
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PayoutStatus::Pending),
            "SUCCESS" => Ok(PayoutStatus::Success),
            "FAILED" => Ok(PayoutStatus::Failed),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// Why a payout ended up FAILED.
///
/// The reason is written as a prefix of the record's error detail so that operators can tell
/// a transfer the chain refused apart from one that was simply never seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The transfer collaborator refused the transfer, or it reverted on chain.
    Rejected,
    /// Submission kept failing transiently until the retry budget ran out.
    Submission,
    /// No confirmation arrived before the confirmation timeout.
    Timeout,
    /// Confirmation lookups failed in a way that could not be attributed to the transfer.
    Unconfirmed,
    /// The process stopped before the submission was acknowledged.
    Interrupted,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Rejected => "rejected",
            FailureReason::Submission => "submission",
            FailureReason::Timeout => "timeout",
            FailureReason::Unconfirmed => "unconfirmed",
            FailureReason::Interrupted => "interrupted",
        }
    }

    /// Format an error detail for a FAILED record.
    pub fn detail(self, message: impl fmt::Display) -> String {
        format!("{}: {message}", self.as_str())
    }

    /// Recover the reason from an error detail written by [FailureReason::detail].
    pub fn from_detail(detail: &str) -> Option<Self> {
        let (prefix, _) = detail.split_once(':')?;
        [
            FailureReason::Rejected,
            FailureReason::Submission,
            FailureReason::Timeout,
            FailureReason::Unconfirmed,
            FailureReason::Interrupted,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == prefix)
    }
}

/// Ledger key of a payout attempt. Ordering is (tournament, rank, attempt).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutId {
    pub tournament_id: TournamentId,
    pub rank: Rank,
    /// 1 for the first attempt at a rank, incremented by every retry.
    pub attempt: u32,
}

impl PayoutId {
    pub fn new(tournament_id: TournamentId, rank: Rank, attempt: u32) -> Self {
        Self {
            tournament_id,
            rank,
            attempt,
        }
    }

    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self
        }
    }
}

impl fmt::Display for PayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tournament {} rank {} attempt {}",
            self.tournament_id, self.rank, self.attempt
        )
    }
}

/// One attempt at paying a tier's amount to a standing's recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRecord {
    pub tournament_id: TournamentId,
    pub rank: Rank,
    pub attempt: u32,
    #[serde(rename = "recipientAddress")]
    pub recipient: Address,
    pub amount: Amount,
    pub status: PayoutStatus,
    pub transaction_ref: Option<String>,
    pub confirmed_block: Option<u64>,
    pub error_detail: Option<String>,
    /// Unix milliseconds.
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at_ms: u64,
}

impl PayoutRecord {
    /// A fresh PENDING record, written just before the transfer is submitted.
    pub fn pending(id: PayoutId, recipient: Address, amount: Amount, now_ms: u64) -> Self {
        Self {
            tournament_id: id.tournament_id,
            rank: id.rank,
            attempt: id.attempt,
            recipient,
            amount,
            status: PayoutStatus::Pending,
            transaction_ref: None,
            confirmed_block: None,
            error_detail: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn id(&self) -> PayoutId {
        PayoutId::new(self.tournament_id, self.rank, self.attempt)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.error_detail
            .as_deref()
            .and_then(FailureReason::from_detail)
    }
}
