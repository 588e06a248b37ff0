use crate::{Amount, Rank, TournamentId};
use serde::{Deserialize, Serialize};

/// Outcome of a settlement (or retry) call.
///
/// `newly_succeeded`, `failed` and `pending` only count records created by the call itself;
/// ranks paid by an earlier call show up in `already_settled`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub tournament_id: TournamentId,
    pub already_settled: usize,
    pub newly_succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    /// Ranks skipped because an earlier attempt is still PENDING.
    pub in_flight: Vec<Rank>,
    /// Ranks skipped because their latest attempt FAILED; they wait for an explicit retry.
    pub awaiting_retry: Vec<Rank>,
    /// Ranks never submitted because the settlement was cancelled.
    pub not_submitted: Vec<Rank>,
    /// Total the balance guard authorized for this call.
    pub authorized: Amount,
}

impl SettlementReport {
    pub fn new(tournament_id: TournamentId) -> Self {
        Self {
            tournament_id,
            ..Default::default()
        }
    }

    /// Number of records the call created.
    pub fn attempted(&self) -> usize {
        self.newly_succeeded + self.failed + self.pending
    }

    /// True once nothing created by this call is still waiting for confirmation.
    pub fn is_resolved(&self) -> bool {
        self.pending == 0
    }
}

/// Outcome of a crash-recovery scan over PENDING records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub timed_out: usize,
    pub interrupted: usize,
    pub rejected: usize,
    /// Watchers resumed for records that are still within their confirmation window.
    pub resumed: usize,
    /// Records too young to judge that have no transaction reference yet.
    pub deferred: usize,
}
