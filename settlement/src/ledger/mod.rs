//! Distribution ledger: append-only history of payout attempts.
//!
//! A new attempt is always appended as a new record. Only an open PENDING record may be
//! updated; SUCCESS and FAILED records are immutable.

use prizeline_types::{PayoutId, PayoutRecord, PayoutStatus, TournamentId};
use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use thiserror::Error;

mod sqlite;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("payout {0} already recorded")]
    DuplicateRecord(PayoutId),
    #[error("payout {id} is out of sequence (expected attempt {expected})")]
    AttemptOutOfSequence { id: PayoutId, expected: u32 },
    #[error("payout {0} must be recorded as PENDING")]
    NotPending(PayoutId),
    #[error("payout {0} not found")]
    UnknownRecord(PayoutId),
    #[error("payout {id} is {status} and cannot be modified")]
    ImmutableRecord { id: PayoutId, status: PayoutStatus },
    #[error("payout {0} cannot fail without an error detail")]
    MissingErrorDetail(PayoutId),
    #[error("payout {0} cannot succeed without a confirmed block")]
    MissingConfirmation(PayoutId),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Change applied to an open PENDING record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: PayoutStatus,
    pub transaction_ref: Option<String>,
    pub confirmed_block: Option<u64>,
    pub error_detail: Option<String>,
    pub at_ms: u64,
}

impl StatusUpdate {
    /// The transfer was acknowledged; the record stays PENDING with its reference attached.
    pub fn acknowledged(transaction_ref: impl Into<String>, at_ms: u64) -> Self {
        Self {
            status: PayoutStatus::Pending,
            transaction_ref: Some(transaction_ref.into()),
            confirmed_block: None,
            error_detail: None,
            at_ms,
        }
    }

    pub fn succeeded(confirmed_block: u64, at_ms: u64) -> Self {
        Self {
            status: PayoutStatus::Success,
            transaction_ref: None,
            confirmed_block: Some(confirmed_block),
            error_detail: None,
            at_ms,
        }
    }

    pub fn failed(error_detail: impl Into<String>, at_ms: u64) -> Self {
        Self {
            status: PayoutStatus::Failed,
            transaction_ref: None,
            confirmed_block: None,
            error_detail: Some(error_detail.into()),
            at_ms,
        }
    }

    /// Attach `transaction_ref`, overwriting any reference already on the record.
    pub fn with_transaction_ref(mut self, transaction_ref: impl Into<String>) -> Self {
        self.transaction_ref = Some(transaction_ref.into());
        self
    }
}

/// Persistent record of payout attempts.
pub trait Ledger: Send + Sync + 'static {
    /// Append a new PENDING attempt.
    fn record(&self, record: PayoutRecord) -> Result<(), LedgerError>;

    /// Update an open PENDING record and return its new state.
    fn update_status(
        &self,
        id: PayoutId,
        update: StatusUpdate,
    ) -> Result<PayoutRecord, LedgerError>;

    /// Every attempt for `tournament_id`, ordered by rank then attempt.
    fn get(&self, tournament_id: TournamentId) -> Result<Vec<PayoutRecord>, LedgerError>;

    /// Every PENDING record across tournaments.
    fn pending(&self) -> Result<Vec<PayoutRecord>, LedgerError>;
}

/// Check that `record` may be appended after `latest_attempt` (0 when the rank has none).
pub(crate) fn check_append(record: &PayoutRecord, latest_attempt: u32) -> Result<(), LedgerError> {
    let id = record.id();
    if record.status != PayoutStatus::Pending {
        return Err(LedgerError::NotPending(id));
    }
    if id.attempt != 0 && id.attempt <= latest_attempt {
        return Err(LedgerError::DuplicateRecord(id));
    }
    let expected = latest_attempt.saturating_add(1);
    if id.attempt != expected {
        return Err(LedgerError::AttemptOutOfSequence { id, expected });
    }
    Ok(())
}

/// Apply `update` to `record`, enforcing the PENDING-only transition rules.
pub(crate) fn apply_update(
    record: &mut PayoutRecord,
    update: StatusUpdate,
) -> Result<(), LedgerError> {
    let id = record.id();
    if record.status.is_terminal() {
        return Err(LedgerError::ImmutableRecord {
            id,
            status: record.status,
        });
    }
    match update.status {
        PayoutStatus::Failed if update.error_detail.is_none() => {
            return Err(LedgerError::MissingErrorDetail(id));
        }
        PayoutStatus::Success if update.confirmed_block.is_none() => {
            return Err(LedgerError::MissingConfirmation(id));
        }
        _ => {}
    }
    record.status = update.status;
    if update.transaction_ref.is_some() {
        record.transaction_ref = update.transaction_ref;
    }
    if update.confirmed_block.is_some() {
        record.confirmed_block = update.confirmed_block;
    }
    if update.error_detail.is_some() {
        record.error_detail = update.error_detail;
    }
    record.updated_at_ms = update.at_ms.max(record.created_at_ms);
    Ok(())
}

/// In-memory ledger, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<BTreeMap<PayoutId, PayoutRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PayoutId, PayoutRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PayoutId, PayoutRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Ledger for MemoryLedger {
    fn record(&self, record: PayoutRecord) -> Result<(), LedgerError> {
        let mut records = self.write();
        let id = record.id();
        let first = PayoutId::new(id.tournament_id, id.rank, 0);
        let last = PayoutId::new(id.tournament_id, id.rank, u32::MAX);
        let latest_attempt = records
            .range(first..=last)
            .next_back()
            .map(|(id, _)| id.attempt)
            .unwrap_or(0);
        check_append(&record, latest_attempt)?;
        records.insert(id, record);
        Ok(())
    }

    fn update_status(
        &self,
        id: PayoutId,
        update: StatusUpdate,
    ) -> Result<PayoutRecord, LedgerError> {
        let mut records = self.write();
        let record = records
            .get_mut(&id)
            .ok_or(LedgerError::UnknownRecord(id))?;
        apply_update(record, update)?;
        Ok(record.clone())
    }

    fn get(&self, tournament_id: TournamentId) -> Result<Vec<PayoutRecord>, LedgerError> {
        let first = PayoutId::new(tournament_id, 0, 0);
        let last = PayoutId::new(tournament_id, u32::MAX, u32::MAX);
        Ok(self
            .read()
            .range(first..=last)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn pending(&self) -> Result<Vec<PayoutRecord>, LedgerError> {
        Ok(self
            .read()
            .values()
            .filter(|record| record.status == PayoutStatus::Pending)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prizeline_types::{Address, Amount};

    fn pending(tournament_id: TournamentId, rank: u32, attempt: u32) -> PayoutRecord {
        PayoutRecord::pending(
            PayoutId::new(tournament_id, rank, attempt),
            Address::new("0xAA").unwrap(),
            Amount::new(100),
            1_000,
        )
    }

    /// Exercises the shared ledger contract against any implementation.
    pub(crate) fn exercise_ledger(ledger: &impl Ledger) {
        ledger.record(pending(1, 2, 1)).unwrap();
        ledger.record(pending(1, 1, 1)).unwrap();
        ledger.record(pending(2, 1, 1)).unwrap();

        // Attempts are strictly sequential per rank.
        assert!(matches!(
            ledger.record(pending(1, 1, 1)),
            Err(LedgerError::DuplicateRecord(_))
        ));
        assert!(matches!(
            ledger.record(pending(1, 1, 3)),
            Err(LedgerError::AttemptOutOfSequence { expected: 2, .. })
        ));
        let mut settled = pending(1, 3, 1);
        settled.status = PayoutStatus::Success;
        assert!(matches!(
            ledger.record(settled),
            Err(LedgerError::NotPending(_))
        ));

        // Acknowledgment keeps the record open.
        let id = PayoutId::new(1, 1, 1);
        let acked = ledger
            .update_status(id, StatusUpdate::acknowledged("0xfeed", 1_500))
            .unwrap();
        assert_eq!(acked.status, PayoutStatus::Pending);
        assert_eq!(acked.transaction_ref.as_deref(), Some("0xfeed"));
        assert_eq!(acked.updated_at_ms, 1_500);

        let done = ledger
            .update_status(id, StatusUpdate::succeeded(42, 2_000))
            .unwrap();
        assert_eq!(done.status, PayoutStatus::Success);
        assert_eq!(done.confirmed_block, Some(42));
        assert_eq!(done.transaction_ref.as_deref(), Some("0xfeed"));

        // Terminal records are frozen.
        assert!(matches!(
            ledger.update_status(id, StatusUpdate::failed("rejected: late", 3_000)),
            Err(LedgerError::ImmutableRecord {
                status: PayoutStatus::Success,
                ..
            })
        ));

        let failed_id = PayoutId::new(1, 2, 1);
        assert!(matches!(
            ledger.update_status(
                failed_id,
                StatusUpdate {
                    error_detail: None,
                    ..StatusUpdate::failed("", 2_000)
                }
            ),
            Err(LedgerError::MissingErrorDetail(_))
        ));
        ledger
            .update_status(failed_id, StatusUpdate::failed("rejected: bad address", 2_000))
            .unwrap();
        // A retry appends the next attempt.
        ledger.record(pending(1, 2, 2)).unwrap();

        assert!(matches!(
            ledger.update_status(PayoutId::new(9, 9, 9), StatusUpdate::succeeded(1, 1)),
            Err(LedgerError::UnknownRecord(_))
        ));

        let ids: Vec<_> = ledger.get(1).unwrap().iter().map(|r| r.id()).collect();
        assert_eq!(
            ids,
            vec![
                PayoutId::new(1, 1, 1),
                PayoutId::new(1, 2, 1),
                PayoutId::new(1, 2, 2),
            ]
        );
        let mut open: Vec<_> = ledger.pending().unwrap().iter().map(|r| r.id()).collect();
        open.sort();
        assert_eq!(open, vec![PayoutId::new(1, 2, 2), PayoutId::new(2, 1, 1)]);
        assert!(ledger.get(3).unwrap().is_empty());
    }

    #[test]
    fn memory_ledger_enforces_contract() {
        exercise_ledger(&MemoryLedger::new());
    }

    #[test]
    fn update_never_moves_time_backwards() {
        let mut record = pending(1, 1, 1);
        apply_update(&mut record, StatusUpdate::acknowledged("0x1", 10)).unwrap();
        assert_eq!(record.updated_at_ms, record.created_at_ms);
    }
}
