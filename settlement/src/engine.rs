//! Settlement engine.
//!
//! For a tournament, the engine joins the reward tiers with the final standings, skips ranks
//! the ledger already accounts for, checks the payer can fund the rest, then submits one
//! transfer per rank in ascending rank order. Each acknowledged transfer gets its own
//! confirmation watcher; submission never waits on confirmation.

use crate::{
    backoff::{jittered_backoff, submission_backoff},
    cancel::CancelSignal,
    collaborators::{BalanceSource, FundsTransfer, StandingsSource, TransferError, TransferHandle},
    guard::BalanceGuard,
    ledger::{Ledger, StatusUpdate},
    metrics::SettlementMetrics,
    now_ms,
    schedule::RewardSchedule,
    watcher::spawn_watcher,
    Error, Result,
};
use futures::future::join_all;
use prizeline_types::{
    Address, Amount, FailureReason, PayoutId, PayoutRecord, PayoutStatus, Rank, RecoveryReport,
    RewardTier, SettlementReport, StandingEntry, TournamentId,
};
use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroU32,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Tunables of a [SettlementEngine].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Account every payout is paid from.
    pub payer: Address,
    /// How long a submitted transfer may stay unconfirmed before it is marked FAILED.
    pub confirmation_timeout: Duration,
    /// Bound on a single confirmation lookup during crash recovery.
    pub recovery_probe_timeout: Duration,
    /// Submission attempts per payout, including the first.
    pub submit_attempts: NonZeroU32,
    /// Base delay between submission attempts (doubled on each retry, with jitter).
    pub submit_backoff: Duration,
    /// Balance held back from every funding check.
    pub balance_reserve: Amount,
}

impl EngineConfig {
    pub fn new(payer: Address) -> Self {
        Self {
            payer,
            confirmation_timeout: Duration::from_secs(120),
            recovery_probe_timeout: Duration::from_secs(10),
            submit_attempts: NonZeroU32::MIN.saturating_add(2),
            submit_backoff: Duration::from_millis(500),
            balance_reserve: Amount::ZERO,
        }
    }
}

/// Per-payer submission locks.
///
/// Engines that share a `PayerLocks` never have two submissions from the same payer in flight.
#[derive(Clone, Debug, Default)]
pub struct PayerLocks {
    locks: Arc<Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>>,
}

impl PayerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, payer: &Address) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(payer.clone())
            .or_default()
            .clone()
    }
}

/// Running confirmation watchers.
///
/// Dropping this value detaches the watchers; they still write their outcome to the ledger.
#[derive(Debug, Default)]
pub struct Confirmations {
    handles: Vec<JoinHandle<Option<PayoutRecord>>>,
}

impl Confirmations {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn push(&mut self, handle: JoinHandle<Option<PayoutRecord>>) {
        self.handles.push(handle);
    }

    /// Wait for every watcher and return the records they resolved.
    pub async fn join(self) -> Vec<PayoutRecord> {
        let mut resolved = Vec::with_capacity(self.handles.len());
        for result in join_all(self.handles).await {
            match result {
                Ok(Some(record)) => resolved.push(record),
                Ok(None) => {}
                Err(err) => error!(?err, "confirmation watcher panicked"),
            }
        }
        resolved
    }
}

/// Outcome of [SettlementEngine::settle] or [SettlementEngine::retry].
#[derive(Debug)]
pub struct Settlement<L> {
    /// Report as of the moment submission finished.
    pub report: SettlementReport,
    pub confirmations: Confirmations,
    ledger: Arc<L>,
    created: Vec<PayoutId>,
}

impl<L: Ledger> Settlement<L> {
    /// Records created by this call.
    pub fn created(&self) -> &[PayoutId] {
        &self.created
    }

    /// Wait for every confirmation watcher and return the final report.
    pub async fn finish(self) -> Result<SettlementReport> {
        let Settlement {
            mut report,
            confirmations,
            ledger,
            created,
        } = self;
        confirmations.join().await;
        summarize(ledger.as_ref(), &mut report, &created)?;
        Ok(report)
    }
}

/// Outcome of [SettlementEngine::recover].
#[derive(Debug)]
pub struct Recovery {
    /// Report as of the moment the scan finished. Resumed watchers are counted in `resumed`.
    pub report: RecoveryReport,
    pub confirmations: Confirmations,
}

impl Recovery {
    /// Wait for resumed watchers and fold their outcomes into the report.
    pub async fn finish(self) -> RecoveryReport {
        let Recovery {
            mut report,
            confirmations,
        } = self;
        for record in confirmations.join().await {
            tally_recovery(&mut report, &record);
        }
        report
    }
}

pub(crate) fn tally_recovery(report: &mut RecoveryReport, record: &PayoutRecord) {
    match (record.status, record.failure_reason()) {
        (PayoutStatus::Success, _) => report.confirmed += 1,
        (PayoutStatus::Failed, Some(FailureReason::Rejected)) => report.rejected += 1,
        (PayoutStatus::Failed, Some(FailureReason::Interrupted)) => report.interrupted += 1,
        (PayoutStatus::Failed, _) => report.timed_out += 1,
        (PayoutStatus::Pending, _) => {}
    }
}

/// Recount the records in `created` from the ledger.
fn summarize<L: Ledger + ?Sized>(
    ledger: &L,
    report: &mut SettlementReport,
    created: &[PayoutId],
) -> Result<()> {
    report.newly_succeeded = 0;
    report.failed = 0;
    report.pending = 0;
    if created.is_empty() {
        return Ok(());
    }
    let records = ledger.get(report.tournament_id)?;
    for record in records.iter().filter(|r| created.contains(&r.id())) {
        match record.status {
            PayoutStatus::Success => report.newly_succeeded += 1,
            PayoutStatus::Failed => report.failed += 1,
            PayoutStatus::Pending => report.pending += 1,
        }
    }
    Ok(())
}

/// A tier joined with the standing that earned it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DuePayout {
    pub rank: Rank,
    pub recipient: Address,
    pub amount: Amount,
}

/// Join `tiers` with `standings` by rank.
///
/// Standings below the last paid rank are ignored.
pub(crate) fn join_standings(
    tournament_id: TournamentId,
    tiers: &[RewardTier],
    standings: Vec<StandingEntry>,
) -> Result<Vec<DuePayout>> {
    let mut by_rank = BTreeMap::new();
    for entry in standings {
        if entry.tournament_id != tournament_id {
            return Err(Error::InvalidStandings {
                tournament_id,
                reason: format!(
                    "rank {} belongs to tournament {}",
                    entry.rank, entry.tournament_id
                ),
            });
        }
        let rank = entry.rank;
        if by_rank.insert(rank, entry).is_some() {
            return Err(Error::InvalidStandings {
                tournament_id,
                reason: format!("rank {rank} listed twice"),
            });
        }
    }

    let missing: Vec<Rank> = tiers
        .iter()
        .map(|tier| tier.rank)
        .filter(|rank| !by_rank.contains_key(rank))
        .collect();
    if !missing.is_empty() {
        return Err(Error::IncompleteStandings {
            tournament_id,
            missing,
        });
    }

    let mut due: Vec<DuePayout> = tiers
        .iter()
        .filter_map(|tier| {
            by_rank.remove(&tier.rank).map(|entry| DuePayout {
                rank: tier.rank,
                recipient: entry.recipient,
                amount: tier.amount,
            })
        })
        .collect();
    due.sort_by_key(|payout| payout.rank);
    Ok(due)
}

/// Latest attempt per rank.
fn latest_by_rank(records: &[PayoutRecord]) -> BTreeMap<Rank, &PayoutRecord> {
    let mut latest: BTreeMap<Rank, &PayoutRecord> = BTreeMap::new();
    for record in records {
        let entry = latest.entry(record.rank).or_insert(record);
        if record.attempt > entry.attempt {
            *entry = record;
        }
    }
    latest
}

/// Pays out tournament rewards from a single payer account.
pub struct SettlementEngine<L, R, S, B, T> {
    pub(crate) ledger: Arc<L>,
    pub(crate) schedule: Arc<R>,
    pub(crate) standings: S,
    pub(crate) guard: BalanceGuard<B>,
    pub(crate) transfer: T,
    pub(crate) config: EngineConfig,
    pub(crate) locks: PayerLocks,
    pub(crate) metrics: SettlementMetrics,
}

impl<L, R, S, B, T> SettlementEngine<L, R, S, B, T>
where
    L: Ledger,
    R: RewardSchedule,
    S: StandingsSource,
    B: BalanceSource,
    T: FundsTransfer,
{
    pub fn new(
        ledger: Arc<L>,
        schedule: Arc<R>,
        standings: S,
        balances: B,
        transfer: T,
        config: EngineConfig,
    ) -> Self {
        let guard = BalanceGuard::new(balances, config.balance_reserve);
        Self {
            ledger,
            schedule,
            standings,
            guard,
            transfer,
            config,
            locks: PayerLocks::new(),
            metrics: SettlementMetrics::default(),
        }
    }

    /// Share submission locks with other engines paying from the same accounts.
    pub fn with_payer_locks(mut self, locks: PayerLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_metrics(mut self, metrics: SettlementMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Pay every rank of `tournament_id` that the ledger does not already account for.
    pub async fn settle(&self, tournament_id: TournamentId) -> Result<Settlement<L>> {
        self.settle_with_cancel(tournament_id, CancelSignal::never())
            .await
    }

    /// [SettlementEngine::settle], stopping before the next submission once `cancel` fires.
    ///
    /// Transfers already submitted keep being watched.
    pub async fn settle_with_cancel(
        &self,
        tournament_id: TournamentId,
        cancel: CancelSignal,
    ) -> Result<Settlement<L>> {
        let tiers = self.schedule.tiers(tournament_id)?;
        let standings = self.fetch_standings(tournament_id).await?;
        let payouts = join_standings(tournament_id, &tiers, standings)?;

        let lock = self.locks.lock_for(&self.config.payer);
        let _guard = lock.lock_owned().await;

        let history = self.ledger.get(tournament_id)?;
        let latest = latest_by_rank(&history);
        let mut report = SettlementReport::new(tournament_id);
        let mut due = Vec::new();
        for payout in payouts {
            match latest.get(&payout.rank).map(|record| record.status) {
                Some(PayoutStatus::Success) => report.already_settled += 1,
                Some(PayoutStatus::Pending) => report.in_flight.push(payout.rank),
                Some(PayoutStatus::Failed) => report.awaiting_retry.push(payout.rank),
                None => due.push((PayoutId::new(tournament_id, payout.rank, 1), payout)),
            }
        }
        debug!(
            tournament_id,
            due = due.len(),
            already_settled = report.already_settled,
            in_flight = report.in_flight.len(),
            awaiting_retry = report.awaiting_retry.len(),
            "computed payout set"
        );

        self.submit_batch(report, due, cancel).await
    }

    /// Make a new attempt at a single rank whose latest attempt FAILED.
    ///
    /// A rank that was never attempted is paid as if by [SettlementEngine::settle].
    pub async fn retry(&self, tournament_id: TournamentId, rank: Rank) -> Result<Settlement<L>> {
        let tiers = self.schedule.tiers(tournament_id)?;
        let tier = tiers
            .into_iter()
            .find(|tier| tier.rank == rank)
            .ok_or(Error::TierNotFound {
                tournament_id,
                rank,
            })?;
        let standings = self.fetch_standings(tournament_id).await?;
        let mut payouts = join_standings(tournament_id, &[tier], standings)?;
        let Some(payout) = payouts.pop() else {
            return Err(Error::IncompleteStandings {
                tournament_id,
                missing: vec![rank],
            });
        };

        let lock = self.locks.lock_for(&self.config.payer);
        let _guard = lock.lock_owned().await;

        let history = self.ledger.get(tournament_id)?;
        let id = match latest_by_rank(&history).get(&rank) {
            Some(record) if record.status == PayoutStatus::Success => {
                return Err(Error::AlreadySettled {
                    tournament_id,
                    rank,
                });
            }
            Some(record) if record.status == PayoutStatus::Pending => {
                return Err(Error::PayoutInFlight {
                    tournament_id,
                    rank,
                });
            }
            Some(record) => record.id().next_attempt(),
            None => PayoutId::new(tournament_id, rank, 1),
        };
        info!(tournament_id, rank, attempt = id.attempt, "retrying payout");

        let report = SettlementReport::new(tournament_id);
        self.submit_batch(report, vec![(id, payout)], CancelSignal::never())
            .await
    }

    async fn fetch_standings(&self, tournament_id: TournamentId) -> Result<Vec<StandingEntry>> {
        self.standings
            .standings(tournament_id)
            .await
            .map_err(|err| Error::Standings {
                tournament_id,
                source: Box::new(err),
            })
    }

    /// Authorize and submit `due` in ascending rank order. Caller holds the payer lock.
    async fn submit_batch(
        &self,
        mut report: SettlementReport,
        due: Vec<(PayoutId, DuePayout)>,
        cancel: CancelSignal,
    ) -> Result<Settlement<L>> {
        let tournament_id = report.tournament_id;
        let mut confirmations = Confirmations::default();
        let mut created = Vec::with_capacity(due.len());
        if due.is_empty() {
            return Ok(Settlement {
                report,
                confirmations,
                ledger: self.ledger.clone(),
                created,
            });
        }

        let total = Amount::checked_sum(due.iter().map(|(_, payout)| payout.amount))
            .ok_or(Error::AmountOverflow(tournament_id))?;
        // The ledger belongs to this payer, so every PENDING record is money already spent.
        let committed = Amount::checked_sum(
            self.ledger
                .pending()?
                .iter()
                .map(|record| record.amount),
        )
        .ok_or(Error::AmountOverflow(tournament_id))?;
        let authorization = match self
            .guard
            .authorize(&self.config.payer, total, committed)
            .await
        {
            Ok(authorization) => authorization,
            Err(err) => {
                if matches!(err, Error::InsufficientFunds { .. }) {
                    self.metrics.batches_refused.inc();
                }
                return Err(err);
            }
        };
        report.authorized = authorization.total;
        info!(
            tournament_id,
            payouts = due.len(),
            total = %authorization.total,
            committed = %authorization.committed,
            available = %authorization.available,
            "batch authorized"
        );

        let mut remaining = due.into_iter();
        while let Some((id, payout)) = remaining.next() {
            if cancel.is_cancelled() {
                report.not_submitted.push(payout.rank);
                report
                    .not_submitted
                    .extend(remaining.by_ref().map(|(_, payout)| payout.rank));
                warn!(
                    tournament_id,
                    not_submitted = report.not_submitted.len(),
                    "settlement cancelled"
                );
                break;
            }
            created.push(id);
            if let Some(watcher) = self.submit_one(id, payout).await? {
                confirmations.push(watcher);
            }
        }

        summarize(self.ledger.as_ref(), &mut report, &created)?;
        Ok(Settlement {
            report,
            confirmations,
            ledger: self.ledger.clone(),
            created,
        })
    }

    /// Record, submit and start watching a single payout.
    ///
    /// Returns `None` when the submission failed and the record was marked FAILED.
    async fn submit_one(
        &self,
        id: PayoutId,
        payout: DuePayout,
    ) -> Result<Option<JoinHandle<Option<PayoutRecord>>>> {
        let DuePayout {
            rank,
            recipient,
            amount,
        } = payout;
        self.ledger.record(PayoutRecord::pending(
            id,
            recipient.clone(),
            amount,
            now_ms(),
        ))?;
        debug!(
            tournament_id = id.tournament_id,
            rank,
            attempt = id.attempt,
            %recipient,
            %amount,
            "payout recorded"
        );

        let handle = match self.submit_with_retries(id, &recipient, amount).await {
            Ok(handle) => handle,
            Err(err) => {
                let reason = if err.is_transient() {
                    FailureReason::Submission
                } else {
                    FailureReason::Rejected
                };
                self.ledger
                    .update_status(id, StatusUpdate::failed(reason.detail(&err), now_ms()))?;
                self.metrics.failed.inc();
                warn!(
                    tournament_id = id.tournament_id,
                    rank,
                    attempt = id.attempt,
                    %recipient,
                    %amount,
                    ?err,
                    "payout submission failed"
                );
                return Ok(None);
            }
        };

        if let Err(err) = self.ledger.update_status(
            id,
            StatusUpdate::acknowledged(handle.transaction_ref.clone(), now_ms()),
        ) {
            // The transfer is out. The detached watcher writes the reference with the outcome.
            error!(
                %id,
                transaction_ref = %handle.transaction_ref,
                ?err,
                "failed to attach transaction reference"
            );
            drop(spawn_watcher(
                self.ledger.clone(),
                self.transfer.clone(),
                self.metrics.clone(),
                id,
                handle,
                self.config.confirmation_timeout,
            ));
            return Err(err.into());
        }
        self.metrics.submitted.inc();
        info!(
            tournament_id = id.tournament_id,
            rank,
            attempt = id.attempt,
            %recipient,
            %amount,
            transaction_ref = %handle.transaction_ref,
            "payout submitted"
        );

        Ok(Some(spawn_watcher(
            self.ledger.clone(),
            self.transfer.clone(),
            self.metrics.clone(),
            id,
            handle,
            self.config.confirmation_timeout,
        )))
    }

    async fn submit_with_retries(
        &self,
        id: PayoutId,
        recipient: &Address,
        amount: Amount,
    ) -> std::result::Result<TransferHandle, TransferError> {
        let attempts = self.config.submit_attempts.get();
        let mut attempt = 1;
        loop {
            match self
                .transfer
                .submit_transfer(&self.config.payer, recipient, amount)
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = jittered_backoff(
                        &mut rand::thread_rng(),
                        submission_backoff(self.config.submit_backoff, attempt),
                    );
                    self.metrics.submission_retries.inc();
                    warn!(
                        %id,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        ?err,
                        "transient submission failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rank: Rank, recipient: &str) -> StandingEntry {
        StandingEntry::new(7, rank, Address::new(recipient).unwrap())
    }

    fn tier(rank: Rank, amount: u128) -> RewardTier {
        RewardTier {
            tournament_id: 7,
            rank,
            amount: Amount::new(amount),
        }
    }

    #[test]
    fn join_pairs_tiers_with_standings() {
        let tiers = [tier(1, 100), tier(2, 50)];
        let due = join_standings(
            7,
            &tiers,
            vec![entry(3, "0xCC"), entry(2, "0xBB"), entry(1, "0xAA")],
        )
        .unwrap();
        assert_eq!(
            due,
            vec![
                DuePayout {
                    rank: 1,
                    recipient: Address::new("0xAA").unwrap(),
                    amount: Amount::new(100),
                },
                DuePayout {
                    rank: 2,
                    recipient: Address::new("0xBB").unwrap(),
                    amount: Amount::new(50),
                },
            ]
        );
    }

    #[test]
    fn join_reports_every_missing_rank() {
        let tiers = [tier(1, 100), tier(2, 50), tier(3, 25)];
        let err = join_standings(7, &tiers, vec![entry(2, "0xBB")]).unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteStandings { tournament_id: 7, ref missing } if missing == &vec![1, 3]
        ));
    }

    #[test]
    fn join_rejects_duplicate_and_foreign_entries() {
        let tiers = [tier(1, 100)];
        assert!(matches!(
            join_standings(7, &tiers, vec![entry(1, "0xAA"), entry(1, "0xBB")]),
            Err(Error::InvalidStandings { .. })
        ));
        let foreign = StandingEntry::new(8, 1, Address::new("0xAA").unwrap());
        assert!(matches!(
            join_standings(7, &tiers, vec![foreign]),
            Err(Error::InvalidStandings { .. })
        ));
    }

    #[test]
    fn latest_attempt_wins() {
        let payer = Address::new("0xAA").unwrap();
        let records = vec![
            PayoutRecord::pending(PayoutId::new(7, 1, 2), payer.clone(), Amount::new(1), 0),
            PayoutRecord::pending(PayoutId::new(7, 1, 1), payer.clone(), Amount::new(1), 0),
            PayoutRecord::pending(PayoutId::new(7, 2, 1), payer, Amount::new(1), 0),
        ];
        let latest = latest_by_rank(&records);
        assert_eq!(latest[&1].attempt, 2);
        assert_eq!(latest[&2].attempt, 1);
    }
}
