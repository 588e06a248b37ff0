//! Crash recovery over PENDING records.
//!
//! The ledger is the only coordination state, so after a restart every PENDING record is
//! either resolved, resumed or left for a later pass depending on its age and whether its
//! submission was acknowledged.

use crate::{
    collaborators::{BalanceSource, FundsTransfer, StandingsSource, TransferHandle},
    engine::{tally_recovery, Confirmations, Recovery, SettlementEngine},
    ledger::{Ledger, StatusUpdate},
    now_ms,
    schedule::RewardSchedule,
    watcher::spawn_watcher,
    Result,
};
use futures::future::join_all;
use prizeline_types::{FailureReason, RecoveryReport};
use std::time::Duration;
use tracing::{error, info, warn};

impl<L, R, S, B, T> SettlementEngine<L, R, S, B, T>
where
    L: Ledger,
    R: RewardSchedule,
    S: StandingsSource,
    B: BalanceSource,
    T: FundsTransfer,
{
    /// Resolve PENDING records left behind by an earlier process.
    ///
    /// - Acknowledged and older than the confirmation timeout: probed once, bounded by the
    ///   recovery probe timeout.
    /// - Acknowledged and younger: a watcher resumes with the remaining budget.
    /// - Never acknowledged and older: FAILED as interrupted.
    /// - Never acknowledged and younger: deferred to a later pass.
    pub async fn recover(&self) -> Result<Recovery> {
        let now = now_ms();
        let timeout_ms = self.config.confirmation_timeout.as_millis() as u64;
        let mut report = RecoveryReport::default();
        let mut probes = Vec::new();
        let mut resumed = Confirmations::default();

        for record in self.ledger.pending()? {
            report.scanned += 1;
            let id = record.id();
            let age_ms = now.saturating_sub(record.created_at_ms);
            let expired = age_ms >= timeout_ms;
            match (record.transaction_ref, expired) {
                (Some(transaction_ref), true) => {
                    probes.push(spawn_watcher(
                        self.ledger.clone(),
                        self.transfer.clone(),
                        self.metrics.clone(),
                        id,
                        TransferHandle::new(transaction_ref),
                        self.config.recovery_probe_timeout,
                    ));
                }
                (Some(transaction_ref), false) => {
                    let budget = Duration::from_millis(timeout_ms - age_ms);
                    info!(%id, %transaction_ref, budget_ms = timeout_ms - age_ms, "resuming confirmation watch");
                    resumed.push(spawn_watcher(
                        self.ledger.clone(),
                        self.transfer.clone(),
                        self.metrics.clone(),
                        id,
                        TransferHandle::new(transaction_ref),
                        budget,
                    ));
                    report.resumed += 1;
                }
                (None, true) => {
                    let detail = FailureReason::Interrupted
                        .detail(format!("submission not acknowledged after {age_ms}ms"));
                    self.ledger
                        .update_status(id, StatusUpdate::failed(detail, now_ms()))?;
                    self.metrics.failed.inc();
                    warn!(
                        %id,
                        recipient = %record.recipient,
                        amount = %record.amount,
                        "payout interrupted before acknowledgment"
                    );
                    report.interrupted += 1;
                }
                (None, false) => report.deferred += 1,
            }
        }

        for result in join_all(probes).await {
            match result {
                Ok(Some(record)) => tally_recovery(&mut report, &record),
                Ok(None) => {}
                Err(err) => error!(?err, "recovery probe panicked"),
            }
        }
        info!(
            scanned = report.scanned,
            confirmed = report.confirmed,
            timed_out = report.timed_out,
            interrupted = report.interrupted,
            rejected = report.rejected,
            resumed = report.resumed,
            deferred = report.deferred,
            "recovery scan finished"
        );
        Ok(Recovery {
            report,
            confirmations: resumed,
        })
    }
}
