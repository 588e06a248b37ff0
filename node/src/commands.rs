//! Operations behind the `prizeline` subcommands.

use prizeline_settlement::{
    BalanceSource, CancelSignal, Error, FundsTransfer, Ledger, MemorySchedule, RewardSchedule,
    ScheduleError, Settlement, SettlementEngine, SqliteStore, StandingsSource,
};
use prizeline_types::{
    Amount, PayoutRecord, PayoutStatus, RecoveryReport, SettlementReport, TournamentId,
};
use serde::Serialize;
use tracing::info;

/// Ledger contents of one tournament, as printed by `report`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReport {
    pub tournament_id: TournamentId,
    /// Sum of SUCCESS amounts.
    pub paid: Amount,
    pub records: Vec<PayoutRecord>,
}

/// Store every tournament of `schedule` in `store`.
///
/// Tournaments are written one at a time; the first one whose tiers are frozen stops the run.
pub fn configure(
    store: &SqliteStore,
    schedule: &MemorySchedule,
) -> Result<Vec<TournamentId>, ScheduleError> {
    let mut configured = Vec::new();
    for (tournament_id, tiers) in schedule.tournaments() {
        let ranks = tiers.len();
        store.configure_tiers(tournament_id, tiers)?;
        info!(tournament_id, ranks, "configured reward tiers");
        configured.push(tournament_id);
    }
    Ok(configured)
}

pub async fn settle<L, R, S, B, T>(
    engine: &SettlementEngine<L, R, S, B, T>,
    tournament_id: TournamentId,
    wait: bool,
    cancel: CancelSignal,
) -> Result<SettlementReport, Error>
where
    L: Ledger,
    R: RewardSchedule,
    S: StandingsSource,
    B: BalanceSource,
    T: FundsTransfer,
{
    let settlement = engine.settle_with_cancel(tournament_id, cancel).await?;
    conclude(settlement, wait).await
}

pub async fn retry<L, R, S, B, T>(
    engine: &SettlementEngine<L, R, S, B, T>,
    tournament_id: TournamentId,
    rank: u32,
    wait: bool,
) -> Result<SettlementReport, Error>
where
    L: Ledger,
    R: RewardSchedule,
    S: StandingsSource,
    B: BalanceSource,
    T: FundsTransfer,
{
    let settlement = engine.retry(tournament_id, rank).await?;
    conclude(settlement, wait).await
}

/// Resolve stale PENDING records and wait for any resumed watchers.
pub async fn recover<L, R, S, B, T>(
    engine: &SettlementEngine<L, R, S, B, T>,
) -> Result<RecoveryReport, Error>
where
    L: Ledger,
    R: RewardSchedule,
    S: StandingsSource,
    B: BalanceSource,
    T: FundsTransfer,
{
    let recovery = engine.recover().await?;
    Ok(recovery.finish().await)
}

pub fn ledger_report<L: Ledger>(
    ledger: &L,
    tournament_id: TournamentId,
) -> Result<LedgerReport, Error> {
    let records = ledger.get(tournament_id)?;
    let paid = Amount::checked_sum(
        records
            .iter()
            .filter(|record| record.status == PayoutStatus::Success)
            .map(|record| record.amount),
    )
    .ok_or(Error::AmountOverflow(tournament_id))?;
    Ok(LedgerReport {
        tournament_id,
        paid,
        records,
    })
}

async fn conclude<L: Ledger>(
    settlement: Settlement<L>,
    wait: bool,
) -> Result<SettlementReport, Error> {
    if wait {
        return settlement.finish().await;
    }
    if !settlement.confirmations.is_empty() {
        // Watchers die with the process; `recover` picks their records up later.
        info!(
            watchers = settlement.confirmations.len(),
            "not waiting for confirmations"
        );
    }
    Ok(settlement.report)
}
