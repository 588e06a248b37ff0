use super::{apply_update, check_append, Ledger, LedgerError, StatusUpdate};
use crate::schedule::{validate_tiers, RewardSchedule, ScheduleError};
use prizeline_types::{
    Address, Amount, PayoutId, PayoutRecord, PayoutStatus, Rank, RewardTier, TournamentId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};
use tracing::debug;

const PAYOUT_COLUMNS: &str = "tournament_id, rank, attempt, recipient, amount, status, \
     transaction_ref, confirmed_block, error_detail, created_at_ms, updated_at_ms";

/// SQLite-backed ledger and reward schedule.
///
/// Tiers and payouts live in one database so that a tournament's tiers can be frozen as soon
/// as its first payout is recorded.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "opened ledger");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the reward tiers of `tournament_id`.
    ///
    /// Fails with [ScheduleError::DistributionStarted] once any payout has been recorded for the
    /// tournament.
    pub fn configure_tiers(
        &self,
        tournament_id: TournamentId,
        tiers: impl IntoIterator<Item = (Rank, Amount)>,
    ) -> Result<(), ScheduleError> {
        let tiers = validate_tiers(tournament_id, tiers)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let payouts: i64 = tx.query_row(
            "SELECT COUNT(*) FROM payouts WHERE tournament_id = ?1",
            params![tournament_id],
            |row| row.get(0),
        )?;
        if payouts > 0 {
            return Err(ScheduleError::DistributionStarted(tournament_id));
        }
        tx.execute(
            "DELETE FROM reward_tiers WHERE tournament_id = ?1",
            params![tournament_id],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO reward_tiers (tournament_id, rank, amount) VALUES (?1, ?2, ?3)",
            )?;
            for (rank, amount) in &tiers {
                insert.execute(params![tournament_id, rank, amount.get().to_string()])?;
            }
        }
        tx.commit()?;
        debug!(tournament_id, tiers = tiers.len(), "configured reward tiers");
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         CREATE TABLE IF NOT EXISTS reward_tiers (
             tournament_id INTEGER NOT NULL,
             rank INTEGER NOT NULL,
             amount TEXT NOT NULL,
             PRIMARY KEY (tournament_id, rank)
         );
         CREATE TABLE IF NOT EXISTS payouts (
             tournament_id INTEGER NOT NULL,
             rank INTEGER NOT NULL,
             attempt INTEGER NOT NULL,
             recipient TEXT NOT NULL,
             amount TEXT NOT NULL,
             status TEXT NOT NULL,
             transaction_ref TEXT,
             confirmed_block INTEGER,
             error_detail TEXT,
             created_at_ms INTEGER NOT NULL,
             updated_at_ms INTEGER NOT NULL,
             PRIMARY KEY (tournament_id, rank, attempt)
         );
         CREATE INDEX IF NOT EXISTS payouts_status ON payouts (status);",
    )
}

/// Column values as stored, before model validation.
struct RawPayout {
    tournament_id: TournamentId,
    rank: Rank,
    attempt: u32,
    recipient: String,
    amount: String,
    status: String,
    transaction_ref: Option<String>,
    confirmed_block: Option<u64>,
    error_detail: Option<String>,
    created_at_ms: u64,
    updated_at_ms: u64,
}

impl RawPayout {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tournament_id: row.get(0)?,
            rank: row.get(1)?,
            attempt: row.get(2)?,
            recipient: row.get(3)?,
            amount: row.get(4)?,
            status: row.get(5)?,
            transaction_ref: row.get(6)?,
            confirmed_block: row.get(7)?,
            error_detail: row.get(8)?,
            created_at_ms: row.get(9)?,
            updated_at_ms: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<PayoutRecord, LedgerError> {
        let id = PayoutId::new(self.tournament_id, self.rank, self.attempt);
        let corrupt = |field: &str, err: prizeline_types::Error| {
            LedgerError::Corrupt(format!("{id}: {field}: {err}"))
        };
        Ok(PayoutRecord {
            tournament_id: self.tournament_id,
            rank: self.rank,
            attempt: self.attempt,
            recipient: Address::new(&self.recipient).map_err(|err| corrupt("recipient", err))?,
            amount: self
                .amount
                .parse::<Amount>()
                .map_err(|err| corrupt("amount", err))?,
            status: self
                .status
                .parse::<PayoutStatus>()
                .map_err(|err| corrupt("status", err))?,
            transaction_ref: self.transaction_ref,
            confirmed_block: self.confirmed_block,
            error_detail: self.error_detail,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

fn select_payouts(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PayoutRecord>, LedgerError> {
    let sql = format!(
        "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE {filter} \
         ORDER BY tournament_id ASC, rank ASC, attempt ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, RawPayout::from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

impl Ledger for SqliteStore {
    fn record(&self, record: PayoutRecord) -> Result<(), LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let latest_attempt: Option<u32> = tx.query_row(
            "SELECT MAX(attempt) FROM payouts WHERE tournament_id = ?1 AND rank = ?2",
            params![record.tournament_id, record.rank],
            |row| row.get(0),
        )?;
        check_append(&record, latest_attempt.unwrap_or(0))?;
        tx.execute(
            &format!(
                "INSERT INTO payouts ({PAYOUT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.tournament_id,
                record.rank,
                record.attempt,
                record.recipient.as_str(),
                record.amount.get().to_string(),
                record.status.as_str(),
                record.transaction_ref,
                record.confirmed_block,
                record.error_detail,
                record.created_at_ms,
                record.updated_at_ms,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_status(
        &self,
        id: PayoutId,
        update: StatusUpdate,
    ) -> Result<PayoutRecord, LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let raw = tx
            .query_row(
                &format!(
                    "SELECT {PAYOUT_COLUMNS} FROM payouts \
                     WHERE tournament_id = ?1 AND rank = ?2 AND attempt = ?3"
                ),
                params![id.tournament_id, id.rank, id.attempt],
                RawPayout::from_row,
            )
            .optional()?
            .ok_or(LedgerError::UnknownRecord(id))?;
        let mut record = raw.into_record()?;
        apply_update(&mut record, update)?;
        tx.execute(
            "UPDATE payouts SET status = ?4, transaction_ref = ?5, confirmed_block = ?6, \
             error_detail = ?7, updated_at_ms = ?8 \
             WHERE tournament_id = ?1 AND rank = ?2 AND attempt = ?3 AND status = 'PENDING'",
            params![
                id.tournament_id,
                id.rank,
                id.attempt,
                record.status.as_str(),
                record.transaction_ref,
                record.confirmed_block,
                record.error_detail,
                record.updated_at_ms,
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn get(&self, tournament_id: TournamentId) -> Result<Vec<PayoutRecord>, LedgerError> {
        select_payouts(&self.conn(), "tournament_id = ?1", params![tournament_id])
    }

    fn pending(&self) -> Result<Vec<PayoutRecord>, LedgerError> {
        select_payouts(&self.conn(), "status = 'PENDING'", [])
    }
}

impl RewardSchedule for SqliteStore {
    fn tiers(&self, tournament_id: TournamentId) -> Result<Vec<RewardTier>, ScheduleError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT rank, amount FROM reward_tiers WHERE tournament_id = ?1 ORDER BY rank ASC",
        )?;
        let rows = stmt.query_map(params![tournament_id], |row| {
            Ok((row.get::<_, Rank>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut tiers = Vec::new();
        for row in rows {
            let (rank, amount) = row?;
            let amount = amount.parse::<Amount>().map_err(|err| {
                ScheduleError::Corrupt(format!("tournament {tournament_id} rank {rank}: {err}"))
            })?;
            tiers.push(RewardTier {
                tournament_id,
                rank,
                amount,
            });
        }
        if tiers.is_empty() {
            return Err(ScheduleError::NotFound(tournament_id));
        }
        Ok(tiers)
    }
}
