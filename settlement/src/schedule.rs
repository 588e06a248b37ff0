//! Reward schedule: what each rank of a tournament is owed.

use prizeline_types::{validate_rank, Amount, Rank, RewardTier, TournamentId};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("no reward tiers configured for tournament {0}")]
    NotFound(TournamentId),
    #[error("tournament {0} has an empty reward schedule")]
    EmptySchedule(TournamentId),
    #[error("invalid tier for tournament {tournament_id} rank {rank}: {reason}")]
    InvalidTier {
        tournament_id: TournamentId,
        rank: Rank,
        reason: String,
    },
    #[error("tournament {0} already has payouts; its reward tiers are frozen")]
    DistributionStarted(TournamentId),
    #[error("invalid amount for tournament {tournament_id} rank {rank}")]
    Amount {
        tournament_id: TournamentId,
        rank: Rank,
        #[source]
        source: prizeline_types::Error,
    },
    #[error("failed to read schedule file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schedule: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt stored tier: {0}")]
    Corrupt(String),
}

/// Source of truth for what should be paid.
///
/// Read-only from the engine's perspective: tiers are configured before distribution starts.
pub trait RewardSchedule: Send + Sync + 'static {
    /// Tiers of `tournament_id`, sorted by rank ascending.
    ///
    /// Fails with [ScheduleError::NotFound] when the tournament has no configured tiers.
    fn tiers(&self, tournament_id: TournamentId) -> Result<Vec<RewardTier>, ScheduleError>;
}

/// Check ranks are positive and unique, returning the tiers keyed by rank.
pub(crate) fn validate_tiers(
    tournament_id: TournamentId,
    tiers: impl IntoIterator<Item = (Rank, Amount)>,
) -> Result<BTreeMap<Rank, Amount>, ScheduleError> {
    let mut validated = BTreeMap::new();
    for (rank, amount) in tiers {
        validate_rank(rank).map_err(|err| ScheduleError::InvalidTier {
            tournament_id,
            rank,
            reason: err.to_string(),
        })?;
        if validated.insert(rank, amount).is_some() {
            return Err(ScheduleError::InvalidTier {
                tournament_id,
                rank,
                reason: "duplicate rank".to_string(),
            });
        }
    }
    if validated.is_empty() {
        return Err(ScheduleError::EmptySchedule(tournament_id));
    }
    Ok(validated)
}

/// In-memory schedule, typically loaded from a YAML file at startup.
#[derive(Clone, Debug, Default)]
pub struct MemorySchedule {
    tiers: BTreeMap<TournamentId, BTreeMap<Rank, Amount>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleFile {
    tournaments: Vec<TournamentEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TournamentEntry {
    id: TournamentId,
    tiers: Vec<TierEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TierEntry {
    rank: Rank,
    amount: RawAmount,
}

/// Amounts are written as decimal strings; bare integers are accepted for convenience.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Whole(u64),
}

impl RawAmount {
    fn parse(&self, decimals: u32) -> Result<Amount, prizeline_types::Error> {
        match self {
            RawAmount::Text(text) => Amount::parse_decimal(text, decimals),
            RawAmount::Whole(whole) => Amount::parse_decimal(&whole.to_string(), decimals),
        }
    }
}

impl MemorySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tiers of `tournament_id`.
    pub fn insert_tiers(
        &mut self,
        tournament_id: TournamentId,
        tiers: impl IntoIterator<Item = (Rank, Amount)>,
    ) -> Result<(), ScheduleError> {
        let validated = validate_tiers(tournament_id, tiers)?;
        self.tiers.insert(tournament_id, validated);
        Ok(())
    }

    /// Parse a schedule document, converting decimal amounts with `decimals` digits.
    ///
    /// ```yaml
    /// tournaments:
    ///   - id: 7
    ///     tiers:
    ///       - { rank: 1, amount: "100" }
    ///       - { rank: 2, amount: "50.5" }
    /// ```
    pub fn from_yaml_str(yaml: &str, decimals: u32) -> Result<Self, ScheduleError> {
        let file: ScheduleFile = serde_yaml::from_str(yaml)?;
        let mut schedule = Self::new();
        for tournament in file.tournaments {
            if schedule.tiers.contains_key(&tournament.id) {
                return Err(ScheduleError::Corrupt(format!(
                    "tournament {} listed twice",
                    tournament.id
                )));
            }
            let mut tiers = Vec::with_capacity(tournament.tiers.len());
            for tier in tournament.tiers {
                let amount =
                    tier.amount
                        .parse(decimals)
                        .map_err(|source| ScheduleError::Amount {
                            tournament_id: tournament.id,
                            rank: tier.rank,
                            source,
                        })?;
                tiers.push((tier.rank, amount));
            }
            schedule.insert_tiers(tournament.id, tiers)?;
        }
        Ok(schedule)
    }

    pub fn load(path: &Path, decimals: u32) -> Result<Self, ScheduleError> {
        let yaml = fs::read_to_string(path).map_err(|source| ScheduleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml, decimals)
    }

    /// Configured tournaments with their tiers in rank order.
    pub fn tournaments(&self) -> impl Iterator<Item = (TournamentId, Vec<(Rank, Amount)>)> + '_ {
        self.tiers.iter().map(|(tournament_id, tiers)| {
            (
                *tournament_id,
                tiers.iter().map(|(rank, amount)| (*rank, *amount)).collect(),
            )
        })
    }
}

impl RewardSchedule for MemorySchedule {
    fn tiers(&self, tournament_id: TournamentId) -> Result<Vec<RewardTier>, ScheduleError> {
        let tiers = self
            .tiers
            .get(&tournament_id)
            .ok_or(ScheduleError::NotFound(tournament_id))?;
        Ok(tiers
            .iter()
            .map(|(rank, amount)| RewardTier {
                tournament_id,
                rank: *rank,
                amount: *amount,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_come_back_in_rank_order() {
        let mut schedule = MemorySchedule::new();
        schedule
            .insert_tiers(
                9,
                [
                    (3, Amount::new(25)),
                    (1, Amount::new(100)),
                    (2, Amount::new(50)),
                ],
            )
            .unwrap();
        let ranks: Vec<_> = schedule.tiers(9).unwrap().iter().map(|t| t.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert!(matches!(schedule.tiers(10), Err(ScheduleError::NotFound(10))));
    }

    #[test]
    fn rejects_rank_zero_and_duplicates() {
        let mut schedule = MemorySchedule::new();
        assert!(matches!(
            schedule.insert_tiers(1, [(0, Amount::new(1))]),
            Err(ScheduleError::InvalidTier { rank: 0, .. })
        ));
        assert!(matches!(
            schedule.insert_tiers(1, [(1, Amount::new(1)), (1, Amount::new(2))]),
            Err(ScheduleError::InvalidTier { rank: 1, .. })
        ));
        assert!(matches!(
            schedule.insert_tiers(1, Vec::<(Rank, Amount)>::new()),
            Err(ScheduleError::EmptySchedule(1))
        ));
        assert!(matches!(schedule.tiers(1), Err(ScheduleError::NotFound(1))));
    }

    #[test]
    fn loads_yaml_with_decimal_amounts() {
        let yaml = r#"
tournaments:
  - id: 7
    tiers:
      - { rank: 1, amount: "100" }
      - { rank: 2, amount: "50.5" }
      - { rank: 3, amount: 25 }
"#;
        let schedule = MemorySchedule::from_yaml_str(yaml, 2).unwrap();
        let tiers = schedule.tiers(7).unwrap();
        let amounts: Vec<_> = tiers.iter().map(|t| t.amount).collect();
        assert_eq!(
            amounts,
            vec![Amount::new(10_000), Amount::new(5_050), Amount::new(2_500)]
        );
        assert_eq!(schedule.tournaments().count(), 1);
    }

    #[test]
    fn yaml_amount_errors_name_the_tier() {
        let yaml = r#"
tournaments:
  - id: 7
    tiers:
      - { rank: 4, amount: "0.001" }
"#;
        let err = MemorySchedule::from_yaml_str(yaml, 2).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Amount {
                tournament_id: 7,
                rank: 4,
                ..
            }
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = MemorySchedule::load(Path::new("/nonexistent/schedule.yaml"), 2).unwrap_err();
        assert!(matches!(err, ScheduleError::Io { .. }));
    }
}
