use crate::{Address, Amount, Rank, TournamentId};
use serde::{Deserialize, Serialize};

/// Reward owed to whoever finishes a tournament at `rank`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardTier {
    pub tournament_id: TournamentId,
    pub rank: Rank,
    pub amount: Amount,
}

/// A tournament's final placement of one participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandingEntry {
    pub tournament_id: TournamentId,
    pub rank: Rank,
    #[serde(rename = "recipientAddress")]
    pub recipient: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl StandingEntry {
    pub fn new(tournament_id: TournamentId, rank: Rank, recipient: Address) -> Self {
        Self {
            tournament_id,
            rank,
            recipient,
            recipient_user_id: None,
            display_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standing_entry_uses_backend_field_names() {
        let json = r#"{
            "tournamentId": 7,
            "rank": 2,
            "recipientAddress": "0xBB",
            "displayName": "bob"
        }"#;
        let entry: StandingEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.tournament_id, 7);
        assert_eq!(entry.rank, 2);
        assert_eq!(entry.recipient.as_str(), "0xBB");
        assert_eq!(entry.recipient_user_id, None);
        assert_eq!(entry.display_name.as_deref(), Some("bob"));
    }
}
