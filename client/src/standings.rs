use crate::{Error, Result};
use prizeline_settlement::StandingsSource;
use prizeline_types::{StandingEntry, TournamentId};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads final standings from the tournament backend.
///
/// `GET {base}/tournaments/{id}/standings` must answer with a JSON array of standing entries.
#[derive(Clone, Debug)]
pub struct HttpStandings {
    http_client: reqwest::Client,
    base_url: Url,
}

impl HttpStandings {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        // Without a trailing slash `join` would replace the last path segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn standings_url(&self, tournament_id: TournamentId) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("tournaments/{tournament_id}/standings"))?)
    }
}

impl StandingsSource for HttpStandings {
    type Error = Error;

    async fn standings(&self, tournament_id: TournamentId) -> Result<Vec<StandingEntry>> {
        let url = self.standings_url(tournament_id)?;
        let response = self.http_client.get(url).send().await?;
        match response.status() {
            StatusCode::OK => {
                let entries: Vec<StandingEntry> = response.json().await?;
                debug!(tournament_id, entries = entries.len(), "fetched standings");
                Ok(entries)
            }
            StatusCode::NOT_FOUND => Err(Error::StandingsNotFound(tournament_id)),
            status => Err(Error::Failed(status)),
        }
    }
}
