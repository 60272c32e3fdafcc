//! External statistics provider boundary: fetch operations + record
//! transformers from provider wire shapes to typed candidate records.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pitwall_core::{
    ClassificationRecord, CompetitorRecord, EventRecord, Round, Season, SessionRecord,
    SessionType, StandingRecord, TeamRecord, VenueRecord,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pitwall-provider";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed provider payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed provider field {field}: {detail}")]
    Field { field: String, detail: String },
    #[error("fixture does not cover {0}")]
    FixtureGap(String),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Season/round-scoped fetch operations, returning typed candidate records
/// (the transformers below have already been applied by the implementation).
#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn teams(&self, season: Season) -> Result<Vec<TeamRecord>, ProviderError>;
    async fn competitors(&self, season: Season) -> Result<Vec<CompetitorRecord>, ProviderError>;
    async fn competitor_standings(
        &self,
        season: Season,
    ) -> Result<Vec<StandingRecord>, ProviderError>;
    async fn team_standings(&self, season: Season) -> Result<Vec<StandingRecord>, ProviderError>;
    /// The full venue catalog; the provider does not scope venues by season.
    async fn venues(&self) -> Result<Vec<VenueRecord>, ProviderError>;
    async fn schedule(&self, season: Season) -> Result<Vec<EventRecord>, ProviderError>;
    async fn race_classification(
        &self,
        season: Season,
        round: Round,
    ) -> Result<Vec<ClassificationRecord>, ProviderError>;
    async fn qualifying_classification(
        &self,
        season: Season,
        round: Round,
    ) -> Result<Vec<ClassificationRecord>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WireTeam {
    #[serde(rename = "teamId")]
    pub team_id: String,
    pub name: String,
    pub nationality: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCompetitor {
    #[serde(rename = "driverId")]
    pub driver_id: String,
    pub code: String,
    pub number: u32,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    pub nationality: String,
    #[serde(rename = "dateOfBirth")]
    pub date_of_birth: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireVenue {
    #[serde(rename = "circuitId")]
    pub circuit_id: String,
    pub name: String,
    pub country: String,
    pub city: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSession {
    pub kind: String,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireEvent {
    pub round: Round,
    pub name: String,
    pub date: String,
    #[serde(rename = "sprintWeekend", default)]
    pub sprint_weekend: bool,
    #[serde(rename = "circuitId")]
    pub circuit_id: String,
    pub sessions: Vec<WireSession>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStandingRow {
    pub position: u32,
    pub points: f64,
    pub wins: u32,
    #[serde(rename = "subjectId")]
    pub subject_id: String,
    /// Present on competitor standings: the team currently fielding them.
    #[serde(rename = "teamId", default)]
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireStandingsTable {
    pub round: Round,
    pub standings: Vec<WireStandingRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireClassificationRow {
    pub position: u32,
    #[serde(rename = "driverId")]
    pub driver_id: String,
    #[serde(rename = "fastestLap", default)]
    pub fastest_lap: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WireTeamList {
    teams: Vec<WireTeam>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireCompetitorList {
    drivers: Vec<WireCompetitor>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireVenueList {
    circuits: Vec<WireVenue>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireSchedule {
    events: Vec<WireEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireClassification {
    classification: Vec<WireClassificationRow>,
}

// ---------------------------------------------------------------------------
// Record transformers
// ---------------------------------------------------------------------------

fn parse_wire_date(field: &str, raw: &str) -> Result<NaiveDate, ProviderError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|err| ProviderError::Field {
        field: field.to_string(),
        detail: format!("{raw:?}: {err}"),
    })
}

fn session_type_from_wire(kind: &str) -> Option<SessionType> {
    match kind {
        "practice1" => Some(SessionType::Practice1),
        "practice2" => Some(SessionType::Practice2),
        "practice3" => Some(SessionType::Practice3),
        "qualifying" => Some(SessionType::Qualifying),
        "sprint_qualifying" => Some(SessionType::SprintQualifying),
        "sprint" => Some(SessionType::Sprint),
        "race" => Some(SessionType::Race),
        _ => None,
    }
}

pub fn team_record(wire: WireTeam) -> TeamRecord {
    TeamRecord {
        provider_code: wire.team_id,
        name: wire.name,
        nationality: wire.nationality,
    }
}

pub fn competitor_record(wire: WireCompetitor) -> Result<CompetitorRecord, ProviderError> {
    let date_of_birth = parse_wire_date("dateOfBirth", &wire.date_of_birth)?;
    Ok(CompetitorRecord {
        provider_code: wire.driver_id,
        short_code: wire.code,
        car_number: wire.number,
        first_name: wire.first_name,
        last_name: wire.last_name,
        nationality: wire.nationality,
        date_of_birth,
    })
}

pub fn venue_record(wire: WireVenue) -> VenueRecord {
    VenueRecord {
        provider_code: wire.circuit_id,
        name: wire.name,
        country: wire.country,
        city: wire.city,
    }
}

/// Sessions with a kind this version does not know are dropped with a
/// warning rather than failing the whole schedule.
pub fn event_record(wire: WireEvent) -> Result<EventRecord, ProviderError> {
    let date = parse_wire_date("date", &wire.date)?;
    let mut sessions = Vec::with_capacity(wire.sessions.len());
    for session in wire.sessions {
        match session_type_from_wire(&session.kind) {
            Some(session_type) => sessions.push(SessionRecord {
                session_type,
                starts_at: session.starts_at,
            }),
            None => warn!(round = wire.round, kind = %session.kind, "unknown session kind, dropping"),
        }
    }
    Ok(EventRecord {
        round: wire.round,
        name: wire.name,
        date,
        sprint_weekend: wire.sprint_weekend,
        venue_code: wire.circuit_id,
        sessions,
    })
}

pub fn standing_records(wire: WireStandingsTable) -> Vec<StandingRecord> {
    let round = wire.round;
    wire.standings
        .into_iter()
        .map(|row| StandingRecord {
            round,
            position: row.position,
            points: row.points,
            wins: row.wins,
            subject_code: row.subject_id,
            team_code: row.team_id,
        })
        .collect()
}

pub fn classification_records(rows: Vec<WireClassificationRow>) -> Vec<ClassificationRecord> {
    rows.into_iter()
        .map(|row| ClassificationRecord {
            position: row.position,
            competitor_code: row.driver_id,
            fastest_lap: row.fastest_lap,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://stats.example.com/v1".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpStatsProvider {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpStatsProvider {
    pub fn new(config: HttpProviderConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    async fn fetch_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{}/{path}", self.base_url);
        let span = info_span!("provider_fetch", %url);
        let backoff = self.backoff;
        let client = &self.client;

        async move {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=backoff.max_retries {
                match client.get(&url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = resp.bytes().await?;
                            return Ok(serde_json::from_slice(&body)?);
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(ProviderError::HttpStatus {
                            status: status.as_u16(),
                            url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(ProviderError::Request(err));
                    }
                }
            }

            Err(ProviderError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl StatsProvider for HttpStatsProvider {
    async fn teams(&self, season: Season) -> Result<Vec<TeamRecord>, ProviderError> {
        let list: WireTeamList = self.fetch_json(&format!("seasons/{season}/teams")).await?;
        Ok(list.teams.into_iter().map(team_record).collect())
    }

    async fn competitors(&self, season: Season) -> Result<Vec<CompetitorRecord>, ProviderError> {
        let list: WireCompetitorList =
            self.fetch_json(&format!("seasons/{season}/drivers")).await?;
        list.drivers.into_iter().map(competitor_record).collect()
    }

    async fn competitor_standings(
        &self,
        season: Season,
    ) -> Result<Vec<StandingRecord>, ProviderError> {
        let table: WireStandingsTable = self
            .fetch_json(&format!("seasons/{season}/standings/drivers"))
            .await?;
        Ok(standing_records(table))
    }

    async fn team_standings(&self, season: Season) -> Result<Vec<StandingRecord>, ProviderError> {
        let table: WireStandingsTable = self
            .fetch_json(&format!("seasons/{season}/standings/teams"))
            .await?;
        Ok(standing_records(table))
    }

    async fn venues(&self) -> Result<Vec<VenueRecord>, ProviderError> {
        let list: WireVenueList = self.fetch_json("circuits").await?;
        Ok(list.circuits.into_iter().map(venue_record).collect())
    }

    async fn schedule(&self, season: Season) -> Result<Vec<EventRecord>, ProviderError> {
        let schedule: WireSchedule = self
            .fetch_json(&format!("seasons/{season}/schedule"))
            .await?;
        schedule.events.into_iter().map(event_record).collect()
    }

    async fn race_classification(
        &self,
        season: Season,
        round: Round,
    ) -> Result<Vec<ClassificationRecord>, ProviderError> {
        let result: WireClassification = self
            .fetch_json(&format!("seasons/{season}/rounds/{round}/race"))
            .await?;
        Ok(classification_records(result.classification))
    }

    async fn qualifying_classification(
        &self,
        season: Season,
        round: Round,
    ) -> Result<Vec<ClassificationRecord>, ProviderError> {
        let result: WireClassification = self
            .fetch_json(&format!("seasons/{season}/rounds/{round}/qualifying"))
            .await?;
        Ok(classification_records(result.classification))
    }
}

// ---------------------------------------------------------------------------
// Fixture implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RoundResultsFixture {
    pub round: Round,
    pub race: Vec<WireClassificationRow>,
    #[serde(default)]
    pub qualifying: Vec<WireClassificationRow>,
}

/// One season's worth of provider responses captured as a single bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct SeasonFixture {
    pub season: Season,
    pub teams: Vec<WireTeam>,
    pub drivers: Vec<WireCompetitor>,
    #[serde(rename = "driverStandings")]
    pub driver_standings: WireStandingsTable,
    #[serde(rename = "teamStandings")]
    pub team_standings: WireStandingsTable,
    pub circuits: Vec<WireVenue>,
    pub events: Vec<WireEvent>,
    #[serde(default)]
    pub results: Vec<RoundResultsFixture>,
}

/// Fixture-backed provider for offline syncs and tests.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    fixture: SeasonFixture,
}

impl FixtureProvider {
    pub fn new(fixture: SeasonFixture) -> Self {
        Self { fixture }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let fixture: SeasonFixture = serde_json::from_str(&text)?;
        Ok(Self::new(fixture))
    }

    fn check_season(&self, season: Season) -> Result<(), ProviderError> {
        if season != self.fixture.season {
            return Err(ProviderError::FixtureGap(format!("season {season}")));
        }
        Ok(())
    }

    fn round_results(&self, round: Round) -> Result<&RoundResultsFixture, ProviderError> {
        self.fixture
            .results
            .iter()
            .find(|r| r.round == round)
            .ok_or_else(|| ProviderError::FixtureGap(format!("round {round} results")))
    }
}

#[async_trait]
impl StatsProvider for FixtureProvider {
    async fn teams(&self, season: Season) -> Result<Vec<TeamRecord>, ProviderError> {
        self.check_season(season)?;
        Ok(self
            .fixture
            .teams
            .iter()
            .cloned()
            .map(team_record)
            .collect())
    }

    async fn competitors(&self, season: Season) -> Result<Vec<CompetitorRecord>, ProviderError> {
        self.check_season(season)?;
        self.fixture
            .drivers
            .iter()
            .cloned()
            .map(competitor_record)
            .collect()
    }

    async fn competitor_standings(
        &self,
        season: Season,
    ) -> Result<Vec<StandingRecord>, ProviderError> {
        self.check_season(season)?;
        Ok(standing_records(self.fixture.driver_standings.clone()))
    }

    async fn team_standings(&self, season: Season) -> Result<Vec<StandingRecord>, ProviderError> {
        self.check_season(season)?;
        Ok(standing_records(self.fixture.team_standings.clone()))
    }

    async fn venues(&self) -> Result<Vec<VenueRecord>, ProviderError> {
        Ok(self
            .fixture
            .circuits
            .iter()
            .cloned()
            .map(venue_record)
            .collect())
    }

    async fn schedule(&self, season: Season) -> Result<Vec<EventRecord>, ProviderError> {
        self.check_season(season)?;
        self.fixture
            .events
            .iter()
            .cloned()
            .map(event_record)
            .collect()
    }

    async fn race_classification(
        &self,
        season: Season,
        round: Round,
    ) -> Result<Vec<ClassificationRecord>, ProviderError> {
        self.check_season(season)?;
        let results = self.round_results(round)?;
        Ok(classification_records(results.race.clone()))
    }

    async fn qualifying_classification(
        &self,
        season: Season,
        round: Round,
    ) -> Result<Vec<ClassificationRecord>, ProviderError> {
        self.check_season(season)?;
        let results = self.round_results(round)?;
        Ok(classification_records(results.qualifying.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn competitor_transform_parses_date_of_birth() {
        let wire: WireCompetitor = serde_json::from_value(serde_json::json!({
            "driverId": "verstappen",
            "code": "VER",
            "number": 1,
            "firstName": "Max",
            "lastName": "Verstappen",
            "nationality": "Dutch",
            "dateOfBirth": "1997-09-30"
        }))
        .expect("wire shape");

        let record = competitor_record(wire).expect("transform");
        assert_eq!(record.provider_code, "verstappen");
        assert_eq!(record.car_number, 1);
        assert_eq!(
            record.date_of_birth,
            NaiveDate::from_ymd_opt(1997, 9, 30).expect("date")
        );
    }

    #[test]
    fn competitor_transform_rejects_malformed_date() {
        let wire: WireCompetitor = serde_json::from_value(serde_json::json!({
            "driverId": "verstappen",
            "code": "VER",
            "number": 1,
            "firstName": "Max",
            "lastName": "Verstappen",
            "nationality": "Dutch",
            "dateOfBirth": "30/09/1997"
        }))
        .expect("wire shape");

        let err = competitor_record(wire).expect_err("must reject");
        assert!(matches!(err, ProviderError::Field { .. }));
    }

    #[test]
    fn event_transform_drops_unknown_session_kinds() {
        let wire: WireEvent = serde_json::from_value(serde_json::json!({
            "round": 5,
            "name": "Monaco Grand Prix",
            "date": "2024-05-26",
            "sprintWeekend": false,
            "circuitId": "monaco",
            "sessions": [
                {"kind": "practice1", "startsAt": "2024-05-24T11:30:00Z"},
                {"kind": "demonstration", "startsAt": "2024-05-24T15:00:00Z"},
                {"kind": "race", "startsAt": "2024-05-26T13:00:00Z"}
            ]
        }))
        .expect("wire shape");

        let record = event_record(wire).expect("transform");
        assert_eq!(record.sessions.len(), 2);
        assert_eq!(record.sessions[1].session_type, SessionType::Race);
        assert_eq!(record.venue_code, "monaco");
    }

    #[test]
    fn standing_transform_carries_round_and_team_mapping() {
        let table: WireStandingsTable = serde_json::from_value(serde_json::json!({
            "round": 5,
            "standings": [
                {"position": 1, "points": 125.0, "wins": 4, "subjectId": "verstappen", "teamId": "red_bull"},
                {"position": 2, "points": 98.0, "wins": 1, "subjectId": "leclerc"}
            ]
        }))
        .expect("wire shape");

        let records = standing_records(table);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].round, 5);
        assert_eq!(records[0].team_code.as_deref(), Some("red_bull"));
        assert_eq!(records[1].team_code, None);
    }

    #[tokio::test]
    async fn fixture_provider_serves_round_results_and_flags_gaps() {
        let fixture: SeasonFixture = serde_json::from_value(serde_json::json!({
            "season": 2024,
            "teams": [],
            "drivers": [],
            "driverStandings": {"round": 1, "standings": []},
            "teamStandings": {"round": 1, "standings": []},
            "circuits": [],
            "events": [],
            "results": [
                {
                    "round": 5,
                    "race": [{"position": 1, "driverId": "verstappen", "fastestLap": true}],
                    "qualifying": [{"position": 1, "driverId": "leclerc"}]
                }
            ]
        }))
        .expect("fixture shape");
        let provider = FixtureProvider::new(fixture);

        let race = provider
            .race_classification(2024, 5)
            .await
            .expect("race rows");
        assert_eq!(race.len(), 1);
        assert!(race[0].fastest_lap);

        let missing = provider.race_classification(2024, 9).await;
        assert!(matches!(missing, Err(ProviderError::FixtureGap(_))));

        let wrong_season = provider.teams(2023).await;
        assert!(matches!(wrong_season, Err(ProviderError::FixtureGap(_))));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
