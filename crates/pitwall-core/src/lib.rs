//! Core domain model for the Pit Wall season reconciler.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pitwall-core";

/// Championship year, e.g. 2024.
pub type Season = u16;

/// Round number within a season, starting at 1.
pub type Round = u32;

/// One timed activity within a race weekend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Practice1,
    Practice2,
    Practice3,
    Qualifying,
    SprintQualifying,
    Sprint,
    Race,
}

impl SessionType {
    /// Stable string form, used in session natural keys. Must stay in step
    /// with the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Practice1 => "practice1",
            SessionType::Practice2 => "practice2",
            SessionType::Practice3 => "practice3",
            SessionType::Qualifying => "qualifying",
            SessionType::SprintQualifying => "sprint_qualifying",
            SessionType::Sprint => "sprint",
            SessionType::Race => "race",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandingType {
    Competitor,
    Team,
}

impl StandingType {
    pub fn as_str(self) -> &'static str {
        match self {
            StandingType::Competitor => "competitor",
            StandingType::Team => "team",
        }
    }
}

/// Constructor/entrant fielding competitors for a season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub provider_code: String,
    pub name: String,
    pub nationality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: Uuid,
    pub provider_code: String,
    pub short_code: String,
    pub car_number: u32,
    pub first_name: String,
    pub last_name: String,
    pub nationality: String,
    pub date_of_birth: NaiveDate,
    /// Team fielding this competitor, resolved from the current standings of
    /// `team_season`. Both fields move together; a sync for an older season
    /// never overwrites a reference established by a newer one.
    pub team_id: Option<Uuid>,
    pub team_season: Option<Season>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    pub provider_code: String,
    pub name: String,
    pub country: String,
    pub city: String,
}

/// One competition weekend. Keyed by (season, round), never by the provider
/// event code, so round renumbering maps back to the same logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub season: Season,
    pub round: Round,
    pub name: String,
    pub date: NaiveDate,
    pub sprint_weekend: bool,
    pub venue_id: Uuid,
    /// Opaque merged result document, null until ingestion.
    pub result: Option<EventResultDoc>,
}

impl Event {
    pub fn natural_key(season: Season, round: Round) -> String {
        format!("{season}:{round}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub event_id: Uuid,
    pub session_type: SessionType,
    pub starts_at: DateTime<Utc>,
    pub completed: bool,
}

impl Session {
    pub fn natural_key(event_id: Uuid, session_type: SessionType) -> String {
        format!("{event_id}:{}", session_type.as_str())
    }
}

/// Ranked position/points/wins snapshot for one subject as of a round.
/// Exactly one of `competitor_id` / `team_id` is populated, matching
/// `standing_type`; use the constructors, which make the invariant
/// unrepresentable rather than merely conventional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub id: Uuid,
    pub season: Season,
    pub round: Round,
    pub standing_type: StandingType,
    pub competitor_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub position: u32,
    pub points: f64,
    pub wins: u32,
}

impl Standing {
    pub fn for_competitor(
        id: Uuid,
        season: Season,
        round: Round,
        competitor_id: Uuid,
        position: u32,
        points: f64,
        wins: u32,
    ) -> Self {
        Self {
            id,
            season,
            round,
            standing_type: StandingType::Competitor,
            competitor_id: Some(competitor_id),
            team_id: None,
            position,
            points,
            wins,
        }
    }

    pub fn for_team(
        id: Uuid,
        season: Season,
        round: Round,
        team_id: Uuid,
        position: u32,
        points: f64,
        wins: u32,
    ) -> Self {
        Self {
            id,
            season,
            round,
            standing_type: StandingType::Team,
            competitor_id: None,
            team_id: Some(team_id),
            position,
            points,
            wins,
        }
    }

    pub fn subject_id(&self) -> Option<Uuid> {
        match self.standing_type {
            StandingType::Competitor => self.competitor_id,
            StandingType::Team => self.team_id,
        }
    }

    /// True when the populated subject reference agrees with the type.
    pub fn is_well_formed(&self) -> bool {
        match self.standing_type {
            StandingType::Competitor => self.competitor_id.is_some() && self.team_id.is_none(),
            StandingType::Team => self.team_id.is_some() && self.competitor_id.is_none(),
        }
    }

    pub fn natural_key(
        season: Season,
        round: Round,
        standing_type: StandingType,
        subject_id: Uuid,
    ) -> String {
        format!("{season}:{round}:{}:{subject_id}", standing_type.as_str())
    }
}

/// One classified finisher inside a result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Internal identity when the competitor was resolvable at ingestion time.
    pub competitor_id: Option<Uuid>,
    pub competitor_code: String,
    pub position: u32,
}

/// Merged qualifying + race outcome attached to an Event once its race has
/// concluded. Stored as a single opaque blob, replaced wholesale on
/// re-ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResultDoc {
    pub positions: Vec<ResultEntry>,
    pub pole: Option<ResultEntry>,
    pub fastest_lap: Option<ResultEntry>,
    pub full_results: Vec<ResultEntry>,
    pub ingested_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Candidate records: the Record Transformer output contract. One per entity
// family, carrying natural-key material plus mutable attributes and nothing
// internal.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRecord {
    pub provider_code: String,
    pub name: String,
    pub nationality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorRecord {
    pub provider_code: String,
    pub short_code: String,
    pub car_number: u32,
    pub first_name: String,
    pub last_name: String,
    pub nationality: String,
    pub date_of_birth: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub provider_code: String,
    pub name: String,
    pub country: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_type: SessionType,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub round: Round,
    pub name: String,
    pub date: NaiveDate,
    pub sprint_weekend: bool,
    pub venue_code: String,
    pub sessions: Vec<SessionRecord>,
}

/// One row of a standings table. `team_code` is populated on competitor
/// standings only, where the provider names the team currently fielding the
/// competitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingRecord {
    pub round: Round,
    pub position: u32,
    pub points: f64,
    pub wins: u32,
    pub subject_code: String,
    pub team_code: Option<String>,
}

/// One row of a race or qualifying classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub position: u32,
    pub competitor_code: String,
    pub fastest_lap: bool,
}
