//! Season synchronization pipeline: ordered, idempotent reconciliation of
//! provider data into the entity store, plus per-event result ingestion.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use pitwall_core::{
    ClassificationRecord, Competitor, CompetitorRecord, Event, EventRecord, EventResultDoc,
    ResultEntry, Round, Season, Session, SessionRecord, SessionType, Standing, StandingType,
    Team, TeamRecord, Venue, VenueRecord,
};
use pitwall_provider::{ProviderError, StatsProvider};
use pitwall_store::{EntityStore, StoreError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pitwall-sync";

pub const DEFAULT_TOP_N: usize = 3;

// ---------------------------------------------------------------------------
// Configuration + season registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub provider_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub top_n: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_dir: std::env::var("PITWALL_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
            provider_base_url: std::env::var("PITWALL_PROVIDER_URL")
                .unwrap_or_else(|_| "https://stats.example.com/v1".to_string()),
            user_agent: std::env::var("PITWALL_USER_AGENT")
                .unwrap_or_else(|_| "pitwall-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("PITWALL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            top_n: std::env::var("PITWALL_TOP_N")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TOP_N),
            scheduler_enabled: std::env::var("PITWALL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonRegistry {
    pub seasons: Vec<SeasonEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonEntry {
    pub season: Season,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SeasonRegistry {
    pub fn enabled_seasons(&self) -> Vec<Season> {
        self.seasons
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.season)
            .collect()
    }
}

pub async fn load_season_registry(workspace_root: &Path) -> anyhow::Result<SeasonRegistry> {
    let path = workspace_root.join("seasons.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Entity reconciler + foreign-key resolver
// ---------------------------------------------------------------------------

/// Per-family parameterization of the upsert-by-natural-key primitive.
///
/// `update` mutates only the mutable attribute set; it must never touch the
/// natural key or the internal identity.
pub trait EntityFamily {
    const FAMILY: &'static str;
    type Record: Send + Sync;
    type Entity: Serialize + DeserializeOwned + Send;

    fn natural_key(record: &Self::Record) -> String;
    fn create(id: Uuid, record: &Self::Record) -> Self::Entity;
    fn update(entity: &mut Self::Entity, record: &Self::Record);
    fn id(entity: &Self::Entity) -> Uuid;
}

/// Generic find-by-natural-key-else-create. Exactly one create or one update
/// per call; an existing natural key keeps its internal identity forever.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile<F: EntityFamily>(
        &self,
        record: &F::Record,
    ) -> Result<Uuid, StoreError> {
        let key = F::natural_key(record);
        match self.store.get(F::FAMILY, &key).await? {
            Some(document) => {
                let mut entity: F::Entity = serde_json::from_value(document)?;
                F::update(&mut entity, record);
                self.store
                    .put(F::FAMILY, &key, serde_json::to_value(&entity)?)
                    .await?;
                Ok(F::id(&entity))
            }
            None => {
                let id = Uuid::new_v4();
                let entity = F::create(id, record);
                self.store
                    .put(F::FAMILY, &key, serde_json::to_value(&entity)?)
                    .await?;
                Ok(id)
            }
        }
    }
}

/// Read-only natural-key lookup. Absence is a value, not an error; the
/// caller decides whether a missing dependency is tolerable.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn EntityStore>,
}

impl Resolver {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn resolve<F: EntityFamily>(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(match self.store.get(F::FAMILY, key).await? {
            Some(document) => {
                let entity: F::Entity = serde_json::from_value(document)?;
                Some(F::id(&entity))
            }
            None => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Family implementations
// ---------------------------------------------------------------------------

pub struct Teams;

impl EntityFamily for Teams {
    const FAMILY: &'static str = "teams";
    type Record = TeamRecord;
    type Entity = Team;

    fn natural_key(record: &TeamRecord) -> String {
        record.provider_code.clone()
    }

    fn create(id: Uuid, record: &TeamRecord) -> Team {
        Team {
            id,
            provider_code: record.provider_code.clone(),
            name: record.name.clone(),
            nationality: record.nationality.clone(),
        }
    }

    fn update(entity: &mut Team, record: &TeamRecord) {
        entity.name = record.name.clone();
        entity.nationality = record.nationality.clone();
    }

    fn id(entity: &Team) -> Uuid {
        entity.id
    }
}

/// Competitor candidate plus the FK material resolved by the sync step.
#[derive(Debug, Clone)]
pub struct CompetitorSeed {
    pub season: Season,
    pub team_id: Option<Uuid>,
    pub record: CompetitorRecord,
}

pub struct Competitors;

impl EntityFamily for Competitors {
    const FAMILY: &'static str = "competitors";
    type Record = CompetitorSeed;
    type Entity = Competitor;

    fn natural_key(seed: &CompetitorSeed) -> String {
        seed.record.provider_code.clone()
    }

    fn create(id: Uuid, seed: &CompetitorSeed) -> Competitor {
        Competitor {
            id,
            provider_code: seed.record.provider_code.clone(),
            short_code: seed.record.short_code.clone(),
            car_number: seed.record.car_number,
            first_name: seed.record.first_name.clone(),
            last_name: seed.record.last_name.clone(),
            nationality: seed.record.nationality.clone(),
            date_of_birth: seed.record.date_of_birth,
            team_id: seed.team_id,
            team_season: seed.team_id.map(|_| seed.season),
        }
    }

    fn update(entity: &mut Competitor, seed: &CompetitorSeed) {
        entity.short_code = seed.record.short_code.clone();
        entity.car_number = seed.record.car_number;
        entity.first_name = seed.record.first_name.clone();
        entity.last_name = seed.record.last_name.clone();
        entity.nationality = seed.record.nationality.clone();
        entity.date_of_birth = seed.record.date_of_birth;

        // The team reference belongs to the newest season that resolved one;
        // an older season's sync must not move it, and an unresolved mapping
        // must not clear it.
        if let Some(team_id) = seed.team_id {
            let newer_or_same = entity
                .team_season
                .map(|held| seed.season >= held)
                .unwrap_or(true);
            if newer_or_same {
                entity.team_id = Some(team_id);
                entity.team_season = Some(seed.season);
            }
        }
    }

    fn id(entity: &Competitor) -> Uuid {
        entity.id
    }
}

pub struct Venues;

impl EntityFamily for Venues {
    const FAMILY: &'static str = "venues";
    type Record = VenueRecord;
    type Entity = Venue;

    fn natural_key(record: &VenueRecord) -> String {
        record.provider_code.clone()
    }

    fn create(id: Uuid, record: &VenueRecord) -> Venue {
        Venue {
            id,
            provider_code: record.provider_code.clone(),
            name: record.name.clone(),
            country: record.country.clone(),
            city: record.city.clone(),
        }
    }

    fn update(entity: &mut Venue, record: &VenueRecord) {
        entity.name = record.name.clone();
        entity.country = record.country.clone();
        entity.city = record.city.clone();
    }

    fn id(entity: &Venue) -> Uuid {
        entity.id
    }
}

#[derive(Debug, Clone)]
pub struct EventSeed {
    pub season: Season,
    pub venue_id: Uuid,
    pub record: EventRecord,
}

pub struct Events;

impl EntityFamily for Events {
    const FAMILY: &'static str = "events";
    type Record = EventSeed;
    type Entity = Event;

    fn natural_key(seed: &EventSeed) -> String {
        Event::natural_key(seed.season, seed.record.round)
    }

    fn create(id: Uuid, seed: &EventSeed) -> Event {
        Event {
            id,
            season: seed.season,
            round: seed.record.round,
            name: seed.record.name.clone(),
            date: seed.record.date,
            sprint_weekend: seed.record.sprint_weekend,
            venue_id: seed.venue_id,
            result: None,
        }
    }

    // `result` is owned by the ingestion flow; schedule re-syncs leave it be.
    fn update(entity: &mut Event, seed: &EventSeed) {
        entity.name = seed.record.name.clone();
        entity.date = seed.record.date;
        entity.sprint_weekend = seed.record.sprint_weekend;
        entity.venue_id = seed.venue_id;
    }

    fn id(entity: &Event) -> Uuid {
        entity.id
    }
}

#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub event_id: Uuid,
    pub record: SessionRecord,
}

pub struct Sessions;

impl EntityFamily for Sessions {
    const FAMILY: &'static str = "sessions";
    type Record = SessionSeed;
    type Entity = Session;

    fn natural_key(seed: &SessionSeed) -> String {
        Session::natural_key(seed.event_id, seed.record.session_type)
    }

    fn create(id: Uuid, seed: &SessionSeed) -> Session {
        Session {
            id,
            event_id: seed.event_id,
            session_type: seed.record.session_type,
            starts_at: seed.record.starts_at,
            completed: false,
        }
    }

    // `completed` is only ever flipped by result ingestion.
    fn update(entity: &mut Session, seed: &SessionSeed) {
        entity.starts_at = seed.record.starts_at;
    }

    fn id(entity: &Session) -> Uuid {
        entity.id
    }
}

#[derive(Debug, Clone)]
pub struct StandingSeed {
    pub season: Season,
    pub round: Round,
    pub standing_type: StandingType,
    pub subject_id: Uuid,
    pub position: u32,
    pub points: f64,
    pub wins: u32,
}

pub struct Standings;

impl EntityFamily for Standings {
    const FAMILY: &'static str = "standings";
    type Record = StandingSeed;
    type Entity = Standing;

    fn natural_key(seed: &StandingSeed) -> String {
        Standing::natural_key(seed.season, seed.round, seed.standing_type, seed.subject_id)
    }

    fn create(id: Uuid, seed: &StandingSeed) -> Standing {
        match seed.standing_type {
            StandingType::Competitor => Standing::for_competitor(
                id,
                seed.season,
                seed.round,
                seed.subject_id,
                seed.position,
                seed.points,
                seed.wins,
            ),
            StandingType::Team => Standing::for_team(
                id,
                seed.season,
                seed.round,
                seed.subject_id,
                seed.position,
                seed.points,
                seed.wins,
            ),
        }
    }

    fn update(entity: &mut Standing, seed: &StandingSeed) {
        entity.position = seed.position;
        entity.points = seed.points;
        entity.wins = seed.wins;
    }

    fn id(entity: &Standing) -> Uuid {
        entity.id
    }
}

// ---------------------------------------------------------------------------
// Scoring hook
// ---------------------------------------------------------------------------

/// Downstream prediction-scoring trigger. The ingestor guarantees the result
/// document and completion flag are durable before this fires; it never
/// computes scores itself.
#[async_trait]
pub trait ScoringHook: Send + Sync {
    async fn on_event_completed(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct NoopScoringHook;

#[async_trait]
impl ScoringHook for NoopScoringHook {
    async fn on_event_completed(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sync report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Teams,
    Competitors,
    Venues,
    Events,
    CompetitorStandings,
    TeamStandings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepFailure {
    pub step: SyncStep,
    pub detail: String,
}

impl StepFailure {
    fn new(step: SyncStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyCounts {
    pub teams: usize,
    pub competitors: usize,
    pub venues: usize,
    pub events: usize,
    pub sessions: usize,
    pub competitor_standings: usize,
    pub team_standings: usize,
}

/// Event left out of a run because its venue was not yet reconciled. A
/// tolerated gap, reported separately from `errors` so a systemic ordering
/// bug (every event skipped) stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEvent {
    pub season: Season,
    pub round: Round,
    pub venue_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub season: Season,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub counts: FamilyCounts,
    pub errors: Vec<StepFailure>,
    pub skipped_events: Vec<SkippedEvent>,
}

// ---------------------------------------------------------------------------
// Result ingestion outcome + errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub result_count: usize,
    pub scoring_triggered: bool,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no event reconciled for season {season} round {round}")]
    EventNotFound { season: Season, round: Round },
    #[error("provider returned an empty race classification for season {season} round {round}")]
    EmptyClassification { season: Season, round: Round },
    #[error("race session missing for season {season} round {round}")]
    RaceSessionMissing { season: Season, round: Round },
    #[error("provider failure: {0}")]
    Provider(#[from] ProviderError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("malformed stored document: {0}")]
    Decode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SeasonSyncPipeline {
    provider: Arc<dyn StatsProvider>,
    store: Arc<dyn EntityStore>,
    reconciler: Reconciler,
    resolver: Resolver,
    scoring: Arc<dyn ScoringHook>,
    top_n: usize,
}

impl SeasonSyncPipeline {
    pub fn new(provider: Arc<dyn StatsProvider>, store: Arc<dyn EntityStore>) -> Self {
        let reconciler = Reconciler::new(store.clone());
        let resolver = Resolver::new(store.clone());
        Self {
            provider,
            store,
            reconciler,
            resolver,
            scoring: Arc::new(NoopScoringHook),
            top_n: DEFAULT_TOP_N,
        }
    }

    pub fn with_scoring_hook(mut self, hook: Arc<dyn ScoringHook>) -> Self {
        self.scoring = hook;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    /// Run the five reconciliation steps in dependency order. Never errors:
    /// step failures are collected and the run continues, because every step
    /// is idempotent and a re-invocation picks up whatever was missed.
    pub async fn sync_season(&self, season: Season) -> SyncReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, season, "starting season sync");

        let mut counts = FamilyCounts::default();
        let mut errors = Vec::new();
        let mut skipped_events = Vec::new();

        self.sync_teams(season, &mut counts, &mut errors).await;
        self.sync_competitors(season, &mut counts, &mut errors).await;
        self.sync_venues(&mut counts, &mut errors).await;
        self.sync_events(season, &mut counts, &mut errors, &mut skipped_events)
            .await;
        self.sync_standings(season, StandingType::Competitor, &mut counts, &mut errors)
            .await;
        self.sync_standings(season, StandingType::Team, &mut counts, &mut errors)
            .await;

        let finished_at = Utc::now();
        let success = errors.is_empty();
        info!(
            %run_id,
            season,
            success,
            errors = errors.len(),
            skipped = skipped_events.len(),
            "season sync finished"
        );

        SyncReport {
            run_id,
            season,
            started_at,
            finished_at,
            success,
            counts,
            errors,
            skipped_events,
        }
    }

    async fn sync_teams(
        &self,
        season: Season,
        counts: &mut FamilyCounts,
        errors: &mut Vec<StepFailure>,
    ) {
        let records = match self.provider.teams(season).await {
            Ok(records) => records,
            Err(err) => {
                errors.push(StepFailure::new(
                    SyncStep::Teams,
                    format!("fetching teams: {err}"),
                ));
                return;
            }
        };
        for record in &records {
            match self.reconciler.reconcile::<Teams>(record).await {
                Ok(_) => counts.teams += 1,
                Err(err) => errors.push(StepFailure::new(
                    SyncStep::Teams,
                    format!("reconciling team {}: {err}", record.provider_code),
                )),
            }
        }
    }

    async fn sync_competitors(
        &self,
        season: Season,
        counts: &mut FamilyCounts,
        errors: &mut Vec<StepFailure>,
    ) {
        let records = match self.provider.competitors(season).await {
            Ok(records) => records,
            Err(err) => {
                errors.push(StepFailure::new(
                    SyncStep::Competitors,
                    format!("fetching competitors: {err}"),
                ));
                return;
            }
        };

        // The current standings name the team fielding each competitor this
        // season; a fetch failure degrades to no team mappings rather than
        // losing the whole step.
        let team_by_competitor: HashMap<String, String> =
            match self.provider.competitor_standings(season).await {
                Ok(rows) => rows
                    .into_iter()
                    .filter_map(|row| row.team_code.map(|team| (row.subject_code, team)))
                    .collect(),
                Err(err) => {
                    errors.push(StepFailure::new(
                        SyncStep::Competitors,
                        format!("fetching competitor standings for team mapping: {err}"),
                    ));
                    HashMap::new()
                }
            };

        for record in records {
            let team_id = match team_by_competitor.get(&record.provider_code) {
                Some(team_code) => match self.resolver.resolve::<Teams>(team_code).await {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        errors.push(StepFailure::new(
                            SyncStep::Competitors,
                            format!("resolving team {team_code}: {err}"),
                        ));
                        None
                    }
                },
                None => None,
            };

            let code = record.provider_code.clone();
            let seed = CompetitorSeed {
                season,
                team_id,
                record,
            };
            match self.reconciler.reconcile::<Competitors>(&seed).await {
                Ok(_) => counts.competitors += 1,
                Err(err) => errors.push(StepFailure::new(
                    SyncStep::Competitors,
                    format!("reconciling competitor {code}: {err}"),
                )),
            }
        }
    }

    async fn sync_venues(&self, counts: &mut FamilyCounts, errors: &mut Vec<StepFailure>) {
        let records = match self.provider.venues().await {
            Ok(records) => records,
            Err(err) => {
                errors.push(StepFailure::new(
                    SyncStep::Venues,
                    format!("fetching venues: {err}"),
                ));
                return;
            }
        };
        for record in &records {
            match self.reconciler.reconcile::<Venues>(record).await {
                Ok(_) => counts.venues += 1,
                Err(err) => errors.push(StepFailure::new(
                    SyncStep::Venues,
                    format!("reconciling venue {}: {err}", record.provider_code),
                )),
            }
        }
    }

    async fn sync_events(
        &self,
        season: Season,
        counts: &mut FamilyCounts,
        errors: &mut Vec<StepFailure>,
        skipped_events: &mut Vec<SkippedEvent>,
    ) {
        let records = match self.provider.schedule(season).await {
            Ok(records) => records,
            Err(err) => {
                errors.push(StepFailure::new(
                    SyncStep::Events,
                    format!("fetching schedule: {err}"),
                ));
                return;
            }
        };

        for record in records {
            let venue_id = match self.resolver.resolve::<Venues>(&record.venue_code).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    warn!(
                        season,
                        round = record.round,
                        venue = %record.venue_code,
                        "venue not reconciled, skipping event"
                    );
                    skipped_events.push(SkippedEvent {
                        season,
                        round: record.round,
                        venue_code: record.venue_code.clone(),
                    });
                    continue;
                }
                Err(err) => {
                    errors.push(StepFailure::new(
                        SyncStep::Events,
                        format!("resolving venue {}: {err}", record.venue_code),
                    ));
                    continue;
                }
            };

            let round = record.round;
            let seed = EventSeed {
                season,
                venue_id,
                record,
            };
            let event_id = match self.reconciler.reconcile::<Events>(&seed).await {
                Ok(id) => id,
                Err(err) => {
                    errors.push(StepFailure::new(
                        SyncStep::Events,
                        format!("reconciling event {season}:{round}: {err}"),
                    ));
                    continue;
                }
            };
            counts.events += 1;

            for session in &seed.record.sessions {
                let session_seed = SessionSeed {
                    event_id,
                    record: session.clone(),
                };
                match self.reconciler.reconcile::<Sessions>(&session_seed).await {
                    Ok(_) => counts.sessions += 1,
                    Err(err) => errors.push(StepFailure::new(
                        SyncStep::Events,
                        format!(
                            "reconciling session {}:{}: {err}",
                            round,
                            session.session_type.as_str()
                        ),
                    )),
                }
            }
        }
    }

    async fn sync_standings(
        &self,
        season: Season,
        standing_type: StandingType,
        counts: &mut FamilyCounts,
        errors: &mut Vec<StepFailure>,
    ) {
        let step = match standing_type {
            StandingType::Competitor => SyncStep::CompetitorStandings,
            StandingType::Team => SyncStep::TeamStandings,
        };
        let fetched = match standing_type {
            StandingType::Competitor => self.provider.competitor_standings(season).await,
            StandingType::Team => self.provider.team_standings(season).await,
        };
        let rows = match fetched {
            Ok(rows) => rows,
            Err(err) => {
                errors.push(StepFailure::new(
                    step,
                    format!("fetching {} standings: {err}", standing_type.as_str()),
                ));
                return;
            }
        };

        for row in rows {
            let resolved = match standing_type {
                StandingType::Competitor => {
                    self.resolver.resolve::<Competitors>(&row.subject_code).await
                }
                StandingType::Team => self.resolver.resolve::<Teams>(&row.subject_code).await,
            };
            let subject_id = match resolved {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!(
                        season,
                        subject = %row.subject_code,
                        "standing subject not reconciled, skipping row"
                    );
                    continue;
                }
                Err(err) => {
                    errors.push(StepFailure::new(
                        step,
                        format!("resolving standing subject {}: {err}", row.subject_code),
                    ));
                    continue;
                }
            };

            let seed = StandingSeed {
                season,
                round: row.round,
                standing_type,
                subject_id,
                position: row.position,
                points: row.points,
                wins: row.wins,
            };
            match self.reconciler.reconcile::<Standings>(&seed).await {
                Ok(_) => match standing_type {
                    StandingType::Competitor => counts.competitor_standings += 1,
                    StandingType::Team => counts.team_standings += 1,
                },
                Err(err) => errors.push(StepFailure::new(
                    step,
                    format!("reconciling standing for {}: {err}", row.subject_code),
                )),
            }
        }
    }

    /// Merge qualifying and race outcomes into one result document on the
    /// event, then mark the race session completed. Preconditions are hard:
    /// the event must exist and the race classification must be non-empty.
    pub async fn ingest_event_result(
        &self,
        season: Season,
        round: Round,
    ) -> Result<IngestOutcome, IngestError> {
        let event_key = Event::natural_key(season, round);
        let mut event: Event = match self.store.get(Events::FAMILY, &event_key).await? {
            Some(document) => serde_json::from_value(document)?,
            None => return Err(IngestError::EventNotFound { season, round }),
        };

        let mut race = self.provider.race_classification(season, round).await?;
        if race.is_empty() {
            return Err(IngestError::EmptyClassification { season, round });
        }
        race.sort_by_key(|row| row.position);

        // Pole is a bonus field; losing qualifying must not lose the race.
        let qualifying = match self.provider.qualifying_classification(season, round).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    season,
                    round,
                    error = %err,
                    "qualifying fetch failed, recording pole as absent"
                );
                Vec::new()
            }
        };

        let mut full_results = Vec::with_capacity(race.len());
        for row in &race {
            full_results.push(self.result_entry(row).await?);
        }
        let positions: Vec<ResultEntry> = full_results.iter().take(self.top_n).cloned().collect();
        let fastest_lap = match race.iter().find(|row| row.fastest_lap) {
            Some(row) => Some(self.result_entry(row).await?),
            None => None,
        };
        let pole = match qualifying.iter().find(|row| row.position == 1) {
            Some(row) => Some(self.result_entry(row).await?),
            None => None,
        };

        let result_count = full_results.len();
        event.result = Some(EventResultDoc {
            positions,
            pole,
            fastest_lap,
            full_results,
            ingested_at: Utc::now(),
        });
        self.store
            .put(Events::FAMILY, &event_key, serde_json::to_value(&event)?)
            .await?;

        // Completion is recorded strictly after the document write, so a
        // completed race session always has a result to show for it.
        let session_key = Session::natural_key(event.id, SessionType::Race);
        let mut session: Session = match self.store.get(Sessions::FAMILY, &session_key).await? {
            Some(document) => serde_json::from_value(document)?,
            None => return Err(IngestError::RaceSessionMissing { season, round }),
        };
        if !session.completed {
            session.completed = true;
            self.store
                .put(Sessions::FAMILY, &session_key, serde_json::to_value(&session)?)
                .await?;
        }

        let scoring_triggered = match self.scoring.on_event_completed(&event).await {
            Ok(()) => true,
            Err(err) => {
                warn!(season, round, error = %err, "scoring hook failed");
                false
            }
        };

        info!(season, round, result_count, scoring_triggered, "event result ingested");
        Ok(IngestOutcome {
            result_count,
            scoring_triggered,
        })
    }

    async fn result_entry(&self, row: &ClassificationRecord) -> Result<ResultEntry, StoreError> {
        let competitor_id = self
            .resolver
            .resolve::<Competitors>(&row.competitor_code)
            .await?;
        Ok(ResultEntry {
            competitor_id,
            competitor_code: row.competitor_code.clone(),
            position: row.position,
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SeasonSyncPipeline>,
    seasons: Vec<Season>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let pipeline = pipeline.clone();
        let seasons = seasons.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let seasons = seasons.clone();
            Box::pin(async move {
                for season in seasons {
                    let report = pipeline.sync_season(season).await;
                    info!(
                        season,
                        run_id = %report.run_id,
                        success = report.success,
                        "scheduled sync finished"
                    );
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

// ---------------------------------------------------------------------------
// Run reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `reports/<run_id>/` with the run summary, Parquet snapshots of the
/// events and standings families, and a hashed manifest.
pub async fn write_run_report(
    store: &dyn EntityStore,
    report: &SyncReport,
    workspace_root: &Path,
) -> anyhow::Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary = serde_json::to_vec_pretty(report).context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), summary)
        .await
        .context("writing sync_summary.json")?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let events: Vec<Event> = store
        .list(Events::FAMILY)
        .await?
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<_, _>>()
        .context("decoding stored events")?;
    let standings: Vec<Standing> = store
        .list(Standings::FAMILY)
        .await?
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<_, _>>()
        .context("decoding stored standings")?;

    let events_path = snapshot_dir.join("events.parquet");
    let standings_path = snapshot_dir.join("standings.parquet");
    write_events_parquet(&events_path, &events)?;
    write_standings_parquet(&standings_path, &standings)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("events", &reports_dir, &events_path)?,
            manifest_entry("standings", &reports_dir, &standings_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(reports_dir)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_events_parquet(path: &Path, events: &[Event]) -> anyhow::Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("season", DataType::UInt32, false),
        ArrowField::new("round", DataType::UInt32, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("venue_id", DataType::Utf8, false),
        ArrowField::new("sprint_weekend", DataType::Boolean, false),
        ArrowField::new("has_result", DataType::Boolean, false),
    ]));

    let seasons = UInt32Array::from(events.iter().map(|e| e.season as u32).collect::<Vec<_>>());
    let rounds = UInt32Array::from(events.iter().map(|e| e.round).collect::<Vec<_>>());
    let names = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.name.as_str()))
            .collect::<Vec<_>>(),
    );
    let venue_ids: StringArray = events
        .iter()
        .map(|e| Some(e.venue_id.to_string()))
        .collect();
    let sprint = BooleanArray::from(events.iter().map(|e| e.sprint_weekend).collect::<Vec<_>>());
    let has_result = BooleanArray::from(events.iter().map(|e| e.result.is_some()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(seasons),
            Arc::new(rounds),
            Arc::new(names),
            Arc::new(venue_ids),
            Arc::new(sprint),
            Arc::new(has_result),
        ],
    )
    .context("building events record batch")?;
    write_parquet(path, batch)
}

fn write_standings_parquet(path: &Path, standings: &[Standing]) -> anyhow::Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("season", DataType::UInt32, false),
        ArrowField::new("round", DataType::UInt32, false),
        ArrowField::new("standing_type", DataType::Utf8, false),
        ArrowField::new("subject_id", DataType::Utf8, true),
        ArrowField::new("position", DataType::UInt32, false),
        ArrowField::new("points", DataType::Float64, false),
        ArrowField::new("wins", DataType::UInt32, false),
    ]));

    let seasons = UInt32Array::from(
        standings
            .iter()
            .map(|s| s.season as u32)
            .collect::<Vec<_>>(),
    );
    let rounds = UInt32Array::from(standings.iter().map(|s| s.round).collect::<Vec<_>>());
    let types = StringArray::from(
        standings
            .iter()
            .map(|s| Some(s.standing_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let subjects: StringArray = standings
        .iter()
        .map(|s| s.subject_id().map(|id| id.to_string()))
        .collect();
    let positions = UInt32Array::from(standings.iter().map(|s| s.position).collect::<Vec<_>>());
    let points = Float64Array::from(standings.iter().map(|s| s.points).collect::<Vec<_>>());
    let wins = UInt32Array::from(standings.iter().map(|s| s.wins).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(seasons),
            Arc::new(rounds),
            Arc::new(types),
            Arc::new(subjects),
            Arc::new(positions),
            Arc::new(points),
            Arc::new(wins),
        ],
    )
    .context("building standings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> anyhow::Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitwall_store::MemoryStore;

    fn team(code: &str, name: &str) -> TeamRecord {
        TeamRecord {
            provider_code: code.to_string(),
            name: name.to_string(),
            nationality: "British".to_string(),
        }
    }

    #[tokio::test]
    async fn reconcile_creates_then_updates_in_place() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());

        let first_id = reconciler
            .reconcile::<Teams>(&team("mclaren", "McLaren"))
            .await
            .expect("create");
        let second_id = reconciler
            .reconcile::<Teams>(&team("mclaren", "McLaren F1 Team"))
            .await
            .expect("update");
        assert_eq!(first_id, second_id);

        let documents = store.list(Teams::FAMILY).await.expect("list");
        assert_eq!(documents.len(), 1);
        let stored: Team = serde_json::from_value(documents[0].clone()).expect("decode");
        assert_eq!(stored.id, first_id);
        assert_eq!(stored.name, "McLaren F1 Team");
    }

    #[tokio::test]
    async fn resolver_returns_absent_for_unknown_keys() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let resolver = Resolver::new(store.clone());
        let resolved = resolver.resolve::<Teams>("mclaren").await.expect("resolve");
        assert_eq!(resolved, None);
    }

    #[test]
    fn older_season_does_not_move_the_team_reference() {
        let current_team = Uuid::new_v4();
        let old_team = Uuid::new_v4();
        let record = CompetitorRecord {
            provider_code: "alonso".to_string(),
            short_code: "ALO".to_string(),
            car_number: 14,
            first_name: "Fernando".to_string(),
            last_name: "Alonso".to_string(),
            nationality: "Spanish".to_string(),
            date_of_birth: chrono::NaiveDate::from_ymd_opt(1981, 7, 29).expect("date"),
        };

        let mut entity = Competitors::create(
            Uuid::new_v4(),
            &CompetitorSeed {
                season: 2024,
                team_id: Some(current_team),
                record: record.clone(),
            },
        );
        assert_eq!(entity.team_season, Some(2024));

        Competitors::update(
            &mut entity,
            &CompetitorSeed {
                season: 2023,
                team_id: Some(old_team),
                record: record.clone(),
            },
        );
        assert_eq!(entity.team_id, Some(current_team));
        assert_eq!(entity.team_season, Some(2024));

        // Same season re-resolves freely; an unresolved mapping never clears.
        Competitors::update(
            &mut entity,
            &CompetitorSeed {
                season: 2024,
                team_id: Some(old_team),
                record: record.clone(),
            },
        );
        assert_eq!(entity.team_id, Some(old_team));
        Competitors::update(
            &mut entity,
            &CompetitorSeed {
                season: 2025,
                team_id: None,
                record,
            },
        );
        assert_eq!(entity.team_id, Some(old_team));
        assert_eq!(entity.team_season, Some(2024));
    }

    #[tokio::test]
    async fn run_report_writes_summary_and_hashed_snapshots() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());

        let venue_id = reconciler
            .reconcile::<Venues>(&VenueRecord {
                provider_code: "monaco".to_string(),
                name: "Monaco".to_string(),
                country: "Monaco".to_string(),
                city: "Monte Carlo".to_string(),
            })
            .await
            .expect("venue");
        reconciler
            .reconcile::<Events>(&EventSeed {
                season: 2024,
                venue_id,
                record: EventRecord {
                    round: 5,
                    name: "Monaco Grand Prix".to_string(),
                    date: chrono::NaiveDate::from_ymd_opt(2024, 5, 26).expect("date"),
                    sprint_weekend: false,
                    venue_code: "monaco".to_string(),
                    sessions: Vec::new(),
                },
            })
            .await
            .expect("event");
        reconciler
            .reconcile::<Standings>(&StandingSeed {
                season: 2024,
                round: 5,
                standing_type: StandingType::Team,
                subject_id: Uuid::new_v4(),
                position: 1,
                points: 100.0,
                wins: 2,
            })
            .await
            .expect("standing");

        let report = SyncReport {
            run_id: Uuid::new_v4(),
            season: 2024,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            success: true,
            counts: FamilyCounts::default(),
            errors: Vec::new(),
            skipped_events: Vec::new(),
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let reports_dir = write_run_report(store.as_ref(), &report, dir.path())
            .await
            .expect("report written");

        assert!(reports_dir.join("sync_summary.json").exists());
        assert!(reports_dir.join("snapshots").join("events.parquet").exists());
        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(reports_dir.join("snapshots").join("manifest.json"))
                .expect("manifest file"),
        )
        .expect("manifest json");
        let files = manifest["files"].as_array().expect("files array");
        assert_eq!(files.len(), 2);
        for file in files {
            assert_eq!(file["sha256"].as_str().expect("sha").len(), 64);
        }
    }

    #[test]
    fn season_registry_parses_and_filters() {
        let registry: SeasonRegistry = serde_yaml::from_str(
            "seasons:\n  - season: 2024\n    enabled: true\n  - season: 2023\n    enabled: false\n    notes: archived\n",
        )
        .expect("yaml");
        assert_eq!(registry.enabled_seasons(), vec![2024]);
    }
}
