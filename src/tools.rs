//! Tool catalogs the research loops select from.
//!
//! Two concrete catalogs: a local SQLite training store (keep or garmin
//! flavor) for the data-scientist agent, and a Tavily-style deep web search
//! for the theory and intel agents. Both return opaque text payloads the
//! summarization step folds into the narrative.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::action::Action;
use crate::config::DataConfig;
use crate::retry::{Classify, FailureClass};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}` for this catalog")]
    UnknownTool(String),
    #[error("tool `{tool}` requires parameter `{param}`")]
    MissingParam {
        tool: &'static str,
        param: &'static str,
    },
    #[error("training store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("search endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },
    #[error("network error talking to the search endpoint: {0}")]
    Network(#[from] reqwest::Error),
}

impl Classify for ToolError {
    fn class(&self) -> FailureClass {
        match self {
            ToolError::UnknownTool(_) | ToolError::MissingParam { .. } | ToolError::Store(_) => {
                FailureClass::Permanent
            }
            ToolError::Endpoint { status, .. } if *status == 401 || *status == 403 => {
                FailureClass::Permanent
            }
            ToolError::Endpoint { .. } | ToolError::Network(_) => FailureClass::Transient,
        }
    }
}

#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Tool identifiers this catalog accepts; fixed at setup time.
    fn supported_tools(&self) -> &[&'static str];

    /// Tool the loop rewrites an action to when the generator picked one this
    /// catalog does not offer.
    fn fallback_tool(&self) -> &'static str;

    /// Run the action's tool with its parameters; the payload is opaque text
    /// for the summarization step.
    async fn invoke(&self, action: &Action) -> Result<String, ToolError>;
}

/// Which vendor's export populated the training store. Garmin adds the
/// load/power/training-effect tools on top of the common five.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Keep,
    Garmin,
}

impl DataSource {
    /// Unrecognized names are a configuration error and must fail before any
    /// loop iteration starts.
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        match name.to_lowercase().as_str() {
            "keep" => Ok(DataSource::Keep),
            "garmin" => Ok(DataSource::Garmin),
            other => anyhow::bail!(
                "unsupported training data source `{other}` (expected `keep` or `garmin`)"
            ),
        }
    }
}

const COMMON_TOOLS: &[&str] = &[
    "search_recent_trainings",
    "search_by_date_range",
    "search_by_distance_range",
    "search_by_heart_rate",
    "get_training_stats",
];

const GARMIN_TOOLS: &[&str] = &[
    "search_recent_trainings",
    "search_by_date_range",
    "search_by_distance_range",
    "search_by_heart_rate",
    "get_training_stats",
    "search_by_training_load",
    "search_by_power_zone",
    "get_training_effect_analysis",
];

/// One imported training session. Optional metrics stay `None` when the
/// source export did not carry them (keep exports have no load/power data).
#[derive(Debug, Clone, Default)]
pub struct TrainingSession {
    pub start_time: String,
    pub distance_km: f64,
    pub duration_min: f64,
    pub avg_hr: Option<i64>,
    pub max_hr: Option<i64>,
    pub avg_pace_min_per_km: Option<f64>,
    pub calories: Option<i64>,
    pub training_load: Option<f64>,
    pub aerobic_effect: Option<f64>,
    pub anaerobic_effect: Option<f64>,
    pub avg_power: Option<i64>,
}

pub struct TrainingStore {
    conn: Mutex<Connection>,
    source: DataSource,
}

impl TrainingStore {
    pub fn open(cfg: &DataConfig) -> anyhow::Result<Self> {
        let source = DataSource::parse(&cfg.source)?;
        let conn = Connection::open(&cfg.db_path)?;
        Self::init_schema(&conn)?;
        info!(source = ?source, db = %cfg.db_path.display(), "training store ready");
        Ok(TrainingStore {
            conn: Mutex::new(conn),
            source,
        })
    }

    pub fn open_in_memory(source: DataSource) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(TrainingStore {
            conn: Mutex::new(conn),
            source,
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TEXT NOT NULL,
                distance_km REAL NOT NULL,
                duration_min REAL NOT NULL,
                avg_hr INTEGER,
                max_hr INTEGER,
                avg_pace_min_per_km REAL,
                calories INTEGER,
                training_load REAL,
                aerobic_effect REAL,
                anaerobic_effect REAL,
                avg_power INTEGER
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn insert(&self, s: &TrainingSession) -> Result<(), ToolError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (start_time, distance_km, duration_min, avg_hr, max_hr,
                avg_pace_min_per_km, calories, training_load, aerobic_effect, anaerobic_effect, avg_power)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                s.start_time,
                s.distance_km,
                s.duration_min,
                s.avg_hr,
                s.max_hr,
                s.avg_pace_min_per_km,
                s.calories,
                s.training_load,
                s.aerobic_effect,
                s.anaerobic_effect,
                s.avg_power,
            ],
        )?;
        Ok(())
    }

    fn query_sessions(
        conn: &Connection,
        sql: &str,
        bind: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<serde_json::Value>, ToolError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(bind, |row| {
            Ok(json!({
                "start_time": row.get::<_, String>(1)?,
                "distance_km": row.get::<_, f64>(2)?,
                "duration_min": row.get::<_, f64>(3)?,
                "avg_hr": row.get::<_, Option<i64>>(4)?,
                "max_hr": row.get::<_, Option<i64>>(5)?,
                "avg_pace_min_per_km": row.get::<_, Option<f64>>(6)?,
                "calories": row.get::<_, Option<i64>>(7)?,
                "training_load": row.get::<_, Option<f64>>(8)?,
                "aerobic_effect": row.get::<_, Option<f64>>(9)?,
                "anaerobic_effect": row.get::<_, Option<f64>>(10)?,
                "avg_power": row.get::<_, Option<i64>>(11)?,
            }))
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn render(tool: &str, sessions: Vec<serde_json::Value>) -> String {
        json!({
            "tool": tool,
            "count": sessions.len(),
            "sessions": sessions,
        })
        .to_string()
    }
}

const SESSION_COLUMNS: &str = "id, start_time, distance_km, duration_min, avg_hr, max_hr, \
     avg_pace_min_per_km, calories, training_load, aerobic_effect, anaerobic_effect, avg_power";

#[async_trait]
impl ToolCatalog for TrainingStore {
    fn supported_tools(&self) -> &[&'static str] {
        match self.source {
            DataSource::Keep => COMMON_TOOLS,
            DataSource::Garmin => GARMIN_TOOLS,
        }
    }

    fn fallback_tool(&self) -> &'static str {
        "search_recent_trainings"
    }

    async fn invoke(&self, action: &Action) -> Result<String, ToolError> {
        let tool = action.tool_name.as_str();
        if !self.supported_tools().contains(&tool) {
            return Err(ToolError::UnknownTool(tool.to_string()));
        }
        let p = &action.params;
        let conn = self.conn.lock().await;

        match tool {
            "search_recent_trainings" => {
                let days = p.days.ok_or(ToolError::MissingParam {
                    tool: "search_recent_trainings",
                    param: "days",
                })?;
                let limit = p.limit.unwrap_or(50);
                let sessions = Self::query_sessions(
                    &conn,
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE date(start_time) >= date('now', ?1)
                         ORDER BY start_time DESC LIMIT ?2"
                    ),
                    params![format!("-{days} days"), limit],
                )?;
                Ok(Self::render(tool, sessions))
            }
            "search_by_date_range" => {
                let start = p.start_date.as_deref().ok_or(ToolError::MissingParam {
                    tool: "search_by_date_range",
                    param: "start_date",
                })?;
                let end = p.end_date.as_deref().ok_or(ToolError::MissingParam {
                    tool: "search_by_date_range",
                    param: "end_date",
                })?;
                let limit = p.limit.unwrap_or(100);
                let sessions = Self::query_sessions(
                    &conn,
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE date(start_time) BETWEEN ?1 AND ?2
                         ORDER BY start_time DESC LIMIT ?3"
                    ),
                    params![start, end, limit],
                )?;
                Ok(Self::render(tool, sessions))
            }
            "search_by_distance_range" => {
                let min = p.min_distance_km.ok_or(ToolError::MissingParam {
                    tool: "search_by_distance_range",
                    param: "min_distance_km",
                })?;
                let max = p.max_distance_km.unwrap_or(1e9);
                let limit = p.limit.unwrap_or(50);
                let sessions = Self::query_sessions(
                    &conn,
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE distance_km >= ?1 AND distance_km <= ?2
                         ORDER BY start_time DESC LIMIT ?3"
                    ),
                    params![min, max, limit],
                )?;
                Ok(Self::render(tool, sessions))
            }
            "search_by_heart_rate" => {
                let min = p.min_avg_hr.ok_or(ToolError::MissingParam {
                    tool: "search_by_heart_rate",
                    param: "min_avg_hr",
                })?;
                let max = p.max_avg_hr.unwrap_or(i64::MAX);
                let limit = p.limit.unwrap_or(50);
                let sessions = Self::query_sessions(
                    &conn,
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE avg_hr IS NOT NULL AND avg_hr >= ?1 AND avg_hr <= ?2
                         ORDER BY start_time DESC LIMIT ?3"
                    ),
                    params![min, max, limit],
                )?;
                Ok(Self::render(tool, sessions))
            }
            "search_by_training_load" => {
                let min = p.min_load.ok_or(ToolError::MissingParam {
                    tool: "search_by_training_load",
                    param: "min_load",
                })?;
                let max = p.max_load.unwrap_or(i64::MAX);
                let limit = p.limit.unwrap_or(50);
                let sessions = Self::query_sessions(
                    &conn,
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE training_load IS NOT NULL AND training_load >= ?1 AND training_load <= ?2
                         ORDER BY start_time DESC LIMIT ?3"
                    ),
                    params![min, max, limit],
                )?;
                Ok(Self::render(tool, sessions))
            }
            "search_by_power_zone" => {
                let min = p.min_avg_power.ok_or(ToolError::MissingParam {
                    tool: "search_by_power_zone",
                    param: "min_avg_power",
                })?;
                let max = p.max_avg_power.unwrap_or(i64::MAX);
                let limit = p.limit.unwrap_or(50);
                let sessions = Self::query_sessions(
                    &conn,
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE avg_power IS NOT NULL AND avg_power >= ?1 AND avg_power <= ?2
                         ORDER BY start_time DESC LIMIT ?3"
                    ),
                    params![min, max, limit],
                )?;
                Ok(Self::render(tool, sessions))
            }
            "get_training_stats" => {
                let start = p.start_date.clone().unwrap_or_else(|| "0001-01-01".to_string());
                let end = p.end_date.clone().unwrap_or_else(|| "9999-12-31".to_string());
                let stats = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(distance_km), 0), COALESCE(SUM(duration_min), 0),
                            AVG(avg_hr), AVG(distance_km), MAX(distance_km)
                     FROM sessions WHERE date(start_time) BETWEEN ?1 AND ?2",
                    params![start, end],
                    |row| {
                        Ok(json!({
                            "tool": "get_training_stats",
                            "session_count": row.get::<_, i64>(0)?,
                            "total_distance_km": row.get::<_, f64>(1)?,
                            "total_duration_min": row.get::<_, f64>(2)?,
                            "avg_heart_rate": row.get::<_, Option<f64>>(3)?,
                            "avg_distance_km": row.get::<_, Option<f64>>(4)?,
                            "longest_distance_km": row.get::<_, Option<f64>>(5)?,
                        }))
                    },
                )?;
                Ok(stats.to_string())
            }
            "get_training_effect_analysis" => {
                let start = p.start_date.clone().unwrap_or_else(|| "0001-01-01".to_string());
                let end = p.end_date.clone().unwrap_or_else(|| "9999-12-31".to_string());
                let analysis = conn.query_row(
                    "SELECT AVG(aerobic_effect), AVG(anaerobic_effect), AVG(training_load),
                            COALESCE(SUM(CASE WHEN aerobic_effect < 2.0 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN aerobic_effect >= 2.0 AND aerobic_effect < 3.0 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN aerobic_effect >= 3.0 THEN 1 ELSE 0 END), 0)
                     FROM sessions
                     WHERE aerobic_effect IS NOT NULL AND date(start_time) BETWEEN ?1 AND ?2",
                    params![start, end],
                    |row| {
                        Ok(json!({
                            "tool": "get_training_effect_analysis",
                            "avg_aerobic_effect": row.get::<_, Option<f64>>(0)?,
                            "avg_anaerobic_effect": row.get::<_, Option<f64>>(1)?,
                            "avg_training_load": row.get::<_, Option<f64>>(2)?,
                            "maintaining_count": row.get::<_, i64>(3)?,
                            "improving_count": row.get::<_, i64>(4)?,
                            "highly_improving_count": row.get::<_, i64>(5)?,
                        }))
                    },
                )?;
                Ok(analysis.to_string())
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

/// Deep web search against a Tavily-style endpoint, for training theory and
/// race intel the local store cannot answer.
pub struct TheorySearch {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

const THEORY_TOOLS: &[&str] = &["deep_search"];

impl TheorySearch {
    pub fn new(endpoint: String, api_key: String) -> Self {
        TheorySearch {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, serde::Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ToolCatalog for TheorySearch {
    fn supported_tools(&self) -> &[&'static str] {
        THEORY_TOOLS
    }

    fn fallback_tool(&self) -> &'static str {
        "deep_search"
    }

    async fn invoke(&self, action: &Action) -> Result<String, ToolError> {
        if action.tool_name != "deep_search" {
            return Err(ToolError::UnknownTool(action.tool_name.clone()));
        }

        let body = json!({
            "api_key": self.api_key,
            "query": action.query,
            "search_depth": "advanced",
            "max_results": 20,
            "include_answer": true,
        });
        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Endpoint {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: SearchResponse = response.json().await?;
        let mut payload = String::new();
        if let Some(answer) = parsed.answer {
            payload.push_str(&format!("Summary: {answer}\n\n"));
        }
        for hit in &parsed.results {
            payload.push_str(&format!(
                "- {} [Source: {}]\n  {}\n",
                hit.title, hit.url, hit.content
            ));
        }
        if payload.is_empty() {
            payload.push_str("No results found.");
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ToolParams;

    fn action(tool: &str, params: ToolParams) -> Action {
        Action {
            query: "test".to_string(),
            reasoning: String::new(),
            tool_name: tool.to_string(),
            params,
        }
    }

    fn session(start: &str, km: f64, hr: Option<i64>) -> TrainingSession {
        TrainingSession {
            start_time: start.to_string(),
            distance_km: km,
            duration_min: km * 6.0,
            avg_hr: hr,
            ..TrainingSession::default()
        }
    }

    #[test]
    fn unknown_source_is_a_setup_error() {
        assert!(DataSource::parse("strava").is_err());
        assert!(DataSource::parse("Garmin").is_ok());
    }

    #[test]
    fn keep_source_excludes_garmin_tools() {
        let keep = TrainingStore::open_in_memory(DataSource::Keep).unwrap();
        assert!(!keep.supported_tools().contains(&"search_by_power_zone"));
        let garmin = TrainingStore::open_in_memory(DataSource::Garmin).unwrap();
        assert!(garmin.supported_tools().contains(&"search_by_power_zone"));
    }

    #[tokio::test]
    async fn date_range_returns_matching_rows() {
        let store = TrainingStore::open_in_memory(DataSource::Garmin).unwrap();
        store.insert(&session("2025-01-10 07:00:00", 10.0, Some(150))).await.unwrap();
        store.insert(&session("2025-02-10 07:00:00", 21.1, Some(158))).await.unwrap();

        let out = store
            .invoke(&action(
                "search_by_date_range",
                ToolParams {
                    start_date: Some("2025-01-01".to_string()),
                    end_date: Some("2025-01-31".to_string()),
                    ..ToolParams::default()
                },
            ))
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["count"], 1);
        assert_eq!(v["sessions"][0]["distance_km"], 10.0);
    }

    #[tokio::test]
    async fn heart_rate_band_ignores_sessions_without_hr() {
        let store = TrainingStore::open_in_memory(DataSource::Keep).unwrap();
        store.insert(&session("2025-03-01 07:00:00", 8.0, None)).await.unwrap();
        store.insert(&session("2025-03-02 07:00:00", 12.0, Some(162))).await.unwrap();

        let out = store
            .invoke(&action(
                "search_by_heart_rate",
                ToolParams {
                    min_avg_hr: Some(150),
                    ..ToolParams::default()
                },
            ))
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["count"], 1);
    }

    #[tokio::test]
    async fn missing_required_param_is_rejected() {
        let store = TrainingStore::open_in_memory(DataSource::Keep).unwrap();
        let err = store
            .invoke(&action("search_recent_trainings", ToolParams::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingParam { param: "days", .. }));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn garmin_tool_on_keep_store_is_unknown() {
        let store = TrainingStore::open_in_memory(DataSource::Keep).unwrap();
        let err = store
            .invoke(&action(
                "search_by_training_load",
                ToolParams {
                    min_load: Some(100),
                    ..ToolParams::default()
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn stats_aggregate_totals() {
        let store = TrainingStore::open_in_memory(DataSource::Keep).unwrap();
        store.insert(&session("2025-04-01 07:00:00", 10.0, Some(140))).await.unwrap();
        store.insert(&session("2025-04-03 07:00:00", 20.0, Some(150))).await.unwrap();

        let out = store
            .invoke(&action("get_training_stats", ToolParams::default()))
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["session_count"], 2);
        assert_eq!(v["total_distance_km"], 30.0);
        assert_eq!(v["longest_distance_km"], 20.0);
    }

    #[tokio::test]
    async fn training_effect_counts_by_band() {
        let store = TrainingStore::open_in_memory(DataSource::Garmin).unwrap();
        for (effect, load) in [(1.5, 60.0), (2.5, 120.0), (3.4, 210.0)] {
            store
                .insert(&TrainingSession {
                    start_time: "2025-05-01 07:00:00".to_string(),
                    distance_km: 10.0,
                    duration_min: 60.0,
                    aerobic_effect: Some(effect),
                    training_load: Some(load),
                    ..TrainingSession::default()
                })
                .await
                .unwrap();
        }

        let out = store
            .invoke(&action("get_training_effect_analysis", ToolParams::default()))
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["maintaining_count"], 1);
        assert_eq!(v["improving_count"], 1);
        assert_eq!(v["highly_improving_count"], 1);
        assert_eq!(v["avg_training_load"], 130.0);
    }

    #[test]
    fn endpoint_status_classification() {
        let auth = ToolError::Endpoint {
            status: 401,
            message: String::new(),
        };
        assert_eq!(auth.class(), FailureClass::Permanent);
        let overloaded = ToolError::Endpoint {
            status: 503,
            message: String::new(),
        };
        assert_eq!(overloaded.class(), FailureClass::Transient);
    }
}
