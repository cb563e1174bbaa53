use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tool the loop falls back to when the generator gives us nothing usable.
pub const FALLBACK_TOOL: &str = "search_recent_trainings";

/// Human descriptions for every tool the catalogs expose. Used both to build
/// the tool section of generation prompts and to synthesize a query when the
/// generator names a tool but omits the query text.
pub static TOOL_DESCRIPTIONS: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        (
            "search_recent_trainings",
            "query training sessions from the most recent N days (params: days required, limit optional)",
        ),
        (
            "search_by_date_range",
            "query training sessions inside an explicit date range (params: start_date and end_date required as YYYY-MM-DD, limit optional)",
        ),
        (
            "search_by_distance_range",
            "query training sessions by distance band (params: min_distance_km required, max_distance_km and limit optional)",
        ),
        (
            "search_by_heart_rate",
            "query training sessions by average heart-rate band (params: min_avg_hr required, max_avg_hr and limit optional)",
        ),
        (
            "get_training_stats",
            "aggregate totals and averages over the training history (params: start_date and end_date optional)",
        ),
        (
            "search_by_training_load",
            "query sessions by Garmin training-load band (params: min_load required, max_load and limit optional)",
        ),
        (
            "search_by_power_zone",
            "query sessions by average running-power band (params: min_avg_power required, max_avg_power and limit optional)",
        ),
        (
            "get_training_effect_analysis",
            "aggregate Garmin aerobic/anaerobic training-effect scores (params: start_date and end_date optional)",
        ),
        (
            "deep_search",
            "deep web search for endurance-training theory and race intel (uses the query text directly)",
        ),
    ])
});

pub fn describe_tool(name: &str) -> Option<&'static str> {
    TOOL_DESCRIPTIONS.get(name).copied()
}

/// Scalar tool parameters extracted from one generator response. `None` means
/// "not specified", which the catalogs must not confuse with zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolParams {
    pub days: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub min_distance_km: Option<f64>,
    pub max_distance_km: Option<f64>,
    pub min_avg_hr: Option<i64>,
    pub max_avg_hr: Option<i64>,
    pub min_load: Option<i64>,
    pub max_load: Option<i64>,
    pub min_avg_power: Option<i64>,
    pub max_avg_power: Option<i64>,
    pub limit: Option<i64>,
}

/// The structured decision extracted from one generator response: what to ask,
/// why, and which catalog tool to run it through.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub query: String,
    pub reasoning: String,
    pub tool_name: String,
    pub params: ToolParams,
}

impl Action {
    /// Fixed floor of the recovery cascade: a safe recent-trainings query the
    /// loop can always execute when the generator produced nothing actionable.
    pub fn fallback() -> Self {
        Action {
            query: "recent training overview".to_string(),
            reasoning: "no actionable content in the model output; falling back to a recent-trainings query"
                .to_string(),
            tool_name: FALLBACK_TOOL.to_string(),
            params: ToolParams {
                days: Some(30),
                ..ToolParams::default()
            },
        }
    }

    /// Synthesize query/reasoning from the static description table when the
    /// generator named a tool but omitted the query text.
    pub fn synthesized_for_tool(tool_name: &str, params: ToolParams) -> Option<Self> {
        let description = describe_tool(tool_name)?;
        Some(Action {
            query: description.to_string(),
            reasoning: format!("synthesized from the `{tool_name}` tool selection"),
            tool_name: tool_name.to_string(),
            params,
        })
    }
}
