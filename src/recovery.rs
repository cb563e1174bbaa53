//! Turns raw generator text into a usable [`Action`], no matter how mangled.
//!
//! The cascade runs increasingly aggressive stages, each a pure function from
//! text to "parsed" or "try the next stage":
//!   1. strip reasoning side-channels and code-fence markers
//!   2. parse the cleaned text directly
//!   3. extract the first balanced brace region and parse that (scanning the
//!      fence-stripped text first, then the unstripped text)
//!   4. close unterminated strings/brackets (truncated responses) and re-parse
//!   5. give up and return the fixed fallback action
//!
//! `recover` never fails; the loop must not stall on unparseable output.

use serde_json::Value;
use tracing::{debug, warn};

use crate::action::{describe_tool, Action, ToolParams, FALLBACK_TOOL};

pub fn recover(raw: &str) -> Action {
    let unfenced = strip_reasoning(raw);
    let cleaned = strip_fences(&unfenced);
    let trimmed = cleaned.trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        debug!("recovered action from direct parse");
        return finalize(value);
    }

    if let Some(region) = extract_braced(trimmed) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&region) {
            debug!("recovered action from extracted brace region");
            return finalize(value);
        }
    }

    // Fence stripping assumes the payload sits inside the fences; when the
    // response holds a fenced block and the record outside it, the strip
    // deletes the record. Scan the unfenced text too.
    if let Some(region) = extract_braced(unfenced.trim()) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&region) {
            debug!("recovered action from outside a fenced block");
            return finalize(value);
        }
    }

    if let Some(repaired) = repair_truncated(trimmed) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&repaired) {
            warn!("recovered action from repaired (truncated) output");
            return finalize(value);
        }
    }

    warn!("generator output unrecoverable, using fallback action");
    Action::fallback()
}

fn finalize(value: Value) -> Action {
    action_from_value(value).unwrap_or_else(|| {
        warn!("parsed output did not contain a usable action, using fallback");
        Action::fallback()
    })
}

/// Drop `<think>`-style reasoning segments.
fn strip_reasoning(raw: &str) -> String {
    let mut text = raw.to_string();

    for tag in ["think", "thinking", "reasoning"] {
        let closing = format!("</{tag}>");
        if let Some(pos) = text.find(&closing) {
            text = text[pos + closing.len()..].to_string();
        }
        let opening = format!("<{tag}>");
        text = text.replace(&opening, "");
    }

    text.trim().to_string()
}

/// Drop a single layer of code fences, keeping the fenced content.
fn strip_fences(text: &str) -> String {
    let mut content = text.trim();
    if content.contains("```") {
        if let Some(pos) = content.find("```json") {
            content = &content[pos + "```json".len()..];
        } else if let Some(pos) = content.find("```") {
            content = &content[pos + "```".len()..];
        }
        if let Some(pos) = content.rfind("```") {
            content = &content[..pos];
        }
    }

    content.trim().to_string()
}

/// First balanced `{...}` region, honoring strings and escapes. Returns `None`
/// when no brace ever closes (that is the repair stage's job).
fn extract_braced(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Close an output that was cut off mid-token: terminate an open string, drop a
/// dangling comma, then append the missing closers in nesting order.
fn repair_truncated(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let body = &text[start..];

    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for ch in body.chars() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => closers.push('}'),
            '[' if !in_string => closers.push(']'),
            '}' | ']' if !in_string => {
                closers.pop();
            }
            _ => {}
        }
    }

    if closers.is_empty() && !in_string {
        // Already balanced; nothing to repair.
        return None;
    }

    let mut repaired = body.trim_end().to_string();
    if repaired.ends_with('\\') {
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    while repaired.trim_end().ends_with(',') {
        repaired.truncate(repaired.trim_end().len() - 1);
    }
    while let Some(c) = closers.pop() {
        repaired.push(c);
    }
    Some(repaired)
}

/// Normalize one parsed record into the canonical action shape:
/// - hoist a nested `parameters` object to the top level
/// - treat `tool` as an alias for `search_tool`
/// - synthesize query/reasoning from the tool table when only a tool was given
fn action_from_value(mut value: Value) -> Option<Action> {
    let obj = value.as_object_mut()?;

    // The nested value wins over a top-level duplicate; generators that emit
    // both put the authoritative one under `parameters`.
    if let Some(Value::Object(params)) = obj.remove("parameters") {
        for (key, val) in params {
            obj.insert(key, val);
        }
    }
    if !obj.contains_key("search_tool") {
        if let Some(alias) = obj.get("tool").or_else(|| obj.get("tool_name")).cloned() {
            obj.insert("search_tool".to_string(), alias);
        }
    }

    let query = string_field(obj, "search_query")
        .or_else(|| string_field(obj, "query"))
        .unwrap_or_default();
    let reasoning = string_field(obj, "reasoning").unwrap_or_default();
    let tool_name = string_field(obj, "search_tool");

    let params = ToolParams {
        days: int_field(obj, "days"),
        start_date: string_field(obj, "start_date"),
        end_date: string_field(obj, "end_date"),
        min_distance_km: float_field(obj, "min_distance_km"),
        max_distance_km: float_field(obj, "max_distance_km"),
        min_avg_hr: int_field(obj, "min_avg_hr"),
        max_avg_hr: int_field(obj, "max_avg_hr"),
        min_load: int_field(obj, "min_load"),
        max_load: int_field(obj, "max_load"),
        min_avg_power: int_field(obj, "min_avg_power"),
        max_avg_power: int_field(obj, "max_avg_power"),
        limit: int_field(obj, "limit"),
    };

    if query.is_empty() {
        // A recognizable tool alone is still usable: synthesize the text parts.
        let tool = tool_name?;
        if describe_tool(&tool).is_some() {
            warn!(tool = %tool, "generator omitted the query text, synthesizing from the tool table");
            return Action::synthesized_for_tool(&tool, params);
        }
        return None;
    }

    Some(Action {
        query,
        reasoning,
        tool_name: tool_name.unwrap_or_else(|| FALLBACK_TOOL.to_string()),
        params,
    })
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn int_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}
