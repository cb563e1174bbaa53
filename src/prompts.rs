//! Prompt kit for the research agents and the forum host.
//!
//! Prompts live here as consts plus small builders so the loop code stays
//! readable and the wording can be tuned in one place.

use chrono::Local;

use crate::action::describe_tool;
use crate::forum::LogLine;

/// First pass over a topic: pick one tool call that opens the investigation.
pub const FIRST_SEARCH_SYSTEM: &str = "\
You are a running-training research agent. Given a research topic, decide the \
single best data query to start investigating it.

Respond with ONLY a JSON object, no prose, in this exact shape:
{
  \"search_query\": \"what you want to find out\",
  \"reasoning\": \"why this query opens the investigation\",
  \"search_tool\": \"one tool name from the list below\",
  \"parameters\": { ... tool parameters ... }
}";

/// Reflection pass: look at what the narrative already holds and fill a gap.
pub const REFLECTION_SYSTEM: &str = "\
You are a running-training research agent reviewing your own findings so far. \
Identify the most important gap or unverified claim in the current findings \
and decide one data query that addresses it. Do not repeat a query whose \
answer the findings already contain.

Respond with ONLY a JSON object, no prose, in this exact shape:
{
  \"search_query\": \"what you want to find out\",
  \"reasoning\": \"which gap this closes\",
  \"search_tool\": \"one tool name from the list below\",
  \"parameters\": { ... tool parameters ... }
}";

/// Turn the first tool payload into the opening narrative state.
pub const SUMMARY_SYSTEM: &str = "\
You are a running-training analyst. Summarize the tool output below into a \
concise findings report for the given research topic. Keep concrete numbers \
(distances, paces, heart rates, loads) exactly as given. State clearly when \
the data is empty or insufficient. Write in the language of the topic.";

/// Fold a reflection's tool payload into the existing narrative without
/// losing anything already established.
pub const MERGE_SYSTEM: &str = "\
You are a running-training analyst updating an existing findings report with \
new tool output. Produce the updated report. Every fact and number present in \
the existing report must survive into the updated one unless the new output \
directly contradicts it; in that case keep the newer value and note the \
revision. Append new findings, do not rewrite established ones. Write in the \
language of the topic.";

/// Head-coach synthesis over the agents' forum contributions.
pub const HOST_SYSTEM: &str = "\
You are the head coach of a running-training analysis team. Your agents have \
posted their latest findings to a shared forum. Read every contribution and \
produce one synthesis turn with this structure:
1. Restate the runner's objective and current priority.
2. For EACH agent that has spoken, one line `AGENT - critique: ...` assessing \
the quality and completeness of its latest findings.
3. Where agents' findings conflict, state which reading you adopt and why.
4. For EACH agent that has spoken, one line `AGENT - next task: ...` with a \
concrete directive for its next pass.
Write in the language the contributions use. Do not quote the forum line \
format back.";

/// System prompt for a decision turn: the base instructions plus the catalog's
/// tool list with descriptions. Tools without a description entry are listed
/// bare rather than dropped.
pub fn search_system_prompt(base: &str, tools: &[&str]) -> String {
    let mut prompt = String::from(base);
    prompt.push_str("\n\nAvailable tools:\n");
    for tool in tools {
        match describe_tool(tool) {
            Some(description) => prompt.push_str(&format!("- {tool}: {description}\n")),
            None => prompt.push_str(&format!("- {tool}\n")),
        }
    }
    prompt
}

/// Today's date, so "recent" and relative ranges resolve against the actual
/// calendar rather than the model's training cutoff.
pub fn date_context() -> String {
    format!("Today is {}.", Local::now().format("%Y-%m-%d"))
}

pub fn first_pass_user_prompt(title: &str, content: &str) -> String {
    format!(
        "{}\n\nResearch topic: {title}\n\n{content}",
        date_context()
    )
}

pub fn reflection_user_prompt(title: &str, latest_state: &str) -> String {
    format!(
        "{}\n\nResearch topic: {title}\n\nFindings so far:\n{latest_state}",
        date_context()
    )
}

pub fn summary_user_prompt(title: &str, content: &str, query: &str, tool_output: &str) -> String {
    format!(
        "Research topic: {title}\nScope: {content}\nQuery: {query}\n\nTool output:\n{tool_output}"
    )
}

pub fn merge_user_prompt(
    title: &str,
    content: &str,
    previous: &str,
    query: &str,
    tool_output: &str,
) -> String {
    format!(
        "Research topic: {title}\nScope: {content}\n\nExisting report:\n{previous}\n\nQuery: {query}\n\nNew tool output:\n{tool_output}"
    )
}

/// The host reads the full transcript of contributor speeches. Never
/// truncated: dropping early speeches would silently bias the synthesis, so a
/// too-long transcript is the model's problem, not ours.
pub fn host_user_prompt(speeches: &[LogLine]) -> String {
    let mut prompt = String::from("Forum contributions so far:\n\n");
    for line in speeches {
        prompt.push_str(&format!("[{}] {}:\n{}\n\n", line.timestamp, line.speaker, line.content));
    }
    prompt.push_str("Write your synthesis for the runner.");
    prompt
}
