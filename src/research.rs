//! Per-topic research loop: one first pass, then a configured number of
//! reflection passes, each one a decide / run-tool / summarize cycle.
//!
//! The loop is built to finish with something rather than fail cleanly:
//! unusable generator output becomes a fallback action, tool failures degrade
//! to an empty payload, and a failed summary keeps the previous narrative
//! state. Only permanent generator failures (bad credentials, bad requests)
//! abort a topic, since no amount of looping fixes those.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use crate::action::{Action, ToolParams, FALLBACK_TOOL};
use crate::config::TopicConfig;
use crate::forum::ForumLog;
use crate::llm::TextGenerator;
use crate::prompts::{
    first_pass_user_prompt, merge_user_prompt, reflection_user_prompt, search_system_prompt,
    summary_user_prompt, FIRST_SEARCH_SYSTEM, MERGE_SYSTEM, REFLECTION_SYSTEM, SUMMARY_SYSTEM,
};
use crate::retry::RetryPolicy;
use crate::tools::ToolCatalog;

/// Final state of one topic's investigation.
#[derive(Debug, Clone)]
pub struct Narrative {
    pub agent: String,
    pub title: String,
    pub latest_state: String,
}

pub struct ResearchLoop {
    agent: String,
    llm: Arc<dyn TextGenerator>,
    catalog: Arc<dyn ToolCatalog>,
    policy: RetryPolicy,
    forum: Option<Arc<ForumLog>>,
}

impl ResearchLoop {
    pub fn new(
        agent: String,
        llm: Arc<dyn TextGenerator>,
        catalog: Arc<dyn ToolCatalog>,
        policy: RetryPolicy,
        forum: Option<Arc<ForumLog>>,
    ) -> Self {
        ResearchLoop {
            agent,
            llm,
            catalog,
            policy,
            forum,
        }
    }

    /// Run the full loop for one topic: first pass plus `reflections`
    /// reflection passes. The narrative state after each pass is posted to
    /// the forum when one is attached.
    pub async fn run(&self, topic: &TopicConfig, reflections: usize) -> anyhow::Result<Narrative> {
        if topic.title.trim().is_empty() || topic.content.trim().is_empty() {
            anyhow::bail!("topic must have a non-empty title and content");
        }

        info!(agent = %self.agent, topic = %topic.title, "starting first pass");
        let user = first_pass_user_prompt(&topic.title, &topic.content);
        let action = self.decide(FIRST_SEARCH_SYSTEM, &user).await?;
        let payload = self.run_tool(&action).await;
        // A failed first-pass summary falls back to the raw payload so the
        // reflection passes still have material to build on.
        let summary_user =
            summary_user_prompt(&topic.title, &topic.content, &action.query, &payload);
        let mut state = self
            .policy
            .execute_or(payload.clone(), || {
                self.llm.generate(SUMMARY_SYSTEM, &summary_user)
            })
            .await
            .context("summarizing first pass")?;
        self.post_to_forum(&state);

        for pass in 1..=reflections {
            info!(agent = %self.agent, topic = %topic.title, pass, "reflection pass");
            let user = reflection_user_prompt(&topic.title, &state);
            let action = self.decide(REFLECTION_SYSTEM, &user).await?;
            let payload = self.run_tool(&action).await;
            // The merge must never lose established findings, so its degraded
            // default is the previous state unchanged.
            let merge_user =
                merge_user_prompt(&topic.title, &topic.content, &state, &action.query, &payload);
            state = self
                .policy
                .execute_or(state.clone(), || {
                    self.llm.generate(MERGE_SYSTEM, &merge_user)
                })
                .await
                .context("merging reflection pass")?;
            self.post_to_forum(&state);
        }

        Ok(Narrative {
            agent: self.agent.clone(),
            title: topic.title.clone(),
            latest_state: state,
        })
    }

    /// One decision turn. Whatever comes back from the generator (including
    /// nothing, after exhausted retries) is pushed through the recovery
    /// cascade, so this always yields an executable action. A recovered tool
    /// name this catalog does not offer is rewritten to the catalog's
    /// fallback tool.
    async fn decide(&self, system_base: &str, user: &str) -> anyhow::Result<Action> {
        let system = search_system_prompt(system_base, self.catalog.supported_tools());
        let raw = self
            .policy
            .execute_or(String::new(), || self.llm.generate(&system, user))
            .await
            .context("generating a search decision")?;
        let mut action = crate::recovery::recover(&raw);
        if !self
            .catalog
            .supported_tools()
            .contains(&action.tool_name.as_str())
        {
            warn!(
                agent = %self.agent,
                tool = %action.tool_name,
                "tool not in this catalog, rewriting to the fallback tool"
            );
            action.tool_name = self.catalog.fallback_tool().to_string();
            // The original params belong to the rejected tool and would fail
            // the fallback's required-parameter checks. The store's fallback
            // needs its days window; the search fallback takes none.
            action.params = if action.tool_name == FALLBACK_TOOL {
                Action::fallback().params
            } else {
                ToolParams::default()
            };
        }
        Ok(action)
    }

    /// Tool failures never abort a topic; the pass continues with an empty
    /// payload and the summary step reports the gap.
    async fn run_tool(&self, action: &Action) -> String {
        match self.policy.execute(|| self.catalog.invoke(action)).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    agent = %self.agent,
                    tool = %action.tool_name,
                    error = %err,
                    "tool invocation failed, continuing with an empty payload"
                );
                String::new()
            }
        }
    }

    fn post_to_forum(&self, state: &str) {
        if let Some(forum) = &self.forum {
            if let Err(err) = forum.append(&self.agent, state) {
                warn!(agent = %self.agent, error = %err, "failed to post to the forum");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::tools::ToolError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(ScriptedLlm {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedLlm {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyCompletion))
        }
    }

    struct FakeCatalog {
        payload: Result<String, ()>,
        invoked: Mutex<Vec<Action>>,
    }

    impl FakeCatalog {
        fn new(payload: Result<String, ()>) -> Arc<Self> {
            Arc::new(FakeCatalog {
                payload,
                invoked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolCatalog for FakeCatalog {
        fn supported_tools(&self) -> &[&'static str] {
            &[
                "search_recent_trainings",
                "search_by_date_range",
                "get_training_stats",
            ]
        }

        fn fallback_tool(&self) -> &'static str {
            "search_recent_trainings"
        }

        async fn invoke(&self, action: &Action) -> Result<String, ToolError> {
            self.invoked.lock().unwrap().push(action.clone());
            match &self.payload {
                Ok(text) => Ok(text.clone()),
                Err(()) => Err(ToolError::UnknownTool(action.tool_name.clone())),
            }
        }
    }

    fn topic(title: &str, content: &str) -> TopicConfig {
        TopicConfig {
            title: title.to_string(),
            content: content.to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, 1, 2)
    }

    fn research_loop(llm: Arc<ScriptedLlm>, catalog: Arc<FakeCatalog>) -> ResearchLoop {
        ResearchLoop::new("INSIGHT".to_string(), llm, catalog, policy(), None)
    }

    #[tokio::test]
    async fn empty_topic_is_rejected_before_any_call() {
        let llm = ScriptedLlm::new(vec![]);
        let catalog = FakeCatalog::new(Ok("{}".to_string()));
        let result = research_loop(llm, catalog.clone())
            .run(&topic("", "something"), 0)
            .await;
        assert!(result.is_err());
        assert!(catalog.invoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_pass_and_reflections_build_the_narrative() {
        let llm = ScriptedLlm::new(vec![
            // first-pass decision
            Ok(r#"{"search_query": "近30天训练概览", "reasoning": "建立基线",
                   "search_tool": "search_recent_trainings", "parameters": {"days": 30}}"#
                .to_string()),
            // first-pass summary
            Ok("初始发现：每周跑量45公里".to_string()),
            // reflection decision
            Ok(r#"{"search_query": "长距离课表", "reasoning": "验证耐力",
                   "search_tool": "search_by_date_range",
                   "parameters": {"start_date": "2025-07-01", "end_date": "2025-07-31"}}"#
                .to_string()),
            // merge
            Ok("初始发现：每周跑量45公里\n补充：7月最长距离21公里".to_string()),
        ]);
        let catalog = FakeCatalog::new(Ok(r#"{"count": 3}"#.to_string()));
        let narrative = research_loop(llm, catalog.clone())
            .run(&topic("长距离耐力", "评估长距离训练表现"), 1)
            .await
            .unwrap();

        assert_eq!(narrative.title, "长距离耐力");
        assert!(narrative.latest_state.contains("45公里"));
        assert!(narrative.latest_state.contains("21公里"));
        let invoked = catalog.invoked.lock().unwrap();
        assert_eq!(invoked.len(), 2);
        assert_eq!(invoked[0].tool_name, "search_recent_trainings");
        assert_eq!(invoked[0].params.days, Some(30));
        assert_eq!(invoked[1].tool_name, "search_by_date_range");
    }

    #[tokio::test]
    async fn garbage_decision_still_invokes_the_fallback_tool() {
        let llm = ScriptedLlm::new(vec![
            Ok("I think we should look at the data somehow".to_string()),
            Ok("no data yet".to_string()),
        ]);
        let catalog = FakeCatalog::new(Ok("{}".to_string()));
        research_loop(llm, catalog.clone())
            .run(&topic("耐力", "评估"), 0)
            .await
            .unwrap();
        let invoked = catalog.invoked.lock().unwrap();
        assert_eq!(invoked.len(), 1);
        assert_eq!(invoked[0].tool_name, "search_recent_trainings");
        assert_eq!(invoked[0].params.days, Some(30));
    }

    #[tokio::test]
    async fn unsupported_tool_is_rewritten_to_the_catalog_fallback() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"search_query": "power zones", "search_tool": "search_by_power_zone",
                   "parameters": {"min_avg_power": 250}}"#
                .to_string()),
            Ok("summary".to_string()),
        ]);
        let catalog = FakeCatalog::new(Ok("{}".to_string()));
        research_loop(llm, catalog.clone())
            .run(&topic("功率", "分析功率"), 0)
            .await
            .unwrap();
        let invoked = catalog.invoked.lock().unwrap();
        assert_eq!(invoked[0].tool_name, "search_recent_trainings");
        // The query survives the rewrite; the rejected tool's params do not,
        // and the fallback tool gets params it can actually run with.
        assert_eq!(invoked[0].query, "power zones");
        assert_eq!(invoked[0].params.min_avg_power, None);
        assert_eq!(invoked[0].params.days, Some(30));
    }

    #[tokio::test]
    async fn tool_failure_degrades_instead_of_aborting() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"search_query": "stats", "search_tool": "get_training_stats", "parameters": {}}"#
                .to_string()),
            Ok("数据不足，无法得出结论".to_string()),
        ]);
        let catalog = FakeCatalog::new(Err(()));
        let narrative = research_loop(llm, catalog)
            .run(&topic("统计", "整体统计"), 0)
            .await
            .unwrap();
        assert!(narrative.latest_state.contains("数据不足"));
    }

    #[tokio::test]
    async fn failed_merge_keeps_the_previous_state() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"search_query": "q", "search_tool": "get_training_stats", "parameters": {}}"#
                .to_string()),
            Ok("established findings".to_string()),
            Ok(r#"{"search_query": "q2", "search_tool": "get_training_stats", "parameters": {}}"#
                .to_string()),
            // merge fails on both attempts of the 2-attempt policy
            Err(LlmError::EmptyCompletion),
            Err(LlmError::EmptyCompletion),
        ]);
        let catalog = FakeCatalog::new(Ok("{}".to_string()));
        let narrative = research_loop(llm, catalog)
            .run(&topic("统计", "整体统计"), 1)
            .await
            .unwrap();
        assert_eq!(narrative.latest_state, "established findings");
    }

    #[tokio::test]
    async fn permanent_generator_failure_aborts_the_topic() {
        let llm = ScriptedLlm::new(vec![Err(LlmError::Auth)]);
        let catalog = FakeCatalog::new(Ok("{}".to_string()));
        let result = research_loop(llm, catalog.clone())
            .run(&topic("耐力", "评估"), 0)
            .await;
        assert!(result.is_err());
        assert!(catalog.invoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_pass_posts_the_state_to_the_forum() {
        let dir = tempfile::tempdir().unwrap();
        let forum = Arc::new(ForumLog::open(&dir.path().join("forum.log")).unwrap());
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"search_query": "q", "search_tool": "get_training_stats", "parameters": {}}"#
                .to_string()),
            Ok("first state".to_string()),
            Ok(r#"{"search_query": "q2", "search_tool": "get_training_stats", "parameters": {}}"#
                .to_string()),
            Ok("merged state".to_string()),
        ]);
        let catalog = FakeCatalog::new(Ok("{}".to_string()));
        let research = ResearchLoop::new(
            "INSIGHT".to_string(),
            llm,
            catalog,
            policy(),
            Some(forum.clone()),
        );
        research.run(&topic("统计", "整体统计"), 1).await.unwrap();

        let lines = forum.read_all().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].speaker, "INSIGHT");
        assert_eq!(lines[0].content, "first state");
        assert_eq!(lines[1].content, "merged state");
    }
}
