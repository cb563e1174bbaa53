mod action;
mod config;
mod forum;
mod llm;
mod prompts;
mod recovery;
mod research;
mod retry;
mod tools;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::forum::{ForumHost, ForumLog, HOST_SPEAKER, SYSTEM_SPEAKER};
use crate::llm::{LlmClient, TextGenerator};
use crate::research::{Narrative, ResearchLoop};
use crate::tools::{TheorySearch, ToolCatalog, TrainingStore};

#[derive(Parser)]
#[command(name = "stridecoach", about = "Multi-agent running-training analysis")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "stridecoach.toml")]
    config: PathBuf,

    /// Override the configured number of reflection passes per topic.
    #[arg(long)]
    reflections: Option<usize>,

    /// Override the configured forum log path.
    #[arg(long)]
    forum_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stridecoach=info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    if let Some(reflections) = args.reflections {
        cfg.research.reflection_iterations = reflections;
    }
    if let Some(path) = args.forum_log {
        cfg.forum.log_path = path;
    }
    if cfg.agents.is_empty() {
        anyhow::bail!(
            "no agents configured in {} (add at least one [[agent]] section)",
            args.config.display()
        );
    }

    let policy = cfg.retry.policy();
    let agent_llm: Arc<dyn TextGenerator> = Arc::new(LlmClient::new(&cfg.llm));
    let host_llm: Arc<dyn TextGenerator> = match &cfg.forum.model {
        Some(model) => Arc::new(LlmClient::with_model(&cfg.llm, model.clone())),
        None => agent_llm.clone(),
    };

    let forum = Arc::new(ForumLog::open(&cfg.forum.log_path)?);
    forum.append(SYSTEM_SPEAKER, "analysis run started")?;

    let training: Arc<dyn ToolCatalog> =
        Arc::new(TrainingStore::open(&cfg.data).context("opening the training store")?);
    let theory: Option<Arc<dyn ToolCatalog>> = cfg.data.search_endpoint.as_ref().map(|endpoint| {
        Arc::new(TheorySearch::new(endpoint.clone(), cfg.data.search_api_key()))
            as Arc<dyn ToolCatalog>
    });

    // Every topic runs as its own worker; results come back over one channel.
    let (tx, mut rx) = mpsc::unbounded_channel::<Narrative>();
    let mut worker_count = 0usize;
    for agent in &cfg.agents {
        // The data-scientist agent reads the local store; everyone else
        // researches theory and race intel on the web.
        let catalog = if agent.name == "INSIGHT" {
            training.clone()
        } else {
            match &theory {
                Some(catalog) => catalog.clone(),
                None => {
                    warn!(
                        agent = %agent.name,
                        "no search endpoint configured, skipping this agent"
                    );
                    continue;
                }
            }
        };
        for topic in &agent.topics {
            let research = ResearchLoop::new(
                agent.name.clone(),
                agent_llm.clone(),
                catalog.clone(),
                policy.clone(),
                Some(forum.clone()),
            );
            let topic = topic.clone();
            let reflections = cfg.research.reflection_iterations;
            let tx = tx.clone();
            worker_count += 1;
            tokio::spawn(async move {
                match research.run(&topic, reflections).await {
                    Ok(narrative) => {
                        let _ = tx.send(narrative);
                    }
                    // A failed topic is contained; the rest of the run
                    // continues without it.
                    Err(err) => error!(topic = %topic.title, error = %err, "topic failed"),
                }
            });
        }
    }
    drop(tx);
    info!(workers = worker_count, "research workers started");

    let contributors: Vec<String> = cfg.agents.iter().map(|a| a.name.clone()).collect();
    let host = ForumHost::new(host_llm, policy.clone(), contributors);
    let (done_tx, done_rx) = watch::channel(false);
    let host_task = tokio::spawn(run_host(
        host,
        forum.clone(),
        cfg.forum.host_interval_secs,
        done_rx,
    ));

    let mut narratives = Vec::new();
    while let Some(narrative) = rx.recv().await {
        info!(agent = %narrative.agent, topic = %narrative.title, "topic finished");
        narratives.push(narrative);
    }

    let _ = done_tx.send(true);
    host_task.await.context("joining the host task")?;
    forum.append(SYSTEM_SPEAKER, "analysis run finished")?;

    for narrative in &narratives {
        println!("== [{}] {} ==\n{}\n", narrative.agent, narrative.title, narrative.latest_state);
    }
    Ok(())
}

/// Periodic host passes over the forum, plus one final pass after the workers
/// are done so the last contributions always get synthesized.
async fn run_host(
    host: ForumHost,
    forum: Arc<ForumLog>,
    interval_secs: u64,
    mut done: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                host_pass(&host, &forum, &mut seen).await;
            }
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    break;
                }
            }
        }
    }
    host_pass(&host, &forum, &mut seen).await;
}

/// One pass: re-read the full log and synthesize only when a contributor has
/// spoken since the last pass.
async fn host_pass(host: &ForumHost, forum: &ForumLog, seen: &mut usize) {
    let lines = match forum.read_all() {
        Ok(lines) => lines,
        Err(err) => {
            warn!(error = %err, "could not read the forum log, skipping host pass");
            return;
        }
    };
    let contributor_count = host.contributor_lines(&lines).len();
    if contributor_count <= *seen {
        return;
    }
    if let Some(speech) = host.synthesize(&lines).await {
        if let Err(err) = forum.append(HOST_SPEAKER, &speech) {
            warn!(error = %err, "failed to post the host synthesis");
            return;
        }
        info!("host synthesis posted");
    }
    *seen = contributor_count;
}
