//! Shared forum log and the head-coach synthesis over it.
//!
//! Agents append their latest findings to one append-only log file; a host
//! task periodically reads the whole log back and posts a synthesis. Each
//! record is exactly one line, `[HH:MM:SS] [SPEAKER] content`, with embedded
//! newlines escaped so the file stays line-parseable.

use anyhow::{anyhow, Context};
use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::llm::TextGenerator;
use crate::prompts::{host_user_prompt, HOST_SYSTEM};
use crate::retry::RetryPolicy;

/// Infrastructure notices. Never fed back into the host synthesis.
pub const SYSTEM_SPEAKER: &str = "SYSTEM";
/// The head coach's own lines. Excluded from its input to avoid feedback.
pub const HOST_SPEAKER: &str = "HOST";

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: String,
    pub speaker: String,
    pub content: String,
}

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\] \[(\w+)\] (.*)$").unwrap()
});

pub struct ForumLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ForumLog {
    /// Open for appending, creating the file if needed. Existing records are
    /// kept so a restarted run extends the same forum.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening forum log {}", path.display()))?;
        Ok(ForumLog {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Append one record. Embedded newlines are written as the two characters
    /// `\n` so the record stays on one line; the whole line goes out in a
    /// single write so concurrent appenders cannot interleave.
    pub fn append(&self, speaker: &str, content: &str) -> anyhow::Result<()> {
        let escaped = content.replace('\n', "\\n");
        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%H:%M:%S"),
            speaker,
            escaped
        );
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("forum log writer poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read the whole log back as parsed records. Lines that do not match the
    /// record shape are skipped with a warning rather than failing the read.
    pub fn read_all(&self) -> anyhow::Result<Vec<LogLine>> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading forum log {}", self.path.display()))?;
        let mut lines = Vec::new();
        for raw in contents.lines() {
            if raw.trim().is_empty() {
                continue;
            }
            match LINE_RE.captures(raw) {
                Some(caps) => lines.push(LogLine {
                    timestamp: caps[1].to_string(),
                    speaker: caps[2].to_string(),
                    content: caps[3].replace("\\n", "\n"),
                }),
                None => warn!(line = raw, "skipping malformed forum log line"),
            }
        }
        Ok(lines)
    }
}

/// Periodic head-coach synthesis over the contributors' speeches.
pub struct ForumHost {
    llm: Arc<dyn TextGenerator>,
    policy: RetryPolicy,
    contributors: Vec<String>,
}

impl ForumHost {
    pub fn new(llm: Arc<dyn TextGenerator>, policy: RetryPolicy, contributors: Vec<String>) -> Self {
        ForumHost {
            llm,
            policy,
            contributors,
        }
    }

    /// Contributor speeches only: SYSTEM notices and the host's own previous
    /// lines never feed back into the synthesis.
    pub fn contributor_lines(&self, lines: &[LogLine]) -> Vec<LogLine> {
        lines
            .iter()
            .filter(|l| self.contributors.iter().any(|c| c == &l.speaker))
            .cloned()
            .collect()
    }

    /// One synthesis pass. `Ok(None)` means nothing to say this cycle: either
    /// no contributor has spoken yet, or generation failed and the cycle is
    /// skipped (the next pass re-reads the full log, so nothing is lost).
    pub async fn synthesize(&self, lines: &[LogLine]) -> Option<String> {
        let speeches = self.contributor_lines(lines);
        if speeches.is_empty() {
            return None;
        }
        let user = host_user_prompt(&speeches);
        match self
            .policy
            .execute(|| self.llm.generate(HOST_SYSTEM, &user))
            .await
        {
            Ok(raw) => Some(format_host_speech(&raw)),
            Err(err) => {
                warn!(error = %err, "host synthesis failed, skipping this cycle");
                None
            }
        }
    }
}

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Normalize a raw host completion: collapse runs of blank lines and strip one
/// layer of enclosing quotes the model sometimes wraps the speech in.
pub fn format_host_speech(raw: &str) -> String {
    let collapsed = BLANK_RUNS.replace_all(raw.trim(), "\n\n").to_string();
    for (open, close) in [('"', '"'), ('\u{201c}', '\u{201d}'), ('\u{2018}', '\u{2019}')] {
        if collapsed.len() >= 2 && collapsed.starts_with(open) && collapsed.ends_with(close) {
            return collapsed[open.len_utf8()..collapsed.len() - close.len_utf8()]
                .trim()
                .to_string();
        }
    }
    collapsed
}
