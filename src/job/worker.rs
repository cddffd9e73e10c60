//! Worker process protocol
//!
//! Local execution runs in a separate process. The worker receives one
//! JSON [`WorkerRequest`] on stdin and answers with JSON lines of
//! [`WorkerMessage`] on stdout.

use crate::checksum::Checksum;
use crate::error::{CommuneError, CommuneResult};
use crate::transformation::OutputPin;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Captured output longer than this is middle-truncated
pub const MAX_LOG_CHARS: usize = 10_000;
const KEEP_HEAD: usize = 4_960;
const KEEP_TAIL: usize = 5_000;

/// One resolved input pin handed to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPin {
    pub celltype: String,
    pub subcelltype: Option<String>,
    /// Hex-encoded buffer
    pub buffer: String,
}

impl WorkerPin {
    pub fn bytes(&self) -> CommuneResult<Vec<u8>> {
        hex::decode(&self.buffer).map_err(|e| CommuneError::Worker(format!("bad pin buffer: {}", e)))
    }
}

/// Everything a worker needs to run one transformation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub transformation: Checksum,
    pub language: Option<String>,
    pub output: OutputPin,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub env: Option<Checksum>,
    #[serde(default)]
    pub as_map: Option<BTreeMap<String, String>>,
    pub pins: BTreeMap<String, WorkerPin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line written by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress { value: f64 },
    Preliminary { buffer: String },
    Result { buffer: String },
    ResultChecksum { checksum: Checksum },
    Error { message: String },
    Log { stream: LogStream, content: String },
    ExecutionTime { seconds: f64 },
}

impl WorkerMessage {
    pub fn to_line(&self) -> CommuneResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Starts worker processes
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker with piped stdin, stdout and stderr
    async fn spawn(&self, request: &WorkerRequest) -> CommuneResult<Child>;
}

/// Launches `program args...` for every job
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<current executable> worker`
    pub fn current_exe() -> CommuneResult<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| CommuneError::io("locating current executable", e))?;
        Ok(Self::new(exe, vec!["worker".to_string()]))
    }

    /// Build from a configured command line; empty means the current executable
    pub fn from_command(command: &[String]) -> CommuneResult<Self> {
        match command.split_first() {
            Some((program, args)) => Ok(Self::new(program, args.to_vec())),
            None => Self::current_exe(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn spawn(&self, request: &WorkerRequest) -> CommuneResult<Child> {
        debug!(
            "Executing: {} {:?} for {}",
            self.program.display(),
            self.args,
            request.transformation.short()
        );

        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommuneError::command_failed(self.program.display().to_string(), e))
    }
}

/// Keep the head and tail of very long output with a marker in between
pub fn truncate_middle(content: &str) -> String {
    let total = content.chars().count();
    if total <= MAX_LOG_CHARS {
        return content.to_string();
    }
    let skipped = total - KEEP_HEAD - KEEP_TAIL;
    let head: String = content.chars().take(KEEP_HEAD).collect();
    let tail: String = content.chars().skip(total - KEEP_TAIL).collect();
    format!("{}\n...(skipped {} characters)...\n{}", head, skipped, tail)
}

/// Accumulates worker output while keeping only what
/// [`truncate_middle`] would show of it
#[derive(Debug, Default)]
pub struct CapturedOutput {
    head: String,
    head_chars: usize,
    /// Everything after the head, bounded to the longest tail that can
    /// still be shown
    tail: VecDeque<char>,
    total: usize,
}

impl CapturedOutput {
    const TAIL_WINDOW: usize = MAX_LOG_CHARS - KEEP_HEAD;

    pub fn push_str(&mut self, content: &str) {
        for c in content.chars() {
            self.total += 1;
            if self.head_chars < KEEP_HEAD {
                self.head.push(c);
                self.head_chars += 1;
                continue;
            }
            if self.tail.len() == Self::TAIL_WINDOW {
                self.tail.pop_front();
            }
            self.tail.push_back(c);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Same text as `truncate_middle` applied to everything pushed
    pub fn render(&self) -> String {
        if self.total <= MAX_LOG_CHARS {
            let mut out = self.head.clone();
            out.extend(self.tail.iter());
            return out;
        }
        let skipped = self.total - KEEP_HEAD - KEEP_TAIL;
        let tail: String = self.tail.iter().skip(self.tail.len() - KEEP_TAIL).collect();
        format!("{}\n...(skipped {} characters)...\n{}", self.head, skipped, tail)
    }
}

const RULE: &str = "*************************************************";

/// Human-readable report of one local execution
pub fn log_report(
    result: &str,
    stdout: Option<&str>,
    stderr: Option<&str>,
    execution_time: Option<f64>,
) -> String {
    let mut report = format!("{RULE}\n* Result\n{RULE}\n{}\n", truncate_middle(result));
    if let Some(stdout) = stdout {
        report.push_str(&format!(
            "{RULE}\n* Standard output\n{RULE}\n{}\n",
            truncate_middle(stdout)
        ));
    }
    if let Some(stderr) = stderr {
        report.push_str(&format!(
            "{RULE}\n* Standard error\n{RULE}\n{}\n",
            truncate_middle(stderr)
        ));
    }
    if let Some(seconds) = execution_time {
        report.push_str(&format!("{RULE}\nExecution time: {:.1} seconds\n", seconds));
    }
    report.push_str(RULE);
    report
}
