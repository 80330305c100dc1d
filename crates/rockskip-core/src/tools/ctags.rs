use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rockskip_indexer::{ParsedSymbol, SymbolParser};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::common::{ChildGuard, spawn_piped};

/// Symbol parser backed by a pool of long-lived universal-ctags processes in
/// interactive mode, one per slot. A request takes an idle slot when there
/// is one and otherwise queues on the next slot in turn. A failed or
/// timed-out request discards that slot's process and the next request on
/// the slot starts a fresh one.
pub struct CtagsParser {
    command: String,
    timeout: Duration,
    slots: Vec<Mutex<Option<CtagsProcess>>>,
    next: AtomicUsize,
}

impl CtagsParser {
    pub fn new(command: impl Into<String>, timeout: Duration, processes: usize) -> Self {
        Self {
            command: command.into(),
            timeout,
            slots: (0..processes.max(1)).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn processes(&self) -> usize {
        self.slots.len()
    }

    async fn slot(&self) -> MutexGuard<'_, Option<CtagsProcess>> {
        for slot in &self.slots {
            if let Ok(guard) = slot.try_lock() {
                return guard;
            }
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[index].lock().await
    }
}

#[async_trait]
impl SymbolParser for CtagsParser {
    async fn parse(&self, path: &str, content: &[u8]) -> Result<Vec<ParsedSymbol>> {
        let mut process = self.slot().await;
        if process.is_none() {
            *process = Some(
                timeout(self.timeout, CtagsProcess::spawn(&self.command))
                    .await
                    .with_context(|| "ctags startup timed out")??,
            );
        }
        let Some(running) = process.as_mut() else {
            bail!("ctags process unavailable");
        };

        match timeout(self.timeout, running.generate(path, content)).await {
            Ok(Ok(symbols)) => Ok(symbols),
            Ok(Err(err)) => {
                *process = None;
                Err(err)
            }
            Err(_) => {
                *process = None;
                bail!("ctags timed out parsing {path}")
            }
        }
    }
}

struct CtagsProcess {
    _guard: ChildGuard,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl CtagsProcess {
    async fn spawn(command: &str) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(["--_interactive=default", "--fields=*", "--extras=-F"]);
        let mut guard = spawn_piped(&mut cmd, command, true)?;
        let stdin = guard.stdin()?;
        let mut lines = BufReader::new(guard.stdout()?).lines();

        let banner = lines
            .next_line()
            .await?
            .context("ctags exited before announcing itself")?;
        match serde_json::from_str::<CtagsMessage>(&banner) {
            Ok(CtagsMessage::Program { name, version }) => {
                info!(%name, %version, "started ctags");
            }
            _ => bail!("unexpected ctags banner: {banner}"),
        }

        Ok(Self {
            _guard: guard,
            stdin,
            lines,
        })
    }

    async fn generate(&mut self, path: &str, content: &[u8]) -> Result<Vec<ParsedSymbol>> {
        let request = serde_json::to_string(&GenerateTags {
            command: "generate-tags",
            filename: path,
            size: content.len(),
        })?;
        self.stdin.write_all(request.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.write_all(content).await?;
        self.stdin.flush().await?;

        let mut symbols = Vec::new();
        loop {
            let line = self
                .lines
                .next_line()
                .await?
                .context("ctags exited mid-request")?;
            let parsed: CtagsMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "failed to parse ctags json line");
                    continue;
                }
            };
            match parsed {
                CtagsMessage::Tag(tag) => symbols.push(tag.into()),
                CtagsMessage::Completed => return Ok(symbols),
                CtagsMessage::Error { message } => bail!("ctags failed on {path}: {message}"),
                CtagsMessage::Program { .. } | CtagsMessage::Other => {
                    debug!(line = %line, "ignoring ctags message");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct GenerateTags<'a> {
    command: &'static str,
    filename: &'a str,
    size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
enum CtagsMessage {
    Program {
        #[serde(default)]
        name: String,
        #[serde(default)]
        version: String,
    },
    Tag(CtagsTag),
    Completed,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CtagsTag {
    name: String,
    #[serde(default)]
    line: usize,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    scope: String,
    #[serde(default, rename = "scopeKind")]
    scope_kind: String,
}

impl From<CtagsTag> for ParsedSymbol {
    fn from(tag: CtagsTag) -> Self {
        ParsedSymbol {
            name: tag.name,
            parent: tag.scope,
            kind: tag.kind,
            line: tag.line,
            language: tag.language,
            parent_kind: tag.scope_kind,
        }
    }
}
