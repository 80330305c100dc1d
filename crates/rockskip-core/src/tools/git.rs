use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use rockskip_indexer::{ArchiveFile, ChangeStatus, Git, GitStream, LogEntry, PathStatus};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::common::{channel_stream, plain_argument, spawn_piped};

const STREAM_CAPACITY: usize = 64;

/// `git` CLI over a directory holding one clone per repository, at
/// `<repos_dir>/<repo>`.
#[derive(Clone, Debug)]
pub struct GitCli {
    repos_dir: PathBuf,
}

impl GitCli {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }

    fn repo_dir(&self, repo: &str) -> Result<PathBuf> {
        let relative = Path::new(repo);
        let plain = !repo.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            bail!("invalid repository name: {repo:?}");
        }
        Ok(self.repos_dir.join(relative))
    }

    fn command(dir: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(dir).env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }
}

impl Git for GitCli {
    fn rev_list(&self, repo: &str, commit: &str) -> GitStream<String> {
        let dir = self.repo_dir(repo);
        let commit = commit.to_string();
        channel_stream(STREAM_CAPACITY, move |tx| async move {
            let dir = dir?;
            let commit = plain_argument(&commit, "commit")?;
            let mut cmd = Self::command(&dir);
            cmd.args(["rev-list", "--first-parent", commit, "--"]);
            let mut guard = spawn_piped(&mut cmd, "git rev-list", false)?;
            let mut lines = BufReader::new(guard.stdout()?).lines();
            while let Some(line) = lines.next_line().await? {
                let hash = line.trim();
                if hash.is_empty() {
                    continue;
                }
                if tx.send(Ok(hash.to_string())).await.is_err() {
                    // Consumer stopped early; the guard kills git.
                    return Ok(());
                }
            }
            guard.finish("git rev-list").await
        })
    }

    fn log_reverse(&self, repo: &str, commit: &str, n: usize) -> GitStream<LogEntry> {
        let dir = self.repo_dir(repo);
        let commit = commit.to_string();
        channel_stream(STREAM_CAPACITY, move |tx| async move {
            let dir = dir?;
            let commit = plain_argument(&commit, "commit")?;
            let mut cmd = Self::command(&dir);
            cmd.args([
                "log",
                "--first-parent",
                "-m",
                "--no-renames",
                "--ignore-submodules",
                "--reverse",
                "--name-status",
                "-z",
                "--format=format:%x01%H",
            ])
            .arg("-n")
            .arg(n.to_string())
            .args([commit, "--"]);
            let mut guard = spawn_piped(&mut cmd, "git log", false)?;
            let mut tokens = BufReader::new(guard.stdout()?).split(b'\0');
            let mut parser = LogParser::default();
            while let Some(token) = tokens.next_segment().await? {
                for entry in parser.push_token(&String::from_utf8_lossy(&token)) {
                    if tx.send(Ok(entry)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            guard.finish("git log").await?;
            if let Some(entry) = parser.finish() {
                let _ = tx.send(Ok(entry)).await;
            }
            Ok(())
        })
    }

    fn archive(&self, repo: &str, commit: &str, paths: Vec<String>) -> GitStream<ArchiveFile> {
        let dir = self.repo_dir(repo);
        let commit = commit.to_string();
        channel_stream(STREAM_CAPACITY, move |tx| async move {
            let dir = dir?;
            let commit = plain_argument(&commit, "commit")?.to_string();
            // cat-file reads one object name per line.
            let paths: Vec<String> = paths
                .into_iter()
                .filter(|path| !path.contains('\n'))
                .collect();
            if paths.is_empty() {
                return Ok(());
            }

            let mut cmd = Self::command(&dir);
            cmd.args(["cat-file", "--batch"]);
            let mut guard = spawn_piped(&mut cmd, "git cat-file", true)?;
            let mut stdin = guard.stdin()?;
            let requests: Vec<String> = paths
                .iter()
                .map(|path| format!("{commit}:{path}\n"))
                .collect();
            let writer = tokio::spawn(async move {
                for request in &requests {
                    stdin.write_all(request.as_bytes()).await?;
                }
                stdin.shutdown().await
            });

            let mut reader = BufReader::new(guard.stdout()?);
            for path in paths {
                let mut header = String::new();
                if reader.read_line(&mut header).await? == 0 {
                    bail!("git cat-file ended before {path}");
                }
                let Some(object) = ObjectHeader::parse(header.trim_end()) else {
                    debug!(%path, header = header.trim_end(), "object not available, skipping");
                    continue;
                };
                let mut content = vec![0; object.size];
                reader.read_exact(&mut content).await?;
                let mut newline = [0u8; 1];
                reader.read_exact(&mut newline).await?;
                if object.kind != "blob" {
                    continue;
                }
                if tx.send(Ok(ArchiveFile { path, content })).await.is_err() {
                    return Ok(());
                }
            }

            writer
                .await
                .context("cat-file writer panicked")?
                .context("failed to write cat-file requests")?;
            guard.finish("git cat-file").await
        })
    }
}

/// Accumulates `git log -z --name-status --format=format:%x01%H` output
/// split on NUL. SOH opens a commit, possibly glued to the newlines and
/// first status that follow it; every status token is followed by a token
/// holding the path verbatim.
#[derive(Default)]
struct LogParser {
    current: Option<LogEntry>,
    /// Set after a status token: the next token is its path. `Some(None)`
    /// skips the path of a status we do not track.
    pending: Option<Option<ChangeStatus>>,
}

impl LogParser {
    /// Feed one token; returns the commits that it closed.
    fn push_token(&mut self, token: &str) -> Vec<LogEntry> {
        if let Some(status) = self.pending.take() {
            if let (Some(entry), Some(status)) = (self.current.as_mut(), status) {
                if !token.is_empty() {
                    entry.path_statuses.push(PathStatus {
                        path: token.to_string(),
                        status,
                    });
                }
            }
            return Vec::new();
        }

        let mut finished = Vec::new();
        let mut rest = token.trim_matches('\n');
        while let Some(start) = rest.find('\x01') {
            let header = &rest[start + 1..];
            let end = header.find(|c| c == '\n' || c == '\x01').unwrap_or(header.len());
            finished.extend(self.current.replace(LogEntry {
                commit: header[..end].trim().to_string(),
                path_statuses: Vec::new(),
            }));
            rest = header[end..].trim_start_matches('\n');
        }
        if !rest.is_empty() {
            self.pending = Some(parse_status(rest));
        }
        finished
    }

    fn finish(self) -> Option<LogEntry> {
        self.current
    }
}

/// `A`, `M`, `T` or `D`. Type changes count as modifications; anything else
/// is skipped.
fn parse_status(status: &str) -> Option<ChangeStatus> {
    match status.chars().next()? {
        'A' => Some(ChangeStatus::Added),
        'M' | 'T' => Some(ChangeStatus::Modified),
        'D' => Some(ChangeStatus::Deleted),
        _ => None,
    }
}

struct ObjectHeader<'a> {
    kind: &'a str,
    size: usize,
}

impl<'a> ObjectHeader<'a> {
    /// `<sha> <type> <size>`; `<name> missing` and friends yield `None`.
    fn parse(header: &'a str) -> Option<Self> {
        let mut parts = header.split(' ');
        let _sha = parts.next()?;
        let kind = parts.next()?;
        let size = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { kind, size })
    }
}
