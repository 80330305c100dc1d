use std::future::Future;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use rockskip_indexer::GitStream;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Guard that ensures a child process is killed when dropped.
/// This prevents orphaned processes when a consumer stops reading early.
pub struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    pub fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// Take ownership of the child, preventing it from being killed on drop.
    pub fn take(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Get a mutable reference to the child process.
    pub fn as_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    pub fn stdout(&mut self) -> Result<ChildStdout> {
        self.as_mut()
            .and_then(|child| child.stdout.take())
            .context("child did not produce a stdout pipe")
    }

    pub fn stdin(&mut self) -> Result<ChildStdin> {
        self.as_mut()
            .and_then(|child| child.stdin.take())
            .context("child did not produce a stdin pipe")
    }

    /// Wait for a normal exit, turning a failure status into an error that
    /// carries the tail of stderr.
    pub async fn finish(&mut self, what: &str) -> Result<()> {
        let Some(mut child) = self.take() else {
            bail!("{what} was already reaped");
        };
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for {what}"))?;
        if !status.success() {
            let stderr = stderr.trim();
            let mut start = stderr.len().saturating_sub(512);
            while !stderr.is_char_boundary(start) {
                start += 1;
            }
            bail!("{what} exited with status {status}: {}", &stderr[start..]);
        }
        Ok(())
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            // Non-blocking; does not wait for the process to exit.
            let _ = child.start_kill();
        }
    }
}

/// Spawn `cmd` with piped stdout and stderr, and optionally a piped stdin.
pub fn spawn_piped(cmd: &mut Command, what: &str, stdin: bool) -> Result<ChildGuard> {
    cmd.stdin(if stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {what}; is it installed and on PATH?"))?;
    Ok(ChildGuard::new(child))
}

/// Run `producer` on its own task and expose what it sends as a stream.
/// A producer error becomes the stream's last item. Dropping the stream
/// closes the channel, which the producer observes as a failed send.
pub fn channel_stream<T, F, Fut>(capacity: usize, producer: F) -> GitStream<T>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<Result<T>>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = producer(tx.clone());
    tokio::spawn(async move {
        if let Err(err) = task.await {
            let _ = tx.send(Err(err)).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Reject values that a command would parse as an option.
pub fn plain_argument<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.is_empty() || value.starts_with('-') {
        bail!("invalid {what}: {value:?}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn producer_errors_end_the_stream() {
        let mut stream = channel_stream(4, |tx| async move {
            tx.send(Ok(1)).await?;
            tx.send(Ok(2)).await?;
            bail!("boom")
        });
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn option_like_arguments_are_rejected() {
        assert!(plain_argument("--upload-pack=evil", "commit").is_err());
        assert!(plain_argument("", "commit").is_err());
        assert_eq!(plain_argument("HEAD", "commit").unwrap(), "HEAD");
    }
}
