//! Out-of-band channel from the controller.
//!
//! A Unix stream socket at a fixed path. Each connection carries one
//! completion token; every valid token is forwarded to the datagram task.
//! A connection that does not deliver its token within the read timeout is
//! dropped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ports::InsertCompletion;
use crate::error::{Error, Result};

/// Longest message accepted on the channel
const MAX_TOKEN_LEN: u64 = 64;

/// Default longest wait for a connected peer to deliver its token
pub const DEFAULT_TOKEN_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound Unix listener for completion tokens.
#[derive(Debug)]
pub struct OobListener {
    listener: UnixListener,
    path: PathBuf,
    read_timeout: Duration,
}

impl OobListener {
    /// Bind at `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot unlink {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self {
            listener,
            path,
            read_timeout: DEFAULT_TOKEN_READ_TIMEOUT,
        })
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `cancel` fires, forwarding one completion per
    /// valid token.
    pub async fn run(
        self,
        completions: mpsc::Sender<InsertCompletion>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("Out-of-band channel listening on {}", self.path.display());

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Out-of-band accept failed: {}", e);
                        continue;
                    }
                },
            };

            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::time::timeout(self.read_timeout, read_token(stream)) => read,
            };
            match read {
                Ok(Ok(Some(completion))) => {
                    if completions.send(completion).await.is_err() {
                        break;
                    }
                }
                Ok(Ok(None)) => warn!("Ignoring unknown out-of-band message"),
                Ok(Err(e)) => warn!("Out-of-band read failed: {}", e),
                Err(_) => warn!(
                    "Out-of-band peer sent no token within {}ms, dropping it",
                    self.read_timeout.as_millis()
                ),
            }
        }

        Ok(())
    }
}

async fn read_token<R: AsyncRead + Unpin>(stream: R) -> Result<Option<InsertCompletion>> {
    let mut buf = Vec::new();
    stream.take(MAX_TOKEN_LEN).read_to_end(&mut buf).await?;
    Ok(InsertCompletion::from_token(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::UnixNotifier;
    use crate::domain::ports::CompletionNotifier;
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!("netcache-oob-{}.s", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_tokens_are_forwarded() {
        let path = socket_path();
        std::fs::write(&path, b"stale").unwrap();

        let listener = OobListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(tx, cancel.clone()));

        let mut bogus = UnixStream::connect(&path).await.unwrap();
        bogus.write_all(b"HELLO").await.unwrap();
        drop(bogus);

        let notifier = UnixNotifier::new(&path);
        notifier.notify_insert(InsertCompletion::Inserted).await.unwrap();
        notifier.notify_insert(InsertCompletion::Failed).await.unwrap();
        assert_eq!(rx.recv().await, Some(InsertCompletion::Inserted));
        assert_eq!(rx.recv().await, Some(InsertCompletion::Failed));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_read_token() {
        let split = tokio_test::io::Builder::new()
            .read(b"INSERT")
            .read(b"_OK\n")
            .build();
        assert_eq!(read_token(split).await.unwrap(), Some(InsertCompletion::Inserted));

        let failed = tokio_test::io::Builder::new().read(b"INSERT_FAIL").build();
        assert_eq!(read_token(failed).await.unwrap(), Some(InsertCompletion::Failed));

        let other = tokio_test::io::Builder::new().read(b"HELLO").build();
        assert_eq!(read_token(other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_block_later_tokens() {
        let path = socket_path();
        let listener = OobListener::bind(&path)
            .unwrap()
            .with_read_timeout(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(tx, cancel.clone()));

        // Connects and never writes nor closes
        let _silent = UnixStream::connect(&path).await.unwrap();

        let started = Instant::now();
        UnixNotifier::new(&path)
            .notify_insert(InsertCompletion::Inserted)
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(InsertCompletion::Inserted));
        assert!(started.elapsed() < Duration::from_secs(1));

        cancel.cancel();
        task.await.unwrap().unwrap();
        std::fs::remove_file(&path).unwrap();
    }
}
