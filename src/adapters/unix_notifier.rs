//! Out-of-band Notifier
//!
//! Implements [`CompletionNotifier`] over the backend server's Unix stream
//! socket: one connection per notification, carrying the completion token.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

use crate::domain::ports::{CompletionNotifier, InsertCompletion};
use crate::error::Result;

/// Sends `INSERT_OK` or `INSERT_FAIL` to the backend server.
#[derive(Debug, Clone)]
pub struct UnixNotifier {
    path: PathBuf,
}

impl UnixNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CompletionNotifier for UnixNotifier {
    async fn notify_insert(&self, completion: InsertCompletion) -> Result<()> {
        let mut stream = UnixStream::connect(&self.path).await?;
        stream.write_all(completion.token()).await?;
        stream.shutdown().await?;
        debug!("Sent {:?} completion to {}", completion, self.path.display());
        Ok(())
    }
}
