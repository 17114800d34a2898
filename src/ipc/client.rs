//! Control socket client, used by the CLI

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::messages::*;

pub struct IpcClient {
    socket_path: PathBuf,
    stream: UnixStream,
}

impl IpcClient {
    /// Connect to the daemon
    pub async fn connect(socket_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        debug!("Connecting to control socket at {}", socket_path.display());

        let stream = UnixStream::connect(&socket_path)
            .await
            .with_context(|| format!("Cannot connect to daemon at {}", socket_path.display()))?;

        Ok(Self {
            socket_path,
            stream,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, msg: &IpcMessage) -> anyhow::Result<IpcMessage> {
        send_message(&mut self.stream, msg).await?;
        read_message(&mut self.stream).await
    }

    /// Like [`request`](Self::request), turning an `Error` response into `Err`
    pub async fn call(&mut self, msg: &IpcMessage) -> anyhow::Result<IpcMessage> {
        match self.request(msg).await? {
            IpcMessage::Error(e) => Err(anyhow::anyhow!("{} ({})", e.message, e.code)),
            other => Ok(other),
        }
    }
}

/// Convenience function to connect with retry
pub async fn connect_with_retry(
    socket_path: impl AsRef<Path>,
    max_retries: u32,
    retry_delay: Duration,
) -> anyhow::Result<IpcClient> {
    let mut retries = 0;

    loop {
        match IpcClient::connect(socket_path.as_ref()).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                retries += 1;
                if retries >= max_retries {
                    return Err(e.context(format!("Failed to connect after {} retries", max_retries)));
                }
                warn!(
                    "Failed to connect to control socket (attempt {}/{}): {}",
                    retries, max_retries, e
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
