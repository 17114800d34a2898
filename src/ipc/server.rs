//! Control socket server
//!
//! Listens on a Unix domain socket. Each connection sends framed requests
//! and gets one framed response per request. Requests are forwarded to the
//! daemon over a channel and answered from there; `Ping` is answered here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::messages::*;

/// How long a connection waits for the daemon to answer
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request from client with response channel
pub struct IpcRequest {
    /// The request message
    pub message: IpcMessage,
    /// Channel to send response back
    pub response_tx: oneshot::Sender<IpcMessage>,
}

pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            shutdown_tx: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and start accepting connections
    pub async fn start(&mut self, request_tx: mpsc::Sender<IpcRequest>) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Remove a socket left by an unclean exit
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Control socket listening on {:?}", self.socket_path);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            let mut client_id_counter: u64 = 0;

            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                client_id_counter += 1;
                                let id = client_id_counter;
                                let req_tx = request_tx.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(id, stream, req_tx).await {
                                        debug!("Client {} disconnected: {}", id, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Control socket shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting connections and remove the socket
    pub async fn stop(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(()).await;
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
    }
}

async fn handle_client(
    id: u64,
    mut stream: UnixStream,
    request_tx: mpsc::Sender<IpcRequest>,
) -> anyhow::Result<()> {
    debug!("Client {} connected", id);

    loop {
        let msg = match read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Client {} read ended: {}", id, e);
                break;
            }
        };

        let response = match msg {
            IpcMessage::Ping => IpcMessage::Pong,
            msg if msg.is_request() => forward(msg, &request_tx).await,
            other => IpcMessage::Error(ErrorResponse::new(
                "BAD_REQUEST",
                format!("{:?} is not a request", other),
            )),
        };

        send_message(&mut stream, &response).await?;
    }

    debug!("Client {} disconnected", id);
    Ok(())
}

/// Hand a request to the daemon and wait for its answer
async fn forward(message: IpcMessage, request_tx: &mpsc::Sender<IpcRequest>) -> IpcMessage {
    let (response_tx, response_rx) = oneshot::channel();
    let request = IpcRequest {
        message,
        response_tx,
    };

    if request_tx.send(request).await.is_err() {
        return IpcMessage::Error(ErrorResponse::new(
            "UNAVAILABLE",
            "Request handler not available",
        ));
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, response_rx).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => IpcMessage::Error(ErrorResponse::new(
            "INTERNAL_ERROR",
            "Request handler closed",
        )),
        Err(_) => IpcMessage::Error(ErrorResponse::new("TIMEOUT", "Request timed out")),
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
