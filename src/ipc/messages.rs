//! Control protocol messages
//!
//! Wire format: [4 bytes: length (big-endian)][JSON payload]

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::models::{BanRecord, DaemonStatus, ReloadReport};

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Message envelope with type discrimination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcMessage {
    /// Liveness check
    Ping,
    Pong,

    /// Request: daemon and per-jail status
    Status,
    StatusResponse(DaemonStatus),

    /// Request: active bans, optionally for one jail
    ListBans(ListBansRequest),
    BansResponse(BansResponse),

    /// Request: ban an address in a jail
    Ban(BanRequest),
    BanResponse(BanRecord),

    /// Request: lift a ban in one jail or all of them
    Unban(UnbanRequest),
    UnbanResponse(UnbanResponse),

    /// Request: re-read the configuration file
    Reload,
    ReloadResponse(ReloadReport),

    /// Request: graceful shutdown
    Stop,
    Stopping,

    /// Error response
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBansRequest {
    #[serde(default)]
    pub jail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BansResponse {
    pub bans: Vec<BanRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRequest {
    pub jail: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbanRequest {
    /// All jails holding the address when unset
    #[serde(default)]
    pub jail: Option<String>,
    pub ip: IpAddr,
    /// Also drop the ban history used for escalation
    #[serde(default)]
    pub forget: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbanResponse {
    pub ip: IpAddr,
    /// Jails the address was unbanned from
    pub jails: Vec<String>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl IpcMessage {
    /// Serialize to wire format: [4-byte length][JSON]
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut wire = Vec::with_capacity(4 + json.len());
        wire.extend_from_slice(&len.to_be_bytes());
        wire.extend(json);
        Ok(wire)
    }

    /// Deserialize from JSON bytes (without length prefix)
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Whether this message is a request the daemon must answer
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            IpcMessage::Ping
                | IpcMessage::Status
                | IpcMessage::ListBans(_)
                | IpcMessage::Ban(_)
                | IpcMessage::Unban(_)
                | IpcMessage::Reload
                | IpcMessage::Stop
        )
    }
}

/// Read one framed message
pub async fn read_message<R>(stream: &mut R) -> anyhow::Result<IpcMessage>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(anyhow::anyhow!("Message too large: {} bytes", len));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    Ok(IpcMessage::from_json(&buf)?)
}

/// Write one framed message
pub async fn send_message<W>(stream: &mut W, msg: &IpcMessage) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = msg.to_wire()?;
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}
