//! Sidecar Tunnel Protocol
//!
//! Each overlay tunnel stream opens with one length-prefixed bincode request
//! naming the target port, answered by one response. After an accepted
//! response the stream carries raw relay bytes.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SidecarError};

/// Protocol identifier for tunnel streams
pub const TUNNEL_PROTOCOL_ID: &str = "/sidecar/tunnel/1.0.0";

/// Current handshake version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest handshake frame accepted
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Request to reach a port on the remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub version: u32,

    /// Target port in the remote node's namespace
    pub port: u16,
}

impl TunnelRequest {
    pub fn new(port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            port,
        }
    }
}

/// Response to a tunnel request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    /// Whether the tunnel was accepted
    pub accepted: bool,

    /// Rejection reason if not accepted
    pub reason: Option<String>,
}

impl TunnelResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Send a serializable message with a u32 big-endian length prefix
pub async fn write_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(SidecarError::StreamError("Frame too large".to_string()));
    }
    let len = bytes.len() as u32;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| SidecarError::StreamError(format!("Failed to write length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| SidecarError::StreamError(format!("Failed to write frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| SidecarError::StreamError(format!("Failed to flush frame: {}", e)))?;

    Ok(())
}

/// Receive a message written by [`write_frame`]
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| SidecarError::StreamError(format!("Failed to read length: {}", e)))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SidecarError::StreamError("Frame too large".to_string()));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| SidecarError::StreamError(format!("Failed to read frame: {}", e)))?;

    bincode::deserialize(&buf)
        .map_err(|e| SidecarError::Serialization(format!("Failed to deserialize: {}", e)))
}
