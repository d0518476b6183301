//! Decode command implementation.

use clap::ValueEnum;
use serde_json::Value;
use std::path::Path;
use tillsync_protocol::{from_cbor, ClientMessage, ServerMessage, SyncRequest, SyncResponse};

/// Kind of encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MessageKind {
    /// Device request.
    Request,
    /// Server response.
    Response,
    /// Real-time frame from a device.
    Client,
    /// Real-time frame from the server.
    Server,
}

/// Decodes a CBOR message into its JSON form.
pub fn decode(bytes: &[u8], kind: MessageKind) -> Result<Value, Box<dyn std::error::Error>> {
    let value = match kind {
        MessageKind::Request => serde_json::to_value(from_cbor::<SyncRequest>(bytes)?)?,
        MessageKind::Response => serde_json::to_value(from_cbor::<SyncResponse>(bytes)?)?,
        MessageKind::Client => serde_json::to_value(from_cbor::<ClientMessage>(bytes)?)?,
        MessageKind::Server => serde_json::to_value(from_cbor::<ServerMessage>(bytes)?)?,
    };
    Ok(value)
}

/// Runs the decode command.
pub fn run(input: &Path, kind: MessageKind, is_hex: bool) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read(input)?;
    let bytes = if is_hex {
        let text = String::from_utf8(raw)?;
        hex::decode(text.trim())?
    } else {
        raw
    };

    let value = decode(&bytes, kind)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
