//! # Client Message Router
//!
//! Decodes browser frames into [`ClientFrame`] values and encodes transcript
//! events for the trip back.
//!
//! ## Wire Format:
//! - **Client → Server**: `{"type":"audio","chunk":"<base64>"}` or `{"type":"end"}`
//! - **Server → Client**: `{"text":"...","isFinal":true}`
//!
//! A frame that does not parse is reported to the caller as
//! `RelayError::ClientFrame`; the caller logs it and keeps the session going.

use crate::error::{RelayError, RelayResult};
use crate::relay::protocol::TranscriptEvent;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Audio bytes in arrival order. Moved, never cloned, on the way upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk(pub Vec<u8>);

impl AudioChunk {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// A decoded inbound client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Audio(AudioChunk),
    End,
    /// Valid JSON with a `type` we do not handle
    Unrecognized,
}

/// Shape of the JSON frames as they arrive on the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireFrame {
    Audio { chunk: String },
    End,
    #[serde(other)]
    Other,
}

/// Outbound message shape expected by the browser.
#[derive(Debug, Serialize)]
struct WireTranscript<'a> {
    text: &'a str,
    #[serde(rename = "isFinal")]
    is_final: bool,
}

/// Parse one text frame from the browser.
///
/// Audio payloads are base64-decoded here, so everything downstream only sees
/// raw bytes. An empty chunk is rejected as a malformed frame.
pub fn parse_inbound(raw: &str) -> RelayResult<ClientFrame> {
    let frame: WireFrame =
        serde_json::from_str(raw).map_err(|e| RelayError::ClientFrame(e.to_string()))?;

    match frame {
        WireFrame::Audio { chunk } => {
            let bytes = BASE64
                .decode(chunk.trim())
                .map_err(|e| RelayError::ClientFrame(format!("chunk is not valid base64: {}", e)))?;

            if bytes.is_empty() {
                return Err(RelayError::ClientFrame("audio chunk is empty".to_string()));
            }

            Ok(ClientFrame::Audio(AudioChunk(bytes)))
        }
        WireFrame::End => Ok(ClientFrame::End),
        WireFrame::Other => Ok(ClientFrame::Unrecognized),
    }
}

/// A binary socket frame is already raw audio.
pub fn parse_binary(bytes: Vec<u8>) -> RelayResult<ClientFrame> {
    if bytes.is_empty() {
        return Err(RelayError::ClientFrame("binary audio frame is empty".to_string()));
    }
    Ok(ClientFrame::Audio(AudioChunk(bytes)))
}

/// Encode a transcript for the browser.
pub fn serialize_outbound(event: &TranscriptEvent) -> String {
    let wire = WireTranscript {
        text: &event.text,
        is_final: event.is_final,
    };
    // A struct of a &str and a bool always serializes.
    serde_json::to_string(&wire).unwrap_or_default()
}
