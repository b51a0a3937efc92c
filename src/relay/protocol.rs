//! # Protocol Adapter
//!
//! Translates between the relay's internal values and a provider's wire format:
//! the session-start handshake, the audio envelope, the terminate message and
//! the transcript event shape.
//!
//! ## Variants:
//! - [`ProtocolVariant::Realtime`]: AssemblyAI v2 realtime
//!   (`{"audio_data": ...}`, `message_type` / `text` events)
//! - [`ProtocolVariant::Streaming`]: AssemblyAI v3 streaming
//!   (`{"type": "Audio", ...}`, `Turn` events with `end_of_turn`)
//!
//! The variant is chosen once when a session is created. Everything outside this
//! module talks to a `dyn ProtocolAdapter` and never branches on the variant.

use crate::error::{RelayError, RelayResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Encoding name declared to the provider. The transcoder always produces it.
const PCM_ENCODING: &str = "pcm_s16le";

/// Bytes per sample for 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A transcript ready to be relayed to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// PCM format the provider requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Size of one sample frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels.max(1) as usize
    }
}

/// Provider protocol selection, read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Realtime,
    Streaming,
}

impl ProtocolVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVariant::Realtime => "realtime",
            ProtocolVariant::Streaming => "streaming",
        }
    }

    /// Endpoint used when the configuration does not override it.
    pub fn default_url(&self) -> &'static str {
        match self {
            ProtocolVariant::Realtime => "wss://api.assemblyai.com/v2/realtime/ws",
            ProtocolVariant::Streaming => "wss://streaming.assemblyai.com/v3/ws",
        }
    }

    /// Build the adapter for this variant.
    pub fn adapter(&self, format: AudioFormat) -> Box<dyn ProtocolAdapter> {
        match self {
            ProtocolVariant::Realtime => Box::new(RealtimeAdapter { format }),
            ProtocolVariant::Streaming => Box::new(StreamingAdapter { format }),
        }
    }
}

/// Provider wire protocol.
///
/// ## Contract:
/// - `build_handshake` is sent exactly once, first, on a fresh upstream link
/// - `encode_audio` is pure and only fails on a bad frame size
/// - `build_terminate` is sent at most once, last
/// - `parse_event` returns `Ok(None)` for messages with nothing to show,
///   `Err(RelayError::Provider)` for provider faults and
///   `Err(RelayError::MalformedEvent)` for things it cannot decode
pub trait ProtocolAdapter: Send + Sync {
    fn variant(&self) -> ProtocolVariant;

    /// Full upstream URL, including the query parameters the provider reads.
    fn endpoint(&self, base_url: &str) -> String;

    fn build_handshake(&self) -> String;

    fn encode_audio(&self, pcm: &[u8]) -> RelayResult<String>;

    fn build_terminate(&self) -> String;

    fn parse_event(&self, raw: &str) -> RelayResult<Option<TranscriptEvent>>;
}

/// Shared PCM validation and base64 step for both envelopes.
fn encode_pcm(pcm: &[u8]) -> RelayResult<String> {
    if pcm.is_empty() {
        return Err(RelayError::Encoding("audio frame is empty".to_string()));
    }

    if pcm.len() % BYTES_PER_SAMPLE != 0 {
        return Err(RelayError::Encoding(format!(
            "audio frame of {} bytes is not aligned to 16-bit samples",
            pcm.len()
        )));
    }

    Ok(BASE64.encode(pcm))
}

/// Parse a provider message far enough to look for a fault.
fn parse_raw(raw: &str) -> RelayResult<Value> {
    serde_json::from_str(raw).map_err(|e| RelayError::MalformedEvent(e.to_string()))
}

/// Detail of an `error` field of any shape; `None` when absent or null.
fn error_detail(message: &Value) -> Option<String> {
    match message.get("error")? {
        Value::Null => None,
        Value::String(detail) => Some(detail.clone()),
        other => Some(other.to_string()),
    }
}

fn with_query(base_url: &str, format: &AudioFormat, extra: &str) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}sample_rate={}&encoding={}{}",
        base_url, separator, format.sample_rate, PCM_ENCODING, extra
    )
}

/// AssemblyAI v2 realtime.
pub struct RealtimeAdapter {
    format: AudioFormat,
}

#[derive(Debug, Deserialize)]
struct RealtimeMessage {
    message_type: Option<String>,
    text: Option<String>,
}

impl ProtocolAdapter for RealtimeAdapter {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Realtime
    }

    fn endpoint(&self, base_url: &str) -> String {
        with_query(base_url, &self.format, "")
    }

    fn build_handshake(&self) -> String {
        json!({
            "sample_rate": self.format.sample_rate,
            "encoding": PCM_ENCODING,
            "channels": self.format.channels,
        })
        .to_string()
    }

    fn encode_audio(&self, pcm: &[u8]) -> RelayResult<String> {
        let audio = encode_pcm(pcm)?;
        Ok(json!({ "audio_data": audio }).to_string())
    }

    fn build_terminate(&self) -> String {
        json!({ "terminate_session": true }).to_string()
    }

    fn parse_event(&self, raw: &str) -> RelayResult<Option<TranscriptEvent>> {
        let value = parse_raw(raw)?;
        if let Some(detail) = error_detail(&value) {
            return Err(RelayError::Provider(detail));
        }

        let message: RealtimeMessage =
            serde_json::from_value(value).map_err(|e| RelayError::MalformedEvent(e.to_string()))?;

        let text = match message.text {
            Some(text) if !text.is_empty() => text,
            _ => return Ok(None), // SessionBegins, SessionTerminated, silence
        };

        Ok(Some(TranscriptEvent {
            text,
            is_final: message.message_type.as_deref() == Some("FinalTranscript"),
        }))
    }
}

/// AssemblyAI v3 streaming.
pub struct StreamingAdapter {
    format: AudioFormat,
}

#[derive(Debug, Deserialize)]
struct StreamingMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    transcript: Option<String>,
    end_of_turn: Option<bool>,
}

impl ProtocolAdapter for StreamingAdapter {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Streaming
    }

    fn endpoint(&self, base_url: &str) -> String {
        with_query(base_url, &self.format, "&format_turns=true")
    }

    fn build_handshake(&self) -> String {
        json!({
            "type": "SessionConfiguration",
            "sample_rate": self.format.sample_rate,
            "encoding": PCM_ENCODING,
            "channels": self.format.channels,
            "format_turns": true,
        })
        .to_string()
    }

    fn encode_audio(&self, pcm: &[u8]) -> RelayResult<String> {
        let audio = encode_pcm(pcm)?;
        Ok(json!({ "type": "Audio", "audio": audio }).to_string())
    }

    fn build_terminate(&self) -> String {
        json!({ "type": "Terminate" }).to_string()
    }

    fn parse_event(&self, raw: &str) -> RelayResult<Option<TranscriptEvent>> {
        let value = parse_raw(raw)?;
        let flagged = value.get("type").and_then(Value::as_str) == Some("Error");
        match error_detail(&value) {
            Some(detail) => return Err(RelayError::Provider(detail)),
            None if flagged => {
                return Err(RelayError::Provider("provider reported an error".to_string()))
            }
            None => {}
        }

        let message: StreamingMessage =
            serde_json::from_value(value).map_err(|e| RelayError::MalformedEvent(e.to_string()))?;

        if message.kind.as_deref() != Some("Turn") {
            return Ok(None); // Begin, Termination
        }

        match message.transcript {
            Some(text) if !text.is_empty() => Ok(Some(TranscriptEvent {
                text,
                is_final: message.end_of_turn.unwrap_or(false),
            })),
            _ => Ok(None),
        }
    }
}
