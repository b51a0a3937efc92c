//! # Upstream Link
//!
//! The provider connection as the session sees it: a sink of outgoing text
//! messages and a stream of incoming ones. [`UpstreamConnector`] opens one;
//! [`WsConnector`] does it over `tokio-tungstenite`.
//!
//! ## Stream Semantics:
//! - `Some(Ok(text))`: a provider message for the protocol adapter
//! - `Some(Err(RelayError::MalformedEvent))`: a frame we could not use (transient)
//! - `Some(Err(RelayError::Upstream))`: the link failed
//! - `None`: the provider closed the link

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

pub type UpstreamSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;
pub type UpstreamStream = Pin<Box<dyn Stream<Item = RelayResult<String>> + Send>>;

/// An open, exclusively owned provider connection.
pub struct UpstreamLink {
    pub sink: UpstreamSink,
    pub stream: UpstreamStream,
}

/// Opens provider connections.
///
/// Shared by every session through the application state; each call returns a
/// link owned by the calling session alone.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, endpoint: &str, api_key: &str) -> RelayResult<UpstreamLink>;
}

/// Connects to the provider over a real WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self, endpoint: &str, api_key: &str) -> RelayResult<UpstreamLink> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| RelayError::UpstreamConnect(format!("invalid endpoint: {}", e)))?;

        let credential = HeaderValue::from_str(api_key)
            .map_err(|e| RelayError::UpstreamConnect(format!("invalid credential: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, credential);

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
        debug!(status = %response.status(), "upstream websocket handshake completed");

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| RelayError::Upstream(e.to_string()))
            .with(|text: String| std::future::ready(Ok::<_, RelayError>(Message::Text(text))));

        let stream = stream.filter_map(|frame| std::future::ready(classify_frame(frame)));

        Ok(UpstreamLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Map a raw WebSocket frame onto the link's stream semantics.
fn classify_frame(
    frame: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<RelayResult<String>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(bytes)) => Some(Err(RelayError::MalformedEvent(format!(
            "unexpected {}-byte binary frame",
            bytes.len()
        )))),
        Ok(Message::Close(close)) => {
            debug!(?close, "upstream sent close frame");
            None
        }
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Err(err) => Some(Err(RelayError::Upstream(err.to_string()))),
    }
}
