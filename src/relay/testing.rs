//! In-process stand-ins for the browser and the provider, shared by the
//! session and lifecycle tests.

use crate::error::{RelayError, RelayResult};
use crate::relay::protocol::{AudioFormat, ProtocolVariant};
use crate::relay::session::{ClientCommand, ClientEvent, ClientLink, SessionSettings};
use crate::relay::transcoder::DecoderCommand;
use crate::relay::upstream::{UpstreamConnector, UpstreamLink};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

enum Behavior {
    Link(Mutex<Option<UpstreamLink>>),
    Refuse,
    Hang,
}

pub(crate) struct FakeConnector {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn linked(link: UpstreamLink) -> Arc<Self> {
        Self::with(Behavior::Link(Mutex::new(Some(link))))
    }

    pub(crate) fn refusing() -> Arc<Self> {
        Self::with(Behavior::Refuse)
    }

    pub(crate) fn hanging() -> Arc<Self> {
        Self::with(Behavior::Hang)
    }

    fn with(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(&self, _endpoint: &str, _api_key: &str) -> RelayResult<UpstreamLink> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Link(link) => {
                let taken = link.lock().unwrap().take();
                taken.ok_or_else(|| RelayError::UpstreamConnect("link already handed out".to_string()))
            }
            Behavior::Refuse => Err(RelayError::UpstreamConnect("connection refused".to_string())),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// A provider link plus the test's ends of it: everything the session sends,
/// and a sender for what the provider says.
pub(crate) fn fake_link() -> (
    UpstreamLink,
    mpsc::UnboundedReceiver<String>,
    mpsc::UnboundedSender<RelayResult<String>>,
) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel::<String>();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let sink = futures_util::sink::unfold(sent_tx, |tx, message: String| async move {
        tx.send(message)
            .map_err(|_| RelayError::Upstream("provider went away".to_string()))?;
        Ok::<_, RelayError>(tx)
    });

    let link = UpstreamLink {
        sink: Box::pin(sink),
        stream: Box::pin(UnboundedReceiverStream::new(events_rx)),
    };
    (link, sent_rx, events_tx)
}

pub(crate) fn client_link() -> (
    ClientLink,
    mpsc::UnboundedSender<ClientEvent>,
    mpsc::Receiver<ClientCommand>,
) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    let link = ClientLink {
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    (link, inbound_tx, outbound_rx)
}

pub(crate) fn settings(decoder: Option<DecoderCommand>) -> SessionSettings {
    SessionSettings {
        base_url: "wss://provider.test/v2/realtime/ws".to_string(),
        api_key: "test-key".to_string(),
        variant: ProtocolVariant::Realtime,
        format: AudioFormat {
            sample_rate: 16_000,
            channels: 1,
        },
        connect_timeout: Duration::from_millis(500),
        drain_grace: Duration::from_millis(500),
        decoder,
    }
}

pub(crate) fn audio_frame(bytes: &[u8]) -> ClientEvent {
    ClientEvent::Text(format!(
        r#"{{"type":"audio","chunk":"{}"}}"#,
        BASE64.encode(bytes)
    ))
}

pub(crate) fn end_frame() -> ClientEvent {
    ClientEvent::Text(r#"{"type":"end"}"#.to_string())
}

/// Everything the session sent upstream, once the session has released the link.
pub(crate) async fn collect_sent(mut sent: mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Some(message) = sent.recv().await {
        messages.push(message);
    }
    messages
}
