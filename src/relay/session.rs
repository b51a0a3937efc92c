//! # Session Coordinator
//!
//! One [`Session`] per accepted browser connection. It owns the client link,
//! the upstream link and (when the browser sends container audio) a
//! transcoder, and it is the only code that touches any of them.
//!
//! ## State Machine:
//! ```text
//! CONNECTING ──upstream ready──► STREAMING ──any fatal trigger──► DRAINING ──► CLOSED
//!     │                                                                          ▲
//!     └────────────── connect / transcoder start failure ───────────────────────┘
//! ```
//!
//! ## Concurrency Model:
//! A session is one tokio task. Client frames, upstream messages, transcoder
//! output and the process shutdown signal are multiplexed with `tokio::select!`,
//! so no source can starve the others. Each source is handled to completion before the next
//! one is polled, which is what keeps audio and transcripts in arrival order.

use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};
use crate::relay::frames::{self, AudioChunk, ClientFrame};
use crate::relay::lifecycle::TeardownReason;
use crate::relay::protocol::{AudioFormat, ProtocolAdapter, ProtocolVariant, TranscriptEvent};
use crate::relay::transcoder::{DecoderCommand, InputFormat, Transcoder};
use crate::relay::upstream::{UpstreamConnector, UpstreamLink};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// What the browser socket reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed,
    Error(String),
}

/// What the session asks the browser socket to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Send(String),
    Close,
}

/// The session's half of the browser connection.
///
/// `outbound` is bounded: when the browser reads slowly, relaying transcripts
/// waits instead of queueing without limit.
pub struct ClientLink {
    pub inbound: mpsc::UnboundedReceiver<ClientEvent>,
    pub outbound: mpsc::Sender<ClientCommand>,
}

/// Everything a session needs to know, fixed at creation.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub base_url: String,
    pub api_key: String,
    pub variant: ProtocolVariant,
    pub format: AudioFormat,
    pub connect_timeout: Duration,
    pub drain_grace: Duration,
    /// Present only when the negotiated input format needs decoding
    pub decoder: Option<DecoderCommand>,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig, input: &InputFormat) -> Self {
        let provider = &config.provider;
        let format = AudioFormat {
            sample_rate: provider.sample_rate,
            channels: provider.channels,
        };

        let decoder = input.needs_transcoding().then(|| match &config.transcoder.args {
            Some(args) => DecoderCommand {
                program: config.transcoder.program.clone(),
                args: args.clone(),
            },
            None => DecoderCommand::ffmpeg(&config.transcoder.program, format.sample_rate, format.channels),
        });

        Self {
            base_url: provider
                .url
                .clone()
                .unwrap_or_else(|| provider.variant.default_url().to_string()),
            api_key: provider.api_key.clone(),
            variant: provider.variant,
            format,
            connect_timeout: provider.connect_timeout(),
            drain_grace: config.session.drain_grace(),
            decoder,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionStats {
    chunks_forwarded: u64,
    events_relayed: u64,
    frames_rejected: u64,
}

/// Outcome of a finished session, for logs and metrics.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub reason: TeardownReason,
    pub history: Vec<SessionState>,
    pub chunks_forwarded: u64,
    pub events_relayed: u64,
    pub frames_rejected: u64,
}

/// One relay session.
pub struct Session {
    id: String,
    pub(super) state: SessionState,
    history: Vec<SessionState>,
    pub(super) client: ClientLink,
    pub(super) upstream: Option<UpstreamLink>,
    pub(super) transcoder: Option<Transcoder>,
    pub(super) adapter: Box<dyn ProtocolAdapter>,
    connector: Arc<dyn UpstreamConnector>,
    pub(super) settings: SessionSettings,
    /// Flips to `true` when the process is shutting down
    shutdown: Option<watch::Receiver<bool>>,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        client: ClientLink,
        connector: Arc<dyn UpstreamConnector>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Connecting,
            history: vec![SessionState::Connecting],
            client,
            upstream: None,
            transcoder: None,
            adapter: settings.variant.adapter(settings.format),
            connector,
            settings,
            shutdown: None,
            stats: SessionStats::default(),
        }
    }

    /// End the session in order once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.settings.variant
    }

    /// Drive the session from CONNECTING to CLOSED.
    pub async fn run(mut self) -> SessionSummary {
        info!(
            variant = self.adapter.variant().as_str(),
            transcoding = self.settings.decoder.is_some(),
            "session accepted"
        );

        let reason = match self.establish().await {
            Ok(()) => {
                self.transition(SessionState::Streaming);
                self.relay().await
            }
            Err(reason) => reason,
        };

        self.teardown(&reason).await;
        self.summary(reason)
    }

    pub(super) fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(from = self.state.as_str(), to = next.as_str(), "session state change");
        self.state = next;
        self.history.push(next);
    }

    /// Attach the transcoder and the upstream link, then send the handshake.
    ///
    /// The transcoder starts first so a missing decoder never opens a provider
    /// session. The handshake goes out on the fresh link before the link is
    /// stored, so nothing else can be sent ahead of it.
    pub(super) async fn establish(&mut self) -> Result<(), TeardownReason> {
        if let Some(command) = &self.settings.decoder {
            let transcoder = Transcoder::start(command, self.settings.format.frame_bytes())
                .map_err(|e| TeardownReason::PipelineStartFailed(e.to_string()))?;
            self.transcoder = Some(transcoder);
        }

        let endpoint = self.adapter.endpoint(&self.settings.base_url);
        let handshake = self.adapter.build_handshake();
        let api_key = self.settings.api_key.clone();
        let connect_timeout = self.settings.connect_timeout;
        let connector = Arc::clone(&self.connector);

        let attempt = async move {
            let mut link = connector.connect(&endpoint, &api_key).await?;
            link.sink.send(handshake).await?;
            Ok::<_, RelayError>(link)
        };

        match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(Ok(link)) => {
                debug!("upstream link ready, handshake sent");
                self.upstream = Some(link);
                Ok(())
            }
            Ok(Err(err)) => Err(TeardownReason::ConnectFailed(err.to_string())),
            Err(_) => Err(TeardownReason::ConnectFailed(format!(
                "no upstream connection within {} ms",
                connect_timeout.as_millis()
            ))),
        }
    }

    /// The STREAMING loop. Returns the first session-fatal trigger.
    async fn relay(&mut self) -> TeardownReason {
        loop {
            let outcome = tokio::select! {
                event = self.client.inbound.recv() => self.on_client_event(event).await,
                message = next_upstream(&mut self.upstream) => self.on_upstream_message(message).await,
                pcm = next_pcm(&mut self.transcoder) => self.on_transcoded(pcm).await,
                _ = shutdown_requested(&mut self.shutdown) => Some(TeardownReason::ServerShutdown),
            };

            if let Some(reason) = outcome {
                return reason;
            }
        }
    }

    pub(super) async fn on_client_event(&mut self, event: Option<ClientEvent>) -> Option<TeardownReason> {
        let frame = match event {
            None | Some(ClientEvent::Closed) => return Some(TeardownReason::ClientClosed),
            Some(ClientEvent::Error(err)) => return Some(TeardownReason::ClientError(err)),
            Some(ClientEvent::Text(raw)) => frames::parse_inbound(&raw),
            Some(ClientEvent::Binary(bytes)) => frames::parse_binary(bytes),
        };

        match frame {
            Ok(ClientFrame::Audio(chunk)) => self.forward_audio(chunk).await,
            Ok(ClientFrame::End) => Some(TeardownReason::ClientEnded),
            Ok(ClientFrame::Unrecognized) => {
                self.stats.frames_rejected += 1;
                warn!("ignoring client frame with unrecognized type");
                None
            }
            Err(err) => {
                self.stats.frames_rejected += 1;
                warn!(error = %err, "discarding client frame");
                None
            }
        }
    }

    async fn forward_audio(&mut self, chunk: AudioChunk) -> Option<TeardownReason> {
        trace!(bytes = chunk.len(), "client audio chunk");

        if let Some(transcoder) = &self.transcoder {
            return match transcoder.write(chunk.into_bytes()) {
                Ok(()) => None,
                Err(err) => {
                    warn!(error = %err, "transcoder rejected audio");
                    Some(TeardownReason::TranscoderExited)
                }
            };
        }

        self.send_audio(&chunk.into_bytes()).await
    }

    async fn send_audio(&mut self, pcm: &[u8]) -> Option<TeardownReason> {
        let message = match self.adapter.encode_audio(pcm) {
            Ok(message) => message,
            Err(err) => {
                self.stats.frames_rejected += 1;
                warn!(error = %err, "dropping audio frame");
                return None;
            }
        };

        let Some(upstream) = self.upstream.as_mut() else {
            return Some(TeardownReason::UpstreamClosed);
        };

        if let Err(err) = upstream.sink.send(message).await {
            self.upstream = None;
            return Some(TeardownReason::UpstreamError(err.to_string()));
        }

        self.stats.chunks_forwarded += 1;
        None
    }

    async fn on_upstream_message(&mut self, message: Option<RelayResult<String>>) -> Option<TeardownReason> {
        let raw = match message {
            None => {
                self.upstream = None;
                return Some(TeardownReason::UpstreamClosed);
            }
            Some(Ok(raw)) => raw,
            Some(Err(err)) if !err.is_session_fatal() => {
                warn!(error = %err, "ignoring upstream frame");
                return None;
            }
            Some(Err(err)) => {
                self.upstream = None;
                return Some(TeardownReason::UpstreamError(err.to_string()));
            }
        };

        match self.adapter.parse_event(&raw) {
            Ok(Some(event)) => self.relay_transcript(event).await,
            Ok(None) => {
                trace!("upstream message without transcript text");
                None
            }
            Err(RelayError::Provider(detail)) => Some(TeardownReason::ProviderFault(detail)),
            Err(err) => {
                warn!(error = %err, "ignoring upstream message");
                None
            }
        }
    }

    async fn relay_transcript(&mut self, event: TranscriptEvent) -> Option<TeardownReason> {
        debug!(is_final = event.is_final, chars = event.text.len(), "relaying transcript");

        let message = frames::serialize_outbound(&event);
        if self.client.outbound.send(ClientCommand::Send(message)).await.is_err() {
            return Some(TeardownReason::ClientClosed);
        }

        self.stats.events_relayed += 1;
        None
    }

    async fn on_transcoded(&mut self, pcm: Option<Vec<u8>>) -> Option<TeardownReason> {
        match pcm {
            Some(pcm) => self.send_audio(&pcm).await,
            None => Some(TeardownReason::TranscoderExited),
        }
    }

    /// Forward what the decoder still holds for audio the client already sent.
    ///
    /// Ends decoder input, then relays output until the decoder exits or
    /// `grace` runs out.
    pub(super) async fn flush_transcoder(&mut self, grace: Duration) {
        let Some(transcoder) = self.transcoder.as_mut() else {
            return;
        };
        transcoder.finish_input();
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let Some(transcoder) = self.transcoder.as_mut() else {
                return;
            };
            let next = tokio::time::timeout_at(deadline, transcoder.next_output()).await;
            match next {
                Ok(Some(pcm)) => {
                    if self.send_audio(&pcm).await.is_some() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("transcoder flushed");
                    return;
                }
                Err(_) => {
                    warn!("transcoder flush exceeded grace period");
                    return;
                }
            }
        }
    }

    fn summary(self, reason: TeardownReason) -> SessionSummary {
        info!(
            reason = %reason,
            chunks_forwarded = self.stats.chunks_forwarded,
            events_relayed = self.stats.events_relayed,
            frames_rejected = self.stats.frames_rejected,
            "session finished"
        );

        SessionSummary {
            id: self.id,
            reason,
            history: self.history,
            chunks_forwarded: self.stats.chunks_forwarded,
            events_relayed: self.stats.events_relayed,
            frames_rejected: self.stats.frames_rejected,
        }
    }
}

async fn next_upstream(link: &mut Option<UpstreamLink>) -> Option<RelayResult<String>> {
    match link {
        Some(link) => link.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(shutdown) = shutdown.as_mut() else {
        return std::future::pending().await;
    };
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without a shutdown: nothing left to wait for.
        std::future::pending::<()>().await;
    }
}

async fn next_pcm(transcoder: &mut Option<Transcoder>) -> Option<Vec<u8>> {
    match transcoder {
        Some(transcoder) => transcoder.next_output().await,
        None => std::future::pending().await,
    }
}
