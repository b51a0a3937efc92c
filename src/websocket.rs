//! # Browser WebSocket Endpoint
//!
//! Accepts browser connections on `/ws` and gives each one its own relay
//! session.
//!
//! ## Connection Flow:
//! 1. **Negotiation**: the optional `format` query parameter picks the input
//!    audio format (`pcm` by default, container formats go through the transcoder)
//! 2. **Admission**: a slot of the concurrent session cap is reserved
//! 3. **Upgrade**: [`ClientSocket`] becomes the actor behind the socket
//! 4. **Relay**: the actor spawns the session task and shuttles frames between
//!    the socket and the session's channels
//!
//! ## Actor Model:
//! The actor owns the socket and nothing else. It never interprets frames: text
//! and binary frames go to the session as they are, and the session tells the
//! actor what to send and when to close.

use crate::error::AppError;
use crate::relay::transcoder::InputFormat;
use crate::relay::{ClientCommand, ClientEvent, ClientLink, Session, SessionSettings};
use crate::state::{AppState, SessionPermit};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};

/// Query parameters accepted on `/ws`.
#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    /// Input audio format, e.g. `pcm` or `webm`
    pub format: Option<String>,
}

/// WebSocket actor for one browser connection.
pub struct ClientSocket {
    /// Moved into its task when the actor starts
    session: Option<Session>,
    permit: Option<SessionPermit>,
    commands: Option<mpsc::Receiver<ClientCommand>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl ClientSocket {
    pub fn new(state: &AppState, input: InputFormat, permit: SessionPermit) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(state.config.session.outbound_buffer);

        let client = ClientLink {
            inbound: events_rx,
            outbound: commands_tx,
        };
        let settings = SessionSettings::from_config(&state.config, &input);
        let session = Session::new(client, state.connector.clone(), settings)
            .with_shutdown(state.shutdown.subscribe());

        Self {
            session: Some(session),
            permit: Some(permit),
            commands: Some(commands_rx),
            events: events_tx,
            heartbeat_interval: state.config.session.heartbeat_interval(),
            client_timeout: state.config.session.client_timeout(),
            last_heartbeat: Instant::now(),
        }
    }

    /// Hand an event to the session. Once the session has finished nobody is
    /// listening, which is fine.
    fn forward(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("session already finished, dropping client event");
        }
    }

    /// Any frame from the browser proves the connection is alive.
    fn mark_alive(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn heartbeat_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > self.client_timeout
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.heartbeat_expired(Instant::now()) {
                warn!("client heartbeat timed out, closing connection");
                act.forward(ClientEvent::Error("heartbeat timeout".to_string()));
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (Some(session), Some(commands)) = (self.session.take(), self.commands.take()) else {
            ctx.stop();
            return;
        };

        self.start_heartbeat(ctx);
        ctx.add_stream(ReceiverStream::new(commands));

        let permit = self.permit.take();
        if let Some(permit) = &permit {
            permit.record_started();
        }

        let span = info_span!("session", id = %session.id(), variant = session.variant().as_str());
        tokio::spawn(
            async move {
                let summary = session.run().await;
                debug!(
                    session = %summary.id,
                    history = ?summary.history,
                    chunks_forwarded = summary.chunks_forwarded,
                    events_relayed = summary.events_relayed,
                    frames_rejected = summary.frames_rejected,
                    "session summary"
                );
                if let Some(permit) = permit {
                    permit.finish(&summary.reason);
                }
            }
            .instrument(span),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!("client socket stopped");
        self.forward(ClientEvent::Closed);
    }
}

/// Frames arriving from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.mark_alive();
                self.forward(ClientEvent::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.mark_alive();
                self.forward(ClientEvent::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                self.mark_alive();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => self.mark_alive(),
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "client closed the socket");
                self.forward(ClientEvent::Closed);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(error = %err, "client protocol error");
                self.forward(ClientEvent::Error(err.to_string()));
                ctx.stop();
            }
        }
    }
}

/// Commands from the session.
impl StreamHandler<ClientCommand> for ClientSocket {
    fn handle(&mut self, command: ClientCommand, ctx: &mut Self::Context) {
        match command {
            ClientCommand::Send(text) => ctx.text(text),
            ClientCommand::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Rejections happen before the upgrade, as plain HTTP errors:
/// - 400 for a `format` we cannot decode
/// - 503 when the session cap is reached or the server is shutting down
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<RelayQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let requested = query
        .format
        .as_deref()
        .unwrap_or(&state.config.transcoder.default_input_format);
    let input: InputFormat = requested.parse().map_err(AppError::BadRequest)?;

    if *state.shutdown.borrow() {
        return Err(AppError::Unavailable("server is shutting down".to_string()).into());
    }

    let max_sessions = state.config.session.max_concurrent_sessions;
    let permit = state.metrics.try_admit(max_sessions).ok_or_else(|| {
        AppError::Unavailable(format!("all {} relay sessions are in use", max_sessions))
    })?;

    info!(
        peer = ?req.connection_info().peer_addr(),
        format = requested,
        "accepting relay connection"
    );

    ws::start(ClientSocket::new(&state, input, permit), &req, stream)
}
