//! # Lifecycle / Cleanup
//!
//! Every way a session can end funnels into [`Session::teardown`]. It is the
//! only code that releases the upstream link, the transcoder or the client
//! link, and it does so in a fixed order:
//!
//! 1. terminate message to the provider, then close the upstream link. After a
//!    client `end`, audio still inside the transcoder is forwarded first
//! 2. end transcoder input, wait briefly for exit, then kill it
//! 3. ask the browser socket to close
//!
//! Teardown takes `&mut Session`, so two trigger sites can never run it at the
//! same time. Calling it again after it finished is a no-op: the upstream link
//! and the transcoder are moved out on first use, and a CLOSED session returns
//! immediately.

use crate::relay::session::{ClientCommand, Session, SessionState};
use futures_util::SinkExt;
use std::fmt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// Browser sent `{"type":"end"}`
    ClientEnded,
    ClientClosed,
    ClientError(String),
    UpstreamClosed,
    UpstreamError(String),
    /// Provider reported an error in-band
    ProviderFault(String),
    TranscoderExited,
    /// The process is stopping
    ServerShutdown,
    ConnectFailed(String),
    PipelineStartFailed(String),
}

impl TeardownReason {
    /// Orderly ends are the ones the browser asked for, plus server shutdown.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            TeardownReason::ClientEnded | TeardownReason::ClientClosed | TeardownReason::ServerShutdown
        )
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::ClientEnded => write!(f, "client ended the stream"),
            TeardownReason::ClientClosed => write!(f, "client disconnected"),
            TeardownReason::ClientError(e) => write!(f, "client link error: {}", e),
            TeardownReason::UpstreamClosed => write!(f, "provider closed the connection"),
            TeardownReason::UpstreamError(e) => write!(f, "provider link error: {}", e),
            TeardownReason::ProviderFault(e) => write!(f, "provider reported an error: {}", e),
            TeardownReason::TranscoderExited => write!(f, "transcoder exited"),
            TeardownReason::ServerShutdown => write!(f, "server shutting down"),
            TeardownReason::ConnectFailed(e) => write!(f, "could not connect to provider: {}", e),
            TeardownReason::PipelineStartFailed(e) => write!(f, "could not start transcoder: {}", e),
        }
    }
}

impl Session {
    /// Release everything the session owns and mark it CLOSED.
    ///
    /// Each step is bounded by the drain grace period, so a stuck provider or
    /// decoder can delay a session's end but never block it.
    pub async fn teardown(&mut self, reason: &TeardownReason) {
        match self.state {
            SessionState::Closed => {
                debug!(reason = %reason, "teardown requested for closed session");
                return;
            }
            SessionState::Streaming => self.transition(SessionState::Draining),
            SessionState::Connecting | SessionState::Draining => {}
        }

        if reason.is_failure() {
            warn!(reason = %reason, "session ending");
        } else {
            info!(reason = %reason, "session ending");
        }

        let grace = self.settings.drain_grace;

        if *reason == TeardownReason::ClientEnded {
            self.flush_transcoder(grace).await;
        }

        if let Some(mut upstream) = self.upstream.take() {
            let terminate = self.adapter.build_terminate();
            let farewell = async move {
                upstream.sink.send(terminate).await?;
                upstream.sink.close().await
            };

            match timeout(grace, farewell).await {
                Ok(Ok(())) => debug!("terminate sent, upstream link closed"),
                Ok(Err(err)) => warn!(error = %err, "upstream link failed during terminate"),
                Err(_) => warn!("upstream link did not close within grace period"),
            }
        }

        if let Some(mut transcoder) = self.transcoder.take() {
            transcoder.stop(grace).await;
        }

        match timeout(grace, self.client.outbound.send(ClientCommand::Close)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("client link already gone"),
            Err(_) => warn!("client did not accept close within grace period"),
        }
        self.client.inbound.close();

        self.transition(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::ClientEvent;
    use crate::relay::testing::{client_link, collect_sent, fake_link, settings, FakeConnector};
    use crate::relay::transcoder::DecoderCommand;
    use std::time::{Duration, Instant};

    #[test]
    fn test_failure_classification() {
        assert!(!TeardownReason::ClientEnded.is_failure());
        assert!(!TeardownReason::ClientClosed.is_failure());
        assert!(TeardownReason::UpstreamClosed.is_failure());
        assert!(TeardownReason::TranscoderExited.is_failure());
        assert!(TeardownReason::ProviderFault("quota".into()).is_failure());
        assert!(!TeardownReason::ServerShutdown.is_failure());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TeardownReason::ConnectFailed("timed out".into()).to_string(),
            "could not connect to provider: timed out"
        );
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (link, sent, _events) = fake_link();
        let (client, inbound, mut outbound) = client_link();
        let mut session = Session::new(client, FakeConnector::linked(link), settings(None));

        session.establish().await.unwrap();
        session.transition(SessionState::Streaming);

        session.teardown(&TeardownReason::UpstreamError("reset".into())).await;
        session.teardown(&TeardownReason::ClientClosed).await;
        assert_eq!(session.state(), SessionState::Closed);

        let adapter = session.settings.variant.adapter(session.settings.format);
        assert_eq!(
            collect_sent(sent).await,
            vec![adapter.build_handshake(), adapter.build_terminate()]
        );

        assert_eq!(outbound.recv().await, Some(ClientCommand::Close));
        drop(session);
        assert_eq!(outbound.recv().await, None);

        // A CLOSED session no longer listens to its client.
        assert!(inbound.send(ClientEvent::Closed).is_err());
    }

    #[tokio::test]
    async fn test_teardown_kills_stuck_transcoder_after_grace() {
        let (client, _inbound, _outbound) = client_link();
        let decoder = DecoderCommand {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        };
        let mut settings = settings(Some(decoder));
        settings.drain_grace = Duration::from_millis(100);
        let mut session = Session::new(client, FakeConnector::refusing(), settings);

        // Transcoder starts, then the connection is refused.
        let reason = session.establish().await.unwrap_err();
        assert!(matches!(reason, TeardownReason::ConnectFailed(_)));
        assert!(session.transcoder.is_some());

        let started = Instant::now();
        session.teardown(&reason).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(session.transcoder.is_none());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_teardown_survives_departed_client() {
        let (link, _sent, _events) = fake_link();
        let (client, _inbound, outbound) = client_link();
        drop(outbound);
        let mut session = Session::new(client, FakeConnector::linked(link), settings(None));

        session.establish().await.unwrap();
        session.teardown(&TeardownReason::ClientClosed).await;

        assert_eq!(session.state(), SessionState::Closed);
    }
}
