//! Executes transport commands against the engine

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    AudioUplink, EventDownlink, RetryPolicy, ServerEvent, Transport, TransportCommand,
    TransportEvent, delay_for_attempt,
};
use crate::error::FailureKind;
use crate::session::HandleId;
use crate::voice::{AudioFrame, BoundedQueue};

enum Upstream {
    Audio(AudioFrame),
    EndOfUtterance,
    ResetTurn,
}

struct LiveConnection {
    handle: HandleId,
    uplink: Box<dyn AudioUplink>,
    reader: JoinHandle<()>,
    broken: bool,
}

impl LiveConnection {
    fn matches(&self, handle: HandleId) -> bool {
        self.handle == handle
    }
}

/// Drains the uplink queue and owns the live engine connection
///
/// Events are delivered as `E`, so the controller's control channel can
/// carry transport events alongside its own.
pub struct TransportWorker<E> {
    transport: Arc<dyn Transport>,
    commands: Arc<BoundedQueue<TransportCommand>>,
    events: mpsc::Sender<E>,
    policy: RetryPolicy,
    close_deadline: Duration,
    live: Option<LiveConnection>,
}

impl<E> TransportWorker<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    /// Create a worker
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        commands: Arc<BoundedQueue<TransportCommand>>,
        events: mpsc::Sender<E>,
        policy: RetryPolicy,
        close_deadline: Duration,
    ) -> Self {
        Self {
            transport,
            commands,
            events,
            policy,
            close_deadline,
            live: None,
        }
    }

    /// Run until the command queue is closed and drained
    pub async fn run(mut self) {
        tracing::debug!("transport worker started");

        while let Some(command) = self.commands.pop().await {
            if !self.execute(command).await {
                break;
            }
        }

        if let Some(conn) = self.live.take() {
            self.close_connection(conn).await;
        }
        tracing::debug!("transport worker stopped");
    }

    /// Execute one command; false once the controller is gone
    async fn execute(&mut self, command: TransportCommand) -> bool {
        match command {
            TransportCommand::Open { handle } => {
                if let Some(stale) = self.live.take() {
                    tracing::debug!(handle = %stale.handle, "dropping superseded connection");
                    self.close_connection(stale).await;
                }
                let policy = self.policy.clone();
                self.connect(handle, &policy).await
            }
            TransportCommand::Reconnect { handle } => {
                if let Some(old) = self.live.take_if(|c| c.matches(handle)) {
                    self.close_connection(old).await;
                }
                tracing::info!(%handle, "reconnecting");
                self.connect(handle, &RetryPolicy::single()).await
            }
            TransportCommand::SendAudio { handle, frame } => {
                self.send(handle, Upstream::Audio(frame)).await
            }
            TransportCommand::EndOfUtterance { handle } => {
                self.send(handle, Upstream::EndOfUtterance).await
            }
            TransportCommand::ResetTurn { handle } => {
                self.send(handle, Upstream::ResetTurn).await
            }
            TransportCommand::Close { handle } => {
                if let Some(conn) = self.live.take_if(|c| c.matches(handle)) {
                    self.close_connection(conn).await;
                }
                self.emit(TransportEvent::Closed { handle }).await
            }
        }
    }

    async fn connect(&mut self, handle: HandleId, policy: &RetryPolicy) -> bool {
        let attempts = policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.transport.connect().await {
                Ok((uplink, downlink)) => {
                    let reader = self.spawn_reader(handle, downlink);
                    self.live = Some(LiveConnection {
                        handle,
                        uplink,
                        reader,
                        broken: false,
                    });
                    tracing::info!(%handle, attempt = attempt + 1, "engine connection open");
                    return self.emit(TransportEvent::Opened { handle }).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        let delay = delay_for_attempt(policy, attempt);
                        tracing::warn!(
                            %handle,
                            attempt = attempt + 1,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "connect failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::warn!(%handle, attempts, error = %last_error, "connect failed");
        self.emit(TransportEvent::ConnectFailed {
            handle,
            error: last_error,
        })
        .await
    }

    async fn send(&mut self, handle: HandleId, message: Upstream) -> bool {
        let Some(conn) = self.live.as_mut().filter(|c| c.matches(handle)) else {
            tracing::trace!(%handle, "no live connection, dropping upstream message");
            return true;
        };
        if conn.broken {
            return true;
        }

        let result = match &message {
            Upstream::Audio(frame) => conn.uplink.send_audio(frame).await,
            Upstream::EndOfUtterance => conn.uplink.end_utterance().await,
            Upstream::ResetTurn => conn.uplink.reset_turn().await,
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                conn.broken = true;
                tracing::warn!(%handle, error = %e, "upstream send failed");
                self.emit(TransportEvent::SendFailed {
                    handle,
                    error: e.to_string(),
                })
                .await
            }
        }
    }

    async fn close_connection(&self, mut conn: LiveConnection) {
        conn.reader.abort();
        match tokio::time::timeout(self.close_deadline, conn.uplink.close()).await {
            Ok(Ok(())) => tracing::debug!(handle = %conn.handle, "engine connection closed"),
            Ok(Err(e)) => tracing::debug!(handle = %conn.handle, error = %e, "close failed"),
            Err(_) => tracing::debug!(handle = %conn.handle, "close deadline elapsed"),
        }
    }

    fn spawn_reader(&self, handle: HandleId, mut downlink: Box<dyn EventDownlink>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let event = match downlink.next_event().await {
                    Ok(Some(ServerEvent::Audio(chunk))) => TransportEvent::Audio { handle, chunk },
                    Ok(Some(ServerEvent::TurnComplete)) => TransportEvent::TurnComplete { handle },
                    Ok(Some(ServerEvent::Error(message))) => TransportEvent::Failure {
                        handle,
                        kind: FailureKind::ProtocolError,
                        error: message,
                    },
                    Ok(None) => TransportEvent::Failure {
                        handle,
                        kind: FailureKind::ReceiveFailure,
                        error: "engine closed the connection".to_string(),
                    },
                    Err(e) => TransportEvent::Failure {
                        handle,
                        kind: e.failure_kind().unwrap_or(FailureKind::ReceiveFailure),
                        error: e.to_string(),
                    },
                };

                let terminal = matches!(event, TransportEvent::Failure { .. });
                if events.send(E::from(event)).await.is_err() || terminal {
                    break;
                }
            }
            tracing::trace!(%handle, "reader stopped");
        })
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(E::from(event)).await.is_ok()
    }
}
