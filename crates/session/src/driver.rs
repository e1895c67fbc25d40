//! Asynchronous event loop for a session.
//!
//! Single-threaded cooperative execution: each inbound message is
//! processed to quiescence before the next is picked up, and the
//! session's armed deadline is turned into a timer.
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use veil_protocol::{
    Envelope, PeerId, ROUND_TOPIC, SESSION_TOPIC,
};

use crate::{Clock, Result, Session};

/// Network-facing events fed into a driver.
#[derive(Debug)]
pub enum NetworkEvent {
    /// An inbound buffer on one of the session's topics.
    Message {
        /// Overlay sender.
        from: PeerId,
        /// Overlay topic the buffer arrived on.
        topic: String,
        /// Wire bytes of one envelope.
        payload: Vec<u8>,
    },
    /// A connection to a peer was established.
    Connected(PeerId),
    /// A connection to a peer was lost.
    Disconnected(PeerId),
}

/// Commands from the application.
#[derive(Debug)]
pub enum SessionCommand {
    /// Queue data for transmission in an upcoming round.
    Send(Vec<u8>),
    /// Stop driving the session.
    Shutdown,
}

/// Drives a session over its inbound traffic, timers and
/// application commands.
pub struct SessionDriver {
    session: Session,
    clock: Arc<dyn Clock>,
    network: mpsc::Receiver<NetworkEvent>,
    commands: mpsc::Receiver<SessionCommand>,
}

impl SessionDriver {
    /// Create a driver and the channels that feed it.
    pub fn new(
        session: Session,
        clock: Arc<dyn Clock>,
    ) -> (
        Self,
        mpsc::Sender<NetworkEvent>,
        mpsc::Sender<SessionCommand>,
    ) {
        let (network_tx, network) = mpsc::channel(64);
        let (command_tx, commands) = mpsc::channel(64);
        (
            Self {
                session,
                clock,
                network,
                commands,
            },
            network_tx,
            command_tx,
        )
    }

    /// Run until shut down or the network channel closes.
    ///
    /// Returns the session so a caller can inspect or restart it.
    pub async fn run(mut self) -> Result<Session> {
        self.session.start().await?;

        loop {
            let deadline = self.session.deadline();
            let sleep_for = deadline.map(|(_, at)| {
                Duration::from_millis(
                    at.saturating_sub(self.clock.now_millis()),
                )
            });

            tokio::select! {
                event = self.network.recv() => match event {
                    Some(NetworkEvent::Message {
                        from,
                        topic,
                        payload,
                    }) => {
                        if topic != SESSION_TOPIC
                            && topic != ROUND_TOPIC
                        {
                            tracing::debug!(
                                from = %from,
                                topic,
                                "dropping buffer on unknown topic"
                            );
                            continue;
                        }
                        match Envelope::from_bytes(&payload).await {
                            Ok(envelope) => {
                                self.session
                                    .handle_message(&from, envelope)
                                    .await?;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    from = %from,
                                    error = %e,
                                    "dropping undecodable buffer"
                                );
                            }
                        }
                    }
                    Some(NetworkEvent::Connected(peer)) => {
                        self.session.handle_connect(&peer).await?;
                    }
                    Some(NetworkEvent::Disconnected(peer)) => {
                        self.session
                            .handle_disconnect(&peer)
                            .await?;
                    }
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Send(data)) => {
                        if let Err(e) = self.session.send(data) {
                            // back-pressure surfaces to the
                            // application, data is never dropped
                            // silently
                            tracing::warn!(
                                error = %e,
                                "send rejected"
                            );
                        }
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                _ = maybe_sleep(sleep_for) => {
                    if let Some((kind, _)) = deadline {
                        self.session.handle_timeout(kind).await?;
                    }
                }
            }
        }

        Ok(self.session)
    }
}

/// Sleep for the given duration, or forever when there is no
/// armed deadline.
async fn maybe_sleep(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
