//! Client side session state machine.
//!
//! A client enrolls through a single *active server*: the first
//! server it finds connected. It queues for the current round,
//! registers under a fresh ephemeral key and participates until a
//! Stop. Any violation or loss of the active server resets the
//! machine to `WaitingForServer`; blame assignment is the round's
//! business, never the client's.
use rand::{rngs::OsRng, RngCore};
use std::collections::VecDeque;

use veil_protocol::{
    roster_digest, verify, Envelope, MessageKind, PeerId, Register,
    RoundId, SessionMessage, NONCE_LEN,
};

use crate::{
    shared::{AgreeEntry, RegisterEntry},
    Error, EventReceiver, Overlay, Result, RoundStatus,
    SessionEvent, SessionOptions, SharedSessionState, TimerKind,
};

/// States of the client session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not yet started.
    Offline,
    /// Waiting for a connection to any server.
    WaitingForServer,
    /// Queue request sent, awaiting the Queued response.
    Queuing,
    /// Registration sent, awaiting Start.
    Registering,
    /// The round is running.
    Communicating,
}

/// What processing one message asks of the machine.
enum Step {
    /// Nothing further.
    Stay,
    /// The message belongs to a later state; keep it.
    Store(Envelope),
    /// Advance to the next state.
    Next(ClientState),
    /// Reset to `WaitingForServer`.
    Restart {
        immediate: bool,
        reason: String,
    },
}

/// State machine driving the client role of a session.
pub struct ClientSession {
    shared: SharedSessionState,
    state: ClientState,
    stored: VecDeque<(PeerId, Envelope)>,

    server: Option<PeerId>,
    nonce: Vec<u8>,
    last_round_id: Option<RoundId>,
    round_settled: bool,
    deadline: Option<(TimerKind, u64)>,
}

impl ClientSession {
    /// Create a client session over an overlay.
    pub fn new(
        overlay: Box<dyn Overlay>,
        options: SessionOptions,
    ) -> Result<(Self, EventReceiver)> {
        let (shared, events) =
            SharedSessionState::new(overlay, options)?;
        Ok((
            Self {
                shared,
                state: ClientState::Offline,
                stored: VecDeque::new(),
                server: None,
                nonce: Vec::new(),
                last_round_id: None,
                round_settled: false,
                deadline: None,
            },
            events,
        ))
    }

    /// Current state of the machine.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Read access to the shared session state.
    pub fn shared(&self) -> &SharedSessionState {
        &self.shared
    }

    /// The server this client is currently enrolled through.
    pub fn active_server(&self) -> Option<PeerId> {
        self.server
    }

    /// Next armed deadline, milliseconds since the epoch.
    pub fn deadline(&self) -> Option<(TimerKind, u64)> {
        self.deadline
    }

    /// Queue application data for an upcoming round.
    ///
    /// Payloads are retained across aborted rounds and leave the
    /// queue only when a round that consumed them completes.
    pub fn send(&mut self, data: Vec<u8>) -> Result<()> {
        self.shared.add_data(data)
    }

    /// Begin the session; idempotent after the first call.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ClientState::Offline {
            return Ok(());
        }
        self.run_transitions(ClientState::WaitingForServer).await
    }

    /// A connection to a peer was established.
    pub async fn handle_connect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        if self.state == ClientState::WaitingForServer
            && self.shared.is_server(peer)
        {
            return self
                .run_transitions(ClientState::WaitingForServer)
                .await;
        }
        Ok(())
    }

    /// A connection to a peer was lost.
    ///
    /// Losing the active server resets the machine; other
    /// connections are irrelevant to a client.
    pub async fn handle_disconnect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        if self.state == ClientState::Offline
            || self.server != Some(*peer)
        {
            return Ok(());
        }
        let next = self
            .teardown(true, "active server disconnected")
            .await?;
        self.run_transitions(next).await
    }

    /// An armed timer fired.
    pub async fn handle_timeout(
        &mut self,
        kind: TimerKind,
    ) -> Result<()> {
        if kind != TimerKind::Response {
            return Ok(());
        }
        match self.state {
            ClientState::Queuing | ClientState::Registering => {
                tracing::warn!(
                    id = %self.shared.local_id(),
                    state = ?self.state,
                    "server response timed out"
                );
                let next = self
                    .teardown(true, "server response timed out")
                    .await?;
                self.run_transitions(next).await
            }
            _ => Ok(()),
        }
    }

    /// Deliver an inbound session message.
    pub async fn handle_message(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<()> {
        self.shared.log_message(&envelope).await?;
        let result = self.process_one(from, envelope).await;
        self.absorb(from, result).await
    }

    async fn absorb(
        &mut self,
        from: &PeerId,
        result: Result<Step>,
    ) -> Result<()> {
        match result {
            Ok(Step::Stay) => Ok(()),
            Ok(Step::Store(envelope)) => {
                self.stored.push_back((*from, envelope));
                Ok(())
            }
            Ok(Step::Next(state)) => {
                self.run_transitions(state).await
            }
            Ok(Step::Restart { immediate, reason }) => {
                let next =
                    self.teardown(immediate, &reason).await?;
                self.run_transitions(next).await
            }
            Err(e) if e.is_violation() => {
                tracing::warn!(
                    from = %from,
                    error = %e,
                    "discarding message"
                );
                self.shared.emit(SessionEvent::ProtocolViolation {
                    peer: *from,
                    reason: e.to_string(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_transitions(
        &mut self,
        mut next: ClientState,
    ) -> Result<()> {
        loop {
            tracing::debug!(
                id = %self.shared.local_id(),
                from = ?self.state,
                to = ?next,
                "client transition"
            );
            self.state = next;
            let mut pending = self.enter(next).await?;

            if pending.is_none() {
                let stored: Vec<_> =
                    self.stored.drain(..).collect();
                for (from, envelope) in stored {
                    if pending.is_some() {
                        self.stored.push_back((from, envelope));
                        continue;
                    }
                    match self.process_one(&from, envelope).await {
                        Ok(Step::Stay) => {}
                        Ok(Step::Store(envelope)) => {
                            self.stored.push_back((from, envelope))
                        }
                        Ok(Step::Next(state)) => {
                            pending = Some(state)
                        }
                        Ok(Step::Restart {
                            immediate,
                            reason,
                        }) => {
                            let next = self
                                .teardown(immediate, &reason)
                                .await?;
                            pending = Some(next);
                        }
                        Err(e) if e.is_violation() => {
                            tracing::warn!(
                                from = %from,
                                error = %e,
                                "discarding stored message"
                            );
                            self.shared.emit(
                                SessionEvent::ProtocolViolation {
                                    peer: from,
                                    reason: e.to_string(),
                                },
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            match pending {
                Some(n) => next = n,
                None => break,
            }
        }
        Ok(())
    }

    async fn enter(
        &mut self,
        state: ClientState,
    ) -> Result<Option<ClientState>> {
        match state {
            ClientState::Offline => Ok(None),
            ClientState::WaitingForServer => {
                self.reset_cycle();
                if let Some(server) =
                    self.shared.first_connected_server()
                {
                    self.server = Some(server);
                    Ok(Some(ClientState::Queuing))
                } else {
                    Ok(None)
                }
            }
            ClientState::Queuing => {
                let server =
                    self.server.ok_or(Error::NoActiveRound)?;

                let mut nonce = vec![0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                self.nonce = nonce.clone();

                // a zero round id marks this register as a queue
                // request; the nonce rides in the optional field
                let request = Register {
                    peer_id: self.shared.local_id(),
                    round_id: RoundId::ZERO,
                    ephemeral_key: Vec::new(),
                    optional: nonce,
                };
                let envelope = self
                    .shared
                    .seal(&SessionMessage::Register(request))
                    .await?;
                self.shared
                    .send_envelope(&server, &envelope)
                    .await?;
                self.arm_response_deadline();
                Ok(None)
            }
            ClientState::Registering => {
                let server =
                    self.server.ok_or(Error::NoActiveRound)?;
                let round_id = self
                    .shared
                    .round_id()
                    .ok_or(Error::NoActiveRound)?;

                self.shared.generate_round_data();
                let register = Register {
                    peer_id: self.shared.local_id(),
                    round_id,
                    ephemeral_key: self.shared.ephemeral_public()?,
                    optional: self
                        .shared
                        .optional_public()
                        .to_vec(),
                };
                let envelope = self
                    .shared
                    .seal(&SessionMessage::Register(register))
                    .await?;
                self.shared
                    .send_envelope(&server, &envelope)
                    .await?;
                self.arm_response_deadline();
                Ok(None)
            }
            ClientState::Communicating => {
                self.deadline = None;
                self.shared.round_start().await?;
                self.settle_round_if_complete();
                Ok(None)
            }
        }
    }

    fn reset_cycle(&mut self) {
        self.server = None;
        self.nonce.clear();
        self.round_settled = false;
        self.deadline = None;
        self.shared.clear_round();
    }

    fn arm_response_deadline(&mut self) {
        let timeout = self
            .shared
            .config()
            .response_timeout
            .saturating_mul(1000);
        self.deadline = Some((
            TimerKind::Response,
            self.shared.now_millis() + timeout,
        ));
    }

    fn settle_round_if_complete(&mut self) {
        if self.round_settled {
            return;
        }
        if let Some(RoundStatus::Complete(outcome)) =
            self.shared.round_status()
        {
            self.shared.complete_round(&outcome);
            self.round_settled = true;
        }
    }

    async fn teardown(
        &mut self,
        immediate: bool,
        reason: &str,
    ) -> Result<ClientState> {
        let round_id =
            self.shared.round_id().unwrap_or(RoundId::ZERO);
        tracing::info!(
            id = %self.shared.local_id(),
            round = %round_id,
            immediate,
            reason,
            "resetting"
        );
        self.shared.emit(SessionEvent::Stopping {
            round_id,
            immediate,
            reason: reason.to_owned(),
        });
        if self.shared.round_is_active() && !self.round_settled {
            self.shared.round_stop(immediate).await?;
            if let Some(RoundStatus::Complete(outcome)) =
                self.shared.round_status()
            {
                self.shared.complete_round(&outcome);
            }
            self.round_settled = true;
        }
        self.shared.clear_round();
        Ok(ClientState::WaitingForServer)
    }

    async fn process_one(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match envelope.kind {
            MessageKind::Stop => {
                self.on_stop(from, envelope).await
            }
            MessageKind::Queued => {
                self.on_queued(from, envelope).await
            }
            MessageKind::Start => {
                self.on_start(from, envelope).await
            }
            MessageKind::SessionData => {
                self.on_session_data(from, envelope).await
            }
            _ => {
                tracing::debug!(
                    from = %from,
                    kind = ?envelope.kind,
                    "dropping server-bound message"
                );
                Ok(Step::Stay)
            }
        }
    }

    async fn on_stop(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        let Some(current) = self.shared.round_id() else {
            tracing::debug!(from = %from, "dropping stale stop");
            return Ok(Step::Stay);
        };
        let SessionMessage::Stop(stop) = envelope.open().await?
        else {
            return Err(Error::Protocol(
                "malformed stop".to_owned(),
            ));
        };
        if stop.peer_id != *from {
            return Err(Error::Protocol(format!(
                "stop sender mismatch from {}",
                from
            )));
        }
        if stop.round_id != current {
            tracing::debug!(
                from = %from,
                round = %stop.round_id,
                "dropping stale stop"
            );
            return Ok(Step::Stay);
        }
        self.shared.check_stop(&stop, &envelope)?;
        Ok(Step::Restart {
            immediate: stop.immediate,
            reason: stop.reason,
        })
    }

    async fn on_queued(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ClientState::Offline
            | ClientState::WaitingForServer
            | ClientState::Communicating => {
                // next cycle's queue response; keep it
                Ok(Step::Store(envelope))
            }
            ClientState::Queuing | ClientState::Registering => {
                let server =
                    self.server.ok_or(Error::NoActiveRound)?;
                if *from != server {
                    return Err(Error::Protocol(format!(
                        "queued from non-active server {}",
                        from
                    )));
                }
                let key = self
                    .shared
                    .keys()
                    .key(&server)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                envelope.verify(key).map_err(|_| {
                    Error::Protocol(
                        "invalid queued signature".to_owned(),
                    )
                })?;
                let SessionMessage::Queued(queued) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed queued".to_owned(),
                    ));
                };

                let servers = self.shared.server_ids();
                if queued.agrees.len() != servers.len() {
                    return Err(Error::Protocol(format!(
                        "queued carries {} agrees, expected {}",
                        queued.agrees.len(),
                        servers.len()
                    )));
                }

                let mut entries = Vec::new();
                for agree_envelope in &queued.agrees {
                    let SessionMessage::Agree(agree) =
                        agree_envelope.open().await?
                    else {
                        return Err(Error::Protocol(
                            "queued entry is not an agree"
                                .to_owned(),
                        ));
                    };
                    entries.push(AgreeEntry {
                        agree,
                        envelope: agree_envelope.clone(),
                    });
                }

                let round_id = entries[0].agree.round_id;
                if self.state == ClientState::Registering {
                    if Some(round_id) == self.shared.round_id() {
                        tracing::debug!(
                            from = %from,
                            "dropping duplicate queued"
                        );
                        return Ok(Step::Stay);
                    }
                    // the servers moved on to a new round while
                    // our registration was pending; fall through
                    // and queue into the new one
                    tracing::debug!(
                        from = %from,
                        round = %round_id,
                        "re-queueing into a newer round"
                    );
                }
                if Some(round_id) == self.last_round_id {
                    return Err(Error::Protocol(
                        "queued for a finished round".to_owned(),
                    ));
                }
                for (idx, entry) in entries.iter().enumerate() {
                    self.shared.check_agree(
                        &entry.agree,
                        &entry.envelope,
                        &round_id,
                    )?;
                    if entry.agree.peer_id != servers[idx] {
                        return Err(Error::Protocol(
                            "queued server order mismatch"
                                .to_owned(),
                        ));
                    }
                }
                if !queued.nonce.is_empty()
                    && queued.nonce != self.nonce
                {
                    // unsolicited but otherwise valid; the agree
                    // set itself is what authenticates the round
                    tracing::debug!(
                        from = %from,
                        "queued nonce does not match ours"
                    );
                }

                self.shared.set_round_id(Some(round_id));
                self.shared.set_servers(entries).await?;
                Ok(Step::Next(ClientState::Registering))
            }
        }
    }

    async fn on_start(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ClientState::Offline
            | ClientState::WaitingForServer
            | ClientState::Queuing => Ok(Step::Store(envelope)),
            ClientState::Communicating => {
                // one Start per round id is accepted
                tracing::debug!(
                    from = %from,
                    "dropping duplicate start"
                );
                Ok(Step::Stay)
            }
            ClientState::Registering => {
                let server =
                    self.server.ok_or(Error::NoActiveRound)?;
                if *from != server {
                    return Err(Error::Protocol(format!(
                        "start from non-active server {}",
                        from
                    )));
                }
                let key = self
                    .shared
                    .keys()
                    .key(&server)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                envelope.verify(key).map_err(|_| {
                    Error::Protocol(
                        "invalid start signature".to_owned(),
                    )
                })?;
                let SessionMessage::Start(start) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed start".to_owned(),
                    ));
                };

                let servers = self.shared.server_ids();
                if start.signatures.len() != servers.len() {
                    return Err(Error::Protocol(format!(
                        "start carries {} signatures, expected {}",
                        start.signatures.len(),
                        servers.len()
                    )));
                }

                // every server must have signed the roster digest
                let digest =
                    roster_digest(&start.registers).await?;
                for (idx, id) in servers.iter().enumerate() {
                    let key = self
                        .shared
                        .keys()
                        .key(id)
                        .map_err(|e| {
                            Error::Protocol(e.to_string())
                        })?;
                    verify(key, &digest, &start.signatures[idx])
                        .map_err(|_| {
                            Error::Protocol(format!(
                                "invalid roster signature: {}",
                                id
                            ))
                        })?;
                }

                let expected = self
                    .shared
                    .round_id()
                    .ok_or(Error::NoActiveRound)?;
                let mut entries = Vec::new();
                for register_envelope in &start.registers {
                    let SessionMessage::Register(register) =
                        register_envelope.open().await?
                    else {
                        return Err(Error::Protocol(
                            "roster entry is not a register"
                                .to_owned(),
                        ));
                    };
                    self.shared.check_register(
                        &register,
                        register_envelope,
                        &expected,
                    )?;
                    entries.push(RegisterEntry {
                        register,
                        envelope: register_envelope.clone(),
                    });
                }

                self.shared.set_clients(entries);
                self.shared.next_round()?;
                self.last_round_id = Some(expected);
                Ok(Step::Next(ClientState::Communicating))
            }
        }
    }

    async fn on_session_data(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        if self.state != ClientState::Communicating {
            return Ok(Step::Store(envelope));
        }
        self.shared.verify_session_data(from, &envelope)?;
        let SessionMessage::SessionData(data) =
            envelope.open().await?
        else {
            return Err(Error::Protocol(
                "malformed session data".to_owned(),
            ));
        };
        self.shared.round_process(from, &data.packet).await?;
        self.settle_round_if_complete();
        Ok(Step::Stay)
    }
}
