//! Server side session state machine.
//!
//! Drives the proposer/enlist/agree bootstrap among servers, the
//! client registration window, the roster cross-signing exchange
//! and round supervision. The machine cycles forever; a Stop
//! returns it to `WaitingForServers` for the next bootstrap.
use rand::{rngs::OsRng, RngCore};
use std::collections::{BTreeMap, VecDeque};

use veil_protocol::{
    derive_round_id, roster_digest, Agree, Digest, Enlist,
    EnlistSet, Envelope, Init, List, MessageKind, PeerId, Queued,
    RoundId, SessionMessage, Start, Stop, VerifyList, NONCE_LEN,
};

use crate::{
    shared::{AgreeEntry, RegisterEntry},
    Error, EventReceiver, Overlay, Result, RoundStatus,
    SessionEvent, SessionOptions, SharedSessionState, TimerKind,
};

/// States of the server session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not yet started.
    Offline,
    /// Waiting for connections to every configured server.
    WaitingForServers,
    /// Proposer: Init broadcast, collecting Enlist messages.
    Init,
    /// Non-proposer: awaiting the Init and then the Enlist set.
    Enlist,
    /// Collecting Agree messages for the derived round id.
    Agree,
    /// Registration window open, accepting client registrations.
    Queuing,
    /// Exchanging observed registrations with the other servers.
    ListExchange,
    /// Cross-signing the canonical client roster.
    VerifyList,
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
    Next(ServerState),
    /// Tear down and resynchronize, optionally announcing a Stop
    /// with `(immediate, reason)`.
    Restart {
        announce: Option<(bool, String)>,
    },
}

/// State machine driving the server role of a session.
pub struct ServerSession {
    shared: SharedSessionState,
    state: ServerState,
    stored: VecDeque<(PeerId, Envelope)>,

    init: Option<(Init, Envelope)>,
    my_enlist: Option<Envelope>,
    enlists: BTreeMap<PeerId, Envelope>,
    agrees: BTreeMap<PeerId, AgreeEntry>,

    registered: BTreeMap<PeerId, RegisterEntry>,
    lists: BTreeMap<PeerId, List>,
    verifies: BTreeMap<PeerId, Envelope>,
    roster: Vec<RegisterEntry>,
    roster_digest: Option<Digest>,

    start_emitted: bool,
    exchange_completed: bool,
    lifetime_expired: bool,
    round_settled: bool,
    last_stopped: Option<RoundId>,
    deadline: Option<(TimerKind, u64)>,
}

impl ServerSession {
    /// Create a server session over an overlay.
    pub fn new(
        overlay: Box<dyn Overlay>,
        options: SessionOptions,
    ) -> Result<(Self, EventReceiver)> {
        let (shared, events) =
            SharedSessionState::new(overlay, options)?;
        Ok((
            Self {
                shared,
                state: ServerState::Offline,
                stored: VecDeque::new(),
                init: None,
                my_enlist: None,
                enlists: BTreeMap::new(),
                agrees: BTreeMap::new(),
                registered: BTreeMap::new(),
                lists: BTreeMap::new(),
                verifies: BTreeMap::new(),
                roster: Vec::new(),
                roster_digest: None,
                start_emitted: false,
                exchange_completed: false,
                lifetime_expired: false,
                round_settled: false,
                last_stopped: None,
                deadline: None,
            },
            events,
        ))
    }

    /// Current state of the machine.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Read access to the shared session state.
    pub fn shared(&self) -> &SharedSessionState {
        &self.shared
    }

    /// Next armed deadline, milliseconds since the epoch.
    pub fn deadline(&self) -> Option<(TimerKind, u64)> {
        self.deadline
    }

    /// Queue application data for an upcoming round.
    pub fn send(&mut self, data: Vec<u8>) -> Result<()> {
        self.shared.add_data(data)
    }

    /// Begin the session; idempotent after the first call.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ServerState::Offline {
            return Ok(());
        }
        self.run_transitions(ServerState::WaitingForServers).await
    }

    /// A connection to a peer was established.
    pub async fn handle_connect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        if self.state == ServerState::WaitingForServers
            && self.shared.is_server(peer)
            && self.shared.all_servers_connected()
        {
            let next = self.bootstrap_state();
            return self.run_transitions(next).await;
        }
        Ok(())
    }

    /// A connection to a peer was lost.
    ///
    /// Losing any server aborts the cycle immediately; client
    /// connections come and go without affecting it.
    pub async fn handle_disconnect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        if matches!(
            self.state,
            ServerState::Offline | ServerState::WaitingForServers
        ) {
            return Ok(());
        }
        if !self.shared.is_server(peer) {
            return Ok(());
        }
        let reason = format!(
            "server disconnected {} from {}",
            peer,
            self.shared.local_id()
        );
        let next = self.teardown(true, &reason, true).await?;
        self.run_transitions(next).await
    }

    /// An armed timer fired.
    ///
    /// The round lifetime policy lives here: a round ends after
    /// at least one successful exchange *and* the configured
    /// lifetime, whichever happens later, announced by the
    /// proposer with a non-immediate Stop.
    pub async fn handle_timeout(
        &mut self,
        kind: TimerKind,
    ) -> Result<()> {
        match (kind, self.state) {
            (
                TimerKind::RegistrationWindow,
                ServerState::Queuing,
            ) => {
                self.deadline = None;
                self.run_transitions(ServerState::ListExchange)
                    .await
            }
            (
                TimerKind::RoundLifetime,
                ServerState::Communicating,
            ) => {
                self.deadline = None;
                self.lifetime_expired = true;
                if !self.is_proposer() {
                    return Ok(());
                }
                // the timer doubles as the hard upper bound: a
                // round that never completed an exchange is
                // aborted rather than waited on forever
                let (immediate, reason) =
                    if self.exchange_completed {
                        (false, "protocol run complete")
                    } else {
                        (true, "round lifetime exceeded")
                    };
                let next =
                    self.teardown(immediate, reason, true).await?;
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

    fn is_proposer(&self) -> bool {
        self.shared.proposer() == Some(self.shared.local_id())
    }

    fn bootstrap_state(&self) -> ServerState {
        if self.is_proposer() {
            ServerState::Init
        } else {
            ServerState::Enlist
        }
    }

    /// Apply the result of processing a message: push stored
    /// messages, run transitions, recover from violations.
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
            Ok(Step::Restart { announce }) => {
                let next = match announce {
                    Some((immediate, reason)) => {
                        self.teardown(immediate, &reason, true)
                            .await?
                    }
                    None => {
                        self.teardown(true, "protocol violation", false)
                            .await?
                    }
                };
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

    /// Enter `next` and keep going: an entered state may complete
    /// at once, and stored messages are replayed after every
    /// transition.
    async fn run_transitions(
        &mut self,
        mut next: ServerState,
    ) -> Result<()> {
        loop {
            tracing::debug!(
                id = %self.shared.local_id(),
                from = ?self.state,
                to = ?next,
                "server transition"
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
                        Ok(Step::Restart { announce }) => {
                            let next = match announce {
                                Some((immediate, reason)) => {
                                    self.teardown(
                                        immediate, &reason, true,
                                    )
                                    .await?
                                }
                                None => {
                                    self.teardown(
                                        true,
                                        "protocol violation",
                                        false,
                                    )
                                    .await?
                                }
                            };
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

    /// Entry actions for a state. May return a follow-up state
    /// when the entered state is already complete.
    async fn enter(
        &mut self,
        state: ServerState,
    ) -> Result<Option<ServerState>> {
        match state {
            ServerState::Offline => Ok(None),
            ServerState::WaitingForServers => {
                self.reset_cycle();
                if self.shared.all_servers_connected() {
                    Ok(Some(self.bootstrap_state()))
                } else {
                    Ok(None)
                }
            }
            ServerState::Init => {
                self.shared.generate_round_data();

                let mut nonce = vec![0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                let init = Init {
                    peer_id: self.shared.local_id(),
                    nonce,
                    timestamp: self.shared.now_millis(),
                    group_digest: self.shared.group_digest(),
                };
                let envelope = self
                    .shared
                    .seal(&SessionMessage::Init(init.clone()))
                    .await?;
                self.shared.send_to_servers(&envelope).await?;

                // the proposer enlists under its own init
                let enlist = self.make_enlist(&envelope).await?;
                self.init = Some((init, envelope));
                self.my_enlist = Some(enlist.clone());
                self.enlists
                    .insert(self.shared.local_id(), enlist);
                self.check_enlists_complete().await
            }
            ServerState::Enlist => {
                self.shared.generate_round_data();
                Ok(None)
            }
            ServerState::Agree => {
                let round_id = self
                    .shared
                    .round_id()
                    .ok_or(Error::NoActiveRound)?;
                let agree = Agree {
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
                    .seal(&SessionMessage::Agree(agree.clone()))
                    .await?;
                self.shared.send_to_servers(&envelope).await?;
                self.agrees.insert(
                    agree.peer_id,
                    AgreeEntry { agree, envelope },
                );
                self.check_agrees_complete().await
            }
            ServerState::Queuing => {
                let window = self
                    .shared
                    .config()
                    .registration_window
                    .saturating_mul(1000);
                self.deadline = Some((
                    TimerKind::RegistrationWindow,
                    self.shared.now_millis() + window,
                ));
                Ok(None)
            }
            ServerState::ListExchange => {
                self.deadline = None;
                let registers: Vec<Envelope> = self
                    .registered
                    .values()
                    .map(|entry| entry.envelope.clone())
                    .collect();
                let list = List { registers };
                let envelope = self
                    .shared
                    .seal(&SessionMessage::List(list.clone()))
                    .await?;
                self.shared.send_to_servers(&envelope).await?;
                self.lists.insert(self.shared.local_id(), list);
                self.check_lists_complete().await
            }
            ServerState::VerifyList => {
                let digest = self
                    .roster_digest
                    .ok_or(Error::NoActiveRound)?;
                let envelope = self
                    .shared
                    .seal(&SessionMessage::VerifyList(VerifyList {
                        roster_digest: digest,
                    }))
                    .await?;
                self.shared.send_to_servers(&envelope).await?;
                self.verifies
                    .insert(self.shared.local_id(), envelope);
                self.check_verifies_complete()
            }
            ServerState::Communicating => {
                self.emit_start().await?;
                self.shared.set_clients(self.roster.clone());
                self.shared.next_round()?;
                self.shared.round_start().await?;
                if self.is_proposer() {
                    let lifetime = self
                        .shared
                        .config()
                        .round_lifetime
                        .saturating_mul(1000);
                    self.deadline = Some((
                        TimerKind::RoundLifetime,
                        self.shared.now_millis() + lifetime,
                    ));
                }
                // a trivial membership may finish at start
                self.settle_round_if_complete();
                Ok(None)
            }
        }
    }

    fn reset_cycle(&mut self) {
        self.init = None;
        self.my_enlist = None;
        self.enlists.clear();
        self.agrees.clear();
        self.registered.clear();
        self.lists.clear();
        self.verifies.clear();
        self.roster.clear();
        self.roster_digest = None;
        self.start_emitted = false;
        self.exchange_completed = false;
        self.lifetime_expired = false;
        self.round_settled = false;
        self.deadline = None;
    }

    async fn make_enlist(
        &mut self,
        init_envelope: &Envelope,
    ) -> Result<Envelope> {
        let enlist = Enlist {
            peer_id: self.shared.local_id(),
            init: init_envelope.clone(),
            ephemeral_key: self.shared.ephemeral_public()?,
            optional: self.shared.optional_public().to_vec(),
        };
        self.shared
            .seal(&SessionMessage::Enlist(enlist))
            .await
    }

    /// With the full Enlist set in hand the proposer distributes
    /// it and everyone derives the round id.
    async fn check_enlists_complete(
        &mut self,
    ) -> Result<Option<ServerState>> {
        let servers = self.shared.server_ids();
        if self.enlists.len() != servers.len() {
            return Ok(None);
        }
        let ordered: Vec<Envelope> = servers
            .iter()
            .filter_map(|id| self.enlists.get(id).cloned())
            .collect();
        if ordered.len() != servers.len() {
            return Ok(None);
        }

        if self.is_proposer() {
            let set = EnlistSet {
                enlists: ordered.clone(),
            };
            let envelope = self
                .shared
                .seal(&SessionMessage::EnlistSet(set))
                .await?;
            self.shared.send_to_servers(&envelope).await?;
        }

        let round_id = derive_round_id(&ordered).await?;
        self.shared.set_round_id(Some(round_id));
        Ok(Some(ServerState::Agree))
    }

    async fn check_agrees_complete(
        &mut self,
    ) -> Result<Option<ServerState>> {
        let servers = self.shared.server_ids();
        if self.agrees.len() != servers.len() {
            return Ok(None);
        }
        let ordered: Vec<AgreeEntry> = servers
            .iter()
            .filter_map(|id| self.agrees.get(id).cloned())
            .collect();
        if ordered.len() != servers.len() {
            return Ok(None);
        }
        self.shared.set_servers(ordered).await?;
        Ok(Some(ServerState::Queuing))
    }

    /// With a List from every server the canonical roster is the
    /// union, first occurrence winning, ascending client order.
    async fn check_lists_complete(
        &mut self,
    ) -> Result<Option<ServerState>> {
        let servers = self.shared.server_ids();
        if self.lists.len() != servers.len() {
            return Ok(None);
        }

        let mut union: BTreeMap<PeerId, RegisterEntry> =
            BTreeMap::new();
        for id in &servers {
            let Some(list) = self.lists.get(id) else {
                return Ok(None);
            };
            for envelope in &list.registers {
                let SessionMessage::Register(register) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "list entry is not a register".to_owned(),
                    ));
                };
                union
                    .entry(register.peer_id)
                    .or_insert(RegisterEntry {
                        register,
                        envelope: envelope.clone(),
                    });
            }
        }

        self.roster = union.into_values().collect();
        let envelopes: Vec<Envelope> = self
            .roster
            .iter()
            .map(|entry| entry.envelope.clone())
            .collect();
        self.roster_digest =
            Some(roster_digest(&envelopes).await?);
        Ok(Some(ServerState::VerifyList))
    }

    fn check_verifies_complete(&self) -> Result<Option<ServerState>> {
        let servers = self.shared.server_ids();
        if self.verifies.len() == servers.len() {
            Ok(Some(ServerState::Communicating))
        } else {
            Ok(None)
        }
    }

    /// Send Start to the clients registered through this server.
    ///
    /// Emitted exactly once per round id.
    async fn emit_start(&mut self) -> Result<()> {
        if self.start_emitted {
            return Ok(());
        }
        let signatures: Vec<Vec<u8>> = self
            .shared
            .server_ids()
            .iter()
            .filter_map(|id| {
                self.verifies
                    .get(id)
                    .map(|envelope| envelope.signature.clone())
            })
            .collect();
        let start = Start {
            registers: self
                .roster
                .iter()
                .map(|entry| entry.envelope.clone())
                .collect(),
            signatures,
        };
        let envelope = self
            .shared
            .seal(&SessionMessage::Start(start))
            .await?;
        let clients: Vec<PeerId> =
            self.registered.keys().copied().collect();
        for client in clients {
            self.shared
                .send_envelope(&client, &envelope)
                .await?;
        }
        self.start_emitted = true;
        Ok(())
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
            if outcome.successful {
                self.exchange_completed = true;
            }
        }
    }

    /// Broadcast a Stop when announcing, settle the round and
    /// return the restart state.
    async fn teardown(
        &mut self,
        immediate: bool,
        reason: &str,
        announce: bool,
    ) -> Result<ServerState> {
        let round_id =
            self.shared.round_id().unwrap_or(RoundId::ZERO);
        self.last_stopped = Some(round_id);
        tracing::info!(
            id = %self.shared.local_id(),
            round = %round_id,
            immediate,
            reason,
            "stopping"
        );
        if announce {
            let stop = Stop {
                peer_id: self.shared.local_id(),
                round_id,
                immediate,
                reason: reason.to_owned(),
            };
            let envelope = self
                .shared
                .seal(&SessionMessage::Stop(stop))
                .await?;
            self.shared.broadcast_envelope(&envelope).await?;
        }
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
        Ok(ServerState::WaitingForServers)
    }

    /// Process one message against the current state.
    ///
    /// Messages for a future state are stored and replayed on
    /// every transition; messages for past states are dropped as
    /// duplicates.
    async fn process_one(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match envelope.kind {
            MessageKind::Stop => {
                self.on_stop(from, envelope).await
            }
            MessageKind::SessionData => {
                self.on_session_data(from, envelope).await
            }
            MessageKind::Init => self.on_init(from, envelope).await,
            MessageKind::Enlist => {
                self.on_enlist(from, envelope).await
            }
            MessageKind::EnlistSet => {
                self.on_enlist_set(from, envelope).await
            }
            MessageKind::Agree => {
                self.on_agree(from, envelope).await
            }
            MessageKind::Register => {
                self.on_register(from, envelope).await
            }
            MessageKind::List => self.on_list(from, envelope).await,
            MessageKind::VerifyList => {
                self.on_verify_list(from, envelope).await
            }
            MessageKind::Queued | MessageKind::Start => {
                // server to client traffic; nothing for us
                tracing::debug!(
                    from = %from,
                    kind = ?envelope.kind,
                    "dropping client-bound message"
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
        if matches!(
            self.state,
            ServerState::Offline | ServerState::WaitingForServers
        ) {
            // already resynchronizing
            return Ok(Step::Stay);
        }
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

        if Some(stop.round_id) == self.last_stopped {
            // an echo of a stop we already honored
            tracing::debug!(
                from = %from,
                round = %stop.round_id,
                "dropping stop echo"
            );
            return Ok(Step::Stay);
        }
        let current = self.shared.round_id();
        let acceptable = match current {
            Some(id) => id == stop.round_id,
            // before the round id exists only a bootstrap abort
            // makes sense
            None => matches!(
                self.state,
                ServerState::Init | ServerState::Enlist
            ),
        };
        if !acceptable {
            tracing::debug!(
                from = %from,
                round = %stop.round_id,
                "dropping stale stop"
            );
            return Ok(Step::Stay);
        }

        self.shared.check_stop(&stop, &envelope)?;
        Ok(Step::Restart {
            announce: Some((stop.immediate, stop.reason)),
        })
    }

    async fn on_session_data(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        if self.state != ServerState::Communicating {
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
        if self.exchange_completed
            && self.lifetime_expired
            && self.is_proposer()
        {
            return Ok(Step::Restart {
                announce: Some((
                    false,
                    "protocol run complete".to_owned(),
                )),
            });
        }
        Ok(Step::Stay)
    }

    async fn on_init(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ServerState::WaitingForServers => {
                Ok(Step::Store(envelope))
            }
            ServerState::Enlist => {
                let SessionMessage::Init(init) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed init".to_owned(),
                    ));
                };
                if let Some((_, existing)) = &self.init {
                    if *existing == envelope {
                        return Ok(Step::Stay);
                    }
                    return Err(Error::Protocol(format!(
                        "conflicting init from {}",
                        from
                    )));
                }
                self.check_init(from, &init, &envelope)?;

                let enlist = self.make_enlist(&envelope).await?;
                let proposer = self
                    .shared
                    .proposer()
                    .ok_or(Error::NoActiveRound)?;
                self.shared
                    .send_envelope(&proposer, &enlist)
                    .await?;
                self.my_enlist = Some(enlist);
                self.init = Some((init, envelope));
                Ok(Step::Stay)
            }
            _ => {
                tracing::debug!(
                    from = %from,
                    "dropping duplicate init"
                );
                Ok(Step::Stay)
            }
        }
    }

    fn check_init(
        &self,
        from: &PeerId,
        init: &Init,
        envelope: &Envelope,
    ) -> Result<()> {
        let proposer = self
            .shared
            .proposer()
            .ok_or(Error::NoActiveRound)?;
        if init.peer_id != proposer || *from != proposer {
            return Err(Error::Protocol(format!(
                "init from non-proposer {}",
                from
            )));
        }
        let key = self
            .shared
            .keys()
            .key(&proposer)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        envelope.verify(key).map_err(|_| {
            Error::Protocol("invalid init signature".to_owned())
        })?;
        if init.group_digest != self.shared.group_digest() {
            return Err(Error::Protocol(
                "init group digest mismatch".to_owned(),
            ));
        }
        Ok(())
    }

    async fn on_enlist(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ServerState::WaitingForServers => {
                Ok(Step::Store(envelope))
            }
            ServerState::Init => {
                let SessionMessage::Enlist(enlist) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed enlist".to_owned(),
                    ));
                };
                if enlist.peer_id != *from
                    || !self.shared.is_server(from)
                {
                    return Err(Error::Protocol(format!(
                        "enlist from unexpected sender {}",
                        from
                    )));
                }
                let key = self
                    .shared
                    .keys()
                    .key(from)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                envelope.verify(key).map_err(|_| {
                    Error::Protocol(format!(
                        "invalid enlist signature from {}",
                        from
                    ))
                })?;
                let Some((_, our_init)) = &self.init else {
                    return Err(Error::NoActiveRound);
                };
                if enlist.init != *our_init {
                    return Err(Error::Protocol(format!(
                        "enlist for a different init from {}",
                        from
                    )));
                }
                if let Some(existing) = self.enlists.get(from) {
                    if *existing == envelope {
                        return Ok(Step::Stay);
                    }
                    // a second, different enlist for the same
                    // init violates the protocol
                    return Err(Error::Protocol(format!(
                        "conflicting enlist from {}",
                        from
                    )));
                }
                self.enlists.insert(*from, envelope);
                match self.check_enlists_complete().await? {
                    Some(state) => Ok(Step::Next(state)),
                    None => Ok(Step::Stay),
                }
            }
            _ => {
                tracing::debug!(
                    from = %from,
                    "dropping enlist outside bootstrap"
                );
                Ok(Step::Stay)
            }
        }
    }

    async fn on_enlist_set(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ServerState::WaitingForServers => {
                Ok(Step::Store(envelope))
            }
            ServerState::Enlist => {
                let proposer = self
                    .shared
                    .proposer()
                    .ok_or(Error::NoActiveRound)?;
                if *from != proposer {
                    return Err(Error::Protocol(format!(
                        "enlist set from non-proposer {}",
                        from
                    )));
                }
                let key = self
                    .shared
                    .keys()
                    .key(&proposer)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                envelope.verify(key).map_err(|_| {
                    Error::Protocol(
                        "invalid enlist set signature".to_owned(),
                    )
                })?;
                let SessionMessage::EnlistSet(set) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed enlist set".to_owned(),
                    ));
                };

                let servers = self.shared.server_ids();
                if set.enlists.len() != servers.len() {
                    return Err(Error::Protocol(format!(
                        "enlist set has {} entries, expected {}",
                        set.enlists.len(),
                        servers.len()
                    )));
                }

                let mut by_id: BTreeMap<PeerId, Envelope> =
                    BTreeMap::new();
                for entry in &set.enlists {
                    let SessionMessage::Enlist(enlist) =
                        entry.open().await?
                    else {
                        return Err(Error::Protocol(
                            "enlist set entry is not an enlist"
                                .to_owned(),
                        ));
                    };
                    if !self.shared.is_server(&enlist.peer_id) {
                        return Err(Error::Protocol(format!(
                            "enlist set entry from non-server {}",
                            enlist.peer_id
                        )));
                    }
                    let key = self
                        .shared
                        .keys()
                        .key(&enlist.peer_id)
                        .map_err(|e| {
                            Error::Protocol(e.to_string())
                        })?;
                    entry.verify(key).map_err(|_| {
                        Error::Protocol(format!(
                            "invalid enlist signature from {}",
                            enlist.peer_id
                        ))
                    })?;
                    // every entry must answer the same init
                    let SessionMessage::Init(init) =
                        enlist.init.open().await?
                    else {
                        return Err(Error::Protocol(
                            "enlist embeds a non-init".to_owned(),
                        ));
                    };
                    self.check_init(
                        &proposer,
                        &init,
                        &enlist.init,
                    )?;
                    if let Some((_, ours)) = &self.init {
                        if enlist.init != *ours {
                            return Err(Error::Protocol(
                                "enlist set for a different init"
                                    .to_owned(),
                            ));
                        }
                    }
                    by_id.insert(enlist.peer_id, entry.clone());
                }
                if by_id.len() != servers.len() {
                    return Err(Error::Protocol(
                        "enlist set is missing servers".to_owned(),
                    ));
                }
                if let Some(mine) = &self.my_enlist {
                    let local = self.shared.local_id();
                    if by_id.get(&local) != Some(mine) {
                        return Err(Error::Protocol(
                            "enlist set replaces our enlistment"
                                .to_owned(),
                        ));
                    }
                }
                self.enlists = by_id;
                match self.check_enlists_complete().await? {
                    Some(state) => Ok(Step::Next(state)),
                    None => Ok(Step::Stay),
                }
            }
            _ => {
                tracing::debug!(
                    from = %from,
                    "dropping duplicate enlist set"
                );
                Ok(Step::Stay)
            }
        }
    }

    async fn on_agree(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ServerState::WaitingForServers
            | ServerState::Init
            | ServerState::Enlist => Ok(Step::Store(envelope)),
            ServerState::Agree => {
                let SessionMessage::Agree(agree) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed agree".to_owned(),
                    ));
                };
                if agree.peer_id != *from {
                    return Err(Error::Protocol(format!(
                        "agree sender mismatch from {}",
                        from
                    )));
                }
                // membership and signature first; then the
                // round id decides between accept and abort
                self.shared.check_agree(
                    &agree,
                    &envelope,
                    &agree.round_id,
                )?;
                let expected = self
                    .shared
                    .round_id()
                    .ok_or(Error::NoActiveRound)?;
                if agree.round_id != expected {
                    tracing::error!(
                        from = %from,
                        ours = %expected,
                        theirs = %agree.round_id,
                        "round id disagreement"
                    );
                    return Ok(Step::Restart {
                        announce: Some((
                            true,
                            "roundid mismatch".to_owned(),
                        )),
                    });
                }
                if let Some(existing) = self.agrees.get(from) {
                    if existing.envelope == envelope {
                        return Ok(Step::Stay);
                    }
                    return Err(Error::Protocol(format!(
                        "conflicting agree from {}",
                        from
                    )));
                }
                self.agrees.insert(
                    *from,
                    AgreeEntry { agree, envelope },
                );
                match self.check_agrees_complete().await? {
                    Some(state) => Ok(Step::Next(state)),
                    None => Ok(Step::Stay),
                }
            }
            _ => {
                tracing::debug!(
                    from = %from,
                    "dropping duplicate agree"
                );
                Ok(Step::Stay)
            }
        }
    }

    async fn on_register(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        let SessionMessage::Register(register) =
            envelope.open().await?
        else {
            return Err(Error::Protocol(
                "malformed register".to_owned(),
            ));
        };
        if register.peer_id != *from {
            return Err(Error::Protocol(format!(
                "register sender mismatch from {}",
                from
            )));
        }

        if self.state != ServerState::Queuing {
            // early arrivals wait for the window; late arrivals
            // are deferred to the next cycle
            return Ok(Step::Store(envelope));
        }

        if register.round_id.is_zero() {
            // queue request: answer with the agreed server set
            self.shared.check_register(
                &register,
                &envelope,
                &RoundId::ZERO,
            )?;
            return self
                .reply_queued(from, register.optional.clone())
                .await;
        }

        let expected = self
            .shared
            .round_id()
            .ok_or(Error::NoActiveRound)?;
        if register.round_id != expected {
            // a registration deferred from an earlier cycle: the
            // signature still authenticates the client, so pull
            // it into this round by answering with the current
            // agree set instead of discarding it
            self.shared.check_register(
                &register,
                &envelope,
                &register.round_id,
            )?;
            tracing::debug!(
                from = %from,
                round = %register.round_id,
                "re-queueing registration from an earlier round"
            );
            return self.reply_queued(from, Vec::new()).await;
        }
        self.shared.check_register(
            &register,
            &envelope,
            &expected,
        )?;
        if self.registered.contains_key(from) {
            tracing::debug!(
                from = %from,
                "dropping duplicate registration"
            );
            return Ok(Step::Stay);
        }
        self.registered.insert(
            *from,
            RegisterEntry { register, envelope },
        );
        tracing::debug!(
            from = %from,
            count = self.registered.len(),
            "client registered"
        );

        if let Some(min) = self.shared.config().min_clients {
            if self.registered.len() >= min {
                // enough clients; close the window early
                return Ok(Step::Next(
                    ServerState::ListExchange,
                ));
            }
        }
        Ok(Step::Stay)
    }

    /// Answer a queue request with the agreed server set, echoing
    /// the requester's nonce.
    async fn reply_queued(
        &mut self,
        to: &PeerId,
        nonce: Vec<u8>,
    ) -> Result<Step> {
        let queued = Queued {
            agrees: self
                .shared
                .servers()
                .iter()
                .map(|entry| entry.envelope.clone())
                .collect(),
            nonce,
        };
        let reply = self
            .shared
            .seal(&SessionMessage::Queued(queued))
            .await?;
        self.shared.send_envelope(to, &reply).await?;
        Ok(Step::Stay)
    }

    async fn on_list(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ServerState::Communicating => {
                tracing::debug!(
                    from = %from,
                    "dropping duplicate list"
                );
                Ok(Step::Stay)
            }
            ServerState::ListExchange => {
                if !self.shared.is_server(from) {
                    return Err(Error::Protocol(format!(
                        "list from non-server {}",
                        from
                    )));
                }
                let key = self
                    .shared
                    .keys()
                    .key(from)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                envelope.verify(key).map_err(|_| {
                    Error::Protocol(format!(
                        "invalid list signature from {}",
                        from
                    ))
                })?;
                let SessionMessage::List(list) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed list".to_owned(),
                    ));
                };
                let expected = self
                    .shared
                    .round_id()
                    .ok_or(Error::NoActiveRound)?;
                for entry in &list.registers {
                    let SessionMessage::Register(register) =
                        entry.open().await?
                    else {
                        return Err(Error::Protocol(
                            "list entry is not a register"
                                .to_owned(),
                        ));
                    };
                    self.shared.check_register(
                        &register, entry, &expected,
                    )?;
                }
                if let Some(existing) = self.lists.get(from) {
                    if existing.registers == list.registers {
                        return Ok(Step::Stay);
                    }
                    return Err(Error::Protocol(format!(
                        "conflicting list from {}",
                        from
                    )));
                }
                self.lists.insert(*from, list);
                match self.check_lists_complete().await? {
                    Some(state) => Ok(Step::Next(state)),
                    None => Ok(Step::Stay),
                }
            }
            // a server that closed its window before ours
            _ => Ok(Step::Store(envelope)),
        }
    }

    async fn on_verify_list(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<Step> {
        match self.state {
            ServerState::Communicating => {
                tracing::debug!(
                    from = %from,
                    "dropping duplicate verify list"
                );
                Ok(Step::Stay)
            }
            ServerState::VerifyList => {
                if !self.shared.is_server(from) {
                    return Err(Error::Protocol(format!(
                        "verify list from non-server {}",
                        from
                    )));
                }
                let key = self
                    .shared
                    .keys()
                    .key(from)
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                envelope.verify(key).map_err(|_| {
                    Error::Protocol(format!(
                        "invalid verify list signature from {}",
                        from
                    ))
                })?;
                let SessionMessage::VerifyList(verify) =
                    envelope.open().await?
                else {
                    return Err(Error::Protocol(
                        "malformed verify list".to_owned(),
                    ));
                };
                let ours = self
                    .roster_digest
                    .ok_or(Error::NoActiveRound)?;
                if verify.roster_digest != ours {
                    tracing::error!(
                        from = %from,
                        "client roster disagreement"
                    );
                    return Ok(Step::Restart {
                        announce: Some((
                            true,
                            "roster mismatch".to_owned(),
                        )),
                    });
                }
                if let Some(existing) = self.verifies.get(from) {
                    if *existing == envelope {
                        return Ok(Step::Stay);
                    }
                    return Err(Error::Protocol(format!(
                        "conflicting verify list from {}",
                        from
                    )));
                }
                self.verifies.insert(*from, envelope);
                match self.check_verifies_complete()? {
                    Some(state) => Ok(Step::Next(state)),
                    None => Ok(Step::Stay),
                }
            }
            _ => Ok(Step::Store(envelope)),
        }
    }
}
