//! State shared by the server and client session roles.
use ed25519_dalek::VerifyingKey;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use veil_protocol::{
    digest, verifying_key, Agree, Digest, Envelope, Keypair,
    KeyShare, PeerId, Register, RoundId, SessionData,
    SessionMessage, Stop, ROUND_TOPIC, SESSION_TOPIC,
};

use crate::{
    event_channel, DataQueue, Error, EventReceiver, EventSender,
    FetchData, MessageLog, Overlay, OutputSink, Result, Round,
    RoundContext, RoundOutcome, RoundRegistry, RoundStatus,
    RoundTransport, SessionConfig, SessionEvent,
};

/// Time source capability.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Timer classes a session can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Client registration window.
    RegistrationWindow,
    /// Round lifetime bound.
    RoundLifetime,
    /// Client wait on its active server.
    Response,
}

/// A verified server roster entry: the parsed Agree plus its
/// envelope, whose exact bytes the roster serialization fixes.
#[derive(Debug, Clone)]
pub struct AgreeEntry {
    /// Parsed agreement.
    pub agree: Agree,
    /// The signed envelope it arrived in.
    pub envelope: Envelope,
}

/// A verified client roster entry.
#[derive(Debug, Clone)]
pub struct RegisterEntry {
    /// Parsed registration.
    pub register: Register,
    /// The signed envelope it arrived in.
    pub envelope: Envelope,
}

/// Capabilities and configuration used to build a session.
pub struct SessionOptions {
    /// Long-term signing keypair.
    pub keypair: Keypair,
    /// Long-term verifying keys of the whole group.
    pub keys: KeyShare,
    /// Timing and queue policy.
    pub config: SessionConfig,
    /// Round constructors.
    pub registry: RoundRegistry,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Consumer of round cleartexts.
    pub sink: Box<dyn OutputSink>,
    /// Optional message history log.
    pub message_log: Option<MessageLog>,
}

impl SessionOptions {
    /// Options with default configuration, the built-in round
    /// registry, the system clock and no sink or log.
    pub fn new(keypair: Keypair, keys: KeyShare) -> Self {
        Self {
            keypair,
            keys,
            config: SessionConfig::default(),
            registry: RoundRegistry::new(),
            clock: Arc::new(SystemClock),
            sink: Box::new(crate::NullSink),
            message_log: None,
        }
    }
}

/// The data common to both session roles: identity and key
/// material, the current round handle and identifier, participant
/// rosters and the outbound data queue.
pub struct SharedSessionState {
    overlay: Box<dyn Overlay>,
    keypair: Keypair,
    keys: KeyShare,
    config: SessionConfig,
    registry: RoundRegistry,
    clock: Arc<dyn Clock>,
    events: EventSender,
    sink: Box<dyn OutputSink>,
    log: Option<MessageLog>,

    ephemeral: Option<Keypair>,
    optional_public: Vec<u8>,
    #[allow(dead_code)]
    optional_private: Vec<u8>,

    round: Option<Box<dyn Round>>,
    round_id: Option<RoundId>,
    round_members: Vec<PeerId>,
    ephemeral_keys: HashMap<PeerId, VerifyingKey>,

    servers: Vec<AgreeEntry>,
    servers_bytes: Vec<u8>,
    clients: Vec<RegisterEntry>,

    queue: Arc<Mutex<DataQueue>>,
}

impl SharedSessionState {
    /// Create shared state over an overlay.
    ///
    /// Fails when the local peer or any configured server is
    /// missing from the key share; that is a configuration error
    /// and is not caught at runtime.
    pub fn new(
        overlay: Box<dyn Overlay>,
        options: SessionOptions,
    ) -> Result<(Self, EventReceiver)> {
        let local = overlay.local_id();
        if overlay.servers().is_empty() {
            return Err(Error::InvalidConfig(
                "server set is empty".to_owned(),
            ));
        }
        if !options.keys.contains(&local) {
            return Err(Error::MissingParticipant(
                local.to_string(),
            ));
        }
        for id in overlay.servers() {
            if !options.keys.contains(&id) {
                return Err(Error::MissingParticipant(
                    id.to_string(),
                ));
            }
        }
        options.config.validate()?;

        let queue_capacity = options.config.queue_capacity;
        let (events, receiver) = event_channel();
        Ok((
            Self {
                overlay,
                keypair: options.keypair,
                keys: options.keys,
                config: options.config,
                registry: options.registry,
                clock: options.clock,
                events,
                sink: options.sink,
                log: options.message_log,
                ephemeral: None,
                optional_public: Vec::new(),
                optional_private: Vec::new(),
                round: None,
                round_id: None,
                round_members: Vec::new(),
                ephemeral_keys: HashMap::new(),
                servers: Vec::new(),
                servers_bytes: Vec::new(),
                clients: Vec::new(),
                queue: Arc::new(Mutex::new(DataQueue::new(
                    queue_capacity,
                ))),
            },
            receiver,
        ))
    }

    /// This peer's identifier.
    pub fn local_id(&self) -> PeerId {
        self.overlay.local_id()
    }

    /// Configured server set in canonical order.
    pub fn server_ids(&self) -> Vec<PeerId> {
        let mut servers = self.overlay.servers();
        servers.sort();
        servers
    }

    /// The proposer: the lowest server id in canonical order.
    pub fn proposer(&self) -> Option<PeerId> {
        self.server_ids().into_iter().next()
    }

    /// Whether an id belongs to the server set.
    pub fn is_server(&self, id: &PeerId) -> bool {
        self.overlay.is_server(id)
    }

    /// Whether an id belongs to the client set.
    ///
    /// Membership is fixed per configuration: a client is any
    /// key share participant that is not a server.
    pub fn is_client(&self, id: &PeerId) -> bool {
        self.keys.contains(id) && !self.is_server(id)
    }

    /// Whether every other configured server has a live
    /// connection.
    pub fn all_servers_connected(&self) -> bool {
        let local = self.local_id();
        self.server_ids()
            .iter()
            .filter(|id| **id != local)
            .all(|id| self.overlay.is_connected(id))
    }

    /// First connected server in canonical order, if any.
    pub fn first_connected_server(&self) -> Option<PeerId> {
        self.server_ids()
            .into_iter()
            .find(|id| self.overlay.is_connected(id))
    }

    /// Digest of the group roster.
    pub fn group_digest(&self) -> Digest {
        let mut data = Vec::new();
        for id in self.server_ids() {
            data.extend_from_slice(id.as_ref());
        }
        digest(&data)
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Time source.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Long-term verifying keys.
    pub fn keys(&self) -> &KeyShare {
        &self.keys
    }

    /// Emit a session event.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Sign a message with the long-term key.
    pub async fn seal(
        &mut self,
        message: &SessionMessage,
    ) -> Result<Envelope> {
        Ok(message.seal(&self.keypair).await?)
    }

    /// Send an envelope to a single peer on the session topic.
    pub async fn send_envelope(
        &mut self,
        to: &PeerId,
        envelope: &Envelope,
    ) -> Result<()> {
        let buffer = envelope.to_bytes().await?;
        self.overlay.send(to, SESSION_TOPIC, buffer).await
    }

    /// Send an envelope to every other configured server.
    pub async fn send_to_servers(
        &mut self,
        envelope: &Envelope,
    ) -> Result<()> {
        let local = self.local_id();
        let buffer = envelope.to_bytes().await?;
        for id in self.server_ids() {
            if id == local {
                continue;
            }
            self.overlay
                .send(&id, SESSION_TOPIC, buffer.clone())
                .await?;
        }
        Ok(())
    }

    /// Broadcast an envelope to every connected peer.
    pub async fn broadcast_envelope(
        &mut self,
        envelope: &Envelope,
    ) -> Result<()> {
        let buffer = envelope.to_bytes().await?;
        self.overlay.broadcast(SESSION_TOPIC, buffer).await
    }

    /// Generate round material for the upcoming round: a fresh
    /// ephemeral signing key and optional round-specific blobs.
    pub fn generate_round_data(&mut self) {
        self.ephemeral = Some(Keypair::generate());
        self.optional_public = Vec::new();
        self.optional_private = Vec::new();
    }

    /// Public component of the ephemeral round key.
    pub fn ephemeral_public(&self) -> Result<Vec<u8>> {
        self.ephemeral
            .as_ref()
            .map(Keypair::public_bytes)
            .ok_or(Error::NoActiveRound)
    }

    /// Public component of the round's optional material.
    pub fn optional_public(&self) -> &[u8] {
        &self.optional_public
    }

    /// The upcoming or current round id.
    pub fn round_id(&self) -> Option<RoundId> {
        self.round_id
    }

    /// Set the upcoming round id.
    pub fn set_round_id(&mut self, round_id: Option<RoundId>) {
        self.round_id = round_id;
    }

    /// The agreed server roster.
    pub fn servers(&self) -> &[AgreeEntry] {
        &self.servers
    }

    /// Canonical byte serialization of the server roster.
    pub fn servers_bytes(&self) -> &[u8] {
        &self.servers_bytes
    }

    /// Fix the server roster and its byte serialization for the
    /// lifetime of the round.
    pub async fn set_servers(
        &mut self,
        entries: Vec<AgreeEntry>,
    ) -> Result<()> {
        let envelopes: Vec<Envelope> = entries
            .iter()
            .map(|entry| entry.envelope.clone())
            .collect();
        self.servers_bytes =
            veil_protocol::encode_envelope_list(&envelopes).await?;
        self.servers = entries;
        Ok(())
    }

    /// The agreed client roster.
    pub fn clients(&self) -> &[RegisterEntry] {
        &self.clients
    }

    /// Set the agreed client roster.
    pub fn set_clients(&mut self, entries: Vec<RegisterEntry>) {
        self.clients = entries;
    }

    /// Verify that an Agree is properly formed: a configured
    /// server, a valid signature under its key share entry and
    /// the expected round id.
    pub fn check_agree(
        &self,
        agree: &Agree,
        envelope: &Envelope,
        round_id: &RoundId,
    ) -> Result<()> {
        if !self.is_server(&agree.peer_id) {
            return Err(Error::Protocol(format!(
                "agree from non-server {}",
                agree.peer_id
            )));
        }
        let key = self
            .keys
            .key(&agree.peer_id)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        envelope.verify(key).map_err(|_| {
            Error::Protocol(format!(
                "invalid agree signature from {}",
                agree.peer_id
            ))
        })?;
        if agree.round_id != *round_id {
            return Err(Error::Protocol(format!(
                "agree round id mismatch from {}",
                agree.peer_id
            )));
        }
        Ok(())
    }

    /// Verify that a Register is properly formed, against the
    /// client set.
    pub fn check_register(
        &self,
        register: &Register,
        envelope: &Envelope,
        round_id: &RoundId,
    ) -> Result<()> {
        if !self.is_client(&register.peer_id) {
            return Err(Error::Protocol(format!(
                "register from non-client {}",
                register.peer_id
            )));
        }
        let key = self
            .keys
            .key(&register.peer_id)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        envelope.verify(key).map_err(|_| {
            Error::Protocol(format!(
                "invalid register signature from {}",
                register.peer_id
            ))
        })?;
        if register.round_id != *round_id {
            return Err(Error::Protocol(format!(
                "register round id mismatch from {}",
                register.peer_id
            )));
        }
        Ok(())
    }

    /// Verify that a Stop is properly formed: signed by a
    /// configured server and addressed to the current round.
    pub fn check_stop(
        &self,
        stop: &Stop,
        envelope: &Envelope,
    ) -> Result<()> {
        if !self.is_server(&stop.peer_id) {
            return Err(Error::Protocol(format!(
                "stop from non-server {}",
                stop.peer_id
            )));
        }
        let key = self
            .keys
            .key(&stop.peer_id)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        envelope.verify(key).map_err(|_| {
            Error::Protocol(format!(
                "invalid stop signature from {}",
                stop.peer_id
            ))
        })?;
        Ok(())
    }

    /// Queue application data for an upcoming round.
    pub fn add_data(&mut self, data: Vec<u8>) -> Result<()> {
        let mut queue =
            self.queue.lock().map_err(|_| Error::QueueFull)?;
        queue.push(data)
    }

    /// Bytes pending in the outbound queue.
    pub fn pending_data(&self) -> usize {
        self.queue
            .lock()
            .map(|queue| queue.pending())
            .unwrap_or_default()
    }

    /// Callback rounds use to draw application data.
    pub fn fetch_callback(&self) -> FetchData {
        let queue = Arc::clone(&self.queue);
        Arc::new(move |max| match queue.lock() {
            Ok(mut queue) => queue.get_data(max),
            Err(_) => (Vec::new(), false),
        })
    }

    /// Whether a round handle currently exists.
    pub fn round_is_active(&self) -> bool {
        self.round.is_some()
    }

    /// Members of the current round.
    pub fn round_members(&self) -> &[PeerId] {
        &self.round_members
    }

    /// Construct the round for the Communicating state and
    /// announce it.
    ///
    /// The roster fed to the round is the agreed server and
    /// client rosters; the ephemeral keys they carry authenticate
    /// session data packets.
    pub fn next_round(&mut self) -> Result<()> {
        let round_id =
            self.round_id.ok_or(Error::NoActiveRound)?;

        let servers: Vec<PeerId> = self
            .servers
            .iter()
            .map(|entry| entry.agree.peer_id)
            .collect();
        let clients: Vec<PeerId> = self
            .clients
            .iter()
            .map(|entry| entry.register.peer_id)
            .collect();

        let mut ephemeral_keys = HashMap::new();
        for entry in &self.servers {
            ephemeral_keys.insert(
                entry.agree.peer_id,
                verifying_key(&entry.agree.ephemeral_key).map_err(
                    |e| Error::Protocol(e.to_string()),
                )?,
            );
        }
        for entry in &self.clients {
            ephemeral_keys.insert(
                entry.register.peer_id,
                verifying_key(&entry.register.ephemeral_key)
                    .map_err(|e| Error::Protocol(e.to_string()))?,
            );
        }

        let context = RoundContext {
            round_id,
            local_id: self.local_id(),
            servers,
            clients,
            fetch: self.fetch_callback(),
        };
        self.round_members = context.members();
        self.ephemeral_keys = ephemeral_keys;

        let round = self
            .registry
            .create(&self.config.round_type, context)?;
        self.round = Some(round);
        self.emit(SessionEvent::RoundStarting { round_id });

        tracing::info!(id = %round_id, "round starting");
        Ok(())
    }

    /// Verify a session data envelope under the sender's
    /// ephemeral round key.
    pub fn verify_session_data(
        &self,
        sender: &PeerId,
        envelope: &Envelope,
    ) -> Result<()> {
        let key =
            self.ephemeral_keys.get(sender).ok_or_else(|| {
                Error::Protocol(format!(
                    "session data from non-member {}",
                    sender
                ))
            })?;
        envelope.verify(key).map_err(|_| {
            Error::Protocol(format!(
                "invalid session data signature from {}",
                sender
            ))
        })
    }

    /// Start the current round.
    pub async fn round_start(&mut self) -> Result<()> {
        let ephemeral = self
            .ephemeral
            .clone()
            .ok_or(Error::NoActiveRound)?;
        let members = self.round_members.clone();
        let local_id = self.overlay.local_id();
        let round =
            self.round.as_mut().ok_or(Error::NoActiveRound)?;
        let mut net = SessionRoundNet {
            overlay: &mut self.overlay,
            ephemeral: &ephemeral,
            members: &members,
            local_id,
        };
        round.start(&mut net).await
    }

    /// Deliver an inbound round packet to the current round.
    pub async fn round_process(
        &mut self,
        sender: &PeerId,
        packet: &[u8],
    ) -> Result<()> {
        let ephemeral = self
            .ephemeral
            .clone()
            .ok_or(Error::NoActiveRound)?;
        let members = self.round_members.clone();
        let local_id = self.overlay.local_id();
        let round =
            self.round.as_mut().ok_or(Error::NoActiveRound)?;
        let mut net = SessionRoundNet {
            overlay: &mut self.overlay,
            ephemeral: &ephemeral,
            members: &members,
            local_id,
        };
        round.process_packet(sender, packet, &mut net).await
    }

    /// Ask the current round to terminate.
    ///
    /// An immediate stop interrupts the round first so it aborts
    /// at the next safe point.
    pub async fn round_stop(
        &mut self,
        immediate: bool,
    ) -> Result<()> {
        let ephemeral = self
            .ephemeral
            .clone()
            .ok_or(Error::NoActiveRound)?;
        let members = self.round_members.clone();
        let local_id = self.overlay.local_id();
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        if immediate {
            round.set_interrupted();
        }
        let mut net = SessionRoundNet {
            overlay: &mut self.overlay,
            ephemeral: &ephemeral,
            members: &members,
            local_id,
        };
        round.stop(&mut net).await
    }

    /// Status of the current round.
    pub fn round_status(&self) -> Option<RoundStatus> {
        self.round.as_ref().map(|round| round.status())
    }

    /// Deliver a completed round's outputs and settle the data
    /// queue: consumed bytes are dropped after success, replayed
    /// after an abort.
    pub fn complete_round(&mut self, outcome: &RoundOutcome) {
        let Some(round_id) = self.round_id else {
            return;
        };
        if outcome.successful {
            for output in &outcome.outputs {
                self.sink.deliver(
                    &round_id,
                    output.owner.as_ref(),
                    &output.data,
                );
            }
        }
        if let Ok(mut queue) = self.queue.lock() {
            if outcome.successful {
                queue.commit();
            } else {
                queue.unget();
            }
        }
        if !outcome.bad_members.is_empty() {
            tracing::warn!(
                id = %round_id,
                bad = ?outcome.bad_members,
                "round reported misbehaving members"
            );
        }
        self.emit(SessionEvent::RoundFinished {
            round_id,
            successful: outcome.successful,
            bad_members: outcome.bad_members.clone(),
        });
    }

    /// Release the round and its material after a Stop.
    pub fn clear_round(&mut self) {
        self.round = None;
        self.round_id = None;
        self.round_members.clear();
        self.ephemeral_keys.clear();
        self.ephemeral = None;
    }

    /// Append a processed message to the history log when one is
    /// configured.
    pub async fn log_message(
        &mut self,
        envelope: &Envelope,
    ) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.append(envelope).await?;
        }
        Ok(())
    }
}

/// Round transport bound to the session's overlay: packets go out
/// on the round topic as session data envelopes signed with the
/// ephemeral round key.
struct SessionRoundNet<'a> {
    overlay: &'a mut Box<dyn Overlay>,
    ephemeral: &'a Keypair,
    members: &'a [PeerId],
    local_id: PeerId,
}

impl SessionRoundNet<'_> {
    async fn packet_buffer(
        &mut self,
        packet: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let envelope =
            SessionMessage::SessionData(SessionData { packet })
                .seal(self.ephemeral)
                .await?;
        Ok(envelope.to_bytes().await?)
    }
}

#[async_trait::async_trait]
impl RoundTransport for SessionRoundNet<'_> {
    async fn send(
        &mut self,
        to: &PeerId,
        packet: Vec<u8>,
    ) -> Result<()> {
        let buffer = self.packet_buffer(packet).await?;
        self.overlay.send(to, ROUND_TOPIC, buffer).await
    }

    async fn broadcast(&mut self, packet: Vec<u8>) -> Result<()> {
        let buffer = self.packet_buffer(packet).await?;
        for member in self.members {
            if *member == self.local_id {
                continue;
            }
            self.overlay
                .send(member, ROUND_TOPIC, buffer.clone())
                .await?;
        }
        Ok(())
    }
}
