//! Session dispatch and connection tracking.
//!
//! A session registers two overlay topics: one for state machine
//! messages and one for round packets. Inbound buffers on either
//! are parsed into envelopes and delivered to the session that
//! owns them; connection events are fanned out to every session.
use std::collections::HashMap;

use veil_protocol::{
    Digest, Envelope, PeerId, RoundId, ROUND_TOPIC, SESSION_TOPIC,
};

use crate::{
    ClientSession, ClientState, Error, Result, ServerSession,
    ServerState, SharedSessionState, TimerKind,
};

/// A session in either role.
pub enum Session {
    /// Server role.
    Server(ServerSession),
    /// Client role.
    Client(ClientSession),
}

impl Session {
    /// Begin the session.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::Server(s) => s.start().await,
            Self::Client(s) => s.start().await,
        }
    }

    /// Deliver an inbound session message.
    pub async fn handle_message(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<()> {
        match self {
            Self::Server(s) => s.handle_message(from, envelope).await,
            Self::Client(s) => s.handle_message(from, envelope).await,
        }
    }

    /// A connection to a peer was established.
    pub async fn handle_connect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        match self {
            Self::Server(s) => s.handle_connect(peer).await,
            Self::Client(s) => s.handle_connect(peer).await,
        }
    }

    /// A connection to a peer was lost.
    pub async fn handle_disconnect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        match self {
            Self::Server(s) => s.handle_disconnect(peer).await,
            Self::Client(s) => s.handle_disconnect(peer).await,
        }
    }

    /// An armed timer fired.
    pub async fn handle_timeout(
        &mut self,
        kind: TimerKind,
    ) -> Result<()> {
        match self {
            Self::Server(s) => s.handle_timeout(kind).await,
            Self::Client(s) => s.handle_timeout(kind).await,
        }
    }

    /// Queue application data for an upcoming round.
    pub fn send(&mut self, data: Vec<u8>) -> Result<()> {
        match self {
            Self::Server(s) => s.send(data),
            Self::Client(s) => s.send(data),
        }
    }

    /// Next armed deadline, milliseconds since the epoch.
    pub fn deadline(&self) -> Option<(TimerKind, u64)> {
        match self {
            Self::Server(s) => s.deadline(),
            Self::Client(s) => s.deadline(),
        }
    }

    /// Read access to the shared session state.
    pub fn shared(&self) -> &SharedSessionState {
        match self {
            Self::Server(s) => s.shared(),
            Self::Client(s) => s.shared(),
        }
    }

    /// The upcoming or current round id.
    pub fn round_id(&self) -> Option<RoundId> {
        self.shared().round_id()
    }

    /// Stable key for this session: the group roster digest.
    pub fn session_key(&self) -> Digest {
        self.shared().group_digest()
    }

    /// Whether this session is in its Communicating state.
    pub fn is_communicating(&self) -> bool {
        match self {
            Self::Server(s) => {
                s.state() == ServerState::Communicating
            }
            Self::Client(s) => {
                s.state() == ClientState::Communicating
            }
        }
    }
}

/// Routes inbound session traffic to the sessions that own it.
///
/// In the common deployment there is exactly one session; the
/// first one registered is the default target for inbound
/// traffic.
#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<Digest, Session>,
    default: Option<Digest>,
}

impl SessionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a session, returning its key.
    ///
    /// The first session registered becomes the default.
    pub fn insert(&mut self, session: Session) -> Digest {
        let key = session.session_key();
        self.sessions.insert(key, session);
        if self.default.is_none() {
            self.default = Some(key);
        }
        key
    }

    /// Make a session the default inbound target.
    pub fn set_default(&mut self, key: Digest) {
        if self.sessions.contains_key(&key) {
            self.default = Some(key);
        }
    }

    /// Get a session by key.
    pub fn get_mut(
        &mut self,
        key: &Digest,
    ) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    /// The default session.
    pub fn default_session_mut(
        &mut self,
    ) -> Option<&mut Session> {
        let key = self.default?;
        self.sessions.get_mut(&key)
    }

    /// Start every registered session.
    pub async fn start_all(&mut self) -> Result<()> {
        for session in self.sessions.values_mut() {
            session.start().await?;
        }
        Ok(())
    }

    /// Decode an inbound buffer from one of the session's topics
    /// and deliver it to the default session.
    ///
    /// Buffers on unregistered topics are dropped.
    pub async fn dispatch(
        &mut self,
        from: &PeerId,
        topic: &str,
        buffer: &[u8],
    ) -> Result<()> {
        if topic != SESSION_TOPIC && topic != ROUND_TOPIC {
            tracing::debug!(
                from = %from,
                topic,
                "dropping buffer on unknown topic"
            );
            return Ok(());
        }
        let envelope = Envelope::from_bytes(buffer).await?;
        let session =
            self.default_session_mut().ok_or_else(|| {
                Error::Protocol(
                    "no session registered".to_owned(),
                )
            })?;
        session.handle_message(from, envelope).await
    }

    /// Fan a new connection out to every session.
    pub async fn handle_connect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        for session in self.sessions.values_mut() {
            session.handle_connect(peer).await?;
        }
        Ok(())
    }

    /// Fan a lost connection out to every session.
    pub async fn handle_disconnect(
        &mut self,
        peer: &PeerId,
    ) -> Result<()> {
        for session in self.sessions.values_mut() {
            session.handle_disconnect(peer).await?;
        }
        Ok(())
    }

    /// Fire a timer for one session.
    pub async fn handle_timeout(
        &mut self,
        key: &Digest,
        kind: TimerKind,
    ) -> Result<()> {
        if let Some(session) = self.sessions.get_mut(key) {
            session.handle_timeout(kind).await?;
        }
        Ok(())
    }

    /// The earliest armed deadline across all sessions.
    pub fn next_deadline(
        &self,
    ) -> Option<(Digest, TimerKind, u64)> {
        self.sessions
            .iter()
            .filter_map(|(key, session)| {
                session
                    .deadline()
                    .map(|(kind, at)| (*key, kind, at))
            })
            .min_by_key(|(_, _, at)| *at)
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionManager};
    use crate::{
        Overlay, ServerSession, ServerState, SessionOptions,
        TimerKind,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use veil_protocol::{
        Keypair, KeyShare, PeerId, Queued, SessionMessage,
    };

    struct LoopbackOverlay {
        local: PeerId,
    }

    #[async_trait]
    impl Overlay for LoopbackOverlay {
        fn local_id(&self) -> PeerId {
            self.local
        }

        fn servers(&self) -> Vec<PeerId> {
            vec![self.local]
        }

        fn connected(&self) -> Vec<PeerId> {
            Vec::new()
        }

        async fn send(
            &mut self,
            _to: &PeerId,
            _topic: &str,
            _payload: Vec<u8>,
        ) -> crate::Result<()> {
            Ok(())
        }

        async fn broadcast(
            &mut self,
            _topic: &str,
            _payload: Vec<u8>,
        ) -> crate::Result<()> {
            Ok(())
        }
    }

    fn lone_server() -> Result<(Session, Keypair, PeerId)> {
        let keypair = Keypair::generate();
        let id = PeerId::from_public_key(keypair.public_bytes());
        let keys =
            KeyShare::new([(id, keypair.verifying_key())]);
        let overlay = Box::new(LoopbackOverlay { local: id });
        let (session, _events) = ServerSession::new(
            overlay,
            SessionOptions::new(keypair.clone(), keys),
        )?;
        Ok((Session::Server(session), keypair, id))
    }

    #[tokio::test]
    async fn routes_inbound_buffers_to_the_default_session(
    ) -> Result<()> {
        let (session, keypair, id) = lone_server()?;
        let mut manager = SessionManager::new();
        let key = manager.insert(session);
        manager.start_all().await?;

        // the registration window is armed
        let (deadline_key, kind, _at) =
            manager.next_deadline().expect("armed deadline");
        assert_eq!(key, deadline_key);
        assert_eq!(TimerKind::RegistrationWindow, kind);

        // a client-bound message routed at a server is parsed
        // and quietly dropped
        let stray = SessionMessage::Queued(Queued::default())
            .seal(&keypair)
            .await?;
        let buffer = stray.to_bytes().await?;
        manager
            .dispatch(
                &id,
                veil_protocol::SESSION_TOPIC,
                &buffer,
            )
            .await?;

        // buffers on unregistered topics never reach a session
        manager.dispatch(&id, "gossip", &buffer).await?;

        let session =
            manager.get_mut(&key).expect("session registered");
        assert!(matches!(
            session,
            Session::Server(s)
                if s.state() == ServerState::Queuing
        ));
        Ok(())
    }
}
