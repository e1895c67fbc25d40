//! In-memory overlay and multi-node harness for session
//! scenarios.
//!
//! Deliveries queue in a shared router and are pumped
//! deterministically, so a whole multi-party exchange runs
//! without sockets or timers.
use anyhow::Result;
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc::UnboundedReceiver;

use veil_protocol::{
    Envelope, Keypair, KeyShare, MessageKind, PeerId, RoundId,
    ROUND_TOPIC, SESSION_TOPIC,
};
use veil_session::{
    ChannelSink, ClientSession, ClientState, Clock, EventReceiver,
    Overlay, ServerSession, ServerState, Session, SessionEvent,
    SessionOptions, TimerKind,
};

/// A sink delivery observed by a node.
pub type Output = (RoundId, Option<PeerId>, Vec<u8>);

/// Route tracing output through `RUST_LOG` when diagnosing a
/// scenario.
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Clock the tests advance by hand.
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            millis: AtomicU64::new(start),
        }
    }

    #[allow(dead_code)]
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// One queued overlay delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Message kind of the enclosed envelope.
    pub async fn kind(&self) -> Result<MessageKind> {
        Ok(Envelope::from_bytes(&self.payload).await?.kind)
    }
}

#[derive(Default)]
struct RouterInner {
    servers: Vec<PeerId>,
    connected: HashSet<(PeerId, PeerId)>,
    queue: VecDeque<Delivery>,
}

/// Shared in-memory router: connectivity map plus a delivery
/// queue.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<Mutex<RouterInner>>,
}

impl Router {
    pub fn new(servers: Vec<PeerId>) -> Self {
        let router = Self::default();
        router.inner.lock().unwrap().servers = servers;
        router
    }

    fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn servers(&self) -> Vec<PeerId> {
        self.inner.lock().unwrap().servers.clone()
    }

    pub fn connect(&self, a: PeerId, b: PeerId) {
        self.inner
            .lock()
            .unwrap()
            .connected
            .insert(Self::pair(a, b));
    }

    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        self.inner
            .lock()
            .unwrap()
            .connected
            .remove(&Self::pair(a, b));
    }

    pub fn is_connected(&self, a: PeerId, b: PeerId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .connected
            .contains(&Self::pair(a, b))
    }

    pub fn connected_to(&self, id: PeerId) -> Vec<PeerId> {
        let inner = self.inner.lock().unwrap();
        let mut peers: Vec<PeerId> = inner
            .connected
            .iter()
            .filter_map(|(a, b)| {
                if *a == id {
                    Some(*b)
                } else if *b == id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers
    }

    pub fn push(&self, delivery: Delivery) {
        self.inner.lock().unwrap().queue.push_back(delivery);
    }

    pub fn pop(&self) -> Option<Delivery> {
        self.inner.lock().unwrap().queue.pop_front()
    }
}

/// Overlay view of the router for one node.
pub struct MemoryOverlay {
    local: PeerId,
    router: Router,
}

impl MemoryOverlay {
    pub fn new(local: PeerId, router: Router) -> Self {
        Self { local, router }
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_id(&self) -> PeerId {
        self.local
    }

    fn servers(&self) -> Vec<PeerId> {
        self.router.servers()
    }

    fn connected(&self) -> Vec<PeerId> {
        self.router.connected_to(self.local)
    }

    async fn send(
        &mut self,
        to: &PeerId,
        topic: &str,
        payload: Vec<u8>,
    ) -> veil_session::Result<()> {
        if self.router.is_connected(self.local, *to) {
            self.router.push(Delivery {
                from: self.local,
                to: *to,
                topic: topic.to_owned(),
                payload,
            });
        }
        Ok(())
    }

    async fn broadcast(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> veil_session::Result<()> {
        for peer in self.router.connected_to(self.local) {
            self.router.push(Delivery {
                from: self.local,
                to: peer,
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }
}

/// A session plus its observation channels.
pub struct TestNode {
    pub id: PeerId,
    pub keypair: Keypair,
    pub session: Session,
    pub events: EventReceiver,
    pub output: UnboundedReceiver<Output>,
}

impl TestNode {
    /// Drain the sink deliveries observed so far.
    pub fn outputs(&mut self) -> Vec<Output> {
        let mut outputs = Vec::new();
        while let Ok(output) = self.output.try_recv() {
            outputs.push(output);
        }
        outputs
    }

    /// Drain the session events observed so far.
    pub fn events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn server_state(&self) -> Option<ServerState> {
        match &self.session {
            Session::Server(s) => Some(s.state()),
            Session::Client(_) => None,
        }
    }

    pub fn client_state(&self) -> Option<ClientState> {
        match &self.session {
            Session::Server(_) => None,
            Session::Client(c) => Some(c.state()),
        }
    }

    pub fn round_id(&self) -> Option<RoundId> {
        self.session.round_id()
    }

    pub fn servers_bytes(&self) -> Vec<u8> {
        self.session.shared().servers_bytes().to_vec()
    }
}

fn server_peer_id(index: usize) -> PeerId {
    let mut bytes = [0u8; 20];
    bytes[0] = 1 + index as u8;
    PeerId::new(bytes)
}

fn client_peer_id(index: usize) -> PeerId {
    let mut bytes = [0u8; 20];
    bytes[0] = 100 + index as u8;
    PeerId::new(bytes)
}

/// A configured group of server and client sessions over one
/// router.
pub struct TestNet {
    pub clock: Arc<ManualClock>,
    pub router: Router,
    pub servers: Vec<PeerId>,
    pub clients: Vec<PeerId>,
    pub nodes: BTreeMap<PeerId, TestNode>,
}

impl TestNet {
    /// Build a group of `server_count` servers and `client_count`
    /// clients sharing a key share.
    pub fn new(
        server_count: usize,
        client_count: usize,
    ) -> Result<Self> {
        Self::with_config(server_count, client_count, |_| {})
    }

    /// Build a group with a configuration tweak applied to every
    /// node.
    pub fn with_config(
        server_count: usize,
        client_count: usize,
        configure: impl Fn(&mut veil_session::SessionConfig),
    ) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        let servers: Vec<PeerId> =
            (0..server_count).map(server_peer_id).collect();
        let clients: Vec<PeerId> =
            (0..client_count).map(client_peer_id).collect();
        let router = Router::new(servers.clone());

        let mut keypairs: BTreeMap<PeerId, Keypair> =
            BTreeMap::new();
        for id in servers.iter().chain(clients.iter()) {
            keypairs.insert(*id, Keypair::generate());
        }
        let keys = KeyShare::new(
            keypairs
                .iter()
                .map(|(id, kp)| (*id, kp.verifying_key())),
        );

        let mut nodes = BTreeMap::new();
        for id in servers.iter().chain(clients.iter()) {
            let keypair = keypairs
                .get(id)
                .expect("keypair for every node")
                .clone();
            let (sink, output) = ChannelSink::new();
            let mut options =
                SessionOptions::new(keypair.clone(), keys.clone());
            options.clock = clock.clone();
            options.sink = Box::new(sink);
            configure(&mut options.config);

            let overlay = Box::new(MemoryOverlay::new(
                *id,
                router.clone(),
            ));
            let (session, events) = if servers.contains(id) {
                let (session, events) =
                    ServerSession::new(overlay, options)?;
                (Session::Server(session), events)
            } else {
                let (session, events) =
                    ClientSession::new(overlay, options)?;
                (Session::Client(session), events)
            };

            nodes.insert(
                *id,
                TestNode {
                    id: *id,
                    keypair,
                    session,
                    events,
                    output,
                },
            );
        }

        Ok(Self {
            clock,
            router,
            servers,
            clients,
            nodes,
        })
    }

    pub fn node(&mut self, id: PeerId) -> &mut TestNode {
        self.nodes.get_mut(&id).expect("node exists")
    }

    /// Establish a connection and notify both endpoints.
    pub async fn connect(
        &mut self,
        a: PeerId,
        b: PeerId,
    ) -> Result<()> {
        self.router.connect(a, b);
        self.node(a).session.handle_connect(&b).await?;
        self.node(b).session.handle_connect(&a).await?;
        Ok(())
    }

    /// Drop a connection and notify both endpoints.
    pub async fn disconnect(
        &mut self,
        a: PeerId,
        b: PeerId,
    ) -> Result<()> {
        self.router.disconnect(a, b);
        self.node(a).session.handle_disconnect(&b).await?;
        self.node(b).session.handle_disconnect(&a).await?;
        Ok(())
    }

    /// Fully connect servers to each other and clients to every
    /// server.
    pub async fn connect_all(&mut self) -> Result<()> {
        let servers = self.servers.clone();
        let clients = self.clients.clone();
        for (i, a) in servers.iter().enumerate() {
            for b in servers.iter().skip(i + 1) {
                self.connect(*a, *b).await?;
            }
        }
        for client in &clients {
            for server in &servers {
                self.connect(*client, *server).await?;
            }
        }
        Ok(())
    }

    pub async fn start_all(&mut self) -> Result<()> {
        for node in self.nodes.values_mut() {
            node.session.start().await?;
        }
        Ok(())
    }

    /// Deliver one message if its link is still up and it rides
    /// a topic the sessions registered.
    pub async fn deliver(
        &mut self,
        delivery: Delivery,
    ) -> Result<()> {
        if !self
            .router
            .is_connected(delivery.from, delivery.to)
        {
            return Ok(());
        }
        if delivery.topic != SESSION_TOPIC
            && delivery.topic != ROUND_TOPIC
        {
            return Ok(());
        }
        let envelope =
            Envelope::from_bytes(&delivery.payload).await?;
        self.node(delivery.to)
            .session
            .handle_message(&delivery.from, envelope)
            .await?;
        Ok(())
    }

    /// Pump queued deliveries until the router is idle.
    pub async fn pump(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(delivery) = self.router.pop() {
            self.deliver(delivery).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Pump while delivering every message twice.
    pub async fn pump_duplicated(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(delivery) = self.router.pop() {
            self.deliver(delivery.clone()).await?;
            self.deliver(delivery).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Take all queued deliveries for manual routing.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Some(delivery) = self.router.pop() {
            deliveries.push(delivery);
        }
        deliveries
    }

    /// Fire a timer on one node.
    pub async fn timeout(
        &mut self,
        id: PeerId,
        kind: TimerKind,
    ) -> Result<()> {
        self.node(id).session.handle_timeout(kind).await?;
        Ok(())
    }

    /// Close the registration window on every server.
    pub async fn close_windows(&mut self) -> Result<()> {
        let servers = self.servers.clone();
        for id in servers {
            self.timeout(id, TimerKind::RegistrationWindow)
                .await?;
        }
        Ok(())
    }

    /// Assert that every server is in the given state.
    pub fn assert_server_states(&self, expected: ServerState) {
        for id in &self.servers {
            let node =
                self.nodes.get(id).expect("server node exists");
            assert_eq!(
                Some(expected),
                node.server_state(),
                "server {} state",
                id
            );
        }
    }

    /// The round ids every server currently holds.
    pub fn server_round_ids(&self) -> Vec<Option<RoundId>> {
        self.servers
            .iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .expect("server node exists")
                    .round_id()
            })
            .collect()
    }
}
