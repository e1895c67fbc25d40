//! Pluggable anonymity round abstraction.
//!
//! A round is one execution of the anonymity primitive: it takes
//! per-member inputs and emits at most one cleartext per
//! authorized slot. The session never observes a round's internal
//! algorithm, only this interface.
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use veil_protocol::{PeerId, RoundId};

use crate::{Error, Result};

/// Callback used by rounds to draw pending application data.
///
/// Must not block; returns up to the requested number of bytes
/// and whether more remain.
pub type FetchData =
    Arc<dyn Fn(usize) -> (Vec<u8>, bool) + Send + Sync>;

/// Construction context handed to round factories.
#[derive(Clone)]
pub struct RoundContext {
    /// Identifier of the round being created.
    pub round_id: RoundId,
    /// The local participant.
    pub local_id: PeerId,
    /// Server members in canonical order.
    pub servers: Vec<PeerId>,
    /// Client members in canonical order.
    pub clients: Vec<PeerId>,
    /// Source of pending application data.
    pub fetch: FetchData,
}

impl RoundContext {
    /// All round members: servers first, then clients, canonical
    /// order within each set.
    pub fn members(&self) -> Vec<PeerId> {
        let mut members = self.servers.clone();
        members.extend(self.clients.iter().copied());
        members
    }

    /// Whether an id belongs to this round's membership.
    pub fn is_member(&self, id: &PeerId) -> bool {
        self.servers.contains(id) || self.clients.contains(id)
    }
}

/// Transport capability handed to a round for its packet traffic.
///
/// Packets are wrapped in session data envelopes signed with the
/// sender's ephemeral round key before they reach the overlay.
#[async_trait]
pub trait RoundTransport: Send {
    /// Send a round packet to a single member.
    async fn send(
        &mut self,
        to: &PeerId,
        packet: Vec<u8>,
    ) -> Result<()>;

    /// Broadcast a round packet to every other member.
    async fn broadcast(&mut self, packet: Vec<u8>) -> Result<()>;
}

/// Terminal outcome of a round.
#[derive(Debug, Default, Clone)]
pub struct RoundOutcome {
    /// Whether the exchange completed successfully.
    pub successful: bool,
    /// Delivered cleartexts, one per authorized slot.
    pub outputs: Vec<SlotOutput>,
    /// Members the round's verification logic identified as
    /// misbehaving.
    pub bad_members: Vec<PeerId>,
}

/// A single slot's cleartext.
#[derive(Debug, Clone)]
pub struct SlotOutput {
    /// Slot owner, or `None` for an anonymous slot.
    pub owner: Option<PeerId>,
    /// Cleartext bytes.
    pub data: Vec<u8>,
}

/// Progress state of a round.
#[derive(Debug, Clone)]
pub enum RoundStatus {
    /// The round is still exchanging packets.
    Running,
    /// The round reached a terminal state.
    Complete(RoundOutcome),
}

/// A single anonymous exchange.
#[async_trait]
pub trait Round: Send {
    /// Begin protocol steps; calls after the first are no-ops.
    async fn start(
        &mut self,
        net: &mut dyn RoundTransport,
    ) -> Result<()>;

    /// Ingest an inbound round packet from a member.
    async fn process_packet(
        &mut self,
        sender: &PeerId,
        packet: &[u8],
        net: &mut dyn RoundTransport,
    ) -> Result<()>;

    /// Mark that the enclosing session wishes to abort at the
    /// next safe point.
    fn set_interrupted(&mut self);

    /// Request graceful termination.
    ///
    /// The round must reach a terminal state within a bounded
    /// amount of further work.
    async fn stop(
        &mut self,
        net: &mut dyn RoundTransport,
    ) -> Result<()>;

    /// Current status.
    fn status(&self) -> RoundStatus;
}

/// Factory for a round variant.
pub type CreateRound =
    Arc<dyn Fn(RoundContext) -> Box<dyn Round> + Send + Sync>;

/// Registry of round constructors keyed by round type.
///
/// The session holds a single handle whose concrete variant is
/// not otherwise observable.
#[derive(Clone)]
pub struct RoundRegistry {
    factories: HashMap<String, CreateRound>,
}

impl RoundRegistry {
    /// Registry with the built-in round types.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("null", {
            Arc::new(|context: RoundContext| {
                Box::new(crate::rounds::NullRound::new(context))
                    as Box<dyn Round>
            })
        });
        registry
    }

    /// Register a constructor under a round type name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: CreateRound,
    ) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct a round of the given type.
    pub fn create(
        &self,
        name: &str,
        context: RoundContext,
    ) -> Result<Box<dyn Round>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| {
                Error::UnknownRoundType(name.to_owned())
            })?;
        Ok(factory(context))
    }
}

impl Default for RoundRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{RoundContext, RoundRegistry};
    use crate::Error;
    use std::sync::Arc;
    use veil_protocol::{PeerId, RoundId};

    fn context() -> RoundContext {
        RoundContext {
            round_id: RoundId::default(),
            local_id: PeerId::new([1u8; 20]),
            servers: vec![PeerId::new([1u8; 20])],
            clients: vec![PeerId::new([2u8; 20])],
            fetch: Arc::new(|_| (Vec::new(), false)),
        }
    }

    #[test]
    fn builtin_null_round() {
        let registry = RoundRegistry::new();
        assert!(registry.create("null", context()).is_ok());
    }

    #[test]
    fn unknown_round_type() {
        let registry = RoundRegistry::new();
        assert!(matches!(
            registry.create("onion", context()),
            Err(Error::UnknownRoundType(_))
        ));
    }

    #[test]
    fn members_are_servers_then_clients() {
        let context = context();
        let members = context.members();
        assert_eq!(2, members.len());
        assert_eq!(context.servers[0], members[0]);
        assert_eq!(context.clients[0], members[1]);
    }
}
