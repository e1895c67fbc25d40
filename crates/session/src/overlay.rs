//! Collaborator interface to the peer overlay.
use async_trait::async_trait;
use veil_protocol::PeerId;

use crate::Result;

/// Narrow view of the overlay a session runs on.
///
/// The overlay knows the fixed server set, tracks live
/// connections and moves opaque buffers between peers. A session
/// registers two topics with it: one for state machine messages
/// and a separate one for round packets. Connection events are
/// delivered to the session from outside through its connect and
/// disconnect hooks.
#[async_trait]
pub trait Overlay: Send {
    /// This peer's identifier.
    fn local_id(&self) -> PeerId;

    /// Configured server identifiers in canonical order.
    fn servers(&self) -> Vec<PeerId>;

    /// Whether an identifier belongs to the server set.
    fn is_server(&self, id: &PeerId) -> bool {
        self.servers().contains(id)
    }

    /// Peers with a live connection.
    fn connected(&self) -> Vec<PeerId>;

    /// Whether a peer currently has a live connection.
    fn is_connected(&self, id: &PeerId) -> bool {
        self.connected().contains(id)
    }

    /// Send a payload to a single peer.
    async fn send(
        &mut self,
        to: &PeerId,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<()>;

    /// Broadcast a payload to every connected peer.
    async fn broadcast(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<()>;
}
