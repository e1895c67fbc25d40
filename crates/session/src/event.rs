//! Typed session events and the application data sink.
//!
//! Failures and lifecycle notifications travel on the event
//! channel; round cleartexts go to the output sink. The two are
//! never interleaved.
use tokio::sync::mpsc;
use veil_protocol::{PeerId, RoundId};

/// Events dispatched by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new round is being prepared.
    RoundStarting {
        /// Identifier of the upcoming round.
        round_id: RoundId,
    },

    /// The current round reached a terminal state.
    RoundFinished {
        /// Identifier of the finished round.
        round_id: RoundId,
        /// Whether the exchange completed successfully.
        successful: bool,
        /// Members the round identified as misbehaving.
        ///
        /// Report only; membership is never altered here.
        bad_members: Vec<PeerId>,
    },

    /// The session is tearing down the current round.
    Stopping {
        /// Identifier of the round being stopped.
        round_id: RoundId,
        /// Whether the stop takes effect immediately.
        immediate: bool,
        /// Why the round is stopping.
        reason: String,
    },

    /// A message failed verification and was discarded.
    ProtocolViolation {
        /// The claimed sender of the offending message.
        peer: PeerId,
        /// What the verification found.
        reason: String,
    },
}

/// Sending half of a session event channel.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiving half of a session event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create a session event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Push-style consumer of authorized round cleartexts.
///
/// Called from the session's execution context, one call per
/// cleartext.
pub trait OutputSink: Send {
    /// Deliver one cleartext.
    ///
    /// An owner of `None` marks an anonymous slot.
    fn deliver(
        &mut self,
        round_id: &RoundId,
        owner: Option<&PeerId>,
        payload: &[u8],
    );
}

/// Sink that discards every cleartext.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn deliver(
        &mut self,
        _round_id: &RoundId,
        _owner: Option<&PeerId>,
        _payload: &[u8],
    ) {
    }
}

/// Sink that forwards cleartexts over an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(RoundId, Option<PeerId>, Vec<u8>)>,
}

impl ChannelSink {
    /// Create a channel sink and its receiving half.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(RoundId, Option<PeerId>, Vec<u8>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn deliver(
        &mut self,
        round_id: &RoundId,
        owner: Option<&PeerId>,
        payload: &[u8],
    ) {
        let _ = self.tx.send((
            *round_id,
            owner.copied(),
            payload.to_vec(),
        ));
    }
}
