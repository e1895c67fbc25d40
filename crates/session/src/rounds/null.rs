//! A round with no anonymization.
//!
//! Every member broadcasts its pending payload in the clear and
//! the exchange completes once one packet per member has arrived.
//! Useful for wiring tests and as a baseline; it provides no
//! anonymity whatsoever.
use async_trait::async_trait;
use std::collections::BTreeMap;
use veil_protocol::PeerId;

use crate::{
    Error, Result, Round, RoundContext, RoundOutcome, RoundStatus,
    RoundTransport, SlotOutput,
};

/// Trivial round: one cleartext broadcast slot per member.
pub struct NullRound {
    context: RoundContext,
    started: bool,
    interrupted: bool,
    received: BTreeMap<PeerId, Vec<u8>>,
    outcome: Option<RoundOutcome>,
}

impl NullRound {
    /// Maximum bytes a member transmits per exchange.
    pub const SLOT_CAPACITY: usize = 65535;

    /// Create a null round for the given membership.
    pub fn new(context: RoundContext) -> Self {
        Self {
            context,
            started: false,
            interrupted: false,
            received: BTreeMap::new(),
            outcome: None,
        }
    }

    fn check_complete(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        let members = self.context.members();
        if self.received.len() < members.len() {
            return;
        }
        let outputs = members
            .iter()
            .filter_map(|id| {
                let data = self.received.get(id)?;
                if data.is_empty() {
                    return None;
                }
                Some(SlotOutput {
                    owner: Some(*id),
                    data: data.clone(),
                })
            })
            .collect();
        self.outcome = Some(RoundOutcome {
            successful: !self.interrupted,
            outputs,
            bad_members: Vec::new(),
        });
    }
}

#[async_trait]
impl Round for NullRound {
    async fn start(
        &mut self,
        net: &mut dyn RoundTransport,
    ) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let (data, _more) =
            (self.context.fetch)(Self::SLOT_CAPACITY);
        self.received.insert(self.context.local_id, data.clone());
        net.broadcast(data).await?;
        self.check_complete();
        Ok(())
    }

    async fn process_packet(
        &mut self,
        sender: &PeerId,
        packet: &[u8],
        _net: &mut dyn RoundTransport,
    ) -> Result<()> {
        if !self.context.is_member(sender) {
            return Err(Error::Protocol(format!(
                "round packet from non-member {}",
                sender
            )));
        }
        // Duplicate packets are tolerated; the first wins.
        self.received
            .entry(*sender)
            .or_insert_with(|| packet.to_vec());
        self.check_complete();
        Ok(())
    }

    fn set_interrupted(&mut self) {
        self.interrupted = true;
    }

    async fn stop(
        &mut self,
        _net: &mut dyn RoundTransport,
    ) -> Result<()> {
        if self.outcome.is_none() {
            self.outcome = Some(RoundOutcome {
                successful: false,
                outputs: Vec::new(),
                bad_members: Vec::new(),
            });
        }
        Ok(())
    }

    fn status(&self) -> RoundStatus {
        match &self.outcome {
            Some(outcome) => RoundStatus::Complete(outcome.clone()),
            None => RoundStatus::Running,
        }
    }
}
