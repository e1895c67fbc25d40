use anyhow::Result;
use veil_session::{ServerState, SessionEvent, TimerKind};

use crate::test_utils::TestNet;

/// A server-to-server link drop during Queuing aborts the cycle
/// with an immediate Stop everywhere; once the link returns the
/// next bootstrap succeeds. No session crashes and no spurious
/// Start is emitted.
#[tokio::test]
async fn server_disconnect_during_queuing() -> Result<()> {
    let mut net = TestNet::new(3, 0)?;
    net.connect_all().await?;
    net.start_all().await?;
    net.pump().await?;
    net.assert_server_states(ServerState::Queuing);
    let first = net.server_round_ids()[0].expect("round id");

    let (a, b, c) =
        (net.servers[0], net.servers[1], net.servers[2]);

    net.disconnect(b, c).await?;
    net.pump().await?;

    // the observers announced immediate stops
    for id in [b, c] {
        let events = net.node(id).events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Stopping {
                immediate: true,
                ..
            }
        )));
        assert_eq!(
            Some(ServerState::WaitingForServers),
            net.node(id).server_state()
        );
    }
    // the proposer is fully connected and already proposing the
    // next bootstrap
    assert_eq!(
        Some(ServerState::Init),
        net.node(a).server_state()
    );

    // the missing link returns; b and c join the next bootstrap,
    // replaying the Init they buffered while waiting
    net.connect(b, c).await?;
    net.pump().await?;

    net.assert_server_states(ServerState::Queuing);
    let ids = net.server_round_ids();
    let second = ids[0].expect("round id");
    assert!(ids.iter().all(|id| *id == Some(second)));
    assert_ne!(first, second);
    Ok(())
}

/// Losing the active server resets a client; it re-enrolls
/// through the cycle that follows and an interrupted payload is
/// replayed, never lost and never duplicated.
#[tokio::test]
async fn aborted_round_replays_pending_payload() -> Result<()> {
    let mut net = TestNet::new(2, 1)?;
    net.connect_all().await?;
    net.start_all().await?;

    let (a, b) = (net.servers[0], net.servers[1]);
    let client = net.clients[0];

    net.node(client).session.send(b"HI".to_vec())?;
    net.pump().await?;
    net.close_windows().await?;

    // hold back every round packet so the exchange cannot
    // complete before the abort
    let deliveries = net.take_deliveries();
    for delivery in deliveries {
        if delivery.kind().await?
            != veil_protocol::MessageKind::SessionData
        {
            net.deliver(delivery).await?;
        }
    }
    net.assert_server_states(ServerState::Communicating);
    let first = net.node(client).round_id().expect("round id");

    // server link drops mid-round
    net.disconnect(a, b).await?;
    net.pump().await?;

    // nothing was delivered for the aborted round
    assert!(net.node(client).outputs().is_empty());
    let events = net.node(client).events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::RoundFinished {
            successful: false,
            ..
        }
    )));

    // recover and run the next cycle to completion
    net.connect(a, b).await?;
    net.pump().await?;
    net.close_windows().await?;
    net.pump().await?;

    let second = net.node(client).round_id().expect("round id");
    assert_ne!(first, second);
    let outputs = net.node(client).outputs();
    assert_eq!(1, outputs.len());
    assert_eq!(
        (second, Some(client), b"HI".to_vec()),
        outputs[0]
    );
    Ok(())
}
