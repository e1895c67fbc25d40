use anyhow::Result;
use veil_session::{ServerState, SessionEvent, TimerKind};

use crate::test_utils::TestNet;

/// Three servers and no clients bootstrap a round: the proposer
/// authors the Init, everyone enlists and agrees, the empty
/// registration window closes, the trivial round runs and the
/// proposer winds the cycle back around.
#[tokio::test]
async fn three_server_bootstrap_no_clients() -> Result<()> {
    let mut net = TestNet::new(3, 0)?;
    net.connect_all().await?;
    net.start_all().await?;
    net.pump().await?;

    // every server derived the same round id
    net.assert_server_states(ServerState::Queuing);
    let ids = net.server_round_ids();
    let first = ids[0].expect("round id derived");
    assert!(ids.iter().all(|id| *id == Some(first)));

    // and fixed an identical server roster serialization
    let reference =
        net.node(net.servers[0]).servers_bytes();
    assert!(!reference.is_empty());
    for id in net.servers.clone() {
        assert_eq!(reference, net.node(id).servers_bytes());
    }

    // close the empty registration window everywhere
    net.close_windows().await?;
    net.pump().await?;
    net.assert_server_states(ServerState::Communicating);

    // a round of empty slots completes; nobody delivers output
    for id in net.servers.clone() {
        assert!(net.node(id).outputs().is_empty());
        let events = net.node(id).events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::RoundStarting { .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::RoundFinished {
                successful: true,
                ..
            }
        )));
    }

    // the proposer announces end of round and the cycle restarts
    let proposer = net.servers[0];
    net.timeout(proposer, TimerKind::RoundLifetime).await?;
    net.pump().await?;

    net.assert_server_states(ServerState::Queuing);
    let second = net.server_round_ids();
    let second_id = second[0].expect("second round id derived");
    assert!(second.iter().all(|id| *id == Some(second_id)));
    assert_ne!(first, second_id);
    Ok(())
}

/// A single server group collapses the whole bootstrap into the
/// proposer's entry actions.
#[tokio::test]
async fn single_server_bootstrap() -> Result<()> {
    let mut net = TestNet::new(1, 0)?;
    net.connect_all().await?;
    net.start_all().await?;
    net.pump().await?;

    net.assert_server_states(ServerState::Queuing);
    assert!(net.server_round_ids()[0].is_some());
    Ok(())
}

/// A round that never completes an exchange is aborted at the
/// lifetime bound instead of waited on forever.
#[tokio::test]
async fn stalled_round_aborts_at_lifetime() -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    net.connect_all().await?;
    net.start_all().await?;
    net.pump().await?;
    net.close_windows().await?;

    // withhold all round packets so the exchange cannot finish
    let deliveries = net.take_deliveries();
    for delivery in deliveries {
        if delivery.kind().await?
            != veil_protocol::MessageKind::SessionData
        {
            net.deliver(delivery).await?;
        }
    }
    net.assert_server_states(ServerState::Communicating);

    let proposer = net.servers[0];
    net.timeout(proposer, TimerKind::RoundLifetime).await?;
    net.pump().await?;

    // the abort returned the server to the next bootstrap
    net.assert_server_states(ServerState::Queuing);
    let events = net.node(proposer).events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::RoundFinished {
            successful: false,
            ..
        }
    )));
    Ok(())
}
