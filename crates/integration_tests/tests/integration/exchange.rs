use anyhow::Result;
use veil_protocol::MessageKind;
use veil_session::{
    ClientState, ServerState, SessionEvent, TimerKind,
};

use crate::test_utils::TestNet;

/// One server, one client: the client queues, registers and
/// transmits "HI" through the round; the sink sees it exactly
/// once.
#[tokio::test]
async fn one_server_one_client_exchange() -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    net.connect_all().await?;
    net.start_all().await?;

    let server = net.servers[0];
    let client = net.clients[0];

    net.node(client).session.send(b"HI".to_vec())?;
    net.pump().await?;

    // queue request answered, registration sent
    assert_eq!(
        Some(ClientState::Registering),
        net.node(client).client_state()
    );

    net.close_windows().await?;
    net.pump().await?;

    assert_eq!(
        Some(ServerState::Communicating),
        net.node(server).server_state()
    );
    assert_eq!(
        Some(ClientState::Communicating),
        net.node(client).client_state()
    );

    // client and server fixed the identical server roster bytes
    assert_eq!(
        net.node(server).servers_bytes(),
        net.node(client).servers_bytes()
    );

    // the payload arrives exactly once, attributed to the
    // client's slot
    let round_id =
        net.node(client).round_id().expect("round id");
    let outputs = net.node(client).outputs();
    assert_eq!(1, outputs.len());
    assert_eq!(
        (round_id, Some(client), b"HI".to_vec()),
        outputs[0]
    );

    let server_outputs = net.node(server).outputs();
    assert_eq!(1, server_outputs.len());
    assert_eq!(b"HI".to_vec(), server_outputs[0].2);
    Ok(())
}

/// A registration that misses the window is stored, replayed
/// into the next cycle and answered there with a fresh Queued;
/// the late client re-registers and joins the next round even
/// when the old round's Stop never reaches it.
#[tokio::test]
async fn late_registration_joins_next_cycle() -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    net.connect_all().await?;
    net.start_all().await?;

    let server = net.servers[0];
    let client = net.clients[0];
    net.node(client).session.send(b"HI".to_vec())?;

    // queue request and Queued response flow normally
    for delivery in net.take_deliveries() {
        net.deliver(delivery).await?;
    }
    for delivery in net.take_deliveries() {
        net.deliver(delivery).await?;
    }
    assert_eq!(
        Some(ClientState::Registering),
        net.node(client).client_state()
    );

    // the registration is still in flight when the window closes
    let held = net.take_deliveries();
    net.close_windows().await?;
    net.pump().await?;
    assert_eq!(
        Some(ServerState::Communicating),
        net.node(server).server_state()
    );
    let first = net.node(server).round_id().expect("round id");

    // it lands mid-round and is deferred, not discarded
    for delivery in held {
        net.deliver(delivery).await?;
    }

    // wind the round down, but lose the Stop on its way to the
    // client: the deferred registration alone must recover it
    net.timeout(server, TimerKind::RoundLifetime).await?;
    for delivery in net.take_deliveries() {
        if delivery.kind().await? != MessageKind::Stop {
            net.deliver(delivery).await?;
        }
    }
    net.pump().await?;
    net.close_windows().await?;
    net.pump().await?;

    let second = net.node(server).round_id().expect("round id");
    assert_ne!(first, second);
    assert_eq!(
        Some(ClientState::Communicating),
        net.node(client).client_state()
    );
    assert_eq!(Some(second), net.node(client).round_id());

    // the payload survived into the round that finally ran
    let outputs = net.node(client).outputs();
    assert_eq!(1, outputs.len());
    assert_eq!(
        (second, Some(client), b"HI".to_vec()),
        outputs[0]
    );

    // and nothing on the server was dropped as a violation
    assert!(net.node(server).events().iter().all(|event| {
        !matches!(event, SessionEvent::ProtocolViolation { .. })
    }));
    Ok(())
}

/// With a minimum client count configured the server closes its
/// registration window as soon as enough clients registered; no
/// timer is needed to reach Communicating.
#[tokio::test]
async fn window_closes_early_at_min_clients() -> Result<()> {
    let mut net = TestNet::with_config(1, 1, |config| {
        config.min_clients = Some(1);
    })?;
    net.connect_all().await?;
    net.start_all().await?;

    let server = net.servers[0];
    let client = net.clients[0];

    net.node(client).session.send(b"HI".to_vec())?;
    net.pump().await?;

    assert_eq!(
        Some(ServerState::Communicating),
        net.node(server).server_state()
    );
    assert_eq!(
        Some(ClientState::Communicating),
        net.node(client).client_state()
    );
    let outputs = net.node(client).outputs();
    assert_eq!(1, outputs.len());
    assert_eq!(b"HI".to_vec(), outputs[0].2);
    Ok(())
}

/// Data queued before the session ever reaches Communicating is
/// retained and transmitted by the next round, with no loss and
/// no duplication in later rounds.
#[tokio::test]
async fn payload_queued_before_round_is_delivered_once(
) -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    let server = net.servers[0];
    let client = net.clients[0];

    // queued while the client is still offline
    net.node(client).session.send(b"MSG1".to_vec())?;

    net.connect_all().await?;
    net.start_all().await?;
    net.pump().await?;
    net.close_windows().await?;
    net.pump().await?;

    let first_round =
        net.node(client).round_id().expect("round id");
    let outputs = net.node(client).outputs();
    assert_eq!(1, outputs.len());
    assert_eq!(b"MSG1".to_vec(), outputs[0].2);
    let server_outputs = net.node(server).outputs();
    assert_eq!(1, server_outputs.len());
    assert_eq!(b"MSG1".to_vec(), server_outputs[0].2);

    // wind the cycle around and run a second round
    net.timeout(server, TimerKind::RoundLifetime).await?;
    net.pump().await?;
    net.close_windows().await?;
    net.pump().await?;

    assert_eq!(
        Some(ClientState::Communicating),
        net.node(client).client_state()
    );
    let second_round =
        net.node(client).round_id().expect("round id");
    assert_ne!(first_round, second_round);

    // no duplicate delivery of the committed payload
    assert!(net.node(client).outputs().is_empty());
    assert!(net
        .node(server)
        .outputs()
        .iter()
        .all(|output| output.2 != b"MSG1".to_vec()));
    Ok(())
}
