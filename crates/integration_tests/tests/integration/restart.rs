use anyhow::Result;
use veil_session::{ClientState, TimerKind};

use crate::test_utils::TestNet;

/// Delivering every message twice changes nothing observable:
/// the same states are reached and the payload arrives exactly
/// once.
#[tokio::test]
async fn duplicated_delivery_is_tolerated() -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    net.connect_all().await?;
    net.start_all().await?;

    let server = net.servers[0];
    let client = net.clients[0];

    net.node(client).session.send(b"HI".to_vec())?;
    net.pump_duplicated().await?;
    net.close_windows().await?;
    net.pump_duplicated().await?;

    assert_eq!(
        Some(ClientState::Communicating),
        net.node(client).client_state()
    );

    let outputs = net.node(client).outputs();
    assert_eq!(1, outputs.len());
    assert_eq!(b"HI".to_vec(), outputs[0].2);

    let server_outputs = net.node(server).outputs();
    assert_eq!(1, server_outputs.len());
    assert_eq!(b"HI".to_vec(), server_outputs[0].2);
    Ok(())
}

/// Cycling Stop → restart repeatedly leaves the session
/// indistinguishable from a fresh one: every cycle enrolls,
/// exchanges exactly its own payload and winds back around.
#[tokio::test]
async fn repeated_restarts_behave_like_fresh_sessions(
) -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    net.connect_all().await?;
    net.start_all().await?;

    let server = net.servers[0];
    let client = net.clients[0];
    let mut seen_rounds = Vec::new();

    for cycle in 0..3u8 {
        let message = format!("MSG{}", cycle).into_bytes();
        net.node(client).session.send(message.clone())?;

        net.pump().await?;
        net.close_windows().await?;
        net.pump().await?;

        assert_eq!(
            Some(ClientState::Communicating),
            net.node(client).client_state(),
            "cycle {}",
            cycle
        );
        let round_id =
            net.node(client).round_id().expect("round id");
        assert!(
            !seen_rounds.contains(&round_id),
            "round ids must not repeat"
        );
        seen_rounds.push(round_id);

        let outputs = net.node(client).outputs();
        assert_eq!(1, outputs.len(), "cycle {}", cycle);
        assert_eq!(message, outputs[0].2, "cycle {}", cycle);
        net.node(server).outputs();

        net.timeout(server, TimerKind::RoundLifetime).await?;
        net.pump().await?;
    }
    Ok(())
}
