use anyhow::Result;
use veil_protocol::{Envelope, Queued, SessionMessage};
use veil_session::{ClientState, ServerState};

use crate::test_utils::TestNet;

/// A Queued that arrives while the client is still waiting for a
/// server is buffered, then consumed the moment the client enters
/// Queuing, with no extra round trip.
#[tokio::test]
async fn queued_before_queuing_is_buffered() -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    let server = net.servers[0];
    let client = net.clients[0];

    // the server bootstraps alone; the client has no connection
    // yet
    net.start_all().await?;
    net.pump().await?;
    assert_eq!(
        Some(ServerState::Queuing),
        net.node(server).server_state()
    );
    assert_eq!(
        Some(ClientState::WaitingForServer),
        net.node(client).client_state()
    );

    // a Queued built from the server's agreed roster arrives
    // early
    let agrees: Vec<Envelope> = net
        .node(server)
        .session
        .shared()
        .servers()
        .iter()
        .map(|entry| entry.envelope.clone())
        .collect();
    assert!(!agrees.is_empty());
    let keypair = net.node(server).keypair.clone();
    let early = SessionMessage::Queued(Queued {
        agrees,
        nonce: Vec::new(),
    })
    .seal(&keypair)
    .await?;
    net.node(client)
        .session
        .handle_message(&server, early)
        .await?;

    // buffered, not acted upon
    assert_eq!(
        Some(ClientState::WaitingForServer),
        net.node(client).client_state()
    );

    // connecting replays the buffer: the client registers without
    // waiting for another Queued
    net.connect(client, server).await?;
    assert_eq!(
        Some(ClientState::Registering),
        net.node(client).client_state()
    );

    // and the rest of the cycle completes normally
    net.pump().await?;
    net.close_windows().await?;
    net.pump().await?;
    assert_eq!(
        Some(ClientState::Communicating),
        net.node(client).client_state()
    );
    assert_eq!(
        Some(ServerState::Communicating),
        net.node(server).server_state()
    );
    Ok(())
}
