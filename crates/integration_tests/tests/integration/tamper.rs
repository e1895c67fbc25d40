use anyhow::Result;
use veil_protocol::{encode, Envelope, MessageKind, SessionMessage};
use veil_session::{ClientState, SessionEvent, TimerKind};

use crate::test_utils::TestNet;

/// A Queued whose agree list was tampered with fails
/// verification: the client rejects it, stays in Queuing, surfaces
/// a protocol violation and later times out back through
/// WaitingForServer.
#[tokio::test]
async fn tampered_queued_is_rejected() -> Result<()> {
    let mut net = TestNet::new(1, 1)?;
    net.connect_all().await?;
    net.start_all().await?;

    let server = net.servers[0];
    let client = net.clients[0];

    // walk the queue request to the server by hand so the reply
    // can be intercepted
    for delivery in net.take_deliveries() {
        net.deliver(delivery).await?;
    }
    let mut replies = net.take_deliveries();
    assert_eq!(1, replies.len());
    let reply = replies.remove(0);
    assert_eq!(MessageKind::Queued, reply.kind().await?);

    // flip a byte of the first agree signature inside the payload
    let envelope = Envelope::from_bytes(&reply.payload).await?;
    let SessionMessage::Queued(mut queued) =
        envelope.open().await?
    else {
        panic!("expected queued payload");
    };
    queued.agrees[0].signature[0] ^= 0xff;
    let tampered = Envelope {
        kind: MessageKind::Queued,
        payload: encode(&queued).await?,
        signature: envelope.signature.clone(),
    };

    net.node(client)
        .session
        .handle_message(&server, tampered)
        .await?;

    // rejected without a state change
    assert_eq!(
        Some(ClientState::Queuing),
        net.node(client).client_state()
    );
    let events = net.node(client).events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::ProtocolViolation { .. }
    )));

    // with no valid Queued the client eventually times out and
    // re-enters the queue through WaitingForServer
    net.timeout(client, TimerKind::Response).await?;
    let events = net.node(client).events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Stopping { .. }
    )));
    assert_eq!(
        Some(ClientState::Queuing),
        net.node(client).client_state()
    );

    // a fresh queue request went out
    let retries = net.take_deliveries();
    let mut request_kinds = Vec::new();
    for delivery in &retries {
        request_kinds.push(delivery.kind().await?);
    }
    assert!(request_kinds
        .iter()
        .any(|kind| *kind == MessageKind::Register));
    Ok(())
}
