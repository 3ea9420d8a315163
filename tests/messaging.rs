//! Named and unnamed application message tests

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use replica_protocol::protocol::custom::build_named;
use replica_protocol::protocol::message::{InboundMessage, MessageType, SecurityFlags, INTERNAL_CHANNEL};

type Inbox = Arc<Mutex<Vec<(u64, Vec<u8>)>>>;

fn connected(encryption: bool) -> Network {
    let cfg = || config(|c| c.security.enable_encryption = encryption);
    let mut net = Network::new(PeerBuilder::new(cfg()).server());
    net.connect(1, PeerBuilder::new(cfg()).client(), b"");
    net.assert_no_errors();
    net
}

fn inbox_handler(inbox: &Inbox) -> impl Fn(u64, &mut replica_protocol::core::BitReader<'_>) -> replica_protocol::Result<()> + Send + Sync + 'static {
    let inbox = inbox.clone();
    move |sender, reader| {
        inbox
            .lock()
            .unwrap()
            .push((sender, reader.remaining_slice().to_vec()));
        Ok(())
    }
}

#[test]
fn test_named_message_reaches_its_handler() {
    let mut net = connected(false);
    let chat: Inbox = Arc::default();
    let score: Inbox = Arc::default();
    let messaging = net.server.engine.custom_messaging().clone();
    messaging.register_named("chat", inbox_handler(&chat)).unwrap();
    messaging.register_named("score", inbox_handler(&score)).unwrap();

    net.client(1)
        .engine
        .send_named_message(0, "chat", b"hi all", INTERNAL_CHANNEL, SecurityFlags::NONE)
        .unwrap();
    net.pump();
    net.assert_no_errors();

    assert_eq!(chat.lock().unwrap().as_slice(), &[(1, b"hi all".to_vec())]);
    assert!(score.lock().unwrap().is_empty());
}

#[test]
fn test_unregistered_name_is_dropped() {
    let mut net = connected(false);
    let chat: Inbox = Arc::default();
    let messaging = net.server.engine.custom_messaging().clone();
    messaging.register_named("chat", inbox_handler(&chat)).unwrap();
    assert!(messaging.unregister_named("chat").unwrap());
    assert!(!messaging.unregister_named("chat").unwrap());

    net.server
        .engine
        .handle_message(InboundMessage::new(1, MessageType::NamedMessage, build_named("chat", b"x")))
        .unwrap();
    assert!(chat.lock().unwrap().is_empty());
}

#[test]
fn test_unnamed_message_both_directions() {
    let mut net = connected(false);
    let at_server: Inbox = Arc::default();
    let at_client: Inbox = Arc::default();
    net.server
        .engine
        .custom_messaging()
        .set_unnamed_handler(inbox_handler(&at_server))
        .unwrap();
    net.client(1)
        .engine
        .custom_messaging()
        .set_unnamed_handler(inbox_handler(&at_client))
        .unwrap();

    net.client(1)
        .engine
        .send_unnamed_message(0, b"up", "RELIABLE", SecurityFlags::NONE)
        .unwrap();
    net.server
        .engine
        .send_unnamed_message(1, b"down", "UNRELIABLE", SecurityFlags::NONE)
        .unwrap();
    net.pump();
    net.assert_no_errors();

    assert_eq!(at_server.lock().unwrap().as_slice(), &[(1, b"up".to_vec())]);
    assert_eq!(at_client.lock().unwrap().as_slice(), &[(0, b"down".to_vec())]);
}

#[test]
fn test_encrypted_named_message() {
    let mut net = connected(true);
    let secrets: Inbox = Arc::default();
    net.client(1)
        .engine
        .custom_messaging()
        .register_named("secret", inbox_handler(&secrets))
        .unwrap();

    net.server
        .engine
        .send_named_message(1, "secret", b"42", INTERNAL_CHANNEL, SecurityFlags::ENCRYPTED)
        .unwrap();
    let queued = net.server.out.sent.lock().unwrap().clone();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].security, SecurityFlags::ENCRYPTED);
    assert!(queued[0].payload.len() > b"42".len() + 8);

    net.pump();
    net.assert_no_errors();
    assert_eq!(secrets.lock().unwrap().as_slice(), &[(0, b"42".to_vec())]);
}

#[test]
fn test_tampered_sealed_message_disconnects() {
    let mut net = connected(true);
    let mut sealed = net.server.engine.seal(1, b"payload").unwrap().to_vec();
    let last = sealed.len() - 1;
    sealed[last] ^= 0xFF;

    let err = net
        .client_mut(1)
        .engine
        .handle_message(
            InboundMessage::new(0, MessageType::UnnamedMessage, sealed)
                .with_security(SecurityFlags::AUTHENTICATED),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        replica_protocol::ProtocolError::DecryptionFailure
    ));
    assert_eq!(net.client(1).out.disconnected(), vec![0]);
}
