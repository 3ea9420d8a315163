//! Connection flow tests
//!
//! Drives a server and clients through the recording loopback in `common`:
//! plain and encrypted handshakes, approval, rejection and admission gating.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use common::*;
use glam::Vec3;
use rand_core::OsRng;
use replica_protocol::engine::EngineEvent;
use replica_protocol::error::{ProtocolError, Result};
use replica_protocol::protocol::connection::{ApprovalDecision, ConnectionState};
use replica_protocol::protocol::handshake::{CertificateVerifier, ServerIdentity};
use replica_protocol::protocol::message::{InboundMessage, MessageType, SecurityFlags};
use replica_protocol::protocol::spawn::SpawnIdentity;
use rsa::pkcs8::EncodePublicKey;

fn encrypted() -> replica_protocol::NetworkConfig {
    config(|c| c.security.enable_encryption = true)
}

#[test]
fn test_plain_connection() {
    let mut net = Network::new(PeerBuilder::new(config(|_| {})).server());
    net.connect(1, PeerBuilder::new(config(|_| {})).client(), b"");
    net.assert_no_errors();

    let client = net.client(1);
    assert!(client.engine.is_connected());
    assert_eq!(client.engine.local_client_id(), Some(1));
    assert_eq!(
        net.server.engine.connections().state(1),
        Some(ConnectionState::Connected)
    );
    assert_eq!(
        net.server.engine.drain_events(),
        vec![EngineEvent::ClientConnected { client_id: 1 }]
    );
    assert_eq!(
        net.client_mut(1).engine.drain_events(),
        vec![EngineEvent::ClientConnected { client_id: 1 }]
    );

    // no key exchange without encryption
    assert!(!net.delivered.iter().any(|(_, t)| *t == MessageType::HailRequest));
}

#[test]
fn test_encrypted_connection_seals_request_and_approval() {
    let mut net = Network::new(PeerBuilder::new(encrypted()).server());
    net.connect(4, PeerBuilder::new(encrypted()).client(), b"");
    net.assert_no_errors();

    assert!(net.client(4).engine.is_connected());
    let order: Vec<MessageType> = net.delivered.iter().map(|(_, t)| *t).collect();
    assert_eq!(
        order,
        vec![
            MessageType::HailRequest,
            MessageType::HailResponse,
            MessageType::Greeting,
            MessageType::ConnectionRequest,
            MessageType::ConnectionApproved,
        ]
    );

    // a sealed payload opens with the client's session key
    let sealed = net.server.engine.seal(4, b"secret").unwrap();
    assert_ne!(&sealed[..], b"secret");
    let inbound = InboundMessage::new(0, MessageType::UnnamedMessage, sealed)
        .with_security(SecurityFlags::ENCRYPTED);
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    net.client(4)
        .engine
        .custom_messaging()
        .set_unnamed_handler(move |_, reader| {
            sink.lock().unwrap().extend_from_slice(reader.remaining_slice());
            Ok(())
        })
        .unwrap();
    net.client_mut(4).engine.handle_message(inbound).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), b"secret");

    let metrics = net.server.engine.metrics().snapshot();
    assert_eq!(metrics.handshakes_success, 1);
    assert_eq!(metrics.handshakes_failed, 0);
}

struct FixedKeyVerifier {
    spki: Vec<u8>,
}

impl CertificateVerifier for FixedKeyVerifier {
    fn verify(&self, _certificate: &[u8], hostname: &str) -> Result<Vec<u8>> {
        assert_eq!(hostname, "localhost");
        Ok(self.spki.clone())
    }
}

#[test]
fn test_signed_key_exchange() {
    let signed = || {
        config(|c| {
            c.security.enable_encryption = true;
            c.security.sign_key_exchange = true;
        })
    };
    let key = rsa::RsaPrivateKey::new(&mut OsRng, 1024).expect("RSA key generation");
    let spki = key
        .to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec();

    let server = PeerBuilder::new(signed())
        .collaborators(move |c| c.with_identity(ServerIdentity::rsa(b"cert".to_vec(), key)))
        .server();
    let client = PeerBuilder::new(signed())
        .collaborators(move |c| c.with_certificate_verifier(FixedKeyVerifier { spki }))
        .client();

    let mut net = Network::new(server);
    net.connect(2, client, b"");
    net.assert_no_errors();
    assert!(net.client(2).engine.is_connected());
}

#[test]
fn test_signed_key_exchange_with_wrong_key_disconnects() {
    let signed = || {
        config(|c| {
            c.security.enable_encryption = true;
            c.security.sign_key_exchange = true;
        })
    };
    let key = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let other = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
    let spki = other
        .to_public_key()
        .to_public_key_der()
        .unwrap()
        .as_bytes()
        .to_vec();

    let server = PeerBuilder::new(signed())
        .collaborators(move |c| c.with_identity(ServerIdentity::rsa(b"cert".to_vec(), key)))
        .server();
    let client = PeerBuilder::new(signed())
        .collaborators(move |c| c.with_certificate_verifier(FixedKeyVerifier { spki }))
        .client();

    let mut net = Network::new(server);
    net.connect(2, client, b"");

    assert!(!net.client(2).engine.is_connected());
    assert!(matches!(
        net.errors.as_slice(),
        [(2, ProtocolError::HandshakeFailed(_))]
    ));
    assert_eq!(net.client(2).out.disconnected(), vec![0]);
}

#[test]
fn test_config_mismatch_disconnects() {
    let mut net = Network::new(PeerBuilder::new(config(|_| {})).server());
    let client = PeerBuilder::new(config(|c| c.protocol.enable_networked_var = false)).client();
    net.connect(3, client, b"");

    assert!(matches!(
        net.errors.as_slice(),
        [(0, ProtocolError::ConfigMismatch { .. })]
    ));
    assert_eq!(net.server.out.disconnected(), vec![3]);
    assert!(net.server.engine.connections().get(3).is_none());
    assert!(!net.client(3).engine.is_connected());
    assert_eq!(net.server.engine.metrics().snapshot().config_mismatches, 1);
}

#[test]
fn test_local_only_settings_do_not_mismatch() {
    let mut net = Network::new(PeerBuilder::new(config(|_| {})).server());
    let client = PeerBuilder::new(config(|c| {
        c.logging.app_name = "other".into();
        c.protocol.rpc_response_timeout = Duration::from_secs(1);
    }))
    .client();
    net.connect(3, client, b"");
    net.assert_no_errors();
    assert!(net.client(3).engine.is_connected());
}

fn approval_config() -> replica_protocol::NetworkConfig {
    config(|c| c.protocol.connection_approval = true)
}

#[test]
fn test_deferred_approval_from_another_thread() {
    let hook = DeferredApproval::default();
    let pending = hook.pending.clone();
    let server = PeerBuilder::new(approval_config())
        .collaborators(move |c| c.with_approval(hook))
        .server();

    let mut net = Network::new(server);
    net.connect(5, PeerBuilder::new(approval_config()).client(), b"token-5");
    net.assert_no_errors();

    assert!(!net.client(5).engine.is_connected());
    assert_eq!(
        net.server.engine.connections().state(5),
        Some(ConnectionState::AwaitingApproval)
    );

    let (payload, responder) = pending.lock().unwrap().pop().expect("request held");
    assert_eq!(payload, b"token-5");
    assert_eq!(responder.client_id(), 5);
    std::thread::spawn(move || responder.approve())
        .join()
        .unwrap();

    assert_eq!(net.server.engine.poll_approvals().unwrap(), 1);
    net.pump();
    net.assert_no_errors();
    assert!(net.client(5).engine.is_connected());
}

#[tokio::test]
async fn test_approval_decided_in_async_task() {
    let hook = DeferredApproval::default();
    let pending = hook.pending.clone();
    let server = PeerBuilder::new(approval_config())
        .collaborators(move |c| c.with_approval(hook))
        .server();
    let mut net = Network::new(server);
    net.connect(8, PeerBuilder::new(approval_config()).client(), b"async");

    let (_, responder) = pending.lock().unwrap().pop().unwrap();
    tokio::spawn(async move {
        responder.respond(ApprovalDecision::approve(0).with_player_object(
            Some(PLAYER_PREFAB),
            Some(Vec3::new(1.0, 2.0, 3.0)),
            None,
        ));
    })
    .await
    .unwrap();

    net.server.engine.poll_approvals().unwrap();
    net.pump();
    net.assert_no_errors();

    let client = net.client(8);
    assert!(client.engine.is_connected());
    let player = client
        .engine
        .registry()
        .iter()
        .find(|o| o.is_player_object())
        .expect("player object replicated");
    assert_eq!(player.owner_client_id(), 8);
    assert_eq!(
        player.identity(),
        SpawnIdentity::Prefab {
            prefab_hash: PLAYER_PREFAB
        }
    );
    assert_eq!(
        player.transform().map(|t| t.position),
        Some(Vec3::new(1.0, 2.0, 3.0))
    );
}

#[test]
fn test_rejection() {
    let hook = DeferredApproval::default();
    let pending = hook.pending.clone();
    let server = PeerBuilder::new(approval_config())
        .collaborators(move |c| c.with_approval(hook))
        .server();
    let mut net = Network::new(server);
    net.connect(6, PeerBuilder::new(approval_config()).client(), b"bad");

    let (_, responder) = pending.lock().unwrap().pop().unwrap();
    responder.reject();
    net.server.engine.poll_approvals().unwrap();
    net.pump();

    assert_eq!(net.server.out.disconnected(), vec![6]);
    assert!(net.server.engine.connections().get(6).is_none());
    assert!(net
        .server
        .engine
        .drain_events()
        .contains(&EngineEvent::ClientRejected { client_id: 6 }));
    assert!(!net.client(6).engine.is_connected());
}

#[test]
fn test_connection_metrics_count_connected_peers_only() {
    let hook = DeferredApproval::default();
    let pending = hook.pending.clone();
    let server = PeerBuilder::new(approval_config())
        .collaborators(move |c| c.with_approval(hook))
        .server();
    let mut net = Network::new(server);
    net.connect(7, PeerBuilder::new(approval_config()).client(), b"");
    net.connect(8, PeerBuilder::new(approval_config()).client(), b"");

    // transport connects alone do not count
    let metrics = net.server.engine.metrics().snapshot();
    assert_eq!((metrics.connections_total, metrics.connections_active), (0, 0));

    let mut held = std::mem::take(&mut *pending.lock().unwrap());
    let (_, second) = held.pop().unwrap();
    let (_, first) = held.pop().unwrap();
    assert_eq!(first.client_id(), 7);
    first.approve();
    second.reject();
    net.server.engine.poll_approvals().unwrap();
    net.pump();
    net.assert_no_errors();

    let metrics = net.server.engine.metrics().snapshot();
    assert_eq!((metrics.connections_total, metrics.connections_active), (1, 1));
    assert_eq!(metrics.approvals_rejected, 1);
    let client = net.client(7).engine.metrics().snapshot();
    assert_eq!((client.connections_total, client.connections_active), (1, 1));

    net.server.engine.on_client_disconnected(7).unwrap();
    net.client_mut(7).engine.on_disconnected().unwrap();
    let metrics = net.server.engine.metrics().snapshot();
    assert_eq!((metrics.connections_total, metrics.connections_active), (1, 0));
    assert_eq!(net.client(7).engine.metrics().snapshot().connections_active, 0);
}

#[test]
fn test_decision_for_departed_client_is_ignored() {
    let hook = DeferredApproval::default();
    let pending = hook.pending.clone();
    let server = PeerBuilder::new(approval_config())
        .collaborators(move |c| c.with_approval(hook))
        .server();
    let mut net = Network::new(server);
    net.connect(6, PeerBuilder::new(approval_config()).client(), b"");

    net.server.engine.on_client_disconnected(6).unwrap();
    let (_, responder) = pending.lock().unwrap().pop().unwrap();
    responder.approve();
    assert_eq!(net.server.engine.poll_approvals().unwrap(), 1);
    assert!(net.server.out.take().is_empty());
}

#[test]
fn test_player_object_announced_to_others_only() {
    let cfg = || {
        config(|c| {
            c.protocol.create_player_prefab = true;
            c.protocol.player_prefab_hash = Some(PLAYER_PREFAB);
        })
    };
    let mut net = Network::new(PeerBuilder::new(cfg()).server());
    net.connect(1, PeerBuilder::new(cfg()).client(), b"");
    net.delivered.clear();
    net.connect(2, PeerBuilder::new(cfg()).client(), b"");
    net.assert_no_errors();

    // client 1 hears about the new player; client 2 gets it in its initial batch
    assert!(net.delivered.contains(&(1, MessageType::AddObject)));
    assert!(!net.delivered.contains(&(2, MessageType::AddObject)));

    for id in [1, 2] {
        let registry = net.client(id).engine.registry();
        assert_eq!(registry.len(), 2);
        let owners: Vec<u64> = registry.iter().map(|o| o.owner_client_id()).collect();
        assert_eq!(owners, vec![1, 2]);
    }
}

#[test]
fn test_role_gating() {
    let mut net = Network::new(PeerBuilder::new(config(|_| {})).server());
    net.connect(1, PeerBuilder::new(config(|_| {})).client(), b"");

    let err = net
        .server
        .engine
        .handle_message(InboundMessage::new(1, MessageType::AddObject, vec![1u8]))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedMessage(_)));

    let err = net
        .client_mut(1)
        .engine
        .handle_message(InboundMessage::new(0, MessageType::ServerRpc, vec![1u8]))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedMessage(_)));

    // gating never disconnects
    assert!(net.server.out.disconnected().is_empty());
    assert_eq!(net.server.engine.metrics().snapshot().messages_dropped, 1);
}

#[test]
fn test_pending_client_filter() {
    let mut net = Network::new(PeerBuilder::new(encrypted()).server());
    net.attach(9, PeerBuilder::new(encrypted()).client());

    let err = net
        .server
        .engine
        .handle_message(InboundMessage::new(9, MessageType::NamedMessage, vec![0u8]))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedMessage(_)));

    let err = net
        .server
        .engine
        .handle_message(InboundMessage::new(77, MessageType::ConnectionRequest, vec![0u8]))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownClient(77)));
}

#[test]
fn test_disconnect_despawns_owned_objects() {
    let mut net = Network::new(PeerBuilder::new(config(|_| {})).server());
    net.connect(1, PeerBuilder::new(config(|_| {})).client(), b"");
    net.connect(2, PeerBuilder::new(config(|_| {})).client(), b"");

    let owned = net
        .server
        .engine
        .spawn_object(replica_protocol::SpawnRequest::prefab(CRATE_PREFAB).with_owner(1))
        .unwrap();
    let shared = net
        .server
        .engine
        .spawn_object(replica_protocol::SpawnRequest::prefab(CRATE_PREFAB))
        .unwrap();
    net.pump();
    assert_eq!(net.client(2).engine.registry().len(), 2);

    net.server.engine.on_client_disconnected(1).unwrap();
    net.pump();
    net.assert_no_errors();

    assert!(!net.server.engine.registry().contains(owned));
    assert!(net.server.engine.registry().contains(shared));
    assert!(!net.client(2).engine.registry().contains(owned));
    assert!(net
        .server
        .engine
        .drain_events()
        .contains(&EngineEvent::ClientDisconnected { client_id: 1 }));
}

#[test]
fn test_client_disconnect_clears_state() {
    let mut net = Network::new(PeerBuilder::new(config(|_| {})).server());
    net.connect(1, PeerBuilder::new(config(|_| {})).client(), b"");
    net.server
        .engine
        .spawn_object(replica_protocol::SpawnRequest::prefab(CRATE_PREFAB))
        .unwrap();
    net.pump();

    let client = net.client_mut(1);
    client.engine.on_disconnected().unwrap();
    assert!(client.engine.registry().is_empty());
    assert!(!client.engine.is_connected());
    assert!(client
        .spawn_events()
        .iter()
        .any(|e| matches!(e, SpawnEvent::Destroyed(_))));
}
