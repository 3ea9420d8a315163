//! # Network Engine
//!
//! [`NetworkEngine`] owns the replication state of one peer and drives the
//! protocol handlers. The host feeds it inbound messages and transport events
//! and plugs in the collaborators from [`crate::protocol::context`].
//!
//! Processing is single threaded: every method takes `&mut self` and runs to
//! completion. The only suspension is a spawn batch waiting for a scene load,
//! resumed by [`NetworkEngine::on_scene_loaded`].
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_protocol::config::NetworkConfig;
//! use replica_protocol::engine::{Collaborators, NetworkEngine};
//! # use replica_protocol::protocol::context::*;
//! # fn collaborators() -> Collaborators { unimplemented!() }
//!
//! let config = NetworkConfig::default();
//! let mut server = NetworkEngine::new_server(config, collaborators())?;
//! server.on_client_connected(7)?;
//! for event in server.drain_events() {
//!     println!("{event:?}");
//! }
//! # Ok::<(), replica_protocol::error::ProtocolError>(())
//! ```

mod client;
mod dispatch;
mod server;

pub use server::SpawnRequest;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::{ClientSession, ConnectionTable};
use crate::protocol::context::{ConnectionApproval, ObjectSpawner, OutboundSender, SceneController};
use crate::protocol::custom::{build_named, CustomMessaging};
use crate::protocol::handshake::{CertificateVerifier, ServerIdentity, X509CertificateVerifier};
use crate::protocol::message::{
    ClientId, MessageType, NetworkId, Role, SecurityFlags, INTERNAL_CHANNEL, SERVER_CLIENT_ID,
};
use crate::protocol::rpc::PendingResponseTable;
use crate::protocol::scene::{SceneSwitchQueue, SwitchId};
use crate::protocol::spawn::SpawnContext;
use crate::protocol::time::NetworkClock;
use crate::replication::{SpawnedObjectRegistry, WritePermission};
use crate::utils::{Metrics, SessionCipher, WriterPool};

/// Client id reported before the server has assigned one.
const UNASSIGNED_CLIENT_ID: ClientId = u64::MAX;

/// Host-visible outcomes of message processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ClientConnected { client_id: ClientId },
    ClientRejected { client_id: ClientId },
    ClientDisconnected { client_id: ClientId },
    SceneSwitched { scene_index: u32, switch_id: SwitchId },
}

/// Host implementations the engine calls out to.
pub struct Collaborators {
    pub sender: Arc<dyn OutboundSender>,
    pub spawner: Box<dyn ObjectSpawner>,
    pub scenes: Box<dyn SceneController>,
    pub approval: Option<Box<dyn ConnectionApproval>>,
    pub certificates: Option<Box<dyn CertificateVerifier>>,
    pub identity: Option<ServerIdentity>,
}

impl Collaborators {
    pub fn new(
        sender: Arc<dyn OutboundSender>,
        spawner: Box<dyn ObjectSpawner>,
        scenes: Box<dyn SceneController>,
    ) -> Self {
        Self {
            sender,
            spawner,
            scenes,
            approval: None,
            certificates: Some(Box::new(X509CertificateVerifier::new())),
            identity: None,
        }
    }

    pub fn with_approval(mut self, approval: impl ConnectionApproval + 'static) -> Self {
        self.approval = Some(Box::new(approval));
        self
    }

    pub fn with_certificate_verifier(mut self, verifier: impl CertificateVerifier + 'static) -> Self {
        self.certificates = Some(Box::new(verifier));
        self
    }

    pub fn with_identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

pub struct NetworkEngine {
    role: Role,
    config: NetworkConfig,
    sender: Arc<dyn OutboundSender>,
    spawner: Box<dyn ObjectSpawner>,
    scenes: Box<dyn SceneController>,
    approval: Option<Box<dyn ConnectionApproval>>,
    certificates: Option<Box<dyn CertificateVerifier>>,
    identity: Option<ServerIdentity>,
    registry: SpawnedObjectRegistry,
    responses: PendingResponseTable,
    connections: ConnectionTable,
    session: ClientSession,
    scene_tasks: SceneSwitchQueue,
    clock: NetworkClock,
    custom: CustomMessaging,
    buffers: WriterPool,
    metrics: Arc<Metrics>,
    events: Vec<EngineEvent>,
    next_network_id: NetworkId,
}

impl NetworkEngine {
    /// Build an engine. The configuration is validated first.
    pub fn new(role: Role, config: NetworkConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate_strict()?;
        debug!(?role, config_hash = config.config_hash(), "Creating network engine");

        let responses = PendingResponseTable::new(config.protocol.rpc_response_timeout);
        Ok(Self {
            role,
            sender: collaborators.sender,
            spawner: collaborators.spawner,
            scenes: collaborators.scenes,
            approval: collaborators.approval,
            certificates: collaborators.certificates,
            identity: collaborators.identity,
            registry: SpawnedObjectRegistry::new(),
            responses,
            connections: ConnectionTable::new(),
            session: ClientSession::new(),
            scene_tasks: SceneSwitchQueue::new(),
            clock: NetworkClock::new(),
            custom: CustomMessaging::new(),
            buffers: WriterPool::default(),
            metrics: Arc::new(Metrics::new()),
            events: Vec::new(),
            next_network_id: 1,
            config,
        })
    }

    pub fn new_server(config: NetworkConfig, collaborators: Collaborators) -> Result<Self> {
        Self::new(Role::Server, config, collaborators)
    }

    pub fn new_client(config: NetworkConfig, collaborators: Collaborators) -> Result<Self> {
        Self::new(Role::Client, config, collaborators)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn registry(&self) -> &SpawnedObjectRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SpawnedObjectRegistry {
        &mut self.registry
    }

    /// Shared handle to the outstanding RPC responses.
    pub fn responses(&self) -> PendingResponseTable {
        self.responses.clone()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn custom_messaging(&self) -> &CustomMessaging {
        &self.custom
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn clock(&self) -> &NetworkClock {
        &self.clock
    }

    pub fn network_time(&self) -> f32 {
        self.clock.network_time()
    }

    pub fn is_scene_switch_pending(&self) -> bool {
        self.scene_tasks.is_suspended()
    }

    /// This peer's client id. The server is always [`SERVER_CLIENT_ID`].
    pub fn local_client_id(&self) -> Option<ClientId> {
        match self.role {
            Role::Server => Some(SERVER_CLIENT_ID),
            Role::Client => self.session.local_client_id(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self.role {
            Role::Server => true,
            Role::Client => self.session.is_connected(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Advance the clock and expire overdue RPC responses.
    pub fn tick(&mut self, dt: Duration) {
        self.clock.advance(dt);
        self.responses.expire(Instant::now());
    }

    fn spawn_context(&mut self) -> SpawnContext<'_> {
        let local_client_id = self.local_client_id().unwrap_or(UNASSIGNED_CLIENT_ID);
        SpawnContext {
            config: &self.config.protocol,
            registry: &mut self.registry,
            spawner: self.spawner.as_mut(),
            metrics: &self.metrics,
            local_client_id,
        }
    }

    fn cipher_for(&self, peer: ClientId) -> Option<SessionCipher> {
        match self.role {
            Role::Server => self.connections.get(peer).and_then(|r| r.cipher()),
            Role::Client => self.session.cipher(),
        }
    }

    /// Seal a payload for `peer` with the connection's symmetric key.
    pub fn seal(&self, peer: ClientId, plaintext: &[u8]) -> Result<Bytes> {
        let cipher = self
            .cipher_for(peer)
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_NO_SESSION_KEY.to_string()))?;
        Ok(Bytes::from(cipher.seal(plaintext)?))
    }

    pub(crate) fn open(&self, peer: ClientId, sealed: &[u8]) -> Result<Bytes> {
        let cipher = self.cipher_for(peer).ok_or_else(|| {
            debug!(peer, "{}", constants::ERR_NO_SESSION_KEY);
            ProtocolError::DecryptionFailure
        })?;
        Ok(Bytes::from(cipher.open(sealed)?))
    }

    /// Security flags for messages sealed once a key exists.
    fn connection_security(&self) -> SecurityFlags {
        if self.config.security.enable_encryption {
            SecurityFlags::ENCRYPTED
        } else {
            SecurityFlags::NONE
        }
    }

    pub(crate) fn send_message(
        &self,
        target: ClientId,
        message_type: MessageType,
        channel: &str,
        payload: Bytes,
        security: SecurityFlags,
        context: Option<NetworkId>,
    ) -> Result<()> {
        let payload = if security.is_sealed() {
            self.seal(target, &payload)?
        } else {
            payload
        };
        self.metrics.message_sent(payload.len() as u64);
        self.sender
            .send(target, message_type, channel, payload, security, context);
        Ok(())
    }

    pub(crate) fn send_internal(
        &self,
        target: ClientId,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<()> {
        self.send_message(
            target,
            message_type,
            INTERNAL_CHANNEL,
            payload,
            SecurityFlags::NONE,
            None,
        )
    }

    /// Send to every connected client except `except`.
    pub(crate) fn broadcast(
        &self,
        message_type: MessageType,
        payload: &Bytes,
        except: Option<ClientId>,
        context: Option<NetworkId>,
    ) -> Result<()> {
        for client_id in self.connections.connected_clients() {
            if Some(client_id) == except {
                continue;
            }
            self.send_message(
                client_id,
                message_type,
                INTERNAL_CHANNEL,
                payload.clone(),
                SecurityFlags::NONE,
                context,
            )?;
        }
        Ok(())
    }

    /// Send an application message routed by `name` on the receiver.
    pub fn send_named_message(
        &self,
        target: ClientId,
        name: &str,
        payload: &[u8],
        channel: &str,
        security: SecurityFlags,
    ) -> Result<()> {
        let payload = build_named(name, payload);
        self.send_message(target, MessageType::NamedMessage, channel, payload, security, None)
    }

    /// Send an application message to the receiver's unnamed handler.
    pub fn send_unnamed_message(
        &self,
        target: ClientId,
        payload: &[u8],
        channel: &str,
        security: SecurityFlags,
    ) -> Result<()> {
        self.send_message(
            target,
            MessageType::UnnamedMessage,
            channel,
            Bytes::copy_from_slice(payload),
            security,
            None,
        )
    }

    /// Send every dirty replicated variable.
    ///
    /// The server broadcasts all dirty fields to connected clients. A client
    /// sends only the fields it may write: `Everyone` fields, plus `OwnerOnly`
    /// fields of objects it owns.
    #[instrument(skip(self), fields(role = ?self.role))]
    pub fn flush_variable_deltas(&mut self) -> Result<usize> {
        if !self.config.protocol.enable_networked_var {
            return Ok(0);
        }

        let local = self.local_client_id().unwrap_or(UNASSIGNED_CLIENT_ID);
        let role = self.role;
        let mut outbound = Vec::new();

        for network_id in self.registry.network_ids() {
            let Some(object) = self.registry.get_mut(network_id) else {
                continue;
            };
            let owned = object.owner_client_id() == local;
            let filter = move |permission: WritePermission| match role {
                Role::Server => true,
                Role::Client => {
                    permission == WritePermission::Everyone
                        || (owned && permission == WritePermission::OwnerOnly)
                }
            };

            for (index, behaviour) in object.behaviours_mut().enumerate() {
                let Some(vars) = behaviour.variables_mut() else {
                    continue;
                };
                if !vars.has_dirty_matching(filter) {
                    continue;
                }
                let mut writer = self.buffers.writer();
                if let Err(e) = crate::protocol::sync::write_variable_delta(
                    &mut writer,
                    network_id,
                    index as u16,
                    vars,
                    filter,
                ) {
                    warn!(network_id, behaviour = index, error = %e, "Variable delta not sent");
                    continue;
                }
                outbound.push((network_id, writer.finish()));
            }
        }

        for (network_id, payload) in &outbound {
            match self.role {
                Role::Server => self.broadcast(
                    MessageType::NetworkedVarDelta,
                    payload,
                    None,
                    Some(*network_id),
                )?,
                Role::Client => self.send_message(
                    SERVER_CLIENT_ID,
                    MessageType::NetworkedVarDelta,
                    INTERNAL_CHANNEL,
                    payload.clone(),
                    SecurityFlags::NONE,
                    Some(*network_id),
                )?,
            }
            self.metrics.variable_update();
        }
        Ok(outbound.len())
    }
}
