//! Server-side connection handling and the object authority operations.

use bytes::Bytes;
use glam::Vec3;
use tracing::{debug, info, instrument, warn};

use super::{EngineEvent, NetworkEngine};
use crate::core::{BitReader, BitWriter, ValueKind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::{
    handle_connection_request, ApprovalDecision, ConnectionState, RequestOutcome,
};
use crate::protocol::context::{CreateObject, ParentLink};
use crate::protocol::handshake::{server_build_hail, server_process_hail_response, write_greeting};
use crate::protocol::message::{
    ClientId, MessageType, NetworkId, SecurityFlags, INTERNAL_CHANNEL, SERVER_CLIENT_ID,
};
use crate::protocol::rpc::{write_rpc_call, RpcResponse};
use crate::protocol::scene::SwitchId;
use crate::protocol::spawn::{
    apply_ownership_change, despawn, write_initial_batch, write_standalone, SpawnIdentity,
    SpawnRecord, Transform, MAX_BATCH_LEN,
};
use crate::protocol::time::write_time_sync;
use crate::replication::NetworkedObject;

/// A server-initiated spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub owner_client_id: ClientId,
    pub is_player_object: bool,
    pub identity: SpawnIdentity,
    pub parent_network_id: Option<NetworkId>,
    pub transform: Option<Transform>,
    /// Forwarded untouched to every client's spawner
    pub payload: Option<Bytes>,
}

impl SpawnRequest {
    pub fn prefab(prefab_hash: u64) -> Self {
        Self {
            owner_client_id: SERVER_CLIENT_ID,
            is_player_object: false,
            identity: SpawnIdentity::Prefab { prefab_hash },
            parent_network_id: None,
            transform: None,
            payload: None,
        }
    }

    pub fn scene_object(instance_id: u64) -> Self {
        Self {
            identity: SpawnIdentity::SceneObject { instance_id },
            ..Self::prefab(0)
        }
    }

    pub fn with_owner(mut self, owner_client_id: ClientId) -> Self {
        self.owner_client_id = owner_client_id;
        self
    }

    pub fn with_parent(mut self, parent_network_id: NetworkId) -> Self {
        self.parent_network_id = Some(parent_network_id);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

impl NetworkEngine {
    fn require_server(&self, operation: &str) -> Result<()> {
        if self.is_server() {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedMessage(format!(
                "{operation} is only available on the server"
            )))
        }
    }

    /// Transport reported a new connection.
    #[instrument(skip(self))]
    pub fn on_client_connected(&mut self, client_id: ClientId) -> Result<()> {
        self.require_server("on_client_connected")?;
        let encryption = self.config.security.enable_encryption;
        self.connections.open(client_id, encryption);

        if !encryption {
            debug!(client_id, "Awaiting connection request");
            return Ok(());
        }

        self.metrics.handshake_attempt();
        let (exchange, hail) =
            match server_build_hail(&self.config.security, self.identity.as_ref()) {
                Ok(built) => built,
                Err(e) => {
                    self.metrics.handshake_failed();
                    self.drop_client(client_id);
                    return Err(e);
                }
            };
        if let Some(record) = self.connections.get_mut(client_id) {
            record.set_key_exchange(exchange);
        }
        self.send_internal(client_id, MessageType::HailRequest, hail)
    }

    /// Transport reported a lost connection.
    #[instrument(skip(self))]
    pub fn on_client_disconnected(&mut self, client_id: ClientId) -> Result<()> {
        self.require_server("on_client_disconnected")?;
        let Some(record) = self.connections.remove(client_id) else {
            debug!(client_id, "Disconnect for unknown client ignored");
            return Ok(());
        };

        if record.is_connected() {
            self.metrics.connection_closed();
            let owned = self.registry.owned_by(client_id);
            if !owned.is_empty() {
                debug!(client_id, count = owned.len(), "Despawning objects of departed client");
                self.despawn_objects(&owned)?;
            }
        }
        self.events.push(EngineEvent::ClientDisconnected { client_id });
        info!(client_id, "Client disconnected");
        Ok(())
    }

    /// Forget a client and ask the transport to close it.
    pub(crate) fn drop_client(&mut self, client_id: ClientId) {
        self.sender.disconnect(client_id);
        if let Err(e) = self.on_client_disconnected(client_id) {
            warn!(client_id, error = %e, "Cleanup after disconnect failed");
        }
    }

    pub(super) fn handle_hail_response(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        let encryption = self.config.security.enable_encryption;
        let Some(record) = self.connections.get_mut(sender) else {
            return Err(ProtocolError::UnknownClient(sender));
        };
        if !encryption || record.state() != ConnectionState::AwaitingHail {
            debug!(sender, state = ?record.state(), "Ignoring hail response");
            return Ok(());
        }

        let exchange = record
            .take_key_exchange()
            .ok_or_else(|| ProtocolError::handshake(constants::ERR_KEY_EXCHANGE_CONSUMED))?;
        let key = match server_process_hail_response(exchange, reader) {
            Ok(key) => key,
            Err(e) => {
                self.metrics.handshake_failed();
                return Err(e);
            }
        };
        record.set_symmetric_key(key);
        record.advance(ConnectionState::AwaitingConnection);
        self.metrics.handshake_success();

        let mut writer = self.buffers.writer();
        write_greeting(&mut writer);
        let greeting = writer.finish();
        self.send_internal(sender, MessageType::Greeting, greeting)
    }

    pub(super) fn handle_connection_request(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        match self.connections.state(sender) {
            None => return Err(ProtocolError::UnknownClient(sender)),
            Some(ConnectionState::AwaitingConnection) => {}
            Some(state) => {
                warn!(sender, ?state, "Connection request in the wrong state");
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "connection request from client {sender} in state {state:?}"
                )));
            }
        }

        let outcome = match handle_connection_request(&self.config, sender, reader) {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, ProtocolError::ConfigMismatch { .. }) {
                    self.metrics.config_mismatch();
                }
                return Err(e);
            }
        };

        match outcome {
            RequestOutcome::Approved(decision) => self.apply_approval(decision),
            RequestOutcome::AwaitingApproval { payload } => {
                if let Some(record) = self.connections.get_mut(sender) {
                    record.advance(ConnectionState::AwaitingApproval);
                }
                let responder = self.connections.responder(sender);
                if let Some(approval) = self.approval.as_mut() {
                    approval.approve(&payload, sender, responder);
                } else {
                    warn!(sender, "Connection approval enabled without a hook; approving");
                    responder.approve();
                }
                // decisions made inside the hook apply immediately
                self.poll_approvals()?;
                Ok(())
            }
        }
    }

    /// Apply every approval decision delivered so far. Returns how many were applied.
    pub fn poll_approvals(&mut self) -> Result<usize> {
        let decisions = self.connections.drain_decisions();
        let count = decisions.len();
        for decision in decisions {
            self.apply_approval(decision)?;
        }
        Ok(count)
    }

    #[instrument(skip(self), fields(client_id = decision.client_id, approved = decision.approved))]
    fn apply_approval(&mut self, decision: ApprovalDecision) -> Result<()> {
        let client_id = decision.client_id;
        match self.connections.state(client_id) {
            Some(ConnectionState::AwaitingConnection | ConnectionState::AwaitingApproval) => {}
            Some(state) => {
                warn!(client_id, ?state, "Approval decision for a client not awaiting one");
                return Ok(());
            }
            None => {
                debug!(client_id, "Approval decision for a departed client");
                return Ok(());
            }
        }

        if !decision.approved {
            self.metrics.approval_rejected();
            self.events.push(EngineEvent::ClientRejected { client_id });
            self.sender.disconnect(client_id);
            self.connections.remove(client_id);
            info!(client_id, "Connection rejected");
            return Ok(());
        }

        if let Some(record) = self.connections.get_mut(client_id) {
            record.advance(ConnectionState::Connected);
        }
        self.metrics.connection_established();

        if decision.create_player_object {
            match decision
                .player_prefab_hash
                .or(self.config.protocol.player_prefab_hash)
            {
                Some(prefab_hash) => {
                    let transform = match (decision.position, decision.rotation) {
                        (None, None) => None,
                        (position, rotation) => Some(Transform::new(
                            position.unwrap_or(Vec3::ZERO),
                            rotation.unwrap_or(Vec3::ZERO),
                        )),
                    };
                    let request = SpawnRequest {
                        owner_client_id: client_id,
                        is_player_object: true,
                        identity: SpawnIdentity::Prefab { prefab_hash },
                        parent_network_id: None,
                        transform,
                        payload: None,
                    };
                    self.spawn_with_exclusion(request, Some(client_id))?;
                }
                None => warn!(client_id, "Player object requested but no player prefab is known"),
            }
        }

        let mut writer = self.buffers.writer();
        writer.write_u64_packed(client_id);
        writer.write_u32_packed(self.scenes.current_scene_index());
        self.scenes.current_switch_id().write(&mut writer);
        writer.write_f32_packed(self.clock.network_time());
        write_initial_batch(&self.registry, &mut writer, &self.config.protocol)?;
        let payload = writer.finish();

        self.send_message(
            client_id,
            MessageType::ConnectionApproved,
            INTERNAL_CHANNEL,
            payload,
            self.connection_security(),
            None,
        )?;
        self.events.push(EngineEvent::ClientConnected { client_id });
        info!(client_id, objects = self.registry.len(), "Client connected");
        Ok(())
    }

    pub(super) fn handle_client_switch_completed(
        &mut self,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        let switch_id = SwitchId::read(reader)?;
        self.scenes.on_client_switch_completed(sender, switch_id);
        Ok(())
    }

    fn allocate_network_id(&mut self) -> NetworkId {
        while self.registry.contains(self.next_network_id) {
            self.next_network_id += 1;
        }
        let id = self.next_network_id;
        self.next_network_id += 1;
        id
    }

    /// Create and register an object locally, without announcing it.
    fn create_server_object(&mut self, request: &SpawnRequest) -> Result<NetworkId> {
        let network_id = self.allocate_network_id();
        let record = SpawnRecord {
            is_player_object: request.is_player_object,
            network_id,
            owner_client_id: request.owner_client_id,
            parent_network_id: request.parent_network_id,
            identity: request.identity,
            transform: request.transform,
            payload: None,
        };
        let parent = match request.parent_network_id {
            None => ParentLink::None,
            Some(parent_id) => match self.registry.get(parent_id) {
                Some(parent) => ParentLink::Resolved(parent.handle()),
                None => ParentLink::Pending(parent_id),
            },
        };
        let local = self.spawner.create_local_object(&CreateObject {
            network_id,
            owner_client_id: request.owner_client_id,
            is_player_object: request.is_player_object,
            identity: request.identity,
            parent,
            transform: request.transform,
        })?;

        let object = NetworkedObject::new(&record, local);
        let handle = object.handle();
        for child_id in self.registry.insert(object)? {
            if let Some(child) = self.registry.get(child_id) {
                self.spawner.attach_to_parent(child.handle(), handle);
            }
        }
        if let Some(object) = self.registry.get(network_id) {
            self.spawner
                .spawn_locally(object, request.payload.as_deref());
        }
        self.metrics.object_spawned();
        Ok(network_id)
    }

    fn spawn_with_exclusion(
        &mut self,
        request: SpawnRequest,
        except: Option<ClientId>,
    ) -> Result<NetworkId> {
        let network_id = self.create_server_object(&request)?;
        let mut writer = BitWriter::new();
        if let Some(object) = self.registry.get(network_id) {
            write_standalone(object, request.payload, &mut writer, &self.config.protocol)?;
        }
        self.broadcast(
            MessageType::AddObject,
            &writer.into_bytes(),
            except,
            Some(network_id),
        )?;
        debug!(network_id, "Object spawned and announced");
        Ok(network_id)
    }

    /// Spawn one object and announce it to every connected client.
    pub fn spawn_object(&mut self, request: SpawnRequest) -> Result<NetworkId> {
        self.require_server("spawn_object")?;
        self.spawn_with_exclusion(request, None)
    }

    /// Spawn several objects and announce them as one batch, in order.
    ///
    /// All or nothing: if any request fails, the objects already created for
    /// the batch are destroyed again and nothing is announced.
    pub fn spawn_objects(&mut self, requests: Vec<SpawnRequest>) -> Result<Vec<NetworkId>> {
        self.require_server("spawn_objects")?;
        let count = u16::try_from(requests.len()).map_err(|_| ProtocolError::BatchTooLarge {
            len: requests.len(),
            max: MAX_BATCH_LEN,
        })?;

        let mut ids = Vec::with_capacity(requests.len());
        let mut payloads = Vec::with_capacity(requests.len());
        for request in requests {
            match self.create_server_object(&request) {
                Ok(network_id) => {
                    ids.push(network_id);
                    payloads.push(request.payload);
                }
                Err(e) => {
                    self.roll_back_spawns(&ids);
                    return Err(e);
                }
            }
        }

        let mut writer = BitWriter::new();
        writer.write_u16_packed(count);
        for (network_id, payload) in ids.iter().zip(payloads) {
            if let Some(object) = self.registry.get(*network_id) {
                write_standalone(object, payload, &mut writer, &self.config.protocol)?;
            }
        }
        self.broadcast(MessageType::AddObjects, &writer.into_bytes(), None, None)?;
        Ok(ids)
    }

    fn roll_back_spawns(&mut self, network_ids: &[NetworkId]) {
        let mut ctx = self.spawn_context();
        for network_id in network_ids.iter().rev() {
            despawn(&mut ctx, *network_id);
        }
        if !network_ids.is_empty() {
            warn!(count = network_ids.len(), "Batch spawn failed; created objects removed");
        }
    }

    /// Destroy an object here and on every client.
    pub fn despawn_object(&mut self, network_id: NetworkId) -> Result<bool> {
        self.require_server("despawn_object")?;
        if !despawn(&mut self.spawn_context(), network_id) {
            return Ok(false);
        }
        let mut writer = self.buffers.writer();
        writer.write_u64_packed(network_id);
        let payload = writer.finish();
        self.broadcast(MessageType::DestroyObject, &payload, None, Some(network_id))?;
        Ok(true)
    }

    /// Destroy several objects. Unknown ids are skipped. The announcement is
    /// split into messages of at most [`MAX_BATCH_LEN`] ids.
    pub fn despawn_objects(&mut self, network_ids: &[NetworkId]) -> Result<usize> {
        self.require_server("despawn_objects")?;
        let removed: Vec<NetworkId> = {
            let mut ctx = self.spawn_context();
            network_ids
                .iter()
                .copied()
                .filter(|id| despawn(&mut ctx, *id))
                .collect()
        };
        if removed.is_empty() {
            return Ok(0);
        }

        for chunk in removed.chunks(MAX_BATCH_LEN) {
            let mut writer = self.buffers.writer();
            writer.write_u16_packed(u16::try_from(chunk.len()).unwrap_or(u16::MAX));
            for network_id in chunk {
                writer.write_u64_packed(*network_id);
            }
            let payload = writer.finish();
            self.broadcast(MessageType::DestroyObjects, &payload, None, None)?;
        }
        Ok(removed.len())
    }

    /// Hand an object to another owner and tell every client.
    pub fn change_ownership(&mut self, network_id: NetworkId, new_owner: ClientId) -> Result<bool> {
        self.require_server("change_ownership")?;
        if !apply_ownership_change(&mut self.registry, SERVER_CLIENT_ID, network_id, new_owner)? {
            return Ok(false);
        }
        self.metrics.ownership_changed();

        let mut writer = self.buffers.writer();
        writer.write_u64_packed(network_id);
        writer.write_u64_packed(new_owner);
        let payload = writer.finish();
        self.broadcast(MessageType::ChangeOwner, &payload, None, Some(network_id))?;
        Ok(true)
    }

    /// Broadcast the server's network time.
    pub fn send_time_sync(&mut self) -> Result<()> {
        self.require_server("send_time_sync")?;
        let mut writer = self.buffers.writer();
        write_time_sync(&mut writer, self.clock.network_time());
        let payload = writer.finish();
        self.broadcast(MessageType::TimeSync, &payload, None, None)
    }

    /// Tell every client to load `scene_index` and resync the object set.
    /// The host must already have switched the server's own scene.
    pub fn switch_scene(&mut self, scene_index: u32) -> Result<SwitchId> {
        self.require_server("switch_scene")?;
        let switch_id = SwitchId::generate()?;

        let mut writer = BitWriter::new();
        writer.write_u32_packed(scene_index);
        switch_id.write(&mut writer);
        write_initial_batch(&self.registry, &mut writer, &self.config.protocol)?;
        self.broadcast(MessageType::SwitchScene, &writer.into_bytes(), None, None)?;
        info!(scene_index, "Scene switch announced");
        Ok(switch_id)
    }

    /// Invoke a client RPC without expecting a result.
    pub fn send_client_rpc(
        &mut self,
        target: ClientId,
        network_id: NetworkId,
        behaviour_index: u16,
        method_hash: u64,
        args: &[u8],
    ) -> Result<()> {
        self.require_server("send_client_rpc")?;
        let mut writer = self.buffers.writer();
        write_rpc_call(&mut writer, network_id, behaviour_index, method_hash, None, args);
        let payload = writer.finish();
        self.send_message(
            target,
            MessageType::ClientRpc,
            INTERNAL_CHANNEL,
            payload,
            SecurityFlags::NONE,
            None,
        )
    }

    /// Invoke a client RPC and register for its `expected` result.
    pub fn request_client_rpc(
        &mut self,
        target: ClientId,
        network_id: NetworkId,
        behaviour_index: u16,
        method_hash: u64,
        args: &[u8],
        expected: ValueKind,
    ) -> Result<RpcResponse> {
        self.require_server("request_client_rpc")?;
        let response = self.responses.register(expected, Some(target))?;
        let mut writer = self.buffers.writer();
        write_rpc_call(
            &mut writer,
            network_id,
            behaviour_index,
            method_hash,
            Some(response.response_id()),
            args,
        );
        let payload = writer.finish();
        if let Err(e) = self.send_message(
            target,
            MessageType::ClientRpcRequest,
            INTERNAL_CHANNEL,
            payload,
            SecurityFlags::NONE,
            None,
        ) {
            self.responses.abandon(response.response_id());
            return Err(e);
        }
        self.metrics.rpc_invoked();
        Ok(response)
    }
}
