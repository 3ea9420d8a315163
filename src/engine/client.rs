//! Client-side connection flow and scene continuation.

use tracing::{debug, info, instrument, warn};

use super::{EngineEvent, NetworkEngine};
use crate::core::{BitReader, ValueKind};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::write_connection_request;
use crate::protocol::handshake::{client_process_hail, read_greeting};
use crate::protocol::message::{MessageType, NetworkId, SecurityFlags, INTERNAL_CHANNEL, SERVER_CLIENT_ID};
use crate::protocol::rpc::{write_rpc_call, RpcResponse};
use crate::protocol::scene::{
    read_switch_scene, SceneTask, SceneTaskKind, StreamContinuation, SwitchId,
};
use crate::protocol::spawn::spawn_initial_batch;

impl NetworkEngine {
    fn require_client(&self, operation: &str) -> Result<()> {
        if self.is_server() {
            Err(ProtocolError::UnexpectedMessage(format!(
                "{operation} is only available on a client"
            )))
        } else {
            Ok(())
        }
    }

    /// Start connecting. With encryption the request waits for the greeting;
    /// otherwise it is sent right away.
    #[instrument(skip(self, approval_payload))]
    pub fn connect(&mut self, approval_payload: Vec<u8>) -> Result<()> {
        self.require_client("connect")?;
        if self.config.security.enable_encryption {
            debug!("Connection request deferred until handshake completes");
            self.session.set_pending_request(approval_payload);
            Ok(())
        } else {
            self.send_connection_request(&approval_payload)
        }
    }

    fn send_connection_request(&mut self, payload: &[u8]) -> Result<()> {
        let mut writer = self.buffers.writer();
        write_connection_request(&mut writer, &self.config, payload);
        let request = writer.finish();
        self.send_message(
            SERVER_CLIENT_ID,
            MessageType::ConnectionRequest,
            INTERNAL_CHANNEL,
            request,
            self.connection_security(),
            None,
        )
    }

    /// The transport lost the server. Local replication state is discarded.
    pub fn on_disconnected(&mut self) -> Result<()> {
        self.require_client("on_disconnected")?;
        if self.session.is_connected() {
            self.metrics.connection_closed();
        }
        let objects = self.registry.clear();
        for object in &objects {
            self.spawner.destroy(object.network_id(), object.handle());
        }
        self.scene_tasks.clear();
        self.session.reset();
        self.events.push(EngineEvent::ClientDisconnected {
            client_id: SERVER_CLIENT_ID,
        });
        info!(destroyed = objects.len(), "Disconnected from server");
        Ok(())
    }

    pub(super) fn handle_hail_request(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        self.metrics.handshake_attempt();
        let hail = match client_process_hail(
            &self.config.security,
            reader,
            self.certificates.as_deref(),
        ) {
            Ok(hail) => hail,
            Err(e) => {
                self.metrics.handshake_failed();
                return Err(e);
            }
        };
        if let Some(key) = hail.key {
            self.session.set_symmetric_key(key);
        }
        self.metrics.handshake_success();
        self.send_internal(SERVER_CLIENT_ID, MessageType::HailResponse, hail.response)
    }

    pub(super) fn handle_greeting(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let timestamp = read_greeting(reader)?;
        debug!(timestamp, "Greeting received");
        let payload = self.session.take_pending_request().unwrap_or_default();
        self.send_connection_request(&payload)
    }

    pub(super) fn handle_connection_approved(
        &mut self,
        receive_time: f32,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        let client_id = reader.read_u64_packed()?;
        let scene_index = reader.read_u32_packed()?;
        let switch_id = SwitchId::read(reader)?;
        let net_time = reader.read_f32_packed()?;

        self.session.set_local_client_id(client_id);
        let rtt = self.sender.current_rtt(SERVER_CLIENT_ID);
        self.clock
            .update_network_time(net_time, receive_time, rtt, true);

        if self.scenes.has_mismatch(scene_index) {
            let continuation = StreamContinuation::capture(reader);
            self.scenes.on_first_switch_sync(scene_index, switch_id);
            self.scene_tasks.suspend(SceneTask {
                kind: SceneTaskKind::FirstSync,
                scene_index,
                switch_id,
                continuation,
            });
            return Ok(());
        }

        spawn_initial_batch(&mut self.spawn_context(), reader)?;
        self.finish_connecting(client_id);
        Ok(())
    }

    fn finish_connecting(&mut self, client_id: u64) {
        self.session.mark_connected();
        self.metrics.connection_established();
        self.events.push(EngineEvent::ClientConnected { client_id });
        info!(client_id, "Connected to server");
    }

    pub(super) fn handle_switch_scene(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        let task = read_switch_scene(reader)?;
        self.scenes
            .on_switch(task.scene_index, task.switch_id, &task.continuation);
        self.scene_tasks.suspend(task);
        Ok(())
    }

    /// The host finished loading the scene a suspended batch waits for.
    /// Without a pending task this does nothing.
    ///
    /// A batch that fails to decode is handled like a bad inbound message: the
    /// server is disconnected when the error is fatal.
    #[instrument(skip(self))]
    pub fn on_scene_loaded(&mut self) -> Result<()> {
        let Some(task) = self.scene_tasks.take() else {
            debug!("Scene loaded with no suspended batch");
            return Ok(());
        };
        self.metrics.scene_replayed();

        let result = self.replay_scene_task(task);
        if let Err(e) = &result {
            self.apply_error_policy(SERVER_CLIENT_ID, e);
        }
        result
    }

    fn replay_scene_task(&mut self, task: SceneTask) -> Result<()> {
        if task.kind == SceneTaskKind::Switch {
            // the batch carries the complete object set for the new scene
            let objects = self.registry.clear();
            for object in &objects {
                self.spawner.destroy(object.network_id(), object.handle());
            }
        }

        let mut reader = task.continuation.reader();
        spawn_initial_batch(&mut self.spawn_context(), &mut reader)?;
        if !reader.is_empty() {
            warn!(trailing = reader.remaining(), "Unread bytes after replayed spawn batch");
        }

        match task.kind {
            SceneTaskKind::FirstSync => {
                let client_id = self
                    .session
                    .local_client_id()
                    .ok_or_else(|| ProtocolError::Custom("First sync without a client id".into()))?;
                self.finish_connecting(client_id);
            }
            SceneTaskKind::Switch => {
                let mut writer = self.buffers.writer();
                task.switch_id.write(&mut writer);
                let payload = writer.finish();
                self.send_internal(
                    SERVER_CLIENT_ID,
                    MessageType::ClientSwitchSceneCompleted,
                    payload,
                )?;
                self.events.push(EngineEvent::SceneSwitched {
                    scene_index: task.scene_index,
                    switch_id: task.switch_id,
                });
            }
        }
        Ok(())
    }

    /// Invoke a server RPC without expecting a result.
    pub fn send_server_rpc(
        &mut self,
        network_id: NetworkId,
        behaviour_index: u16,
        method_hash: u64,
        args: &[u8],
    ) -> Result<()> {
        self.require_client("send_server_rpc")?;
        let mut writer = self.buffers.writer();
        write_rpc_call(&mut writer, network_id, behaviour_index, method_hash, None, args);
        let payload = writer.finish();
        self.send_message(
            SERVER_CLIENT_ID,
            MessageType::ServerRpc,
            INTERNAL_CHANNEL,
            payload,
            SecurityFlags::NONE,
            Some(network_id),
        )
    }

    /// Invoke a server RPC and register for its `expected` result.
    pub fn request_server_rpc(
        &mut self,
        network_id: NetworkId,
        behaviour_index: u16,
        method_hash: u64,
        args: &[u8],
        expected: ValueKind,
    ) -> Result<RpcResponse> {
        self.require_client("request_server_rpc")?;
        let response = self.responses.register(expected, None)?;
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
            SERVER_CLIENT_ID,
            MessageType::ServerRpcRequest,
            INTERNAL_CHANNEL,
            payload,
            SecurityFlags::NONE,
            Some(network_id),
        ) {
            self.responses.abandon(response.response_id());
            return Err(e);
        }
        self.metrics.rpc_invoked();
        Ok(response)
    }
}
