//! Inbound message routing.
//!
//! Every message passes the same gates before its handler runs:
//!
//! 1. the message type must be handled by this engine's role
//! 2. on the server, the sender must have a connection record, and only
//!    hail-response and connection-request are accepted before it is connected
//! 3. sealed payloads are opened with the sender's key
//!
//! Handler errors are logged and counted. Errors that are fatal for the peer
//! (see [`ProtocolError::is_fatal_for_peer`]) also disconnect it.

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::NetworkEngine;
use crate::core::BitReader;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{
    decode_frame, ClientId, InboundMessage, MessageType, Role, SERVER_CLIENT_ID,
};
use crate::protocol::rpc::{
    handle_rpc, handle_rpc_request, handle_rpc_response, RpcContext, RpcDirection,
};
use crate::protocol::spawn::{
    handle_add_object, handle_add_objects, handle_change_owner, handle_destroy_object,
    handle_destroy_objects,
};
use crate::protocol::sync::{handle_variable_message, SyncContext, SyncShape};
use crate::protocol::time::handle_time_sync;

impl NetworkEngine {
    /// Decode a `[tag][payload]` frame and process it.
    pub fn handle_frame(&mut self, sender: ClientId, frame: Bytes, receive_time: f32) -> Result<()> {
        let message = decode_frame(sender, frame)?.with_receive_time(receive_time);
        self.handle_message(message)
    }

    /// Process one inbound message.
    #[instrument(
        skip(self, message),
        fields(role = ?self.role, sender = message.sender, message_type = %message.message_type)
    )]
    pub fn handle_message(&mut self, message: InboundMessage) -> Result<()> {
        self.metrics.message_received(message.payload.len() as u64);

        if let Err(e) = self.admit(&message) {
            self.metrics.message_dropped();
            return Err(e);
        }

        let sender = message.sender;
        let result = self.open_and_route(message);
        if let Err(e) = &result {
            self.apply_error_policy(sender, e);
        }
        result
    }

    /// Disconnect `peer` for errors fatal to it; count anything else as a drop.
    pub(super) fn apply_error_policy(&mut self, peer: ClientId, error: &ProtocolError) {
        if error.is_fatal_for_peer() {
            self.metrics.protocol_error();
            warn!(peer, %error, "Fatal protocol error; disconnecting peer");
            match self.role {
                Role::Server => self.drop_client(peer),
                Role::Client => self.sender.disconnect(peer),
            }
        } else {
            self.metrics.message_dropped();
            debug!(peer, %error, "Message dropped");
        }
    }

    fn admit(&self, message: &InboundMessage) -> Result<()> {
        let message_type = message.message_type;
        if !message_type.handled_by(self.role) {
            warn!(%message_type, role = ?self.role, "Message not handled by this role");
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{message_type} is not accepted by the {:?}",
                self.role
            )));
        }

        if self.role == Role::Server {
            let record = self
                .connections
                .get(message.sender)
                .ok_or(ProtocolError::UnknownClient(message.sender))?;
            if !record.is_connected() && !message_type.allowed_while_pending() {
                warn!(
                    sender = message.sender,
                    %message_type,
                    state = ?record.state(),
                    "Message from a client that has not finished connecting"
                );
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "{message_type} before connection completed"
                )));
            }
        }
        Ok(())
    }

    fn open_and_route(&mut self, message: InboundMessage) -> Result<()> {
        let payload = if message.security.is_sealed() {
            self.open(message.sender, &message.payload)?
        } else {
            message.payload.clone()
        };
        let mut reader = BitReader::new(&payload);
        self.route(&message, &mut reader)
    }

    fn route(&mut self, message: &InboundMessage, reader: &mut BitReader<'_>) -> Result<()> {
        let sender = message.sender;
        match message.message_type {
            MessageType::HailRequest => self.handle_hail_request(reader),
            MessageType::HailResponse => self.handle_hail_response(sender, reader),
            MessageType::Greeting => self.handle_greeting(reader),
            MessageType::ConnectionRequest => self.handle_connection_request(sender, reader),
            MessageType::ConnectionApproved => {
                self.handle_connection_approved(message.receive_time, reader)
            }
            MessageType::AddObject => handle_add_object(&mut self.spawn_context(), reader).map(|_| ()),
            MessageType::AddObjects => {
                handle_add_objects(&mut self.spawn_context(), reader).map(|_| ())
            }
            MessageType::DestroyObject => handle_destroy_object(&mut self.spawn_context(), reader),
            MessageType::DestroyObjects => {
                handle_destroy_objects(&mut self.spawn_context(), reader)
            }
            MessageType::SwitchScene => self.handle_switch_scene(reader),
            MessageType::ClientSwitchSceneCompleted => {
                self.handle_client_switch_completed(sender, reader)
            }
            MessageType::ChangeOwner => handle_change_owner(&mut self.spawn_context(), reader),
            MessageType::TimeSync => {
                let rtt = self.sender.current_rtt(SERVER_CLIENT_ID);
                handle_time_sync(&mut self.clock, reader, message.receive_time, rtt).map(|_| ())
            }
            MessageType::NetworkedVarDelta => self.apply_variables(sender, SyncShape::Delta, reader),
            MessageType::NetworkedVarUpdate => self.apply_variables(sender, SyncShape::Full, reader),
            MessageType::ServerRpc => self.invoke_rpc(RpcDirection::Server, sender, reader),
            MessageType::ClientRpc => self.invoke_rpc(RpcDirection::Client, sender, reader),
            MessageType::ServerRpcRequest => {
                self.invoke_rpc_request(RpcDirection::Server, message, reader)
            }
            MessageType::ClientRpcRequest => {
                self.invoke_rpc_request(RpcDirection::Client, message, reader)
            }
            MessageType::ServerRpcResponse => {
                handle_rpc_response(&self.responses, &self.metrics, RpcDirection::Server, sender, reader)
                    .map(|_| ())
            }
            MessageType::ClientRpcResponse => {
                handle_rpc_response(&self.responses, &self.metrics, RpcDirection::Client, sender, reader)
                    .map(|_| ())
            }
            MessageType::UnnamedMessage => self.custom.handle_unnamed(sender, reader),
            MessageType::NamedMessage => self.custom.handle_named(sender, reader),
        }
    }

    fn apply_variables(
        &mut self,
        sender: ClientId,
        shape: SyncShape,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        let mut ctx = SyncContext {
            enabled: self.config.protocol.enable_networked_var,
            role: self.role,
            registry: &mut self.registry,
        };
        let changed = handle_variable_message(&mut ctx, sender, shape, reader)?;
        if !changed.is_empty() {
            self.metrics.variable_update();
        }
        Ok(())
    }

    fn rpc_context(&mut self) -> RpcContext<'_> {
        RpcContext {
            registry: &mut self.registry,
            buffers: &self.buffers,
            metrics: &self.metrics,
        }
    }

    fn invoke_rpc(
        &mut self,
        direction: RpcDirection,
        sender: ClientId,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        handle_rpc(&mut self.rpc_context(), direction, sender, reader)
    }

    fn invoke_rpc_request(
        &mut self,
        direction: RpcDirection,
        message: &InboundMessage,
        reader: &mut BitReader<'_>,
    ) -> Result<()> {
        let reply = handle_rpc_request(&mut self.rpc_context(), direction, message.sender, reader)?;
        match reply {
            Some(reply) => self.send_message(
                message.sender,
                reply.message_type,
                &message.channel,
                reply.payload,
                message.security,
                reply.context,
            ),
            None => Ok(()),
        }
    }
}
