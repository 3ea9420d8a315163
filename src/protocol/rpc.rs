//! RPC dispatch and response correlation.
//!
//! ```text
//! call:      [network_id: u64p] [behaviour: u16p] [method_hash: u64p] [args...]
//! request:   [network_id: u64p] [behaviour: u16p] [method_hash: u64p] [response_id: u64p] [args...]
//! response:  [response_id: u64p] [value]
//! ```
//!
//! Responses are matched against a [`PendingResponseTable`] shared with the
//! code that issued the requests. Each entry resolves at most once and is
//! removed exactly once (on resolve, abandon or expiry).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::core::{BitReader, BitWriter, Value, ValueKind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ClientId, MessageType, NetworkId, ResponseId};
use crate::replication::SpawnedObjectRegistry;
use crate::utils::{Metrics, WriterPool};

/// Where an RPC executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcDirection {
    /// Invoked by a client, executed on the server
    Server,
    /// Invoked by the server, executed on a client
    Client,
}

impl RpcDirection {
    pub fn response_type(self) -> MessageType {
        match self {
            RpcDirection::Server => MessageType::ServerRpcResponse,
            RpcDirection::Client => MessageType::ClientRpcResponse,
        }
    }
}

/// Decoded addressing of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcCall {
    pub direction: RpcDirection,
    pub sender: ClientId,
    pub network_id: NetworkId,
    pub behaviour_index: u16,
    pub method_hash: u64,
}

impl RpcCall {
    fn read(direction: RpcDirection, sender: ClientId, reader: &mut BitReader<'_>) -> Result<Self> {
        Ok(Self {
            direction,
            sender,
            network_id: reader.read_u64_packed()?,
            behaviour_index: reader.read_u16_packed()?,
            method_hash: reader.read_u64_packed()?,
        })
    }
}

struct PendingResponse {
    expected: ValueKind,
    client_id: Option<ClientId>,
    deadline: Instant,
    tx: oneshot::Sender<Value>,
}

struct ResponseTable {
    entries: HashMap<ResponseId, PendingResponse>,
    next_id: ResponseId,
}

/// Outstanding RPC responses, shared between the engine and request issuers.
#[derive(Clone)]
pub struct PendingResponseTable {
    inner: Arc<Mutex<ResponseTable>>,
    timeout: Duration,
}

/// Result of delivering a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Resolved(ResponseId),
    /// No entry with that id; dropped.
    Unknown(ResponseId),
    /// The entry expects another peer; dropped, entry kept.
    PeerMismatch(ResponseId),
}

impl PendingResponseTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResponseTable {
                entries: HashMap::new(),
                next_id: 1,
            })),
            timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ResponseTable>> {
        self.inner
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))
    }

    /// Reserve a response id. `client_id` is the peer expected to answer;
    /// it is checked for client-rpc responses.
    pub fn register(&self, expected: ValueKind, client_id: Option<ClientId>) -> Result<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock()?;
        let mut response_id = table.next_id;
        while table.entries.contains_key(&response_id) {
            response_id = response_id.wrapping_add(1);
        }
        table.next_id = response_id.wrapping_add(1);
        table.entries.insert(
            response_id,
            PendingResponse {
                expected,
                client_id,
                deadline: Instant::now() + self.timeout,
                tx,
            },
        );
        Ok(RpcResponse {
            response_id,
            rx,
            result: None,
            abandoned: false,
        })
    }

    pub fn contains(&self, response_id: ResponseId) -> bool {
        self.lock()
            .map(|t| t.entries.contains_key(&response_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver the response carried by `reader`.
    pub fn resolve(
        &self,
        peer: ClientId,
        check_peer: bool,
        reader: &mut BitReader<'_>,
    ) -> Result<ResponseOutcome> {
        let response_id = reader.read_u64_packed()?;

        let entry = {
            let mut table = self.lock()?;
            match table.entries.get(&response_id) {
                None => {
                    debug!(response_id, peer, "Response for unknown id dropped");
                    return Ok(ResponseOutcome::Unknown(response_id));
                }
                Some(entry) if check_peer && entry.client_id != Some(peer) => {
                    warn!(
                        response_id,
                        peer,
                        expected = ?entry.client_id,
                        "Response from unexpected peer dropped"
                    );
                    return Ok(ResponseOutcome::PeerMismatch(response_id));
                }
                Some(_) => table.entries.remove(&response_id),
            }
        };

        let Some(entry) = entry else {
            return Ok(ResponseOutcome::Unknown(response_id));
        };
        let value = Value::read_from(entry.expected, reader)?;
        if entry.tx.send(value).is_err() {
            debug!(response_id, "Response arrived after the handle was dropped");
        }
        Ok(ResponseOutcome::Resolved(response_id))
    }

    /// Remove an entry without completing it.
    pub fn abandon(&self, response_id: ResponseId) -> bool {
        self.lock()
            .map(|mut t| t.entries.remove(&response_id).is_some())
            .unwrap_or(false)
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<ResponseId> {
        let Ok(mut table) = self.lock() else {
            return Vec::new();
        };
        let expired: Vec<ResponseId> = table
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            table.entries.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired pending responses");
        }
        expired
    }
}

/// Completion state of a registered response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Pending,
    Resolved,
    Abandoned,
}

/// Caller-side handle for one registered response.
#[derive(Debug)]
pub struct RpcResponse {
    response_id: ResponseId,
    rx: oneshot::Receiver<Value>,
    result: Option<Value>,
    abandoned: bool,
}

impl RpcResponse {
    pub fn response_id(&self) -> ResponseId {
        self.response_id
    }

    fn poll(&mut self) {
        if self.result.is_some() || self.abandoned {
            return;
        }
        match self.rx.try_recv() {
            Ok(value) => self.result = Some(value),
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => self.abandoned = true,
        }
    }

    pub fn status(&mut self) -> ResponseStatus {
        self.poll();
        if self.result.is_some() {
            ResponseStatus::Resolved
        } else if self.abandoned {
            ResponseStatus::Abandoned
        } else {
            ResponseStatus::Pending
        }
    }

    pub fn is_done(&mut self) -> bool {
        self.status() != ResponseStatus::Pending
    }

    pub fn is_successful(&mut self) -> bool {
        self.status() == ResponseStatus::Resolved
    }

    pub fn result(&mut self) -> Option<&Value> {
        self.poll();
        self.result.as_ref()
    }

    /// Wait for the response.
    pub async fn wait(self) -> Result<Value> {
        if let Some(value) = self.result {
            return Ok(value);
        }
        if self.abandoned {
            return Err(ProtocolError::ResponseAbandoned);
        }
        self.rx.await.map_err(|_| ProtocolError::ResponseAbandoned)
    }
}

pub struct RpcContext<'a> {
    pub registry: &'a mut SpawnedObjectRegistry,
    pub buffers: &'a WriterPool,
    pub metrics: &'a Metrics,
}

/// Response to send back for a request.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub message_type: MessageType,
    pub payload: Bytes,
    /// Object the response concerns (server responses only)
    pub context: Option<NetworkId>,
}

fn invoke(
    ctx: &mut RpcContext<'_>,
    call: &RpcCall,
    args: &mut BitReader<'_>,
) -> Result<Option<Value>> {
    let Some(object) = ctx.registry.get_mut(call.network_id) else {
        debug!(network_id = call.network_id, "RPC for unknown object ignored");
        return Ok(None);
    };
    let Some(behaviour) = object.behaviour_mut(call.behaviour_index) else {
        debug!(
            network_id = call.network_id,
            behaviour = call.behaviour_index,
            "RPC for unknown behaviour ignored"
        );
        return Ok(None);
    };
    match behaviour.invoke_rpc(call, args) {
        Ok(value) => {
            ctx.metrics.rpc_invoked();
            Ok(Some(value))
        }
        Err(ProtocolError::MissingTarget(target)) => {
            debug!(%target, "RPC method not found");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Fire-and-forget invocation.
#[instrument(skip(ctx, reader))]
pub fn handle_rpc(
    ctx: &mut RpcContext<'_>,
    direction: RpcDirection,
    peer: ClientId,
    reader: &mut BitReader<'_>,
) -> Result<()> {
    let call = RpcCall::read(direction, peer, reader)?;
    invoke(ctx, &call, reader).map(|_| ())
}

/// Invocation whose return value goes back to `peer`. Returns `None` when
/// the target does not exist.
#[instrument(skip(ctx, reader))]
pub fn handle_rpc_request(
    ctx: &mut RpcContext<'_>,
    direction: RpcDirection,
    peer: ClientId,
    reader: &mut BitReader<'_>,
) -> Result<Option<RpcReply>> {
    let call = RpcCall::read(direction, peer, reader)?;
    let response_id = reader.read_u64_packed()?;

    let Some(value) = invoke(ctx, &call, reader)? else {
        return Ok(None);
    };

    let mut writer = ctx.buffers.writer();
    writer.write_u64_packed(response_id);
    writer.write_value(&value);

    Ok(Some(RpcReply {
        message_type: direction.response_type(),
        payload: writer.finish(),
        context: match direction {
            RpcDirection::Server => Some(call.network_id),
            RpcDirection::Client => None,
        },
    }))
}

/// Encode an invocation. `response_id` makes it a request.
pub fn write_rpc_call(
    writer: &mut BitWriter,
    network_id: NetworkId,
    behaviour_index: u16,
    method_hash: u64,
    response_id: Option<ResponseId>,
    args: &[u8],
) {
    writer.write_u64_packed(network_id);
    writer.write_u16_packed(behaviour_index);
    writer.write_u64_packed(method_hash);
    if let Some(response_id) = response_id {
        writer.write_u64_packed(response_id);
    }
    writer.write_bytes(args);
}

/// Match a response to its pending entry.
///
/// Client-rpc responses must come from the peer the entry names. A mismatch
/// leaves the entry in place; only the expected peer, `abandon` or `expire`
/// can remove it.
pub fn handle_rpc_response(
    responses: &PendingResponseTable,
    metrics: &Metrics,
    direction: RpcDirection,
    peer: ClientId,
    reader: &mut BitReader<'_>,
) -> Result<ResponseOutcome> {
    let check_peer = direction == RpcDirection::Client;
    let outcome = responses.resolve(peer, check_peer, reader)?;
    if let ResponseOutcome::Resolved(_) = outcome {
        metrics.response_resolved();
    }
    Ok(outcome)
}
