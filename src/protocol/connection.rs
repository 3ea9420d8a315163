//! Connection state machine.
//!
//! Server-side records advance strictly forward:
//!
//! ```text
//! AwaitingHail -> AwaitingConnection -> AwaitingApproval -> Connected
//! ```
//!
//! A record without encryption starts at `AwaitingConnection`. Leaving the
//! table (disconnect) is the only other exit.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use glam::Vec3;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::{BitReader, BitWriter};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::ApprovalResponder;
use crate::protocol::handshake::KeyExchange;
use crate::protocol::message::ClientId;
use crate::utils::{SessionCipher, SymmetricKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    AwaitingHail,
    AwaitingConnection,
    AwaitingApproval,
    Connected,
}

/// Server-side bookkeeping for one transport connection.
pub struct ConnectionRecord {
    client_id: ClientId,
    state: ConnectionState,
    key_exchange: Option<KeyExchange>,
    symmetric_key: Option<SymmetricKey>,
}

impl ConnectionRecord {
    pub fn new(client_id: ClientId, encryption: bool) -> Self {
        Self {
            client_id,
            state: if encryption {
                ConnectionState::AwaitingHail
            } else {
                ConnectionState::AwaitingConnection
            },
            key_exchange: None,
            symmetric_key: None,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Move to `next`. Returns false and stays put if that would go backwards.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if next < self.state {
            warn!(
                client_id = self.client_id,
                from = ?self.state,
                to = ?next,
                "Refusing backwards connection transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn set_key_exchange(&mut self, exchange: KeyExchange) {
        self.key_exchange = Some(exchange);
    }

    /// Hand out the pending key exchange. It can only be taken once.
    pub fn take_key_exchange(&mut self) -> Option<KeyExchange> {
        self.key_exchange.take()
    }

    pub fn set_symmetric_key(&mut self, key: SymmetricKey) {
        self.symmetric_key = Some(key);
    }

    pub fn symmetric_key(&self) -> Option<&SymmetricKey> {
        self.symmetric_key.as_ref()
    }

    pub fn cipher(&self) -> Option<SessionCipher> {
        self.symmetric_key.as_ref().map(|k| SessionCipher::new(k))
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("key_exchange", &self.key_exchange.is_some())
            .field("symmetric_key", &self.symmetric_key.is_some())
            .finish()
    }
}

/// Host decision on a connection request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApprovalDecision {
    pub client_id: ClientId,
    pub approved: bool,
    pub create_player_object: bool,
    pub player_prefab_hash: Option<u64>,
    pub position: Option<Vec3>,
    pub rotation: Option<Vec3>,
}

impl ApprovalDecision {
    pub fn approve(client_id: ClientId) -> Self {
        Self {
            client_id,
            approved: true,
            create_player_object: false,
            player_prefab_hash: None,
            position: None,
            rotation: None,
        }
    }

    pub fn reject(client_id: ClientId) -> Self {
        Self {
            approved: false,
            ..Self::approve(client_id)
        }
    }

    /// Spawn a player object for the client. `prefab_hash` overrides the
    /// configured player prefab.
    pub fn with_player_object(
        mut self,
        prefab_hash: Option<u64>,
        position: Option<Vec3>,
        rotation: Option<Vec3>,
    ) -> Self {
        self.create_player_object = true;
        self.player_prefab_hash = prefab_hash;
        self.position = position;
        self.rotation = rotation;
        self
    }
}

/// All connection records, plus the channel approval decisions come back on.
pub struct ConnectionTable {
    records: HashMap<ClientId, ConnectionRecord>,
    decisions_tx: mpsc::UnboundedSender<ApprovalDecision>,
    decisions_rx: mpsc::UnboundedReceiver<ApprovalDecision>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
        Self {
            records: HashMap::new(),
            decisions_tx,
            decisions_rx,
        }
    }

    pub fn open(&mut self, client_id: ClientId, encryption: bool) -> &mut ConnectionRecord {
        let record = ConnectionRecord::new(client_id, encryption);
        match self.records.entry(client_id) {
            Entry::Occupied(mut entry) => {
                warn!(client_id, "Replacing an existing connection record");
                entry.insert(record);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(record),
        }
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ConnectionRecord> {
        self.records.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&client_id)
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ConnectionRecord> {
        self.records.remove(&client_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn state(&self, client_id: ClientId) -> Option<ConnectionState> {
        self.records.get(&client_id).map(|r| r.state)
    }

    /// Ids of every fully connected client, sorted.
    pub fn connected_clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .records
            .values()
            .filter(|r| r.is_connected())
            .map(|r| r.client_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn responder(&self, client_id: ClientId) -> ApprovalResponder {
        ApprovalResponder::new(client_id, self.decisions_tx.clone())
    }

    /// Collect every decision delivered so far.
    pub fn drain_decisions(&mut self) -> Vec<ApprovalDecision> {
        let mut decisions = Vec::new();
        while let Ok(decision) = self.decisions_rx.try_recv() {
            decisions.push(decision);
        }
        decisions
    }
}

/// What the server does next with a connection request.
#[derive(Debug)]
pub enum RequestOutcome {
    /// The approval hook has the request; a decision arrives later.
    AwaitingApproval { payload: Vec<u8> },
    Approved(ApprovalDecision),
}

/// Decode a connection-request and check the config hash.
#[instrument(skip(config, reader))]
pub fn handle_connection_request(
    config: &NetworkConfig,
    client_id: ClientId,
    reader: &mut BitReader<'_>,
) -> Result<RequestOutcome> {
    let remote = reader.read_u64_packed()?;
    if !config.compare_config(remote) {
        let local = config.config_hash();
        warn!(client_id, local, remote, "Client configuration does not match");
        return Err(ProtocolError::ConfigMismatch { local, remote });
    }

    if config.protocol.connection_approval {
        let payload = reader.read_byte_array()?.to_vec();
        debug!(client_id, len = payload.len(), "Connection request awaiting approval");
        Ok(RequestOutcome::AwaitingApproval { payload })
    } else {
        let mut decision = ApprovalDecision::approve(client_id);
        if config.protocol.create_player_prefab {
            decision = decision.with_player_object(None, None, None);
        }
        Ok(RequestOutcome::Approved(decision))
    }
}

/// Encode a connection-request. The payload is only sent when approval is enabled.
pub fn write_connection_request(writer: &mut BitWriter, config: &NetworkConfig, payload: &[u8]) {
    writer.write_u64_packed(config.config_hash());
    if config.protocol.connection_approval {
        writer.write_byte_array(payload);
    }
}

/// Client-side connection progress.
#[derive(Default)]
pub struct ClientSession {
    local_client_id: Option<ClientId>,
    connected: bool,
    symmetric_key: Option<SymmetricKey>,
    /// Approval payload held until the connection request can be sent
    pending_request: Option<Vec<u8>>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_client_id(&self) -> Option<ClientId> {
        self.local_client_id
    }

    pub fn set_local_client_id(&mut self, client_id: ClientId) {
        self.local_client_id = Some(client_id);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn mark_connected(&mut self) {
        self.connected = true;
    }

    pub fn set_symmetric_key(&mut self, key: SymmetricKey) {
        self.symmetric_key = Some(key);
    }

    pub fn cipher(&self) -> Option<SessionCipher> {
        self.symmetric_key.as_ref().map(|k| SessionCipher::new(k))
    }

    pub fn set_pending_request(&mut self, payload: Vec<u8>) {
        self.pending_request = Some(payload);
    }

    pub fn take_pending_request(&mut self) -> Option<Vec<u8>> {
        self.pending_request.take()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
