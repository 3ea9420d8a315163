//! In-memory loopback between one server engine and any number of clients.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use replica_protocol::config::NetworkConfig;
use replica_protocol::core::{BitReader, Value};
use replica_protocol::engine::{Collaborators, NetworkEngine};
use replica_protocol::error::{ProtocolError, Result};
use replica_protocol::protocol::context::{
    ApprovalResponder, ConnectionApproval, CreateObject, LocalObject, ObjectHandle, ObjectSpawner,
    OutboundSender, ParentLink, SceneController,
};
use replica_protocol::protocol::message::{
    ClientId, InboundMessage, MessageType, NetworkId, SecurityFlags, SERVER_CLIENT_ID,
};
use replica_protocol::protocol::rpc::RpcCall;
use replica_protocol::protocol::scene::{StreamContinuation, SwitchId};
use replica_protocol::protocol::spawn::SpawnIdentity;
use replica_protocol::replication::{
    NetworkBehaviour, NetworkedObject, OwnershipTransfer, VariableSet, WritePermission,
};
use replica_protocol::utils::hash::hash_name;

pub const PLAYER_PREFAB: u64 = 0xA11CE;
pub const CRATE_PREFAB: u64 = 0xC4A7E;
/// Prefab the test spawner refuses to instantiate.
pub const MISSING_PREFAB: u64 = 0xDEAD;

#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: ClientId,
    pub message_type: MessageType,
    pub channel: String,
    pub payload: Bytes,
    pub security: SecurityFlags,
    pub context: Option<NetworkId>,
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<Outbound>>,
    pub disconnected: Mutex<Vec<ClientId>>,
}

impl RecordingSender {
    pub fn take(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn disconnected(&self) -> Vec<ClientId> {
        self.disconnected.lock().unwrap().clone()
    }
}

impl OutboundSender for RecordingSender {
    fn send(
        &self,
        target: ClientId,
        message_type: MessageType,
        channel: &str,
        payload: Bytes,
        security: SecurityFlags,
        context: Option<NetworkId>,
    ) {
        self.sent.lock().unwrap().push(Outbound {
            target,
            message_type,
            channel: channel.to_string(),
            payload,
            security,
            context,
        });
    }

    fn disconnect(&self, client_id: ClientId) {
        self.disconnected.lock().unwrap().push(client_id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpawnEvent {
    Created {
        network_id: NetworkId,
        identity: SpawnIdentity,
        parent: ParentLink,
    },
    Spawned {
        network_id: NetworkId,
        payload: Option<Vec<u8>>,
    },
    Attached {
        child: ObjectHandle,
        parent: ObjectHandle,
    },
    Destroyed(NetworkId),
    SweptSoftSync,
    DestroyedSceneObjects,
}

pub type Journal = Arc<Mutex<Vec<String>>>;

/// Behaviour attached to every test object.
pub struct Avatar {
    pub network_id: NetworkId,
    pub vars: VariableSet,
    journal: Journal,
}

pub fn avatar_vars() -> VariableSet {
    VariableSet::new()
        .with_field("health", 100u32, WritePermission::ServerOnly)
        .with_field("nickname", "", WritePermission::OwnerOnly)
        .with_field("emote", 0u8, WritePermission::Everyone)
}

impl NetworkBehaviour for Avatar {
    fn variables(&self) -> Option<&VariableSet> {
        Some(&self.vars)
    }

    fn variables_mut(&mut self) -> Option<&mut VariableSet> {
        Some(&mut self.vars)
    }

    fn on_variables_changed(&mut self, changed: &[usize]) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("changed {} {:?}", self.network_id, changed));
    }

    fn on_gained_ownership(&mut self, transfer: &OwnershipTransfer) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("gained {}", transfer.network_id));
    }

    fn on_lost_ownership(&mut self, transfer: &OwnershipTransfer) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("lost {}", transfer.network_id));
    }

    fn invoke_rpc(&mut self, call: &RpcCall, args: &mut BitReader<'_>) -> Result<Value> {
        if call.method_hash == hash_name("add") {
            let a = args.read_u32_packed()?;
            let b = args.read_u32_packed()?;
            Ok(Value::U32(a + b))
        } else if call.method_hash == hash_name("wave") {
            self.journal
                .lock()
                .unwrap()
                .push(format!("wave {} from {}", self.network_id, call.sender));
            Ok(Value::Unit)
        } else {
            Err(ProtocolError::MissingTarget(format!(
                "method {:#x}",
                call.method_hash
            )))
        }
    }
}

pub struct TestSpawner {
    pub events: Arc<Mutex<Vec<SpawnEvent>>>,
    journal: Journal,
    next_handle: u64,
}

impl ObjectSpawner for TestSpawner {
    fn create_local_object(&mut self, request: &CreateObject) -> Result<LocalObject> {
        if request.identity == (SpawnIdentity::Prefab { prefab_hash: MISSING_PREFAB }) {
            return Err(ProtocolError::MissingTarget(format!("prefab {MISSING_PREFAB:#x}")));
        }
        self.events.lock().unwrap().push(SpawnEvent::Created {
            network_id: request.network_id,
            identity: request.identity,
            parent: request.parent,
        });
        self.next_handle += 1;
        Ok(LocalObject {
            handle: ObjectHandle(self.next_handle),
            behaviours: vec![Box::new(Avatar {
                network_id: request.network_id,
                vars: avatar_vars(),
                journal: self.journal.clone(),
            }) as Box<dyn NetworkBehaviour>],
        })
    }

    fn spawn_locally(&mut self, object: &NetworkedObject, payload: Option<&[u8]>) {
        self.events.lock().unwrap().push(SpawnEvent::Spawned {
            network_id: object.network_id(),
            payload: payload.map(<[u8]>::to_vec),
        });
    }

    fn attach_to_parent(&mut self, child: ObjectHandle, parent: ObjectHandle) {
        self.events
            .lock()
            .unwrap()
            .push(SpawnEvent::Attached { child, parent });
    }

    fn destroy(&mut self, network_id: NetworkId, _handle: ObjectHandle) {
        self.events
            .lock()
            .unwrap()
            .push(SpawnEvent::Destroyed(network_id));
    }

    fn sweep_soft_sync_candidates(&mut self) {
        self.events.lock().unwrap().push(SpawnEvent::SweptSoftSync);
    }

    fn destroy_scene_objects(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(SpawnEvent::DestroyedSceneObjects);
    }
}

#[derive(Debug, Default)]
pub struct SceneState {
    pub current: u32,
    pub switch_id: SwitchId,
    pub first_sync: Vec<(u32, SwitchId)>,
    pub switches: Vec<(u32, SwitchId, Vec<u8>)>,
    pub completed: Vec<(ClientId, SwitchId)>,
}

pub struct TestScenes {
    pub state: Arc<Mutex<SceneState>>,
}

impl SceneController for TestScenes {
    fn current_scene_index(&self) -> u32 {
        self.state.lock().unwrap().current
    }

    fn current_switch_id(&self) -> SwitchId {
        self.state.lock().unwrap().switch_id
    }

    fn has_mismatch(&self, scene_index: u32) -> bool {
        self.state.lock().unwrap().current != scene_index
    }

    fn on_first_switch_sync(&mut self, scene_index: u32, switch_id: SwitchId) {
        self.state
            .lock()
            .unwrap()
            .first_sync
            .push((scene_index, switch_id));
    }

    fn on_switch(&mut self, scene_index: u32, switch_id: SwitchId, remainder: &StreamContinuation) {
        self.state
            .lock()
            .unwrap()
            .switches
            .push((scene_index, switch_id, remainder.as_bytes().to_vec()));
    }

    fn on_client_switch_completed(&mut self, client_id: ClientId, switch_id: SwitchId) {
        self.state
            .lock()
            .unwrap()
            .completed
            .push((client_id, switch_id));
    }
}

/// Holds every request until the test answers it.
#[derive(Clone, Default)]
pub struct DeferredApproval {
    pub pending: Arc<Mutex<Vec<(Vec<u8>, ApprovalResponder)>>>,
}

impl ConnectionApproval for DeferredApproval {
    fn approve(&mut self, payload: &[u8], _client_id: ClientId, responder: ApprovalResponder) {
        self.pending
            .lock()
            .unwrap()
            .push((payload.to_vec(), responder));
    }
}

pub struct Peer {
    pub engine: NetworkEngine,
    pub out: Arc<RecordingSender>,
    pub spawns: Arc<Mutex<Vec<SpawnEvent>>>,
    pub scenes: Arc<Mutex<SceneState>>,
    pub journal: Journal,
}

impl Peer {
    pub fn spawn_events(&self) -> Vec<SpawnEvent> {
        self.spawns.lock().unwrap().clone()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn variable(&self, network_id: NetworkId, index: usize) -> Value {
        self.engine
            .registry()
            .get(network_id)
            .and_then(|o| o.behaviour(0))
            .and_then(|b| b.variables())
            .and_then(|v| v.get(index))
            .cloned()
            .expect("variable present")
    }

    pub fn set_variable(&mut self, network_id: NetworkId, index: usize, value: impl Into<Value>) {
        self.engine
            .registry_mut()
            .get_mut(network_id)
            .and_then(|o| o.behaviour_mut(0))
            .and_then(|b| b.variables_mut())
            .expect("variables present")
            .set(index, value)
            .unwrap();
    }
}

pub struct PeerBuilder {
    config: NetworkConfig,
    scene: u32,
    customize: Option<Box<dyn FnOnce(Collaborators) -> Collaborators>>,
}

impl PeerBuilder {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            scene: 0,
            customize: None,
        }
    }

    pub fn scene(mut self, scene: u32) -> Self {
        self.scene = scene;
        self
    }

    pub fn collaborators(mut self, f: impl FnOnce(Collaborators) -> Collaborators + 'static) -> Self {
        self.customize = Some(Box::new(f));
        self
    }

    fn build(self, server: bool) -> Peer {
        let out = Arc::new(RecordingSender::default());
        let spawns = Arc::new(Mutex::new(Vec::new()));
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let scenes = Arc::new(Mutex::new(SceneState {
            current: self.scene,
            ..SceneState::default()
        }));

        let mut collaborators = Collaborators::new(
            out.clone(),
            Box::new(TestSpawner {
                events: spawns.clone(),
                journal: journal.clone(),
                next_handle: 0,
            }),
            Box::new(TestScenes {
                state: scenes.clone(),
            }),
        );
        if let Some(customize) = self.customize {
            collaborators = customize(collaborators);
        }

        let engine = if server {
            NetworkEngine::new_server(self.config, collaborators)
        } else {
            NetworkEngine::new_client(self.config, collaborators)
        }
        .expect("engine");

        Peer {
            engine,
            out,
            spawns,
            scenes,
            journal,
        }
    }

    pub fn server(self) -> Peer {
        self.build(true)
    }

    pub fn client(self) -> Peer {
        self.build(false)
    }
}

/// One server plus clients, wired through recording senders.
pub struct Network {
    pub server: Peer,
    pub clients: BTreeMap<ClientId, Peer>,
    pub errors: Vec<(ClientId, ProtocolError)>,
    pub delivered: Vec<(ClientId, MessageType)>,
}

impl Network {
    pub fn new(server: Peer) -> Self {
        Self {
            server,
            clients: BTreeMap::new(),
            errors: Vec::new(),
            delivered: Vec::new(),
        }
    }

    pub fn client(&self, client_id: ClientId) -> &Peer {
        self.clients.get(&client_id).expect("client exists")
    }

    pub fn client_mut(&mut self, client_id: ClientId) -> &mut Peer {
        self.clients.get_mut(&client_id).expect("client exists")
    }

    /// Attach a client and let the transport report the connection.
    pub fn attach(&mut self, client_id: ClientId, client: Peer) {
        self.clients.insert(client_id, client);
        if let Err(e) = self.server.engine.on_client_connected(client_id) {
            self.errors.push((SERVER_CLIENT_ID, e));
        }
    }

    /// Attach, request a connection and run until quiet.
    pub fn connect(&mut self, client_id: ClientId, client: Peer, payload: &[u8]) {
        self.attach(client_id, client);
        let result = self.client_mut(client_id).engine.connect(payload.to_vec());
        if let Err(e) = result {
            self.errors.push((client_id, e));
        }
        self.pump();
    }

    /// Deliver queued messages in both directions until none remain.
    pub fn pump(&mut self) {
        for _ in 0..64 {
            let mut moved = false;

            for message in self.server.out.take() {
                moved = true;
                let Some(client) = self.clients.get_mut(&message.target) else {
                    continue;
                };
                self.delivered.push((message.target, message.message_type));
                let inbound = InboundMessage::new(SERVER_CLIENT_ID, message.message_type, message.payload)
                    .with_channel(message.channel)
                    .with_security(message.security);
                if let Err(e) = client.engine.handle_message(inbound) {
                    self.errors.push((message.target, e));
                }
            }

            let ids: Vec<ClientId> = self.clients.keys().copied().collect();
            for client_id in ids {
                let outbound = self.clients[&client_id].out.take();
                for message in outbound {
                    moved = true;
                    self.delivered.push((SERVER_CLIENT_ID, message.message_type));
                    let inbound = InboundMessage::new(client_id, message.message_type, message.payload)
                        .with_channel(message.channel)
                        .with_security(message.security);
                    if let Err(e) = self.server.engine.handle_message(inbound) {
                        self.errors.push((SERVER_CLIENT_ID, e));
                    }
                }
            }

            if !moved {
                return;
            }
        }
        panic!("message exchange did not settle");
    }

    pub fn assert_no_errors(&self) {
        assert!(self.errors.is_empty(), "unexpected errors: {:?}", self.errors);
    }
}

pub fn config(mutator: impl FnOnce(&mut NetworkConfig)) -> NetworkConfig {
    NetworkConfig::default_with_overrides(mutator)
}
