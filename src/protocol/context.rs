//! Collaborator interfaces.
//!
//! The engine never touches sockets, scene graphs or game objects itself.
//! Hosts plug those in through the traits below; each handler module receives
//! only the collaborators it needs.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::protocol::connection::ApprovalDecision;
use crate::protocol::message::{ClientId, MessageType, NetworkId, SecurityFlags};
use crate::protocol::scene::{StreamContinuation, SwitchId};
use crate::protocol::spawn::{SpawnIdentity, Transform};
use crate::replication::{NetworkBehaviour, NetworkedObject};

/// Outbound half of the transport.
pub trait OutboundSender: Send + Sync {
    /// Queue a message. `context` names the object a message concerns, for
    /// transports that prioritise or cull per object.
    fn send(
        &self,
        target: ClientId,
        message_type: MessageType,
        channel: &str,
        payload: Bytes,
        security: SecurityFlags,
        context: Option<NetworkId>,
    );

    fn disconnect(&self, client_id: ClientId);

    fn current_rtt(&self, _client_id: ClientId) -> Duration {
        Duration::ZERO
    }
}

/// Opaque reference to a host-side object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// How a new object relates to its parent at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentLink {
    None,
    /// Parent already exists locally.
    Resolved(ObjectHandle),
    /// Parent id is known but the parent has not been spawned here yet.
    Pending(NetworkId),
}

/// Everything the spawner needs to instantiate an object.
#[derive(Debug, Clone, Copy)]
pub struct CreateObject {
    pub network_id: NetworkId,
    pub owner_client_id: ClientId,
    pub is_player_object: bool,
    pub identity: SpawnIdentity,
    pub parent: ParentLink,
    pub transform: Option<Transform>,
}

/// Result of instantiation: the host handle and the attached behaviours in
/// order.
pub struct LocalObject {
    pub handle: ObjectHandle,
    pub behaviours: Vec<Box<dyn NetworkBehaviour>>,
}

/// Host-side object lifecycle.
pub trait ObjectSpawner: Send {
    fn create_local_object(&mut self, request: &CreateObject) -> Result<LocalObject>;

    /// Finish spawning a registered object. `payload` is forwarded untouched
    /// from the add-object record.
    fn spawn_locally(&mut self, object: &NetworkedObject, payload: Option<&[u8]>);

    /// A pending child's parent has arrived.
    fn attach_to_parent(&mut self, child: ObjectHandle, parent: ObjectHandle) {
        debug!(?child, ?parent, "Parent attached");
    }

    fn destroy(&mut self, network_id: NetworkId, handle: ObjectHandle);

    /// Soft-sync initial sync: collect scene objects that may be claimed by
    /// incoming records.
    fn sweep_soft_sync_candidates(&mut self);

    /// Prefab-sync initial sync: remove every scene-placed object.
    fn destroy_scene_objects(&mut self);
}

/// Scene management collaborator.
pub trait SceneController: Send {
    fn current_scene_index(&self) -> u32;

    fn current_switch_id(&self) -> SwitchId;

    /// Whether `scene_index` differs from the loaded scene.
    fn has_mismatch(&self, scene_index: u32) -> bool;

    /// Start loading the server's scene during the initial sync. The engine
    /// resumes when the host calls `on_scene_loaded`.
    fn on_first_switch_sync(&mut self, scene_index: u32, switch_id: SwitchId);

    /// Start a runtime scene switch.
    fn on_switch(&mut self, scene_index: u32, switch_id: SwitchId, remainder: &StreamContinuation);

    /// Server side: a client finished loading.
    fn on_client_switch_completed(&mut self, client_id: ClientId, switch_id: SwitchId);
}

/// Decision hook for connection requests.
pub trait ConnectionApproval: Send {
    /// Decide on a request. The decision may be sent later, from any thread.
    fn approve(&mut self, payload: &[u8], client_id: ClientId, responder: ApprovalResponder);
}

/// One-shot reply handle for a pending connection request.
#[derive(Debug)]
pub struct ApprovalResponder {
    client_id: ClientId,
    tx: mpsc::UnboundedSender<ApprovalDecision>,
}

impl ApprovalResponder {
    pub(crate) fn new(client_id: ClientId, tx: mpsc::UnboundedSender<ApprovalDecision>) -> Self {
        Self { client_id, tx }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Deliver the decision. It is applied on the next `poll_approvals`.
    pub fn respond(self, mut decision: ApprovalDecision) {
        decision.client_id = self.client_id;
        if self.tx.send(decision).is_err() {
            debug!(client_id = self.client_id, "Engine dropped before approval was delivered");
        }
    }

    pub fn approve(self) {
        let decision = ApprovalDecision::approve(self.client_id);
        self.respond(decision);
    }

    pub fn reject(self) {
        let decision = ApprovalDecision::reject(self.client_id);
        self.respond(decision);
    }
}
