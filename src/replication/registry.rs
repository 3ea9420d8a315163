//! Spawned object registry.
//!
//! Arena of replicated objects keyed by `network_id`. Parents are referenced by
//! id only; a child whose parent has not arrived yet is tracked as
//! *parent pending* and reported back when the parent is inserted, so the
//! caller can attach it.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::core::{BitReader, BitWriter};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::{LocalObject, ObjectHandle};
use crate::protocol::message::{ClientId, NetworkId};
use crate::protocol::spawn::{SpawnIdentity, SpawnRecord, Transform};

use super::{NetworkBehaviour, OwnershipTransfer, WriteAccess};

/// A replicated object known to this peer.
pub struct NetworkedObject {
    network_id: NetworkId,
    owner_client_id: ClientId,
    parent_network_id: Option<NetworkId>,
    handle: ObjectHandle,
    is_player_object: bool,
    identity: SpawnIdentity,
    transform: Option<Transform>,
    behaviours: Vec<Box<dyn NetworkBehaviour>>,
}

impl NetworkedObject {
    pub fn new(record: &SpawnRecord, local: LocalObject) -> Self {
        Self {
            network_id: record.network_id,
            owner_client_id: record.owner_client_id,
            parent_network_id: record.parent_network_id,
            handle: local.handle,
            is_player_object: record.is_player_object,
            identity: record.identity,
            transform: record.transform,
            behaviours: local.behaviours,
        }
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn owner_client_id(&self) -> ClientId {
        self.owner_client_id
    }

    pub fn parent_network_id(&self) -> Option<NetworkId> {
        self.parent_network_id
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn is_player_object(&self) -> bool {
        self.is_player_object
    }

    pub fn identity(&self) -> SpawnIdentity {
        self.identity
    }

    pub fn transform(&self) -> Option<Transform> {
        self.transform
    }

    pub fn behaviour_count(&self) -> usize {
        self.behaviours.len()
    }

    pub fn behaviour(&self, order_index: u16) -> Option<&dyn NetworkBehaviour> {
        self.behaviours
            .get(usize::from(order_index))
            .map(|b| &**b)
    }

    pub fn behaviour_mut(&mut self, order_index: u16) -> Option<&mut Box<dyn NetworkBehaviour>> {
        self.behaviours.get_mut(usize::from(order_index))
    }

    pub fn behaviours_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn NetworkBehaviour>> {
        self.behaviours.iter_mut()
    }

    /// The record that recreates this object on another peer (no payload).
    pub fn to_spawn_record(&self) -> SpawnRecord {
        SpawnRecord {
            is_player_object: self.is_player_object,
            network_id: self.network_id,
            owner_client_id: self.owner_client_id,
            parent_network_id: self.parent_network_id,
            identity: self.identity,
            transform: self.transform,
            payload: None,
        }
    }

    /// Full variable snapshot of every behaviour, in order.
    pub fn write_variable_snapshots(&self, writer: &mut BitWriter) {
        for behaviour in &self.behaviours {
            if let Some(vars) = behaviour.variables() {
                vars.write_full(writer);
            }
        }
    }

    pub fn read_variable_snapshots(
        &mut self,
        reader: &mut BitReader<'_>,
        access: WriteAccess,
    ) -> Result<()> {
        for behaviour in &mut self.behaviours {
            if let Some(vars) = behaviour.variables_mut() {
                vars.read_full(reader, access)?;
            }
        }
        Ok(())
    }

    pub(crate) fn set_owner(&mut self, owner: ClientId) {
        self.owner_client_id = owner;
    }

    pub(crate) fn notify_lost_ownership(&mut self, transfer: &OwnershipTransfer) {
        for behaviour in &mut self.behaviours {
            behaviour.on_lost_ownership(transfer);
        }
    }

    pub(crate) fn notify_gained_ownership(&mut self, transfer: &OwnershipTransfer) {
        for behaviour in &mut self.behaviours {
            behaviour.on_gained_ownership(transfer);
        }
    }
}

impl std::fmt::Debug for NetworkedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkedObject")
            .field("network_id", &self.network_id)
            .field("owner_client_id", &self.owner_client_id)
            .field("parent_network_id", &self.parent_network_id)
            .field("handle", &self.handle)
            .field("identity", &self.identity)
            .field("behaviours", &self.behaviours.len())
            .finish()
    }
}

/// Where an object's parent link stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    Root,
    Attached(NetworkId),
    Pending(NetworkId),
}

#[derive(Default)]
pub struct SpawnedObjectRegistry {
    objects: HashMap<NetworkId, NetworkedObject>,
    spawn_order: Vec<NetworkId>,
    /// parent id -> children waiting for it
    awaiting_parent: HashMap<NetworkId, Vec<NetworkId>>,
    pending_children: HashSet<NetworkId>,
}

impl SpawnedObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, network_id: NetworkId) -> bool {
        self.objects.contains_key(&network_id)
    }

    pub fn get(&self, network_id: NetworkId) -> Option<&NetworkedObject> {
        self.objects.get(&network_id)
    }

    pub fn get_mut(&mut self, network_id: NetworkId) -> Option<&mut NetworkedObject> {
        self.objects.get_mut(&network_id)
    }

    /// Register an object. Returns the children that were waiting for it.
    pub fn insert(&mut self, object: NetworkedObject) -> Result<Vec<NetworkId>> {
        let id = object.network_id;
        if self.objects.contains_key(&id) {
            return Err(ProtocolError::DuplicateNetworkId(id));
        }

        if let Some(parent) = object.parent_network_id {
            if !self.objects.contains_key(&parent) {
                debug!(network_id = id, parent, "Parent not spawned yet; child pending");
                self.awaiting_parent.entry(parent).or_default().push(id);
                self.pending_children.insert(id);
            }
        }

        self.objects.insert(id, object);
        self.spawn_order.push(id);

        let resolved = self.awaiting_parent.remove(&id).unwrap_or_default();
        for child in &resolved {
            self.pending_children.remove(child);
        }
        Ok(resolved)
    }

    pub fn remove(&mut self, network_id: NetworkId) -> Option<NetworkedObject> {
        let object = self.objects.remove(&network_id)?;
        self.spawn_order.retain(|id| *id != network_id);
        if self.pending_children.remove(&network_id) {
            if let Some(parent) = object.parent_network_id {
                if let Some(waiting) = self.awaiting_parent.get_mut(&parent) {
                    waiting.retain(|id| *id != network_id);
                    if waiting.is_empty() {
                        self.awaiting_parent.remove(&parent);
                    }
                }
            }
        }
        Some(object)
    }

    pub fn parent_state(&self, network_id: NetworkId) -> Option<ParentState> {
        let object = self.objects.get(&network_id)?;
        Some(match object.parent_network_id {
            None => ParentState::Root,
            Some(parent) if self.pending_children.contains(&network_id) => {
                ParentState::Pending(parent)
            }
            Some(parent) => ParentState::Attached(parent),
        })
    }

    /// Objects in the order they were spawned.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkedObject> {
        self.spawn_order
            .iter()
            .filter_map(move |id| self.objects.get(id))
    }

    pub fn network_ids(&self) -> Vec<NetworkId> {
        self.spawn_order.clone()
    }

    pub fn owned_by(&self, client_id: ClientId) -> Vec<NetworkId> {
        self.iter()
            .filter(|o| o.owner_client_id == client_id)
            .map(|o| o.network_id)
            .collect()
    }

    pub fn clear(&mut self) -> Vec<NetworkedObject> {
        let order = std::mem::take(&mut self.spawn_order);
        self.awaiting_parent.clear();
        self.pending_children.clear();
        order
            .into_iter()
            .filter_map(|id| self.objects.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn object(id: NetworkId, parent: Option<NetworkId>) -> NetworkedObject {
        let record = SpawnRecord {
            is_player_object: false,
            network_id: id,
            owner_client_id: 0,
            parent_network_id: parent,
            identity: SpawnIdentity::Prefab { prefab_hash: 1 },
            transform: None,
            payload: None,
        };
        NetworkedObject::new(
            &record,
            LocalObject {
                handle: ObjectHandle(id * 10),
                behaviours: Vec::new(),
            },
        )
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = SpawnedObjectRegistry::new();
        registry.insert(object(1, None)).unwrap();
        assert!(matches!(
            registry.insert(object(1, None)),
            Err(ProtocolError::DuplicateNetworkId(1))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pending_parent_resolves() {
        let mut registry = SpawnedObjectRegistry::new();
        assert!(registry.insert(object(5, Some(2))).unwrap().is_empty());
        assert_eq!(registry.parent_state(5), Some(ParentState::Pending(2)));

        let resolved = registry.insert(object(2, None)).unwrap();
        assert_eq!(resolved, vec![5]);
        assert_eq!(registry.parent_state(5), Some(ParentState::Attached(2)));
        assert_eq!(registry.parent_state(2), Some(ParentState::Root));
    }

    #[test]
    fn test_spawn_order_kept() {
        let mut registry = SpawnedObjectRegistry::new();
        for id in [9, 3, 7] {
            registry.insert(object(id, None)).unwrap();
        }
        registry.remove(3);
        assert_eq!(registry.network_ids(), vec![9, 7]);
        let ids: Vec<_> = registry.iter().map(|o| o.network_id()).collect();
        assert_eq!(ids, vec![9, 7]);
    }

    #[test]
    fn test_removing_pending_child_forgets_it() {
        let mut registry = SpawnedObjectRegistry::new();
        registry.insert(object(5, Some(2))).unwrap();
        registry.remove(5).unwrap();
        assert!(registry.insert(object(2, None)).unwrap().is_empty());
    }
}
