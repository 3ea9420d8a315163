//! Spawn codec.
//!
//! Decodes object spawn records into registry entries and collaborator calls,
//! and encodes them on the server side.
//!
//! ## Record layout
//! ```text
//! [is_player: bool] [network_id: u64p] [owner: u64p]
//! [has_parent: bool] ([parent: u64p])?
//! identity:
//!   prefab sync   [prefab_hash: u64p]
//!   soft sync     [soft_sync: bool] ([instance_id: u64p] | [prefab_hash: u64p])
//! [has_transform: bool] ([pos: 3 x f32p] [euler_deg: 3 x f32p])?
//! standalone only:
//!   [has_payload: bool] ([len: i32p] [payload])?
//! networked vars enabled:
//!   full variable snapshot of every behaviour
//! ```

use bytes::Bytes;
use glam::{EulerRot, Quat, Vec3};
use tracing::{debug, instrument, warn};

use crate::config::{ProtocolConfig, SpawnMode};
use crate::core::{BitReader, BitWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::{CreateObject, ObjectSpawner, ParentLink};
use crate::protocol::message::{ClientId, NetworkId};
use crate::replication::{NetworkedObject, OwnershipTransfer, SpawnedObjectRegistry, WriteAccess};
use crate::utils::Metrics;

/// What the peer should instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnIdentity {
    Prefab { prefab_hash: u64 },
    /// An object already placed in the loaded scene (soft sync only).
    SceneObject { instance_id: u64 },
}

/// Position and Euler rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Vec3) -> Self {
        Self { position, rotation }
    }

    pub fn rotation_quat(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            self.rotation.y.to_radians(),
            self.rotation.x.to_radians(),
            self.rotation.z.to_radians(),
        )
    }
}

/// Which variant of the record layout is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// add-object / add-objects: carries the payload flag
    Standalone,
    /// connection-approved / switch-scene batches: no payload flag
    Initial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRecord {
    pub is_player_object: bool,
    pub network_id: NetworkId,
    pub owner_client_id: ClientId,
    pub parent_network_id: Option<NetworkId>,
    pub identity: SpawnIdentity,
    pub transform: Option<Transform>,
    pub payload: Option<Bytes>,
}

impl SpawnRecord {
    pub fn decode(reader: &mut BitReader<'_>, mode: SpawnMode, shape: RecordShape) -> Result<Self> {
        let is_player_object = reader.read_bool()?;
        let network_id = reader.read_u64_packed()?;
        let owner_client_id = reader.read_u64_packed()?;

        let parent_network_id = if reader.read_bool()? {
            Some(reader.read_u64_packed()?)
        } else {
            None
        };

        let identity = match mode {
            SpawnMode::PrefabSync => SpawnIdentity::Prefab {
                prefab_hash: reader.read_u64_packed()?,
            },
            SpawnMode::SoftSync => {
                if reader.read_bool()? {
                    SpawnIdentity::SceneObject {
                        instance_id: reader.read_u64_packed()?,
                    }
                } else {
                    SpawnIdentity::Prefab {
                        prefab_hash: reader.read_u64_packed()?,
                    }
                }
            }
        };

        let transform = if reader.read_bool()? {
            let position = reader.read_vec3_packed()?;
            let rotation = reader.read_vec3_packed()?;
            Some(Transform { position, rotation })
        } else {
            None
        };

        let payload = match shape {
            RecordShape::Initial => None,
            RecordShape::Standalone => {
                if reader.read_bool()? {
                    let len = reader.read_i32_packed()?;
                    let len = usize::try_from(len).map_err(|_| {
                        ProtocolError::MalformedInput(constants::ERR_NEGATIVE_LENGTH.into())
                    })?;
                    Some(Bytes::copy_from_slice(reader.read_bytes(len)?))
                } else {
                    None
                }
            }
        };

        Ok(Self {
            is_player_object,
            network_id,
            owner_client_id,
            parent_network_id,
            identity,
            transform,
            payload,
        })
    }

    pub fn encode(&self, writer: &mut BitWriter, mode: SpawnMode, shape: RecordShape) -> Result<()> {
        writer.write_bool(self.is_player_object);
        writer.write_u64_packed(self.network_id);
        writer.write_u64_packed(self.owner_client_id);

        writer.write_bool(self.parent_network_id.is_some());
        if let Some(parent) = self.parent_network_id {
            writer.write_u64_packed(parent);
        }

        match (mode, self.identity) {
            (SpawnMode::PrefabSync, SpawnIdentity::Prefab { prefab_hash }) => {
                writer.write_u64_packed(prefab_hash);
            }
            (SpawnMode::PrefabSync, SpawnIdentity::SceneObject { instance_id }) => {
                return Err(ProtocolError::MalformedInput(format!(
                    "scene object {instance_id} cannot be encoded in prefab sync mode"
                )));
            }
            (SpawnMode::SoftSync, SpawnIdentity::SceneObject { instance_id }) => {
                writer.write_bool(true);
                writer.write_u64_packed(instance_id);
            }
            (SpawnMode::SoftSync, SpawnIdentity::Prefab { prefab_hash }) => {
                writer.write_bool(false);
                writer.write_u64_packed(prefab_hash);
            }
        }

        writer.write_bool(self.transform.is_some());
        if let Some(transform) = &self.transform {
            writer.write_vec3_packed(transform.position);
            writer.write_vec3_packed(transform.rotation);
        }

        if shape == RecordShape::Standalone {
            writer.write_bool(self.payload.is_some());
            if let Some(payload) = &self.payload {
                let len = i32::try_from(payload.len()).map_err(|_| {
                    ProtocolError::MalformedInput(format!(
                        "spawn payload of {} bytes is too large",
                        payload.len()
                    ))
                })?;
                writer.write_i32_packed(len);
                writer.write_bytes(payload);
            }
        }
        Ok(())
    }
}

/// Most records an add-objects or destroy-objects message can count.
pub const MAX_BATCH_LEN: usize = u16::MAX as usize;

/// Collaborators the spawn handlers work on.
pub struct SpawnContext<'a> {
    pub config: &'a ProtocolConfig,
    pub registry: &'a mut SpawnedObjectRegistry,
    pub spawner: &'a mut dyn ObjectSpawner,
    pub metrics: &'a Metrics,
    /// This peer's own client id
    pub local_client_id: ClientId,
}

impl SpawnContext<'_> {
    fn networked_vars(&self) -> bool {
        self.config.enable_networked_var
    }
}

/// Create, register and spawn one decoded record, reading its variable
/// snapshot from `reader` when networked variables are enabled.
pub fn apply_spawn(
    ctx: &mut SpawnContext<'_>,
    record: SpawnRecord,
    reader: &mut BitReader<'_>,
) -> Result<NetworkId> {
    let network_id = record.network_id;
    if ctx.registry.contains(network_id) {
        warn!(network_id, "Spawn for an id that is already registered");
        return Err(ProtocolError::DuplicateNetworkId(network_id));
    }

    let parent = match record.parent_network_id {
        None => ParentLink::None,
        Some(parent_id) => match ctx.registry.get(parent_id) {
            Some(parent) => ParentLink::Resolved(parent.handle()),
            None => ParentLink::Pending(parent_id),
        },
    };

    let request = CreateObject {
        network_id,
        owner_client_id: record.owner_client_id,
        is_player_object: record.is_player_object,
        identity: record.identity,
        parent,
        transform: record.transform,
    };
    let local = ctx.spawner.create_local_object(&request)?;
    let parent_handle = local.handle;
    let mut object = NetworkedObject::new(&record, local);

    let snapshot = if ctx.networked_vars() {
        object.read_variable_snapshots(reader, WriteAccess::Authority)
    } else {
        Ok(())
    };
    // the host object must not outlive a spawn that never registers
    let resolved = match snapshot.and_then(|()| ctx.registry.insert(object)) {
        Ok(resolved) => resolved,
        Err(e) => {
            ctx.spawner.destroy(network_id, parent_handle);
            warn!(network_id, error = %e, "Spawn abandoned; local object destroyed");
            return Err(e);
        }
    };
    for child_id in resolved {
        if let Some(child) = ctx.registry.get(child_id) {
            ctx.spawner.attach_to_parent(child.handle(), parent_handle);
        }
    }

    if let Some(object) = ctx.registry.get(network_id) {
        ctx.spawner
            .spawn_locally(object, record.payload.as_deref());
    }
    ctx.metrics.object_spawned();
    debug!(network_id, owner = record.owner_client_id, "Object spawned");
    Ok(network_id)
}

#[instrument(skip(ctx, reader), fields(local = ctx.local_client_id))]
pub fn handle_add_object(ctx: &mut SpawnContext<'_>, reader: &mut BitReader<'_>) -> Result<NetworkId> {
    let record = SpawnRecord::decode(reader, ctx.config.spawn_mode, RecordShape::Standalone)?;
    apply_spawn(ctx, record, reader)
}

#[instrument(skip(ctx, reader), fields(local = ctx.local_client_id))]
pub fn handle_add_objects(
    ctx: &mut SpawnContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<Vec<NetworkId>> {
    let count = reader.read_u16_packed()?;
    let mut spawned = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let record = SpawnRecord::decode(reader, ctx.config.spawn_mode, RecordShape::Standalone)?;
        spawned.push(apply_spawn(ctx, record, reader)?);
    }
    Ok(spawned)
}

/// Initial batch of connection-approved and switch-scene messages.
#[instrument(skip(ctx, reader), fields(local = ctx.local_client_id))]
pub fn spawn_initial_batch(
    ctx: &mut SpawnContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<Vec<NetworkId>> {
    match ctx.config.spawn_mode {
        SpawnMode::PrefabSync => ctx.spawner.destroy_scene_objects(),
        SpawnMode::SoftSync => ctx.spawner.sweep_soft_sync_candidates(),
    }

    let count = reader.read_u32_packed()?;
    let mut spawned = Vec::new();
    for _ in 0..count {
        let record = SpawnRecord::decode(reader, ctx.config.spawn_mode, RecordShape::Initial)?;
        spawned.push(apply_spawn(ctx, record, reader)?);
    }
    debug!(count = spawned.len(), "Initial spawn batch applied");
    Ok(spawned)
}

/// Remove an object; absent ids are ignored.
pub fn despawn(ctx: &mut SpawnContext<'_>, network_id: NetworkId) -> bool {
    match ctx.registry.remove(network_id) {
        Some(object) => {
            ctx.spawner.destroy(network_id, object.handle());
            ctx.metrics.object_destroyed();
            debug!(network_id, "Object destroyed");
            true
        }
        None => {
            debug!(network_id, "Destroy for unknown object ignored");
            false
        }
    }
}

pub fn handle_destroy_object(ctx: &mut SpawnContext<'_>, reader: &mut BitReader<'_>) -> Result<()> {
    let network_id = reader.read_u64_packed()?;
    despawn(ctx, network_id);
    Ok(())
}

pub fn handle_destroy_objects(
    ctx: &mut SpawnContext<'_>,
    reader: &mut BitReader<'_>,
) -> Result<()> {
    let count = reader.read_u16_packed()?;
    for _ in 0..count {
        let network_id = reader.read_u64_packed()?;
        despawn(ctx, network_id);
    }
    Ok(())
}

/// Apply an ownership change with notifications. Returns whether anything changed.
pub fn apply_ownership_change(
    registry: &mut SpawnedObjectRegistry,
    local_client_id: ClientId,
    network_id: NetworkId,
    new_owner: ClientId,
) -> Result<bool> {
    let object = registry
        .get_mut(network_id)
        .ok_or_else(|| ProtocolError::MissingTarget(format!("object {network_id}")))?;

    let previous_owner = object.owner_client_id();
    if previous_owner == new_owner {
        return Ok(false);
    }

    let transfer = OwnershipTransfer {
        network_id,
        previous_owner,
        new_owner,
    };
    if previous_owner == local_client_id {
        object.notify_lost_ownership(&transfer);
    }
    if new_owner == local_client_id {
        object.notify_gained_ownership(&transfer);
    }
    object.set_owner(new_owner);
    Ok(true)
}

pub fn handle_change_owner(ctx: &mut SpawnContext<'_>, reader: &mut BitReader<'_>) -> Result<()> {
    let network_id = reader.read_u64_packed()?;
    let new_owner = reader.read_u64_packed()?;
    if apply_ownership_change(ctx.registry, ctx.local_client_id, network_id, new_owner)? {
        ctx.metrics.ownership_changed();
    }
    Ok(())
}

/// Encode every registered object as an initial batch, in spawn order.
pub fn write_initial_batch(
    registry: &SpawnedObjectRegistry,
    writer: &mut BitWriter,
    config: &ProtocolConfig,
) -> Result<()> {
    let count = u32::try_from(registry.len()).map_err(|_| ProtocolError::BatchTooLarge {
        len: registry.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32_packed(count);
    for object in registry.iter() {
        object
            .to_spawn_record()
            .encode(writer, config.spawn_mode, RecordShape::Initial)?;
        if config.enable_networked_var {
            object.write_variable_snapshots(writer);
        }
    }
    Ok(())
}

/// Encode one standalone record followed by its variable snapshot.
pub fn write_standalone(
    object: &NetworkedObject,
    payload: Option<Bytes>,
    writer: &mut BitWriter,
    config: &ProtocolConfig,
) -> Result<()> {
    let mut record = object.to_spawn_record();
    record.payload = payload;
    record.encode(writer, config.spawn_mode, RecordShape::Standalone)?;
    if config.enable_networked_var {
        object.write_variable_snapshots(writer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn record(identity: SpawnIdentity) -> SpawnRecord {
        SpawnRecord {
            is_player_object: true,
            network_id: 300,
            owner_client_id: 4,
            parent_network_id: Some(12),
            identity,
            transform: Some(Transform::new(
                Vec3::new(1.0, 2.0, -3.0),
                Vec3::new(0.0, 90.0, 0.0),
            )),
            payload: Some(Bytes::from_static(b"init")),
        }
    }

    #[test]
    fn test_standalone_soft_sync() {
        let original = record(SpawnIdentity::SceneObject { instance_id: 77 });
        let mut w = BitWriter::new();
        original
            .encode(&mut w, SpawnMode::SoftSync, RecordShape::Standalone)
            .unwrap();
        let mut r = BitReader::new(w.as_slice());
        let decoded = SpawnRecord::decode(&mut r, SpawnMode::SoftSync, RecordShape::Standalone).unwrap();
        assert_eq!(decoded, original);
        assert!(r.is_empty());
    }

    #[test]
    fn test_initial_shape_has_no_payload_flag() {
        let original = record(SpawnIdentity::Prefab { prefab_hash: 5 });
        let mut standalone = BitWriter::new();
        let mut initial = BitWriter::new();
        let mut bare = original.clone();
        bare.payload = None;
        bare.encode(&mut standalone, SpawnMode::PrefabSync, RecordShape::Standalone)
            .unwrap();
        original
            .encode(&mut initial, SpawnMode::PrefabSync, RecordShape::Initial)
            .unwrap();
        assert_eq!(standalone.len(), initial.len() + 1);

        let decoded = SpawnRecord::decode(
            &mut BitReader::new(initial.as_slice()),
            SpawnMode::PrefabSync,
            RecordShape::Initial,
        )
        .unwrap();
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn test_scene_object_rejected_in_prefab_mode() {
        let mut w = BitWriter::new();
        assert!(record(SpawnIdentity::SceneObject { instance_id: 1 })
            .encode(&mut w, SpawnMode::PrefabSync, RecordShape::Initial)
            .is_err());
    }

    #[test]
    fn test_negative_payload_length() {
        let mut w = BitWriter::new();
        w.write_bool(false);
        w.write_u64_packed(1);
        w.write_u64_packed(0);
        w.write_bool(false);
        w.write_u64_packed(9);
        w.write_bool(false);
        w.write_bool(true);
        w.write_i32_packed(-4);
        let err = SpawnRecord::decode(
            &mut BitReader::new(w.as_slice()),
            SpawnMode::PrefabSync,
            RecordShape::Standalone,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedInput(_)));
    }

    #[test]
    fn test_rotation_quat() {
        let t = Transform::new(Vec3::ZERO, Vec3::new(0.0, 90.0, 0.0));
        let rotated = t.rotation_quat() * Vec3::Z;
        assert!((rotated - Vec3::X).length() < 1e-5);
    }
}
