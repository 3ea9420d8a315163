//! Variable sync dispatcher.
//!
//! Routes networked-var-delta and networked-var-update messages to the
//! variable set of one behaviour:
//!
//! ```text
//! [network_id: u64p] [order_index: u16p] [delta | full snapshot]
//! ```

use tracing::{instrument, warn};

use crate::core::{BitReader, BitWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ClientId, NetworkId, Role};
use crate::replication::{SpawnedObjectRegistry, VariableSet, WriteAccess};

/// Which variable encoding a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncShape {
    Delta,
    Full,
}

pub struct SyncContext<'a> {
    pub enabled: bool,
    pub role: Role,
    pub registry: &'a mut SpawnedObjectRegistry,
}

/// Apply a variable message. Returns the indices of fields that changed.
#[instrument(skip(ctx, reader), fields(role = ?ctx.role))]
pub fn handle_variable_message(
    ctx: &mut SyncContext<'_>,
    sender: ClientId,
    shape: SyncShape,
    reader: &mut BitReader<'_>,
) -> Result<Vec<usize>> {
    if !ctx.enabled {
        warn!("Received a variable update while networked variables are disabled");
        return Err(ProtocolError::FeatureDisabled(
            constants::ERR_NETWORKED_VAR_DISABLED,
        ));
    }

    let network_id = reader.read_u64_packed()?;
    let order_index = reader.read_u16_packed()?;

    let object = ctx.registry.get_mut(network_id).ok_or_else(|| {
        warn!(network_id, "Variable update for an object that does not exist");
        ProtocolError::MissingTarget(format!("object {network_id}"))
    })?;

    let access = match ctx.role {
        Role::Client => WriteAccess::Authority,
        Role::Server => WriteAccess::Peer {
            sender,
            owner: object.owner_client_id(),
        },
    };

    let behaviour = object.behaviour_mut(order_index).ok_or_else(|| {
        warn!(network_id, order_index, "Variable update for a behaviour that does not exist");
        ProtocolError::MissingTarget(format!("object {network_id} behaviour {order_index}"))
    })?;

    let changed = {
        let vars = behaviour.variables_mut().ok_or_else(|| {
            warn!(network_id, order_index, "Behaviour has no replicated variables");
            ProtocolError::MissingTarget(format!(
                "variables of object {network_id} behaviour {order_index}"
            ))
        })?;
        match shape {
            SyncShape::Delta => vars.read_delta(reader, access)?,
            SyncShape::Full => {
                if let Err(e) = vars.read_full(reader, access) {
                    warn!(network_id, order_index, error = %e, "Full variable update rejected");
                    return Err(e);
                }
                (0..vars.len()).collect()
            }
        }
    };

    if !changed.is_empty() {
        behaviour.on_variables_changed(&changed);
    }
    Ok(changed)
}

/// Encode a variable message header followed by a delta of `vars`.
pub fn write_variable_delta(
    writer: &mut BitWriter,
    network_id: NetworkId,
    order_index: u16,
    vars: &mut VariableSet,
    filter: impl Fn(crate::replication::WritePermission) -> bool,
) -> Result<()> {
    writer.write_u64_packed(network_id);
    writer.write_u16_packed(order_index);
    vars.write_delta(writer, filter)
}

/// Encode a variable message header followed by a full snapshot of `vars`.
pub fn write_variable_update(
    writer: &mut BitWriter,
    network_id: NetworkId,
    order_index: u16,
    vars: &VariableSet,
) {
    writer.write_u64_packed(network_id);
    writer.write_u16_packed(order_index);
    vars.write_full(writer);
}
