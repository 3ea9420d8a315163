use crate::core::{BitReader, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{ClientId, NetworkId};
use crate::protocol::rpc::RpcCall;

use super::VariableSet;

/// Ownership change delivered to each behaviour of the affected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipTransfer {
    pub network_id: NetworkId,
    pub previous_owner: ClientId,
    pub new_owner: ClientId,
}

/// A component attached to a replicated object.
///
/// Behaviours are addressed by their position on the object (`order_index`),
/// which is identical on every peer because both sides instantiate the same
/// prefab or scene object.
pub trait NetworkBehaviour: Send {
    fn variables(&self) -> Option<&VariableSet> {
        None
    }

    fn variables_mut(&mut self) -> Option<&mut VariableSet> {
        None
    }

    /// Called after a replicated update changed the listed fields.
    fn on_variables_changed(&mut self, _changed: &[usize]) {}

    fn on_gained_ownership(&mut self, _transfer: &OwnershipTransfer) {}

    fn on_lost_ownership(&mut self, _transfer: &OwnershipTransfer) {}

    /// Invoke the method identified by `call.method_hash`; `args` holds the
    /// remaining bytes of the message.
    fn invoke_rpc(&mut self, call: &RpcCall, _args: &mut BitReader<'_>) -> Result<Value> {
        Err(ProtocolError::MissingTarget(format!(
            "method {:#018x} on object {} behaviour {}",
            call.method_hash, call.network_id, call.behaviour_index
        )))
    }
}
