//! # Replication State
//!
//! The data the protocol handlers mutate: the registry of spawned objects, the
//! behaviours attached to them and their replicated variables.

pub mod behaviour;
pub mod registry;
pub mod variables;

pub use behaviour::{NetworkBehaviour, OwnershipTransfer};
pub use registry::{NetworkedObject, ParentState, SpawnedObjectRegistry};
pub use variables::{NetworkVariable, VariableSet, WriteAccess, WritePermission};
