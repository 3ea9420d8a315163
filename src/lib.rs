//! # replica-protocol
//!
//! Message-level core of a client/server replication protocol for
//! networked games.
//!
//! A server owns the authoritative set of replicated objects. Clients connect
//! through an optional key exchange, are approved, receive the current object
//! set and then track spawns, destroys, ownership changes, variable updates,
//! RPCs and scene switches.
//!
//! ## Layout
//! - [`core`]: packed binary reader/writer and the [`Value`](core::Value) type
//! - [`protocol`]: per-message handlers and the collaborator traits
//! - [`replication`]: spawned object registry, behaviours and replicated variables
//! - [`engine`]: [`NetworkEngine`], which owns the state and routes messages
//! - [`config`]: TOML/env configuration
//! - [`utils`]: session cipher, buffer pool, hashing, logging and metrics
//!
//! Transport, scene loading and object instantiation are supplied by the host
//! through the traits in [`protocol::context`].

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod utils;

pub use config::NetworkConfig;
pub use engine::{Collaborators, EngineEvent, NetworkEngine, SpawnRequest};
pub use error::{ProtocolError, Result};
pub use protocol::message::{ClientId, MessageType, NetworkId, Role, SecurityFlags};
