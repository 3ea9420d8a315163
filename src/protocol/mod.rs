//! # Protocol Handlers
//!
//! One module per message family. Handlers decode from a [`BitReader`],
//! mutate engine state passed in through small context structs and report
//! failures as [`ProtocolError`](crate::error::ProtocolError).
//!
//! ## Components
//! - **Message**: wire tags, roles, security flags and framing
//! - **Context**: collaborator traits the host implements
//! - **Handshake**: x25519 key exchange with optional certificate signing
//! - **Connection**: server connection records and approval flow
//! - **Spawn**: object records, batches, destroy and ownership changes
//! - **Scene**: suspended spawn batches across scene loads
//! - **Sync**: replicated variable deltas and snapshots
//! - **Rpc**: invocations and response correlation
//! - **Custom**: named and unnamed application messages
//! - **Time**: network clock
//!
//! [`BitReader`]: crate::core::BitReader

pub mod connection;
pub mod context;
pub mod custom;
pub mod handshake;
pub mod message;
pub mod rpc;
pub mod scene;
pub mod spawn;
pub mod sync;
pub mod time;


pub use message::{
    ClientId, InboundMessage, MessageType, NetworkId, ResponseId, Role, SecurityFlags,
    INTERNAL_CHANNEL, SERVER_CLIENT_ID,
};
