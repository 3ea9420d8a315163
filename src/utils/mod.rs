//! # Utility Modules
//!
//! Supporting utilities shared by the protocol handlers.
//!
//! ## Components
//! - **Buffer Pool**: reusable encode buffers for outbound messages
//! - **Crypto**: XChaCha20-Poly1305 session cipher for sealed messages
//! - **Hash**: wire-stable 64-bit hashes for config and message names
//! - **Logging**: `tracing-subscriber` bootstrap
//! - **Metrics**: atomic protocol counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom) for nonces
//! - Session keys wiped on drop (zeroize crate)

pub mod buffer_pool;
pub mod crypto;
pub mod hash;
pub mod logging;
pub mod metrics;

pub use buffer_pool::{PooledWriter, WriterPool};
pub use crypto::{SessionCipher, SymmetricKey};
pub use metrics::{Metrics, MetricsSnapshot};
