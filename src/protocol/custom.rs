//! Named and unnamed application messages.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::core::{BitReader, BitWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::ClientId;
use crate::utils::hash::hash_name;

type HandlerFn = dyn Fn(ClientId, &mut BitReader<'_>) -> Result<()> + Send + Sync + 'static;

/// Registry of application message handlers.
///
/// Named messages are routed by the stable hash of their name, unnamed
/// messages go to a single catch-all handler.
#[derive(Clone)]
pub struct CustomMessaging {
    named: Arc<RwLock<HashMap<u64, Box<HandlerFn>>>>,
    unnamed: Arc<RwLock<Option<Box<HandlerFn>>>>,
}

impl Default for CustomMessaging {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomMessaging {
    pub fn new() -> Self {
        Self {
            named: Arc::new(RwLock::new(HashMap::new())),
            unnamed: Arc::new(RwLock::new(None)),
        }
    }

    pub fn register_named<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(ClientId, &mut BitReader<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .named
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.to_string()))?;
        handlers.insert(hash_name(name), Box::new(handler));
        Ok(())
    }

    pub fn unregister_named(&self, name: &str) -> Result<bool> {
        let mut handlers = self
            .named
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.to_string()))?;
        Ok(handlers.remove(&hash_name(name)).is_some())
    }

    pub fn set_unnamed_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(ClientId, &mut BitReader<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let mut slot = self
            .unnamed
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_WRITE_LOCK.to_string()))?;
        *slot = Some(Box::new(handler));
        Ok(())
    }

    /// Route a named-message payload: `[name_hash: u64p] [payload...]`.
    pub fn handle_named(&self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<()> {
        let hash = reader.read_u64_packed()?;
        let handlers = self
            .named
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_READ_LOCK.to_string()))?;
        match handlers.get(&hash) {
            Some(handler) => handler(sender, reader),
            None => {
                debug!(hash, sender, "No handler for named message");
                Ok(())
            }
        }
    }

    pub fn handle_unnamed(&self, sender: ClientId, reader: &mut BitReader<'_>) -> Result<()> {
        let slot = self
            .unnamed
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_HANDLER_READ_LOCK.to_string()))?;
        match slot.as_ref() {
            Some(handler) => handler(sender, reader),
            None => {
                debug!(sender, "No handler for unnamed message");
                Ok(())
            }
        }
    }
}

/// Payload of a named message.
pub fn build_named(name: &str, payload: &[u8]) -> Bytes {
    let mut writer = BitWriter::with_capacity(payload.len() + 9);
    writer.write_u64_packed(hash_name(name));
    writer.write_bytes(payload);
    writer.into_bytes()
}
