//! Scene-switch continuation.
//!
//! A connection-approved or switch-scene message may arrive while the client
//! still shows another scene. Processing cannot continue until the host has
//! loaded the right one, so the unread tail of the message is copied into a
//! [`StreamContinuation`] and parked as a [`SceneTask`]. When the host reports
//! the load as complete the task is taken and replayed through the normal
//! spawn path.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::{BitReader, BitWriter};
use crate::error::{constants, ProtocolError, Result};

/// Identifies one scene switch; echoed back by the client on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SwitchId(pub [u8; 16]);

impl SwitchId {
    pub fn generate() -> Result<Self> {
        let mut id = [0u8; 16];
        getrandom::fill(&mut id)
            .map_err(|e| ProtocolError::Custom(format!("Failed to generate switch id: {e}")))?;
        Ok(SwitchId(id))
    }

    pub fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let bytes = reader.read_byte_array()?;
        let id = <[u8; 16]>::try_from(bytes)
            .map_err(|_| ProtocolError::MalformedInput(constants::ERR_INVALID_SWITCH_ID.into()))?;
        Ok(SwitchId(id))
    }

    pub fn write(&self, writer: &mut BitWriter) {
        writer.write_byte_array(&self.0);
    }
}

/// Owned copy of the unread tail of a suspended message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamContinuation {
    bytes: Bytes,
}

impl StreamContinuation {
    /// Copy everything `reader` has not consumed yet.
    pub fn capture(reader: &BitReader<'_>) -> Self {
        Self {
            bytes: reader.copy_remaining(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn reader(&self) -> BitReader<'_> {
        BitReader::new(&self.bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneTaskKind {
    /// Initial sync carried by connection-approved
    FirstSync,
    /// Runtime switch announced by switch-scene
    Switch,
}

/// A spawn batch waiting for a scene load.
#[derive(Debug, Clone)]
pub struct SceneTask {
    pub kind: SceneTaskKind,
    pub scene_index: u32,
    pub switch_id: SwitchId,
    pub continuation: StreamContinuation,
}

/// Holds at most one suspended task.
#[derive(Debug, Default)]
pub struct SceneSwitchQueue {
    pending: Option<SceneTask>,
}

impl SceneSwitchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a task. A task that was still waiting is discarded.
    pub fn suspend(&mut self, task: SceneTask) {
        debug!(
            kind = ?task.kind,
            scene_index = task.scene_index,
            buffered = task.continuation.len(),
            "Suspending spawn batch until scene load"
        );
        if let Some(stale) = self.pending.replace(task) {
            warn!(
                kind = ?stale.kind,
                scene_index = stale.scene_index,
                "Replacing a scene task that never resumed"
            );
        }
    }

    pub fn take(&mut self) -> Option<SceneTask> {
        self.pending.take()
    }

    pub fn pending(&self) -> Option<&SceneTask> {
        self.pending.as_ref()
    }

    pub fn is_suspended(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

/// Decode the header of a switch-scene message and capture its remainder.
pub fn read_switch_scene(reader: &mut BitReader<'_>) -> Result<SceneTask> {
    let scene_index = reader.read_u32_packed()?;
    let switch_id = SwitchId::read(reader)?;
    Ok(SceneTask {
        kind: SceneTaskKind::Switch,
        scene_index,
        switch_id,
        continuation: StreamContinuation::capture(reader),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_switch_scene_header_and_tail() {
        let id = SwitchId([3u8; 16]);
        let mut w = BitWriter::new();
        w.write_u32_packed(2);
        id.write(&mut w);
        w.write_bytes(&[10, 20, 30]);

        let task = read_switch_scene(&mut BitReader::new(w.as_slice())).unwrap();
        assert_eq!(task.kind, SceneTaskKind::Switch);
        assert_eq!(task.scene_index, 2);
        assert_eq!(task.switch_id, id);
        assert_eq!(task.continuation.as_bytes(), &[10, 20, 30]);
    }

    #[test]
    fn test_switch_id_length_checked() {
        let mut w = BitWriter::new();
        w.write_byte_array(&[1, 2, 3]);
        assert!(matches!(
            SwitchId::read(&mut BitReader::new(w.as_slice())),
            Err(ProtocolError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_queue_holds_one_task() {
        let mut queue = SceneSwitchQueue::new();
        let task = |index| SceneTask {
            kind: SceneTaskKind::Switch,
            scene_index: index,
            switch_id: SwitchId::default(),
            continuation: StreamContinuation::capture(&BitReader::new(&[])),
        };
        queue.suspend(task(1));
        queue.suspend(task(2));
        assert_eq!(queue.take().map(|t| t.scene_index), Some(2));
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(SwitchId::generate().unwrap(), SwitchId::generate().unwrap());
    }
}
