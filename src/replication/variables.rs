//! Replicated variable sets.
//!
//! A behaviour declares its replicated fields once, in order. Field order is
//! the wire order for both encodings:
//!
//! ```text
//! delta:  for each field  [changed: bool] ([len: u16 packed] [value])?
//! full:   for each field  [value]
//! ```
//!
//! The delta form lets a receiver skip a field it may not accept, and lets an
//! older receiver ignore trailing bytes of a field a newer peer encodes longer.

use tracing::{debug, warn};

use crate::core::{BitReader, BitWriter, Value, ValueKind};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::ClientId;

/// Largest encoded field a delta can frame: the length prefix is a `u16`.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

fn check_field_len(name: &str, value: &Value) -> Result<()> {
    let len = value.encoded_len();
    if len > MAX_FIELD_LEN {
        return Err(ProtocolError::FieldTooLarge {
            field: name.to_owned(),
            len,
            max: MAX_FIELD_LEN,
        });
    }
    Ok(())
}

/// Who may write a field from the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritePermission {
    ServerOnly,
    OwnerOnly,
    Everyone,
}

/// Describes who is writing into a set and on whose behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAccess {
    /// Values pushed by the server. Always accepted.
    Authority,
    /// Values pushed by a client to the server.
    Peer { sender: ClientId, owner: ClientId },
}

impl WriteAccess {
    pub fn allows(self, permission: WritePermission) -> bool {
        match self {
            WriteAccess::Authority => true,
            WriteAccess::Peer { sender, owner } => match permission {
                WritePermission::ServerOnly => false,
                WritePermission::OwnerOnly => sender == owner,
                WritePermission::Everyone => true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkVariable {
    name: String,
    kind: ValueKind,
    value: Value,
    permission: WritePermission,
    dirty: bool,
}

impl NetworkVariable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn permission(&self) -> WritePermission {
        self.permission
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Ordered replicated fields of one behaviour.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    fields: Vec<NetworkVariable>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next field. Its kind is taken from the initial value.
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        initial: impl Into<Value>,
        permission: WritePermission,
    ) -> Self {
        let value = initial.into();
        self.fields.push(NetworkVariable {
            name: name.into(),
            kind: value.kind(),
            value,
            permission,
            dirty: false,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&NetworkVariable> {
        self.fields.get(index)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).map(|f| &f.value)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Local write. Marks the field dirty so the next delta carries it.
    ///
    /// Values encoding to more than [`MAX_FIELD_LEN`] bytes are rejected.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let field = self
            .fields
            .get_mut(index)
            .ok_or_else(|| ProtocolError::MissingTarget(format!("variable index {index}")))?;
        if value.kind() != field.kind {
            return Err(ProtocolError::TypeMismatch {
                expected: field.kind.name(),
                found: value.kind().name(),
            });
        }
        check_field_len(&field.name, &value)?;
        if field.value != value {
            field.value = value;
            field.dirty = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.fields.iter().any(|f| f.dirty)
    }

    pub fn dirty_indices(&self) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.dirty)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether any dirty field passes `filter`.
    pub fn has_dirty_matching(&self, filter: impl Fn(WritePermission) -> bool) -> bool {
        self.fields.iter().any(|f| f.dirty && filter(f.permission))
    }

    /// Encode dirty fields accepted by `filter` and clear their dirty flags.
    ///
    /// Fails with [`ProtocolError::FieldTooLarge`] before writing anything if a
    /// selected field does not fit its length prefix; dirty flags are kept.
    pub fn write_delta(
        &mut self,
        writer: &mut BitWriter,
        filter: impl Fn(WritePermission) -> bool,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if !(field.dirty && filter(field.permission)) {
                encoded.push(None);
                continue;
            }
            let mut scratch = BitWriter::new();
            field.value.write_to(&mut scratch);
            let len = u16::try_from(scratch.len()).map_err(|_| ProtocolError::FieldTooLarge {
                field: field.name.clone(),
                len: scratch.len(),
                max: MAX_FIELD_LEN,
            })?;
            encoded.push(Some((len, scratch)));
        }

        for (field, slot) in self.fields.iter_mut().zip(encoded) {
            writer.write_bool(slot.is_some());
            if let Some((len, scratch)) = slot {
                writer.write_u16_packed(len);
                writer.write_bytes(scratch.as_slice());
                field.dirty = false;
            }
        }
        Ok(())
    }

    /// Encode every field in declaration order, without lengths.
    pub fn write_full(&self, writer: &mut BitWriter) {
        for field in &self.fields {
            field.value.write_to(writer);
        }
    }

    /// Apply a delta. Returns the indices that changed.
    ///
    /// Nothing is applied unless the whole delta decodes.
    pub fn read_delta(
        &mut self,
        reader: &mut BitReader<'_>,
        access: WriteAccess,
    ) -> Result<Vec<usize>> {
        let mut staged = Vec::new();
        for (index, field) in self.fields.iter().enumerate() {
            if reader.is_empty() {
                debug!(index, "Delta ended before the last declared field");
                break;
            }
            if !reader.read_bool()? {
                continue;
            }
            let len = usize::from(reader.read_u16_packed()?);
            let mut slot = reader.sub_reader(len)?;

            if !access.allows(field.permission) {
                warn!(
                    field = %field.name,
                    ?access,
                    "Client wrote a variable it has no permission for; skipping field"
                );
                continue;
            }

            let value = Value::read_from(field.kind, &mut slot)?;
            if !slot.is_empty() {
                debug!(
                    field = %field.name,
                    trailing = slot.remaining(),
                    "Skipping trailing bytes of variable"
                );
            }
            staged.push((index, value));
        }

        let relay = matches!(access, WriteAccess::Peer { .. });
        let mut changed = Vec::with_capacity(staged.len());
        for (index, value) in staged {
            if let Some(field) = self.fields.get_mut(index) {
                field.value = value;
                field.dirty = relay;
                changed.push(index);
            }
        }
        Ok(changed)
    }

    /// Apply a full snapshot. Rejected whole if any field is not writable by `access`.
    pub fn read_full(&mut self, reader: &mut BitReader<'_>, access: WriteAccess) -> Result<()> {
        if let Some(field) = self.fields.iter().find(|f| !access.allows(f.permission)) {
            return Err(ProtocolError::PermissionDenied(format!(
                "variable '{}' is not writable by this peer",
                field.name
            )));
        }

        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = Value::read_from(field.kind, reader)?;
            check_field_len(&field.name, &value)?;
            values.push(value);
        }
        let relay = matches!(access, WriteAccess::Peer { .. });
        for (field, value) in self.fields.iter_mut().zip(values) {
            field.value = value;
            field.dirty = relay;
        }
        Ok(())
    }

    pub fn clear_dirty(&mut self) {
        for field in &mut self.fields {
            field.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use bytes::Bytes;

    fn sample() -> VariableSet {
        VariableSet::new()
            .with_field("health", 100u32, WritePermission::ServerOnly)
            .with_field("name", "player", WritePermission::OwnerOnly)
            .with_field("emote", 0u8, WritePermission::Everyone)
    }

    #[test]
    fn test_delta_carries_only_dirty_fields() {
        let mut source = sample();
        source.set(0, 75u32).unwrap();
        source.set(2, 3u8).unwrap();

        let mut w = BitWriter::new();
        source.write_delta(&mut w, |_| true).unwrap();
        assert!(!source.is_dirty());

        let mut target = sample();
        let mut r = BitReader::new(w.as_slice());
        let changed = target.read_delta(&mut r, WriteAccess::Authority).unwrap();
        assert_eq!(changed, vec![0, 2]);
        assert_eq!(target.get(0), Some(&Value::U32(75)));
        assert_eq!(target.get(1), Some(&Value::from("player")));
        assert_eq!(target.get(2), Some(&Value::U8(3)));
        assert!(r.is_empty());
    }

    #[test]
    fn test_delta_skips_forbidden_field() {
        let mut source = sample();
        source.set(0, 1u32).unwrap();
        source.set(1, "cheater").unwrap();
        let mut w = BitWriter::new();
        source.write_delta(&mut w, |_| true).unwrap();

        let mut target = sample();
        let access = WriteAccess::Peer { sender: 4, owner: 4 };
        let changed = target
            .read_delta(&mut BitReader::new(w.as_slice()), access)
            .unwrap();
        assert_eq!(changed, vec![1]);
        assert_eq!(target.get(0), Some(&Value::U32(100)));
        assert_eq!(target.get(1), Some(&Value::from("cheater")));
    }

    #[test]
    fn test_delta_tolerates_trailing_bytes() {
        // health written with two extra bytes a newer peer might append
        let mut w = BitWriter::new();
        w.write_bool(true);
        let mut value = BitWriter::new();
        value.write_u32_packed(42);
        value.write_bytes(&[0xAA, 0xBB]);
        w.write_u16_packed(value.len() as u16);
        w.write_bytes(value.as_slice());
        w.write_bool(false);
        w.write_bool(false);

        let mut target = sample();
        let changed = target
            .read_delta(&mut BitReader::new(w.as_slice()), WriteAccess::Authority)
            .unwrap();
        assert_eq!(changed, vec![0]);
        assert_eq!(target.get(0), Some(&Value::U32(42)));
    }

    #[test]
    fn test_short_delta_leaves_rest_unchanged() {
        let mut w = BitWriter::new();
        w.write_bool(false);

        let mut target = sample();
        let changed = target
            .read_delta(&mut BitReader::new(w.as_slice()), WriteAccess::Authority)
            .unwrap();
        assert!(changed.is_empty());
        assert_eq!(target.get(2), Some(&Value::U8(0)));
    }

    #[test]
    fn test_full_snapshot() {
        let mut source = sample();
        source.set(0, 5u32).unwrap();
        source.set(1, "renamed").unwrap();
        let mut w = BitWriter::new();
        source.write_full(&mut w);

        let mut target = sample();
        target
            .read_full(&mut BitReader::new(w.as_slice()), WriteAccess::Authority)
            .unwrap();
        assert_eq!(target.get(0), Some(&Value::U32(5)));
        assert_eq!(target.get(1), Some(&Value::from("renamed")));
        assert!(!target.is_dirty());
    }

    #[test]
    fn test_full_snapshot_rejected_for_peer_without_permission() {
        let mut w = BitWriter::new();
        sample().write_full(&mut w);
        let mut target = sample();
        let access = WriteAccess::Peer { sender: 2, owner: 2 };
        assert!(matches!(
            target.read_full(&mut BitReader::new(w.as_slice()), access),
            Err(ProtocolError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_oversized_field_rejected_by_set() {
        let mut set = sample().with_field("blob", Bytes::new(), WritePermission::Everyone);
        let err = set.set(3, Bytes::from(vec![7u8; 70_000])).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FieldTooLarge { ref field, len, max: MAX_FIELD_LEN }
                if field == "blob" && len > MAX_FIELD_LEN
        ));
        assert!(!set.is_dirty());
        assert_eq!(set.get(3), Some(&Value::Bytes(Bytes::new())));
    }

    #[test]
    fn test_oversized_dirty_field_writes_nothing() {
        let mut source = sample().with_field(
            "blob",
            Bytes::from(vec![7u8; 70_000]),
            WritePermission::Everyone,
        );
        source.set(0, 42u32).unwrap();
        source.fields[3].dirty = true;

        let mut w = BitWriter::new();
        assert!(matches!(
            source.write_delta(&mut w, |_| true),
            Err(ProtocolError::FieldTooLarge { .. })
        ));
        assert!(w.is_empty());
        assert_eq!(source.dirty_indices(), vec![0, 3]);

        // without the oversized field the pending health update still goes out
        source.fields[3].dirty = false;
        source.write_delta(&mut w, |_| true).unwrap();
        let mut target = sample().with_field("blob", Bytes::new(), WritePermission::Everyone);
        let changed = target
            .read_delta(&mut BitReader::new(w.as_slice()), WriteAccess::Authority)
            .unwrap();
        assert_eq!(changed, vec![0]);
        assert_eq!(target.get(0), Some(&Value::U32(42)));
    }

    #[test]
    fn test_failed_delta_applies_nothing() {
        let mut w = BitWriter::new();
        w.write_bool(true);
        w.write_u16_packed(1);
        w.write_u32_packed(7);
        // name claims ten bytes but only two follow
        w.write_bool(true);
        w.write_u16_packed(10);
        w.write_bytes(&[1, b'x']);

        let mut target = sample();
        let result = target.read_delta(&mut BitReader::new(w.as_slice()), WriteAccess::Authority);
        assert!(matches!(result, Err(ProtocolError::TruncatedInput { .. })));
        assert_eq!(target.get(0), Some(&Value::U32(100)));
        assert_eq!(target.get(1), Some(&Value::from("player")));
        assert!(!target.is_dirty());
    }

    #[test]
    fn test_oversized_snapshot_value_rejected() {
        let mut w = BitWriter::new();
        w.write_u32_packed(1);
        w.write_byte_array(&vec![0u8; 70_000]);

        let mut target = VariableSet::new()
            .with_field("hp", 0u32, WritePermission::Everyone)
            .with_field("blob", Bytes::new(), WritePermission::Everyone);
        let access = WriteAccess::Peer { sender: 2, owner: 2 };
        assert!(matches!(
            target.read_full(&mut BitReader::new(w.as_slice()), access),
            Err(ProtocolError::FieldTooLarge { .. })
        ));
        assert_eq!(target.get(0), Some(&Value::U32(0)));
    }

    #[test]
    fn test_set_checks_kind() {
        let mut set = sample();
        assert!(matches!(
            set.set(0, "text"),
            Err(ProtocolError::TypeMismatch { .. })
        ));
        assert!(set.set(9, 1u32).is_err());
        set.set(0, 100u32).unwrap();
        assert!(!set.is_dirty());
    }

    #[test]
    fn test_owner_permission() {
        let owner = WriteAccess::Peer { sender: 3, owner: 3 };
        let other = WriteAccess::Peer { sender: 4, owner: 3 };
        assert!(owner.allows(WritePermission::OwnerOnly));
        assert!(!other.allows(WritePermission::OwnerOnly));
        assert!(other.allows(WritePermission::Everyone));
        assert!(!owner.allows(WritePermission::ServerOnly));
        assert!(WriteAccess::Authority.allows(WritePermission::ServerOnly));
    }
}
