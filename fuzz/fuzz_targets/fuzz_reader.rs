#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_protocol::core::{BitReader, Value, ValueKind};
use replica_protocol::replication::{VariableSet, WriteAccess, WritePermission};

fuzz_target!(|data: &[u8]| {
    // Every primitive read must fail cleanly on arbitrary input
    let kinds = [
        ValueKind::Bool,
        ValueKind::U16,
        ValueKind::U32,
        ValueKind::U64,
        ValueKind::I64,
        ValueKind::F64,
        ValueKind::String,
        ValueKind::Bytes,
        ValueKind::Vec3,
    ];
    let mut reader = BitReader::new(data);
    for kind in kinds.iter().cycle().take(64) {
        if Value::read_from(*kind, &mut reader).is_err() {
            break;
        }
    }

    let mut vars = VariableSet::new()
        .with_field("hp", 0u32, WritePermission::ServerOnly)
        .with_field("name", "", WritePermission::OwnerOnly)
        .with_field("score", 0i64, WritePermission::Everyone);
    let _ = vars.read_delta(
        &mut BitReader::new(data),
        WriteAccess::Peer { sender: 1, owner: 1 },
    );
    let _ = vars.read_full(&mut BitReader::new(data), WriteAccess::Authority);
});
