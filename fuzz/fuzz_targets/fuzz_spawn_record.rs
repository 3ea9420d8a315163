#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_protocol::config::SpawnMode;
use replica_protocol::core::{BitReader, BitWriter};
use replica_protocol::protocol::spawn::{RecordShape, SpawnRecord};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let mode = if data[0] & 1 == 0 {
        SpawnMode::PrefabSync
    } else {
        SpawnMode::SoftSync
    };
    let shape = if data[0] & 2 == 0 {
        RecordShape::Standalone
    } else {
        RecordShape::Initial
    };

    let mut reader = BitReader::new(&data[1..]);
    if let Ok(record) = SpawnRecord::decode(&mut reader, mode, shape) {
        // A decoded record re-encodes to something that decodes the same
        let mut writer = BitWriter::new();
        if record.encode(&mut writer, mode, shape).is_ok() {
            let bytes = writer.into_inner();
            let again = SpawnRecord::decode(&mut BitReader::new(&bytes), mode, shape)
                .expect("re-encoded record decodes");
            assert_eq!(again.network_id, record.network_id);
            assert_eq!(again.identity, record.identity);
        }
    }
});
