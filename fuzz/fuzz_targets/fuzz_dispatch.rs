#![no_main]

use std::sync::Arc;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use replica_protocol::protocol::context::{
    CreateObject, LocalObject, ObjectHandle, ObjectSpawner, OutboundSender, SceneController,
};
use replica_protocol::protocol::scene::{StreamContinuation, SwitchId};
use replica_protocol::replication::NetworkedObject;
use replica_protocol::{
    ClientId, Collaborators, MessageType, NetworkConfig, NetworkEngine, NetworkId, SecurityFlags,
};

struct Discard;

impl OutboundSender for Discard {
    fn send(&self, _: ClientId, _: MessageType, _: &str, _: Bytes, _: SecurityFlags, _: Option<NetworkId>) {}

    fn disconnect(&self, _: ClientId) {}
}

#[derive(Default)]
struct Spawner(u64);

impl ObjectSpawner for Spawner {
    fn create_local_object(&mut self, _: &CreateObject) -> replica_protocol::Result<LocalObject> {
        self.0 += 1;
        Ok(LocalObject {
            handle: ObjectHandle(self.0),
            behaviours: Vec::new(),
        })
    }

    fn spawn_locally(&mut self, _: &NetworkedObject, _: Option<&[u8]>) {}

    fn destroy(&mut self, _: NetworkId, _: ObjectHandle) {}

    fn sweep_soft_sync_candidates(&mut self) {}

    fn destroy_scene_objects(&mut self) {}
}

struct Scenes;

impl SceneController for Scenes {
    fn current_scene_index(&self) -> u32 {
        0
    }

    fn current_switch_id(&self) -> SwitchId {
        SwitchId([0; 16])
    }

    fn has_mismatch(&self, scene_index: u32) -> bool {
        scene_index != 0
    }

    fn on_first_switch_sync(&mut self, _: u32, _: SwitchId) {}

    fn on_switch(&mut self, _: u32, _: SwitchId, _: &StreamContinuation) {}

    fn on_client_switch_completed(&mut self, _: ClientId, _: SwitchId) {}
}

fn collaborators() -> Collaborators {
    Collaborators::new(Arc::new(Discard), Box::<Spawner>::default(), Box::new(Scenes))
}

fuzz_target!(|data: &[u8]| {
    let config = NetworkConfig::default();

    if let Ok(mut server) = NetworkEngine::new_server(config.clone(), collaborators()) {
        if server.on_client_connected(1).is_ok() {
            let _ = server.handle_frame(1, Bytes::copy_from_slice(data), 0.0);
        }
    }

    if let Ok(mut client) = NetworkEngine::new_client(config, collaborators()) {
        if client.connect(Vec::new()).is_ok() {
            let _ = client.handle_frame(0, Bytes::copy_from_slice(data), 0.0);
        }
    }
});
