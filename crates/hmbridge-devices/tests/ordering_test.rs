//! Per-device ordering of state changes and the telegrams they produce.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use hmbridge_core::{
    BridgeConfig, BridgeResult, Device, MemoryTransport, PublishOptions, StateMap, Transport,
};
use hmbridge_devices::{DeviceManager, InboundMessage, SchemaRegistry};

const OUTPUTS_OUT: &str = "hame_energy/HMB-1/App/dev2/ctrl";
const INBOUND: &str = "hame_energy/HMB-1/device/dev2/ctrl";

/// Records like `MemoryTransport` but holds back one payload.
struct SlowTransport {
    inner: MemoryTransport,
    slow_payload: &'static str,
    delay: Duration,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> BridgeResult<()> {
        if payload == self.slow_payload {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.publish(topic, payload, options).await
    }

    async fn subscribe(&self, topics: &[String]) -> BridgeResult<()> {
        self.inner.subscribe(topics).await
    }
}

fn setup(transport: Arc<dyn Transport>) -> Arc<DeviceManager> {
    let manager = DeviceManager::new(&BridgeConfig::default(), SchemaRegistry::builtin(), transport);
    manager.add_devices(&[Device::new("HMB-1", "dev2")]).unwrap();
    Arc::new(manager)
}

fn output_bits(state: &StateMap) -> u8 {
    let on = |key: &str| state.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
    u8::from(on("output1")) | (u8::from(on("output2")) << 1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_output_commands_reach_device_in_state_order() {
    let transport = Arc::new(SlowTransport {
        inner: MemoryTransport::new(),
        slow_payload: "cd=4,md=1",
        delay: Duration::from_millis(2),
    });
    let manager = setup(transport.clone());
    let device = Device::new("HMB-1", "dev2");

    for round in 0..50 {
        manager
            .store()
            .update_channel(&device, "data", |_| {
                let mut patch = StateMap::new();
                patch.insert("output1".into(), json!(false));
                patch.insert("output2".into(), json!(false));
                patch
            })
            .unwrap();
        transport.inner.take_published();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.on_inbound_message("hm2mqtt/dev2/control/output1", "true").await;
            })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.on_inbound_message("hm2mqtt/dev2/control/output2", "true").await;
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        let state = manager.store().state_for(&device).unwrap();
        let sent = transport.inner.published_to(OUTPUTS_OUT);
        let last = sent.last().map(|m| m.payload.clone());
        assert_eq!(
            last,
            Some(format!("cd=4,md={}", output_bits(&state))),
            "round {}: device and bridge state disagree",
            round
        );
        assert_eq!(output_bits(&state), 3);
    }
}

#[tokio::test]
async fn test_inbound_worker_keeps_arrival_order() {
    let transport = Arc::new(MemoryTransport::new());
    let manager = setup(transport.clone());
    let device = Device::new("HMB-1", "dev2");

    let (inbound, worker) = manager.spawn_inbound_worker();
    for message in [
        InboundMessage::new(INBOUND, "pe=10"),
        InboundMessage::new("hm2mqtt/dev2/control/output1", "true"),
        InboundMessage::new("hm2mqtt/dev2/control/output2", "true"),
        InboundMessage::new("hm2mqtt/dev2/control/output1", "false"),
        InboundMessage::new(INBOUND, "pe=20"),
    ] {
        inbound.send(message).unwrap();
    }
    drop(inbound);
    worker.await.unwrap();

    let sent: Vec<String> = transport
        .published_to(OUTPUTS_OUT)
        .into_iter()
        .map(|m| m.payload)
        .collect();
    assert_eq!(sent, vec!["cd=4,md=1", "cd=4,md=3", "cd=4,md=2"]);

    let state = manager.store().state_for(&device).unwrap();
    assert_eq!(state["batteryPercentage"], json!(20));
    assert_eq!(output_bits(&state), 2);
}
