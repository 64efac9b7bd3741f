#![allow(dead_code)]

use cluster_relay::memory::{CoordinatorHub, MemoryCluster};
use cluster_relay::{ClientEvent, ClusterRelay, LocalBroker, LocalEvent, RelayConfig};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const B1: &str = "wss://broker-1:8888";
pub const B2: &str = "wss://broker-2:8888";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_relay=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Local broker that records what the relay delivers.
#[derive(Default)]
pub struct RecordingBroker {
    subscriptions: Mutex<Vec<String>>,
    delivered: Mutex<Vec<(String, Value)>>,
}

impl RecordingBroker {
    pub fn add_subscription(&self, channel: &str) {
        self.subscriptions.lock().unwrap().push(channel.to_string());
    }

    pub fn delivered(&self) -> Vec<(String, Value)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_on(&self, channel: &str) -> Vec<Value> {
        self.delivered()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, v)| v)
            .collect()
    }
}

impl LocalBroker for RecordingBroker {
    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    fn deliver(&self, channel: &str, message: Value) {
        self.delivered
            .lock()
            .unwrap()
            .push((channel.to_string(), message));
    }
}

pub struct Worker {
    pub relay: ClusterRelay,
    pub broker: Arc<RecordingBroker>,
    local: mpsc::UnboundedSender<LocalEvent>,
}

impl Worker {
    pub fn subscribe(&self, channel: &str) {
        self.broker.add_subscription(channel);
        self.local
            .send(LocalEvent::Subscribe(channel.to_string()))
            .unwrap();
    }

    pub fn publish(&self, channel: &str, data: Value) {
        self.local
            .send(LocalEvent::Publish {
                channel: channel.to_string(),
                data,
            })
            .unwrap();
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.relay.events()
    }
}

pub fn test_config(instance_id: &str) -> RelayConfig {
    let mut config = RelayConfig {
        instance_id: Some(instance_id.to_string()),
        ..RelayConfig::default()
    };
    config.coordinator.retry_delay = Duration::from_millis(30);
    config
}

pub fn spawn_worker(
    hub: &CoordinatorHub,
    cluster: &MemoryCluster,
    config: RelayConfig,
) -> Worker {
    let name = config
        .instance_id
        .clone()
        .expect("test workers need an instance id");
    let broker = Arc::new(RecordingBroker::default());
    let (local, local_rx) = mpsc::unbounded_channel();
    let relay = ClusterRelay::attach(
        broker.clone(),
        local_rx,
        hub.member(&name),
        Arc::new(cluster.clone()),
        config,
    )
    .unwrap();
    Worker {
        relay,
        broker,
        local,
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn channels(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("channel-{}", i)).collect()
}
