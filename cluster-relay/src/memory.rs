//! In-process broker cluster and coordinator.
//!
//! Used by the test-suite and handy for embedding the relay without a
//! network. Sites are keyed by `hostname:port`, so URIs that differ only in
//! path or scheme land on the same broker.

use crate::coordinator::{
    Coordinator, CoordinatorEvent, InstanceState, JoinReply, MembershipSnapshot, WorkerRegistration,
};
use crate::transport::{
    BrokerConnection, ConnectOptions, ConnectionEvent, Connector, PacketStream, PublishAck,
};
use crate::{Error, Packet, Site, TransportError};
use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn site_key(uri: &str) -> String {
    match Site::parse(uri) {
        Ok(site) => format!("{}:{}", site.hostname(), site.port()),
        Err(_) => uri.to_string(),
    }
}

#[derive(Default)]
struct SiteState {
    down: bool,
    subscribers: HashMap<String, HashMap<u64, mpsc::UnboundedSender<Packet>>>,
    published: Vec<(String, Packet)>,
}

#[derive(Default)]
struct ClusterState {
    sites: HashMap<String, SiteState>,
    live: HashMap<u64, (String, broadcast::Sender<ConnectionEvent>)>,
    connect_log: Vec<ConnectOptions>,
    next_id: u64,
}

/// A set of in-memory broker sites.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes to `uri` fail until brought back up.
    pub fn set_down(&self, uri: &str, down: bool) {
        lock(&self.state).sites.entry(site_key(uri)).or_default().down = down;
    }

    /// Emit a connection error on every live connection to `uri`.
    pub fn fail_connections(&self, uri: &str, reason: &str) {
        let key = site_key(uri);
        let state = lock(&self.state);
        for (site, events) in state.live.values() {
            if *site == key {
                let _ = events.send(ConnectionEvent::Error(TransportError::Failed(
                    reason.to_string(),
                )));
            }
        }
    }

    /// Every packet accepted by `uri`, in arrival order.
    pub fn published(&self, uri: &str) -> Vec<(String, Packet)> {
        lock(&self.state)
            .sites
            .get(&site_key(uri))
            .map(|site| site.published.clone())
            .unwrap_or_default()
    }

    pub fn publish_count(&self, uri: &str) -> usize {
        self.published(uri).len()
    }

    pub fn publish_count_for(&self, uri: &str, channel: &str) -> usize {
        self.published(uri)
            .iter()
            .filter(|(published_on, _)| published_on == channel)
            .count()
    }

    pub fn subscriber_count(&self, uri: &str, channel: &str) -> usize {
        lock(&self.state)
            .sites
            .get(&site_key(uri))
            .and_then(|site| site.subscribers.get(channel))
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    pub fn live_connections(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn live_connections_to(&self, uri: &str) -> usize {
        let key = site_key(uri);
        lock(&self.state)
            .live
            .values()
            .filter(|(site, _)| *site == key)
            .count()
    }

    pub fn connect_log(&self) -> Vec<ConnectOptions> {
        lock(&self.state).connect_log.clone()
    }

    /// Deliver `packet` to current subscribers of `channel` on `uri` as if
    /// another publisher sent it. Returns how many subscribers got it.
    pub fn inject(&self, uri: &str, channel: &str, packet: Packet) -> usize {
        let state = lock(&self.state);
        state
            .sites
            .get(&site_key(uri))
            .and_then(|site| site.subscribers.get(channel))
            .map(|subscribers| {
                subscribers
                    .values()
                    .filter(|tx| tx.send(packet.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Connector for MemoryCluster {
    fn connect(&self, options: ConnectOptions) -> Arc<dyn BrokerConnection> {
        let key = format!("{}:{}", options.hostname, options.port);
        let (events, _) = broadcast::channel(64);

        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.sites.entry(key.clone()).or_default();
            state.live.insert(id, (key.clone(), events.clone()));
            state.connect_log.push(options);
            id
        };

        Arc::new(MemoryConnection {
            id,
            site: key,
            cluster: self.state.clone(),
            channels: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
        })
    }
}

struct MemoryConnection {
    id: u64,
    site: String,
    cluster: Arc<Mutex<ClusterState>>,
    channels: Mutex<Vec<String>>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
}

impl BrokerConnection for MemoryConnection {
    fn subscribe(&self, channel: &str) -> PacketStream {
        if self.closed.load(Ordering::Acquire) {
            let _ = self.events.send(ConnectionEvent::SubscribeFail {
                channel: channel.to_string(),
                error: TransportError::Closed,
            });
            return stream::empty().boxed();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut cluster = lock(&self.cluster);
            cluster
                .sites
                .entry(self.site.clone())
                .or_default()
                .subscribers
                .entry(channel.to_string())
                .or_default()
                .insert(self.id, tx);
        }
        {
            let mut channels = lock(&self.channels);
            if !channels.iter().any(|held| held == channel) {
                channels.push(channel.to_string());
            }
        }
        let _ = self.events.send(ConnectionEvent::Subscribe {
            channel: channel.to_string(),
        });

        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|packet| (packet, rx))
        })
        .boxed()
    }

    fn unsubscribe(&self, channel: &str) {
        lock(&self.channels).retain(|held| held != channel);
        let mut cluster = lock(&self.cluster);
        if let Some(site) = cluster.sites.get_mut(&self.site) {
            if let Some(subscribers) = site.subscribers.get_mut(channel) {
                subscribers.remove(&self.id);
                if subscribers.is_empty() {
                    site.subscribers.remove(channel);
                }
            }
        }
    }

    fn is_subscribed(&self, channel: &str, _include_pending: bool) -> bool {
        lock(&self.channels).iter().any(|held| held == channel)
    }

    fn subscriptions(&self, _include_pending: bool) -> Vec<String> {
        lock(&self.channels).clone()
    }

    fn publish(&self, channel: &str, packet: Packet) -> PublishAck {
        if self.closed.load(Ordering::Acquire) {
            return Box::pin(future::ready(Err(TransportError::Closed)));
        }

        let mut cluster = lock(&self.cluster);
        let site = cluster.sites.entry(self.site.clone()).or_default();
        if site.down {
            return Box::pin(future::ready(Err(TransportError::Failed(format!(
                "{} is unavailable",
                self.site
            )))));
        }

        site.published.push((channel.to_string(), packet.clone()));
        if let Some(subscribers) = site.subscribers.get(channel) {
            for tx in subscribers.values() {
                let _ = tx.send(packet.clone());
            }
        }
        Box::pin(future::ready(Ok(())))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<String> = lock(&self.channels).drain(..).collect();
        let mut cluster = lock(&self.cluster);
        if let Some(site) = cluster.sites.get_mut(&self.site) {
            for channel in channels {
                if let Some(subscribers) = site.subscribers.get_mut(&channel) {
                    subscribers.remove(&self.id);
                    if subscribers.is_empty() {
                        site.subscribers.remove(&channel);
                    }
                }
            }
        }
        cluster.live.remove(&self.id);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct HubState {
    sites: Vec<String>,
    workers: Vec<String>,
    time: i64,
    failing_joins: u32,
    join_count: usize,
    manual_convergence: bool,
    last_reported: BTreeMap<String, Option<InstanceState>>,
    reports: Vec<(String, InstanceState)>,
}

struct HubShared {
    state: Mutex<HubState>,
    events: broadcast::Sender<CoordinatorEvent>,
}

/// In-memory coordinator shared by any number of workers.
///
/// Convergence fires automatically once every member's latest report
/// agrees, unless manual convergence is switched on.
#[derive(Clone)]
pub struct CoordinatorHub {
    shared: Arc<HubShared>,
}

impl CoordinatorHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(HubShared {
                state: Mutex::new(HubState::default()),
                events,
            }),
        }
    }

    /// Register a member and return its coordinator handle.
    pub fn member(&self, name: &str) -> Arc<MemoryCoordinator> {
        lock(&self.shared.state)
            .last_reported
            .insert(name.to_string(), None);
        Arc::new(MemoryCoordinator {
            name: name.to_string(),
            shared: self.shared.clone(),
        })
    }

    /// Replace broker membership and push it to every member.
    pub fn set_sites(&self, sites: &[&str]) -> i64 {
        let (event, time) = {
            let mut state = lock(&self.shared.state);
            let grew = sites.len() >= state.sites.len();
            state.sites = sites.iter().map(|s| s.to_string()).collect();
            state.time += 1;
            let snapshot = MembershipSnapshot {
                sites: state.sites.clone(),
                time: state.time,
            };
            let event = if grew {
                CoordinatorEvent::SiteJoined(snapshot)
            } else {
                CoordinatorEvent::SiteLeft(snapshot)
            };
            (event, state.time)
        };
        self.push(event);
        time
    }

    /// Push a raw event to every member.
    pub fn push(&self, event: CoordinatorEvent) {
        let _ = self.shared.events.send(event);
    }

    pub fn fail_next_joins(&self, count: u32) {
        lock(&self.shared.state).failing_joins = count;
    }

    pub fn join_count(&self) -> usize {
        lock(&self.shared.state).join_count
    }

    pub fn set_manual_convergence(&self, manual: bool) {
        lock(&self.shared.state).manual_convergence = manual;
    }

    pub fn converge(&self, state: InstanceState) {
        self.push(CoordinatorEvent::StatesConverge(state));
    }

    /// States reported by `name`, oldest first.
    pub fn reports(&self, name: &str) -> Vec<InstanceState> {
        lock(&self.shared.state)
            .reports
            .iter()
            .filter(|(member, _)| member == name)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl Default for CoordinatorHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's view of a [`CoordinatorHub`].
pub struct MemoryCoordinator {
    name: String,
    shared: Arc<HubShared>,
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn join(&self, registration: &WorkerRegistration) -> Result<JoinReply, Error> {
        let mut state = lock(&self.shared.state);
        state.join_count += 1;
        if state.failing_joins > 0 {
            state.failing_joins -= 1;
            return Err(Error::coordinator("join refused"));
        }
        if !state.workers.contains(&registration.instance_id) {
            state.workers.push(registration.instance_id.clone());
        }
        Ok(JoinReply {
            brokers: state.sites.clone(),
            workers: state.workers.clone(),
            time: Some(state.time),
        })
    }

    async fn set_state(&self, reported: InstanceState) -> Result<(), Error> {
        let converged = {
            let mut state = lock(&self.shared.state);
            state.reports.push((self.name.clone(), reported));
            state
                .last_reported
                .insert(self.name.clone(), Some(reported));
            !state.manual_convergence
                && state
                    .last_reported
                    .values()
                    .all(|last| *last == Some(reported))
        };
        if converged {
            let _ = self
                .shared
                .events
                .send(CoordinatorEvent::StatesConverge(reported));
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReconnectPolicy;
    use serde_json::json;

    fn options(host: &str, port: u16) -> ConnectOptions {
        ConnectOptions {
            hostname: host.into(),
            port,
            secure: false,
            auth_key: None,
            pool_index: 0,
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let cluster = MemoryCluster::new();
        let publisher = cluster.connect(options("b1", 80));
        let subscriber = cluster.connect(options("b1", 80));

        let mut stream = subscriber.subscribe("a1");
        publisher
            .publish("a1", Packet::single(None, json!("x")))
            .await
            .unwrap();

        let packet = stream.next().await.unwrap();
        assert_eq!(packet.messages, vec![json!("x")]);
        assert_eq!(cluster.publish_count("ws://b1"), 1);
    }

    #[tokio::test]
    async fn test_down_site_rejects_publish() {
        let cluster = MemoryCluster::new();
        let conn = cluster.connect(options("b1", 80));
        cluster.set_down("ws://b1:80", true);

        let result = conn.publish("a1", Packet::single(None, json!(1))).await;
        assert!(matches!(result, Err(TransportError::Failed(_))));
        assert_eq!(cluster.publish_count("ws://b1:80"), 0);
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let cluster = MemoryCluster::new();
        let conn = cluster.connect(options("b1", 80));
        let _stream = conn.subscribe("a1");
        assert_eq!(cluster.subscriber_count("ws://b1", "a1"), 1);

        conn.close();
        assert_eq!(cluster.subscriber_count("ws://b1", "a1"), 0);
        assert_eq!(cluster.live_connections(), 0);
        assert!(matches!(
            conn.publish("a1", Packet::single(None, json!(1))).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_hub_converges_when_all_members_agree() {
        let hub = CoordinatorHub::new();
        let w1 = hub.member("w1");
        let w2 = hub.member("w2");
        let mut events = w1.events();

        w1.set_state(InstanceState::UpdatedSubs).await.unwrap();
        assert!(events.try_recv().is_err());

        w2.set_state(InstanceState::UpdatedSubs).await.unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            CoordinatorEvent::StatesConverge(InstanceState::UpdatedSubs)
        );
        assert_eq!(hub.reports("w2"), vec![InstanceState::UpdatedSubs]);
    }

    #[tokio::test]
    async fn test_hub_join_failures() {
        let hub = CoordinatorHub::new();
        let w1 = hub.member("w1");
        let registration = WorkerRegistration {
            instance_id: "w1".into(),
            instance_ip: None,
            instance_ip_family: "IPv4".into(),
        };
        hub.fail_next_joins(1);

        assert!(w1.join(&registration).await.is_err());
        let reply = w1.join(&registration).await.unwrap();
        assert_eq!(reply.workers, vec!["w1".to_string()]);
        assert_eq!(hub.join_count(), 2);
    }
}
