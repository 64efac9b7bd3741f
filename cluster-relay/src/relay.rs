//! The relay attaches a local broker to the cluster.
//!
//! One task owns the [`ClusterBrokerClient`] and serializes everything that
//! touches it: local subscribe/unsubscribe/publish events, coordinator
//! notifications, inbound packets and the batching timer. Coordinator state
//! reports run in a second task so a slow `set_state` never stalls routing.

use crate::batch::{OutboundBuffer, PublishMode};
use crate::client::{ClientState, ClusterBrokerClient};
use crate::config::RelayConfig;
use crate::coordinator::{
    Coordinator, CoordinatorEvent, InstanceState, JoinReply, MembershipSnapshot, SnapshotClock,
    WorkerSnapshot,
};
use crate::event::ClientEvent;
use crate::mapper::Mapper;
use crate::packet::InboundPacket;
use crate::transport::Connector;
use crate::{Error, Packet, Site};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The host broker the relay serves.
pub trait LocalBroker: Send + Sync {
    /// Channels local clients are subscribed to right now.
    fn subscriptions(&self) -> Vec<String>;

    /// Hand one message from the cluster to local subscribers.
    fn deliver(&self, channel: &str, message: Value);
}

/// Activity on the local broker the relay mirrors into the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    Subscribe(String),
    Unsubscribe(String),
    Publish { channel: String, data: Value },
}

/// Snapshot of relay state readable from any thread.
#[derive(Debug, Clone)]
pub struct RelayView {
    pub state: ClientState,
    pub sites: Vec<String>,
    pub workers: Vec<String>,
    pub sub_contexts: usize,
    pub pub_context: Option<Arc<Mapper>>,
}

impl RelayView {
    fn idle() -> Self {
        Self {
            state: ClientState::Idle,
            sites: Vec::new(),
            workers: Vec::new(),
            sub_contexts: 0,
            pub_context: None,
        }
    }
}

/// Handle to a running relay.
///
/// # Example
///
/// ```rust,ignore
/// let (local_tx, local_rx) = tokio::sync::mpsc::unbounded_channel();
/// let relay = ClusterRelay::attach(broker, local_rx, coordinator, connector, RelayConfig::from_env()?)?;
///
/// local_tx.send(LocalEvent::Subscribe("prices".into()))?;
/// local_tx.send(LocalEvent::Publish { channel: "prices".into(), data: json!(42) })?;
///
/// relay.shutdown().await;
/// ```
pub struct ClusterRelay {
    instance_id: String,
    view: Arc<ArcSwap<RelayView>>,
    events: broadcast::Sender<ClientEvent>,
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ClusterRelay {
    /// Start relaying. Must be called from within a Tokio runtime.
    pub fn attach(
        broker: Arc<dyn LocalBroker>,
        local_events: mpsc::UnboundedReceiver<LocalEvent>,
        coordinator: Arc<dyn Coordinator>,
        connector: Arc<dyn Connector>,
        config: RelayConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (events, _) = broadcast::channel(config.event_capacity);
        let view = Arc::new(ArcSwap::from_pointee(RelayView::idle()));
        let cancel_token = CancellationToken::new();

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (join_tx, join_rx) = mpsc::unbounded_channel();

        let client =
            ClusterBrokerClient::new(connector, config.client_options(), client_tx, inbound_tx);

        let publish_mode = config.publish_mode();
        let outbound = match publish_mode {
            PublishMode::Batched(window) => Some(OutboundBuffer::new(window)),
            PublishMode::Immediate => None,
        };

        let channels = WorkerChannels {
            coordinator: coordinator.events(),
            local: local_events,
            client: client_rx,
            inbound: inbound_rx,
            joins: join_rx,
        };

        let reporter = tokio::spawn(report_states(
            coordinator.clone(),
            report_rx,
            events.clone(),
            config.coordinator.retry_delay,
            cancel_token.clone(),
        ));

        let worker = RelayWorker {
            instance_id: instance_id.clone(),
            config,
            broker,
            coordinator,
            client,
            outbound,
            site_clock: SnapshotClock::new(),
            worker_clock: SnapshotClock::new(),
            workers: Vec::new(),
            joining: false,
            join_retry_at: None,
            joins: join_tx,
            reports: report_tx,
            view: view.clone(),
            events: events.clone(),
            cancel_token: cancel_token.clone(),
        };
        let runner = tokio::spawn(worker.run(channels));

        tracing::info!(instance_id = %instance_id, mode = ?publish_mode, "Cluster relay attached");

        Ok(Self {
            instance_id,
            view,
            events,
            cancel_token,
            handles: vec![runner, reporter],
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Observability events: errors, acks, membership and state changes.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn view(&self) -> Arc<RelayView> {
        self.view.load_full()
    }

    pub fn state(&self) -> ClientState {
        self.view.load().state
    }

    /// Broker sites of the publish mapping.
    pub fn sites(&self) -> Vec<String> {
        self.view.load().sites.clone()
    }

    pub fn workers(&self) -> Vec<String> {
        self.view.load().workers.clone()
    }

    pub fn sub_context_count(&self) -> usize {
        self.view.load().sub_contexts
    }

    /// Site local publishes on `channel` currently go to.
    pub fn site_for(&self, channel: &str) -> Option<String> {
        let view = self.view.load();
        view.pub_context
            .as_ref()?
            .find_site(channel)
            .map(|site| site.uri().to_string())
    }

    /// Flush buffered publishes, close every broker pool and stop.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!(instance_id = %self.instance_id, "Cluster relay shut down");
    }
}

impl Drop for ClusterRelay {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct WorkerChannels {
    coordinator: broadcast::Receiver<CoordinatorEvent>,
    local: mpsc::UnboundedReceiver<LocalEvent>,
    client: mpsc::UnboundedReceiver<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<InboundPacket>,
    joins: mpsc::UnboundedReceiver<Result<JoinReply, Error>>,
}

struct RelayWorker {
    instance_id: String,
    config: RelayConfig,
    broker: Arc<dyn LocalBroker>,
    coordinator: Arc<dyn Coordinator>,
    client: ClusterBrokerClient,
    outbound: Option<OutboundBuffer>,
    site_clock: SnapshotClock,
    worker_clock: SnapshotClock,
    workers: Vec<String>,
    joining: bool,
    join_retry_at: Option<Instant>,
    joins: mpsc::UnboundedSender<Result<JoinReply, Error>>,
    reports: mpsc::UnboundedSender<InstanceState>,
    view: Arc<ArcSwap<RelayView>>,
    events: broadcast::Sender<ClientEvent>,
    cancel_token: CancellationToken,
}

impl RelayWorker {
    async fn run(mut self, mut channels: WorkerChannels) {
        let cancel = self.cancel_token.clone();
        let mut coordinator_open = true;

        self.start_join();

        loop {
            let flush_at = self.outbound.as_ref().and_then(|buffer| buffer.deadline());
            let retry_at = self.join_retry_at;

            tokio::select! {
                _ = cancel.cancelled() => break,

                event = channels.coordinator.recv(), if coordinator_open => match event {
                    Ok(event) => self.on_coordinator_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Coordinator events lagged, rejoining");
                        self.start_join();
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Coordinator event stream closed");
                        coordinator_open = false;
                    }
                },

                Some(event) = channels.local.recv() => self.on_local_event(event),

                Some(packet) = channels.inbound.recv() => self.on_inbound(packet),

                Some(event) = channels.client.recv() => self.emit(event),

                Some(result) = channels.joins.recv() => self.on_join_result(result),

                _ = sleep_until_opt(flush_at) => self.flush(),

                _ = sleep_until_opt(retry_at) => {
                    self.join_retry_at = None;
                    self.start_join();
                }
            }

            self.refresh_view();
        }

        self.flush();
        self.client.destroy();
        while let Ok(event) = channels.client.try_recv() {
            self.emit(event);
        }
        self.refresh_view();
        tracing::debug!(instance_id = %self.instance_id, "Relay loop stopped");
    }

    fn start_join(&mut self) {
        if self.joining {
            return;
        }
        self.joining = true;
        self.join_retry_at = None;

        let coordinator = self.coordinator.clone();
        let registration = self.config.registration(&self.instance_id);
        let timeout = self.config.coordinator.connect_timeout + self.config.coordinator.ack_timeout;
        let joins = self.joins.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, coordinator.join(&registration)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::coordinator("join timed out")),
            };
            let _ = joins.send(result);
        });
    }

    fn on_join_result(&mut self, result: Result<JoinReply, Error>) {
        self.joining = false;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                let delay = self.config.coordinator.retry_delay;
                tracing::warn!(error = %e, retry_in = ?delay, "Failed to join cluster");
                self.emit(ClientEvent::error(e));
                self.join_retry_at = Some(Instant::now() + delay);
                return;
            }
        };

        tracing::info!(
            brokers = reply.brokers.len(),
            workers = reply.workers.len(),
            time = ?reply.time,
            "Joined cluster"
        );

        self.site_clock.reset();
        self.worker_clock.reset();
        if let Some(time) = reply.time {
            self.site_clock.advance(time);
            self.worker_clock.advance(time);
        }

        let sites = self.parse_sites(reply.brokers);
        let local = self.broker.subscriptions();
        self.client.apply_join_snapshot(sites, &local);
        self.set_workers(reply.workers);
    }

    fn on_coordinator_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected => {
                self.client.rebind_listeners();
                self.start_join();
            }
            CoordinatorEvent::SiteJoined(snapshot) | CoordinatorEvent::SiteLeft(snapshot) => {
                self.on_membership(snapshot)
            }
            CoordinatorEvent::WorkerJoined(snapshot) | CoordinatorEvent::WorkerLeft(snapshot) => {
                self.on_workers(snapshot)
            }
            CoordinatorEvent::StatesConverge(state) => {
                tracing::debug!(%state, "States converged");
                let local = self.broker.subscriptions();
                let reports = self.client.on_states_converge(state, &local);
                self.report(reports);
            }
            CoordinatorEvent::Error(message) => {
                tracing::warn!(error = %message, "Coordinator error");
                self.emit(ClientEvent::error(Error::coordinator(message)));
            }
        }
    }

    fn on_membership(&mut self, snapshot: MembershipSnapshot) {
        if !self.site_clock.advance(snapshot.time) {
            tracing::debug!(
                time = snapshot.time,
                latest = self.site_clock.latest(),
                "Discarding stale membership snapshot"
            );
            return;
        }
        self.apply_sites(snapshot.sites);
    }

    fn on_workers(&mut self, snapshot: WorkerSnapshot) {
        if !self.worker_clock.advance(snapshot.time) {
            tracing::debug!(time = snapshot.time, "Discarding stale worker snapshot");
            return;
        }
        self.set_workers(snapshot.workers);
    }

    fn apply_sites(&mut self, uris: Vec<String>) {
        let sites = self.parse_sites(uris);
        let local = self.broker.subscriptions();
        let reports = self.client.set_sites(sites, &local);
        self.report(reports);
    }

    /// Invalid URIs are skipped with an error event.
    fn parse_sites(&self, uris: Vec<String>) -> Vec<Site> {
        let mut sites = Vec::with_capacity(uris.len());
        for uri in uris {
            match Site::parse(&uri) {
                Ok(site) => sites.push(site),
                Err(e) => {
                    tracing::warn!(uri = %uri, error = %e, "Skipping invalid broker site");
                    self.emit(ClientEvent::error(e));
                }
            }
        }
        sites
    }

    fn set_workers(&mut self, workers: Vec<String>) {
        self.workers = workers.clone();
        self.emit(ClientEvent::UpdateWorkers { workers });
    }

    fn report(&self, states: Vec<InstanceState>) {
        for state in states {
            let _ = self.reports.send(state);
        }
    }

    fn on_local_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::Subscribe(channel) => self.client.subscribe(&channel),
            LocalEvent::Unsubscribe(channel) => self.client.unsubscribe(&channel),
            LocalEvent::Publish { channel, data } => match self.outbound.as_mut() {
                Some(buffer) => buffer.push(&channel, data),
                None => self.client.publish(
                    &channel,
                    Packet::single(Some(self.instance_id.clone()), data),
                ),
            },
        }
    }

    fn flush(&mut self) {
        let Some(buffer) = self.outbound.as_mut() else {
            return;
        };
        for (channel, packet) in buffer.drain(&self.instance_id) {
            self.client.publish(&channel, packet);
        }
    }

    fn on_inbound(&self, inbound: InboundPacket) {
        if inbound.packet.is_from(&self.instance_id) {
            tracing::trace!(channel = %inbound.channel, "Suppressing own packet");
            return;
        }
        if inbound.packet.messages.is_empty() {
            return;
        }
        for message in inbound.packet.messages {
            self.broker.deliver(&inbound.channel, message);
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn refresh_view(&self) {
        self.view.store(Arc::new(RelayView {
            state: self.client.state(),
            sites: self.client.sites(),
            workers: self.workers.clone(),
            sub_contexts: self.client.sub_context_count(),
            pub_context: self.client.pub_context(),
        }));
    }
}

/// Send state reports to the coordinator one at a time, retrying each until
/// it is accepted.
async fn report_states(
    coordinator: Arc<dyn Coordinator>,
    mut reports: mpsc::UnboundedReceiver<InstanceState>,
    events: broadcast::Sender<ClientEvent>,
    retry_delay: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => return,
            state = reports.recv() => match state {
                Some(state) => state,
                None => return,
            },
        };

        loop {
            match coordinator.set_state(state).await {
                Ok(()) => {
                    tracing::debug!(%state, "Reported state");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%state, error = %e, "Failed to report state, retrying");
                    let _ = events.send(ClientEvent::error(e));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
