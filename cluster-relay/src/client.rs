//! Cluster-aware broker client.
//!
//! Routes each channel to one broker site through a mapping context and
//! owns one [`ConnectionPool`] per site. Membership changes are applied
//! either at once or through a three phase loss-averse rebalance:
//!
//! 1. subscribe on both the old and the new mapping (`updatedSubs`)
//! 2. publish on the new mapping (`updatedPubs`)
//! 3. drop the old mapping and its orphaned subscriptions (`active`)
//!
//! Each phase advances only once the coordinator reports that every worker
//! has reached it, so no message published during the handover is lost.

use crate::coordinator::InstanceState;
use crate::event::{ClientEvent, EventContext};
use crate::mapper::{Mapper, MappingStrategy};
use crate::packet::InboundPacket;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::transport::Connector;
use crate::{Error, Packet, RoutingOp, Site};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    UpdatedSubs,
    UpdatedPubs,
}

impl From<TransitionPhase> for InstanceState {
    fn from(phase: TransitionPhase) -> Self {
        match phase {
            TransitionPhase::UpdatedSubs => InstanceState::UpdatedSubs,
            TransitionPhase::UpdatedPubs => InstanceState::UpdatedPubs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No membership applied yet.
    Idle,
    Active,
    Transitioning(TransitionPhase),
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Transitioning(TransitionPhase::UpdatedSubs) => "updatedSubs",
            Self::Transitioning(TransitionPhase::UpdatedPubs) => "updatedPubs",
        }
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Transitioning(_))
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RebalanceMode {
    /// Swap mappings as soon as membership changes.
    Immediate,
    /// Coordinate the three phase handover with every worker.
    #[default]
    LossAverse,
}

impl RebalanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::LossAverse => "lossAverse",
        }
    }
}

impl FromStr for RebalanceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "lossAverse" | "loss-averse" | "loss_averse" => Ok(Self::LossAverse),
            other => Err(Error::config(format!(
                "Unknown rebalance mode '{other}' - It must be either 'immediate' or 'lossAverse'"
            ))),
        }
    }
}

impl fmt::Display for RebalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub pool: PoolOptions,
    pub mapping: MappingStrategy,
    pub rebalance: RebalanceMode,
}

pub struct ClusterBrokerClient {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    pools: HashMap<String, ConnectionPool>,
    pub_context: Option<Arc<Mapper>>,
    /// Oldest first. Holds two contexts only while transitioning.
    sub_contexts: Vec<Arc<Mapper>>,
    state: ClientState,
    queued_sites: Option<Vec<Site>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedSender<InboundPacket>,
}

impl ClusterBrokerClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ClientOptions,
        events: mpsc::UnboundedSender<ClientEvent>,
        inbound: mpsc::UnboundedSender<InboundPacket>,
    ) -> Self {
        Self {
            options,
            connector,
            pools: HashMap::new(),
            pub_context: None,
            sub_contexts: Vec::new(),
            state: ClientState::Idle,
            queued_sites: None,
            events,
            inbound,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn sub_context_count(&self) -> usize {
        self.sub_contexts.len()
    }

    pub fn pub_context(&self) -> Option<Arc<Mapper>> {
        self.pub_context.clone()
    }

    pub fn pool(&self, uri: &str) -> Option<&ConnectionPool> {
        self.pools.get(uri)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Site that publishes on `channel` go to.
    pub fn site_for(&self, channel: &str) -> Option<&Site> {
        self.pub_context.as_ref()?.find_site(channel)
    }

    /// Sites of the publish context, in mapping order.
    pub fn sites(&self) -> Vec<String> {
        self.pub_context
            .as_ref()
            .map(|ctx| ctx.sites().iter().map(|s| s.uri().to_string()).collect())
            .unwrap_or_default()
    }

    /// Every channel held on any pool (pending included) plus `local`.
    pub fn full_subscriptions(&self, local: &[String]) -> BTreeSet<String> {
        self.pools
            .values()
            .flat_map(|pool| pool.subscriptions(true))
            .chain(local.iter().cloned())
            .collect()
    }

    /// Apply new broker membership.
    ///
    /// Returns the states to report to the coordinator, in order.
    pub fn set_sites(&mut self, sites: Vec<Site>, local: &[String]) -> Vec<InstanceState> {
        if self.state.is_transitioning() {
            tracing::debug!(sites = sites.len(), "Rebalance in progress, queueing membership update");
            self.queued_sites = Some(sites);
            return Vec::new();
        }

        if self
            .pub_context
            .as_ref()
            .is_some_and(|ctx| ctx.has_same_sites(&sites))
        {
            tracing::debug!("Membership unchanged");
            return Vec::new();
        }

        let had_sites = self
            .pub_context
            .as_ref()
            .is_some_and(|ctx| !ctx.sites().is_empty());

        if self.options.rebalance == RebalanceMode::LossAverse && had_sites {
            self.begin_transition(sites, local)
        } else {
            self.apply_immediately(sites, local);
            Vec::new()
        }
    }

    /// Advance the rebalance once every worker reached `converged`.
    pub fn on_states_converge(
        &mut self,
        converged: InstanceState,
        local: &[String],
    ) -> Vec<InstanceState> {
        match (self.state, converged) {
            (
                ClientState::Transitioning(TransitionPhase::UpdatedSubs),
                InstanceState::UpdatedSubs,
            ) => {
                self.pub_context = self.sub_contexts.last().cloned();
                self.set_state(ClientState::Transitioning(TransitionPhase::UpdatedPubs));
                vec![InstanceState::UpdatedPubs]
            }
            (
                ClientState::Transitioning(TransitionPhase::UpdatedPubs),
                InstanceState::UpdatedPubs,
            ) => {
                self.complete_transition(local);
                let mut reports = vec![InstanceState::Active];
                if let Some(queued) = self.queued_sites.take() {
                    reports.extend(self.set_sites(queued, local));
                }
                reports
            }
            (state, converged) => {
                tracing::debug!(%state, %converged, "Ignoring convergence outside its phase");
                Vec::new()
            }
        }
    }

    /// Finish any rebalance in progress straight away.
    ///
    /// A fresh join snapshot supersedes the handover, so queued updates are
    /// dropped too.
    pub fn abandon_transition(&mut self, local: &[String]) {
        self.queued_sites = None;
        if self.state.is_transitioning() {
            tracing::info!(state = %self.state, "Abandoning rebalance");
            self.complete_transition(local);
        }
    }

    /// Install the broker list from a join reply.
    ///
    /// The reply is authoritative and other workers may be joining at the
    /// same time, so it never starts a loss-averse transition: any handover
    /// in progress is completed, queued updates are dropped and the sites are
    /// applied immediately in either rebalance mode.
    pub fn apply_join_snapshot(&mut self, sites: Vec<Site>, local: &[String]) {
        self.abandon_transition(local);
        if self
            .pub_context
            .as_ref()
            .is_some_and(|ctx| ctx.has_same_sites(&sites))
        {
            tracing::debug!("Join snapshot matches current membership");
            return;
        }
        self.apply_immediately(sites, local);
    }

    /// Re-attach event listeners on every pool.
    pub fn rebind_listeners(&mut self) {
        for pool in self.pools.values_mut() {
            pool.bind_listeners();
        }
    }

    pub fn subscribe(&mut self, channel: &str) {
        let targets = self.sub_targets(channel);
        let mut routed = false;
        for uri in &targets {
            if let Some(pool) = self.pools.get_mut(uri) {
                pool.subscribe(channel);
                routed = true;
            }
        }
        if !routed {
            self.emit(ClientEvent::Error(
                EventContext::from_error(Error::routing(RoutingOp::Subscribe, channel))
                    .channel(channel),
            ));
        }
    }

    pub fn unsubscribe(&mut self, channel: &str) {
        let targets = self.sub_targets(channel);
        let mut handled = false;
        for (uri, pool) in self.pools.iter_mut() {
            if targets.contains(uri) || pool.is_subscribed(channel, true) {
                pool.unsubscribe(channel);
                handled = true;
            }
        }
        if !handled {
            self.emit(ClientEvent::Error(
                EventContext::from_error(Error::routing(RoutingOp::Unsubscribe, channel))
                    .channel(channel),
            ));
        }
    }

    pub fn publish(&self, channel: &str, packet: Packet) {
        let pool = self
            .site_for(channel)
            .and_then(|site| self.pools.get(site.uri()));
        match pool {
            Some(pool) => pool.publish(channel, packet),
            None => self.emit(ClientEvent::Error(
                EventContext::from_error(Error::routing(RoutingOp::Publish, channel))
                    .channel(channel)
                    .data(packet),
            )),
        }
    }

    /// Close every pool. Idempotent.
    pub fn destroy(&mut self) {
        for (_, mut pool) in self.pools.drain() {
            pool.destroy();
        }
        self.pub_context = None;
        self.sub_contexts.clear();
        self.queued_sites = None;
        self.set_state(ClientState::Idle);
    }

    fn apply_immediately(&mut self, sites: Vec<Site>, local: &[String]) {
        let snapshot = self.full_subscriptions(local);
        let context = Arc::new(self.build_context(sites));
        self.install_pools(&context);
        self.pub_context = Some(context.clone());
        self.sub_contexts = vec![context];
        self.retire_pools();
        self.resync(&snapshot);
        self.set_state(ClientState::Active);
        self.announce_brokers();
    }

    fn begin_transition(&mut self, sites: Vec<Site>, local: &[String]) -> Vec<InstanceState> {
        let snapshot = self.full_subscriptions(local);
        let context = Arc::new(self.build_context(sites));
        self.install_pools(&context);
        self.sub_contexts.push(context);
        self.resync(&snapshot);
        self.set_state(ClientState::Transitioning(TransitionPhase::UpdatedSubs));
        self.announce_brokers_for(self.sub_contexts.last().cloned());
        vec![InstanceState::UpdatedSubs]
    }

    fn complete_transition(&mut self, local: &[String]) {
        let snapshot = self.full_subscriptions(local);
        if let Some(newest) = self.sub_contexts.pop() {
            self.pub_context = Some(newest.clone());
            self.sub_contexts = vec![newest];
        }
        self.retire_pools();
        self.resync(&snapshot);
        self.set_state(ClientState::Active);
        self.announce_brokers();
    }

    fn build_context(&self, sites: Vec<Site>) -> Mapper {
        let mut mapper = self.options.mapping.build();
        mapper.set_sites(sites);
        mapper
    }

    fn install_pools(&mut self, context: &Mapper) {
        for site in context.sites() {
            if self.pools.contains_key(site.uri()) {
                continue;
            }
            let pool = ConnectionPool::new(
                site.clone(),
                &self.options.pool,
                self.connector.as_ref(),
                self.events.clone(),
                self.inbound.clone(),
            );
            self.pools.insert(site.uri().to_string(), pool);
        }
    }

    /// Destroy pools no live context routes to.
    fn retire_pools(&mut self) {
        let live: HashSet<String> = self
            .pub_context
            .iter()
            .chain(self.sub_contexts.iter())
            .flat_map(|ctx| ctx.sites().iter().map(|s| s.uri().to_string()))
            .collect();
        self.pools.retain(|uri, pool| {
            if live.contains(uri) {
                return true;
            }
            tracing::info!(site = %uri, "Retiring broker pool");
            pool.destroy();
            false
        });
    }

    fn sub_targets(&self, channel: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for ctx in &self.sub_contexts {
            if let Some(site) = ctx.find_site(channel) {
                if !targets.iter().any(|t| t == site.uri()) {
                    targets.push(site.uri().to_string());
                }
            }
        }
        targets
    }

    /// Make every pool hold exactly the channels the sub contexts route to it.
    fn resync(&mut self, snapshot: &BTreeSet<String>) {
        let mut wanted: HashMap<String, BTreeSet<String>> = HashMap::new();
        for channel in snapshot {
            let targets = self.sub_targets(channel);
            if targets.is_empty() {
                tracing::debug!(channel = %channel, "Channel has no target broker");
            }
            for uri in targets {
                wanted.entry(uri).or_default().insert(channel.clone());
            }
        }

        for (uri, pool) in self.pools.iter_mut() {
            let channels = wanted.get(uri);
            for held in pool.subscriptions(true) {
                if !channels.is_some_and(|c| c.contains(&held)) {
                    pool.unsubscribe(&held);
                }
            }
            if let Some(channels) = channels {
                for channel in channels {
                    pool.subscribe(channel);
                }
            }
        }
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "Client state changed");
        self.state = state;
        self.emit(ClientEvent::StateChanged(state));
    }

    fn announce_brokers(&self) {
        self.announce_brokers_for(self.pub_context.clone());
    }

    fn announce_brokers_for(&self, context: Option<Arc<Mapper>>) {
        let sites = context
            .map(|ctx| ctx.sites().iter().map(|s| s.uri().to_string()).collect())
            .unwrap_or_default();
        self.emit(ClientEvent::UpdateBrokers { sites });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for ClusterBrokerClient {
    fn drop(&mut self) {
        if !self.pools.is_empty() {
            tracing::debug!(pools = self.pools.len(), "Dropping broker client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use serde_json::json;

    struct Harness {
        cluster: MemoryCluster,
        client: ClusterBrokerClient,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        _inbound: mpsc::UnboundedReceiver<InboundPacket>,
    }

    fn harness(rebalance: RebalanceMode) -> Harness {
        let cluster = MemoryCluster::new();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let options = ClientOptions {
            rebalance,
            ..ClientOptions::default()
        };
        let client =
            ClusterBrokerClient::new(Arc::new(cluster.clone()), options, event_tx, inbound_tx);
        Harness {
            cluster,
            client,
            events,
            _inbound: inbound,
        }
    }

    fn sites(uris: &[&str]) -> Vec<Site> {
        crate::mapper::sites(uris)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn channels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("channel-{}", i)).collect()
    }

    const B1: &str = "wss://broker-1:8888";
    const B2: &str = "wss://broker-2:8888";

    #[tokio::test]
    async fn test_first_membership_applies_immediately() {
        let mut h = harness(RebalanceMode::LossAverse);
        assert_eq!(h.client.state(), ClientState::Idle);

        let reports = h.client.set_sites(sites(&[B1]), &[]);
        assert!(reports.is_empty());
        assert_eq!(h.client.state(), ClientState::Active);
        assert_eq!(h.client.sub_context_count(), 1);
        assert_eq!(h.cluster.live_connections_to(B1), 1);

        let events = drain(&mut h.events);
        assert!(events.contains(&ClientEvent::StateChanged(ClientState::Active)));
        assert!(events.contains(&ClientEvent::UpdateBrokers {
            sites: vec![B1.to_string()]
        }));
    }

    #[tokio::test]
    async fn test_unroutable_operations_emit_errors() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.subscribe("a1");
        h.client.publish("a1", Packet::single(None, json!(1)));

        let errors: Vec<Error> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Error(ctx) => ctx.error,
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![
                Error::routing(RoutingOp::Subscribe, "a1"),
                Error::routing(RoutingOp::Publish, "a1"),
            ]
        );
        assert_eq!(
            errors[0].to_string(),
            "Could not find a matching subscribe target broker for the a1 channel - The broker may be down"
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_without_target_emits_error() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.unsubscribe("a1");

        let errors: Vec<Error> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Error(ctx) => ctx.error,
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![Error::routing(RoutingOp::Unsubscribe, "a1")]);
        assert_eq!(
            errors[0].to_string(),
            "Could not find a matching unsubscribe target broker for the a1 channel - The broker may be down"
        );

        // Once a site exists the same call is routed and stays silent.
        h.client.set_sites(sites(&[B1]), &[]);
        drain(&mut h.events);
        h.client.unsubscribe("a1");
        assert!(!drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, ClientEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_subscribe_and_publish_follow_mapping() {
        let mut h = harness(RebalanceMode::Immediate);
        h.client.set_sites(sites(&[B1, B2]), &[]);

        for channel in channels(20) {
            h.client.subscribe(&channel);
            h.client.publish(&channel, Packet::single(None, json!("m")));
            let home = h.client.site_for(&channel).unwrap().uri().to_string();
            assert_eq!(h.cluster.subscriber_count(&home, &channel), 1);
            assert_eq!(h.cluster.publish_count_for(&home, &channel), 1);
        }
    }

    #[tokio::test]
    async fn test_immediate_rebalance_moves_subscriptions() {
        let mut h = harness(RebalanceMode::Immediate);
        h.client.set_sites(sites(&[B1]), &[]);
        let all = channels(50);
        for channel in &all {
            h.client.subscribe(channel);
        }

        let reports = h.client.set_sites(sites(&[B1, B2]), &[]);
        assert!(reports.is_empty());
        assert_eq!(h.client.state(), ClientState::Active);
        assert_eq!(h.client.sub_context_count(), 1);

        for channel in &all {
            let home = h.client.site_for(channel).unwrap().uri().to_string();
            let other = if home == B1 { B2 } else { B1 };
            assert_eq!(h.cluster.subscriber_count(&home, channel), 1);
            assert_eq!(h.cluster.subscriber_count(other, channel), 0);
        }
    }

    #[tokio::test]
    async fn test_loss_averse_rebalance_walks_three_phases() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        let all = channels(50);
        for channel in &all {
            h.client.subscribe(channel);
        }
        drain(&mut h.events);

        let reports = h.client.set_sites(sites(&[B1, B2]), &[]);
        assert_eq!(reports, vec![InstanceState::UpdatedSubs]);
        assert_eq!(
            h.client.state(),
            ClientState::Transitioning(TransitionPhase::UpdatedSubs)
        );
        assert_eq!(h.client.sub_context_count(), 2);
        // Publishes still use the old mapping.
        assert_eq!(h.client.site_for("channel-1").unwrap().uri(), B1);
        // Every channel is held on B1 and also on its new home.
        for channel in &all {
            assert_eq!(h.cluster.subscriber_count(B1, channel), 1);
        }
        let moved = all
            .iter()
            .filter(|c| h.cluster.subscriber_count(B2, c) == 1)
            .count();
        assert!(moved > 0);

        let reports = h.client.on_states_converge(InstanceState::UpdatedSubs, &[]);
        assert_eq!(reports, vec![InstanceState::UpdatedPubs]);
        assert_eq!(h.client.sub_context_count(), 2);
        let new_homes: Vec<String> = all
            .iter()
            .map(|c| h.client.site_for(c).unwrap().uri().to_string())
            .collect();
        assert_eq!(new_homes.iter().filter(|u| *u == B2).count(), moved);

        let reports = h.client.on_states_converge(InstanceState::UpdatedPubs, &[]);
        assert_eq!(reports, vec![InstanceState::Active]);
        assert_eq!(h.client.state(), ClientState::Active);
        assert_eq!(h.client.sub_context_count(), 1);
        for (channel, home) in all.iter().zip(&new_homes) {
            let other = if home == B1 { B2 } else { B1 };
            assert_eq!(h.cluster.subscriber_count(home, channel), 1);
            assert_eq!(h.cluster.subscriber_count(other, channel), 0);
        }

        let states: Vec<ClientState> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ClientState::Transitioning(TransitionPhase::UpdatedSubs),
                ClientState::Transitioning(TransitionPhase::UpdatedPubs),
                ClientState::Active,
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_phase_convergence_is_ignored() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        assert!(h.client.on_states_converge(InstanceState::UpdatedSubs, &[]).is_empty());

        h.client.set_sites(sites(&[B1, B2]), &[]);
        assert!(h.client.on_states_converge(InstanceState::UpdatedPubs, &[]).is_empty());
        assert_eq!(
            h.client.state(),
            ClientState::Transitioning(TransitionPhase::UpdatedSubs)
        );
    }

    #[tokio::test]
    async fn test_update_during_transition_is_queued() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        h.client.set_sites(sites(&[B1, B2]), &[]);

        assert!(h.client.set_sites(sites(&[B2]), &[]).is_empty());
        assert_eq!(h.client.sub_context_count(), 2);

        h.client.on_states_converge(InstanceState::UpdatedSubs, &[]);
        let reports = h.client.on_states_converge(InstanceState::UpdatedPubs, &[]);
        assert_eq!(
            reports,
            vec![InstanceState::Active, InstanceState::UpdatedSubs]
        );
        assert_eq!(
            h.client.state(),
            ClientState::Transitioning(TransitionPhase::UpdatedSubs)
        );
    }

    #[tokio::test]
    async fn test_removed_site_pool_is_retired() {
        let mut h = harness(RebalanceMode::Immediate);
        h.client.set_sites(sites(&[B1, B2]), &[]);
        assert_eq!(h.cluster.live_connections_to(B2), 1);

        h.client.set_sites(sites(&[B1]), &[]);
        assert_eq!(h.client.pool_count(), 1);
        assert_eq!(h.cluster.live_connections_to(B2), 0);
    }

    #[tokio::test]
    async fn test_resync_includes_local_subscriptions() {
        let mut h = harness(RebalanceMode::Immediate);
        let local = vec!["from-local".to_string()];
        h.client.set_sites(sites(&[B1]), &local);
        assert_eq!(h.cluster.subscriber_count(B1, "from-local"), 1);
    }

    #[tokio::test]
    async fn test_abandon_transition_completes_it() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        h.client.set_sites(sites(&[B1, B2]), &[]);

        h.client.abandon_transition(&[]);
        assert_eq!(h.client.state(), ClientState::Active);
        assert_eq!(h.client.sub_context_count(), 1);
        assert_eq!(h.client.sites(), vec![B1.to_string(), B2.to_string()]);
    }

    #[tokio::test]
    async fn test_join_snapshot_applies_without_transition() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        let all = channels(20);
        for channel in &all {
            h.client.subscribe(channel);
        }

        h.client.apply_join_snapshot(sites(&[B1, B2]), &[]);
        assert_eq!(h.client.state(), ClientState::Active);
        assert_eq!(h.client.sub_context_count(), 1);
        assert_eq!(h.client.sites(), vec![B1.to_string(), B2.to_string()]);
        for channel in &all {
            let home = h.client.site_for(channel).unwrap().uri().to_string();
            assert_eq!(h.cluster.subscriber_count(&home, channel), 1);
        }

        // A later push still rebalances through the normal handover.
        const B3: &str = "wss://broker-3:8888";
        let reports = h.client.set_sites(sites(&[B1, B2, B3]), &[]);
        assert_eq!(reports, vec![InstanceState::UpdatedSubs]);
        assert_eq!(
            h.client.state(),
            ClientState::Transitioning(TransitionPhase::UpdatedSubs)
        );
    }

    #[tokio::test]
    async fn test_join_snapshot_supersedes_transition_and_queue() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        h.client.set_sites(sites(&[B1, B2]), &[]);
        // Queued behind the running handover.
        assert!(h.client.set_sites(sites(&[B2]), &[]).is_empty());

        h.client.apply_join_snapshot(sites(&[B1]), &[]);
        assert_eq!(h.client.state(), ClientState::Active);
        assert_eq!(h.client.sub_context_count(), 1);
        assert_eq!(h.client.sites(), vec![B1.to_string()]);
        assert_eq!(h.client.pool_count(), 1);
        assert_eq!(h.cluster.live_connections_to(B2), 0);

        // The dropped queue does not resurface on a late convergence notice.
        assert!(h.client.on_states_converge(InstanceState::UpdatedPubs, &[]).is_empty());
        assert_eq!(h.client.sites(), vec![B1.to_string()]);
    }

    #[tokio::test]
    async fn test_join_snapshot_with_same_sites_is_a_no_op() {
        let mut h = harness(RebalanceMode::LossAverse);
        h.client.set_sites(sites(&[B1]), &[]);
        drain(&mut h.events);

        h.client.apply_join_snapshot(sites(&[B1]), &[]);
        assert_eq!(h.client.state(), ClientState::Active);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut h = harness(RebalanceMode::Immediate);
        h.client.set_sites(sites(&[B1, B2]), &[]);
        h.client.subscribe("a1");

        h.client.destroy();
        h.client.destroy();

        assert_eq!(h.client.state(), ClientState::Idle);
        assert_eq!(h.client.pool_count(), 0);
        assert_eq!(h.cluster.live_connections(), 0);
        assert!(h.client.full_subscriptions(&[]).is_empty());
    }

    #[test]
    fn test_rebalance_mode_parse() {
        assert_eq!("immediate".parse::<RebalanceMode>(), Ok(RebalanceMode::Immediate));
        assert_eq!("lossAverse".parse::<RebalanceMode>(), Ok(RebalanceMode::LossAverse));
        assert!("eventual".parse::<RebalanceMode>().is_err());
        assert_eq!(RebalanceMode::default(), RebalanceMode::LossAverse);
    }
}
