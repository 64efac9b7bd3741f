//! A fixed set of parallel connections to one broker site.

use crate::event::{ClientEvent, EventContext};
use crate::hasher::hash_to_index;
use crate::packet::InboundPacket;
use crate::transport::{BrokerConnection, ConnectOptions, ConnectionEvent, Connector, ReconnectPolicy};
use crate::{Error, Packet, Site};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How each pool connects.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub size: usize,
    pub auth_key: Option<String>,
    pub reconnect: ReconnectPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 1,
            auth_key: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct PooledConnection {
    pool_index: usize,
    link: Arc<dyn BrokerConnection>,
    watchers: HashMap<String, JoinHandle<()>>,
}

/// Owns `size` connections to one site and homes every channel on exactly
/// one of them (by [`hash_to_index`]), which keeps per-channel ordering.
///
/// Connection events and ack outcomes go to `events`; subscription traffic
/// goes to `inbound`.
pub struct ConnectionPool {
    site: Site,
    connections: Vec<PooledConnection>,
    events: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedSender<InboundPacket>,
    listeners_bound: Arc<AtomicBool>,
    listener_tasks: Vec<JoinHandle<()>>,
    destroyed: bool,
}

impl ConnectionPool {
    pub fn new(
        site: Site,
        options: &PoolOptions,
        connector: &dyn Connector,
        events: mpsc::UnboundedSender<ClientEvent>,
        inbound: mpsc::UnboundedSender<InboundPacket>,
    ) -> Self {
        let size = options.size.max(1);
        let connections = (0..size)
            .map(|pool_index| PooledConnection {
                pool_index,
                link: connector.connect(ConnectOptions {
                    hostname: site.hostname().to_string(),
                    port: site.port(),
                    secure: site.secure(),
                    auth_key: options.auth_key.clone(),
                    pool_index,
                    reconnect: options.reconnect.clone(),
                }),
                watchers: HashMap::new(),
            })
            .collect();

        tracing::debug!(site = %site, size, "Opened connection pool");

        let mut pool = Self {
            site,
            connections,
            events,
            inbound,
            listeners_bound: Arc::new(AtomicBool::new(false)),
            listener_tasks: Vec::new(),
            destroyed: false,
        };
        pool.bind_listeners();
        pool
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn listeners_bound(&self) -> bool {
        self.listeners_bound.load(Ordering::Acquire)
    }

    /// Pool slot serving `channel`.
    pub fn pool_index_for(&self, channel: &str) -> usize {
        hash_to_index(channel, self.connections.len()).unwrap_or(0)
    }

    fn select(&self, channel: &str) -> &PooledConnection {
        &self.connections[self.pool_index_for(channel)]
    }

    fn select_mut(&mut self, channel: &str) -> &mut PooledConnection {
        let index = self.pool_index_for(channel);
        &mut self.connections[index]
    }

    /// Forward every connection's events into the pool's event queue.
    ///
    /// Rebinding replaces the previous wiring, so calling this repeatedly
    /// never duplicates events.
    pub fn bind_listeners(&mut self) {
        self.unbind_listeners();
        if self.destroyed {
            return;
        }

        for conn in &self.connections {
            let mut rx = conn.link.events();
            let events = self.events.clone();
            let site = self.site.uri().to_string();
            let pool_index = conn.pool_index;

            self.listener_tasks.push(tokio::spawn(async move {
                loop {
                    let event = match rx.recv().await {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(site = %site, pool_index, skipped, "Connection events lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    let ctx = EventContext::at(&site, pool_index);
                    let event = match event {
                        ConnectionEvent::Error(error) => ClientEvent::Error(ctx.error(error.into())),
                        ConnectionEvent::Subscribe { channel } => {
                            ClientEvent::Subscribe(ctx.channel(&channel))
                        }
                        ConnectionEvent::SubscribeFail { channel, error } => {
                            ClientEvent::SubscribeFail(ctx.channel(&channel).error(error.into()))
                        }
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }));
        }
        self.listeners_bound.store(true, Ordering::Release);
    }

    pub fn unbind_listeners(&mut self) {
        for task in self.listener_tasks.drain(..) {
            task.abort();
        }
        self.listeners_bound.store(false, Ordering::Release);
    }

    /// Publish on the connection that owns `channel`.
    ///
    /// While listeners are bound the ack outcome is reported as a `Publish`
    /// or `PublishFail` event. Failures are never retried here.
    pub fn publish(&self, channel: &str, packet: Packet) {
        let conn = self.select(channel);
        let pool_index = conn.pool_index;

        if self.destroyed {
            let error = Error::PublishFailure {
                site: self.site.uri().to_string(),
                channel: channel.to_string(),
                source: crate::TransportError::Closed,
            };
            let ctx = EventContext::at(self.site.uri(), pool_index)
                .channel(channel)
                .data(packet)
                .error(error);
            let _ = self.events.send(ClientEvent::PublishFail(ctx));
            return;
        }

        let ack = conn.link.publish(channel, packet.clone());
        if !self.listeners_bound() {
            return;
        }

        let bound = self.listeners_bound.clone();
        let events = self.events.clone();
        let site = self.site.uri().to_string();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let result = ack.await;
            if !bound.load(Ordering::Acquire) {
                return;
            }
            let ctx = EventContext::at(&site, pool_index)
                .channel(&channel)
                .data(packet);
            let event = match result {
                Ok(()) => ClientEvent::Publish(ctx),
                Err(source) => {
                    tracing::debug!(site = %site, channel = %channel, error = %source, "Publish failed");
                    ClientEvent::PublishFail(ctx.error(Error::PublishFailure {
                        site: site.clone(),
                        channel: channel.clone(),
                        source,
                    }))
                }
            };
            let _ = events.send(event);
        });
    }

    /// Subscribe `channel` on its connection and relay its stream inbound.
    ///
    /// No-op while the channel is already held and watched.
    pub fn subscribe(&mut self, channel: &str) {
        if self.destroyed {
            tracing::warn!(site = %self.site, channel, "Subscribe on destroyed pool ignored");
            return;
        }

        let site = self.site.uri().to_string();
        let inbound = self.inbound.clone();
        let conn = self.select_mut(channel);

        let watching = conn
            .watchers
            .get(channel)
            .is_some_and(|watcher| !watcher.is_finished());
        if watching && conn.link.is_subscribed(channel, true) {
            return;
        }

        let mut stream = conn.link.subscribe(channel);
        let owned_channel = channel.to_string();
        let watcher = tokio::spawn(async move {
            while let Some(packet) = stream.next().await {
                let inbound_packet = InboundPacket {
                    site: site.clone(),
                    channel: owned_channel.clone(),
                    packet,
                };
                if inbound.send(inbound_packet).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = conn.watchers.insert(channel.to_string(), watcher) {
            previous.abort();
        }
        tracing::trace!(site = %self.site, channel, pool_index = self.pool_index_for(channel), "Subscribed channel");
    }

    /// Close `channel` on its connection and stop relaying it.
    pub fn unsubscribe(&mut self, channel: &str) {
        let conn = self.select_mut(channel);
        conn.link.unsubscribe(channel);
        if let Some(watcher) = conn.watchers.remove(channel) {
            watcher.abort();
        }
    }

    pub fn is_subscribed(&self, channel: &str, include_pending: bool) -> bool {
        self.select(channel).link.is_subscribed(channel, include_pending)
    }

    /// Channels held across every connection.
    pub fn subscriptions(&self, include_pending: bool) -> Vec<String> {
        self.connections
            .iter()
            .flat_map(|conn| conn.link.subscriptions(include_pending))
            .collect()
    }

    /// Close every connection and drop all channel state. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.unbind_listeners();
        for conn in &mut self.connections {
            for (_, watcher) in conn.watchers.drain() {
                watcher.abort();
            }
            conn.link.close();
        }
        self.destroyed = true;
        tracing::debug!(site = %self.site, "Destroyed connection pool");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.destroy();
    }
}
