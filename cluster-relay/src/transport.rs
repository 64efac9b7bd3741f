//! Contract for the per-site broker transport.
//!
//! Framing, handshakes and reconnection live behind these traits. The relay
//! only needs to open a connection, (un)subscribe, publish with an ack and
//! observe connection-level events.

use crate::{Packet, TransportError};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Messages received on one channel subscription.
pub type PacketStream = BoxStream<'static, Packet>;

/// Resolves once the broker acknowledged (or rejected) a publish.
pub type PublishAck = BoxFuture<'static, Result<(), TransportError>>;

/// Reconnect schedule handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub randomness: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Fixed delay plus up to `randomness` of jitter.
    pub fn fixed(delay: Duration, randomness: Duration) -> Self {
        Self {
            initial_delay: delay,
            randomness,
            multiplier: 1.0,
            max_delay: delay + randomness,
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let base = Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
        );
        let jitter_ms = self.randomness.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(2000), Duration::from_millis(1000))
    }
}

/// Parameters for one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
    pub auth_key: Option<String>,
    pub pool_index: usize,
    pub reconnect: ReconnectPolicy,
}

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Error(TransportError),
    Subscribe { channel: String },
    SubscribeFail { channel: String, error: TransportError },
}

/// One live link to a broker site.
pub trait BrokerConnection: Send + Sync {
    /// Start (or keep) a subscription and return its message stream.
    ///
    /// The subscription is pending until the broker confirms it with a
    /// [`ConnectionEvent::Subscribe`].
    fn subscribe(&self, channel: &str) -> PacketStream;

    /// Close the channel. Its stream ends.
    fn unsubscribe(&self, channel: &str);

    fn is_subscribed(&self, channel: &str, include_pending: bool) -> bool;

    fn subscriptions(&self, include_pending: bool) -> Vec<String>;

    /// Send `packet` on `channel`.
    ///
    /// The packet is queued on the wire before this returns, so publishes
    /// made in order go out in order; the future only reports the ack.
    fn publish(&self, channel: &str, packet: Packet) -> PublishAck;

    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Tear down the link and every subscription on it.
    fn close(&self);
}

/// Opens broker connections.
pub trait Connector: Send + Sync {
    fn connect(&self, options: ConnectOptions) -> Arc<dyn BrokerConnection>;
}
