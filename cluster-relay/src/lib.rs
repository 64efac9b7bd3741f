//! Cluster-aware pub/sub relay.
//!
//! A relay sits next to a local message broker and extends its channels
//! across a cluster of broker sites:
//! - Channel → site routing via rendezvous hashing (or a simple modulo hash)
//! - One connection pool per site, with channels pinned to one connection
//! - Loss-averse rebalancing coordinated through a cluster state server
//! - Echo suppression by sender id and optional publish batching
//!
//! # Example
//!
//! ```rust,ignore
//! use cluster_relay::{ClusterRelay, LocalEvent, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (local_tx, local_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//!     // Attach - joins the cluster and starts mirroring local activity
//!     let relay = ClusterRelay::attach(broker, local_rx, coordinator, connector, RelayConfig::from_env()?)?;
//!
//!     local_tx.send(LocalEvent::Subscribe("orders".into()))?;
//!
//!     // Flushes pending batches and closes every broker connection
//!     relay.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Rebalancing
//!
//! - **Immediate**: the new mapping is used as soon as membership changes.
//!   Messages published during the switch can be missed by workers that
//!   have not switched yet.
//! - **Loss-averse** (default): subscriptions move first, then publishes,
//!   and old subscriptions are only dropped once every worker confirmed.
//!   Messages may be delivered more than once during the handover but are
//!   never lost.
//!
//! The transport to broker sites and the coordinator link are traits
//! ([`Connector`], [`Coordinator`]); [`memory`] has in-process versions.

pub mod batch;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod hasher;
pub mod mapper;
pub mod memory;
pub mod packet;
pub mod pool;
pub mod relay;
pub mod site;
pub mod transport;

pub use batch::{OutboundBuffer, PublishMode};
pub use client::{ClientOptions, ClientState, ClusterBrokerClient, RebalanceMode, TransitionPhase};
pub use config::{CoordinatorConfig, RelayConfig};
pub use coordinator::{
    Coordinator, CoordinatorEvent, InstanceState, JoinReply, MembershipSnapshot, SnapshotClock,
    WorkerRegistration, WorkerSnapshot,
};
pub use error::{Error, Result, RoutingOp, TransportError};
pub use event::{ClientEvent, EventContext};
pub use mapper::{Mapper, MappingEngine, MappingStrategy, RendezvousOptions};
pub use packet::{InboundPacket, Packet};
pub use pool::{ConnectionPool, PoolOptions};
pub use relay::{ClusterRelay, LocalBroker, LocalEvent, RelayView};
pub use site::Site;
pub use transport::{BrokerConnection, ConnectOptions, ConnectionEvent, Connector, ReconnectPolicy};
