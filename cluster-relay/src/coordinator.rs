//! Contract with the cluster state server ("coordinator").
//!
//! The coordinator owns broker membership. Workers register with `join`,
//! receive pushed membership snapshots, and during a loss-averse rebalance
//! report each phase with `set_state` and wait for `StatesConverge`.

use crate::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Rebalance phase a worker reports to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    UpdatedSubs,
    UpdatedPubs,
    Active,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdatedSubs => "updatedSubs",
            Self::UpdatedPubs => "updatedPubs",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broker membership at a point in coordinator time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSnapshot {
    #[serde(alias = "siteList")]
    pub sites: Vec<String>,
    pub time: i64,
}

/// Worker membership at a point in coordinator time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub workers: Vec<String>,
    pub time: i64,
}

/// Sent with `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub instance_id: String,
    pub instance_ip: Option<String>,
    pub instance_ip_family: String,
}

/// Current cluster view returned by `join`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub time: Option<i64>,
}

/// Notifications pushed by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// The coordinator link (re)connected; the worker should join again.
    Connected,
    SiteJoined(MembershipSnapshot),
    SiteLeft(MembershipSnapshot),
    WorkerJoined(WorkerSnapshot),
    WorkerLeft(WorkerSnapshot),
    /// Every worker reported `state`.
    StatesConverge(InstanceState),
    Error(String),
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn join(&self, registration: &WorkerRegistration) -> Result<JoinReply, Error>;

    async fn set_state(&self, state: InstanceState) -> Result<(), Error>;

    fn events(&self) -> broadcast::Receiver<CoordinatorEvent>;
}

/// Tracks the latest applied snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotClock {
    latest: i64,
}

impl SnapshotClock {
    pub fn new() -> Self {
        Self { latest: -1 }
    }

    /// Accept `time` if it is strictly newer than anything seen.
    pub fn advance(&mut self, time: i64) -> bool {
        if time > self.latest {
            self.latest = time;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.latest = -1;
    }

    pub fn latest(&self) -> i64 {
        self.latest
    }
}

impl Default for SnapshotClock {
    fn default() -> Self {
        Self::new()
    }
}
