use crate::batch::PublishMode;
use crate::client::{ClientOptions, RebalanceMode};
use crate::coordinator::WorkerRegistration;
use crate::mapper::MappingStrategy;
use crate::pool::PoolOptions;
use crate::transport::ReconnectPolicy;
use crate::Error;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Connection settings for the cluster state server.
///
/// The relay itself only uses the timeouts and retry settings. `host` and
/// `port` are for the host application's [`Coordinator`] implementation,
/// which reads them through [`CoordinatorConfig::address`].
///
/// [`Coordinator`]: crate::Coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Defaults to the worker's own host when unset.
    pub host: Option<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Delay between join attempts and failed state reports. Also the base
    /// broker reconnect delay.
    pub retry_delay: Duration,
    pub reconnect_randomness: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 7777,
            connect_timeout: Duration::from_millis(3000),
            ack_timeout: Duration::from_millis(2000),
            retry_delay: Duration::from_millis(2000),
            reconnect_randomness: Duration::from_millis(1000),
        }
    }
}

impl CoordinatorConfig {
    /// `host:port` of the state server, with `default_host` standing in for
    /// an unset host. IPv6 literals are bracketed.
    pub fn address(&self, default_host: &str) -> String {
        let host = self.host.as_deref().unwrap_or(default_host);
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::fixed(self.retry_delay, self.reconnect_randomness)
    }
}

/// Relay settings.
///
/// Built with [`RelayConfig::default`] or from `RELAY_*` environment
/// variables with [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Stamped on outgoing packets for echo suppression. A random UUID is
    /// used when unset.
    pub instance_id: Option<String>,
    pub instance_ip: Option<String>,
    pub instance_ip_family: String,
    pub auth_key: Option<String>,
    pub client_pool_size: usize,
    pub mapping_engine: MappingStrategy,
    /// Publish batching window. `None` or zero publishes immediately.
    pub pub_sub_batch_duration: Option<Duration>,
    pub rebalance_mode: RebalanceMode,
    pub coordinator: CoordinatorConfig,
    /// Capacity of the observability event broadcast.
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            instance_ip: None,
            instance_ip_family: "IPv4".to_string(),
            auth_key: None,
            client_pool_size: 1,
            mapping_engine: MappingStrategy::default(),
            pub_sub_batch_duration: None,
            rebalance_mode: RebalanceMode::default(),
            coordinator: CoordinatorConfig::default(),
            event_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        config.instance_id = get("RELAY_INSTANCE_ID");
        config.instance_ip = get("RELAY_INSTANCE_IP");
        if let Some(family) = get("RELAY_INSTANCE_IP_FAMILY") {
            config.instance_ip_family = family;
        }
        config.auth_key = get("RELAY_AUTH_KEY");
        if let Some(size) = get("RELAY_CLIENT_POOL_SIZE") {
            config.client_pool_size = parse("RELAY_CLIENT_POOL_SIZE", &size)?;
        }
        if let Some(engine) = get("RELAY_MAPPING_ENGINE") {
            config.mapping_engine = engine.parse()?;
        }
        if let Some(ms) = get("RELAY_PUB_SUB_BATCH_DURATION_MS") {
            config.pub_sub_batch_duration = Some(millis("RELAY_PUB_SUB_BATCH_DURATION_MS", &ms)?);
        }
        if let Some(mode) = get("RELAY_REBALANCE_MODE") {
            config.rebalance_mode = mode.parse()?;
        }
        if let Some(capacity) = get("RELAY_EVENT_CAPACITY") {
            config.event_capacity = parse("RELAY_EVENT_CAPACITY", &capacity)?;
        }

        let coordinator = &mut config.coordinator;
        coordinator.host = get("RELAY_STATE_SERVER_HOST");
        if let Some(port) = get("RELAY_STATE_SERVER_PORT") {
            coordinator.port = parse("RELAY_STATE_SERVER_PORT", &port)?;
        }
        if let Some(ms) = get("RELAY_STATE_SERVER_CONNECT_TIMEOUT_MS") {
            coordinator.connect_timeout = millis("RELAY_STATE_SERVER_CONNECT_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = get("RELAY_STATE_SERVER_ACK_TIMEOUT_MS") {
            coordinator.ack_timeout = millis("RELAY_STATE_SERVER_ACK_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = get("RELAY_BROKER_RETRY_DELAY_MS") {
            coordinator.retry_delay = millis("RELAY_BROKER_RETRY_DELAY_MS", &ms)?;
        }
        if let Some(ms) = get("RELAY_RECONNECT_RANDOMNESS_MS") {
            coordinator.reconnect_randomness = millis("RELAY_RECONNECT_RANDOMNESS_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.client_pool_size == 0 {
            return Err(Error::config("client pool size must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event capacity must be at least 1"));
        }
        if self.coordinator.retry_delay.is_zero() {
            return Err(Error::config("retry delay must be greater than zero"));
        }
        if self.instance_id.as_deref().is_some_and(|id| id.is_empty()) {
            return Err(Error::config("instance id must not be empty"));
        }
        Ok(())
    }

    pub fn publish_mode(&self) -> PublishMode {
        PublishMode::from_window(self.pub_sub_batch_duration)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            pool: PoolOptions {
                size: self.client_pool_size,
                auth_key: self.auth_key.clone(),
                reconnect: self.coordinator.reconnect_policy(),
            },
            mapping: self.mapping_engine.clone(),
            rebalance: self.rebalance_mode,
        }
    }

    /// State server address, defaulting the host to this worker's IP and
    /// then to `localhost`.
    pub fn coordinator_address(&self) -> String {
        let own_host = self.instance_ip.as_deref().unwrap_or("localhost");
        self.coordinator.address(own_host)
    }

    pub fn registration(&self, instance_id: &str) -> WorkerRegistration {
        WorkerRegistration {
            instance_id: instance_id.to_string(),
            instance_ip: self.instance_ip.clone(),
            instance_ip_family: self.instance_ip_family.clone(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{key} has invalid value '{value}'")))
}

fn millis(key: &str, value: &str) -> Result<Duration, Error> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.client_pool_size, 1);
        assert_eq!(config.coordinator.port, 7777);
        assert_eq!(config.coordinator.retry_delay, Duration::from_millis(2000));
        assert_eq!(config.rebalance_mode, RebalanceMode::LossAverse);
        assert_eq!(config.mapping_engine.as_str(), "rendezvous");
        assert_eq!(config.publish_mode(), PublishMode::Immediate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("RELAY_INSTANCE_ID", "worker-7"),
            ("RELAY_CLIENT_POOL_SIZE", "4"),
            ("RELAY_MAPPING_ENGINE", "simple"),
            ("RELAY_PUB_SUB_BATCH_DURATION_MS", "25"),
            ("RELAY_REBALANCE_MODE", "immediate"),
            ("RELAY_STATE_SERVER_PORT", "9000"),
            ("RELAY_BROKER_RETRY_DELAY_MS", "500"),
            ("RELAY_AUTH_KEY", ""),
        ]))
        .unwrap();

        assert_eq!(config.instance_id.as_deref(), Some("worker-7"));
        assert_eq!(config.client_pool_size, 4);
        assert_eq!(config.mapping_engine.as_str(), "simple");
        assert_eq!(
            config.publish_mode(),
            PublishMode::Batched(Duration::from_millis(25))
        );
        assert_eq!(config.rebalance_mode, RebalanceMode::Immediate);
        assert_eq!(config.coordinator.port, 9000);
        assert_eq!(config.auth_key, None);

        let options = config.client_options();
        assert_eq!(options.pool.size, 4);
        assert_eq!(options.pool.reconnect.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            RelayConfig::from_lookup(lookup(&[("RELAY_CLIENT_POOL_SIZE", "many")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RelayConfig::from_lookup(lookup(&[("RELAY_CLIENT_POOL_SIZE", "0")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RelayConfig::from_lookup(lookup(&[("RELAY_MAPPING_ENGINE", "consistent")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_registration_uses_instance_settings() {
        let config = RelayConfig {
            instance_ip: Some("10.1.2.3".into()),
            ..RelayConfig::default()
        };
        let registration = config.registration("w1");
        assert_eq!(registration.instance_id, "w1");
        assert_eq!(registration.instance_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(registration.instance_ip_family, "IPv4");
    }

    #[test]
    fn test_coordinator_address() {
        let mut config = RelayConfig::default();
        assert_eq!(config.coordinator_address(), "localhost:7777");

        config.instance_ip = Some("10.1.2.3".into());
        assert_eq!(config.coordinator_address(), "10.1.2.3:7777");

        config.instance_ip = Some("fd00::7".into());
        assert_eq!(config.coordinator_address(), "[fd00::7]:7777");

        let config = RelayConfig::from_lookup(lookup(&[
            ("RELAY_STATE_SERVER_HOST", "scc-state"),
            ("RELAY_STATE_SERVER_PORT", "7000"),
            ("RELAY_INSTANCE_IP", "10.1.2.3"),
        ]))
        .unwrap();
        assert_eq!(config.coordinator_address(), "scc-state:7000");
        assert_eq!(config.coordinator.address("ignored"), "scc-state:7000");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var("RELAY_CLIENT_POOL_SIZE", "3");
        env::set_var("RELAY_STATE_SERVER_HOST", "coordinator.local");
        let config = RelayConfig::from_env();
        env::remove_var("RELAY_CLIENT_POOL_SIZE");
        env::remove_var("RELAY_STATE_SERVER_HOST");

        let config = config.unwrap();
        assert_eq!(config.client_pool_size, 3);
        assert_eq!(config.coordinator.host.as_deref(), Some("coordinator.local"));
    }
}
