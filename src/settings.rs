//! Configuration for a logical server: the seed list, timeouts and pool bounds.
use {Error, Result};
use Error::ArgumentError;

use auth::MongoCredentials;
use connstring::{self, ConnectionString, ServerAddress};

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30 * 1000;
pub const DEFAULT_MAX_CONNECTION_IDLE_TIME_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_MAX_CONNECTION_LIFE_TIME_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_MAX_CONNECTION_POOL_SIZE: usize = 100;
pub const DEFAULT_WAIT_QUEUE_MULTIPLE: f64 = 5.0;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT_MS: u64 = 2 * 60 * 1000;
pub const DEFAULT_SECONDARY_ACCEPTABLE_LATENCY_MS: u64 = 15;
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 10 * 1000;
pub const DEFAULT_PING_WINDOW_SIZE: usize = 5;

/// How the seed list should be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionMode {
    /// Discover the topology from the first server that answers.
    Automatic,
    /// Talk to exactly one server, whatever its role.
    Direct,
    /// The seeds are members of a replica set.
    ReplicaSet,
    /// The seeds are shard routers.
    ShardRouter,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        ConnectionMode::Automatic
    }
}

impl FromStr for ConnectionMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match &s.to_ascii_lowercase()[..] {
            "automatic" => Ok(ConnectionMode::Automatic),
            "direct" => Ok(ConnectionMode::Direct),
            "replicaset" => Ok(ConnectionMode::ReplicaSet),
            "shardrouter" => Ok(ConnectionMode::ShardRouter),
            _ => Err(ArgumentError(format!("Invalid connection mode '{}'.", s))),
        }
    }
}

/// Settings shared by every proxy, instance, pool and connection of one
/// logical server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// The seed list.
    pub hosts: Vec<ServerAddress>,
    #[serde(rename = "connect")]
    pub connection_mode: ConnectionMode,
    /// Pins the replica set name. Members reporting another name are dropped.
    #[serde(rename = "replicaSet")]
    pub replica_set_name: Option<String>,
    #[serde(rename = "connectTimeoutMS", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Zero means no socket timeout.
    #[serde(rename = "socketTimeoutMS", with = "duration_ms")]
    pub socket_timeout: Duration,
    #[serde(rename = "minPoolSize")]
    pub min_connection_pool_size: usize,
    #[serde(rename = "maxPoolSize")]
    pub max_connection_pool_size: usize,
    #[serde(rename = "maxIdleTimeMS", with = "duration_ms")]
    pub max_connection_idle_time: Duration,
    #[serde(rename = "maxLifeTimeMS", with = "duration_ms")]
    pub max_connection_life_time: Duration,
    #[serde(rename = "waitQueueSize")]
    pub wait_queue_size: usize,
    #[serde(rename = "waitQueueTimeoutMS", with = "duration_ms")]
    pub wait_queue_timeout: Duration,
    #[serde(rename = "secondaryAcceptableLatencyMS", with = "duration_ms")]
    pub secondary_acceptable_latency: Duration,
    #[serde(rename = "tcpReceiveBufferSize")]
    pub tcp_receive_buffer_size: usize,
    #[serde(rename = "tcpSendBufferSize")]
    pub tcp_send_buffer_size: usize,
    /// How often each pool runs its maintenance tick.
    #[serde(rename = "maintenanceIntervalMS", with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// How many round-trip samples feed the average ping time.
    #[serde(rename = "pingWindowSize")]
    pub ping_window_size: usize,
    #[serde(skip)]
    pub credentials: Option<MongoCredentials>,
}

impl Default for ServerSettings {
    fn default() -> ServerSettings {
        ServerSettings {
            hosts: vec![ServerAddress::new("localhost", connstring::DEFAULT_PORT)],
            connection_mode: ConnectionMode::Automatic,
            replica_set_name: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            socket_timeout: Duration::from_millis(0),
            min_connection_pool_size: 0,
            max_connection_pool_size: DEFAULT_MAX_CONNECTION_POOL_SIZE,
            max_connection_idle_time: Duration::from_millis(DEFAULT_MAX_CONNECTION_IDLE_TIME_MS),
            max_connection_life_time: Duration::from_millis(DEFAULT_MAX_CONNECTION_LIFE_TIME_MS),
            wait_queue_size: (DEFAULT_WAIT_QUEUE_MULTIPLE * DEFAULT_MAX_CONNECTION_POOL_SIZE as f64) as usize,
            wait_queue_timeout: Duration::from_millis(DEFAULT_WAIT_QUEUE_TIMEOUT_MS),
            secondary_acceptable_latency: Duration::from_millis(DEFAULT_SECONDARY_ACCEPTABLE_LATENCY_MS),
            tcp_receive_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            tcp_send_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            maintenance_interval: Duration::from_millis(DEFAULT_MAINTENANCE_INTERVAL_MS),
            ping_window_size: DEFAULT_PING_WINDOW_SIZE,
            credentials: None,
        }
    }
}

impl ServerSettings {
    /// Returns default settings seeded with the given hosts.
    pub fn with_hosts(hosts: Vec<ServerAddress>) -> ServerSettings {
        ServerSettings {
            hosts: hosts,
            ..ServerSettings::default()
        }
    }

    /// Parses a `mongodb://` URI into validated settings.
    pub fn from_uri(uri: &str) -> Result<ServerSettings> {
        let config = connstring::parse(uri)?;
        ServerSettings::from_connection_string(&config)
    }

    /// Builds validated settings from a parsed connection string. Unknown
    /// options are ignored.
    pub fn from_connection_string(config: &ConnectionString) -> Result<ServerSettings> {
        let mut settings = ServerSettings::with_hosts(config.hosts.clone());

        if let Some(ref user) = config.user {
            let password = config.password.clone().unwrap_or_default();
            let admin = config.database.as_ref().map_or(false, |db| db == "admin");
            settings.credentials = Some(MongoCredentials::new(user, &password, admin));
        }

        let mut wait_queue_multiple = None;

        if let Some(ref opts) = config.options {
            for (key, value) in &opts.options {
                match &key.to_ascii_lowercase()[..] {
                    "connect" => settings.connection_mode = value.parse()?,
                    "replicaset" => settings.replica_set_name = Some(value.to_owned()),
                    "connecttimeoutms" => settings.connect_timeout = parse_ms(key, value)?,
                    "sockettimeoutms" => settings.socket_timeout = parse_ms(key, value)?,
                    "minpoolsize" => settings.min_connection_pool_size = parse_number(key, value)?,
                    "maxpoolsize" => settings.max_connection_pool_size = parse_number(key, value)?,
                    "maxidletimems" => settings.max_connection_idle_time = parse_ms(key, value)?,
                    "maxlifetimems" => settings.max_connection_life_time = parse_ms(key, value)?,
                    "waitqueuesize" => settings.wait_queue_size = parse_number(key, value)?,
                    "waitqueuemultiple" => {
                        wait_queue_multiple = Some(value.parse::<f64>().map_err(|_| {
                            ArgumentError(format!("Option '{}' must be a number.", key))
                        })?)
                    }
                    "waitqueuetimeoutms" => settings.wait_queue_timeout = parse_ms(key, value)?,
                    "secondaryacceptablelatencyms" => {
                        settings.secondary_acceptable_latency = parse_ms(key, value)?
                    }
                    _ => debug!("ignoring unsupported connection string option '{}'", key),
                }
            }
        }

        if let Some(multiple) = wait_queue_multiple {
            settings.wait_queue_size = (multiple * settings.max_connection_pool_size as f64) as usize;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings no proxy could honor.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ArgumentError("At least one host must be provided.".to_owned()));
        }
        if self.max_connection_pool_size == 0 {
            return Err(ArgumentError("The connection pool size must be greater than zero.".to_owned()));
        }
        if self.min_connection_pool_size > self.max_connection_pool_size {
            return Err(ArgumentError(format!(
                "minPoolSize ({}) cannot exceed maxPoolSize ({}).",
                self.min_connection_pool_size,
                self.max_connection_pool_size)));
        }
        if self.connection_mode == ConnectionMode::Direct && self.hosts.len() > 1 {
            return Err(ArgumentError("Direct connections cannot be used with multiple seeds.".to_owned()));
        }
        if self.ping_window_size == 0 {
            return Err(ArgumentError("The ping window must hold at least one sample.".to_owned()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value.parse::<usize>()
         .map_err(|_| ArgumentError(format!("Option '{}' must be a non-negative integer.", key)))
}

fn parse_ms(key: &str, value: &str) -> Result<Duration> {
    value.parse::<u64>()
         .map(Duration::from_millis)
         .map_err(|_| ArgumentError(format!("Option '{}' must be a number of milliseconds.", key)))
}

// Durations travel as whole milliseconds, matching the option names.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where S: Serializer
    {
        serializer.serialize_u64(duration.as_secs() * 1000 + u64::from(duration.subsec_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where D: Deserializer<'de>
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
