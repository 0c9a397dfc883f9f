use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use durable::PoolConfig;
use hub::SessionConfig;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Redis URL shared by every replica for fan-out and the durable log.
    /// Without it the relay runs as a single replica on in-memory backends.
    #[arg(long, env)]
    redis_url: Option<String>,

    /// Unique name of this replica; used for consumer names and fan-out origins.
    /// A random id is generated when unset.
    #[arg(long, env)]
    replica_id: Option<String>,

    /// Seconds a session may stay silent before it is closed
    #[arg(long, env, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub pong_wait_secs: u64,

    /// Upper bound in seconds for a single write to a client
    #[arg(long, env, default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Frames buffered per session before the session is evicted
    #[arg(long, env, default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Send evicted clients a close frame before dropping them
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub notify_on_evict: bool,

    /// Capacity of the hub's command queue
    #[arg(long, env, default_value_t = 1024)]
    pub hub_command_capacity: usize,

    /// Prefix of every fan-out channel
    #[arg(long, env, default_value = "fanout:")]
    pub fanout_channel_prefix: String,

    /// Pattern this replica subscribes to
    #[arg(long, env, default_value = "fanout:*")]
    pub fanout_pattern: String,

    /// Messages buffered per subscriber by the in-memory fan-out driver
    #[arg(long, env, default_value_t = 1024)]
    pub fanout_buffer: usize,

    /// Prefix of every durable stream key
    #[arg(long, env, default_value = "events:")]
    pub stream_prefix: String,

    /// Consumer group the relay's own workers join
    #[arg(long, env, default_value = "audit")]
    pub consumer_group: String,

    /// Topics whose durable streams this replica consumes
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "tasks"
    )]
    pub stream_topics: Vec<String>,

    /// Workers per consumed stream
    #[arg(long, env, default_value_t = 4)]
    pub workers: usize,

    /// Entries fetched per read
    #[arg(long, env, default_value_t = 16)]
    pub read_count: usize,

    /// Milliseconds a read waits for new entries
    #[arg(long, env, default_value_t = 2000)]
    pub read_block_ms: u64,

    /// Seconds a pending entry must be idle before another worker may claim it
    #[arg(long, env, default_value_t = 30)]
    pub claim_timeout_secs: u64,

    /// Seconds between reclaim sweeps
    #[arg(long, env, default_value_t = 15)]
    pub claim_interval_secs: u64,

    /// Deliveries after which a failing entry is dead-lettered
    #[arg(long, env, default_value_t = 5)]
    pub max_deliveries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse().with_replica_id()
    }

    fn with_replica_id(mut self) -> Self {
        if self.replica_id.is_none() {
            self.replica_id = Some(uuid::Uuid::new_v4().simple().to_string());
        }
        self
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref()
    }

    pub fn replica_id(&self) -> &str {
        self.replica_id.as_deref().unwrap_or("relay")
    }

    pub fn set_replica_id(mut self, replica_id: String) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            write_wait: Duration::from_secs(self.write_wait_secs),
            outbound_capacity: self.outbound_buffer,
            notify_on_evict: self.notify_on_evict,
            ..SessionConfig::with_pong_wait(Duration::from_secs(self.pong_wait_secs))
        }
    }

    /// Worker pool settings for the durable stream of `topic`.
    pub fn pool_config(&self, topic: &str) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            read_count: self.read_count,
            read_block: Duration::from_millis(self.read_block_ms),
            claim_timeout: Duration::from_secs(self.claim_timeout_secs),
            claim_interval: Duration::from_secs(self.claim_interval_secs),
            max_deliveries: self.max_deliveries,
            ..PoolConfig::new(
                durable::stream_for(&self.stream_prefix, topic),
                self.consumer_group.clone(),
                self.replica_id(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("relay").chain(args.iter().copied())).with_replica_id()
    }

    #[test]
    fn defaults_describe_a_single_in_memory_replica() {
        let config = parse(&[]);

        assert_eq!(config.redis_url(), None);
        assert_eq!(config.port, 4000);
        assert_eq!(config.stream_topics, ["tasks"]);
        assert!(!config.replica_id().is_empty());
        assert_eq!(config.runtime_env, RustEnv::Development);
    }

    #[test]
    fn session_config_follows_pong_wait() {
        let config = parse(&["--pong-wait-secs", "20", "--notify-on-evict", "false"]);
        let session = config.session_config();

        assert_eq!(session.pong_wait, Duration::from_secs(20));
        assert_eq!(session.ping_interval, Duration::from_secs(18));
        assert_eq!(session.outbound_capacity, 256);
        assert!(!session.notify_on_evict);
    }

    #[test]
    fn pong_wait_must_leave_room_for_a_ping() {
        let err = Config::try_parse_from(["relay", "--pong-wait-secs", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let session = parse(&["--pong-wait-secs", "1"]).session_config();
        assert!(!session.ping_interval.is_zero());
        assert!(session.ping_interval < session.pong_wait);
    }

    #[test]
    fn pool_config_names_stream_and_consumers() {
        let config = parse(&[
            "--replica-id",
            "relay-1",
            "--stream-topics",
            "tasks,invoices",
            "--max-deliveries",
            "3",
        ]);
        assert_eq!(config.stream_topics, ["tasks", "invoices"]);

        let pool = config.pool_config("invoices");
        assert_eq!(pool.stream, "events:invoices");
        assert_eq!(pool.group, "audit");
        assert_eq!(pool.consumer_name(0), "relay-1-0");
        assert_eq!(pool.max_deliveries, 3);
        assert_eq!(pool.claim_timeout, Duration::from_secs(30));
    }
}
