use broker::{BrokerBackend, TopicSettings};
use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use streaming::{OverflowPolicy, SubscriptionSettings};

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
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

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

    /// Connect to an external message broker. When disabled the in-process broker is
    /// used and nothing leaves this instance.
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_streaming: bool,

    /// Which message broker backend to use.
    #[arg(
        long,
        env,
        default_value_t = BrokerBackend::Kafka,
        value_parser = clap::builder::PossibleValuesParser::new(["kafka", "rabbitmq", "memory"])
            .map(|s| s.parse::<BrokerBackend>().unwrap()),
    )]
    pub streaming_broker: BrokerBackend,

    /// Message broker host
    #[arg(long, env, default_value = "localhost")]
    streaming_broker_host: String,

    /// Message broker port
    #[arg(long, env, default_value_t = 9092)]
    pub streaming_broker_port: u16,

    /// Username for brokers that authenticate connections (AMQP)
    #[arg(long, env, default_value = "guest")]
    broker_username: String,

    /// Password for brokers that authenticate connections (AMQP)
    #[arg(long, env, default_value = "guest", hide_env_values = true)]
    broker_password: String,

    /// Partitions for topics created on a streaming-queue broker
    #[arg(long, env, default_value_t = 1)]
    pub topic_partitions: i32,

    /// Replication factor for topics created on a streaming-queue broker
    #[arg(long, env, default_value_t = 1)]
    pub topic_replication_factor: i32,

    /// Per-subscriber queue capacity of the in-process broker
    #[arg(long, env, default_value_t = 1024)]
    pub memory_broker_capacity: usize,

    /// JSON file mapping bearer tokens to principals
    #[arg(long, env)]
    principals_file: Option<PathBuf>,

    /// Capacity of each connection's outbound message queue
    #[arg(long, env, default_value_t = 256)]
    pub send_queue_capacity: usize,

    /// What to do when a connection's outbound queue is full
    #[arg(
        long,
        env,
        default_value_t = OverflowPolicy::Disconnect,
        value_parser = clap::builder::PossibleValuesParser::new(["drop-newest", "disconnect", "block"])
            .map(|s| s.parse::<OverflowPolicy>().unwrap()),
    )]
    pub overflow_policy: OverflowPolicy,

    /// How long the `block` overflow policy waits for queue space before disconnecting
    #[arg(long, env, default_value_t = 1000)]
    pub overflow_block_timeout_ms: u64,
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
        Config::parse()
    }

    pub fn streaming_broker_host(&self) -> &str {
        &self.streaming_broker_host
    }

    pub fn broker_username(&self) -> &str {
        &self.broker_username
    }

    pub fn broker_password(&self) -> &str {
        &self.broker_password
    }

    pub fn principals_file(&self) -> Option<&PathBuf> {
        self.principals_file.as_ref()
    }

    pub fn set_principals_file(mut self, path: PathBuf) -> Self {
        self.principals_file = Some(path);
        self
    }

    /// The backend actually used: streaming disabled always means in-process.
    pub fn effective_broker(&self) -> BrokerBackend {
        if self.enable_streaming {
            self.streaming_broker
        } else {
            BrokerBackend::Memory
        }
    }

    pub fn topic_settings(&self) -> TopicSettings {
        TopicSettings {
            partitions: self.topic_partitions,
            replication_factor: self.topic_replication_factor,
        }
    }

    pub fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            send_queue_capacity: self.send_queue_capacity,
            overflow_policy: self.overflow_policy,
            block_timeout: Duration::from_millis(self.overflow_block_timeout_ms),
        }
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }
}
