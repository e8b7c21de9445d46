use broker::{BrokerBackend, BrokerClient, MemoryBroker};
use config::Config;
use domain::{error::Error as DomainError, PrincipalDirectory, PrincipalProvider};
use events::EventPublisher;
use log::*;
use std::sync::Arc;
use streaming::SubscriptionManager;

pub mod config;
pub mod logging;

/// Builds the configured broker backend and attempts an initial connection. A
/// broker that is down at startup is not fatal: publishing connects lazily.
pub async fn init_broker(config: &Config) -> Arc<dyn BrokerClient> {
    let backend = config.effective_broker();
    info!(
        "Streaming broker: {backend} ({}:{})",
        config.streaming_broker_host(),
        config.streaming_broker_port
    );

    let broker: Arc<dyn BrokerClient> = match backend {
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => Arc::new(broker::kafka::KafkaBroker::new(
            config.streaming_broker_host(),
            config.streaming_broker_port,
            config.topic_settings(),
        )),
        #[cfg(feature = "rabbitmq")]
        BrokerBackend::RabbitMq => Arc::new(broker::rabbitmq::RabbitMqBroker::new(
            config.streaming_broker_host(),
            config.streaming_broker_port,
            config.broker_username(),
            config.broker_password(),
        )),
        BrokerBackend::Memory => memory_broker(config),
        #[allow(unreachable_patterns)]
        other => {
            warn!("Broker backend {other} is not compiled in, using the in-memory broker");
            memory_broker(config)
        }
    };

    if !broker.connect().await {
        warn!("Broker unreachable at startup; will retry on first use");
    }
    broker
}

fn memory_broker(config: &Config) -> Arc<dyn BrokerClient> {
    Arc::new(MemoryBroker::new(
        broker::DeliveryMode::Broadcast,
        config.memory_broker_capacity,
    ))
}

/// Loads the token directory named by `--principals-file`, or an empty one.
pub fn init_principals(config: &Config) -> Result<Arc<dyn PrincipalProvider>, DomainError> {
    let directory = match config.principals_file() {
        Some(path) => PrincipalDirectory::from_file(path)?,
        None => {
            warn!("No principals file configured; every connection will be rejected");
            PrincipalDirectory::new()
        }
    };
    Ok(Arc::new(directory))
}

// Service-level state shared by every request handler.
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub broker: Arc<dyn BrokerClient>,
    pub subscriptions: SubscriptionManager,
    pub events: EventPublisher,
    pub principals: Arc<dyn PrincipalProvider>,
}

impl AppState {
    pub fn new(
        app_config: Config,
        broker: Arc<dyn BrokerClient>,
        principals: Arc<dyn PrincipalProvider>,
    ) -> Self {
        let subscriptions =
            SubscriptionManager::new(Arc::clone(&broker), app_config.subscription_settings());
        Self {
            events: EventPublisher::new(Arc::clone(&broker)),
            subscriptions,
            broker,
            principals,
            config: app_config,
        }
    }

    /// Stops every subscription, then releases the broker.
    pub async fn shutdown(&self) {
        self.subscriptions.shutdown().await;
        if !self.broker.disconnect().await {
            warn!("Broker did not disconnect cleanly");
        }
    }
}
