use std::sync::Arc;

use crate::directory::UserDirectory;
use crate::engine::{MediaEngine, WorkerSettings};
use crate::sfu::{
    ClientSessionRegistry, ConsumerManager, OperationQueue, ProducerManager, RouterRegistry,
    TransportManager, TransportSettings, WorkerPool,
};
use crate::ws::connections::ConnectionManager;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ips: Vec<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            num_workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            listen_ips: vec!["0.0.0.0".to_string()],
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: 30_000_000,
        }
    }
}

impl Config {
    /// Load from environment variables, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address);
        let num_workers = env_parse("NUM_MEDIA_WORKERS", defaults.num_workers)?;
        let rtc_min_port = env_parse("RTC_MIN_PORT", defaults.rtc_min_port)?;
        let rtc_max_port = env_parse("RTC_MAX_PORT", defaults.rtc_max_port)?;
        if rtc_min_port > rtc_max_port {
            anyhow::bail!("RTC_MIN_PORT {rtc_min_port} exceeds RTC_MAX_PORT {rtc_max_port}");
        }
        let listen_ips = std::env::var("RTC_LISTEN_IPS")
            .map(|value| value.split(',').map(str::trim).map(String::from).collect())
            .unwrap_or(defaults.listen_ips);
        let initial_available_outgoing_bitrate = env_parse(
            "INITIAL_AVAILABLE_OUTGOING_BITRATE",
            defaults.initial_available_outgoing_bitrate,
        )?;
        let max_incoming_bitrate =
            env_parse("MAX_INCOMING_BITRATE", defaults.max_incoming_bitrate)?;

        Ok(Config {
            bind_address,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            listen_ips,
            initial_available_outgoing_bitrate,
            max_incoming_bitrate,
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            listen_ips: self.listen_ips.clone(),
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} has an invalid value: {value}")),
        Err(_) => Ok(default),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub directory: Arc<dyn UserDirectory>,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<ClientSessionRegistry>,
    pub routers: Arc<RouterRegistry>,
    pub queue: Arc<OperationQueue>,
    pub consumers: Arc<ConsumerManager>,
    pub producers: Arc<ProducerManager>,
    pub transports: Arc<TransportManager>,
}

impl AppState {
    pub async fn new(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        directory: Arc<dyn UserDirectory>,
    ) -> anyhow::Result<Self> {
        let pool =
            WorkerPool::start(&engine, config.num_workers, &config.worker_settings()).await?;
        let connections = Arc::new(ConnectionManager::new());
        let registry = Arc::new(ClientSessionRegistry::new());
        let routers = Arc::new(RouterRegistry::new(pool));
        let queue = OperationQueue::start();
        let consumers = ConsumerManager::new(
            Arc::clone(&registry),
            Arc::clone(&routers),
            Arc::clone(&connections),
            Arc::clone(&queue),
        );
        let producers = ProducerManager::new(
            Arc::clone(&registry),
            Arc::clone(&routers),
            Arc::clone(&connections),
            Arc::clone(&consumers),
            Arc::clone(&queue),
        );
        let transports = TransportManager::new(
            Arc::clone(&registry),
            Arc::clone(&routers),
            Arc::clone(&producers),
            Arc::clone(&consumers),
            config.transport_settings(),
        );

        Ok(Self {
            config,
            directory,
            connections,
            registry,
            routers,
            queue,
            consumers,
            producers,
            transports,
        })
    }
}
