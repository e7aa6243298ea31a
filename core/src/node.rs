// Node façade — one MSD and everything it owns
//
// Construction order: config → keyring → timers → task pool → network
// managers → cache → router → message manager. Shutdown runs in reverse.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::{Service, ServiceCache, Template};
use crate::config::NodeConfig;
use crate::connection::{connection_to_streams, Connection};
use crate::error::{MsdError, MsdResult};
use crate::keying::{KeyingService, StaticKeyring};
use crate::message::Codec;
use crate::protocol::{DiscoveryProxy, Level, MessageManager, ProtocolEvent, RankPolicy, UseHandler};
use crate::routing::{LocalDispatch, RouterManager};
use crate::timer::{TaskPool, TimerService};
use crate::transport::{NetworkCore, NetworkManager, StreamDialer};

pub struct Msd {
    config: NodeConfig,
    keys: Arc<dyn KeyingService>,
    timers: Arc<TimerService>,
    pool: TaskPool,
    networks: Vec<Arc<NetworkManager>>,
    cache: Arc<ServiceCache>,
    router: Arc<RouterManager>,
    protocol: Arc<MessageManager>,
    /// Networks whose transport came up
    started: RwLock<Vec<String>>,
    running: RwLock<bool>,
}

impl Msd {
    /// Node with pre-shared keys from the configuration. Stream-only
    /// networks need [`Msd::with_dialer`].
    pub fn new(config: NodeConfig) -> MsdResult<Self> {
        let keys = Arc::new(StaticKeyring::from_hex_keys(&config.network_keys));
        Self::with_parts(config, None, keys)
    }

    pub fn with_dialer(config: NodeConfig, dialer: Arc<dyn StreamDialer>) -> MsdResult<Self> {
        let keys = Arc::new(StaticKeyring::from_hex_keys(&config.network_keys));
        Self::with_parts(config, Some(dialer), keys)
    }

    pub fn with_parts(
        config: NodeConfig,
        dialer: Option<Arc<dyn StreamDialer>>,
        keys: Arc<dyn KeyingService>,
    ) -> MsdResult<Self> {
        config.validate()?;

        let timers = Arc::new(TimerService::new());
        let pool = TaskPool::new(config.dispatch_concurrency);
        let codec = Codec::new()
            .with_hashing(config.hash_payloads)
            .with_max_header_line(config.limits.max_header_line)
            .with_keys(keys.clone());

        let mut networks = Vec::with_capacity(config.networks.len());
        for network in &config.networks {
            let core = Arc::new(NetworkCore::new(
                network.clone(),
                config.node_id.clone(),
                config.limits.clone(),
                codec.clone(),
            ));
            let manager =
                NetworkManager::from_config(core, dialer.clone(), timers.clone(), &config.timings)?;
            networks.push(Arc::new(manager));
        }

        let cache = Arc::new(ServiceCache::new(config.node_id.clone()));
        let router = RouterManager::new(
            config.node_id.clone(),
            networks.clone(),
            cache.clone(),
            pool.clone(),
            config.limits.queue_capacity,
        );
        router.attach();

        let protocol = MessageManager::new(
            &config,
            router.clone(),
            cache.clone(),
            keys.clone(),
            timers.clone(),
            pool.clone(),
            Arc::new(RankPolicy),
        );
        let local: Arc<dyn LocalDispatch> = protocol.clone();
        router.set_local_dispatch(Arc::downgrade(&local));

        Ok(Self {
            config,
            keys,
            timers,
            pool,
            networks,
            cache,
            router,
            protocol,
            started: RwLock::new(Vec::new()),
            running: RwLock::new(false),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Bring every network up and start the protocol on those that came up.
    /// A network whose transport fails is left out; the node keeps running.
    pub async fn start(&self) -> MsdResult<()> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(MsdError::AlreadyRunning);
            }
            *running = true;
        }
        info!(node = %self.config.node_id, networks = self.networks.len(), "MSD starting");

        let mut started = Vec::new();
        for network in &self.networks {
            match network.start().await {
                Ok(()) => started.push(network.name().to_string()),
                Err(err) => warn!(network = %network.name(), error = %err, "network not started"),
            }
        }
        for name in &started {
            if let Err(err) = self.protocol.start_network(name).await {
                warn!(network = %name, error = %err, "protocol not started");
            }
        }
        *self.started.write() = started;

        info!(node = %self.config.node_id, "MSD started");
        Ok(())
    }

    /// LEAVING/LEFT on every network, then stop timers, transports and
    /// queued work
    pub async fn shutdown(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        info!(node = %self.config.node_id, "MSD stopping");

        self.protocol.shutdown().await;
        self.timers.shutdown();
        for network in &self.networks {
            network.shutdown().await;
        }
        self.pool.close();
        self.started.write().clear();
        info!(node = %self.config.node_id, "MSD stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Networks whose transport came up on the last start
    pub fn started_networks(&self) -> Vec<String> {
        self.started.read().clone()
    }

    // ------------------------------------------------------------------------
    // SERVICES
    // ------------------------------------------------------------------------

    /// Register a local service and propagate the change. A service with no
    /// network presence is placed on every configured network.
    pub async fn register_service(&self, mut service: Service) -> MsdResult<u64> {
        if service.networks.is_empty() {
            service.networks = self.networks.iter().map(|n| n.name().to_string()).collect();
        }
        let update_id = self.cache.register(service);
        self.protocol.local_changed().await;
        Ok(update_id)
    }

    pub async fn unregister_service(&self, id: &str) -> MsdResult<Option<u64>> {
        let update_id = self.cache.unregister(id);
        if update_id.is_some() {
            self.protocol.local_changed().await;
        }
        Ok(update_id)
    }

    pub async fn browse(&self, network: &str, template: &str) -> MsdResult<Vec<Service>> {
        self.protocol.browse(network, &Template::parse(template)).await
    }

    pub async fn use_service(&self, service_id: &str, owner: &str) -> MsdResult<Connection> {
        self.protocol.use_service(service_id, owner).await
    }

    /// `use_service` exposed as a byte stream, buffered per
    /// `limits.stream_buffer`
    pub async fn use_service_stream(
        &self,
        service_id: &str,
        owner: &str,
    ) -> MsdResult<(ReadHalf<DuplexStream>, WriteHalf<DuplexStream>)> {
        let connection = self.use_service(service_id, owner).await?;
        Ok(connection_to_streams(connection, self.config.limits.stream_buffer))
    }

    pub fn register_use_handler(&self, service_id: &str, handler: Arc<dyn UseHandler>) {
        self.protocol.register_use_handler(service_id, handler);
    }

    /// Register before `start`: proxies run when this node becomes leader
    pub fn register_proxy(&self, proxy: Arc<dyn DiscoveryProxy>) {
        self.protocol.register_proxy(proxy);
    }

    pub fn services(&self) -> Vec<Service> {
        self.cache.services()
    }

    // ------------------------------------------------------------------------
    // ACCESSORS
    // ------------------------------------------------------------------------

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<dyn KeyingService> {
        &self.keys
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<RouterManager> {
        &self.router
    }

    pub fn protocol(&self) -> &Arc<MessageManager> {
        &self.protocol
    }

    pub fn network(&self, name: &str) -> Option<Arc<NetworkManager>> {
        self.router.network(name)
    }

    pub fn level(&self, network: &str) -> Option<Level> {
        self.protocol.level(network)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.protocol.subscribe()
    }
}

impl std::fmt::Debug for Msd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msd")
            .field("node_id", &self.config.node_id)
            .field("networks", &self.networks)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
