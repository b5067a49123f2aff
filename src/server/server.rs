use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_port::*;
use crate::infra_memory::*;
use crate::infra_mysql::*;
use crate::infra_nats::*;
use crate::infra_redis::*;
use crate::logger::*;
use crate::server::*;
use crate::settings::Settings;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How session cookies are scoped, and whether identity is mandatory.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub enabled: bool,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cors_origin: String,
}

/// Capability adapters selected by configuration.
pub struct Backends {
    pub bus: Arc<dyn MessageBus>,
    pub store: Option<Arc<dyn Store>>,
    pub presence: Option<Arc<dyn Presence>>,
}

impl Backends {
    /// Everything in process memory.
    pub fn in_memory() -> Self {
        Self {
            bus: Arc::new(MemoryBus::new()),
            store: Some(Arc::new(MemoryStore::new())),
            presence: Some(Arc::new(MemoryPresence::new())),
        }
    }

    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let bus: Arc<dyn MessageBus> = match settings.bus.backend.as_str() {
            "nats" => Arc::new(
                NatsBus::connect(&NatsConfig {
                    url: settings.bus.url.clone(),
                    name: settings.bus.name.clone(),
                    connect_timeout_secs: settings.bus.connect_timeout_secs,
                })
                .await?,
            ),
            "memory" => Arc::new(MemoryBus::new()),
            other => return Err(anyhow::anyhow!("Unknown bus backend: {}", other)),
        };

        let store_cfg = &settings.store;
        let store: Option<Arc<dyn Store>> = match store_cfg.backend.as_str() {
            "mysql" => {
                let store = connect_with_retry(
                    "mysql",
                    store_cfg.connect_attempts,
                    Duration::from_millis(store_cfg.connect_delay_ms),
                    || MySqlStore::connect(&store_cfg.dsn),
                )
                .await?;
                Some(Arc::new(store))
            }
            "memory" => Some(Arc::new(MemoryStore::new())),
            "none" => None,
            other => return Err(anyhow::anyhow!("Unknown store backend: {}", other)),
        };

        let presence_cfg = &settings.presence;
        let presence: Option<Arc<dyn Presence>> = match presence_cfg.backend.as_str() {
            "redis" => {
                let presence = connect_with_retry(
                    "redis",
                    presence_cfg.connect_attempts,
                    Duration::from_millis(presence_cfg.connect_delay_ms),
                    || RedisPresence::connect(&presence_cfg.url, presence_cfg.key_prefix.clone()),
                )
                .await?;
                Some(Arc::new(presence))
            }
            "memory" => Some(Arc::new(MemoryPresence::new())),
            "none" => None,
            other => return Err(anyhow::anyhow!("Unknown presence backend: {}", other)),
        };

        Ok(Self {
            bus,
            store,
            presence,
        })
    }
}

async fn connect_with_retry<T, E, F, Fut>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut connect: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(conn) => {
                info!(what, attempt, "connected");
                return Ok(conn);
            }
            Err(e) if attempt < attempts => {
                warn!(what, attempt, "connect failed: {}", e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "{} unreachable after {} attempts: {}",
                    what,
                    attempts,
                    e
                ));
            }
        }
    }
}

pub struct Server {
    pub sessions: Arc<dyn SessionService>,
    pub store: Option<Arc<dyn Store>>,
    pub bus: Arc<dyn MessageBus>,
    pub tasks: Arc<dyn TaskQueue>,
    pub bridge: Arc<RealtimeBridge>,
    pub rate_limiter: Arc<RateLimiter>,
    pub policy: AuthPolicy,
    pub metrics: Option<PrometheusHandle>,
    pool: Arc<PersistencePool>,
    cancel: CancellationToken,
}

impl Server {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let backends = Backends::connect(settings).await?;
        Self::with_backends(settings, backends)
    }

    /// Wires services over already connected adapters. Must run inside a
    /// tokio runtime: the persistence workers are spawned here.
    pub fn with_backends(settings: &Settings, backends: Backends) -> anyhow::Result<Self> {
        let auth = &settings.auth;
        if auth.access_secret.is_empty() {
            return Err(anyhow::anyhow!("auth.access_secret must not be empty"));
        }

        let origin: warp::http::Uri = auth.cors_origin.parse()?;
        if origin.scheme().is_none() || origin.host().is_none() {
            return Err(anyhow::anyhow!(
                "auth.cors_origin must be an absolute origin: {:?}",
                auth.cors_origin
            ));
        }

        let cancel = CancellationToken::new();
        let pool = Arc::new(PersistencePool::new(settings.persistence.queue_capacity));
        match &backends.store {
            Some(store) => pool.start(cancel.clone(), store.clone(), settings.persistence.workers),
            None => warn!("no store configured, persistence disabled"),
        }
        let tasks: Arc<dyn TaskQueue> = pool.clone();

        let sessions: Arc<dyn SessionService> = Arc::new(
            JwtSessionService::new(
                JwtConfig {
                    access_secret: auth.access_secret.as_bytes().to_vec(),
                    refresh_secret: auth.refresh_secret().as_bytes().to_vec(),
                    access_ttl: Duration::from_secs(auth.access_ttl_secs),
                    refresh_ttl: Duration::from_secs(auth.refresh_ttl_secs),
                },
                backends.store.clone(),
            )
            .with_deferred_writes(tasks.clone()),
        );

        let rate_limiter = Arc::new(RateLimiter::new(
            settings.rate_limit.rate_per_sec,
            settings.rate_limit.burst,
        ));
        rate_limiter.set_enabled(settings.rate_limit.enabled);

        let bridge = Arc::new(RealtimeBridge::new(
            backends.bus.clone(),
            backends.store.clone(),
            backends.presence,
            tasks.clone(),
            BridgeConfig::default(),
        ));

        let policy = AuthPolicy {
            enabled: auth.enabled,
            cookie_domain: Some(auth.cookie_domain.clone()).filter(|d| !d.is_empty()),
            cookie_secure: auth.cookie_secure,
            cors_origin: auth.cors_origin.clone(),
        };

        info!(?policy, "server started");

        Ok(Self {
            sessions,
            store: backends.store,
            bus: backends.bus,
            tasks,
            bridge,
            rate_limiter,
            policy,
            metrics: None,
            pool,
            cancel,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Closes streaming connections, drains queued persistence work and
    /// releases the store.
    pub async fn shutdown(&self) {
        info!("server shutting down...");

        self.bridge.shutdown();
        self.pool.shutdown().await;
        if let Some(store) = &self.store {
            store.close().await;
        }
    }

    /// Stops persistence workers without draining the queue.
    pub fn abort(&self) {
        warn!("server aborting, queued persistence work dropped");
        self.cancel.cancel();
    }
}
