//! # relayd: webhook delivery service
//!
//! Hosts the [`relay`] engine behind an HTTP API. One process runs:
//!
//! - the tenant API (`/v1/events`, `/v1/tenants/me`) authenticated by per-tenant API keys
//! - operator routes (`POST /v1/tenants`, `/v1/admin/*`) guarded by `admin_api_key`
//! - the delivery [`relay::Worker`] polling the delivery queue
//! - a retention sweeper purging expired events
//! - optionally, a reference receiver at `/receiver/{tenant_id}/webhook`
//!
//! State lives either in process memory (`database.type: in_memory`) or in PostgreSQL
//! (`database.type: external`), where events, tenants and both queues share one
//! database.
//!
//! ## Lifecycle
//!
//! 1. **Create**: [`Application::new`] builds the backend, runs migrations and starts
//!    background services
//! 2. **Serve**: [`Application::serve`] binds to the configured address
//! 3. **Shutdown**: once the shutdown future resolves, in-flight requests drain, background
//!    tasks are cancelled and awaited, and telemetry is flushed

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod retention;
pub mod telemetry;

#[cfg(test)]
mod test;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::{get, post},
};
use bon::Builder;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relay::http::ReqwestHttpClient;
use relay::queue::{InMemoryQueue, PostgresQueue};
use relay::store::{InMemoryEventStore, InMemoryTenantStore, PostgresEventStore, PostgresTenantStore};
use relay::{
    DeliveryClient, DeliverySwitch, EventStore, IngestionGateway, MessageQueue, RetryController, TenantConfigStore,
    TenantIdentityStore, TenantRegistry, Worker,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

pub use config::Config;
use config::{DatabaseConfig, PoolSettings};

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .events(events)
///     .tenant_configs(tenants.clone())
///     .identities(tenants.clone())
///     .tenants(tenants)
///     .gateway(gateway)
///     .retries(retries)
///     .switch(switch)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub events: Arc<dyn EventStore>,
    pub tenant_configs: Arc<dyn TenantConfigStore>,
    pub identities: Arc<dyn TenantIdentityStore>,
    pub tenants: Arc<dyn TenantRegistry>,
    pub gateway: IngestionGateway,
    pub retries: RetryController,
    pub switch: DeliverySwitch,
    pub metrics: Option<PrometheusHandle>,
}

/// Stores and queues for one deployment.
#[derive(Clone)]
pub struct Backends {
    pub events: Arc<dyn EventStore>,
    pub tenant_configs: Arc<dyn TenantConfigStore>,
    pub identities: Arc<dyn TenantIdentityStore>,
    pub tenants: Arc<dyn TenantRegistry>,
    pub queue: Arc<dyn MessageQueue>,
    pub dead_letters: Arc<dyn MessageQueue>,
    pool: Option<PgPool>,
}

impl Backends {
    /// Build the backend `config.database` selects, running migrations for PostgreSQL.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        match &config.database {
            DatabaseConfig::InMemory => {
                info!("Using in-memory stores and queues; state is lost on restart");
                Ok(Self::in_memory(config))
            }
            DatabaseConfig::External { url, pool } => {
                let pool = connect(url, pool).await?;
                relay::migrator().run(&pool).await?;
                info!("Database migrations applied");
                Ok(Self::postgres(config, pool))
            }
        }
    }

    pub fn in_memory(config: &Config) -> Self {
        let events = InMemoryEventStore::new().with_retention(config.retention.event_ttl);
        let tenants = InMemoryTenantStore::new();
        let policy = config.queue.policy();
        let dead_letters = InMemoryQueue::new(config.queue.dead_letter_name.clone(), policy);
        let queue = InMemoryQueue::new(config.queue.name.clone(), policy)
            .with_dead_letter(dead_letters.clone(), config.queue.max_receive_count);

        Self {
            events: Arc::new(events),
            tenant_configs: Arc::new(tenants.clone()),
            identities: Arc::new(tenants.clone()),
            tenants: Arc::new(tenants),
            queue: Arc::new(queue),
            dead_letters: Arc::new(dead_letters),
            pool: None,
        }
    }

    pub fn postgres(config: &Config, pool: PgPool) -> Self {
        let policy = config.queue.policy();
        let events = PostgresEventStore::new(pool.clone()).with_retention(config.retention.event_ttl);
        let tenants = PostgresTenantStore::new(pool.clone());
        let queue = PostgresQueue::new(pool.clone(), config.queue.name.clone(), policy)
            .with_dead_letter(config.queue.dead_letter_name.clone(), config.queue.max_receive_count);
        let dead_letters = PostgresQueue::new(pool.clone(), config.queue.dead_letter_name.clone(), policy);

        Self {
            events: Arc::new(events),
            tenant_configs: Arc::new(tenants.clone()),
            identities: Arc::new(tenants.clone()),
            tenants: Arc::new(tenants),
            queue: Arc::new(queue),
            dead_letters: Arc::new(dead_letters),
            pool: Some(pool),
        }
    }
}

async fn connect(url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(optional(settings.idle_timeout_secs))
        .max_lifetime(optional(settings.max_lifetime_secs))
        .connect(url)
        .await?;
    Ok(pool)
}

/// Install the global Prometheus recorder once and return its handle.
pub fn get_or_install_prometheus_handle() -> anyhow::Result<PrometheusHandle> {
    static HANDLE: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();
    HANDLE
        .get_or_init(|| PrometheusBuilder::new().install_recorder().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {e}"))
}

/// Build the request-handling state for `backends`.
pub fn build_state(config: Config, backends: &Backends, switch: DeliverySwitch) -> anyhow::Result<AppState> {
    let metrics = if config.enable_metrics {
        Some(get_or_install_prometheus_handle()?)
    } else {
        None
    };

    Ok(AppState::builder()
        .gateway(IngestionGateway::new(
            backends.events.clone(),
            backends.queue.clone(),
            switch.clone(),
        ))
        .retries(RetryController::new(
            backends.events.clone(),
            backends.queue.clone(),
            backends.dead_letters.clone(),
        ))
        .events(backends.events.clone())
        .tenant_configs(backends.tenant_configs.clone())
        .identities(backends.identities.clone())
        .tenants(backends.tenants.clone())
        .switch(switch)
        .maybe_metrics(metrics)
        .config(config)
        .build())
}

pub fn build_router(state: AppState) -> Router {
    use api::handlers::{admin, events, receiver, tenants};

    let mut router = Router::new()
        .route("/v1/events", post(events::create_event).get(events::list_events))
        .route("/v1/events/{event_id}", get(events::get_event))
        .route("/v1/events/{event_id}/retry", post(events::retry_event))
        .route("/v1/tenants", post(tenants::create_tenant))
        .route(
            "/v1/tenants/me",
            get(tenants::get_current_tenant).patch(tenants::update_current_tenant),
        )
        .route("/v1/admin/dead-letters/requeue", post(admin::requeue_dead_letters))
        .route(
            "/v1/admin/delivery",
            get(admin::get_delivery_state).put(admin::set_delivery_state),
        )
        .route("/healthz", get(admin::healthz));

    if state.config.receiver.enabled {
        router = router.route("/receiver/{tenant_id}/webhook", post(receiver::receive_webhook));
    }
    if state.metrics.is_some() {
        router = router.route("/internal/metrics", get(render_metrics));
    }

    router.with_state(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body)
}

/// Background tasks and the token that stops them.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Start the delivery worker and retention sweeper.
fn setup_background_services(
    config: &Config,
    backends: &Backends,
    switch: DeliverySwitch,
    shutdown_token: CancellationToken,
) -> anyhow::Result<BackgroundServices> {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.worker.enabled {
        let http = ReqwestHttpClient::new()?;
        let delivery = DeliveryClient::new(Arc::new(http), switch)
            .with_timeout(config.delivery.timeout)
            .with_signature_header(config.delivery.signature_header.clone());
        let worker = Worker::new(
            backends.events.clone(),
            backends.tenant_configs.clone(),
            backends.queue.clone(),
            delivery,
            relay::WorkerConfig::from(&config.worker),
        );
        let worker_shutdown = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move { worker.run(worker_shutdown).await }));
    } else {
        info!("Delivery worker disabled");
    }

    background_tasks.push(tokio::spawn(retention::run_retention_sweeper(
        backends.events.clone(),
        config.retention.sweep_interval,
        shutdown_token.clone(),
    )));

    Ok(BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    })
}

pub struct Application {
    router: Router,
    config: Config,
    backends: Backends,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting relayd with configuration: {:#?}", config);

        let backends = Backends::from_config(&config).await?;
        let switch = DeliverySwitch::new(config.delivery.enabled);

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(&config, &backends, switch.clone(), shutdown_token)?;

        let state = build_state(config.clone(), &backends, switch)?;
        let router = build_router(state);

        Ok(Self {
            router,
            config,
            backends,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("relayd listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        if let Some(pool) = self.backends.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        telemetry::shutdown_telemetry();
        Ok(())
    }
}
