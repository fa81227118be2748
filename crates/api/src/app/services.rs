use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use docket_infra::webhook::WebhookDispatcher;
use docket_infra::{
    BlobStore, Config, DocumentWorker, InMemoryBlobStore, InMemoryBroker, InMemoryMetadataStore,
    MetadataStore, Scheduler, StatusProjection, UpstreamClient, WorkBroker,
};

#[cfg(feature = "persistent")]
use docket_infra::{metadata_store::PostgresMetadataStore, broker::RedisStreamsBroker};
#[cfg(feature = "persistent")]
use sqlx::PgPool;

use docket_infra::upstream::HttpUpstreamClient;

/// Everything the handlers and workers share. Built once at startup; tests
/// build it with scripted components instead.
pub struct AppServices {
    config: Arc<Config>,
    store: Arc<dyn MetadataStore>,
    blob_store: Arc<dyn BlobStore>,
    upstream: Arc<dyn UpstreamClient>,
    broker: Arc<dyn WorkBroker>,
    dispatcher: Arc<WebhookDispatcher>,
    scheduler: Scheduler,
    projection: StatusProjection,
    shutdown: Arc<AtomicBool>,
}

impl AppServices {
    /// Wire services from explicit components. This is the only constructor
    /// with logic; `build_services` merely chooses the components.
    pub fn with_components(
        config: Arc<Config>,
        store: Arc<dyn MetadataStore>,
        blob_store: Arc<dyn BlobStore>,
        upstream: Arc<dyn UpstreamClient>,
        broker: Arc<dyn WorkBroker>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(
            WebhookDispatcher::new(
                config.webhook_attempts,
                config.webhook_backoff,
                config.webhook_timeout,
                config.require_https_webhooks(),
            )
            .expect("webhook HTTP client construction cannot fail with static options"),
        );

        let scheduler = Scheduler::new(
            store.clone(),
            upstream.clone(),
            broker.clone(),
            blob_store.clone(),
            config.clone(),
        );
        let projection =
            StatusProjection::new(store.clone(), blob_store.clone(), config.presign_ttl);

        Arc::new(Self {
            config,
            store,
            blob_store,
            upstream,
            broker,
            dispatcher,
            scheduler,
            projection,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the worker pool consuming the broker. Idempotent per process
    /// lifetime; workers run until `stop_workers`.
    pub fn spawn_workers(self: &Arc<Self>) {
        for _ in 0..self.config.worker_count.max(1) {
            let worker = DocumentWorker::new(
                self.store.clone(),
                self.blob_store.clone(),
                self.upstream.clone(),
                self.broker.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
            );
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { worker.run_loop(shutdown).await });
        }
        tracing::info!(count = self.config.worker_count.max(1), "workers started");
    }

    pub fn stop_workers(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn projection(&self) -> &StatusProjection {
        &self.projection
    }

    pub fn dispatcher(&self) -> &Arc<WebhookDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }
}

/// Default wiring: HTTP upstream client plus in-memory storage/broker, or the
/// persistent tier (Postgres + Redis Streams) when the feature is enabled and
/// requested via `USE_PERSISTENT_STORES=true`.
pub async fn build_services(config: Arc<Config>) -> Arc<AppServices> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "persistent")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "persistent"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but persistent feature not enabled, falling back to in-memory"
            );
        }
    }

    build_in_memory_services(config)
}

fn build_upstream(config: &Config) -> Arc<dyn UpstreamClient> {
    Arc::new(
        HttpUpstreamClient::new(
            config.upstream_base_url.clone(),
            config.upstream_token.clone(),
            config.upstream_timeout,
        )
        .expect("upstream HTTP client construction cannot fail with static options"),
    )
}

fn build_in_memory_services(config: Arc<Config>) -> Arc<AppServices> {
    // In-memory infra wiring (dev/test): store + broker + blob store.
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let blob_store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let broker: Arc<dyn WorkBroker> =
        Arc::new(InMemoryBroker::new(config.broker_visibility_timeout));
    let upstream = build_upstream(&config);

    AppServices::with_components(config, store, blob_store, upstream, broker)
}

#[cfg(feature = "persistent")]
async fn build_persistent_services(config: Arc<Config>) -> Arc<AppServices> {
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");
    let store: Arc<dyn MetadataStore> = Arc::new(PostgresMetadataStore::new(pool));

    let broker: Arc<dyn WorkBroker> = Arc::new(
        RedisStreamsBroker::connect(&redis_url, config.broker_visibility_timeout)
            .await
            .expect("Failed to create Redis Streams broker"),
    );

    // Blob storage stays behind the seam; deployments plug their object-store
    // adapter in here.
    let blob_store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let upstream = build_upstream(&config);

    AppServices::with_components(config, store, blob_store, upstream, broker)
}
