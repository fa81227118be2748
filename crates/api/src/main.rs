use std::sync::Arc;

#[tokio::main]
async fn main() {
    docket_observability::init();

    let config = Arc::new(docket_infra::Config::from_env());
    let services = docket_api::app::services::build_services(config.clone()).await;
    services.spawn_workers();

    let app = docket_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.bind_addr));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
