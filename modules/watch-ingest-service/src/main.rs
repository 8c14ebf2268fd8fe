//! Watch Ingest Service — standalone binary for search-driven ingestion.
//!
//! Hosts the trigger endpoint and watch management RPCs on one port.
//! Default: http://127.0.0.1:9104/

mod db;
mod error;
mod maintenance;
mod normalize;
mod pipeline;
mod routes;
mod scoring;
mod twitter_api;
mod worker;

use routes::AppState;
use std::sync::Arc;
use std::time::Instant;
use twitter_api::{HttpProvider, ProviderConfig, SearchProvider};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let port: u16 = std::env::var("WATCH_INGEST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9104);

    let db_path = std::env::var("WATCH_INGEST_DB_PATH")
        .unwrap_or_else(|_| "./watch_ingest.db".to_string());

    let bearer = std::env::var("TWITTER_BEARER_TOKEN").unwrap_or_default();
    if bearer.is_empty() {
        log::warn!("TWITTER_BEARER_TOKEN not set — search calls will be rejected upstream");
    }

    let provider_config = ProviderConfig {
        bearer,
        search_url: std::env::var("TWEET_SEARCH_URL")
            .unwrap_or_else(|_| "https://api.twitter.com/2/tweets/search/recent".to_string()),
        oembed_url: std::env::var("OEMBED_URL")
            .unwrap_or_else(|_| "https://publish.twitter.com/oembed?url=".to_string()),
        status_url_root: std::env::var("TWITTER_URL_ROOT")
            .unwrap_or_else(|_| "https://twitter.com/".to_string()),
    };

    log::info!("Opening database at: {}", db_path);
    let database = Arc::new(db::Db::open(&db_path).expect("Failed to open database"));

    let provider: Arc<dyn SearchProvider> = Arc::new(HttpProvider::new(provider_config));
    let jobs = worker::spawn_worker(database.clone(), provider.clone());

    let state = Arc::new(AppState {
        db: database,
        provider,
        jobs,
        started: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        .route("/", axum::routing::get(routes::health))
        // Pipeline trigger
        .route(
            "/rpc/watches/run",
            axum::routing::post(routes::watches_run),
        )
        // Watch management
        .route(
            "/rpc/watches/add",
            axum::routing::post(routes::watches_add),
        )
        .route(
            "/rpc/watches/list",
            axum::routing::get(routes::watches_list),
        )
        .route(
            "/rpc/watches/stop",
            axum::routing::post(routes::watches_stop),
        )
        // Service
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", port);
    log::info!("Watch Ingest Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
