use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_api::config::Config;
use realtime_api::db::conversations::{ConversationStore, MemoryConversationStore};
use realtime_api::gateway::presence::PresenceHub;
use realtime_api::gateway::scoped::{ChatHub, TypingHub};
use realtime_api::gateway::service::HubService;
use realtime_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let settings = config.hub_settings();

    let service = HubService::new(
        ChatHub::spawn(settings),
        TypingHub::spawn(settings),
        PresenceHub::spawn(settings),
    );

    // Conversations are owned elsewhere; until that service is wired in, the
    // in-memory store stands in for it.
    let conversations: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());

    tracing::info!(
        queue_capacity = settings.queue_capacity,
        pong_wait_secs = settings.pong_wait.as_secs(),
        "realtime-api configured"
    );

    let state = AppState {
        config: Arc::new(config),
        conversations,
        service: service.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(realtime_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realtime-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await
        .expect("server error");
}

/// Resolves on SIGINT or SIGTERM, after every hub has closed its sockets.
async fn shutdown_signal(service: HubService) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, closing realtime hubs");
    service.shutdown().await;
}
