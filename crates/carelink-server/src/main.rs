use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use carelink_api::middleware::require_auth;
use carelink_api::{AppState, AppStateInner, conversations, messages, participants};
use carelink_gateway::connection;
use carelink_gateway::registry::SessionRegistry;
use carelink_gateway::router::MessageRouter;

#[derive(Clone)]
struct ServerState {
    router: MessageRouter,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carelink=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("CARELINK_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("CARELINK_DB_PATH").unwrap_or_else(|_| "carelink.db".into());
    let host = std::env::var("CARELINK_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CARELINK_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(carelink_store::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let registry = SessionRegistry::new();
    let router = MessageRouter::new(db.clone(), registry);
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        router: router.clone(),
    });

    // Routes: everything is behind the externally issued bearer token; the
    // WebSocket upgrade authenticates itself via the Identify handshake.
    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_read),
        )
        .route("/messages", post(messages::send_message))
        .route("/participants", get(participants::search))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(ServerState {
        router,
        jwt_secret,
    });

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Carelink messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.router, state.jwt_secret)
    })
}
