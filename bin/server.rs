// Sales Sync - Receive Server
// The ERP side pushes payloads here; reads serve the same store the CLI writes.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sales_sync::{
    get_sales_order_lines, list_sales_orders, open_database, outstanding_by_salesman,
    recent_events, ApiSource, FatalError, FeedKind, Orchestrator, PassReport, SalesmanMapper,
    SyncConfig, SyncPass,
};

#[derive(Parser, Debug)]
#[command(name = "sales-sync-server")]
#[command(about = "HTTP endpoint for ERP pushes and store queries")]
struct Args {
    /// JSON config file
    #[arg(long, env = "SALES_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overrides the config file
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:3000", env = "SALES_SYNC_LISTEN")]
    listen: SocketAddr,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<SyncConfig>,
    mapper: Arc<SalesmanMapper>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

struct ApiError(StatusCode, String);

impl ApiError {
    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("request failed: {}", err);
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            data: (),
            error: Some(self.1),
        };
        (self.0, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn lock_db(state: &AppState) -> Result<MutexGuard<'_, Connection>, ApiError> {
    state
        .db
        .lock()
        .map_err(|_| ApiError::internal("database lock poisoned"))
}

/// No key configured means the endpoint is open (local setups).
fn authorized(expected: Option<&str>, given: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => given == Some(expected),
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(sales_sync::VERSION))
}

#[derive(Deserialize)]
struct PushRequest {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    close_missing_open: bool,
    #[serde(default)]
    replace_all: bool,
}

/// Bad input is the caller's problem; anything else is ours.
fn fatal_status(fatal: &FatalError) -> StatusCode {
    match fatal.kind {
        "schema" => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /api/sync/:feed - Reconcile a pushed ERP payload
async fn push_feed(
    State(state): State<AppState>,
    Path(feed): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> ApiResult<PassReport> {
    let given = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or(request.api_key.as_deref());
    if !authorized(state.config.api_key.as_deref(), given) {
        tracing::warn!(feed = %feed, "rejected push with bad api key");
        return Err(ApiError(StatusCode::UNAUTHORIZED, "invalid api key".to_string()));
    }

    let feed: FeedKind = feed
        .parse()
        .map_err(|e: String| ApiError(StatusCode::BAD_REQUEST, e))?;

    let PushRequest {
        records,
        close_missing_open,
        replace_all,
        ..
    } = request;
    tracing::info!(feed = %feed, records = records.len(), "push received");

    let report = tokio::task::spawn_blocking(move || -> Result<PassReport, ApiError> {
        let source = ApiSource::new(feed, records).with_origin(format!("push /api/sync/{}", feed));
        let mut pass = SyncPass::new(feed.code(), Box::new(source));
        if close_missing_open {
            pass = pass.closing_missing_open();
        }
        if replace_all {
            pass = pass.replacing_all();
        }

        let mut conn = lock_db(&state)?;
        let result = Orchestrator::new(&mut conn, &state.mapper)
            .with_actor("receive-server")
            .run_one(pass);
        result.map_err(|fatal| ApiError(fatal_status(&fatal), fatal.message))
    })
    .await
    .map_err(ApiError::internal)??;

    Ok(Json(ApiResponse::ok(report)))
}

#[derive(Deserialize)]
struct ScopeQuery {
    #[serde(default)]
    user: String,
    #[serde(default)]
    admin: bool,
}

/// GET /api/sales-orders - Orders visible to ?user (or all for ?admin=true)
async fn get_sales_orders(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Vec<sales_sync::SalesOrderSummary>> {
    let filter = state.config.scope().filter_for(&scope.user, scope.admin);
    let conn = lock_db(&state)?;
    let orders = list_sales_orders(&conn, &filter).map_err(ApiError::internal)?;
    Ok(Json(ApiResponse::ok(orders)))
}

/// GET /api/sales-orders/:so_number/lines
async fn get_order_lines(
    State(state): State<AppState>,
    Path(so_number): Path<String>,
) -> ApiResult<Vec<sales_sync::SalesOrderLine>> {
    let conn = lock_db(&state)?;
    let lines = get_sales_order_lines(&conn, &so_number).map_err(ApiError::internal)?;
    Ok(Json(ApiResponse::ok(lines)))
}

/// GET /api/outstanding - Outstanding totals per salesman
async fn get_outstanding(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Vec<sales_sync::SalesmanOutstanding>> {
    let filter = state.config.scope().filter_for(&scope.user, scope.admin);
    let conn = lock_db(&state)?;
    let totals = outstanding_by_salesman(&conn, &filter).map_err(ApiError::internal)?;
    Ok(Json(ApiResponse::ok(totals)))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /api/events - Recent sync events
async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<sales_sync::Event>> {
    let conn = lock_db(&state)?;
    let events = recent_events(&conn, query.limit).map_err(ApiError::internal)?;
    Ok(Json(ApiResponse::ok(events)))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sales_sync=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    println!("🌐 Sales Sync - Receive Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if config.api_key.is_none() {
        tracing::warn!("no api_key configured; /api/sync accepts unauthenticated pushes");
    }

    let conn = open_database(&config.database_path)?;
    println!("✓ Database opened: {:?}", config.database_path);

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        mapper: Arc::new(config.mapper()),
        config: Arc::new(config),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sync/:feed", post(push_feed))
        .route("/sales-orders", get(get_sales_orders))
        .route("/sales-orders/:so_number/lines", get(get_order_lines))
        .route("/outstanding", get(get_outstanding))
        .route("/events", get(get_events))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(args.listen).await?;

    println!("\n🚀 Server running on http://{}", args.listen);
    println!("   Push:  POST /api/sync/<feed>");
    println!("   Query: GET  /api/sales-orders?user=<name>");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_check() {
        assert!(authorized(None, None));
        assert!(authorized(Some("k"), Some("k")));
        assert!(!authorized(Some("k"), None));
        assert!(!authorized(Some("k"), Some("other")));
    }

    #[test]
    fn test_fatal_status_by_kind() {
        let fatal = |kind| FatalError {
            pass: "sales_orders".to_string(),
            kind,
            message: "boom".to_string(),
        };
        assert_eq!(fatal_status(&fatal("schema")), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(fatal_status(&fatal("structural")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
