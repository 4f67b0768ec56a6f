//! Master registry HTTP service
//!
//! Routes:
//! - `GET    /api/servers`          live sessions, filtered by `gamemode`, `map`, `notfull`, `nopassword`
//! - `POST   /api/servers`          register a session
//! - `PUT    /api/servers/{id}`     heartbeat with optional partial update
//! - `DELETE /api/servers/{id}`     de-register
//! - `POST   /api/invite/create`    issue an invite code
//! - `POST   /api/invite/validate`  redeem an invite code
//! - `GET    /api/stats`            aggregate counts

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, PathRejection, QueryRejection};
use axum::extract::{
    ConnectInfo, DefaultBodyLimit, FromRequest, Path, Query, Request, State,
};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::error::RegistryError;
use super::invite::DEFAULT_INVITE_TTL_MINUTES;
use super::session::{ServerFilter, SessionDescriptor, SessionUpdate};
use super::store::{Registry, RegistryStats, DEFAULT_STALE_AFTER_SECS};

/// Default HTTP port of the master registry
pub const DEFAULT_MASTER_PORT: u16 = 8080;

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Master registry configuration
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub port: u16,
    /// How often stale sessions and dead invites are removed
    pub sweep_interval: Duration,
    /// Sessions without a heartbeat for this long are stale
    pub stale_after: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MASTER_PORT,
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS as u64),
        }
    }
}

/// `POST /api/servers` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub server_id: String,
}

/// `PUT` and `DELETE` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: String,
}

/// `POST /api/invite/create` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvite {
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<String>,
    /// Lifetime in minutes, as a number or a numeric string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
}

/// `POST /api/invite/create` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteCreated {
    pub code: String,
}

/// `POST /api/invite/validate` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateInvite {
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<String>,
}

/// `POST /api/invite/validate` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<SessionDescriptor>,
}

/// The master registry service
pub struct MasterServer {
    config: MasterConfig,
    registry: Arc<Registry>,
}

impl MasterServer {
    pub fn new(config: MasterConfig) -> Self {
        let stale_after = TimeDelta::from_std(config.stale_after)
            .unwrap_or(TimeDelta::seconds(DEFAULT_STALE_AFTER_SECS));
        Self {
            config,
            registry: Arc::new(Registry::new(stale_after)),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Router {
        router(self.registry.clone())
    }

    /// Listen on all interfaces at the configured port
    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await
    }

    /// Serve requests on `listener` and run the sweep until `shutdown` resolves
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.registry.clone();
        let period = self.config.sweep_interval;
        let sweep = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.sweep_at(Utc::now());
                if removed > 0 {
                    debug!("Sweep removed {} stale servers", removed);
                }
            }
        });

        info!("Master server listening on http://{}", listener.local_addr()?);
        let result = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        sweep.abort();
        info!("Master server stopped");
        result
    }
}

/// Build the API router over a shared registry
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route(
            "/api/servers",
            get(list_servers).post(register_server).fallback(not_found),
        )
        .route(
            "/api/servers/{id}",
            put(update_server).delete(remove_server).fallback(not_found),
        )
        .route("/api/invite/create", post(create_invite).fallback(not_found))
        .route("/api/invite/validate", post(validate_invite).fallback(not_found))
        .route("/api/stats", get(stats).fallback(not_found))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(catch_panic))
        .layer(middleware::from_fn(cors))
        .with_state(registry)
}

/// A panicking handler becomes a 500 instead of a dropped connection
async fn catch_panic(request: Request, next: Next) -> Response {
    match tokio::spawn(next.run(request)).await {
        Ok(response) => response,
        Err(e) => RegistryError::Internal(format!("Handler failed: {}", e)).into_response(),
    }
}

/// Permissive CORS on every response; preflight requests stop here
async fn cors(request: Request, next: Next) -> Response {
    debug!("{} {}", request.method(), request.uri().path());

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn not_found() -> RegistryError {
    RegistryError::NotFound("Not found".to_string())
}

async fn list_servers(
    State(registry): State<Arc<Registry>>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Json<Vec<SessionDescriptor>>, RegistryError> {
    let Query(query) = query?;
    Ok(Json(registry.list(&ServerFilter::from_query(&query))))
}

async fn register_server(
    State(registry): State<Arc<Registry>>,
    request: Request,
) -> Result<Json<Registered>, RegistryError> {
    let caller = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_canonical())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let body = Bytes::from_request(request, &()).await?;
    let session: SessionDescriptor = serde_json::from_slice(&body)
        .map_err(|_| RegistryError::InvalidRequest("Invalid server data".to_string()))?;

    let server_id = registry.register(session, caller);
    Ok(Json(Registered { server_id }))
}

async fn update_server(
    State(registry): State<Arc<Registry>>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<StatusReply>, RegistryError> {
    let Path(id) = id?;
    let body = body?;
    // Anything that is not a valid update is a plain heartbeat
    let update = serde_json::from_slice::<SessionUpdate>(&body).ok();
    registry.heartbeat(&id, update.as_ref())?;

    Ok(Json(StatusReply {
        status: "updated".to_string(),
    }))
}

async fn remove_server(
    State(registry): State<Arc<Registry>>,
    id: Result<Path<String>, PathRejection>,
) -> Result<Json<StatusReply>, RegistryError> {
    let Path(id) = id?;
    registry.remove(&id)?;
    Ok(Json(StatusReply {
        status: "removed".to_string(),
    }))
}

async fn create_invite(
    State(registry): State<Arc<Registry>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<InviteCreated>, RegistryError> {
    let body = body?;
    let request: CreateInvite = serde_json::from_slice(&body)
        .map_err(|_| RegistryError::InvalidRequest("Invalid request body".to_string()))?;

    let server_id = request
        .server_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RegistryError::InvalidRequest("serverId required".to_string()))?;
    let ttl_minutes = parse_minutes(request.expires.as_ref())?;

    let code = registry.create_invite(
        &server_id,
        request.steam_id.as_deref().unwrap_or_default(),
        ttl_minutes,
        request.max_uses.unwrap_or(0),
    );
    info!("Invite {} created for {}", code, server_id);
    Ok(Json(InviteCreated { code }))
}

async fn validate_invite(
    State(registry): State<Arc<Registry>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<InviteValidation>, RegistryError> {
    let body = body?;
    let request: ValidateInvite = serde_json::from_slice(&body)
        .map_err(|_| RegistryError::InvalidRequest("Invalid request body".to_string()))?;

    let code = request
        .code
        .ok_or_else(|| RegistryError::InvalidRequest("code required".to_string()))?;

    let server = registry.validate_invite(&code, request.steam_id.as_deref().unwrap_or_default());
    Ok(Json(InviteValidation {
        valid: server.is_some(),
        server,
    }))
}

async fn stats(State(registry): State<Arc<Registry>>) -> Json<RegistryStats> {
    Json(registry.stats())
}

fn parse_minutes(value: Option<&Value>) -> Result<i64, RegistryError> {
    let invalid = || RegistryError::InvalidRequest("expires must be a number of minutes".to_string());
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_INVITE_TTL_MINUTES),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minutes() {
        assert_eq!(parse_minutes(None).unwrap(), 60);
        assert_eq!(parse_minutes(Some(&json!(15))).unwrap(), 15);
        assert_eq!(parse_minutes(Some(&json!("30"))).unwrap(), 30);
        assert!(parse_minutes(Some(&json!("soon"))).is_err());
        assert!(parse_minutes(Some(&json!([1]))).is_err());
    }

    #[test]
    fn test_validation_reply_omits_missing_server() {
        let reply = InviteValidation {
            valid: false,
            server: None,
        };
        assert_eq!(serde_json::to_string(&reply).unwrap(), r#"{"valid":false}"#);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_json_500() {
        async fn explode() -> StatusCode {
            panic!("handler bug")
        }

        let app = Router::new()
            .route("/explode", get(explode))
            .layer(middleware::from_fn(catch_panic));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let response = reqwest::get(format!("http://{}/explode", addr)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "error": "Internal server error" }));

        server.abort();
    }

    #[test]
    fn test_master_config_defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(60));
    }
}
