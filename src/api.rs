use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use crate::config::Config;
use crate::error::PortfolioError;
use crate::updater::PortfolioUpdater;
use tracing::{info, warn};
use tower_http::cors::{CorsLayer, Any};

pub const SECRET_HEADER: &str = "x-update-secret";

/// Who may trigger an update run.
#[derive(Debug, Clone, Default)]
pub struct TriggerAuth {
    pub secret: Option<String>,
    /// Only consulted when no secret is configured.
    pub allow_anonymous: bool,
    /// Peer addresses that may trigger without the secret. Matched against
    /// the TCP peer, never a request header.
    pub allowed_callers: Vec<IpAddr>,
}

impl TriggerAuth {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            secret: cfg.update_secret.clone(),
            allow_anonymous: cfg.allow_anonymous_trigger,
            allowed_callers: cfg.allowed_callers.clone(),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> bool {
        if peer.is_some_and(|ip| self.allowed_callers.contains(&ip)) {
            return true;
        }

        let Some(secret) = &self.secret else {
            return self.allow_anonymous;
        };
        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|h| h.strip_prefix("Bearer "))
                    .map(str::to_string)
            });
        presented.as_deref() == Some(secret.as_str())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub updater: Arc<PortfolioUpdater>,
    pub auth: Arc<TriggerAuth>,
}

impl AppState {
    pub fn new(updater: Arc<PortfolioUpdater>, auth: TriggerAuth) -> Self {
        Self {
            updater,
            auth: Arc::new(auth),
        }
    }
}

/// Failure body shared by every route: `{ok: false, error}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub ok: bool,
    pub error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            ok: false,
            error: error.into(),
        }
    }
}

impl From<PortfolioError> for ApiError {
    fn from(e: PortfolioError) -> Self {
        let status = match e {
            PortfolioError::UpdateInProgress => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

pub async fn authorize_update(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if !state.auth.authorize(req.headers(), peer) {
        warn!("🚫 Rejected update trigger from {:?}", peer);
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }
    Ok(next.run(req).await)
}

async fn index() -> Json<Value> {
    Json(json!({
        "name": "Portfolio API",
        "description": "Aggregated on-chain portfolio across wallets, chains and DeFi protocols",
        "status": "ok",
        "endpoints": {
            "GET /health": "Health check.",
            "GET /api/portfolio": "Latest stored portfolio snapshot.",
            "GET /api/portfolio/history": "Daily portfolio summaries.",
            "POST /api/portfolio/update": "Refresh the portfolio from chain and price data.",
        }
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "message": "Server is running" }))
}

fn raw_json(raw: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], raw).into_response()
}

async fn get_portfolio(State(state): State<AppState>) -> Result<Response, ApiError> {
    let raw = state.updater.store().read_raw().await?;
    Ok(raw_json(raw.unwrap_or_else(|| r#"{"positions":{}}"#.to_string())))
}

async fn get_history(State(state): State<AppState>) -> Result<Response, ApiError> {
    let raw = state.updater.store().read_history_raw().await?;
    Ok(raw_json(raw.unwrap_or_else(|| "{}".to_string())))
}

async fn trigger_update(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("📥 Portfolio update triggered");
    let portfolio = state.updater.update().await?;
    let total = portfolio.total.map(|t| t.value).unwrap_or_default();
    Ok(Json(json!({ "ok": true, "total": total })))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let update = Router::new()
        .route("/api/portfolio/update", get(trigger_update).post(trigger_update))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize_update));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/portfolio", get(get_portfolio))
        .route("/api/portfolio/history", get(get_history))
        .merge(update)
        .with_state(state)
        .layer(cors)
}

pub async fn serve(cfg: Config, state: AppState) -> eyre::Result<()> {
    let app = router(state);

    let addr = SocketAddr::new(cfg.host, cfg.port);
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn open_mode_without_secret() {
        let auth = TriggerAuth { allow_anonymous: true, ..Default::default() };
        assert!(auth.authorize(&HeaderMap::new(), None));

        let closed = TriggerAuth { allow_anonymous: false, ..Default::default() };
        assert!(!closed.authorize(&HeaderMap::new(), None));
    }

    #[test]
    fn secret_via_header_or_bearer() {
        let auth = TriggerAuth { secret: Some("s3cret".into()), allow_anonymous: true, ..Default::default() };
        assert!(auth.authorize(&headers(&[(SECRET_HEADER, "s3cret")]), None));
        assert!(auth.authorize(&headers(&[("authorization", "Bearer s3cret")]), None));
        assert!(!auth.authorize(&headers(&[(SECRET_HEADER, "wrong")]), None));
        assert!(!auth.authorize(&HeaderMap::new(), None));
    }

    #[test]
    fn allow_listed_peer_skips_secret() {
        let cron: IpAddr = "10.0.0.5".parse().unwrap();
        let auth = TriggerAuth {
            secret: Some("s3cret".into()),
            allow_anonymous: false,
            allowed_callers: vec![cron],
        };
        assert!(auth.authorize(&HeaderMap::new(), Some(cron)));
        assert!(!auth.authorize(&HeaderMap::new(), Some("10.0.0.6".parse().unwrap())));
    }

    #[test]
    fn user_agent_cannot_stand_in_for_the_secret() {
        let auth = TriggerAuth {
            secret: Some("s3cret".into()),
            allow_anonymous: true,
            allowed_callers: vec!["10.0.0.5".parse().unwrap()],
        };
        assert!(!auth.authorize(&headers(&[("user-agent", "10.0.0.5")]), None));
    }

    #[test]
    fn conflict_maps_to_409() {
        let err: ApiError = PortfolioError::UpdateInProgress.into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(!err.ok);
    }
}
