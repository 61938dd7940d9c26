//! The HTTP edge server (§4.5.1): read-only `/state.json`, and static file
//! serving for `/overlay` and `/assets` with a user-data-then-bundled-default
//! fallback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;

use crate::assets::AssetResolver;
use crate::paths::Paths;
use crate::registry::{ChannelView, Counts, Registry, UnknownUserView, UserView};
use crate::session::Session;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Mutex<Registry>>,
    pub session: Arc<Session>,
    pub assets: AssetResolver,
}

#[derive(Debug, Serialize)]
struct ServerJson {
    schandlerid: Option<i64>,
    current_channel_id: Option<i64>,
    current_channel_name: Option<String>,
    target_channel_id: Option<i64>,
    target_channel_name: Option<String>,
    target_channel_active: bool,
}

#[derive(Debug, Serialize)]
struct BotJson {
    clid: Option<String>,
    uid: Option<String>,
    nickname: Option<String>,
    channel_id: Option<i64>,
    channel_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct StateJson {
    ts: f64,
    server: ServerJson,
    bot: BotJson,
    counts: Counts,
    users: Vec<UserView>,
    unknown_users: Vec<UnknownUserView>,
    channels: Vec<ChannelView>,
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Builds the `/state.json` body; shared with the control socket's
/// `dump-state` command so both surfaces stay byte-for-byte identical.
pub(crate) fn build_state_json(registry: &Registry, assets: &AssetResolver) -> serde_json::Value {
    let body = StateJson {
        ts: epoch_seconds(),
        server: ServerJson {
            schandlerid: registry.self_identity.schandlerid,
            current_channel_id: registry.self_identity.channel_id,
            current_channel_name: registry.current_channel_name(),
            target_channel_id: registry.config.policies.target_channel,
            target_channel_name: registry.config.policies.target_channel_name.clone(),
            target_channel_active: registry.target_channel_active(),
        },
        bot: BotJson {
            clid: registry.self_identity.clid.clone(),
            uid: registry.self_identity.uid.clone(),
            nickname: registry.self_identity.nickname.clone(),
            channel_id: registry.self_identity.channel_id,
            channel_name: registry.current_channel_name(),
        },
        counts: registry.counts(),
        users: registry.build_users(assets),
        unknown_users: registry.build_unknown_users(),
        channels: registry.channels(),
    };
    serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
}

async fn state_json(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.lock().await;
    Json(build_state_json(&registry, &state.assets))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// No caching headers, no keep-alive: matches §4.5.1's bare HTTP contract.
async fn close_connection(req: axum::extract::Request, next: Next) -> AxumResponse {
    let mut resp = next.run(req).await;
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}

pub fn build_router(state: AppState, paths: &Paths) -> Router {
    let overlay = ServeDir::new(&paths.user_overlay_dir)
        .append_index_html_on_directories(true)
        .fallback(ServeDir::new(&paths.default_overlay_dir).append_index_html_on_directories(true));
    let assets = ServeDir::new(&paths.user_assets_dir)
        .fallback(ServeDir::new(&paths.default_assets_dir));

    Router::new()
        .route("/state.json", get(state_json))
        .nest_service("/overlay", overlay)
        .nest_service("/assets", assets)
        .fallback(not_found)
        .layer(middleware::from_fn(close_connection))
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    paths: Paths,
    addr: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let router = build_router(state, &paths);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use voicebridge_config::PersistedConfig;

    fn test_state() -> (AppState, Paths, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::new(PersistedConfig::default(), tmp.path().join("config.json"));
        let paths = Paths {
            config_path: tmp.path().join("config.json"),
            api_key_path: tmp.path().join("apikey"),
            user_assets_dir: tmp.path().join("assets"),
            default_assets_dir: tmp.path().join("defaults/assets"),
            user_overlay_dir: tmp.path().join("overlay"),
            default_overlay_dir: tmp.path().join("defaults/overlay"),
            control_socket_path: tmp.path().join("voicebridge.sock"),
        };
        std::fs::create_dir_all(&paths.user_overlay_dir).unwrap();
        std::fs::write(paths.user_overlay_dir.join("index.html"), "hello overlay").unwrap();
        let assets = AssetResolver::new(paths.user_assets_dir.clone(), paths.default_assets_dir.clone());
        let state = AppState {
            registry: Arc::new(Mutex::new(registry)),
            session: Session::new(),
            assets,
        };
        (state, paths, tmp)
    }

    #[tokio::test]
    async fn state_json_returns_empty_snapshot_cold_start() {
        let (state, paths, _tmp) = test_state();
        let router = build_router(state, &paths);
        let resp = router
            .oneshot(Request::get("/state.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["ts"].as_f64().unwrap() > 0.0);
        assert!(json["server"]["schandlerid"].is_null());
        assert_eq!(json["users"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn non_get_state_json_is_405() {
        let (state, paths, _tmp) = test_state();
        let router = build_router(state, &paths);
        let resp = router
            .oneshot(Request::post("/state.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (state, paths, _tmp) = test_state();
        let router = build_router(state, &paths);
        let resp = router
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn overlay_root_serves_index_html() {
        let (state, paths, _tmp) = test_state();
        let router = build_router(state, &paths);
        let resp = router
            .oneshot(Request::get("/overlay/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn responses_carry_connection_close() {
        let (state, paths, _tmp) = test_state();
        let router = build_router(state, &paths);
        let resp = router
            .oneshot(Request::get("/state.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.headers().get(header::CONNECTION).unwrap(), "close");
    }
}
