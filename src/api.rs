//! HTTP Admin API
//!
//! The enqueue trigger for operators: `POST /collection` accepts a chain id
//! and contract address and feeds the collection queue. Responses carry
//! coarse status codes only; detailed failure reasons live in the persisted
//! documents.

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::is_valid_address;
use crate::queue::{enqueue_collection, EnqueueOverrides};
use crate::store::DocStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state
pub struct ApiState {
    pub store: Arc<dyn DocStore>,
    pub chains: Vec<String>,
    pub queue_cfg: QueueConfig,
}

/// Request body for the enqueue trigger
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub chain_id: String,
    pub address: String,
    #[serde(default)]
    pub index_initiator: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub status: &'static str,
}

/// Build the admin router.
pub fn router(state: Arc<ApiState>, cors_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/", get(version))
        .route("/collection", post(enqueue))
        .with_state(state);

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }
    app
}

/// Start the API server
pub async fn start_server(
    state: Arc<ApiState>,
    host: &str,
    port: u16,
    cors_enabled: bool,
) -> anyhow::Result<()> {
    let app = router(state, cors_enabled);
    let addr = format!("{}:{}", host, port);
    info!("🚀 Starting admin API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Version endpoint
async fn version() -> &'static str {
    concat!("mintstream-engine v", env!("CARGO_PKG_VERSION"))
}

/// Enqueue a collection for indexing. 202 when accepted, 400 when the
/// address or chain id fails validation, 500 otherwise.
async fn enqueue(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    if !is_valid_address(&request.address) {
        return Err(Error::InvalidAddress {
            address: request.address,
        });
    }
    if !state.chains.contains(&request.chain_id) {
        return Err(Error::UnsupportedChain {
            chain_id: request.chain_id,
        });
    }

    let overrides = request.index_initiator.map(|initiator| EnqueueOverrides {
        index_initiator: Some(initiator),
        ..EnqueueOverrides::default()
    });

    let outcome = enqueue_collection(
        &*state.store,
        &request.chain_id,
        &request.address,
        None,
        overrides,
        &state.queue_cfg,
    )
    .await?;

    info!(
        "enqueue request for {}:{} -> {:?}",
        request.chain_id, request.address, outcome
    );
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { status: "accepted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryDocStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> Arc<ApiState> {
        Arc::new(ApiState {
            store: Arc::new(MemoryDocStore::new()),
            chains: vec!["1".to_string()],
            queue_cfg: QueueConfig {
                workers: 1,
                max_run_attempts: 3,
                claim_liveness: Duration::from_secs(7200),
                progress_grace: Duration::from_secs(60),
                claim_stale: Duration::from_secs(10800),
                monitor_interval: Duration::from_secs(300),
            },
        })
    }

    fn post_collection(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/collection")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let app = router(state(), false);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_accepted() {
        let state = state();
        let app = router(state.clone(), false);
        let response = app
            .oneshot(post_collection(serde_json::json!({
                "chainId": "1",
                "address": "0x280b971f9405aD604a4EaE50F3AD65Aa092F9f35",
                "indexInitiator": "ops"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let doc = state
            .store
            .get("collections/1:0x280b971f9405ad604a4eae50f3ad65aa092f9f35")
            .await
            .unwrap()
            .expect("collection enqueued");
        assert_eq!(
            doc.pointer("/indexInitiator").and_then(serde_json::Value::as_str),
            Some("ops")
        );
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_address() {
        let app = router(state(), false);
        let response = app
            .oneshot(post_collection(serde_json::json!({
                "chainId": "1",
                "address": "not-an-address"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_chain() {
        let app = router(state(), false);
        let response = app
            .oneshot(post_collection(serde_json::json!({
                "chainId": "999",
                "address": "0x280b971f9405aD604a4EaE50F3AD65Aa092F9f35"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
