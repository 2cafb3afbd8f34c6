//! Membership proxy - the cluster-map role
//!
//! Accepts target registrations, answers daemon queries, and pushes the
//! versioned map to every target on a syncmap action. Client routing
//! policy lives outside this daemon.

use crate::http::ApiError;
use async_trait::async_trait;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use cirrus_cluster::ClusterMap;
use cirrus_common::{Action, ActionMsg, Error, GetMsg, Member, NodeId, Result, What};
use cirrus_runner::Runner;
use cirrus_store::CacheStats;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state behind the proxy's request handlers
pub struct ProxyState {
    pub member: Member,
    pub cluster: Arc<ClusterMap>,
    pub stats: Arc<CacheStats>,
    pub http: reqwest::Client,
}

impl ProxyState {
    pub fn new(
        member: Member,
        cluster: Arc<ClusterMap>,
        stats: Arc<CacheStats>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::configuration(format!("http client: {e}")))?;
        Ok(Self {
            member,
            cluster,
            stats,
            http,
        })
    }

    fn fail(&self, err: Error) -> ApiError {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        ApiError(err)
    }
}

/// Build the proxy's REST surface
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v1/cluster", post(register_member))
        .route("/v1/cluster/daemon/{id}", delete(unregister_member))
        .route("/v1/daemon", get(daemon_get).put(daemon_put))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /v1/cluster - target self-registration
async fn register_member(
    State(state): State<Arc<ProxyState>>,
    Json(member): Json<Member>,
) -> StatusCode {
    state.stats.puts.fetch_add(1, Ordering::Relaxed);
    info!(id = %member.id, url = %member.direct_url, "target registered");
    state.cluster.add(member);
    StatusCode::OK
}

/// DELETE /v1/cluster/daemon/{id} - unregistration
async fn unregister_member(
    State(state): State<Arc<ProxyState>>,
    Path(id): Path<String>,
) -> StatusCode {
    let id = NodeId::new(id);
    match state.cluster.remove(&id) {
        Some(_) => info!(id = %id, "target unregistered"),
        None => warn!(id = %id, "unregister for unknown target"),
    }
    StatusCode::OK
}

/// GET /v1/daemon - node identity or stats snapshot
async fn daemon_get(State(state): State<Arc<ProxyState>>, Json(msg): Json<GetMsg>) -> Response {
    state.stats.gets.fetch_add(1, Ordering::Relaxed);
    match msg.what {
        What::Config => Json(state.member.clone()).into_response(),
        What::Stats => Json(state.stats.snapshot()).into_response(),
    }
}

/// PUT /v1/daemon - control actions
async fn daemon_put(
    State(state): State<Arc<ProxyState>>,
    Json(msg): Json<ActionMsg>,
) -> std::result::Result<Response, ApiError> {
    match msg.action {
        Action::Shutdown => {
            info!("shutdown action received");
            crate::runners::raise_sigint().map_err(|e| state.fail(e))?;
            Ok(StatusCode::OK.into_response())
        }
        Action::Syncmap => {
            sync_targets(&state).await;
            Ok(StatusCode::OK.into_response())
        }
    }
}

/// Push the current map to every target; per-target failures are logged
/// and do not abort the broadcast
async fn sync_targets(state: &Arc<ProxyState>) {
    let snapshot = state.cluster.snapshot();
    info!(
        version = snapshot.version,
        members = snapshot.members.len(),
        "pushing cluster map"
    );
    for (id, member) in &snapshot.members {
        if *id == state.member.id {
            continue;
        }
        let url = format!("{}/v1/daemon/syncmap", member.direct_url);
        match state.http.put(url).json(&snapshot).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(target = %id, status = %resp.status(), "syncmap rejected"),
            Err(e) => warn!(target = %id, error = %e, "syncmap push failed"),
        }
    }
}

/// The proxy's service loop as a supervised runner
pub struct ProxyRunner {
    state: Arc<ProxyState>,
    listen: String,
    shutdown: watch::Sender<bool>,
}

impl ProxyRunner {
    #[must_use]
    pub fn new(state: Arc<ProxyState>, listen: String) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            listen,
            shutdown,
        }
    }
}

#[async_trait]
impl Runner for ProxyRunner {
    async fn run(self: Arc<Self>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen).await?;
        info!(listen = %self.listen, id = %self.state.member.id, "proxy is ready");

        let mut rx = self.shutdown.subscribe();
        axum::serve(listener, router(Arc::clone(&self.state)))
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stopped| *stopped).await;
            })
            .await?;
        Ok(())
    }

    async fn stop(&self, reason: &Error) {
        info!(reason = %reason, "stopping proxy");
        let _ = self.shutdown.send(true);
    }
}
