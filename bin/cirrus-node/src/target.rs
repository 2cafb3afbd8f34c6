//! Storage target - the cache-serving role
//!
//! Registers with the proxy at start-up, serves `/v1/files` and
//! `/v1/daemon`, and unregisters on stop. Object GETs stream straight
//! from the pinned cache file; intra-cluster copies arrive either as a
//! control message (this node is the source and pushes bytes to the
//! peer) or as the peer's byte stream tagged with the copy header (this
//! node is the destination and installs it).

use crate::http::ApiError;
use async_trait::async_trait;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use cirrus_cluster::{ClusterMap, ClusterSnapshot, SyncOutcome};
use cirrus_common::{
    Action, ActionMsg, BucketName, CopyMsg, Error, GetMsg, Member, ObjectKey, Result, What,
};
use cirrus_runner::Runner;
use cirrus_store::{CacheStats, CopyRole, ObjectCache};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header carrying the copy message on peer-to-peer byte streams
pub const COPY_HEADER: &str = "x-cirrus-copy";

const COPY_MSG_LIMIT: usize = 64 * 1024;

/// Shared state behind the target's request handlers
pub struct TargetState {
    pub member: Member,
    pub proxy_url: String,
    pub cluster: Arc<ClusterMap>,
    pub cache: Arc<ObjectCache>,
    pub stats: Arc<CacheStats>,
    pub http: reqwest::Client,
}

impl TargetState {
    pub fn new(
        member: Member,
        proxy_url: String,
        cluster: Arc<ClusterMap>,
        cache: Arc<ObjectCache>,
        stats: Arc<CacheStats>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::configuration(format!("http client: {e}")))?;
        Ok(Self {
            member,
            proxy_url: proxy_url.trim_end_matches('/').to_string(),
            cluster,
            cache,
            stats,
            http,
        })
    }

    /// Count the error and hand it to the request boundary
    fn fail(&self, err: Error) -> ApiError {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        ApiError(err)
    }
}

/// Build the target's REST surface
pub fn router(state: Arc<TargetState>) -> Router {
    Router::new()
        .route("/v1/files/{bucket}", get(list_bucket))
        .route(
            "/v1/files/{bucket}/{*object}",
            get(get_object).put(put_object),
        )
        .route("/v1/daemon", get(daemon_get).put(daemon_put))
        .route("/v1/daemon/syncmap", put(sync_map))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /v1/files/{bucket} - cloud listing, line-oriented names
async fn list_bucket(
    State(state): State<Arc<TargetState>>,
    Path(bucket): Path<String>,
) -> std::result::Result<Response, ApiError> {
    state.stats.gets.fetch_add(1, Ordering::Relaxed);
    let bucket = BucketName::new(bucket).map_err(|e| state.fail(e.into()))?;
    let names = state
        .cache
        .list_bucket(&bucket)
        .await
        .map_err(|e| state.fail(e))?;
    let mut body = names.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok((StatusCode::OK, body).into_response())
}

/// GET /v1/files/{bucket}/{object} - serve from cache, cold-fill on miss
async fn get_object(
    State(state): State<Arc<TargetState>>,
    Path((bucket, object)): Path<(String, String)>,
) -> std::result::Result<Response, ApiError> {
    state.stats.gets.fetch_add(1, Ordering::Relaxed);
    let bucket = BucketName::new(bucket).map_err(|e| state.fail(e.into()))?;
    let key = ObjectKey::new(object).map_err(|e| state.fail(e.into()))?;

    let obj = state
        .cache
        .get(&bucket, &key)
        .await
        .map_err(|e| state.fail(e))?;
    let size = obj.size;
    let body = Body::from_stream(ReaderStream::new(obj));
    Ok((
        [
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

/// PUT /v1/files/{bucket}/{object} - intra-cluster copy.
///
/// Without the copy header the body is a `CopyMsg` and this node must
/// be the source; with it, the body is the source's byte stream and
/// this node must be the destination.
async fn put_object(
    State(state): State<Arc<TargetState>>,
    Path((bucket, object)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<Response, ApiError> {
    let bucket = BucketName::new(bucket).map_err(|e| state.fail(e.into()))?;
    let key = ObjectKey::new(object).map_err(|e| state.fail(e.into()))?;

    if let Some(tag) = headers.get(COPY_HEADER) {
        let msg: CopyMsg = serde_json::from_slice(tag.as_bytes())
            .map_err(|e| state.fail(Error::protocol(format!("bad copy header: {e}"))))?;
        match state.cache.copy_role(&msg).map_err(|e| state.fail(e))? {
            CopyRole::Destination => {
                let stream = body
                    .into_data_stream()
                    .map_err(std::io::Error::other)
                    .boxed();
                let written = state
                    .cache
                    .install_from_stream(&bucket, &key, stream)
                    .await
                    .map_err(|e| state.fail(e))?;
                debug!(bucket = %bucket, key = %key, bytes = written, "copy received");
                Ok(StatusCode::OK.into_response())
            }
            CopyRole::Source { .. } => Err(state.fail(Error::protocol(
                "copy stream arrived at the source node",
            ))),
        }
    } else {
        let bytes = axum::body::to_bytes(body, COPY_MSG_LIMIT)
            .await
            .map_err(|e| state.fail(Error::protocol(format!("bad copy body: {e}"))))?;
        let msg: CopyMsg = serde_json::from_slice(&bytes)
            .map_err(|e| state.fail(Error::protocol(format!("bad copy message: {e}"))))?;
        match state.cache.copy_role(&msg).map_err(|e| state.fail(e))? {
            CopyRole::Source { peer } => {
                send_to_peer(&state, &peer, &bucket, &key, &msg).await?;
                state.stats.puts.fetch_add(1, Ordering::Relaxed);
                Ok(StatusCode::OK.into_response())
            }
            CopyRole::Destination => Err(state.fail(Error::protocol(
                "copy destination expects the source's byte stream",
            ))),
        }
    }
}

/// Stream a local file to the copy destination
async fn send_to_peer(
    state: &Arc<TargetState>,
    peer: &Member,
    bucket: &BucketName,
    key: &ObjectKey,
    msg: &CopyMsg,
) -> std::result::Result<(), ApiError> {
    let obj = state
        .cache
        .open_for_send(bucket, key)
        .await
        .map_err(|e| state.fail(e))?;
    let size = obj.size;
    let tag = serde_json::to_string(msg)
        .map_err(|e| state.fail(Error::protocol(format!("copy header: {e}"))))?;
    let url = format!("{}/v1/files/{}/{}", peer.direct_url, bucket, key);

    let resp = state
        .http
        .put(url)
        .header(COPY_HEADER, tag)
        .header(header::CONTENT_LENGTH, size)
        .body(reqwest::Body::wrap_stream(ReaderStream::new(obj)))
        .send()
        .await
        .map_err(|e| state.fail(Error::Peer(format!("copy to {}: {e}", peer.id))))?;
    if !resp.status().is_success() {
        return Err(state.fail(Error::Peer(format!(
            "copy to {}: status {}",
            peer.id,
            resp.status()
        ))));
    }
    info!(bucket = %bucket, key = %key, peer = %peer.id, bytes = size, "copied to peer");
    Ok(())
}

/// GET /v1/daemon - node identity or stats snapshot
async fn daemon_get(
    State(state): State<Arc<TargetState>>,
    Json(msg): Json<GetMsg>,
) -> Response {
    match msg.what {
        What::Config => Json(state.member.clone()).into_response(),
        What::Stats => Json(state.stats.snapshot()).into_response(),
    }
}

/// PUT /v1/daemon - control actions
async fn daemon_put(
    State(state): State<Arc<TargetState>>,
    Json(msg): Json<ActionMsg>,
) -> std::result::Result<Response, ApiError> {
    match msg.action {
        Action::Shutdown => {
            info!("shutdown action received");
            crate::runners::raise_sigint().map_err(|e| state.fail(e))?;
            Ok(StatusCode::OK.into_response())
        }
        Action::Syncmap => Err(state.fail(Error::protocol("syncmap is a proxy action"))),
    }
}

/// PUT /v1/daemon/syncmap - version-gated map sync
async fn sync_map(
    State(state): State<Arc<TargetState>>,
    Json(snapshot): Json<ClusterSnapshot>,
) -> StatusCode {
    match state.cluster.try_sync(snapshot) {
        SyncOutcome::Applied { .. } => {}
        SyncOutcome::Ignored { local_version } => {
            debug!(local_version, "stale cluster map ignored");
        }
    }
    StatusCode::OK
}

/// The target's service loop as a supervised runner
pub struct TargetRunner {
    state: Arc<TargetState>,
    listen: String,
    shutdown: watch::Sender<bool>,
}

impl TargetRunner {
    #[must_use]
    pub fn new(state: Arc<TargetState>, listen: String) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            listen,
            shutdown,
        }
    }

    /// Target registration with the proxy; failure is fatal at start-up
    async fn register(&self) -> Result<()> {
        let url = format!("{}/v1/cluster", self.state.proxy_url);
        let resp = self
            .state
            .http
            .post(url)
            .json(&self.state.member)
            .send()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Registration(format!("status {}", resp.status())));
        }
        info!(proxy = %self.state.proxy_url, id = %self.state.member.id, "registered with proxy");
        Ok(())
    }

    async fn unregister(&self) {
        let url = format!(
            "{}/v1/cluster/daemon/{}",
            self.state.proxy_url, self.state.member.id
        );
        match self.state.http.delete(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(id = %self.state.member.id, "unregistered from proxy");
            }
            Ok(resp) => warn!(status = %resp.status(), "unregister rejected"),
            Err(e) => warn!(error = %e, "unregister failed"),
        }
    }
}

#[async_trait]
impl Runner for TargetRunner {
    async fn run(self: Arc<Self>) -> Result<()> {
        self.register().await?;
        let listener = tokio::net::TcpListener::bind(&self.listen).await?;
        info!(listen = %self.listen, id = %self.state.member.id, "storage target is ready");

        let mut rx = self.shutdown.subscribe();
        axum::serve(listener, router(Arc::clone(&self.state)))
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stopped| *stopped).await;
            })
            .await?;
        Ok(())
    }

    async fn stop(&self, reason: &Error) {
        info!(reason = %reason, "stopping target");
        self.unregister().await;
        let _ = self.shutdown.send(true);
    }
}
