//! Node-to-node and admin endpoints.
//!
//! `/_internal/*` is called by peers: replicated mutations arrive here and
//! resync workers on other nodes read inventory and object content from here.
//! Requests are never redirected and never re-replicated.
//!
//! `/_admin/resync` starts, inspects and stops resync workers on this node.

use crate::{
    errors::{AppError, StorageError},
    models::{
        container::Container,
        message::ReplicationMessage,
        object::{EnumerationQuery, ObjectMetadata},
    },
    routes::AppState,
    services::{
        replication::{NODE_ID_HEADER, PageParams},
        resync::{ResyncManager, ResyncReport, ResyncSettings},
        storage_service::{RequestContext, StorageService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

fn peer_context(headers: &HeaderMap) -> RequestContext {
    let node_id = headers
        .get(NODE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    RequestContext::peer(node_id)
}

/// POST `/_internal/replicate`
///
/// Object bodies travel inside the message, so the route is mounted without
/// axum's default body limit.
pub async fn replicate(
    State(service): State<StorageService>,
    Json(message): Json<ReplicationMessage>,
) -> Result<StatusCode, AppError> {
    service.apply_replication(message).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PeerContainersQuery {
    pub user: Option<String>,
}

/// GET `/_internal/containers?user=...`
pub async fn peer_containers(
    State(service): State<StorageService>,
    Query(q): Query<PeerContainersQuery>,
) -> Json<Vec<Container>> {
    Json(match q.user {
        Some(user) => service.list_containers(&user).await,
        None => service.containers.list_all().await,
    })
}

/// GET `/_internal/objects/{user}/{container}`
pub async fn peer_objects(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    Query(page): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<ObjectMetadata>>, AppError> {
    let query = EnumerationQuery {
        index_start: page.index_start,
        max_results: page.max_results,
        ..EnumerationQuery::default()
    };
    let objects = service
        .enumerate_objects(&peer_context(&headers), &user, &name, &query)
        .await?;
    Ok(Json(objects))
}

/// GET `/_internal/objects/{user}/{container}/{*key}`: raw object body.
pub async fn peer_object(
    State(service): State<StorageService>,
    Path((user, name, key)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (meta, reader) = service
        .read_object(&peer_context(&headers), &user, &name, &key)
        .await?;
    let length = reader.content_length;
    let mut response = Response::new(Body::from_stream(reader.into_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.content_hash)) {
        headers.insert(header::ETAG, value);
    }
    Ok(response)
}

/// Identifies a resync worker by source node and optional scope.
#[derive(Debug, Deserialize)]
pub struct ResyncTarget {
    pub source: u32,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
}

impl ResyncTarget {
    fn resolve(self, service: &StorageService) -> Result<ResyncSettings, AppError> {
        let local = service.topology.local_node();
        if self.source == local.id {
            return Err(AppError::bad_request("cannot resync a node from itself"));
        }
        let source = service
            .topology
            .node(self.source)
            .ok_or_else(|| StorageError::NotFound(format!("node {}", self.source)))?;
        if self.container.is_some() && self.user.is_none() {
            return Err(AppError::bad_request("`container` requires `user`"));
        }
        Ok(ResyncSettings {
            source,
            user: self.user,
            container: self.container,
        })
    }
}

/// POST `/_admin/resync`: start a worker; 409 if one already runs.
pub async fn start_resync(
    State(state): State<AppState>,
    Json(target): Json<ResyncTarget>,
) -> Result<impl IntoResponse, AppError> {
    let settings = target.resolve(&state.storage)?;
    info!(
        source = settings.source.id,
        user = ?settings.user,
        container = ?settings.container,
        "resync requested"
    );
    let report = state.resync.start(settings)?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// GET `/_admin/resync`
pub async fn list_resyncs(State(resync): State<ResyncManager>) -> Json<Vec<ResyncReport>> {
    Json(resync.list())
}

/// GET `/_admin/resync/status?source=N[&user=..&container=..]`
pub async fn resync_status(
    State(state): State<AppState>,
    Query(target): Query<ResyncTarget>,
) -> Result<Json<ResyncReport>, AppError> {
    let settings = target.resolve(&state.storage)?;
    let report = state.resync.status(&settings).ok_or_else(|| {
        StorageError::NotFound(format!("resync from node {}", settings.source.id))
    })?;
    Ok(Json(report))
}

/// DELETE `/_admin/resync?source=N[&user=..&container=..]`: request a stop.
pub async fn stop_resync(
    State(state): State<AppState>,
    Query(target): Query<ResyncTarget>,
) -> Result<Json<ResyncReport>, AppError> {
    let settings = target.resolve(&state.storage)?;
    Ok(Json(state.resync.stop(&settings)?))
}
