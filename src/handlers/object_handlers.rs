//! HTTP handlers for container and object operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::{
        audit::{AuditLogEntry, AuditQuery},
        container::{Container, ContainerSettings, ReplicationMode},
        object::{EnumerationFilter, EnumerationOrder, EnumerationQuery, ObjectMetadata},
    },
    services::storage_service::{NewObject, RequestContext, StorageService},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, io};

/// Identity used for lock ownership and audit entries.
pub const CALLER_HEADER: &str = "x-caller";
/// Comma-separated tags supplied on upload and echoed on reads.
pub const TAGS_HEADER: &str = "x-object-tags";
/// Prefix of headers carrying object key/value metadata.
pub const META_HEADER_PREFIX: &str = "x-object-meta-";

pub(crate) fn client_context(headers: &HeaderMap, uri: &Uri) -> RequestContext {
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());
    RequestContext::client(caller, path)
}

/// Largest body accepted by a ranged write, which is buffered in memory.
pub const MAX_RANGE_WRITE_BYTES: usize = 64 * 1024 * 1024;

/// Collect a request body, failing with 413 once it grows past `limit`.
async fn buffer_limited(body: Body, limit: usize) -> Result<Bytes, AppError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| AppError::bad_request(format!("reading body: {err}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("ranged writes are limited to {limit} bytes"),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn ensure_key_present(key: &str) -> Result<(), AppError> {
    if key.is_empty() {
        return Err(AppError::bad_request("object key is required"));
    }
    Ok(())
}

/// Optional JSON body for `PUT` and `POST /{user}/{container}`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ContainerSettingsBody {
    pub public_read: bool,
    pub public_write: bool,
    pub audit_logging: bool,
    pub replication: ReplicationMode,
}

impl ContainerSettingsBody {
    fn parse(body: &Bytes) -> Result<Self, AppError> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|err| AppError::bad_request(format!("invalid container settings: {err}")))
    }

    fn into_settings(self, user: String, name: String) -> ContainerSettings {
        ContainerSettings {
            user,
            name,
            public_read: self.public_read,
            public_write: self.public_write,
            audit_logging: self.audit_logging,
            replication: self.replication,
        }
    }
}

/// GET `/{user}`: containers owned by `user` on this node.
pub async fn list_containers(
    State(service): State<StorageService>,
    Path(user): Path<String>,
) -> Json<Vec<Container>> {
    Json(service.list_containers(&user).await)
}

/// PUT `/{user}/{container}`: create a container.
pub async fn create_container(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let settings = ContainerSettingsBody::parse(&body)?.into_settings(user, name);
    let container = service
        .create_container(&client_context(&headers, &uri), settings)
        .await?;
    Ok((StatusCode::CREATED, Json(container)))
}

/// POST `/{user}/{container}`: replace a container's settings.
pub async fn update_container(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Json<Container>, AppError> {
    let settings = ContainerSettingsBody::parse(&body)?.into_settings(user, name);
    let container = service
        .update_container(&client_context(&headers, &uri), settings)
        .await?;
    Ok(Json(container))
}

/// HEAD `/{user}/{container}`: 200 when the container is served here.
pub async fn head_container(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<StatusCode, AppError> {
    service
        .get_container(&client_context(&headers, &uri), &user, &name)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeleteContainerQuery {
    pub purge: bool,
}

/// DELETE `/{user}/{container}?purge=true`
pub async fn delete_container(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    Query(q): Query<DeleteContainerQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<StatusCode, AppError> {
    service
        .delete_container(&client_context(&headers, &uri), &user, &name, q.purge)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Query params accepted by the enumeration route. `tags` is comma-separated.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct EnumerateQuery {
    pub index_start: u64,
    pub max_results: Option<u32>,
    pub prefix: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub accessed_before: Option<DateTime<Utc>>,
    pub accessed_after: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub content_type: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub tags: Option<String>,
    pub order_by: EnumerationOrder,
}

impl From<EnumerateQuery> for EnumerationQuery {
    fn from(q: EnumerateQuery) -> Self {
        EnumerationQuery {
            index_start: q.index_start,
            max_results: q.max_results,
            filter: EnumerationFilter {
                prefix: q.prefix,
                created_before: q.created_before,
                created_after: q.created_after,
                updated_before: q.updated_before,
                updated_after: q.updated_after,
                accessed_before: q.accessed_before,
                accessed_after: q.accessed_after,
                content_hash: q.content_hash,
                content_type: q.content_type,
                min_size: q.min_size,
                max_size: q.max_size,
                tags: q.tags.as_deref().map(split_list).unwrap_or_default(),
            },
            order_by: q.order_by,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnumerationPage {
    pub objects: Vec<ObjectMetadata>,
    /// Cursor for the next page; absent once the listing is exhausted.
    pub next_index_start: Option<u64>,
}

/// GET `/{user}/{container}`: one page of objects.
pub async fn enumerate_objects(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    Query(q): Query<EnumerateQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Json<EnumerationPage>, AppError> {
    let query = EnumerationQuery::from(q);
    let objects = service
        .enumerate_objects(&client_context(&headers, &uri), &user, &name, &query)
        .await?;
    let next_index_start = (objects.len() as u32 == query.limit())
        .then(|| query.index_start + objects.len() as u64);
    Ok(Json(EnumerationPage {
        objects,
        next_index_start,
    }))
}

/// GET `/_audit/{user}/{container}`: audit entries, oldest first.
pub async fn audit_log(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    Query(q): Query<AuditQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Json<Vec<AuditLogEntry>>, AppError> {
    let entries = service
        .audit_log(&client_context(&headers, &uri), &user, &name, &q)
        .await?;
    Ok(Json(entries))
}

/// DELETE `/_audit/{user}/{container}`
pub async fn clear_audit(
    State(service): State<StorageService>,
    Path((user, name)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<impl IntoResponse, AppError> {
    let removed = service
        .clear_audit(&client_context(&headers, &uri), &user, &name)
        .await?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WriteQuery {
    /// Present for a ranged overwrite of an existing object.
    pub offset: Option<u64>,
}

/// PUT `/{user}/{container}/{*key}`: upload a new object, or overwrite a
/// byte range of an existing one with `?offset=N`.
pub async fn put_object(
    State(service): State<StorageService>,
    Path((user, name, key)): Path<(String, String, String)>,
    Query(q): Query<WriteQuery>,
    headers: HeaderMap,
    uri: Uri,
    body: Body,
) -> Result<Response, AppError> {
    ensure_key_present(&key)?;
    let ctx = client_context(&headers, &uri);

    if let Some(offset) = q.offset {
        let data = buffer_limited(body, MAX_RANGE_WRITE_BYTES).await?;
        let meta = service
            .write_range(&ctx, &user, &name, &key, offset, data)
            .await?;
        return Ok(object_response(StatusCode::OK, &meta));
    }

    let object = NewObject {
        key,
        content_type: header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
        content_length: header_str(&headers, header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok()),
        tags: header_str(&headers, TAGS_HEADER)
            .map(split_list)
            .unwrap_or_default(),
        key_values: meta_headers(&headers),
    };
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let meta = service
        .write_object(&ctx, &user, &name, object, stream)
        .await?;
    Ok(object_response(StatusCode::CREATED, &meta))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ReadQuery {
    pub offset: Option<u64>,
    pub count: Option<u64>,
}

/// GET `/{user}/{container}/{*key}`: whole object as a stream, or exactly
/// `count` bytes at `offset`.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((user, name, key)): Path<(String, String, String)>,
    Query(q): Query<ReadQuery>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AppError> {
    ensure_key_present(&key)?;
    let ctx = client_context(&headers, &uri);

    match (q.offset, q.count) {
        (Some(offset), Some(count)) => {
            let (meta, data) = service
                .read_range(&ctx, &user, &name, &key, offset, count)
                .await?;
            let mut response = Response::new(Body::from(data));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            set_object_headers(response.headers_mut(), &meta, count);
            if count > 0 {
                let range = format!(
                    "bytes {}-{}/{}",
                    offset,
                    offset + count - 1,
                    meta.content_length
                );
                if let Ok(value) = HeaderValue::from_str(&range) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
            }
            Ok(response)
        }
        (None, None) => {
            let (meta, reader) = service.read_object(&ctx, &user, &name, &key).await?;
            let length = reader.content_length;
            let body = Body::from_stream(reader.into_stream());

            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::OK;
            set_object_headers(response.headers_mut(), &meta, length);
            Ok(response)
        }
        _ => Err(AppError::bad_request(
            "`offset` and `count` must be given together",
        )),
    }
}

/// HEAD `/{user}/{container}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((user, name, key)): Path<(String, String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AppError> {
    ensure_key_present(&key)?;
    let meta = service
        .object_metadata(&client_context(&headers, &uri), &user, &name, &key)
        .await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta, meta.content_length);
    Ok(response)
}

/// DELETE `/{user}/{container}/{*key}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((user, name, key)): Path<(String, String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<StatusCode, AppError> {
    ensure_key_present(&key)?;
    service
        .delete_object(&client_context(&headers, &uri), &user, &name, &key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of `POST /{user}/{container}/{*key}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ObjectAction {
    Exists,
    Rename {
        to: String,
    },
    WriteTags {
        tags: Vec<String>,
    },
    DeleteTags,
    WriteKeyValues {
        values: BTreeMap<String, String>,
    },
    /// Removes the listed keys, or all of them when `keys` is empty.
    DeleteKeyValues {
        #[serde(default)]
        keys: Vec<String>,
    },
}

/// POST `/{user}/{container}/{*key}`: metadata-only object operations.
pub async fn object_action(
    State(service): State<StorageService>,
    Path((user, name, key)): Path<(String, String, String)>,
    headers: HeaderMap,
    uri: Uri,
    Json(action): Json<ObjectAction>,
) -> Result<Response, AppError> {
    ensure_key_present(&key)?;
    let ctx = client_context(&headers, &uri);

    let meta = match action {
        ObjectAction::Exists => {
            let exists = service.object_exists(&ctx, &user, &name, &key).await?;
            return Ok(Json(json!({ "exists": exists })).into_response());
        }
        ObjectAction::Rename { to } => {
            ensure_key_present(&to)?;
            service.rename_object(&ctx, &user, &name, &key, &to).await?
        }
        ObjectAction::WriteTags { tags } => {
            service.write_tags(&ctx, &user, &name, &key, tags).await?
        }
        ObjectAction::DeleteTags => service.delete_tags(&ctx, &user, &name, &key).await?,
        ObjectAction::WriteKeyValues { values } => {
            service
                .write_key_values(&ctx, &user, &name, &key, values)
                .await?
        }
        ObjectAction::DeleteKeyValues { keys } => {
            service
                .delete_key_values(&ctx, &user, &name, &key, &keys)
                .await?
        }
    };
    Ok(object_response(StatusCode::OK, &meta))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn meta_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn object_response(status: StatusCode, meta: &ObjectMetadata) -> Response {
    let mut response = (status, Json(meta)).into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.content_hash)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMetadata, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.content_hash)) {
        headers.insert(header::ETAG, value);
    }
    let modified = meta
        .updated_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if !meta.tags.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&meta.tags.join(",")) {
            headers.insert(HeaderName::from_static(TAGS_HEADER), value);
        }
    }
    for (key, value) in &meta.key_values {
        let name = HeaderName::try_from(format!("{META_HEADER_PREFIX}{key}"));
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn range_write_bodies_are_capped() {
        let body = Body::from(vec![7u8; 16]);
        assert_eq!(buffer_limited(body, 16).await.unwrap().len(), 16);

        let chunks = futures::stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
        ]);
        let err = buffer_limited(Body::from_stream(chunks), 16).await.unwrap_err();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
