//! Defines routes for container, object, peer and admin operations.
//!
//! ## Structure
//! - **Container-level endpoints**
//!   - `GET    /{user}`: list the user's containers
//!   - `PUT    /{user}/{container}`: create container (optional JSON settings)
//!   - `POST   /{user}/{container}`: update settings
//!   - `HEAD   /{user}/{container}`: existence check
//!   - `GET    /{user}/{container}`: enumerate objects
//!   - `DELETE /{user}/{container}`: delete (`?purge=true` removes data)
//!
//! - **Object-level endpoints**
//!   - `PUT    /{user}/{container}/{*key}`: upload, or ranged write with `?offset=`
//!   - `GET    /{user}/{container}/{*key}`: download, or `?offset=&count=`
//!   - `HEAD   /{user}/{container}/{*key}`: metadata only
//!   - `DELETE /{user}/{container}/{*key}`: delete
//!   - `POST   /{user}/{container}/{*key}`: rename, tags, key/values, exists
//!
//! - **Audit**: `GET|DELETE /_audit/{user}/{container}`
//! - **Peers**: `/_internal/*`, see `internal_handlers`
//! - **Resync admin**: `/_admin/resync`
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        internal_handlers::{
            list_resyncs, peer_containers, peer_object, peer_objects, replicate, resync_status,
            start_resync, stop_resync,
        },
        object_handlers::{
            audit_log, clear_audit, create_container, delete_container, delete_object,
            enumerate_objects, get_object, head_container, head_object, list_containers,
            object_action, put_object, update_container,
        },
    },
    services::{resync::ResyncManager, storage_service::StorageService},
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post, put},
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub resync: ResyncManager,
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}

impl FromRef<AppState> for ResyncManager {
    fn from_ref(state: &AppState) -> Self {
        state.resync.clone()
    }
}

/// Build the router. Static prefixes (`/_internal`, `/_admin`, `/_audit`)
/// take precedence over the `/{user}` captures.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Peer endpoints
        .route(
            "/_internal/replicate",
            post(replicate).layer(DefaultBodyLimit::disable()),
        )
        .route("/_internal/containers", get(peer_containers))
        .route("/_internal/objects/{user}/{container}", get(peer_objects))
        .route("/_internal/objects/{user}/{container}/{*key}", get(peer_object))
        // Resync admin
        .route(
            "/_admin/resync",
            post(start_resync).get(list_resyncs).delete(stop_resync),
        )
        .route("/_admin/resync/status", get(resync_status))
        // Audit
        .route(
            "/_audit/{user}/{container}",
            get(audit_log).delete(clear_audit),
        )
        // Object-level routes
        .route(
            "/{user}/{container}/{*key}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object)
                .post(object_action),
        )
        // Container-level routes
        .route(
            "/{user}/{container}",
            put(create_container)
                .post(update_container)
                .head(head_container)
                .get(enumerate_objects)
                .delete(delete_container),
        )
        .route("/{user}", get(list_containers))
}
