//! src/services/storage_service.rs
//!
//! StorageService: the entry point for every container and object
//! operation. It resolves the container (or redirects to the owning node),
//! takes the resource lock, applies the change to disk and metadata, writes
//! the audit entry and hands the change to replication. When a `Sync`
//! replica rejects a change, the local change is compensated before the
//! error is returned.

use bytes::Bytes;
use chrono::Utc;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

use crate::{
    errors::{ErrorKind, StorageError, StorageResult},
    models::{
        audit::{AuditAction, AuditLogEntry, AuditQuery},
        container::{Container, ContainerSettings},
        message::{ReplicationMessage, ReplicationPayload},
        object::{EnumerationQuery, ObjectMetadata},
    },
    services::{
        container_manager::{ContainerHandle, ContainerManager},
        disk_store::{ByteStream, ObjectReader, content_hash, once_stream},
        lock_manager::{LockGuard, LockManager},
        replication::{PeerClient, ReplicationHandler},
        topology::Topology,
    },
};

const MAX_OBJECT_KEY_LEN: usize = 1024;
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where a request came from. Peer requests are replicated or repaired
/// changes: they are never redirected and never propagated again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Client,
    Peer,
}

/// Per-request identity used for locks, audit entries and redirects.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Lock holder and audit identity.
    pub caller: String,
    /// Path and query of the incoming request, replayed on redirect.
    pub request_path: String,
    pub origin: Origin,
}

impl RequestContext {
    pub fn client(caller: impl Into<String>, request_path: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            request_path: request_path.into(),
            origin: Origin::Client,
        }
    }

    /// Context for changes arriving from node `node_id`.
    pub fn peer(node_id: u32) -> Self {
        Self {
            caller: format!("node-{node_id}"),
            request_path: String::new(),
            origin: Origin::Peer,
        }
    }

    fn audit_detail(&self) -> String {
        format!("caller={}", self.caller)
    }
}

/// A new object's key and attributes; the body is passed separately.
#[derive(Clone, Debug, Default)]
pub struct NewObject {
    pub key: String,
    pub content_type: Option<String>,
    /// Expected body length. A body of any other length is rejected.
    pub content_length: Option<u64>,
    pub tags: Vec<String>,
    pub key_values: BTreeMap<String, String>,
}

impl NewObject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct StorageService {
    pub containers: Arc<ContainerManager>,
    pub locks: LockManager,
    pub topology: Arc<Topology>,
    pub replication: Arc<ReplicationHandler>,
    lock_ttl: Duration,
}

/// Basic key validation.
///
/// Keys never reach the filesystem (objects are stored under their id), but
/// they are replayed in URLs and redirects, so leading slashes, `..` and
/// control characters are rejected. Empty keys are caller bugs and panic.
fn ensure_key_safe(key: &str) -> StorageResult<()> {
    assert!(!key.is_empty(), "object key must not be empty");
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidArgument(format!(
            "object key longer than {MAX_OBJECT_KEY_LEN} bytes"
        )));
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StorageError::InvalidArgument(format!(
            "object key `{key}` is not a relative path"
        )));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::InvalidArgument(format!(
            "object key `{key}` contains a control character or backslash"
        )));
    }
    Ok(())
}

/// Treat `benign` failures of a replayed change as already applied.
/// Guards held by an object operation. The object lock is released before
/// the container lock.
#[derive(Debug)]
struct ObjectLock {
    object: LockGuard,
    container: LockGuard,
}

impl ObjectLock {
    fn resource(&self) -> &str {
        self.object.resource()
    }

    fn into_guards(self) -> [LockGuard; 2] {
        [self.object, self.container]
    }
}

fn idempotent<T>(result: StorageResult<T>, benign: ErrorKind) -> StorageResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == benign => Ok(()),
        Err(err) => Err(err),
    }
}

impl StorageService {
    pub fn new(
        containers: Arc<ContainerManager>,
        topology: Arc<Topology>,
        replication: Arc<ReplicationHandler>,
        lock_ttl: Duration,
    ) -> Self {
        let locks = LockManager::new(topology.local_node().name);
        Self {
            containers,
            locks,
            topology,
            replication,
            lock_ttl,
        }
    }

    pub fn peer_client(&self) -> Arc<dyn PeerClient> {
        self.replication.client()
    }

    /// Find a registered container.
    ///
    /// A client asking for a container this node does not hold is sent to
    /// the node owning the user's namespace, unless that node is this one.
    async fn resolve(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
    ) -> StorageResult<Arc<ContainerHandle>> {
        if let Some(handle) = self.containers.get(user, name).await {
            return Ok(handle);
        }
        if ctx.origin == Origin::Client {
            let local = self.topology.local_node();
            if let Some(owner) = self.topology.find_owner(user).filter(|o| o.id != local.id) {
                let path = if ctx.request_path.is_empty() {
                    format!("/{user}/{name}")
                } else {
                    ctx.request_path.clone()
                };
                debug!(user, container = name, owner = owner.id, "redirecting to owner");
                return Err(StorageError::Redirect(Box::new(
                    self.replication.build_redirect(&owner, &path),
                )));
            }
        }
        Err(StorageError::NotFound(format!("{user}/{name}")))
    }

    fn write_lock(&self, ctx: &RequestContext, resource: String) -> StorageResult<LockGuard> {
        self.locks
            .acquire_write(&resource, &ctx.caller, self.lock_ttl)
            .ok_or(StorageError::Locked(resource))
    }

    fn read_lock(&self, ctx: &RequestContext, resource: String) -> StorageResult<LockGuard> {
        self.locks
            .acquire_read(&resource, &ctx.caller, self.lock_ttl)
            .ok_or(StorageError::Locked(resource))
    }

    /// Lock an object, plus a shared lock on its container so container
    /// updates and deletes wait for object work to finish.
    fn object_lock(
        &self,
        ctx: &RequestContext,
        handle: &ContainerHandle,
        key: &str,
        write: bool,
    ) -> StorageResult<ObjectLock> {
        let container = self.read_lock(
            ctx,
            format!("/{}/{}", handle.container.user, handle.container.name),
        )?;
        let resource =
            LockManager::resource_path(&handle.container.user, &handle.container.name, key);
        let object = if write {
            self.write_lock(ctx, resource)?
        } else {
            self.read_lock(ctx, resource)?
        };
        Ok(ObjectLock { object, container })
    }

    async fn audit(&self, handle: &ContainerHandle, entry: AuditLogEntry) {
        if !handle.container.audit_logging {
            return;
        }
        if let Err(err) = handle.metadata.append_audit(&entry).await {
            warn!(
                container_id = %handle.container.id,
                action = %entry.action,
                error = %err,
                "failed to append audit entry"
            );
        }
    }

    fn object_audit(
        ctx: &RequestContext,
        handle: &ContainerHandle,
        action: AuditAction,
        meta: &ObjectMetadata,
    ) -> AuditLogEntry {
        AuditLogEntry::new(handle.container.id, action)
            .for_object(meta.id, &meta.key)
            .with_metadata(ctx.audit_detail())
    }

    fn should_replicate(&self, ctx: &RequestContext, container: &Container) -> bool {
        ctx.origin == Origin::Client && self.replication.replicates(container)
    }

    async fn replicate(
        &self,
        ctx: &RequestContext,
        container: &Container,
        payload: ReplicationPayload,
    ) -> StorageResult<()> {
        if !self.should_replicate(ctx, container) {
            return Ok(());
        }
        self.replication.propagate(container, payload).await
    }

    /// Undo a local change whose replication failed. A failed undo is
    /// logged and not retried.
    async fn compensate<F>(&self, op: &'static str, resource: &str, undo: F)
    where
        F: Future<Output = StorageResult<()>>,
    {
        match undo.await {
            Ok(()) => warn!(op, resource, "rolled back local change after replication failure"),
            Err(err) => error!(
                op,
                resource,
                error = %err,
                "rollback failed; local copy diverges from replicas"
            ),
        }
    }

    async fn fetch_meta(&self, handle: &ContainerHandle, key: &str) -> StorageResult<ObjectMetadata> {
        handle.metadata.get(key).await?.ok_or_else(|| {
            StorageError::NotFound(format!(
                "{}/{}/{}",
                handle.container.user, handle.container.name, key
            ))
        })
    }

    // ---- containers ----

    /// Provision a container and replicate it to its peers.
    pub async fn create_container(
        &self,
        ctx: &RequestContext,
        settings: ContainerSettings,
    ) -> StorageResult<Container> {
        let _guard = self.write_lock(ctx, format!("/{}/{}", settings.user, settings.name))?;
        let adopting = self
            .containers
            .has_retired(&settings.user, &settings.name)
            .await;
        let handle = self.containers.create(settings.clone()).await?;
        let container = handle.container.clone();
        drop(handle);

        let payload = ReplicationPayload::ContainerCreate { settings };
        if let Err(err) = self.replicate(ctx, &container, payload).await {
            self.compensate(
                "container-create",
                &container.resource_path(),
                self.containers
                    .delete(&container.user, &container.name, !adopting),
            )
            .await;
            return Err(err);
        }
        Ok(container)
    }

    pub async fn get_container(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
    ) -> StorageResult<Container> {
        Ok(self.resolve(ctx, user, name).await?.container.clone())
    }

    /// Replace a container's settings, keeping its objects.
    pub async fn update_container(
        &self,
        ctx: &RequestContext,
        settings: ContainerSettings,
    ) -> StorageResult<Container> {
        let _guard = self.write_lock(ctx, format!("/{}/{}", settings.user, settings.name))?;
        let previous = self
            .resolve(ctx, &settings.user, &settings.name)
            .await?
            .container
            .settings();
        let container = self.containers.update(settings.clone()).await?.container.clone();

        let payload = ReplicationPayload::ContainerUpdate { settings };
        if let Err(err) = self.replicate(ctx, &container, payload).await {
            self.compensate(
                "container-update",
                &container.resource_path(),
                async { self.containers.update(previous).await.map(|_| ()) },
            )
            .await;
            return Err(err);
        }
        Ok(container)
    }

    /// Unregister a container, optionally removing its data.
    ///
    /// Not compensated: a replication failure is reported after the local
    /// delete has happened.
    pub async fn delete_container(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        purge: bool,
    ) -> StorageResult<()> {
        let _guard = self.write_lock(ctx, format!("/{user}/{name}"))?;
        let container = self.resolve(ctx, user, name).await?.container.clone();
        self.containers.delete(user, name, purge).await?;
        self.replicate(ctx, &container, ReplicationPayload::ContainerDelete { purge })
            .await
    }

    pub async fn list_containers(&self, user: &str) -> Vec<Container> {
        self.containers.list_by_user(user).await
    }

    pub async fn enumerate_objects(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        query: &EnumerationQuery,
    ) -> StorageResult<Vec<ObjectMetadata>> {
        let handle = self.resolve(ctx, user, name).await?;
        self.containers.enumerate(&handle, query).await
    }

    pub async fn audit_log(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        query: &AuditQuery,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        let handle = self.resolve(ctx, user, name).await?;
        handle.metadata.query_audit(query).await
    }

    /// Remove every audit entry of a container. Returns the number removed.
    pub async fn clear_audit(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
    ) -> StorageResult<u64> {
        let handle = self.resolve(ctx, user, name).await?;
        let removed = handle.metadata.clear_audit().await?;
        debug!(user, container = name, removed, "audit log cleared");
        self.replicate(ctx, &handle.container, ReplicationPayload::ContainerClearAudit)
            .await?;
        Ok(removed)
    }

    // ---- objects ----

    /// Store a new object from a streamed body.
    ///
    /// - Fails `AlreadyExists` if the key is taken.
    /// - Hashes and measures the body while streaming it to disk.
    /// - Records metadata, then the audit entry, then replicates.
    ///
    /// On a `Sync` replication failure the object is removed again.
    pub async fn write_object(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        object: NewObject,
        body: ByteStream,
    ) -> StorageResult<ObjectMetadata> {
        ensure_key_safe(&object.key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let guard = self.object_lock(ctx, &handle, &object.key, true)?;

        let meta = self.store_object(&handle, object, body).await?;
        self.audit(&handle, Self::object_audit(ctx, &handle, AuditAction::Write, &meta))
            .await;

        if let Err(err) = self.propagate_create(ctx, &handle, &meta).await {
            self.compensate("object-create", guard.resource(), self.remove_object(&handle, &meta))
                .await;
            return Err(err);
        }
        Ok(meta)
    }

    async fn store_object(
        &self,
        handle: &ContainerHandle,
        object: NewObject,
        body: ByteStream,
    ) -> StorageResult<ObjectMetadata> {
        if handle.metadata.get(&object.key).await?.is_some() {
            return Err(StorageError::AlreadyExists(object.key));
        }

        let id = ObjectMetadata::object_id(&handle.container.id, &object.key);
        let name = id.to_string();
        let outcome = handle.disk.write(&name, body, object.content_length).await?;

        let now = Utc::now();
        let meta = ObjectMetadata {
            id,
            container_id: handle.container.id,
            key: object.key,
            content_type: object
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_length: outcome.content_length,
            content_hash: outcome.content_hash,
            tags: object.tags,
            key_values: object.key_values,
            created_at: now,
            updated_at: now,
            accessed_at: now,
        };

        if let Err(err) = handle.metadata.put(&meta).await {
            if let Err(cleanup) = handle.disk.delete(&name).await {
                debug!("failed to remove orphaned object file {}: {}", name, cleanup);
            }
            return Err(err);
        }
        debug!(container_id = %handle.container.id, key = %meta.key, size = meta.content_length, "object stored");
        Ok(meta)
    }

    async fn propagate_create(
        &self,
        ctx: &RequestContext,
        handle: &ContainerHandle,
        meta: &ObjectMetadata,
    ) -> StorageResult<()> {
        if !self.should_replicate(ctx, &handle.container) {
            return Ok(());
        }
        let data = handle.disk.read(&meta.id.to_string()).await?.into_bytes().await?;
        let payload = ReplicationPayload::ObjectCreate {
            key: meta.key.clone(),
            content_type: meta.content_type.clone(),
            tags: meta.tags.clone(),
            key_values: meta.key_values.clone(),
            data,
        };
        self.replication.propagate(&handle.container, payload).await
    }

    async fn remove_object(&self, handle: &ContainerHandle, meta: &ObjectMetadata) -> StorageResult<()> {
        match handle.disk.delete(&meta.id.to_string()).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key = %meta.key, "object file already missing");
            }
            Err(err) => return Err(err),
        }
        handle.metadata.delete(&meta.key).await?;
        Ok(())
    }

    /// Open an object for reading and mark it accessed.
    ///
    /// The returned reader keeps the object locked until it is dropped, so
    /// the bytes streamed out always match the returned metadata.
    pub async fn read_object(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
    ) -> StorageResult<(ObjectMetadata, ObjectReader)> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let lock = self.object_lock(ctx, &handle, key, false)?;

        let mut meta = self.fetch_meta(&handle, key).await?;
        let reader = handle.disk.read(&meta.id.to_string()).await?;
        meta.accessed_at = handle.metadata.touch_accessed(key).await?;
        self.audit(&handle, Self::object_audit(ctx, &handle, AuditAction::Read, &meta))
            .await;
        Ok((meta, reader.holding(lock.into_guards())))
    }

    /// Read exactly `count` bytes at `offset`; fails `OutOfRange` past the end.
    pub async fn read_range(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        offset: u64,
        count: u64,
    ) -> StorageResult<(ObjectMetadata, Bytes)> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let _guard = self.object_lock(ctx, &handle, key, false)?;

        let mut meta = self.fetch_meta(&handle, key).await?;
        let data = handle
            .disk
            .read_range(&meta.id.to_string(), offset, count)
            .await?;
        meta.accessed_at = handle.metadata.touch_accessed(key).await?;
        let entry = Self::object_audit(ctx, &handle, AuditAction::ReadRange, &meta)
            .with_metadata(format!("{} offset={offset} count={count}", ctx.audit_detail()));
        self.audit(&handle, entry).await;
        Ok((meta, data))
    }

    pub async fn object_exists(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
    ) -> StorageResult<bool> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let _guard = self.object_lock(ctx, &handle, key, false)?;

        let exists = handle.metadata.get(key).await?.is_some();
        let entry = AuditLogEntry::new(handle.container.id, AuditAction::Exists)
            .for_object(ObjectMetadata::object_id(&handle.container.id, key), key)
            .with_metadata(format!("{} exists={exists}", ctx.audit_detail()));
        self.audit(&handle, entry).await;
        Ok(exists)
    }

    pub async fn object_metadata(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
    ) -> StorageResult<ObjectMetadata> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let _guard = self.object_lock(ctx, &handle, key, false)?;
        self.fetch_meta(&handle, key).await
    }

    /// Overwrite part of an object, extending it when the range runs past
    /// the end.
    ///
    /// The bytes being overwritten are captured first so a `Sync`
    /// replication failure can restore the original content and length.
    pub async fn write_range(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<ObjectMetadata> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let guard = self.object_lock(ctx, &handle, key, true)?;

        let prior = self.fetch_meta(&handle, key).await?;
        let file = prior.id.to_string();
        let overwritten = if offset < prior.content_length {
            let end = offset
                .saturating_add(data.len() as u64)
                .min(prior.content_length);
            handle.disk.read_range(&file, offset, end - offset).await?
        } else {
            Bytes::new()
        };

        let outcome = handle.disk.write_range(&file, offset, data.clone()).await?;
        let meta = ObjectMetadata {
            content_length: outcome.content_length,
            content_hash: outcome.content_hash,
            updated_at: Utc::now(),
            ..prior.clone()
        };
        if let Err(err) = handle.metadata.put(&meta).await {
            self.compensate(
                "object-write-range",
                guard.resource(),
                self.restore_range(&handle, &prior, offset, overwritten),
            )
            .await;
            return Err(err);
        }

        let entry = Self::object_audit(ctx, &handle, AuditAction::WriteRange, &meta).with_metadata(
            format!("{} offset={offset} count={}", ctx.audit_detail(), data.len()),
        );
        self.audit(&handle, entry).await;

        let payload = ReplicationPayload::ObjectWriteRange {
            key: key.to_string(),
            offset,
            data,
        };
        if let Err(err) = self.replicate(ctx, &handle.container, payload).await {
            self.compensate(
                "object-write-range",
                guard.resource(),
                self.restore_range(&handle, &prior, offset, overwritten),
            )
            .await;
            return Err(err);
        }
        Ok(meta)
    }

    async fn restore_range(
        &self,
        handle: &ContainerHandle,
        prior: &ObjectMetadata,
        offset: u64,
        overwritten: Bytes,
    ) -> StorageResult<()> {
        let file = prior.id.to_string();
        if !overwritten.is_empty() {
            handle.disk.write_range(&file, offset, overwritten).await?;
        }
        handle.disk.truncate(&file, prior.content_length).await?;
        handle.metadata.put(prior).await
    }

    /// Remove an object. Not compensated on replication failure.
    pub async fn delete_object(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
    ) -> StorageResult<ObjectMetadata> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let _guard = self.object_lock(ctx, &handle, key, true)?;

        let meta = self.fetch_meta(&handle, key).await?;
        self.remove_object(&handle, &meta).await?;
        self.audit(&handle, Self::object_audit(ctx, &handle, AuditAction::Delete, &meta))
            .await;

        let payload = ReplicationPayload::ObjectDelete {
            key: key.to_string(),
        };
        self.replicate(ctx, &handle.container, payload).await?;
        Ok(meta)
    }

    /// Move an object to a new key.
    ///
    /// Both keys are locked for the duration. The destination must be free;
    /// on any failure the object stays under its original key.
    pub async fn rename_object(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        from: &str,
        to: &str,
    ) -> StorageResult<ObjectMetadata> {
        ensure_key_safe(from)?;
        ensure_key_safe(to)?;
        if from == to {
            return Err(StorageError::InvalidArgument(format!(
                "cannot rename `{from}` onto itself"
            )));
        }
        let handle = self.resolve(ctx, user, name).await?;
        let source_guard = self.object_lock(ctx, &handle, from, true)?;
        let _target_guard = self.object_lock(ctx, &handle, to, true)?;

        let source = self.fetch_meta(&handle, from).await?;
        if handle.metadata.get(to).await?.is_some() {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        let target_id = ObjectMetadata::object_id(&handle.container.id, to);
        self.move_object(&handle, (from, source.id), (to, target_id))
            .await?;

        let renamed = self.fetch_meta(&handle, to).await?;
        let entry = Self::object_audit(ctx, &handle, AuditAction::Rename, &renamed)
            .with_metadata(format!("{} from={from}", ctx.audit_detail()));
        self.audit(&handle, entry).await;

        let payload = ReplicationPayload::ObjectRename {
            from: from.to_string(),
            to: to.to_string(),
        };
        if let Err(err) = self.replicate(ctx, &handle.container, payload).await {
            self.compensate(
                "object-rename",
                source_guard.resource(),
                self.move_object(&handle, (to, target_id), (from, source.id)),
            )
            .await;
            return Err(err);
        }
        Ok(renamed)
    }

    async fn move_object(
        &self,
        handle: &ContainerHandle,
        (from, from_id): (&str, uuid::Uuid),
        (to, to_id): (&str, uuid::Uuid),
    ) -> StorageResult<()> {
        handle
            .disk
            .rename(&from_id.to_string(), &to_id.to_string())
            .await?;
        if let Err(err) = handle.metadata.rename(from, to).await {
            if let Err(undo) = handle
                .disk
                .rename(&to_id.to_string(), &from_id.to_string())
                .await
            {
                error!(from, to, error = %undo, "failed to move object file back after metadata rename failed");
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn write_tags(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        tags: Vec<String>,
    ) -> StorageResult<ObjectMetadata> {
        self.set_tags(ctx, user, name, key, tags, AuditAction::WriteTags)
            .await
    }

    pub async fn delete_tags(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
    ) -> StorageResult<ObjectMetadata> {
        self.set_tags(ctx, user, name, key, Vec::new(), AuditAction::DeleteTags)
            .await
    }

    async fn set_tags(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        mut tags: Vec<String>,
        action: AuditAction,
    ) -> StorageResult<ObjectMetadata> {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let guard = self.object_lock(ctx, &handle, key, true)?;

        let prior = self.fetch_meta(&handle, key).await?;
        let mut seen = std::collections::HashSet::new();
        tags.retain(|tag| seen.insert(tag.clone()));
        handle.metadata.update_tags(key, &tags).await?;
        let meta = ObjectMetadata {
            tags: tags.clone(),
            updated_at: Utc::now(),
            ..prior.clone()
        };
        self.audit(&handle, Self::object_audit(ctx, &handle, action, &meta))
            .await;

        let payload = ReplicationPayload::ObjectWriteTags {
            key: key.to_string(),
            tags,
        };
        if let Err(err) = self.replicate(ctx, &handle.container, payload).await {
            self.compensate(
                "object-write-tags",
                guard.resource(),
                handle.metadata.update_tags(key, &prior.tags),
            )
            .await;
            return Err(err);
        }
        Ok(meta)
    }

    /// Merge `values` into the object's key/value metadata.
    pub async fn write_key_values(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        values: BTreeMap<String, String>,
    ) -> StorageResult<ObjectMetadata> {
        self.edit_key_values(ctx, user, name, key, AuditAction::WriteKeyValue, |kv| {
            kv.extend(values)
        })
        .await
    }

    /// Remove the listed keys, or every key when `keys` is empty.
    pub async fn delete_key_values(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        keys: &[String],
    ) -> StorageResult<ObjectMetadata> {
        self.edit_key_values(ctx, user, name, key, AuditAction::DeleteKeyValue, |kv| {
            if keys.is_empty() {
                kv.clear();
            } else {
                kv.retain(|k, _| !keys.contains(k));
            }
        })
        .await
    }

    async fn edit_key_values<F>(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        key: &str,
        action: AuditAction,
        edit: F,
    ) -> StorageResult<ObjectMetadata>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        ensure_key_safe(key)?;
        let handle = self.resolve(ctx, user, name).await?;
        let guard = self.object_lock(ctx, &handle, key, true)?;

        let prior = self.fetch_meta(&handle, key).await?;
        let mut key_values = prior.key_values.clone();
        edit(&mut key_values);
        handle.metadata.update_key_values(key, &key_values).await?;
        let meta = ObjectMetadata {
            key_values: key_values.clone(),
            updated_at: Utc::now(),
            ..prior.clone()
        };
        self.audit(&handle, Self::object_audit(ctx, &handle, action, &meta))
            .await;

        let payload = ReplicationPayload::ObjectWriteKeyValues {
            key: key.to_string(),
            key_values,
        };
        if let Err(err) = self.replicate(ctx, &handle.container, payload).await {
            self.compensate(
                "object-write-key-values",
                guard.resource(),
                handle.metadata.update_key_values(key, &prior.key_values),
            )
            .await;
            return Err(err);
        }
        Ok(meta)
    }

    /// Make the local copy of `object` match `data`.
    ///
    /// Does nothing when an object with the same content hash is already
    /// stored; replaces it when the hash differs. Returns whether anything
    /// was written.
    pub async fn sync_object(
        &self,
        ctx: &RequestContext,
        user: &str,
        name: &str,
        object: NewObject,
        data: Bytes,
    ) -> StorageResult<bool> {
        match self.object_metadata(ctx, user, name, &object.key).await {
            Ok(existing) if existing.content_hash == content_hash(&data) => return Ok(false),
            Ok(_) => {
                self.delete_object(ctx, user, name, &object.key).await?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let object = NewObject {
            content_length: Some(data.len() as u64),
            ..object
        };
        self.write_object(ctx, user, name, object, once_stream(data))
            .await?;
        Ok(true)
    }

    /// Apply a change replicated from another node.
    ///
    /// Replays are tolerated: creating what exists, deleting what is gone
    /// and renaming a source that has already moved all succeed.
    pub async fn apply_replication(&self, message: ReplicationMessage) -> StorageResult<()> {
        let ctx = RequestContext::peer(message.source_node);
        let (user, name) = (message.user.as_str(), message.container.as_str());
        debug!(
            message_id = %message.id,
            source = message.source_node,
            user,
            container = name,
            op = message.payload.label(),
            "applying replicated change"
        );

        match message.payload {
            ReplicationPayload::ContainerCreate { settings } => idempotent(
                self.create_container(&ctx, settings).await,
                ErrorKind::AlreadyExists,
            ),
            ReplicationPayload::ContainerUpdate { settings } => {
                if self.containers.get(&settings.user, &settings.name).await.is_some() {
                    self.update_container(&ctx, settings).await.map(|_| ())
                } else {
                    self.create_container(&ctx, settings).await.map(|_| ())
                }
            }
            ReplicationPayload::ContainerDelete { purge } => idempotent(
                self.delete_container(&ctx, user, name, purge).await,
                ErrorKind::NotFound,
            ),
            ReplicationPayload::ContainerClearAudit => {
                self.clear_audit(&ctx, user, name).await.map(|_| ())
            }
            ReplicationPayload::ObjectCreate {
                key,
                content_type,
                tags,
                key_values,
                data,
            } => {
                let object = NewObject {
                    key,
                    content_type: Some(content_type),
                    content_length: None,
                    tags,
                    key_values,
                };
                self.sync_object(&ctx, user, name, object, data)
                    .await
                    .map(|_| ())
            }
            ReplicationPayload::ObjectDelete { key } => idempotent(
                self.delete_object(&ctx, user, name, &key).await,
                ErrorKind::NotFound,
            ),
            ReplicationPayload::ObjectRename { from, to } => idempotent(
                self.rename_object(&ctx, user, name, &from, &to).await,
                ErrorKind::NotFound,
            ),
            ReplicationPayload::ObjectWriteRange { key, offset, data } => self
                .write_range(&ctx, user, name, &key, offset, data)
                .await
                .map(|_| ()),
            ReplicationPayload::ObjectWriteTags { key, tags } => self
                .write_tags(&ctx, user, name, &key, tags)
                .await
                .map(|_| ()),
            ReplicationPayload::ObjectWriteKeyValues { key, key_values } => self
                .edit_key_values(&ctx, user, name, &key, AuditAction::WriteKeyValue, |kv| {
                    *kv = key_values
                })
                .await
                .map(|_| ()),
        }
    }
}
