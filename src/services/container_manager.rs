//! src/services/container_manager.rs
//!
//! Maps `(user, container)` to a provisioned container, its object backend
//! and its metadata store. Each container lives in its own directory:
//! `data_dir/{user}/{name}/{container.json, metadata.db, objects/}`.

use chrono::Utc;
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs,
    sync::{Mutex, RwLock},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        container::{Container, ContainerSettings},
        object::{EnumerationQuery, ObjectMetadata},
    },
    services::{
        disk_store::{DiskObjectStore, ObjectBackend},
        metadata_store::MetadataStore,
    },
};

const CONTAINER_FILE: &str = "container.json";
/// Settings of a container deleted without purging; adopted on re-create.
const RETIRED_FILE: &str = "container.json.retired";
const METADATA_FILE: &str = "metadata.db";
const OBJECTS_DIR: &str = "objects";
const MAX_SEGMENT_LEN: usize = 128;

/// A registered container together with the stores that serve it.
pub struct ContainerHandle {
    pub container: Container,
    pub disk: Arc<dyn ObjectBackend>,
    pub metadata: MetadataStore,
    pub root: PathBuf,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("container", &self.container)
            .field("root", &self.root)
            .finish()
    }
}

type RegistryKey = (String, String);

/// Validate a user or container name used as a directory name.
///
/// Empty names are caller bugs and panic.
pub fn ensure_segment_safe(kind: &str, value: &str) -> StorageResult<()> {
    assert!(!value.is_empty(), "{kind} name must not be empty");
    let invalid = |reason: &str| {
        Err(StorageError::InvalidArgument(format!(
            "{kind} name `{value}` {reason}"
        )))
    };
    if value.len() > MAX_SEGMENT_LEN {
        return invalid("is too long");
    }
    if value.starts_with('.') {
        return invalid("cannot start with a dot");
    }
    if value
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\' || b == b'\0')
    {
        return invalid("contains a path separator or control character");
    }
    Ok(())
}

/// Owns the container registry for this node.
///
/// Create, update and delete are serialized on `provisioning`; the registry
/// lock itself is only taken for lookups and the final swap, never across
/// file system or SQLite work.
#[derive(Debug)]
pub struct ContainerManager {
    data_dir: PathBuf,
    registry: RwLock<HashMap<RegistryKey, Arc<ContainerHandle>>>,
    provisioning: Mutex<()>,
}

impl ContainerManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            registry: RwLock::new(HashMap::new()),
            provisioning: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn container_root(&self, user: &str, name: &str) -> PathBuf {
        self.data_dir.join(user).join(name)
    }

    /// Rebuild the registry from `container.json` files under `data_dir`.
    ///
    /// Returns the number of containers registered.
    pub async fn load(&self) -> StorageResult<usize> {
        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|err| StorageError::from_io(err, self.data_dir.display()))?;

        let mut loaded = 0;
        let mut users = fs::read_dir(&self.data_dir)
            .await
            .map_err(|err| StorageError::from_io(err, self.data_dir.display()))?;
        while let Some(user_dir) = users
            .next_entry()
            .await
            .map_err(|err| StorageError::from_io(err, self.data_dir.display()))?
        {
            if !user_dir.path().is_dir() {
                continue;
            }
            let mut containers = fs::read_dir(user_dir.path())
                .await
                .map_err(|err| StorageError::from_io(err, user_dir.path().display()))?;
            while let Some(entry) = containers
                .next_entry()
                .await
                .map_err(|err| StorageError::from_io(err, user_dir.path().display()))?
            {
                let Some(container) = read_container_file(&entry.path(), CONTAINER_FILE).await?
                else {
                    continue;
                };
                let key = (container.user.clone(), container.name.clone());
                let handle = self.open_handle(container).await?;
                self.registry.write().await.insert(key, Arc::new(handle));
                loaded += 1;
            }
        }

        info!(containers = loaded, data_dir = %self.data_dir.display(), "container registry loaded");
        Ok(loaded)
    }

    async fn open_handle(&self, container: Container) -> StorageResult<ContainerHandle> {
        let root = self.container_root(&container.user, &container.name);
        let metadata = MetadataStore::open(root.join(METADATA_FILE), container.id).await?;
        let disk: Arc<dyn ObjectBackend> =
            Arc::new(DiskObjectStore::new(container.objects_dir.clone()));
        Ok(ContainerHandle {
            container,
            disk,
            metadata,
            root,
        })
    }

    /// Create the directory tree, initialize the metadata store and persist
    /// the settings. The caller registers the returned handle.
    ///
    /// A directory left behind by a non-purging delete is adopted, keeping
    /// its id, creation time and data.
    async fn provision(&self, settings: ContainerSettings) -> StorageResult<Arc<ContainerHandle>> {
        let root = self.container_root(&settings.user, &settings.name);
        let objects_dir = root.join(OBJECTS_DIR);
        fs::create_dir_all(&objects_dir)
            .await
            .map_err(|err| StorageError::from_io(err, objects_dir.display()))?;

        let existing = match read_container_file(&root, CONTAINER_FILE).await? {
            Some(active) => Some(active),
            None => read_container_file(&root, RETIRED_FILE).await?,
        };
        let (id, created_at) = match existing {
            Some(existing) => (existing.id, existing.created_at),
            None => (Uuid::new_v4(), Utc::now()),
        };
        let container = Container {
            id,
            user: settings.user,
            name: settings.name,
            objects_dir,
            public_read: settings.public_read,
            public_write: settings.public_write,
            audit_logging: settings.audit_logging,
            replication: settings.replication,
            created_at,
        };

        let handle = self.open_handle(container).await?;
        write_container_file(&root, &handle.container).await?;
        remove_if_present(&root.join(RETIRED_FILE)).await?;
        Ok(Arc::new(handle))
    }

    pub async fn create(&self, settings: ContainerSettings) -> StorageResult<Arc<ContainerHandle>> {
        ensure_segment_safe("user", &settings.user)?;
        ensure_segment_safe("container", &settings.name)?;

        let key = (settings.user.clone(), settings.name.clone());
        let _provisioning = self.provisioning.lock().await;
        if self.registry.read().await.contains_key(&key) {
            return Err(StorageError::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }

        let handle = self.provision(settings).await?;
        self.registry.write().await.insert(key, handle.clone());
        info!(user = %handle.container.user, container = %handle.container.name, "container created");
        Ok(handle)
    }

    /// Re-register an existing container under new settings, keeping its data.
    ///
    /// The current handle stays registered until the new one is provisioned,
    /// so a failed update leaves the container as it was.
    pub async fn update(&self, settings: ContainerSettings) -> StorageResult<Arc<ContainerHandle>> {
        ensure_segment_safe("user", &settings.user)?;
        ensure_segment_safe("container", &settings.name)?;

        let key = (settings.user.clone(), settings.name.clone());
        let _provisioning = self.provisioning.lock().await;
        if !self.registry.read().await.contains_key(&key) {
            return Err(StorageError::NotFound(format!("{}/{}", key.0, key.1)));
        }

        let handle = self.provision(settings).await?;
        self.registry.write().await.insert(key, handle.clone());
        info!(user = %handle.container.user, container = %handle.container.name, "container updated");
        Ok(handle)
    }

    pub async fn get(&self, user: &str, name: &str) -> Option<Arc<ContainerHandle>> {
        self.registry
            .read()
            .await
            .get(&(user.to_string(), name.to_string()))
            .cloned()
    }

    /// Unregister a container; with `purge_data` also remove its directory
    /// tree and metadata store.
    pub async fn delete(&self, user: &str, name: &str, purge_data: bool) -> StorageResult<()> {
        let _provisioning = self.provisioning.lock().await;
        let handle = self
            .registry
            .write()
            .await
            .remove(&(user.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("{user}/{name}")))?;

        if !purge_data {
            let active = handle.root.join(CONTAINER_FILE);
            match fs::rename(&active, handle.root.join(RETIRED_FILE)).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::from_io(err, active.display())),
            }
        } else {
            handle.metadata.close().await;
            match fs::remove_dir_all(&handle.root).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::from_io(err, handle.root.display())),
            }
            if let Some(user_dir) = handle.root.parent() {
                // Only succeeds once the user has no containers left.
                if let Err(err) = fs::remove_dir(user_dir).await {
                    debug!("kept user directory {}: {}", user_dir.display(), err);
                }
            }
        }

        info!(user, container = name, purge_data, "container deleted");
        Ok(())
    }

    /// Whether a non-purging delete left data behind for `user/name`.
    pub async fn has_retired(&self, user: &str, name: &str) -> bool {
        fs::try_exists(self.container_root(user, name).join(RETIRED_FILE))
            .await
            .unwrap_or(false)
    }

    pub async fn list_by_user(&self, user: &str) -> Vec<Container> {
        let mut containers: Vec<Container> = self
            .registry
            .read()
            .await
            .values()
            .filter(|h| h.container.user == user)
            .map(|h| h.container.clone())
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        containers
    }

    /// Ping every registered metadata store. Returns how many answered.
    pub async fn ping_all(&self) -> StorageResult<usize> {
        let handles: Vec<Arc<ContainerHandle>> =
            self.registry.read().await.values().cloned().collect();
        for handle in &handles {
            handle.metadata.ping().await?;
        }
        Ok(handles.len())
    }

    pub async fn list_all(&self) -> Vec<Container> {
        let mut containers: Vec<Container> = self
            .registry
            .read()
            .await
            .values()
            .map(|h| h.container.clone())
            .collect();
        containers.sort_by(|a, b| (&a.user, &a.name).cmp(&(&b.user, &b.name)));
        containers
    }

    pub async fn enumerate(
        &self,
        handle: &ContainerHandle,
        query: &EnumerationQuery,
    ) -> StorageResult<Vec<ObjectMetadata>> {
        handle.metadata.enumerate(query).await
    }
}

async fn read_container_file(root: &Path, file: &str) -> StorageResult<Option<Container>> {
    let path = root.join(file);
    match fs::read(&path).await {
        Ok(raw) => match serde_json::from_slice::<Container>(&raw) {
            Ok(container) => Ok(Some(container)),
            Err(err) => {
                warn!("ignoring unreadable {}: {}", path.display(), err);
                Ok(None)
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotADirectory => Ok(None),
        Err(err) => Err(StorageError::from_io(err, path.display())),
    }
}

async fn remove_if_present(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::from_io(err, path.display())),
    }
}

async fn write_container_file(root: &Path, container: &Container) -> StorageResult<()> {
    let path = root.join(CONTAINER_FILE);
    let tmp_path = root.join(format!(".{CONTAINER_FILE}.tmp"));
    let raw = serde_json::to_vec_pretty(container)
        .map_err(|err| StorageError::Server(err.to_string()))?;
    fs::write(&tmp_path, raw)
        .await
        .map_err(|err| StorageError::from_io(err, tmp_path.display()))?;
    fs::rename(&tmp_path, &path)
        .await
        .map_err(|err| StorageError::from_io(err, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::container::ReplicationMode;
    use crate::services::disk_store::once_stream;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn make_manager() -> (ContainerManager, TempDir) {
        let dir = TempDir::new().unwrap();
        (ContainerManager::new(dir.path().join("data")), dir)
    }

    #[tokio::test]
    async fn create_get_and_list() {
        let (manager, _dir) = make_manager();
        manager.load().await.unwrap();
        manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();
        manager
            .create(ContainerSettings::new("alice", "backup"))
            .await
            .unwrap();
        manager
            .create(ContainerSettings::new("bob", "docs"))
            .await
            .unwrap();

        let handle = manager.get("alice", "docs").await.unwrap();
        assert!(handle.container.objects_dir.is_dir());
        assert!(handle.root.join(METADATA_FILE).exists());
        assert!(manager.get("alice", "photos").await.is_none());

        let names: Vec<String> = manager
            .list_by_user("alice")
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["backup", "docs"]);
        assert_eq!(manager.list_all().await.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (manager, _dir) = make_manager();
        manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();
        let err = manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn failed_update_keeps_the_container_registered() {
        let (manager, _dir) = make_manager();
        let handle = manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();
        let objects_dir = handle.container.objects_dir.clone();
        drop(handle);
        std::fs::remove_dir_all(&objects_dir).unwrap();
        std::fs::write(&objects_dir, b"not a directory").unwrap();

        let settings = ContainerSettings::new("alice", "docs").with_audit_logging(true);
        assert!(manager.update(settings).await.is_err());

        let current = manager.get("alice", "docs").await.unwrap();
        assert!(!current.container.audit_logging);
        assert_eq!(manager.list_by_user("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn lookups_do_not_wait_for_provisioning() {
        let (manager, _dir) = make_manager();
        manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();

        let _busy = manager.provisioning.lock().await;
        let found = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            manager.get("alice", "docs"),
        )
        .await
        .unwrap();
        assert!(found.is_some());
        let listed =
            tokio::time::timeout(std::time::Duration::from_millis(200), manager.list_all())
                .await
                .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_directory_tree() {
        let (manager, _dir) = make_manager();
        let handle = manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();
        let root = handle.root.clone();
        drop(handle);

        manager.delete("alice", "docs", true).await.unwrap();
        assert!(!root.exists());
        assert!(manager.get("alice", "docs").await.is_none());
        assert!(matches!(
            manager.delete("alice", "docs", true).await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn readding_without_purge_keeps_identity_and_data() {
        let (manager, _dir) = make_manager();
        let handle = manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();
        let id = handle.container.id;
        handle
            .disk
            .write(&id.to_string(), once_stream(Bytes::from_static(b"kept")), None)
            .await
            .unwrap();
        drop(handle);

        manager.delete("alice", "docs", false).await.unwrap();
        let settings = ContainerSettings::new("alice", "docs")
            .with_audit_logging(true)
            .with_replication(ReplicationMode::Async);
        let readded = manager.create(settings).await.unwrap();

        assert_eq!(readded.container.id, id);
        assert!(readded.container.audit_logging);
        assert!(readded.disk.exists(&id.to_string()).await.unwrap());
        assert!(!manager.has_retired("alice", "docs").await);
    }

    #[tokio::test]
    async fn retired_containers_stay_deleted_across_restarts() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        {
            let manager = ContainerManager::new(&data_dir);
            manager
                .create(ContainerSettings::new("alice", "docs"))
                .await
                .unwrap();
            manager.delete("alice", "docs", false).await.unwrap();
            assert!(manager.has_retired("alice", "docs").await);
        }

        let manager = ContainerManager::new(&data_dir);
        assert_eq!(manager.load().await.unwrap(), 0);
        assert!(manager.get("alice", "docs").await.is_none());
    }

    #[tokio::test]
    async fn update_rewrites_settings() {
        let (manager, _dir) = make_manager();
        manager
            .create(ContainerSettings::new("alice", "docs"))
            .await
            .unwrap();
        let updated = manager
            .update(ContainerSettings::new("alice", "docs").with_replication(ReplicationMode::Sync))
            .await
            .unwrap();
        assert_eq!(updated.container.replication, ReplicationMode::Sync);

        let err = manager
            .update(ContainerSettings::new("alice", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_rebuilds_registry_from_disk() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        {
            let manager = ContainerManager::new(&data_dir);
            manager
                .create(ContainerSettings::new("alice", "docs").with_audit_logging(true))
                .await
                .unwrap();
            manager
                .create(ContainerSettings::new("bob", "photos"))
                .await
                .unwrap();
        }

        let manager = ContainerManager::new(&data_dir);
        assert_eq!(manager.load().await.unwrap(), 2);
        let docs = manager.get("alice", "docs").await.unwrap();
        assert!(docs.container.audit_logging);
    }

    #[tokio::test]
    async fn unsafe_names_are_rejected() {
        let (manager, _dir) = make_manager();
        for name in ["../etc", ".hidden", "a/b"] {
            let err = manager
                .create(ContainerSettings::new("alice", name))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidArgument(_)));
        }
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_names_are_programmer_errors() {
        let _ = ensure_segment_safe("user", "");
    }
}
