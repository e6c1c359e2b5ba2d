//! src/services/resync.rs
//!
//! Resync: pulls a peer's container and object inventory and repairs local
//! divergence. Objects missing locally are fetched; objects whose content
//! hash differs are deleted and fetched again; matching objects are left
//! alone.
//!
//! Workers run on their own task. Cancellation is cooperative and checked
//! between containers and between objects, never in the middle of a
//! transfer. When a worker ends, for any reason, its completion callback
//! runs exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    errors::{ErrorKind, StorageError, StorageResult},
    models::{container::Container, node::Node, object::ObjectMetadata},
    services::{
        disk_store::once_stream,
        replication::PeerClient,
        storage_service::{NewObject, RequestContext, StorageService},
    },
};

/// Objects requested from the source per enumeration page.
pub const RESYNC_PAGE_SIZE: u32 = 100;

/// What to reconcile, and against whom.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResyncSettings {
    pub source: Node,
    /// Limit to one user's containers.
    #[serde(default)]
    pub user: Option<String>,
    /// Limit to one container name; combine with `user`.
    #[serde(default)]
    pub container: Option<String>,
}

type ResyncKey = (u32, Option<String>, Option<String>);

impl ResyncSettings {
    fn key(&self) -> ResyncKey {
        (self.source.id, self.user.clone(), self.container.clone())
    }

    fn includes(&self, container: &Container) -> bool {
        self.user.as_ref().is_none_or(|u| *u == container.user)
            && self.container.as_ref().is_none_or(|n| *n == container.name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ResyncStats {
    pub containers_seen: u64,
    pub containers_processed: u64,
    pub objects_seen: u64,
    /// Objects confirmed in sync, whether copied or already matching.
    pub objects_processed: u64,
    pub bytes_seen: u64,
    /// Bytes actually transferred from the source.
    pub bytes_processed: u64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

/// Snapshot of one worker.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResyncReport {
    pub settings: ResyncSettings,
    pub state: ResyncState,
    pub stats: ResyncStats,
}

impl ResyncReport {
    fn finish(&mut self, state: ResyncState) {
        let now = Utc::now();
        self.state = state;
        self.stats.finished_at = Some(now);
        if let Some(started) = self.stats.started_at {
            self.stats.elapsed_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&ResyncReport) + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs the completion callback when the worker task ends or is dropped.
struct Completion {
    progress: Arc<Mutex<ResyncReport>>,
    callback: Option<CompletionCallback>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        let report = {
            let mut report = lock(&self.progress);
            if report.state == ResyncState::Running {
                report.stats.errors.push("worker ended unexpectedly".into());
                report.finish(ResyncState::Failed);
            }
            report.clone()
        };
        callback(&report);
    }
}

/// Control surface of a spawned worker.
pub struct ResyncHandle {
    cancel: watch::Sender<bool>,
    progress: Arc<Mutex<ResyncReport>>,
    task: JoinHandle<()>,
}

impl ResyncHandle {
    /// Ask the worker to stop at its next checkpoint.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }

    pub fn status(&self) -> ResyncReport {
        lock(&self.progress).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct ResyncWorker {
    service: StorageService,
    client: Arc<dyn PeerClient>,
    settings: ResyncSettings,
    ctx: RequestContext,
    progress: Arc<Mutex<ResyncReport>>,
    cancel: watch::Receiver<bool>,
}

impl ResyncWorker {
    /// Start reconciling in the background.
    pub fn spawn(
        service: StorageService,
        settings: ResyncSettings,
        on_complete: CompletionCallback,
    ) -> ResyncHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let progress = Arc::new(Mutex::new(ResyncReport {
            settings: settings.clone(),
            state: ResyncState::Running,
            stats: ResyncStats {
                started_at: Some(Utc::now()),
                ..ResyncStats::default()
            },
        }));
        let completion = Completion {
            progress: progress.clone(),
            callback: Some(on_complete),
        };
        let worker = ResyncWorker {
            client: service.peer_client(),
            ctx: RequestContext::peer(settings.source.id),
            service,
            settings,
            progress: progress.clone(),
            cancel: cancel_rx,
        };

        let task = tokio::spawn(async move {
            let _completion = completion;
            info!(source = worker.settings.source.id, user = ?worker.settings.user, container = ?worker.settings.container, "resync started");
            let state = worker.run().await;
            let mut report = lock(&worker.progress);
            report.finish(state);
            info!(
                source = worker.settings.source.id,
                state = ?state,
                objects = report.stats.objects_processed,
                errors = report.stats.errors.len(),
                elapsed_ms = report.stats.elapsed_ms,
                "resync finished"
            );
        });

        ResyncHandle {
            cancel: cancel_tx,
            progress,
            task,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn record(&self, update: impl FnOnce(&mut ResyncStats)) {
        update(&mut lock(&self.progress).stats);
    }

    fn record_error(&self, what: String, err: &StorageError) {
        warn!(source = self.settings.source.id, %what, error = %err, "resync error");
        self.record(|stats| stats.errors.push(format!("{what}: {err}")));
    }

    async fn run(&self) -> ResyncState {
        let source = &self.settings.source;
        let containers = match self
            .client
            .list_containers(source, self.settings.user.as_deref())
            .await
        {
            Ok(containers) => containers,
            Err(err) => {
                self.record_error(format!("listing containers on node {}", source.id), &err.into());
                return ResyncState::Failed;
            }
        };

        for remote in containers.iter().filter(|c| self.settings.includes(c)) {
            if self.cancelled() {
                return ResyncState::Cancelled;
            }
            self.record(|stats| stats.containers_seen += 1);
            match self.sync_container(remote).await {
                Ok(true) => self.record(|stats| stats.containers_processed += 1),
                Ok(false) => return ResyncState::Cancelled,
                Err(err) => self.record_error(format!("{}/{}", remote.user, remote.name), &err),
            }
        }
        ResyncState::Completed
    }

    /// Returns `false` when cancelled part-way.
    async fn sync_container(&self, remote: &Container) -> StorageResult<bool> {
        if self.service.containers.get(&remote.user, &remote.name).await.is_none() {
            match self.service.create_container(&self.ctx, remote.settings()).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }

        let mut index_start = 0;
        loop {
            if self.cancelled() {
                return Ok(false);
            }
            let page = self
                .client
                .enumerate_objects(
                    &self.settings.source,
                    &remote.user,
                    &remote.name,
                    index_start,
                    RESYNC_PAGE_SIZE,
                )
                .await?;
            if page.is_empty() {
                return Ok(true);
            }
            index_start += page.len() as u64;

            for meta in &page {
                if self.cancelled() {
                    return Ok(false);
                }
                self.record(|stats| {
                    stats.objects_seen += 1;
                    stats.bytes_seen += meta.content_length;
                });
                match self.sync_object(remote, meta).await {
                    Ok(copied) => self.record(|stats| {
                        stats.objects_processed += 1;
                        stats.bytes_processed += copied;
                    }),
                    Err(err) => self.record_error(
                        format!("{}/{}/{}", remote.user, remote.name, meta.key),
                        &err,
                    ),
                }
            }
        }
    }

    /// Returns the number of bytes copied; zero when already in sync.
    async fn sync_object(&self, remote: &Container, meta: &ObjectMetadata) -> StorageResult<u64> {
        let (user, name) = (remote.user.as_str(), remote.name.as_str());
        match self
            .service
            .object_metadata(&self.ctx, user, name, &meta.key)
            .await
        {
            Ok(local) if local.content_hash == meta.content_hash => return Ok(0),
            Ok(_) => {
                self.service
                    .delete_object(&self.ctx, user, name, &meta.key)
                    .await?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let data = self
            .client
            .fetch_object(&self.settings.source, user, name, &meta.key)
            .await?;
        let copied = data.len() as u64;
        let object = NewObject {
            key: meta.key.clone(),
            content_type: Some(meta.content_type.clone()),
            content_length: Some(copied),
            tags: meta.tags.clone(),
            key_values: meta.key_values.clone(),
        };
        self.service
            .write_object(&self.ctx, user, name, object, once_stream(data))
            .await?;
        Ok(copied)
    }
}

/// Tracks running workers and keeps the last report per target.
#[derive(Clone)]
pub struct ResyncManager {
    service: StorageService,
    running: Arc<Mutex<HashMap<ResyncKey, ResyncHandle>>>,
    history: Arc<Mutex<HashMap<ResyncKey, ResyncReport>>>,
}

impl ResyncManager {
    pub fn new(service: StorageService) -> Self {
        Self {
            service,
            running: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a worker unless one is already running for the same target.
    pub fn start(&self, settings: ResyncSettings) -> StorageResult<ResyncReport> {
        let key = settings.key();
        let mut running = lock(&self.running);
        if running.contains_key(&key) {
            return Err(StorageError::AlreadyExists(format!(
                "resync from node {} for {}",
                settings.source.id,
                describe(&key)
            )));
        }

        let slots = self.running.clone();
        let history = self.history.clone();
        let slot = key.clone();
        let handle = ResyncWorker::spawn(
            self.service.clone(),
            settings,
            Box::new(move |report| {
                lock(&history).insert(slot.clone(), report.clone());
                lock(&slots).remove(&slot);
            }),
        );
        let report = handle.status();
        running.insert(key, handle);
        Ok(report)
    }

    pub fn stop(&self, settings: &ResyncSettings) -> StorageResult<ResyncReport> {
        let key = settings.key();
        let running = lock(&self.running);
        let handle = running
            .get(&key)
            .ok_or_else(|| StorageError::NotFound(format!("resync for {}", describe(&key))))?;
        handle.stop();
        Ok(handle.status())
    }

    pub fn status(&self, settings: &ResyncSettings) -> Option<ResyncReport> {
        let key = settings.key();
        if let Some(handle) = lock(&self.running).get(&key) {
            return Some(handle.status());
        }
        lock(&self.history).get(&key).cloned()
    }

    /// Running workers first, then finished ones.
    pub fn list(&self) -> Vec<ResyncReport> {
        let mut reports: Vec<ResyncReport> =
            lock(&self.running).values().map(ResyncHandle::status).collect();
        reports.extend(lock(&self.history).values().cloned());
        reports
    }
}

fn describe((_, user, container): &ResyncKey) -> String {
    format!(
        "{}/{}",
        user.as_deref().unwrap_or("*"),
        container.as_deref().unwrap_or("*")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::container::ContainerSettings,
        services::{
            disk_store::content_hash,
            replication::PeerError,
            testing::{self, LoopbackPeer, RecordingPeer},
        },
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{Notify, Semaphore, oneshot};

    const PHOTOS: [(&str, &[u8]); 3] = [
        ("2024/beach.jpg", b"sand and sea"),
        ("2024/city.jpg", b"lights"),
        ("cat.png", b"meow"),
    ];

    fn source_settings(user: Option<&str>, container: Option<&str>) -> ResyncSettings {
        ResyncSettings {
            source: testing::node(2),
            user: user.map(str::to_string),
            container: container.map(str::to_string),
        }
    }

    /// Node 2 holds `bob/photos`; node 1 pulls from it through `client`.
    async fn cluster(
        dir: &TempDir,
        client: Arc<dyn PeerClient>,
        loopback: &LoopbackPeer,
    ) -> (StorageService, StorageService) {
        let source = testing::service(
            &dir.path().join("source"),
            testing::topology(2, 2, 1),
            Arc::new(RecordingPeer::default()),
        )
        .await;
        let target =
            testing::service(&dir.path().join("target"), testing::topology(1, 2, 1), client).await;
        loopback.register(2, source.clone());

        let ctx = RequestContext::client("bob", "");
        source
            .create_container(&ctx, ContainerSettings::new("bob", "photos"))
            .await
            .unwrap();
        for (key, data) in PHOTOS {
            source
                .write_object(
                    &ctx,
                    "bob",
                    "photos",
                    NewObject::new(key),
                    once_stream(Bytes::from_static(data)),
                )
                .await
                .unwrap();
        }
        (source, target)
    }

    async fn run_to_completion(service: &StorageService, settings: ResyncSettings) -> ResyncReport {
        let (tx, rx) = oneshot::channel();
        ResyncWorker::spawn(
            service.clone(),
            settings,
            Box::new(move |report| {
                let _ = tx.send(report.clone());
            }),
        );
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn missing_objects_are_copied_with_matching_hashes() {
        let dir = TempDir::new().unwrap();
        let peer = Arc::new(LoopbackPeer::default());
        let (_source, target) = cluster(&dir, peer.clone(), &peer).await;

        let report = run_to_completion(&target, source_settings(Some("bob"), None)).await;
        assert_eq!(report.state, ResyncState::Completed);
        assert_eq!(report.stats.containers_processed, 1);
        assert_eq!(report.stats.objects_processed, 3);
        assert!(report.stats.errors.is_empty(), "{:?}", report.stats.errors);
        assert!(report.stats.finished_at.is_some());

        let ctx = RequestContext::peer(2);
        for (key, data) in PHOTOS {
            let meta = target
                .object_metadata(&ctx, "bob", "photos", key)
                .await
                .unwrap();
            assert_eq!(meta.content_hash, content_hash(data));
        }
    }

    #[tokio::test]
    async fn only_divergent_objects_are_fetched_again() {
        let dir = TempDir::new().unwrap();
        let peer = Arc::new(LoopbackPeer::default());
        let (_source, target) = cluster(&dir, peer.clone(), &peer).await;
        run_to_completion(&target, source_settings(Some("bob"), Some("photos"))).await;
        assert_eq!(peer.fetches(), 3);

        let ctx = RequestContext::peer(2);
        target
            .write_range(&ctx, "bob", "photos", "cat.png", 0, Bytes::from_static(b"woof"))
            .await
            .unwrap();

        let report = run_to_completion(&target, source_settings(Some("bob"), Some("photos"))).await;
        assert_eq!(report.state, ResyncState::Completed);
        assert_eq!(report.stats.objects_processed, 3);
        assert_eq!(report.stats.bytes_processed, 4);
        assert_eq!(peer.fetches(), 4);
        let repaired = target
            .object_metadata(&ctx, "bob", "photos", "cat.png")
            .await
            .unwrap();
        assert_eq!(repaired.content_hash, content_hash(b"meow"));
    }

    #[tokio::test]
    async fn unreachable_source_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let target = testing::service(
            dir.path(),
            testing::topology(1, 2, 1),
            Arc::new(LoopbackPeer::default()),
        )
        .await;
        let report = run_to_completion(&target, source_settings(None, None)).await;
        assert_eq!(report.state, ResyncState::Failed);
        assert_eq!(report.stats.errors.len(), 1);
    }

    /// Blocks every fetch until the test lets it through.
    struct GatedPeer {
        inner: Arc<LoopbackPeer>,
        entered: Notify,
        gate: Semaphore,
    }

    #[async_trait::async_trait]
    impl PeerClient for GatedPeer {
        async fn deliver(
            &self,
            node: &Node,
            message: &crate::models::message::ReplicationMessage,
        ) -> Result<(), PeerError> {
            self.inner.deliver(node, message).await
        }

        async fn list_containers(
            &self,
            node: &Node,
            user: Option<&str>,
        ) -> Result<Vec<Container>, PeerError> {
            self.inner.list_containers(node, user).await
        }

        async fn enumerate_objects(
            &self,
            node: &Node,
            user: &str,
            container: &str,
            index_start: u64,
            max_results: u32,
        ) -> Result<Vec<ObjectMetadata>, PeerError> {
            self.inner
                .enumerate_objects(node, user, container, index_start, max_results)
                .await
        }

        async fn fetch_object(
            &self,
            node: &Node,
            user: &str,
            container: &str,
            key: &str,
        ) -> Result<Bytes, PeerError> {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            self.inner.fetch_object(node, user, container, key).await
        }
    }

    #[tokio::test]
    async fn stop_cancels_between_objects_and_frees_the_slot() {
        let dir = TempDir::new().unwrap();
        let loopback = Arc::new(LoopbackPeer::default());
        let gated = Arc::new(GatedPeer {
            inner: loopback.clone(),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        });
        let (_source, target) = cluster(&dir, gated.clone(), &loopback).await;
        let manager = ResyncManager::new(target.clone());
        let settings = source_settings(Some("bob"), Some("photos"));

        let started = manager.start(settings.clone()).unwrap();
        assert_eq!(started.state, ResyncState::Running);
        let err = manager.start(settings.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        // First transfer is in flight; cancel, then let it finish.
        gated.entered.notified().await;
        manager.stop(&settings).unwrap();
        gated.gate.add_permits(10);

        let mut report = manager.status(&settings).unwrap();
        for _ in 0..200 {
            if report.state != ResyncState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            report = manager.status(&settings).unwrap();
        }
        assert_eq!(report.state, ResyncState::Cancelled);
        assert_eq!(report.stats.objects_processed, 1);
        assert!(report.stats.elapsed_ms < 60_000);

        // The slot is free again.
        for _ in 0..200 {
            if manager.start(settings.clone()).is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("resync slot was never released");
    }

    #[tokio::test]
    async fn aborted_workers_still_report_once() {
        let dir = TempDir::new().unwrap();
        let loopback = Arc::new(LoopbackPeer::default());
        let gated = Arc::new(GatedPeer {
            inner: loopback.clone(),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        });
        let (_source, target) = cluster(&dir, gated.clone(), &loopback).await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let handle = ResyncWorker::spawn(
            target,
            source_settings(None, None),
            Box::new(move |report| lock(&seen).push(report.state)),
        );
        gated.entered.notified().await;
        handle.task.abort();
        for _ in 0..200 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*lock(&calls), vec![ResyncState::Failed]);
    }
}
