//! src/services/disk_store.rs
//!
//! Byte-level object handling. [`ObjectBackend`] is the capability set every
//! storage backend offers; [`DiskObjectStore`] keeps one file per object
//! beneath `objects_dir/{hex[0..2]}/{hex[2..4]}/{name}`.
//!
//! Names are internal object identifiers, never user-supplied keys.

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::{
    errors::{StorageError, StorageResult},
    services::lock_manager::LockGuard,
};

/// Streamed object body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const HASH_BUFFER_LEN: usize = 64 * 1024;

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn once_stream(data: Bytes) -> ByteStream {
    futures::stream::once(async move { Ok(data) }).boxed()
}

/// Result of a full or ranged write: the object's length and hash afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub content_length: u64,
    pub content_hash: String,
}

/// An opened object ready for streaming out.
///
/// Locks handed to [`ObjectReader::holding`] stay held until the reader, or
/// the stream made from it, is dropped.
#[derive(Debug)]
pub struct ObjectReader {
    pub file: File,
    pub content_length: u64,
    held: Vec<LockGuard>,
}

impl ObjectReader {
    pub fn new(file: File, content_length: u64) -> Self {
        Self {
            file,
            content_length,
            held: Vec::new(),
        }
    }

    /// Keep `guards` alive for as long as the body is being read.
    pub fn holding(mut self, guards: impl IntoIterator<Item = LockGuard>) -> Self {
        self.held.extend(guards);
        self
    }

    /// Stream the body in chunks, releasing held locks once the stream is
    /// dropped.
    pub fn into_stream(self) -> ByteStream {
        let Self { file, held, .. } = self;
        ReaderStream::new(file)
            .map(move |chunk| {
                let _held = &held;
                chunk
            })
            .boxed()
    }

    /// Buffer the whole object.
    pub async fn into_bytes(mut self) -> StorageResult<Bytes> {
        let mut buf = Vec::with_capacity(self.content_length as usize);
        self.file
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::from_io(err, "object body"))?;
        if buf.len() as u64 != self.content_length {
            return Err(StorageError::Stream(format!(
                "object changed while reading: expected {} bytes, read {}",
                self.content_length,
                buf.len()
            )));
        }
        Ok(Bytes::from(buf))
    }
}

/// Capability set of an object storage backend.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Store a new object, replacing any file already at `name`.
    ///
    /// When `content_length` is given, a body of any other length fails
    /// with a stream error and nothing is stored.
    async fn write(
        &self,
        name: &str,
        body: ByteStream,
        content_length: Option<u64>,
    ) -> StorageResult<WriteOutcome>;

    /// Overwrite bytes starting at `offset`, extending the object if needed.
    async fn write_range(&self, name: &str, offset: u64, data: Bytes)
    -> StorageResult<WriteOutcome>;

    async fn read(&self, name: &str) -> StorageResult<ObjectReader>;

    /// Read exactly `count` bytes at `offset`, or fail `OutOfRange`.
    async fn read_range(&self, name: &str, offset: u64, count: u64) -> StorageResult<Bytes>;

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn delete(&self, name: &str) -> StorageResult<()>;

    async fn size(&self, name: &str) -> StorageResult<u64>;

    async fn truncate(&self, name: &str, len: u64) -> StorageResult<()>;
}

/// File-per-object backend with a 2-level fan-out directory layout.
#[derive(Debug, Clone)]
pub struct DiskObjectStore {
    objects_dir: PathBuf,
}

impl DiskObjectStore {
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            objects_dir: objects_dir.into(),
        }
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Compute the physical path for an object name.
    ///
    /// Parent directories may not exist yet.
    fn object_path(&self, name: &str) -> StorageResult<PathBuf> {
        if name.len() < 4
            || name.contains(['/', '\\'])
            || name.starts_with('.')
            || name.bytes().any(|b| b.is_ascii_control())
        {
            return Err(StorageError::InvalidArgument(format!(
                "invalid object name `{name}`"
            )));
        }
        Ok(self
            .objects_dir
            .join(&name[0..2])
            .join(&name[2..4])
            .join(name))
    }

    async fn hash_file(path: &Path) -> StorageResult<WriteOutcome> {
        let mut file = File::open(path)
            .await
            .map_err(|err| StorageError::from_io(err, path.display()))?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; HASH_BUFFER_LEN];
        let mut content_length = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|err| StorageError::from_io(err, path.display()))?;
            if n == 0 {
                break;
            }
            content_length += n as u64;
            digest.consume(&buf[..n]);
        }
        Ok(WriteOutcome {
            content_length,
            content_hash: format!("{:x}", digest.compute()),
        })
    }

    /// Recursively remove empty directories up to the objects root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.objects_dir) && current != self.objects_dir {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Hash an in-memory buffer the same way the disk store hashes files.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[async_trait::async_trait]
impl ObjectBackend for DiskObjectStore {
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let path = self.object_path(name)?;
        fs::try_exists(&path)
            .await
            .map_err(|err| StorageError::from_io(err, path.display()))
    }

    /// Stream the body to a temporary file, hashing as bytes arrive, then
    /// rename it into place. Temp files are removed on every failure path.
    async fn write(
        &self,
        name: &str,
        mut body: ByteStream,
        content_length: Option<u64>,
    ) -> StorageResult<WriteOutcome> {
        let path = self.object_path(name)?;
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Server("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StorageError::from_io(err, parent.display()))?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|err| StorageError::from_io(err, tmp_path.display()))?;

        let mut written: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Stream(err.to_string()));
                }
            };
            written += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::from_io(err, path.display()));
            }
        }

        if let Some(expected) = content_length {
            if expected != written {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Stream(format!(
                    "expected {expected} bytes, received {written}"
                )));
            }
        }

        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::from_io(err, path.display()));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::from_io(err, path.display()));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&path)
                    .await
                    .map_err(|err| StorageError::from_io(err, path.display()))?;
                fs::rename(&tmp_path, &path)
                    .await
                    .map_err(|err| StorageError::from_io(err, path.display()))?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::from_io(err, path.display()));
            }
        }

        debug!(name, path = %path.display(), size = written, "stored object file");
        Ok(WriteOutcome {
            content_length: written,
            content_hash: format!("{:x}", digest.compute()),
        })
    }

    async fn write_range(
        &self,
        name: &str,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<WriteOutcome> {
        let path = self.object_path(name)?;
        let io_err = |err: io::Error| StorageError::from_io(err, path.display());

        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        file.write_all(&data).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        Self::hash_file(&path).await
    }

    async fn read(&self, name: &str) -> StorageResult<ObjectReader> {
        let path = self.object_path(name)?;
        let file = File::open(&path)
            .await
            .map_err(|err| StorageError::from_io(err, path.display()))?;
        let content_length = file
            .metadata()
            .await
            .map_err(|err| StorageError::from_io(err, path.display()))?
            .len();
        Ok(ObjectReader::new(file, content_length))
    }

    async fn read_range(&self, name: &str, offset: u64, count: u64) -> StorageResult<Bytes> {
        let ObjectReader {
            mut file,
            content_length: size,
            ..
        } = self.read(name).await?;

        let in_bounds = offset
            .checked_add(count)
            .is_some_and(|end| end <= size);
        if !in_bounds {
            return Err(StorageError::OutOfRange {
                offset,
                count,
                size,
            });
        }

        let path = self.object_path(name)?;
        let io_err = |err: io::Error| StorageError::from_io(err, path.display());
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut buf = vec![0u8; count as usize];
        file.read_exact(&mut buf).await.map_err(io_err)?;
        Ok(Bytes::from(buf))
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.object_path(from)?;
        let to_path = self.object_path(to)?;

        if !self.exists(from).await? {
            return Err(StorageError::NotFound(from.to_string()));
        }
        if self.exists(to).await? {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::from_io(err, parent.display()))?;
        }
        fs::rename(&from_path, &to_path)
            .await
            .map_err(|err| StorageError::from_io(err, from_path.display()))?;

        if let Some(parent) = from_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        debug!(from, to, "renamed object file");
        Ok(())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed object file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(err) => return Err(StorageError::from_io(err, path.display())),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn size(&self, name: &str) -> StorageResult<u64> {
        let path = self.object_path(name)?;
        fs::metadata(&path)
            .await
            .map(|meta| meta.len())
            .map_err(|err| StorageError::from_io(err, path.display()))
    }

    async fn truncate(&self, name: &str, len: u64) -> StorageResult<()> {
        let path = self.object_path(name)?;
        let io_err = |err: io::Error| StorageError::from_io(err, path.display());
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.set_len(len).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(())
    }
}
