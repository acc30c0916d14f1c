//! Bucket sync between an S3 bucket and a local directory tree.
//!
//! Object keys are `/`-separated paths relative to the local root. Every
//! object or file is an independent task; tasks run on a bounded pool and a
//! failing task never aborts its siblings. The outcome of every task is
//! collected into a [`TransferReport`] once all of them have finished.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use futures::stream::{self, StreamExt};
use regex::Regex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::BucketConfig;
use crate::MESSAGE_CLIENT_NOT_DEFINED;

pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{}", MESSAGE_CLIENT_NOT_DEFINED)]
    ClientNotConfigured,

    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<E, R> From<SdkError<E, R>> for Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    fn from(err: SdkError<E, R>) -> Self {
        let message = DisplayErrorContext(&err).to_string();
        return match err {
            SdkError::ServiceError(_) => Error::ServiceError(message),
            _ => Error::UnknownError(message),
        };
    }
}

/// Why a single object or file was not transferred.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("Unable to create dir: {0}")]
    CreateDir(#[source] std::io::Error),

    #[error("Unable to create file: {0}")]
    CreateFile(#[source] std::io::Error),

    #[error("Unable to download item: {0}")]
    Download(#[source] Error),

    #[error("Unable to upload file: {0}")]
    Upload(#[source] Error),

    #[error("Key `{0}` does not map to a path inside the local directory")]
    InvalidKey(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct TransferOutcome {
    pub key: String,
    pub path: PathBuf,
    pub result: Result<u64, TransferError>,
}

#[derive(Debug, Default)]
pub struct TransferReport {
    pub outcomes: Vec<TransferOutcome>,
}

impl TransferReport {
    pub fn is_empty(&self) -> bool {
        return self.outcomes.is_empty();
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TransferOutcome> {
        return self.outcomes.iter().filter(|outcome| outcome.result.is_ok());
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferOutcome> {
        return self.outcomes.iter().filter(|outcome| outcome.result.is_err());
    }

    pub fn bytes_transferred(&self) -> u64 {
        return self
            .outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok())
            .sum();
    }

    pub fn is_success(&self) -> bool {
        return self.failed().next().is_none();
    }
}

/// The S3 calls bucket sync relies on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every key in the bucket, across all listing pages.
    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, Error>;

    /// Streams the object body into `destination`, returning the bytes written.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, Error>;

    async fn upload(&self, bucket: &str, key: &str, source: &Path) -> Result<u64, Error>;
}

pub struct Bucket {
    pub name: String,
    pub local_dir: PathBuf,
    pub exclude: Option<String>,

    concurrency: usize,
    client: Option<Arc<dyn ObjectStore>>,
    cancellation: CancellationToken,
}

impl Bucket {
    pub fn new(name: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        return Self {
            name: name.into(),
            local_dir: local_dir.into(),
            exclude: None,
            concurrency: DEFAULT_CONCURRENCY,
            client: None,
            cancellation: CancellationToken::new(),
        };
    }

    pub fn with_client(mut self, client: Arc<dyn ObjectStore>) -> Self {
        self.client = Some(client);
        return self;
    }

    /// Builds an unbound bucket from a deployment file entry.
    pub fn from_config(config: &BucketConfig) -> Self {
        let mut bucket = Bucket::new(
            config.bucket.clone().unwrap_or_default(),
            config.local_dir.clone(),
        );
        bucket.exclude = config.exclude.clone();
        if let Some(concurrency) = config.concurrency {
            bucket = bucket.with_concurrency(concurrency);
        }

        return bucket;
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        return self;
    }

    pub fn concurrency(&self) -> usize {
        return self.concurrency;
    }

    /// Tasks still pending or in flight when `token` fires end as
    /// [`TransferError::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        return self;
    }

    pub fn initialize(&mut self, sdk_config: &aws_types::SdkConfig) {
        self.client = Some(Arc::new(aws_sdk_s3::Client::new(sdk_config)));
    }

    fn client(&self) -> Result<Arc<dyn ObjectStore>, Error> {
        return self.client.clone().ok_or(Error::ClientNotConfigured);
    }

    /// Downloads every object not matching `exclude_pattern` (or the bucket's
    /// own `exclude` when `None`) into the local directory, recreating the key
    /// hierarchy.
    pub async fn download(&self, exclude_pattern: Option<&str>) -> Result<TransferReport, Error> {
        let client = self.client()?;
        let exclude = exclude_pattern
            .or(self.exclude.as_deref())
            .map(Regex::new)
            .transpose()?;

        let keys = client.list_keys(&self.name).await?;
        let tasks: Vec<String> = keys
            .into_iter()
            .filter(|key| {
                if key.ends_with('/') {
                    debug!(bucket = %self.name, key = %key, "Skipping folder placeholder");
                    return false;
                }
                match &exclude {
                    Some(pattern) if pattern.is_match(key) => {
                        debug!(bucket = %self.name, key = %key, "Excluded");
                        false
                    }
                    _ => true,
                }
            })
            .collect();

        info!(bucket = %self.name, objects = tasks.len(), "Downloading bucket");

        let outcomes = stream::iter(tasks)
            .map(|key| {
                let client = client.clone();
                async move {
                    let path = local_path(&self.local_dir, &key);
                    let result = match &path {
                        Some(path) => {
                            self.guard(save_object(client.as_ref(), &self.name, &key, path))
                                .await
                        }
                        None => Err(TransferError::InvalidKey(key.clone())),
                    };
                    self.outcome(key, path.unwrap_or_default(), result)
                }
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        return Ok(self.report(outcomes));
    }

    /// Uploads every regular file under the local directory, keyed by its
    /// relative path.
    pub async fn upload(&self) -> Result<TransferReport, Error> {
        let client = self.client()?;

        let files = list_files(&self.local_dir);
        info!(bucket = %self.name, files = files.len(), "Uploading directory");

        let outcomes = stream::iter(files)
            .map(|path| {
                let client = client.clone();
                async move {
                    let key = to_key(&self.local_dir, &path);
                    let result = self
                        .guard(async {
                            client
                                .upload(&self.name, &key, &path)
                                .await
                                .map_err(TransferError::Upload)
                        })
                        .await;
                    self.outcome(key, path, result)
                }
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        return Ok(self.report(outcomes));
    }

    async fn guard<F>(&self, transfer: F) -> Result<u64, TransferError>
    where
        F: std::future::Future<Output = Result<u64, TransferError>>,
    {
        if self.cancellation.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        return tokio::select! {
            _ = self.cancellation.cancelled() => Err(TransferError::Cancelled),
            result = transfer => result,
        };
    }

    fn outcome(
        &self,
        key: String,
        path: PathBuf,
        result: Result<u64, TransferError>,
    ) -> TransferOutcome {
        if let Err(err) = &result {
            warn!(bucket = %self.name, key = %key, error = %err, "Transfer failed");
        }

        return TransferOutcome { key, path, result };
    }

    fn report(&self, outcomes: Vec<TransferOutcome>) -> TransferReport {
        let report = TransferReport { outcomes };
        info!(
            bucket = %self.name,
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            bytes = report.bytes_transferred(),
            "Transfer finished"
        );

        return report;
    }
}

async fn save_object(
    client: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    path: &Path,
) -> Result<u64, TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(TransferError::CreateDir)?;
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(TransferError::CreateFile)?;

    let written = client
        .download(bucket, key, &mut file)
        .await
        .map_err(TransferError::Download)?;
    file.flush()
        .await
        .map_err(|err| TransferError::Download(Error::Io(err)))?;

    return Ok(written);
}

/// Maps a key onto the local root, refusing keys that would escape it.
fn local_path(local_dir: &Path, key: &str) -> Option<PathBuf> {
    let mut path = local_dir.to_path_buf();
    for segment in key.split('/').filter(|segment| !segment.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            (Some(Component::CurDir), None) => {}
            _ => return None,
        }
    }

    if path == local_dir {
        return None;
    }

    return Some(path);
}

fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => warn!(root = %root.display(), error = %err, "Unable to walk directory"),
        }
    }

    return files;
}

fn to_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    return relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
}

#[async_trait]
impl ObjectStore for aws_sdk_s3::Client {
    async fn list_keys(&self, bucket: &str) -> Result<Vec<String>, Error> {
        let mut pages = self.list_objects_v2().bucket(bucket).into_paginator().send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            keys.extend(
                page?
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(String::from),
            );
        }

        return Ok(keys);
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, Error> {
        let output = self.get_object().bucket(bucket).key(key).send().await?;

        let mut body = output.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| Error::UnknownError(DisplayErrorContext(&err).to_string()))?
        {
            destination.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        return Ok(written);
    }

    async fn upload(&self, bucket: &str, key: &str, source: &Path) -> Result<u64, Error> {
        let length = tokio::fs::metadata(source).await?.len();
        let body = ByteStream::from_path(source)
            .await
            .map_err(|err| Error::UnknownError(DisplayErrorContext(&err).to_string()))?;

        self.put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await?;

        return Ok(length);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::io::{AsyncWrite, AsyncWriteExt};
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::BucketConfig;

    /// Every download takes a while and the number running at once is tracked.
    #[derive(Default)]
    struct SlowStore {
        keys: Vec<String>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for SlowStore {
        async fn list_keys(&self, _: &str) -> Result<Vec<String>, Error> {
            Ok(self.keys.clone())
        }

        async fn download(
            &self,
            _: &str,
            _: &str,
            destination: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, Error> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            destination.write_all(b"x").await?;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(1)
        }

        async fn upload(&self, _: &str, _: &str, _: &Path) -> Result<u64, Error> {
            Ok(0)
        }
    }

    /// Downloads announce themselves and then never finish.
    struct StuckStore {
        keys: Vec<String>,
        started: Arc<Notify>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for StuckStore {
        async fn list_keys(&self, _: &str) -> Result<Vec<String>, Error> {
            Ok(self.keys.clone())
        }

        async fn download(
            &self,
            _: &str,
            _: &str,
            _: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            std::future::pending::<Result<u64, Error>>().await
        }

        async fn upload(&self, _: &str, _: &str, _: &Path) -> Result<u64, Error> {
            Ok(0)
        }
    }

    fn numbered_keys(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("objects/{}.bin", index)).collect()
    }

    #[derive(Default)]
    struct MemoryStore {
        objects: BTreeMap<String, Vec<u8>>,
        broken: Vec<String>,
        downloads: Mutex<Vec<String>>,
        uploads: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        fn with_objects(objects: &[(&str, &str)]) -> Self {
            MemoryStore {
                objects: objects
                    .iter()
                    .map(|(key, body)| (key.to_string(), body.as_bytes().to_vec()))
                    .collect(),
                ..MemoryStore::default()
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn list_keys(&self, _: &str) -> Result<Vec<String>, Error> {
            Ok(self.objects.keys().cloned().collect())
        }

        async fn download(
            &self,
            _: &str,
            key: &str,
            destination: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, Error> {
            self.downloads.lock().unwrap().push(key.to_string());
            if self.broken.iter().any(|broken| broken == key) {
                return Err(Error::ServiceError(String::from("NoSuchKey")));
            }
            let body = &self.objects[key];
            destination.write_all(body).await?;
            Ok(body.len() as u64)
        }

        async fn upload(&self, _: &str, key: &str, source: &Path) -> Result<u64, Error> {
            let body = tokio::fs::read(source).await?;
            let length = body.len() as u64;
            self.uploads.lock().unwrap().insert(key.to_string(), body);
            Ok(length)
        }
    }

    #[tokio::test]
    async fn unconfigured_client() {
        let bucket = Bucket::new("Bucket", "temp");

        match bucket.download(None).await.err().unwrap() {
            Error::ClientNotConfigured => {}
            other => panic!("Expected `ClientNotConfigured` error, got {:?}", other),
        }
        match bucket.upload().await.err().unwrap() {
            Error::ClientNotConfigured => {}
            other => panic!("Expected `ClientNotConfigured` error, got {:?}", other),
        }
        assert_eq!(
            "Aws Client not defined",
            Error::ClientNotConfigured.to_string()
        );
    }

    #[tokio::test]
    async fn empty_bucket() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());

        let report = bucket.download(None).await.unwrap();
        assert_eq!(true, report.is_empty());
        assert_eq!(0, store.downloads.lock().unwrap().len());
    }

    #[tokio::test]
    async fn empty_directory() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());

        let report = bucket.upload().await.unwrap();
        assert_eq!(true, report.is_empty());

        let missing = Bucket::new("Bucket", dir.path().join("NotADir")).with_client(store);
        assert_eq!(true, missing.upload().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn downloads_nested_keys() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[
            ("index.html", "<html>"),
            ("assets/css/site.css", "body {}"),
            ("assets/", ""),
        ]));
        let bucket = Bucket::new("Bucket", dir.path())
            .with_client(store.clone())
            .with_concurrency(2);

        let report = bucket.download(None).await.unwrap();
        assert_eq!(2, report.outcomes.len());
        assert_eq!(true, report.is_success());
        assert_eq!(13, report.bytes_transferred());

        assert_eq!(
            "body {}",
            fs::read_to_string(dir.path().join("assets").join("css").join("site.css")).unwrap()
        );
        assert_eq!(
            "<html>",
            fs::read_to_string(dir.path().join("index.html")).unwrap()
        );
    }

    #[tokio::test]
    async fn exclude_pattern_matching_everything() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[("a.txt", "a"), ("b/c.txt", "c")]));
        let bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());

        let report = bucket.download(Some(".*")).await.unwrap();
        assert_eq!(true, report.is_empty());
        assert_eq!(0, store.downloads.lock().unwrap().len());
    }

    #[tokio::test]
    async fn exclude_pattern_skips_matching_keys() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[
            ("logs/1.log", "x"),
            ("data/1.csv", "y"),
        ]));
        let bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());

        bucket.download(Some("^logs/")).await.unwrap();
        assert_eq!(
            vec![String::from("data/1.csv")],
            *store.downloads.lock().unwrap()
        );
        assert_eq!(false, dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn invalid_exclude_pattern() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[("a.txt", "a")]));
        let bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());

        match bucket.download(Some("(unclosed")).await.err().unwrap() {
            Error::InvalidPattern(_) => {}
            other => panic!("Expected `InvalidPattern` error, got {:?}", other),
        }
        assert_eq!(0, store.downloads.lock().unwrap().len());
    }

    #[tokio::test]
    async fn failed_object_does_not_stop_siblings() {
        let dir = tempdir().unwrap();
        let mut store = MemoryStore::with_objects(&[("one", "1"), ("two", "2"), ("three", "3")]);
        store.broken = vec![String::from("two")];
        let bucket = Bucket::new("Bucket", dir.path()).with_client(Arc::new(store));

        let report = bucket.download(None).await.unwrap();
        assert_eq!(3, report.outcomes.len());
        assert_eq!(false, report.is_success());

        let failed: Vec<&str> = report.failed().map(|outcome| outcome.key.as_str()).collect();
        assert_eq!(vec!["two"], failed);
        assert_eq!("1", fs::read_to_string(dir.path().join("one")).unwrap());
        assert_eq!("3", fs::read_to_string(dir.path().join("three")).unwrap());
    }

    #[tokio::test]
    async fn keys_escaping_the_directory_are_rejected() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[("../evil", "x"), ("ok", "y")]));
        let bucket = Bucket::new("Bucket", dir.path().join("root")).with_client(store.clone());

        let report = bucket.download(None).await.unwrap();
        let failed: Vec<&TransferOutcome> = report.failed().collect();
        assert_eq!(1, failed.len());
        match &failed[0].result {
            Err(TransferError::InvalidKey(key)) => assert_eq!("../evil", key),
            other => panic!("Expected `InvalidKey`, got {:?}", other),
        }
        assert_eq!(false, dir.path().join("evil").exists());
        assert_eq!(vec![String::from("ok")], *store.downloads.lock().unwrap());
    }

    #[tokio::test]
    async fn uploads_files_with_relative_keys() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested").join("deeper")).unwrap();
        fs::write(dir.path().join("top.txt"), "top").unwrap();
        fs::write(dir.path().join("nested").join("deeper").join("leaf.txt"), "leaf").unwrap();

        let store = Arc::new(MemoryStore::default());
        let bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());

        let report = bucket.upload().await.unwrap();
        assert_eq!(2, report.outcomes.len());
        assert_eq!(true, report.is_success());

        let uploads = store.uploads.lock().unwrap();
        let keys: Vec<&String> = uploads.keys().collect();
        assert_eq!(vec!["nested/deeper/leaf.txt", "top.txt"], keys);
        assert_eq!(b"leaf".to_vec(), uploads["nested/deeper/leaf.txt"]);
    }

    #[tokio::test]
    async fn cancelled_transfers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[("a", "1"), ("b", "2")]));
        let token = CancellationToken::new();
        token.cancel();
        let bucket = Bucket::new("Bucket", dir.path())
            .with_client(store.clone())
            .with_cancellation(token);

        let report = bucket.download(None).await.unwrap();
        assert_eq!(2, report.failed().count());
        for outcome in report.outcomes.iter() {
            match outcome.result {
                Err(TransferError::Cancelled) => {}
                _ => panic!("Expected `Cancelled`"),
            }
        }
        assert_eq!(0, store.downloads.lock().unwrap().len());
    }

    #[tokio::test]
    async fn pool_never_exceeds_concurrency() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SlowStore {
            keys: numbered_keys(40),
            ..SlowStore::default()
        });
        let bucket = Bucket::new("Bucket", dir.path())
            .with_client(store.clone())
            .with_concurrency(4);

        let report = bucket.download(None).await.unwrap();
        assert_eq!(40, report.outcomes.len());
        assert_eq!(true, report.is_success());

        let peak = store.peak.load(Ordering::SeqCst);
        assert_eq!(true, peak >= 1);
        assert_eq!(true, peak <= 4, "peak was {}", peak);
    }

    #[tokio::test]
    async fn zero_concurrency_still_finishes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SlowStore {
            keys: numbered_keys(3),
            ..SlowStore::default()
        });
        let bucket = Bucket::new("Bucket", dir.path())
            .with_client(store.clone())
            .with_concurrency(0);
        assert_eq!(1, bucket.concurrency());

        let report = tokio::time::timeout(Duration::from_secs(5), bucket.download(None))
            .await
            .expect("download did not finish")
            .unwrap();
        assert_eq!(3, report.succeeded().count());
        assert_eq!(1, store.peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelling_in_flight_transfers() {
        let dir = tempdir().unwrap();
        let started = Arc::new(Notify::new());
        let store = Arc::new(StuckStore {
            keys: numbered_keys(5),
            started: started.clone(),
            calls: AtomicUsize::new(0),
        });
        let token = CancellationToken::new();
        let bucket = Bucket::new("Bucket", dir.path())
            .with_client(store.clone())
            .with_concurrency(2)
            .with_cancellation(token.clone());

        let (report, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(bucket.download(None), async {
                started.notified().await;
                token.cancel();
            })
        })
        .await
        .expect("cancellation did not stop the transfers");

        let report = report.unwrap();
        assert_eq!(5, report.outcomes.len());
        for outcome in report.outcomes.iter() {
            match outcome.result {
                Err(TransferError::Cancelled) => {}
                _ => panic!("Expected `Cancelled` for {}", outcome.key),
            }
        }
        let calls = store.calls.load(Ordering::SeqCst);
        assert_eq!(true, calls >= 1 && calls <= 2, "calls was {}", calls);
    }

    #[test]
    fn builds_from_config() {
        let config = BucketConfig {
            bucket: Some(String::from("my-bucket")),
            local_dir: PathBuf::from("data"),
            exclude: Some(String::from("^tmp/")),
            concurrency: Some(8),
        };

        let bucket = Bucket::from_config(&config);
        assert_eq!("my-bucket", bucket.name);
        assert_eq!(PathBuf::from("data"), bucket.local_dir);
        assert_eq!(Some(String::from("^tmp/")), bucket.exclude);
        assert_eq!(8, bucket.concurrency());

        let unchecked = BucketConfig {
            concurrency: Some(0),
            ..config
        };
        assert_eq!(1, Bucket::from_config(&unchecked).concurrency());
    }

    #[tokio::test]
    async fn configured_exclude_applies_by_default() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_objects(&[("tmp/a", "a"), ("keep", "k")]));
        let mut bucket = Bucket::new("Bucket", dir.path()).with_client(store.clone());
        bucket.exclude = Some(String::from("^tmp/"));

        bucket.download(None).await.unwrap();
        assert_eq!(vec![String::from("keep")], *store.downloads.lock().unwrap());
    }

    #[test]
    fn maps_keys_to_paths() {
        let root = Path::new("/data");
        assert_eq!(
            Some(Path::new("/data/a/b.txt").to_path_buf()),
            local_path(root, "a/b.txt")
        );
        assert_eq!(None, local_path(root, "a/../../b"));
        assert_eq!(None, local_path(root, "/"));
        assert_eq!(None, local_path(root, "."));
        assert_eq!(
            Some(Path::new("/data/a.txt").to_path_buf()),
            local_path(root, "./a.txt")
        );
        assert_eq!(
            Some(Path::new("/data/a/b").to_path_buf()),
            local_path(root, "a/./b")
        );
        assert_eq!(
            "a/b.txt",
            to_key(root, &Path::new("/data").join("a").join("b.txt"))
        );
    }
}
