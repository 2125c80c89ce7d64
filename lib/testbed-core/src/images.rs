//! Image acquisition for build candidates.
//!
//! Build candidate images are not published to a registry, so each one is downloaded as a tarball and loaded into the
//! local docker daemon. Downloads are cached on disk next to the ETag they were served with; an archive is only
//! fetched again when the server reports a different ETag.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::{self, StreamExt as _};
use testbed_error::{generic_error, ErrorContext as _, GenericError, ProvisionError};
use tokio::{fs, io::AsyncWriteExt as _, process::Command};
use tracing::{debug, error, info};

/// Default number of images acquired concurrently.
pub const DEFAULT_POOL_WIDTH: usize = 4;

/// Default upper bound on a whole acquisition run.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const ETAG_SUFFIX: &str = ".etag";
const PARTIAL_SUFFIX: &str = ".partial";

/// Remote side of the image cache.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Returns the ETag the server currently reports for `url`, if it reports one.
    async fn etag(&self, url: &str) -> Result<Option<String>, GenericError>;

    /// Downloads `url` into `destination`, overwriting it.
    async fn download(&self, url: &str, destination: &Path) -> Result<(), GenericError>;
}

/// Loads an image archive into the container runtime.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, archive: &Path) -> Result<(), GenericError>;
}

/// An [`ArtifactFetcher`] backed by an HTTP client.
pub struct HttpArtifactFetcher {
    inner: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn etag(&self, url: &str) -> Result<Option<String>, GenericError> {
        let response = self.inner.head(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(generic_error!("Received non-success response ({}) for HEAD {}.", status, url));
        }

        Ok(response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string()))
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<(), GenericError> {
        let mut response = self.inner.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(generic_error!("Received non-success response ({}) for GET {}.", status, url));
        }

        let mut file = fs::File::create(destination)
            .await
            .with_error_context(|| format!("Failed to create '{}'.", destination.display()))?;
        while let Some(chunk) = response.chunk().await.error_context("Failed to read response body.")? {
            file.write_all(&chunk)
                .await
                .with_error_context(|| format!("Failed to write '{}'.", destination.display()))?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// An [`ImageLoader`] that shells out to `docker load`.
pub struct DockerCliLoader {
    program: String,
}

impl Default for DockerCliLoader {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

#[async_trait]
impl ImageLoader for DockerCliLoader {
    async fn load(&self, archive: &Path) -> Result<(), GenericError> {
        let output = Command::new(&self.program)
            .arg("load")
            .arg("-i")
            .arg(archive)
            .stdin(Stdio::null())
            .output()
            .await
            .with_error_context(|| format!("Failed to spawn '{} load'.", self.program))?;

        if !output.status.success() {
            return Err(generic_error!(
                "'{} load' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        debug!(archive = %archive.display(), output = %String::from_utf8_lossy(&output.stdout).trim(), "Loaded image.");
        Ok(())
    }
}

/// What happened to a single image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acquired {
    /// The cached archive was current; nothing was downloaded or loaded.
    Cached,

    /// The archive was downloaded and loaded.
    Loaded,
}

/// Downloads and loads build candidate images through an ETag-validated disk cache.
pub struct ImageAcquirer<F, L> {
    fetcher: F,
    loader: L,
    cache_dir: PathBuf,
    pool_width: usize,
    timeout: Duration,
}

impl<F: ArtifactFetcher, L: ImageLoader> ImageAcquirer<F, L> {
    /// Creates a new `ImageAcquirer` caching archives under `cache_dir`.
    pub fn new(fetcher: F, loader: L, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            loader,
            cache_dir: cache_dir.into(),
            pool_width: DEFAULT_POOL_WIDTH,
            timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Sets how many images are acquired concurrently.
    pub fn with_pool_width(mut self, pool_width: usize) -> Self {
        self.pool_width = pool_width.max(1);
        self
    }

    /// Sets the upper bound on a whole acquisition run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Acquires every image in `urls`.
    ///
    /// Every URL is attempted even if others fail. Once all of them have finished, or the timeout elapses and the
    /// rest are cancelled, the run fails if any single image could not be acquired.
    ///
    /// # Errors
    ///
    /// If any image fails or the run times out, `ImageAcquisitionFailed` is returned with the number of images that
    /// did not make it.
    pub async fn acquire(&self, urls: &BTreeSet<String>) -> Result<(), ProvisionError> {
        let total = urls.len();
        if total == 0 {
            return Ok(());
        }

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|_| ProvisionError::ImageAcquisitionFailed { failed: total, total })?;

        info!(images = total, pool_width = self.pool_width, cache_dir = %self.cache_dir.display(), "Acquiring images.");

        let succeeded = AtomicUsize::new(0);
        let run = stream::iter(urls.iter())
            .map(|url| {
                let succeeded = &succeeded;
                async move {
                    match self.acquire_one(url).await {
                        Ok(outcome) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                            debug!(%url, ?outcome, "Image acquired.");
                        }
                        Err(e) => error!(%url, error = %format!("{:#}", e), "Failed to acquire image."),
                    }
                }
            })
            .buffer_unordered(self.pool_width)
            .collect::<Vec<()>>();

        if tokio::time::timeout(self.timeout, run).await.is_err() {
            error!(timeout_secs = self.timeout.as_secs(), "Timed out acquiring images.");
        }

        let failed = total - succeeded.load(Ordering::Relaxed);
        if failed > 0 {
            return Err(ProvisionError::ImageAcquisitionFailed { failed, total });
        }
        Ok(())
    }

    async fn acquire_one(&self, url: &str) -> Result<Acquired, GenericError> {
        let basename = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| generic_error!("Artifact URL '{}' has no file name.", url))?;
        let archive = self.cache_dir.join(basename);
        let etag_path = self.cache_dir.join(format!("{}{}", basename, ETAG_SUFFIX));

        let remote = self.fetcher.etag(url).await?;
        let cached = read_etag(&etag_path).await;
        if remote.is_some() && remote == cached {
            debug!(file = basename, "Skipping download, local file is current.");
            return Ok(Acquired::Cached);
        }

        info!(%url, "Downloading image.");
        let partial = self.cache_dir.join(format!("{}{}", basename, PARTIAL_SUFFIX));
        if let Err(e) = self.fetcher.download(url, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }
        fs::rename(&partial, &archive)
            .await
            .with_error_context(|| format!("Failed to move download into '{}'.", archive.display()))?;

        match remote {
            Some(etag) => write_etag(&etag_path, &etag).await?,
            None => {
                let _ = fs::remove_file(&etag_path).await;
            }
        }

        if let Err(e) = self.loader.load(&archive).await {
            let _ = fs::remove_file(&etag_path).await;
            return Err(e);
        }
        Ok(Acquired::Loaded)
    }
}

async fn read_etag(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|contents| contents.trim().to_string())
}

async fn write_etag(path: &Path, etag: &str) -> Result<(), GenericError> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(PARTIAL_SUFFIX);
    let staging = PathBuf::from(staging);

    fs::write(&staging, format!("{}\n", etag))
        .await
        .with_error_context(|| format!("Failed to write '{}'.", staging.display()))?;
    fs::rename(&staging, path)
        .await
        .with_error_context(|| format!("Failed to write '{}'.", path.display()))?;
    Ok(())
}
