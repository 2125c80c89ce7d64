//! Build candidate resolution.
//!
//! Build candidates are pre-release artifact sets published to a staging host. Each one is described by a manifest
//! listing, per project, the downloadable packages and their URLs. [`BuildCandidateResolver`] turns a stack version
//! and a build id into such a manifest, and [`artifact_url`] finds a service's docker image inside it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use testbed_error::ProvisionError;
use tracing::{debug, info, warn};

use crate::service::{ArtifactScheme, ReleaseChannel, ServiceDescriptor};

/// Default staging host for build candidates.
pub const DEFAULT_STAGING_BASE_URL: &str = "https://staging.elastic.co";

/// Build id that selects the most recent candidate for a minor version.
pub const LATEST_BUILD: &str = "latest";

const PLAIN_SUFFIXES: &[&str] = &["-docker-image.tar.gz"];
const APM_SERVER_SUFFIXES: &[&str] = &["-docker-image.tar.gz", "-linux-amd64-docker-image.tar.gz"];
const BEATS_SUFFIXES: &[&str] = &[
    "-docker-image.tar.gz",
    "-linux-amd64-docker-image.tar.gz",
    "-docker-image-linux-amd64.tar.gz",
];

/// A build candidate manifest.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A project inside a build candidate manifest.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Project {
    #[serde(default)]
    pub packages: BTreeMap<String, Package>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A downloadable package.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Package {
    pub url: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    /// Looks up a package by project and artifact key.
    pub fn package(&self, project: &str, key: &str) -> Option<&Package> {
        self.projects.get(project).and_then(|p| p.packages.get(key))
    }

    /// Renders the manifest as pretty JSON, for operator debugging.
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<unrenderable manifest: {}>", e))
    }
}

/// Source of the JSON documents published on the staging host.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches the document at `url`.
    ///
    /// # Errors
    ///
    /// If no response is received, or the response status is not successful, `ManifestFetchFailed` is returned. If
    /// the body is not JSON, `MalformedManifest` is returned.
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, ProvisionError>;
}

/// A [`ManifestSource`] backed by an HTTP client.
pub struct StagingClient {
    inner: reqwest::Client,
}

impl StagingClient {
    /// Creates a new `StagingClient` wrapping the given HTTP client.
    pub fn new(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ManifestSource for StagingClient {
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, ProvisionError> {
        let response = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_failed(url, e.status().map(|s| s.as_u16()).unwrap_or_default()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| String::from("<no body>"));
            debug!(%url, %status, %body, "Received non-success response from staging host.");
            return Err(fetch_failed(url, status.as_u16()));
        }

        response.json().await.map_err(|e| ProvisionError::MalformedManifest {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

fn fetch_failed(url: &str, status: u16) -> ProvisionError {
    ProvisionError::ManifestFetchFailed {
        url: url.to_string(),
        status,
    }
}

/// Resolved manifests, keyed by stack version.
///
/// The key ignores the build id: once a version has been resolved, later requests for the same version
/// return the first manifest regardless of the build id they ask for.
#[derive(Debug, Default)]
pub struct ManifestCache {
    entries: HashMap<String, Arc<Manifest>>,
}

impl ManifestCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the manifest cached for `version`, if any.
    pub fn get(&self, version: &str) -> Option<Arc<Manifest>> {
        self.entries.get(version).cloned()
    }

    fn insert(&mut self, version: &str, manifest: Arc<Manifest>) {
        self.entries.insert(version.to_string(), manifest);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves a version and build id into a build candidate manifest.
pub struct BuildCandidateResolver<S> {
    source: S,
    base_url: String,
    cache: ManifestCache,
}

impl<S: ManifestSource> BuildCandidateResolver<S> {
    /// Creates a resolver fetching from `base_url` through `source`, memoizing into `cache`.
    pub fn new(source: S, base_url: impl Into<String>, cache: ManifestCache) -> Self {
        Self {
            source,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache,
        }
    }

    /// Consumes the resolver, returning its cache.
    pub fn into_cache(self) -> ManifestCache {
        self.cache
    }

    /// Resolves the manifest for `version` and `build_id`.
    ///
    /// Without a build id there is nothing to resolve and `None` is returned. The `latest` build id is looked up
    /// through the minor version's index document; any other id is templated directly into the manifest URL.
    ///
    /// # Errors
    ///
    /// If the index or the manifest cannot be fetched or decoded, an error is returned.
    pub async fn resolve(
        &mut self, version: &str, build_id: Option<&str>,
    ) -> Result<Option<Arc<Manifest>>, ProvisionError> {
        let Some(build_id) = build_id else {
            return Ok(None);
        };

        if let Some(manifest) = self.cache.get(version) {
            debug!(version, build_id, "Using cached build candidate manifest.");
            return Ok(Some(manifest));
        }

        let manifest_url = if build_id == LATEST_BUILD {
            self.latest_manifest_url(version).await?
        } else {
            format!("{}/{1}-{2}/manifest-{1}.json", self.base_url, version, build_id)
        };

        let document = self.source.fetch_json(&manifest_url).await?;
        let manifest: Manifest =
            serde_json::from_value(document).map_err(|e| ProvisionError::MalformedManifest {
                url: manifest_url.clone(),
                reason: e.to_string(),
            })?;

        info!(version, build_id, url = %manifest_url, "Resolved build candidate manifest.");
        let manifest = Arc::new(manifest);
        self.cache.insert(version, Arc::clone(&manifest));
        Ok(Some(manifest))
    }

    async fn latest_manifest_url(&self, version: &str) -> Result<String, ProvisionError> {
        let minor = version.splitn(3, '.').take(2).collect::<Vec<_>>().join(".");
        let index_url = format!("{}/latest/{}.json", self.base_url, minor);
        let index = self.source.fetch_json(&index_url).await?;

        if let Some(summary) = index.get("summary_url").and_then(|v| v.as_str()) {
            info!(minor = %minor, summary, index = %index_url, "Found latest build candidate.");
        }

        match index.get("manifest_url").and_then(|v| v.as_str()) {
            Some(url) => Ok(url.to_string()),
            None => Err(ProvisionError::MalformedManifest {
                url: index_url,
                reason: "missing 'manifest_url'".to_string(),
            }),
        }
    }
}

/// Finds the docker image of `descriptor` inside its build candidate manifest.
///
/// Returns `None` when the service is not provisioned from a build candidate: it is not a stack component, it was
/// asked for as a release or snapshot, or no manifest was resolved for it.
///
/// # Errors
///
/// If the manifest does not list the image under any of the scheme's keys, `ArtifactNotFound` is returned carrying the
/// full manifest. If the package found is not a docker image, `MalformedManifest` is returned.
pub fn artifact_url(descriptor: &ServiceDescriptor) -> Result<Option<String>, ProvisionError> {
    let (Some(image), Some(manifest)) = (descriptor.kind().image, descriptor.manifest()) else {
        return Ok(None);
    };
    if descriptor.release_channel() != ReleaseChannel::BuildCandidate {
        return Ok(None);
    }

    let version = descriptor.version().as_str();
    let (project, image_name, suffixes) = match image.artifacts {
        ArtifactScheme::Stack => {
            warn!(
                service = descriptor.name(),
                "Build candidates for this service need manual steps while it does not share the docker repo tags."
            );
            (descriptor.docker_name(), descriptor.image_name(), PLAIN_SUFFIXES)
        }
        ArtifactScheme::ApmServer => {
            let mut name = descriptor.docker_name();
            if descriptor.oss() {
                name.push_str("-oss");
            }
            (descriptor.docker_name(), name, APM_SERVER_SUFFIXES)
        }
        ArtifactScheme::Beats => ("beats".to_string(), descriptor.image_name(), BEATS_SUFFIXES),
        ArtifactScheme::Logstash => ("logstash-docker".to_string(), descriptor.image_name(), PLAIN_SUFFIXES),
    };

    let mut last_key = String::new();
    for suffix in suffixes {
        last_key = format!("{}-{}{}", image_name, version, suffix);
        if let Some(package) = manifest.package(&project, &last_key) {
            if package.kind != "docker" {
                return Err(ProvisionError::MalformedManifest {
                    url: package.url.clone(),
                    reason: format!("artifact '{}' has type '{}', expected 'docker'", last_key, package.kind),
                });
            }
            return Ok(Some(package.url.clone()));
        }
    }

    Err(ProvisionError::ArtifactNotFound {
        project,
        key: last_key,
        manifest: manifest.pretty(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{options::ProvisionOptions, service::Catalogue};

    #[derive(Default)]
    struct FakeSource {
        documents: HashMap<String, serde_json::Value>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn with(mut self, url: &str, document: serde_json::Value) -> Self {
            self.documents.insert(url.to_string(), document);
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<'a> ManifestSource for &'a FakeSource {
        async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, ProvisionError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.documents.get(url).cloned().ok_or_else(|| fetch_failed(url, 404))
        }
    }

    fn manifest_json(project: &str, key: &str) -> serde_json::Value {
        json!({
            "build_id": "7.6.2-abcd1234",
            "projects": {
                project: {
                    "branch": "7.6",
                    "packages": {
                        key: { "url": format!("https://staging.example/{}", key), "type": "docker" }
                    }
                }
            }
        })
    }

    fn descriptor(name: &str, options: &ProvisionOptions, manifest: serde_json::Value) -> ServiceDescriptor {
        let manifest: Manifest = serde_json::from_value(manifest).unwrap();
        ServiceDescriptor::new(Catalogue::standard().find(name).unwrap(), options)
            .unwrap()
            .with_manifest(Arc::new(manifest))
    }

    #[tokio::test]
    async fn no_build_id_means_no_resolution() {
        let source = FakeSource::default();
        let mut resolver = BuildCandidateResolver::new(&source, "https://staging.example", ManifestCache::new());
        assert_eq!(resolver.resolve("7.6.2", None).await.unwrap(), None);
        assert!(source.requests().is_empty());
    }

    #[tokio::test]
    async fn explicit_build_id_is_templated() {
        let url = "https://staging.example/7.6.2-abcd1234/manifest-7.6.2.json";
        let source = FakeSource::default().with(url, manifest_json("kibana", "kibana-7.6.2-docker-image.tar.gz"));
        let mut resolver = BuildCandidateResolver::new(&source, "https://staging.example/", ManifestCache::new());

        let manifest = resolver.resolve("7.6.2", Some("abcd1234")).await.unwrap().unwrap();
        assert!(manifest.package("kibana", "kibana-7.6.2-docker-image.tar.gz").is_some());
        assert_eq!(manifest.extra["build_id"], "7.6.2-abcd1234");
        assert_eq!(source.requests(), [url]);
    }

    #[tokio::test]
    async fn latest_goes_through_the_minor_index() {
        let manifest_url = "https://staging.example/7.6.2-ffff/manifest-7.6.2.json";
        let source = FakeSource::default()
            .with(
                "https://staging.example/latest/7.6.json",
                json!({ "manifest_url": manifest_url, "summary_url": "https://staging.example/summary.html" }),
            )
            .with(manifest_url, manifest_json("beats", "filebeat-7.6.2-docker-image.tar.gz"));
        let mut resolver = BuildCandidateResolver::new(&source, "https://staging.example", ManifestCache::new());

        let manifest = resolver.resolve("7.6.2", Some(LATEST_BUILD)).await.unwrap();
        assert!(manifest.is_some());
        assert_eq!(source.requests(), ["https://staging.example/latest/7.6.json", manifest_url]);
    }

    #[tokio::test]
    async fn cache_is_keyed_by_version_only() {
        let url = "https://staging.example/7.6.2-first/manifest-7.6.2.json";
        let source = FakeSource::default().with(url, manifest_json("kibana", "k"));
        let mut resolver = BuildCandidateResolver::new(&source, "https://staging.example", ManifestCache::new());

        let first = resolver.resolve("7.6.2", Some("first")).await.unwrap().unwrap();
        let second = resolver.resolve("7.6.2", Some("second")).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.requests().len(), 1);
        assert_eq!(resolver.into_cache().len(), 1);
    }

    #[tokio::test]
    async fn fetch_failures_surface_url_and_status() {
        let source = FakeSource::default();
        let mut resolver = BuildCandidateResolver::new(&source, "https://staging.example", ManifestCache::new());

        let err = resolver.resolve("7.6.2", Some(LATEST_BUILD)).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ManifestFetchFailed { ref url, status: 404 } if url == "https://staging.example/latest/7.6.json"
        ));
    }

    #[tokio::test]
    async fn index_without_manifest_url_is_malformed() {
        let source = FakeSource::default().with("https://staging.example/latest/7.6.json", json!({}));
        let mut resolver = BuildCandidateResolver::new(&source, "https://staging.example", ManifestCache::new());

        let err = resolver.resolve("7.6.2", Some(LATEST_BUILD)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::MalformedManifest { .. }));
    }

    #[test]
    fn beats_fall_back_through_key_schemes() {
        let options = ProvisionOptions::new("7.6.2");
        let beat = descriptor(
            "metricbeat",
            &options,
            manifest_json("beats", "metricbeat-7.6.2-docker-image-linux-amd64.tar.gz"),
        );
        assert_eq!(
            artifact_url(&beat).unwrap().as_deref(),
            Some("https://staging.example/metricbeat-7.6.2-docker-image-linux-amd64.tar.gz")
        );
    }

    #[test]
    fn apm_server_ignores_ubi8_and_tries_linux_amd64() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.ubi8 = true;
        let apm = descriptor(
            "apm-server",
            &options,
            manifest_json("apm-server", "apm-server-7.6.2-linux-amd64-docker-image.tar.gz"),
        );
        assert!(artifact_url(&apm).unwrap().is_some());
    }

    #[test]
    fn logstash_lives_in_its_own_project() {
        let options = ProvisionOptions::new("7.6.2");
        let logstash = descriptor(
            "logstash",
            &options,
            manifest_json("logstash-docker", "logstash-7.6.2-docker-image.tar.gz"),
        );
        assert!(artifact_url(&logstash).unwrap().is_some());
    }

    #[test]
    fn missing_artifact_carries_the_manifest() {
        let options = ProvisionOptions::new("7.6.2");
        let es = descriptor("elasticsearch", &options, manifest_json("kibana", "kibana-7.6.2-docker-image.tar.gz"));

        match artifact_url(&es).unwrap_err() {
            ProvisionError::ArtifactNotFound { project, key, manifest } => {
                assert_eq!(project, "elasticsearch");
                assert_eq!(key, "elasticsearch-7.6.2-docker-image.tar.gz");
                assert!(manifest.contains("kibana-7.6.2-docker-image.tar.gz"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn releases_and_non_stack_services_have_no_artifact() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.release = true;
        let kibana = descriptor("kibana", &options, manifest_json("kibana", "x"));
        assert_eq!(artifact_url(&kibana).unwrap(), None);

        let redis = descriptor("redis", &ProvisionOptions::new("7.6.2"), json!({}));
        assert_eq!(artifact_url(&redis).unwrap(), None);
    }
}
