use std::sync::Arc;

use testbed_error::ProvisionError;
use tracing::warn;

use super::catalogue::{Category, ServiceKind, DEFAULT_DOCKER_REGISTRY};
use crate::{artifacts::Manifest, options::ProvisionOptions, version::VersionVector};

/// Where a service's image comes from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReleaseChannel {
    /// A published release tag.
    Release,

    /// A `-SNAPSHOT` tag.
    Snapshot,

    /// A build candidate loaded from a staging manifest.
    BuildCandidate,
}

/// A service kind bound to a stack version and the user's per-service overrides.
///
/// Descriptors are built once per composition and never change afterwards, except for attaching the build candidate
/// manifest once it has been resolved.
#[derive(Clone, Debug)]
pub struct ServiceDescriptor {
    kind: &'static ServiceKind,
    version: VersionVector,
    oss: bool,
    ubi8: bool,
    release: bool,
    snapshot: bool,
    port: Option<u16>,
    bc: Option<String>,
    manifest: Option<Arc<Manifest>>,
    env_vars: Vec<String>,
}

impl ServiceDescriptor {
    /// Binds `kind` to the requested stack version and overrides.
    ///
    /// # Errors
    ///
    /// If the effective version has no numeric component, `MalformedVersion` is returned. If it is lower than the
    /// kind's minimum, `UnsupportedVersion` is returned. Requesting the OSS distribution of Elasticsearch or Kibana
    /// where it is not published yields `InvalidOption`.
    pub fn new(kind: &'static ServiceKind, options: &ProvisionOptions) -> Result<Self, ProvisionError> {
        let overrides = options.overrides_for(kind.name).cloned().unwrap_or_default();

        let raw_version = overrides.version.as_deref().unwrap_or(&options.stack_version);
        let version = VersionVector::parse(raw_version)?;

        if let Some(minimum) = kind.min_version {
            if version.lower_than(minimum) {
                return Err(ProvisionError::UnsupportedVersion {
                    service: kind.name.to_string(),
                    version: version.to_string(),
                    minimum: minimum.to_string(),
                });
            }
        }

        let oss = overrides.oss || options.oss;
        if oss
            && matches!(kind.name, "elasticsearch" | "kibana")
            && (version.at_least("7.11") || (version.at_least("6.8.14") && version.lower_than("6.9")))
        {
            return Err(ProvisionError::InvalidOption {
                option: format!("{}-oss", kind.name),
                reason: format!(
                    "the OSS distribution of {} is not available for version {}.",
                    kind.name, version
                ),
            });
        }

        if options.apm_api_key.is_some() && kind.category == Category::Agent && version.lower_than("7.6") {
            warn!(service = kind.name, version = %version, "API keys require version 7.6 or newer; ignoring.");
        }

        let bc = if kind.is_stack_component() {
            overrides.bc.or_else(|| options.bc.clone())
        } else {
            None
        };

        Ok(Self {
            kind,
            version,
            oss,
            ubi8: overrides.ubi8 || options.ubi8,
            release: overrides.release || options.release,
            snapshot: overrides.snapshot || options.snapshot,
            port: overrides.port,
            bc,
            manifest: None,
            env_vars: overrides.env_vars,
        })
    }

    /// Attaches the resolved build candidate manifest.
    pub fn with_manifest(mut self, manifest: Arc<Manifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn kind(&self) -> &'static ServiceKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name
    }

    pub fn category(&self) -> Category {
        self.kind.category
    }

    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Returns `true` if the service version is at least `target`.
    pub fn at_least(&self, target: &str) -> bool {
        self.version.at_least(target)
    }

    /// Returns `true` if the service version is lower than `target`.
    pub fn lower_than(&self, target: &str) -> bool {
        self.version.lower_than(target)
    }

    pub fn oss(&self) -> bool {
        self.oss
    }

    pub fn ubi8(&self) -> bool {
        self.ubi8
    }

    /// External port: the override if given, otherwise the kind's default.
    pub fn port(&self) -> u16 {
        self.port.or(self.kind.port).unwrap_or_default()
    }

    /// Build candidate id requested for this service, before resolution.
    pub fn requested_bc(&self) -> Option<&str> {
        self.bc.as_deref()
    }

    /// The resolved build candidate manifest, if any.
    pub fn manifest(&self) -> Option<&Arc<Manifest>> {
        self.manifest.as_ref()
    }

    /// Extra environment assignments given on the command line.
    pub fn env_vars(&self) -> &[String] {
        &self.env_vars
    }

    pub fn release_channel(&self) -> ReleaseChannel {
        if self.snapshot {
            ReleaseChannel::Snapshot
        } else if self.release {
            ReleaseChannel::Release
        } else if self.manifest.is_some() {
            ReleaseChannel::BuildCandidate
        } else {
            ReleaseChannel::Snapshot
        }
    }

    /// Image name, including the distribution variant suffixes.
    pub fn image_name(&self) -> String {
        let mut name = self.docker_name();
        if self.oss {
            name.push_str("-oss");
        }
        if self.ubi8 {
            name.push_str("-ubi8");
        }
        name
    }

    /// Bare image name, before distribution variant suffixes.
    pub fn docker_name(&self) -> String {
        match self.kind.image {
            Some(image) => {
                let mut name = image.docker_name.to_string();
                if let Some((before, suffix)) = image.legacy_suffix {
                    if !self.oss && self.lower_than(before) {
                        name.push_str(suffix);
                    }
                }
                name
            }
            None => self.kind.name.to_string(),
        }
    }

    /// `<registry>/<path>/<name>[-oss][-ubi8]:<version>[-SNAPSHOT]`.
    pub fn default_image(&self) -> String {
        let path = self.kind.image.map(|image| image.docker_path).unwrap_or(self.kind.name);
        let mut image = format!(
            "{}/{}/{}:{}",
            DEFAULT_DOCKER_REGISTRY,
            path,
            self.image_name(),
            self.version
        );
        if self.release_channel() == ReleaseChannel::Snapshot {
            image.push_str("-SNAPSHOT");
        }
        image
    }

    /// `localtesting_<version>_<name>`.
    pub fn default_container_name(&self) -> String {
        format!("localtesting_{}_{}", self.version, self.kind.name)
    }

    pub fn default_labels(&self) -> Vec<String> {
        vec![format!("co.elastic.apm.stack-version={}", self.version)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::ServiceOverrides, service::catalogue::Catalogue};

    fn descriptor(name: &str, options: &ProvisionOptions) -> Result<ServiceDescriptor, ProvisionError> {
        ServiceDescriptor::new(Catalogue::standard().find(name).unwrap(), options)
    }

    #[test]
    fn snapshot_unless_released_or_candidate() {
        let options = ProvisionOptions::new("7.6.2");
        let es = descriptor("elasticsearch", &options).unwrap();
        assert_eq!(
            es.default_image(),
            "docker.elastic.co/elasticsearch/elasticsearch:7.6.2-SNAPSHOT"
        );

        let mut options = ProvisionOptions::new("7.6.2");
        options.release = true;
        let apm = descriptor("apm-server", &options).unwrap();
        assert_eq!(apm.default_image(), "docker.elastic.co/apm/apm-server:7.6.2");
    }

    #[test]
    fn build_candidate_drops_snapshot_suffix() {
        let options = ProvisionOptions::new("7.6.2");
        let kibana = descriptor("kibana", &options)
            .unwrap()
            .with_manifest(Arc::new(Manifest::default()));
        assert_eq!(kibana.release_channel(), ReleaseChannel::BuildCandidate);
        assert_eq!(kibana.default_image(), "docker.elastic.co/kibana/kibana:7.6.2");
    }

    #[test]
    fn variants_and_legacy_names() {
        let mut options = ProvisionOptions::new("6.2.4");
        let es = descriptor("elasticsearch", &options).unwrap();
        assert_eq!(es.image_name(), "elasticsearch-platinum");

        options.oss = true;
        options.ubi8 = true;
        let es = descriptor("elasticsearch", &options).unwrap();
        assert_eq!(es.image_name(), "elasticsearch-oss-ubi8");

        let beat = descriptor("metricbeat", &ProvisionOptions::new("7.6.2")).unwrap();
        assert_eq!(
            beat.default_image(),
            "docker.elastic.co/beats/metricbeat:7.6.2-SNAPSHOT"
        );
    }

    #[test]
    fn oss_is_rejected_where_unpublished() {
        for version in ["7.11.0", "8.0.0", "6.8.14"] {
            let mut options = ProvisionOptions::new(version);
            options.oss = true;
            assert!(
                matches!(
                    descriptor("kibana", &options),
                    Err(ProvisionError::InvalidOption { .. })
                ),
                "{} should be rejected",
                version
            );
            assert!(descriptor("apm-server", &options).is_ok());
        }

        let mut options = ProvisionOptions::new("7.10.2");
        options.oss = true;
        assert!(descriptor("elasticsearch", &options).is_ok());
    }

    #[test]
    fn minimum_version_is_enforced() {
        let err = descriptor("apm-server", &ProvisionOptions::new("5.6.0")).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::UnsupportedVersion { ref service, ref minimum, .. }
                if service == "apm-server" && minimum == "6.0"
        ));

        assert!(descriptor("postgres", &ProvisionOptions::new("5.6.0")).is_ok());
    }

    #[test]
    fn malformed_version_fails_fast() {
        let err = descriptor("kibana", &ProvisionOptions::new("latest")).unwrap_err();
        assert!(matches!(err, ProvisionError::MalformedVersion { .. }));
    }

    #[test]
    fn per_service_overrides() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.bc = Some("latest".to_string());
        options.overrides.insert(
            "kibana".to_string(),
            ServiceOverrides {
                version: Some("7.7.0".to_string()),
                port: Some(15601),
                env_vars: vec!["A=1".to_string()],
                ..Default::default()
            },
        );

        let kibana = descriptor("kibana", &options).unwrap();
        assert_eq!(kibana.version().as_str(), "7.7.0");
        assert_eq!(kibana.port(), 15601);
        assert_eq!(kibana.env_vars(), ["A=1"]);
        assert_eq!(kibana.requested_bc(), Some("latest"));
        assert_eq!(kibana.default_container_name(), "localtesting_7.7.0_kibana");

        let redis = descriptor("redis", &options).unwrap();
        assert_eq!(redis.requested_bc(), None);
        assert_eq!(redis.port(), 6379);
    }
}
