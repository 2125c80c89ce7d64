//! Rendering the composition document.
//!
//! Every node of the [`DependencyGraph`] is merged with its computed defaults into a [`ComposeService`]. Additional
//! service definitions can be merged in verbatim, after which the opbeans services learn about each other and the
//! published host ports are checked for collisions. Nothing is serialized until the whole document is valid.

use std::{collections::BTreeMap, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use testbed_error::{ErrorContext as _, GenericError, ProvisionError};
use tracing::{debug, info};

use crate::{
    fragment::{Build, Command, DependsOn, Environment, Healthcheck, Logging, ServiceFragment, Ulimit},
    graph::DependencyGraph,
    options::OutputFormat,
    service::{ServiceDescriptor, LOAD_GENERATOR},
};

/// Compose file format version.
pub const COMPOSE_FILE_VERSION: &str = "2.1";

/// Name of the network every service joins.
pub const NETWORK_NAME: &str = "apm-integration-testing";

const OPBEANS_PREFIX: &str = "opbeans-";
const OPBEANS_RUM: &str = "opbeans-rum";
const OPBEANS_SERVICES_KEY: &str = "OPBEANS_SERVICES";

/// A fully-resolved service entry of the composition document.
///
/// Fields are declared in sorted order. Keys this type does not model are kept in `extra`, so that service
/// definitions merged in from a file survive untouched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub depends_on: IndexMap<String, DependsOn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Logging>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ulimits: Option<IndexMap<String, Ulimit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ComposeService {
    /// Merges a descriptor's fragment with the descriptor's computed defaults.
    ///
    /// Default slots are filled from the descriptor's identity and opted-out slots are left out. Extra environment
    /// assignments given for the service are appended last. The fragment itself is left untouched.
    pub fn merge(descriptor: &ServiceDescriptor, fragment: &ServiceFragment) -> Self {
        let mut environment = fragment.environment.clone();
        if !descriptor.env_vars().is_empty() {
            let environment = environment.get_or_insert_with(Environment::list);
            for assignment in descriptor.env_vars() {
                environment.push_assignment(assignment);
            }
        }

        Self {
            build: fragment.build.clone(),
            cap_add: fragment.cap_add.clone(),
            cap_drop: fragment.cap_drop.clone(),
            command: fragment.command.clone(),
            container_name: fragment
                .container_name
                .resolve_with(|| descriptor.default_container_name()),
            depends_on: fragment.depends_on.clone(),
            environment,
            healthcheck: fragment.healthcheck.clone(),
            image: fragment.image.resolve_with(|| descriptor.default_image()),
            labels: fragment.labels.resolve_with(|| descriptor.default_labels()),
            logging: fragment.logging.resolve_with(Logging::rotating_json_file),
            network_mode: fragment.network_mode.clone(),
            ports: fragment.ports.clone(),
            privileged: fragment.privileged,
            restart: fragment.restart.clone(),
            ulimits: fragment.ulimits.clone(),
            user: fragment.user.clone(),
            volumes: fragment.volumes.clone(),
            extra: BTreeMap::new(),
        }
    }
}

/// The network every service joins.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Network {
    pub name: String,
}

/// A named volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    pub driver: String,
}

impl Volume {
    fn local() -> Self {
        Self {
            driver: "local".to_string(),
        }
    }
}

/// The composition document handed to the orchestrator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ComposeDocument {
    pub networks: BTreeMap<String, Network>,
    pub services: BTreeMap<String, ComposeService>,
    pub version: String,
    pub volumes: BTreeMap<String, Volume>,
}

impl ComposeDocument {
    /// Renders every node of the graph.
    pub fn render(graph: &DependencyGraph) -> Self {
        let services = graph
            .iter()
            .map(|node| {
                (
                    node.descriptor.name().to_string(),
                    ComposeService::merge(&node.descriptor, &node.fragment),
                )
            })
            .collect();

        Self {
            networks: BTreeMap::from([(
                "default".to_string(),
                Network {
                    name: NETWORK_NAME.to_string(),
                },
            )]),
            services,
            version: COMPOSE_FILE_VERSION.to_string(),
            volumes: BTreeMap::from([("esdata".to_string(), Volume::local()), ("pgdata".to_string(), Volume::local())]),
        }
    }

    /// Renders the graph, merges the additional service definitions and checks the result.
    ///
    /// # Errors
    ///
    /// If two services publish the same host port, `PortCollision` is returned.
    pub fn assemble(
        graph: &DependencyGraph, additional: BTreeMap<String, ComposeService>,
    ) -> Result<Self, ProvisionError> {
        let mut document = Self::render(graph);
        document.extend_services(additional);
        document.annotate_opbeans();
        document.validate()?;

        info!(services = document.services.len(), "Assembled composition document.");
        Ok(document)
    }

    /// Adds service definitions, replacing rendered services of the same name.
    pub fn extend_services(&mut self, additional: BTreeMap<String, ComposeService>) {
        for (name, service) in additional {
            if self.services.insert(name.clone(), service).is_some() {
                debug!(service = %name, "Replaced rendered service with additional definition.");
            }
        }
    }

    /// Tells every opbeans application about the others through `OPBEANS_SERVICES`.
    pub fn annotate_opbeans(&mut self) {
        let names: Vec<String> = self
            .services
            .keys()
            .filter(|name| is_annotated_opbeans(name))
            .cloned()
            .collect();
        if names.is_empty() {
            return;
        }

        let joined = names.join(",");
        for name in &names {
            if let Some(service) = self.services.get_mut(name) {
                service
                    .environment
                    .get_or_insert_with(Environment::list)
                    .set(OPBEANS_SERVICES_KEY, joined.as_str());
            }
        }
    }

    /// Checks that no two services publish the same host port over the same protocol.
    ///
    /// # Errors
    ///
    /// If a host port is published twice, `PortCollision` is returned naming both services.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let mut owners: BTreeMap<String, &str> = BTreeMap::new();
        for (name, service) in &self.services {
            for binding in service.ports.iter().filter_map(|spec| host_binding(spec)) {
                if let Some(first) = owners.get(&binding) {
                    if *first != name.as_str() {
                        return Err(ProvisionError::PortCollision {
                            port: binding,
                            first: first.to_string(),
                            second: name.clone(),
                        });
                    }
                    continue;
                }
                owners.insert(binding, name.as_str());
            }
        }
        Ok(())
    }

    /// Services built locally.
    pub fn build_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, service)| service.build.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Services started from a published image.
    pub fn image_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, service)| service.image.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Serializes the document with sorted keys.
    ///
    /// # Errors
    ///
    /// If serialization fails, an error is returned.
    pub fn render_to_string(&self, format: OutputFormat) -> Result<String, GenericError> {
        // Going through a JSON value sorts every mapping, including environment and dependency maps.
        let value = serde_json::to_value(self).error_context("Failed to convert composition document.")?;
        match format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&value).error_context("Failed to serialize composition document as JSON.")
            }
            OutputFormat::Yaml => {
                let yaml =
                    serde_yaml::to_string(&value).error_context("Failed to serialize composition document as YAML.")?;
                Ok(format!("---\n{}", yaml))
            }
        }
    }

    /// Writes the document to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// If the document cannot be serialized or written, an error is returned.
    pub async fn write(&self, path: &Path, format: OutputFormat) -> Result<(), GenericError> {
        let rendered = self.render_to_string(format)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_error_context(|| format!("Failed to create directory '{}'.", parent.display()))?;
        }
        tokio::fs::write(path, rendered)
            .await
            .with_error_context(|| format!("Failed to write composition document to '{}'.", path.display()))?;

        info!(path = %path.display(), "Wrote composition document.");
        Ok(())
    }
}

/// Reads additional service definitions from a JSON file mapping service names to service entries.
///
/// # Errors
///
/// If the file cannot be read or is not such a mapping, an error is returned.
pub async fn load_additional_services(path: &Path) -> Result<BTreeMap<String, ComposeService>, GenericError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_error_context(|| format!("Failed to read additional services from '{}'.", path.display()))?;
    serde_json::from_str(&contents)
        .with_error_context(|| format!("Failed to parse additional services from '{}'.", path.display()))
}

fn is_annotated_opbeans(name: &str) -> bool {
    name.starts_with(OPBEANS_PREFIX) && name != OPBEANS_RUM && name != LOAD_GENERATOR
}

/// The host side of a published port, suffixed with its protocol unless TCP.
///
/// Entries that publish no fixed host port yield `None`.
fn host_binding(spec: &str) -> Option<String> {
    let (mapping, protocol) = match spec.split_once('/') {
        Some((mapping, protocol)) => (mapping, Some(protocol)),
        None => (spec, None),
    };

    let parts: Vec<&str> = mapping.split(':').collect();
    let host = match parts.as_slice() {
        [_, host, _] | [host, _] => *host,
        _ => return None,
    };

    Some(match protocol {
        Some(protocol) if protocol != "tcp" => format!("{}/{}", host, protocol),
        _ => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        fragment::Slot,
        options::{ProvisionOptions, ServiceOverrides},
        selection::select,
        service::{Catalogue, WAIT_SERVICE},
    };

    fn document(options: &ProvisionOptions) -> ComposeDocument {
        let graph = select(&Catalogue::standard(), options).unwrap();
        ComposeDocument::assemble(&graph, BTreeMap::new()).unwrap()
    }

    #[test]
    fn default_document_has_core_services_and_barrier() {
        let document = document(&ProvisionOptions::new("8.0.0"));

        let names: Vec<_> = document.services.keys().map(String::as_str).collect();
        assert_eq!(names, ["apm-server", "elasticsearch", "kibana", WAIT_SERVICE]);
        assert_eq!(document.version, "2.1");
        assert_eq!(document.networks["default"].name, "apm-integration-testing");
        assert_eq!(document.volumes["esdata"].driver, "local");

        let wait = &document.services[WAIT_SERVICE];
        let waits_on: Vec<_> = wait.depends_on.keys().map(String::as_str).collect();
        assert_eq!(waits_on, ["apm-server", "elasticsearch", "kibana"]);
    }

    #[test]
    fn defaults_fill_slots_and_opt_outs_prune_them() {
        let document = document(&ProvisionOptions::new("7.6.2"));

        let es = &document.services["elasticsearch"];
        assert_eq!(es.container_name.as_deref(), Some("localtesting_7.6.2_elasticsearch"));
        assert_eq!(
            es.labels.as_deref(),
            Some(&["co.elastic.apm.stack-version=7.6.2".to_string()][..])
        );
        assert_eq!(es.logging, Some(Logging::rotating_json_file()));
        assert!(es.image.as_deref().is_some_and(|image| image.ends_with(":7.6.2-SNAPSHOT")));

        let wait = &document.services[WAIT_SERVICE];
        assert_eq!(wait.container_name.as_deref(), Some("wait"));
        assert_eq!(wait.labels, None);
        assert_eq!(wait.logging, None);
    }

    #[test]
    fn merge_leaves_the_fragment_alone() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.overrides.insert(
            "kibana".to_string(),
            ServiceOverrides {
                env_vars: vec!["EXTRA=1".to_string()],
                ..Default::default()
            },
        );
        let graph = select(&Catalogue::standard(), &options).unwrap();
        let node = graph.get("kibana").unwrap();
        let before = node.fragment.clone();

        let merged = ComposeService::merge(&node.descriptor, &node.fragment);
        assert_eq!(node.fragment, before);
        assert_eq!(merged.environment.as_ref().and_then(|env| env.get("EXTRA")), Some("1"));
        assert_eq!(node.fragment.container_name, Slot::Default);
    }

    #[test]
    fn every_service_has_exactly_one_image_source() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.run_all = true;
        let document = document(&options);
        for (name, service) in &document.services {
            assert!(
                service.build.is_some() != service.image.is_some(),
                "{} must have exactly one of build and image",
                name
            );
        }
    }

    #[test]
    fn opbeans_learn_about_each_other() {
        let options = ProvisionOptions::new("7.6.2")
            .with_service("opbeans-go", true)
            .with_service("opbeans-python", true)
            .with_service("opbeans-rum", true);
        let document = document(&options);

        for name in ["opbeans-go", "opbeans-python"] {
            let environment = document.services[name].environment.as_ref().unwrap();
            assert_eq!(environment.get("OPBEANS_SERVICES"), Some("opbeans-go,opbeans-python"));
        }
        let rum = document.services["opbeans-rum"].environment.as_ref();
        assert_eq!(rum.and_then(|env| env.get("OPBEANS_SERVICES")), None);
    }

    #[test]
    fn additional_services_are_merged_verbatim() {
        let graph = select(&Catalogue::standard(), &ProvisionOptions::new("8.0.0")).unwrap();
        let additional: BTreeMap<String, ComposeService> = serde_json::from_value(json!({
            "mailhog": {
                "image": "mailhog/mailhog",
                "ports": ["8025:8025"],
                "stop_grace_period": "1s"
            }
        }))
        .unwrap();

        let document = ComposeDocument::assemble(&graph, additional).unwrap();
        let mailhog = &document.services["mailhog"];
        assert_eq!(mailhog.image.as_deref(), Some("mailhog/mailhog"));
        assert_eq!(mailhog.extra["stop_grace_period"], json!("1s"));

        let rendered: serde_json::Value =
            serde_json::from_str(&document.render_to_string(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(rendered["services"]["mailhog"]["stop_grace_period"], json!("1s"));
        assert!(rendered["services"]["mailhog"].get("labels").is_none());
    }

    #[test]
    fn host_port_collisions_are_rejected() {
        let graph = select(&Catalogue::standard(), &ProvisionOptions::new("8.0.0")).unwrap();
        let additional: BTreeMap<String, ComposeService> = serde_json::from_value(json!({
            "zz-squatter": { "image": "nginx", "ports": ["9200:80"] }
        }))
        .unwrap();

        let err = ComposeDocument::assemble(&graph, additional).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::PortCollision { ref port, ref first, ref second }
                if port == "9200" && first == "elasticsearch" && second == "zz-squatter"
        ));
    }

    #[test]
    fn host_bindings() {
        assert_eq!(host_binding("127.0.0.1:8200:8200").as_deref(), Some("8200"));
        assert_eq!(host_binding("5432:5432").as_deref(), Some("5432"));
        assert_eq!(host_binding("8125:8125/udp").as_deref(), Some("8125/udp"));
        assert_eq!(host_binding("8126:8126/tcp").as_deref(), Some("8126"));
        assert_eq!(host_binding("9600"), None);
    }

    #[test]
    fn output_formats() {
        let document = document(&ProvisionOptions::new("8.0.0"));

        let json = document.render_to_string(OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], json!("2.1"));
        assert_eq!(value["services"].as_object().unwrap().len(), 4);

        let yaml = document.render_to_string(OutputFormat::Yaml).unwrap();
        assert!(yaml.starts_with("---\n"));
        let reparsed: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed, value);
    }

    #[tokio::test]
    async fn write_and_load_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("docker-compose.yml");
        document(&ProvisionOptions::new("8.0.0"))
            .write(&path, OutputFormat::Json)
            .await
            .unwrap();
        assert!(path.exists());

        let extra = dir.path().join("extra.json");
        tokio::fs::write(&extra, r#"{"mailhog": {"image": "mailhog/mailhog"}}"#)
            .await
            .unwrap();
        let loaded = load_additional_services(&extra).await.unwrap();
        assert_eq!(loaded["mailhog"].image.as_deref(), Some("mailhog/mailhog"));

        tokio::fs::write(&extra, "[]").await.unwrap();
        assert!(load_additional_services(&extra).await.is_err());
    }
}
