use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use testbed_core::{
    artifacts::{artifact_url, BuildCandidateResolver, ManifestCache, StagingClient},
    compose::{load_additional_services, ComposeDocument, ComposeService},
    config::Settings,
    images::{DockerCliLoader, HttpArtifactFetcher, ImageAcquirer},
    options::{OutputFormat, ProvisionOptions},
    proxy::ProxyTopology,
    selection,
    service::Catalogue,
};
use testbed_error::{generic_error, ErrorContext as _, GenericError};
use tracing::info;

use crate::{
    cli::{ComposeArgs, StartArgs},
    runner::{BuildFlags, ComposeRunner},
};

/// The composed environment, ready to be written out.
pub struct Composition {
    pub document: ComposeDocument,

    /// Build candidate archive URL per service that has one.
    pub artifacts: BTreeMap<String, String>,

    /// The rendered proxy configuration, when the proxy layer is enabled.
    pub proxy_config: Option<String>,
}

/// Chooses services, resolves build candidates and assembles the composition document.
pub async fn compose(
    catalogue: &Catalogue, settings: &Settings, options: &ProvisionOptions, with_services: &[PathBuf],
) -> Result<Composition, GenericError> {
    let chosen = selection::choose(catalogue, options)?;

    let mut resolver = BuildCandidateResolver::new(
        StagingClient::new(reqwest::Client::new()),
        settings.staging_base_url.clone(),
        ManifestCache::new(),
    );
    let resolved = selection::resolve_build_candidates(chosen, &mut resolver).await?;

    let mut artifacts = BTreeMap::new();
    for descriptor in &resolved {
        if let Some(url) = artifact_url(descriptor)? {
            artifacts.insert(descriptor.name().to_string(), url);
        }
    }

    let proxy_config = if options.dyno {
        let topology = ProxyTopology::from_selection(&resolved);
        topology.validate()?;
        Some(topology.to_config()?)
    } else {
        None
    };

    let graph = selection::materialize(resolved, options)?;

    let mut additional: BTreeMap<String, ComposeService> = BTreeMap::new();
    for path in with_services {
        additional.extend(load_additional_services(path).await?);
    }
    let document = ComposeDocument::assemble(&graph, additional)?;

    Ok(Composition {
        document,
        artifacts,
        proxy_config,
    })
}

/// Writes the composition document and, with the proxy layer enabled, the proxy configuration.
///
/// A document path of `-` prints the document instead.
pub async fn write(
    composition: &Composition, settings: &Settings, compose_path: &Path, format: OutputFormat,
) -> Result<(), GenericError> {
    if compose_path == Path::new("-") {
        println!("{}", composition.document.render_to_string(format)?);
    } else {
        composition.document.write(compose_path, format).await?;
    }

    if let Some(config) = &composition.proxy_config {
        let path = &settings.toxi_config_path;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_error_context(|| format!("Failed to create directory '{}'.", parent.display()))?;
        }
        tokio::fs::write(path, config)
            .await
            .with_error_context(|| format!("Failed to write proxy configuration to '{}'.", path.display()))?;
        info!(path = %path.display(), "Wrote proxy configuration.");
    }

    Ok(())
}

fn compose_path<'a>(args: &'a ComposeArgs, settings: &'a Settings) -> &'a Path {
    args.docker_compose_path.as_deref().unwrap_or(&settings.compose_path)
}

/// Runs `compose`: writes the document without starting anything.
pub async fn run_compose(
    catalogue: &Catalogue, settings: &Settings, args: &ComposeArgs, options: ProvisionOptions,
) -> Result<(), GenericError> {
    let composition = compose(catalogue, settings, &options, &args.with_services).await?;
    write(&composition, settings, compose_path(args, settings), args.output_format).await
}

/// Runs `start`: writes the document, acquires images and brings the environment up.
pub async fn run_start(
    catalogue: &Catalogue, settings: &Settings, args: &StartArgs, options: ProvisionOptions,
) -> Result<(), GenericError> {
    let compose_args = &args.compose;
    let composition = compose(catalogue, settings, &options, &compose_args.with_services).await?;

    let path = compose_path(compose_args, settings);
    if path == Path::new("-") {
        return Err(generic_error!("'start' needs a composition document on disk, not standard output."));
    }
    write(&composition, settings, path, compose_args.output_format).await?;

    if !args.skip_download {
        let urls: BTreeSet<String> = composition.artifacts.values().cloned().collect();
        ImageAcquirer::new(
            HttpArtifactFetcher::new(reqwest::Client::new()),
            DockerCliLoader::default(),
            settings.image_cache_dir.clone(),
        )
        .with_pool_width(settings.image_pool_width)
        .with_timeout(settings.image_acquire_timeout())
        .acquire(&urls)
        .await?;
    }

    let runner = ComposeRunner::new(settings, path);
    let flags = BuildFlags {
        pull: !args.skip_pull,
        no_cache: args.force_build,
        parallel: args.build_parallel,
    };
    runner.build(&composition.document.build_services(), flags).await?;

    if !args.skip_download {
        let pulled = images_to_pull(&composition);
        runner.pull(&pulled).await?;
    }

    runner.up(args.remove_orphans).await?;
    info!(services = composition.document.services.len(), "Environment started.");
    Ok(())
}

/// Image-based services whose image is not loaded from a build candidate archive.
fn images_to_pull(composition: &Composition) -> Vec<&str> {
    composition
        .document
        .image_services()
        .into_iter()
        .filter(|name| !composition.artifacts.contains_key(*name))
        .collect()
}

#[cfg(test)]
mod tests {
    use testbed_core::options::ServiceOverrides;

    use super::*;

    fn settings(dir: &Path) -> Settings {
        Settings {
            toxi_config_path: dir.join("toxi/toxi.cfg"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn compose_writes_document_and_proxy_config() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let mut options = ProvisionOptions::new("7.6.2").with_service("opbeans-go", true);
        options.dyno = true;
        let composition = compose(&Catalogue::standard(), &settings, &options, &[]).await.unwrap();
        assert!(composition.artifacts.is_empty());
        assert!(composition.document.services.contains_key("toxi"));

        let compose_path = dir.path().join("docker-compose.yml");
        write(&composition, &settings, &compose_path, OutputFormat::Json)
            .await
            .unwrap();

        let document: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&compose_path).unwrap()).unwrap();
        assert!(document["services"]["opbeans-go"].is_object());

        let proxies: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&settings.toxi_config_path).unwrap()).unwrap();
        let names: Vec<&str> = proxies
            .as_array()
            .unwrap()
            .iter()
            .map(|proxy| proxy["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"opbeans-go"));
    }

    #[tokio::test]
    async fn released_images_are_pulled() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let options = ProvisionOptions::new("7.6.2");
        let composition = compose(&Catalogue::standard(), &settings, &options, &[]).await.unwrap();

        let pulled = images_to_pull(&composition);
        assert!(pulled.contains(&"elasticsearch"));
        assert!(pulled.contains(&"kibana"));
        assert!(composition.document.build_services().iter().all(|name| !pulled.contains(name)));
    }

    #[tokio::test]
    async fn colliding_proxy_ports_fail_before_anything_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let mut options = ProvisionOptions::new("7.6.2")
            .with_service("opbeans-go", true)
            .with_service("opbeans-java", true);
        options.dyno = true;
        options.overrides.insert(
            "opbeans-java".to_string(),
            ServiceOverrides {
                port: Some(3003),
                ..Default::default()
            },
        );

        let err = compose(&Catalogue::standard(), &settings, &options, &[])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("3003"));
        assert!(!dir.path().join("docker-compose.yml").exists());
        assert!(!settings.toxi_config_path.exists());
    }
}
