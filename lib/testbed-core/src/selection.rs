//! Turning user intent into a concrete set of services.
//!
//! Selection runs in three steps. [`choose`] decides which kinds take part and binds each to a
//! [`ServiceDescriptor`]. [`resolve_build_candidates`] attaches build candidate manifests to the descriptors that asked
//! for one. [`materialize`] generates every service's content and assembles the [`DependencyGraph`]. [`select`] runs
//! the first and last steps for callers that do not need build candidates.

use snafu::{ResultExt as _, Snafu};
use testbed_error::ProvisionError;
use tracing::{debug, info};

use crate::{
    artifacts::{BuildCandidateResolver, ManifestSource},
    graph::{DependencyGraph, GraphError},
    options::ProvisionOptions,
    service::{opbeans, Catalogue, Category, ServiceContext, ServiceDescriptor, ServiceKind, LOAD_GENERATOR, WAIT_SERVICE},
};

/// Fault-injection services added, in this order, when the proxy layer is requested.
const FAULT_INJECTION: [&str; 3] = ["toxi", "dyno", "stats-d"];

/// Errors raised while selecting services.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SelectionError {
    /// A descriptor could not be built or its content could not be generated.
    #[snafu(display("{}", source))]
    Provision {
        /// Error source.
        source: ProvisionError,
    },

    /// The assembled graph violates its invariants.
    #[snafu(display("Invalid dependency graph: {}", source))]
    InvalidGraph {
        /// Error source.
        source: GraphError,
    },
}

impl From<ProvisionError> for SelectionError {
    fn from(source: ProvisionError) -> Self {
        Self::Provision { source }
    }
}

struct Intent<'a> {
    options: &'a ProvisionOptions,
    any_opbeans: bool,
}

impl<'a> Intent<'a> {
    fn new(catalogue: &Catalogue, options: &'a ProvisionOptions) -> Self {
        let any_opbeans = options.run_all_opbeans
            || options.run_all
            || catalogue
                .in_category(Category::Opbeans)
                .any(|kind| options.explicit_choice(kind.name) == Some(true));
        Self { options, any_opbeans }
    }

    fn wants(&self, kind: &ServiceKind) -> bool {
        let options = self.options;
        if matches!(kind.category, Category::Fault | Category::Barrier) {
            return false;
        }

        let all_opbeans = options.run_all_opbeans || options.run_all;
        options
            .explicit_choice(kind.name)
            .unwrap_or(kind.enabled_by_default)
            || (all_opbeans && kind.category == Category::Opbeans && !kind.secondary && !kind.opbeans_side_car)
            || (self.any_opbeans && kind.opbeans_side_car && !kind.secondary)
            || (options.run_all && kind.category == Category::Beat)
    }
}

/// Chooses the services that take part in the composition, in catalogue order.
///
/// Side-cars are chosen once no matter how many opbeans services pull them in. The load generator is dropped when it
/// has nothing to drive or was disabled. The completion barrier always follows, and the fault-injection services come
/// last when requested.
///
/// # Errors
///
/// If the options are inconsistent, or a chosen service cannot be bound to its version, an error is returned.
pub fn choose(catalogue: &Catalogue, options: &ProvisionOptions) -> Result<Vec<ServiceDescriptor>, ProvisionError> {
    options.validate()?;

    let intent = Intent::new(catalogue, options);
    let mut chosen = Vec::new();
    for kind in catalogue.iter().filter(|kind| intent.wants(kind)) {
        chosen.push(ServiceDescriptor::new(kind, options)?);
    }

    if chosen.iter().any(|d| d.name() == LOAD_GENERATOR) {
        let idle = opbeans::loadgen_targets(&chosen, options).is_empty();
        if idle || options.opbeans.disable_load_generator {
            debug!(idle, "Dropping the opbeans load generator.");
            chosen.retain(|d| d.name() != LOAD_GENERATOR);
        }
    }

    let mut trailing = vec![WAIT_SERVICE];
    if options.dyno {
        trailing.extend(FAULT_INJECTION);
    }
    for name in trailing {
        if let Some(kind) = catalogue.find(name) {
            chosen.push(ServiceDescriptor::new(kind, options)?);
        }
    }

    info!(
        services = %chosen.iter().map(|d| d.name()).collect::<Vec<_>>().join(","),
        "Chose services."
    );
    Ok(chosen)
}

/// Attaches build candidate manifests to every descriptor that asked for one.
///
/// # Errors
///
/// If a manifest cannot be resolved, an error is returned.
pub async fn resolve_build_candidates<S: ManifestSource>(
    descriptors: Vec<ServiceDescriptor>, resolver: &mut BuildCandidateResolver<S>,
) -> Result<Vec<ServiceDescriptor>, ProvisionError> {
    let mut resolved = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let manifest = resolver
            .resolve(descriptor.version().as_str(), descriptor.requested_bc())
            .await?;
        resolved.push(match manifest {
            Some(manifest) => descriptor.with_manifest(manifest),
            None => descriptor,
        });
    }
    Ok(resolved)
}

/// Generates every service's content and assembles the dependency graph.
///
/// Content functions see every chosen service except the barrier and the fault-injection layer. Edges to services
/// that were not chosen are dropped.
///
/// # Errors
///
/// If content generation fails or the resulting graph is invalid, an error is returned.
pub fn materialize(
    descriptors: Vec<ServiceDescriptor>, options: &ProvisionOptions,
) -> Result<DependencyGraph, SelectionError> {
    let selected: Vec<ServiceDescriptor> = descriptors
        .iter()
        .filter(|d| !matches!(d.category(), Category::Fault | Category::Barrier))
        .cloned()
        .collect();

    let mut graph = DependencyGraph::new();
    for descriptor in descriptors {
        let fragment = ServiceContext {
            descriptor: &descriptor,
            options,
            selected: &selected,
        }
        .content()
        .context(Provision)?;
        graph.insert(descriptor, fragment);
    }

    let pruned = graph.prune_dangling();
    if pruned > 0 {
        debug!(pruned, "Dropped dependencies on unselected services.");
    }
    graph.validate().context(InvalidGraph)?;
    Ok(graph)
}

/// Chooses and materializes services without build candidate resolution.
///
/// # Errors
///
/// If a service cannot be chosen or materialized, an error is returned.
pub fn select(catalogue: &Catalogue, options: &ProvisionOptions) -> Result<DependencyGraph, SelectionError> {
    let chosen = choose(catalogue, options)?;
    materialize(chosen, options)
}
