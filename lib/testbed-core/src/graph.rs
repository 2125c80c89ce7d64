//! The dependency graph of a composition.

use indexmap::IndexMap;
use snafu::Snafu;
use tracing::debug;

use crate::{
    fragment::{DependsOn, ServiceFragment},
    service::{ServiceDescriptor, WAIT_SERVICE},
};

/// Violations of the graph invariants.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum GraphError {
    /// A service depends on a service that is not part of the graph.
    #[snafu(display("Service '{}' depends on '{}', which is not part of the composition.", service, dependency))]
    DanglingEdge {
        /// The dependent service.
        service: String,

        /// The missing dependency.
        dependency: String,
    },

    /// A service depends on the completion barrier.
    #[snafu(display("Service '{}' depends on '{}', which may only ever be a sink.", service, WAIT_SERVICE))]
    WaitAsDependency {
        /// The dependent service.
        service: String,
    },
}

/// A selected service and its generated content.
#[derive(Clone, Debug)]
pub struct Node {
    pub descriptor: ServiceDescriptor,
    pub fragment: ServiceFragment,
}

/// Selected services keyed by name, with `depends_on` edges carried by each node's fragment.
///
/// Nodes keep their insertion order, which is the order selection chose them in.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<String, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, replacing any existing node of the same name.
    pub fn insert(&mut self, descriptor: ServiceDescriptor, fragment: ServiceFragment) {
        self.nodes
            .insert(descriptor.name().to_string(), Node { descriptor, fragment });
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node names, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    /// The dependencies of `name` and their health conditions.
    pub fn dependencies_of(&self, name: &str) -> Option<&IndexMap<String, DependsOn>> {
        self.nodes.get(name).map(|node| &node.fragment.depends_on)
    }

    /// Drops every edge whose target is not a node, returning how many were dropped.
    ///
    /// Services declare upstream requirements regardless of what else was selected; an edge to a service the user
    /// disabled simply disappears.
    pub fn prune_dangling(&mut self) -> usize {
        let present: Vec<String> = self.nodes.keys().cloned().collect();
        let mut pruned = 0;
        for (name, node) in self.nodes.iter_mut() {
            node.fragment.depends_on.retain(|dependency, _| {
                let keep = present.contains(dependency);
                if !keep {
                    debug!(service = %name, %dependency, "Dropping dependency on unselected service.");
                    pruned += 1;
                }
                keep
            });
        }
        pruned
    }

    /// Checks the graph invariants.
    ///
    /// # Errors
    ///
    /// If any edge targets a service that is not a node, `DanglingEdge` is returned. If any node depends on the
    /// completion barrier, `WaitAsDependency` is returned.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (name, node) in &self.nodes {
            for dependency in node.fragment.depends_on.keys() {
                if dependency == WAIT_SERVICE {
                    return Err(GraphError::WaitAsDependency { service: name.clone() });
                }
                if !self.nodes.contains_key(dependency) {
                    return Err(GraphError::DanglingEdge {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
