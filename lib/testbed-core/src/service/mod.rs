//! The service capability model.
//!
//! Every service the engine can compose is a [`ServiceKind`] in the static [`Catalogue`]. Binding a kind to the
//! requested stack version and the user's overrides yields a [`ServiceDescriptor`], whose content function produces
//! the service's [`ServiceFragment`](crate::fragment::ServiceFragment).

mod agents;
mod beats;
pub mod catalogue;
mod descriptor;
pub mod opbeans;
pub mod outputs;
mod stack;
mod support;

use testbed_error::ProvisionError;

pub use self::catalogue::{ArtifactScheme, Catalogue, Category, ImageSpec, ServiceKind, LOAD_GENERATOR, WAIT_SERVICE};
pub use self::descriptor::{ReleaseChannel, ServiceDescriptor};
use crate::{fragment::ServiceFragment, options::ProvisionOptions};

/// Everything a content function can see while generating a fragment.
#[derive(Clone, Copy, Debug)]
pub struct ServiceContext<'a> {
    /// The service being generated.
    pub descriptor: &'a ServiceDescriptor,

    /// The composition options.
    pub options: &'a ProvisionOptions,

    /// Every service chosen for this composition, the barrier and fault-injection services excluded.
    pub selected: &'a [ServiceDescriptor],
}

impl<'a> ServiceContext<'a> {
    /// Returns `true` if `name` is part of the composition.
    pub fn is_selected(&self, name: &str) -> bool {
        self.selected.iter().any(|descriptor| descriptor.name() == name)
    }

    /// The API key agents should present, when one was given and the stack supports it.
    pub fn api_key(&self) -> Option<&'a str> {
        match &self.options.apm_api_key {
            Some(key) if self.descriptor.at_least("7.6") => Some(key.as_str()),
            _ => None,
        }
    }

    /// Generates the descriptor's content fragment.
    pub fn content(&self) -> Result<ServiceFragment, ProvisionError> {
        (self.descriptor.kind().content)(self)
    }
}
