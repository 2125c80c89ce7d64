//! Service composition and environment provisioning.
//!
//! Given the services a user wants and a target stack version, this crate chooses the concrete set of services to run
//! ([`selection`]), generates their content ([`service`]), resolves build candidate artifacts ([`artifacts`]) and
//! acquires their images ([`images`]), renders the composition document an orchestrator consumes ([`compose`]), and
//! derives the fault-injection proxy layer that sits in front of the sample applications ([`proxy`]).

pub mod artifacts;
pub mod compose;
pub mod config;
pub mod fragment;
pub mod graph;
pub mod images;
pub mod options;
pub mod proxy;
pub mod selection;
pub mod service;
pub mod version;
