//! The fault-injection proxy topology.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use testbed_error::{ErrorContext as _, GenericError, ProvisionError};

use crate::service::{opbeans, ServiceDescriptor};

/// Stateful side-cars routed through the proxy when selected.
const PROXIED_SIDE_CARS: [&str; 2] = ["postgres", "redis"];

/// One proxy: toxiproxy listens on `listen` and forwards to `upstream`.
///
/// Fields are declared in the order they are written to the proxy configuration file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProxyDef {
    pub enabled: bool,
    pub listen: String,
    pub name: String,
    pub upstream: String,
}

/// The proxies derived from a service selection.
///
/// Every proxied opbeans application listens on its external port and forwards to the application port inside its
/// container. Selected stateful side-cars follow the applications.
#[derive(Clone, Debug)]
pub struct ProxyTopology<'a> {
    applications: Vec<&'a ServiceDescriptor>,
    proxies: Vec<ProxyDef>,
}

impl<'a> ProxyTopology<'a> {
    /// Derives the topology from the selected services.
    pub fn from_selection(selected: &'a [ServiceDescriptor]) -> Self {
        let mut applications: Vec<&ServiceDescriptor> = selected
            .iter()
            .filter(|descriptor| opbeans::is_proxied_application(descriptor))
            .collect();
        applications.sort_by_key(|descriptor| descriptor.name());
        applications.dedup_by_key(|descriptor| descriptor.name());

        let mut proxies: Vec<ProxyDef> = applications
            .iter()
            .map(|descriptor| proxy(descriptor.name(), descriptor.port(), opbeans::APPLICATION_PORT))
            .collect();

        for name in PROXIED_SIDE_CARS {
            if let Some(descriptor) = selected.iter().find(|descriptor| descriptor.name() == name) {
                let upstream_port = descriptor.kind().port.unwrap_or_else(|| descriptor.port());
                proxies.push(proxy(name, descriptor.port(), upstream_port));
            }
        }

        Self { applications, proxies }
    }

    /// The proxied opbeans applications, sorted by name.
    pub fn proxied_opbeans(&self) -> impl Iterator<Item = &'a ServiceDescriptor> + '_ {
        self.applications.iter().copied()
    }

    pub fn proxies(&self) -> &[ProxyDef] {
        &self.proxies
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Checks that no two proxies listen on the same port.
    ///
    /// # Errors
    ///
    /// If two proxies share a listen port, `PortCollision` is returned naming both.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for proxy in &self.proxies {
            if let Some(first) = owners.insert(listen_port(&proxy.listen), proxy.name.as_str()) {
                return Err(ProvisionError::PortCollision {
                    port: listen_port(&proxy.listen).to_string(),
                    first: first.to_string(),
                    second: proxy.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Renders the toxiproxy configuration file: a JSON array of proxies indented by four spaces.
    ///
    /// # Errors
    ///
    /// If serialization fails, an error is returned.
    pub fn to_config(&self) -> Result<String, GenericError> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.proxies
            .serialize(&mut serializer)
            .error_context("Failed to serialize proxy configuration.")?;
        String::from_utf8(buffer).error_context("Proxy configuration is not valid UTF-8.")
    }
}

fn proxy(name: &str, listen_port: u16, upstream_port: u16) -> ProxyDef {
    ProxyDef {
        enabled: true,
        listen: format!("[::]:{}", listen_port),
        name: name.to_string(),
        upstream: format!("{}:{}", name, upstream_port),
    }
}

fn listen_port(listen: &str) -> &str {
    listen.rsplit(':').next().unwrap_or(listen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        options::{ProvisionOptions, ServiceOverrides},
        service::Catalogue,
    };

    fn descriptors(options: &ProvisionOptions, names: &[&str]) -> Vec<ServiceDescriptor> {
        let catalogue = Catalogue::standard();
        names
            .iter()
            .map(|name| ServiceDescriptor::new(catalogue.find(name).unwrap(), options).unwrap())
            .collect()
    }

    #[test]
    fn applications_then_side_cars() {
        let selected = descriptors(
            &ProvisionOptions::new("8.0.0"),
            &["redis", "opbeans-ruby", "opbeans-rum", "postgres", "opbeans-dotnet", "opbeans-load-generator", "kibana"],
        );
        let topology = ProxyTopology::from_selection(&selected);

        let names: Vec<_> = topology.proxies().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["opbeans-dotnet", "opbeans-ruby", "postgres", "redis"]);
        assert_eq!(
            topology.proxies()[1],
            ProxyDef {
                enabled: true,
                listen: "[::]:3001".to_string(),
                name: "opbeans-ruby".to_string(),
                upstream: "opbeans-ruby:3000".to_string(),
            }
        );
        assert_eq!(topology.proxies()[2].upstream, "postgres:5432");
        topology.validate().unwrap();
    }

    #[test]
    fn listen_follows_port_overrides() {
        let mut options = ProvisionOptions::new("8.0.0");
        options.overrides.insert(
            "opbeans-go".to_string(),
            ServiceOverrides {
                port: Some(4003),
                ..Default::default()
            },
        );
        let selected = descriptors(&options, &["opbeans-go"]);
        let topology = ProxyTopology::from_selection(&selected);

        assert_eq!(topology.proxies()[0].listen, "[::]:4003");
        assert_eq!(topology.proxies()[0].upstream, "opbeans-go:3000");
        assert_eq!(topology.proxied_opbeans().map(|d| d.port()).collect::<Vec<_>>(), [4003]);
    }

    #[test]
    fn shared_listen_ports_collide() {
        let mut options = ProvisionOptions::new("8.0.0");
        options.overrides.insert(
            "opbeans-java".to_string(),
            ServiceOverrides {
                port: Some(3003),
                ..Default::default()
            },
        );
        let selected = descriptors(&options, &["opbeans-go", "opbeans-java"]);
        let err = ProxyTopology::from_selection(&selected).validate().unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::PortCollision { ref port, ref first, ref second }
                if port == "3003" && first == "opbeans-go" && second == "opbeans-java"
        ));
    }

    #[test]
    fn config_is_four_space_indented() {
        let selected = descriptors(&ProvisionOptions::new("8.0.0"), &["opbeans-python"]);
        let config = ProxyTopology::from_selection(&selected).to_config().unwrap();
        assert_eq!(
            config,
            "[\n    {\n        \"enabled\": true,\n        \"listen\": \"[::]:8000\",\n        \"name\": \"opbeans-python\",\n        \"upstream\": \"opbeans-python:3000\"\n    }\n]"
        );
    }

    #[test]
    fn nothing_to_proxy() {
        let selected = descriptors(&ProvisionOptions::new("8.0.0"), &["elasticsearch", "opbeans-rum"]);
        let topology = ProxyTopology::from_selection(&selected);
        assert!(topology.is_empty());
        assert_eq!(topology.to_config().unwrap(), "[]");
    }
}
