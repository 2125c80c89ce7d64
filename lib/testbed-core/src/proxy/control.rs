//! Runtime control of the fault-injection proxies.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use testbed_error::{GenericError, ProvisionError};
use tracing::{debug, info, warn};

use super::toxics::{self, RangeTable};

/// Toxics are only ever applied to the downstream direction.
pub const DOWNSTREAM: &str = "downstream";

/// A proxy as reported by toxiproxy.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Proxy {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    pub enabled: bool,

    #[serde(default)]
    pub toxics: Vec<Toxic>,
}

/// A toxic, either as reported by toxiproxy or about to be added.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Toxic {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub stream: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, i64>,
}

impl Toxic {
    /// A downstream toxic named `<kind>_downstream` setting a single attribute.
    pub fn downstream(kind: &str, attribute: &str, value: i64) -> Self {
        Self {
            name: format!("{}_{}", kind, DOWNSTREAM),
            kind: kind.to_string(),
            stream: DOWNSTREAM.to_string(),
            attributes: BTreeMap::from([(attribute.to_string(), value)]),
        }
    }
}

/// The toxiproxy HTTP API.
#[async_trait]
pub trait ToxiproxyApi: Send + Sync {
    /// Lists every proxy, keyed by name.
    async fn proxies(&self) -> Result<BTreeMap<String, Proxy>, GenericError>;

    async fn set_enabled(&self, proxy: &str, enabled: bool) -> Result<(), GenericError>;

    async fn toxics(&self, proxy: &str) -> Result<Vec<Toxic>, GenericError>;

    async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<(), GenericError>;

    async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<(), GenericError>;
}

/// A proxy's name and listen address.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProxySummary {
    pub name: String,
    pub listen: String,
}

/// A proxy and the toxic values currently applied to it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    pub enabled: bool,

    /// Attribute values keyed by attribute name, or slider values keyed by toxic code when denormalized.
    pub toxics: BTreeMap<String, i64>,
}

/// Drives the proxies through the slider protocol.
pub struct ProxyController<A> {
    api: A,
    ranges: RangeTable,
}

impl<A: ToxiproxyApi> ProxyController<A> {
    pub fn new(api: A, ranges: RangeTable) -> Self {
        Self { api, ranges }
    }

    /// Lists the proxy names.
    ///
    /// # Errors
    ///
    /// If toxiproxy cannot be queried, an error is returned.
    pub async fn list(&self) -> Result<Vec<String>, GenericError> {
        Ok(self.api.proxies().await?.into_keys().collect())
    }

    /// Lists every proxy with its listen address.
    ///
    /// # Errors
    ///
    /// If toxiproxy cannot be queried, an error is returned.
    pub async fn list_full(&self) -> Result<Vec<ProxySummary>, GenericError> {
        Ok(self
            .api
            .proxies()
            .await?
            .into_values()
            .map(|proxy| ProxySummary {
                name: proxy.name,
                listen: proxy.listen,
            })
            .collect())
    }

    /// Describes a single proxy, or `None` if it does not exist.
    ///
    /// With `denorm`, toxic attributes are reported as slider values keyed by toxic code; attributes without a code
    /// are left out.
    ///
    /// # Errors
    ///
    /// If toxiproxy cannot be queried, an error is returned.
    pub async fn app(&self, name: &str, denorm: bool) -> Result<Option<AppStatus>, GenericError> {
        let Some(proxy) = self.api.proxies().await?.remove(name) else {
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        for toxic in &proxy.toxics {
            for (attribute, value) in &toxic.attributes {
                if !denorm {
                    values.insert(attribute.clone(), *value);
                    continue;
                }
                if let Some(code) = toxics::encode(&toxic.kind, attribute) {
                    values.insert(code.to_string(), self.ranges.denormalize(code, *value)?);
                }
            }
        }

        Ok(Some(AppStatus {
            name: proxy.name,
            listen: proxy.listen,
            upstream: proxy.upstream,
            enabled: proxy.enabled,
            toxics: values,
        }))
    }

    /// Enables a proxy.
    ///
    /// # Errors
    ///
    /// If toxiproxy rejects the change, an error is returned.
    pub async fn enable(&self, proxy: &str) -> Result<(), GenericError> {
        self.api.set_enabled(proxy, true).await?;
        info!(proxy, "Enabled proxy.");
        Ok(())
    }

    /// Disables a proxy.
    ///
    /// # Errors
    ///
    /// If toxiproxy rejects the change, an error is returned.
    pub async fn disable(&self, proxy: &str) -> Result<(), GenericError> {
        self.api.set_enabled(proxy, false).await?;
        info!(proxy, "Disabled proxy.");
        Ok(())
    }

    /// Applies the toxic for `code` to `proxy` at the given slider position.
    ///
    /// If adding the toxic fails, typically because a toxic of that type is already present, every toxic on the
    /// proxy is removed and the add is retried once.
    ///
    /// # Errors
    ///
    /// If the code or slider value is invalid, `InvalidOption` is returned. If the retry fails too, `ToxicApplyFailed`
    /// is returned.
    pub async fn apply_toxic(&self, proxy: &str, code: &str, slider: i64) -> Result<(), ProvisionError> {
        let entry = toxics::decode(code)?;
        let value = self.ranges.normalize(code, slider)?;
        let toxic = Toxic::downstream(entry.kind, entry.attribute, value);

        let first = match self.api.add_toxic(proxy, &toxic).await {
            Ok(()) => {
                debug!(proxy, code, value, "Applied toxic.");
                return Ok(());
            }
            Err(e) => e,
        };
        warn!(proxy, code, error = %first, "Failed to add toxic, clearing the proxy and retrying.");

        let apply_failed = |e: GenericError| ProvisionError::ToxicApplyFailed {
            proxy: proxy.to_string(),
            code: code.to_string(),
            reason: format!("{:#}", e),
        };

        for existing in self.api.toxics(proxy).await.map_err(apply_failed)? {
            self.api
                .remove_toxic(proxy, &existing.name)
                .await
                .map_err(apply_failed)?;
        }
        self.api.add_toxic(proxy, &toxic).await.map_err(apply_failed)?;

        debug!(proxy, code, value, "Applied toxic after clearing the proxy.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use testbed_error::generic_error;

    use super::*;

    /// Behaves like toxiproxy: adding a toxic whose name is already taken fails.
    #[derive(Default)]
    struct FakeToxiproxy {
        proxies: Mutex<BTreeMap<String, Proxy>>,
        add_attempts: Mutex<usize>,
        reject_all: bool,
    }

    impl FakeToxiproxy {
        fn with_proxy(name: &str, listen: &str) -> Self {
            let fake = Self::default();
            fake.proxies.lock().unwrap().insert(
                name.to_string(),
                Proxy {
                    name: name.to_string(),
                    listen: listen.to_string(),
                    upstream: format!("{}:3000", name),
                    enabled: true,
                    toxics: Vec::new(),
                },
            );
            fake
        }

        fn toxics_on(&self, proxy: &str) -> Vec<Toxic> {
            self.proxies.lock().unwrap()[proxy].toxics.clone()
        }
    }

    #[async_trait]
    impl<'a> ToxiproxyApi for &'a FakeToxiproxy {
        async fn proxies(&self) -> Result<BTreeMap<String, Proxy>, GenericError> {
            Ok(self.proxies.lock().unwrap().clone())
        }

        async fn set_enabled(&self, proxy: &str, enabled: bool) -> Result<(), GenericError> {
            let mut proxies = self.proxies.lock().unwrap();
            let proxy = proxies.get_mut(proxy).ok_or_else(|| generic_error!("no such proxy"))?;
            proxy.enabled = enabled;
            Ok(())
        }

        async fn toxics(&self, proxy: &str) -> Result<Vec<Toxic>, GenericError> {
            Ok(self.toxics_on(proxy))
        }

        async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<(), GenericError> {
            *self.add_attempts.lock().unwrap() += 1;
            if self.reject_all {
                return Err(generic_error!("toxiproxy is unhappy"));
            }

            let mut proxies = self.proxies.lock().unwrap();
            let proxy = proxies.get_mut(proxy).ok_or_else(|| generic_error!("no such proxy"))?;
            if proxy.toxics.iter().any(|existing| existing.name == toxic.name) {
                return Err(generic_error!("toxic already exists"));
            }
            proxy.toxics.push(toxic.clone());
            Ok(())
        }

        async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<(), GenericError> {
            let mut proxies = self.proxies.lock().unwrap();
            let proxy = proxies.get_mut(proxy).ok_or_else(|| generic_error!("no such proxy"))?;
            proxy.toxics.retain(|existing| existing.name != toxic);
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_slide_takes_the_retry_path() {
        let fake = FakeToxiproxy::with_proxy("opbeans-python", "[::]:8000");
        let controller = ProxyController::new(&fake, RangeTable::default());

        controller.apply_toxic("opbeans-python", "L", 50).await.unwrap();
        assert_eq!(*fake.add_attempts.lock().unwrap(), 1);
        assert_eq!(fake.toxics_on("opbeans-python")[0].attributes["latency"], 500);

        controller.apply_toxic("opbeans-python", "L", 80).await.unwrap();
        assert_eq!(*fake.add_attempts.lock().unwrap(), 3);

        let toxics = fake.toxics_on("opbeans-python");
        assert_eq!(toxics.len(), 1);
        assert_eq!(toxics[0].name, "latency_downstream");
        assert_eq!(toxics[0].stream, "downstream");
        assert_eq!(toxics[0].attributes["latency"], 800);
    }

    #[tokio::test]
    async fn second_failure_is_surfaced() {
        let mut fake = FakeToxiproxy::with_proxy("postgres", "[::]:5432");
        fake.reject_all = true;
        let controller = ProxyController::new(&fake, RangeTable::default());

        let err = controller.apply_toxic("postgres", "B", 10).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ToxicApplyFailed { ref proxy, ref code, .. } if proxy == "postgres" && code == "B"
        ));
        assert_eq!(*fake.add_attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_codes_never_reach_toxiproxy() {
        let fake = FakeToxiproxy::with_proxy("redis", "[::]:6379");
        let controller = ProxyController::new(&fake, RangeTable::default());

        let err = controller.apply_toxic("redis", "Z", 10).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidOption { .. }));
        assert_eq!(*fake.add_attempts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn app_reports_raw_or_denormalized_values() {
        let fake = FakeToxiproxy::with_proxy("opbeans-go", "[::]:3003");
        let controller = ProxyController::new(&fake, RangeTable::default());
        controller.apply_toxic("opbeans-go", "L", 30).await.unwrap();

        let raw = controller.app("opbeans-go", false).await.unwrap().unwrap();
        assert_eq!(raw.toxics, BTreeMap::from([("latency".to_string(), 300)]));
        assert_eq!(raw.upstream, "opbeans-go:3000");

        let denorm = controller.app("opbeans-go", true).await.unwrap().unwrap();
        assert_eq!(denorm.toxics, BTreeMap::from([("L".to_string(), 30)]));

        assert_eq!(controller.app("missing", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_enable_disable() {
        let fake = FakeToxiproxy::with_proxy("redis", "[::]:6379");
        fake.proxies.lock().unwrap().insert(
            "postgres".to_string(),
            Proxy {
                name: "postgres".to_string(),
                listen: "[::]:5432".to_string(),
                upstream: "postgres:5432".to_string(),
                enabled: true,
                toxics: Vec::new(),
            },
        );
        let controller = ProxyController::new(&fake, RangeTable::default());

        assert_eq!(controller.list().await.unwrap(), ["postgres", "redis"]);
        assert_eq!(
            controller.list_full().await.unwrap()[1],
            ProxySummary {
                name: "redis".to_string(),
                listen: "[::]:6379".to_string(),
            }
        );

        controller.disable("redis").await.unwrap();
        assert!(!controller.app("redis", false).await.unwrap().unwrap().enabled);
        controller.enable("redis").await.unwrap();
        assert!(controller.app("redis", false).await.unwrap().unwrap().enabled);
    }
}
