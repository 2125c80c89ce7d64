//! Per-service content fragments and the building blocks shared by every descriptor.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

const DEFAULT_HEALTHCHECK_INTERVAL: &str = "10s";
const DEFAULT_HEALTHCHECK_RETRIES: u32 = 12;

/// A key the renderer fills with a computed default unless the descriptor sets it or opts out of it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Slot<T> {
    /// Use the computed default.
    #[default]
    Default,

    /// Remove the key from the rendered output.
    OptOut,

    /// Use this value.
    Set(T),
}

impl<T> Slot<T> {
    /// Resolves the slot against a lazily computed default.
    pub fn resolve_with<F>(&self, default: F) -> Option<T>
    where
        T: Clone,
        F: FnOnce() -> T,
    {
        match self {
            Slot::Default => Some(default()),
            Slot::OptOut => None,
            Slot::Set(value) => Some(value.clone()),
        }
    }
}

/// Container environment, either as `KEY=value` lines or as a mapping.
///
/// Insertion order is preserved in both forms.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Environment {
    /// `KEY=value` (or bare `KEY`) entries.
    List(Vec<String>),

    /// Key/value mapping.
    Map(IndexMap<String, String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(IndexMap::new())
    }
}

impl Environment {
    /// Creates an empty list-style environment.
    pub fn list() -> Self {
        Environment::List(Vec::new())
    }

    /// Appends or replaces `key`.
    ///
    /// In list form an existing `key=...` (or bare `key`) entry is replaced in place, otherwise the entry is appended.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self {
            Environment::Map(map) => {
                map.insert(key.to_string(), value);
            }
            Environment::List(entries) => {
                let line = format!("{}={}", key, value);
                match entries.iter().position(|entry| entry_key(entry) == key) {
                    Some(idx) => entries[idx] = line,
                    None => entries.push(line),
                }
            }
        }
    }

    /// Appends a raw `KEY=value` assignment, as supplied on the command line.
    pub fn push_assignment(&mut self, assignment: &str) {
        match self {
            Environment::List(entries) => entries.push(assignment.to_string()),
            Environment::Map(map) => {
                let (key, value) = assignment.split_once('=').unwrap_or((assignment, ""));
                map.insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Returns the value of `key`, if present with a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            Environment::Map(map) => map.get(key).map(String::as_str),
            Environment::List(entries) => entries
                .iter()
                .find(|entry| entry_key(entry) == key)
                .and_then(|entry| entry.split_once('=').map(|(_, value)| value)),
        }
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        match self {
            Environment::Map(map) => map.is_empty(),
            Environment::List(entries) => entries.is_empty(),
        }
    }
}

fn entry_key(entry: &str) -> &str {
    entry.split_once('=').map(|(key, _)| key).unwrap_or(entry)
}

/// Container command, either an argument vector or a single shell string.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Command {
    /// Exec-form arguments.
    Args(Vec<String>),

    /// Shell-form command line.
    Shell(String),
}

/// Build arguments, as a list of `KEY=value` lines or a mapping.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BuildArgs {
    /// `KEY=value` entries.
    List(Vec<String>),

    /// Key/value mapping.
    Map(IndexMap<String, String>),
}

/// Local image build specification.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Build {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BuildArgs>,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

impl Build {
    /// Creates a build from `context` using its `Dockerfile`.
    pub fn dockerfile(context: impl Into<String>) -> Self {
        Self {
            args: None,
            context: context.into(),
            dockerfile: Some("Dockerfile".to_string()),
        }
    }

    /// Creates a build from `context` with no explicit dockerfile.
    pub fn context(context: impl Into<String>) -> Self {
        Self {
            args: None,
            context: context.into(),
            dockerfile: None,
        }
    }

    /// Sets the build arguments.
    pub fn with_args(mut self, args: BuildArgs) -> Self {
        self.args = Some(args);
        self
    }
}

/// Container health check.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Healthcheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    pub test: Vec<String>,
}

impl Healthcheck {
    /// Creates a health check running `test`, with no interval or retry settings.
    pub fn command<I, S>(test: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interval: None,
            retries: None,
            test: test.into_iter().map(Into::into).collect(),
        }
    }

    /// An HTTP probe using `curl` against `http://<host>:<port><path>`.
    pub fn curl(port: u16, host: &str, path: &str) -> Self {
        Self::command([
            "CMD",
            "curl",
            "--write-out",
            "'HTTP %{http_code}'",
            "--fail",
            "--silent",
            "--output",
            "/dev/null",
        ])
        .with_arg(format!("http://{}:{}{}", host, port, path))
        .with_defaults()
    }

    /// An HTTP probe using `wget` against `http://<host>:<port><path>`.
    pub fn wget(port: u16, host: &str, path: &str) -> Self {
        Self::command(["CMD", "wget", "-q", "--server-response", "-O", "/dev/null"])
            .with_arg(format!("http://{}:{}{}", host, port, path))
            .with_defaults()
    }

    fn with_arg(mut self, arg: String) -> Self {
        self.test.push(arg);
        self
    }

    fn with_defaults(self) -> Self {
        self.interval(DEFAULT_HEALTHCHECK_INTERVAL)
            .retries(DEFAULT_HEALTHCHECK_RETRIES)
    }

    /// Sets the probe interval.
    pub fn interval(mut self, interval: &str) -> Self {
        self.interval = Some(interval.to_string());
        self
    }

    /// Sets the number of consecutive failures tolerated.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Start-up condition attached to a dependency edge.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCondition {
    /// Wait for the dependency's health check to pass.
    ServiceHealthy,

    /// Wait for the dependency's container to start.
    ServiceStarted,
}

/// A single `depends_on` entry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DependsOn {
    pub condition: HealthCondition,
}

impl DependsOn {
    /// Wait until healthy.
    pub const HEALTHY: DependsOn = DependsOn {
        condition: HealthCondition::ServiceHealthy,
    };

    /// Wait until started.
    pub const STARTED: DependsOn = DependsOn {
        condition: HealthCondition::ServiceStarted,
    };
}

/// Container log driver configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Logging {
    pub driver: String,
    pub options: IndexMap<String, String>,
}

impl Logging {
    /// Rotating JSON file logs: five files of at most two megabytes.
    pub fn rotating_json_file() -> Self {
        Self {
            driver: "json-file".to_string(),
            options: IndexMap::from([
                ("max-file".to_string(), "5".to_string()),
                ("max-size".to_string(), "2m".to_string()),
            ]),
        }
    }
}

/// A resource limit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ulimit {
    pub hard: i64,
    pub soft: i64,
}

/// Formats a published port.
///
/// Ports bind to the loopback interface unless `expose` is set.
pub fn publish_port(external: u16, internal: u16, expose: bool) -> String {
    if expose {
        format!("{}:{}", external, internal)
    } else {
        format!("127.0.0.1:{}:{}", external, internal)
    }
}

/// The content a descriptor produces for one service, before defaults are applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceFragment {
    pub build: Option<Build>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub command: Option<Command>,
    pub container_name: Slot<String>,
    pub depends_on: IndexMap<String, DependsOn>,
    pub environment: Option<Environment>,
    pub healthcheck: Option<Healthcheck>,
    pub image: Slot<String>,
    pub labels: Slot<Vec<String>>,
    pub logging: Slot<Logging>,
    pub network_mode: Option<String>,
    pub ports: Vec<String>,
    pub privileged: Option<bool>,
    pub restart: Option<String>,
    pub ulimits: Option<IndexMap<String, Ulimit>>,
    pub user: Option<String>,
    pub volumes: Vec<String>,
}

impl ServiceFragment {
    /// Adds a dependency that must report healthy first.
    pub fn depends_on_healthy(&mut self, service: &str) {
        self.depends_on.insert(service.to_string(), DependsOn::HEALTHY);
    }

    /// Returns the environment, creating an empty list-style one if absent.
    pub fn environment_mut(&mut self) -> &mut Environment {
        self.environment.get_or_insert_with(Environment::list)
    }

    /// Marks the service as locally built: the remote image and the stack-version label are both opted out.
    pub fn built_locally(mut self, build: Build) -> Self {
        self.build = Some(build);
        self.image = Slot::OptOut;
        self.labels = Slot::OptOut;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_environment_replaces_in_place() {
        let mut env = Environment::List(vec!["A=1".into(), "B=2".into(), "C".into()]);
        env.set("B", "20");
        env.set("C", "3");
        env.set("D", "4");

        assert_eq!(
            env,
            Environment::List(vec!["A=1".into(), "B=20".into(), "C=3".into(), "D=4".into()])
        );
        assert_eq!(env.get("B"), Some("20"));
        assert_eq!(env.get("Z"), None);
    }

    #[test]
    fn map_environment_accepts_assignments() {
        let mut env = Environment::default();
        env.push_assignment("FOO=bar=baz");
        env.push_assignment("EMPTY");

        assert_eq!(env.get("FOO"), Some("bar=baz"));
        assert_eq!(env.get("EMPTY"), Some(""));
    }

    #[test]
    fn curl_healthcheck_shape() {
        let check = Healthcheck::curl(8200, "localhost", "/").retries(3);
        assert_eq!(check.interval.as_deref(), Some("10s"));
        assert_eq!(check.retries, Some(3));
        assert_eq!(check.test.first().map(String::as_str), Some("CMD"));
        assert_eq!(check.test.last().map(String::as_str), Some("http://localhost:8200/"));
        assert!(check.test.contains(&"'HTTP %{http_code}'".to_string()));
    }

    #[test]
    fn ports() {
        assert_eq!(publish_port(8200, 8200, false), "127.0.0.1:8200:8200");
        assert_eq!(publish_port(5432, 5432, true), "5432:5432");
    }

    #[test]
    fn slot_resolution() {
        assert_eq!(Slot::<String>::Default.resolve_with(|| "d".into()), Some("d".into()));
        assert_eq!(Slot::<String>::OptOut.resolve_with(|| "d".into()), None);
        assert_eq!(Slot::Set("x".to_string()).resolve_with(|| "d".into()), Some("x".into()));
    }
}
