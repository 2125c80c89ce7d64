//! Composition options.
//!
//! Options are resolved once from the command line and then shared immutably with every descriptor. Nothing in the
//! composition pipeline mutates them.

use std::{collections::BTreeMap, fmt, str::FromStr};

use testbed_error::ProvisionError;

use crate::version::{resolve_stack_version, DEFAULT_STACK_VERSION};

/// Default URL agents and sample applications use to reach the APM server.
pub const DEFAULT_APM_SERVER_URL: &str = "http://apm-server:8200";

/// Default URL the browser-side agent uses to reach the APM server.
pub const DEFAULT_APM_JS_SERVER_URL: &str = "http://localhost:8200";

/// Default agent log level.
pub const DEFAULT_APM_LOG_LEVEL: &str = "info";

/// Default `service.version` reported by the sample applications.
pub const DEFAULT_SERVICE_VERSION: &str = "9c2e41c8-fb2f-4b75-a89d-5089fb55fc64";

/// Default Elasticsearch URL, as seen from inside the composition network.
pub const DEFAULT_ELASTICSEARCH_URL: &str = "http://elasticsearch:9200";

/// Output format of the composition document.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OutputFormat {
    /// Pretty-printed JSON with sorted keys.
    #[default]
    Json,

    /// YAML with an explicit document start marker.
    Yaml,
}

impl FromStr for OutputFormat {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            other => Err(invalid_choice("output-format", other, &["json", "yaml"])),
        }
    }
}

/// Where the APM server ships events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ApmServerOutput {
    #[default]
    Elasticsearch,
    File,
    Kafka,
    Logstash,
}

impl FromStr for ApmServerOutput {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elasticsearch" => Ok(ApmServerOutput::Elasticsearch),
            "file" => Ok(ApmServerOutput::File),
            "kafka" => Ok(ApmServerOutput::Kafka),
            "logstash" => Ok(ApmServerOutput::Logstash),
            other => Err(invalid_choice(
                "apm-server-output",
                other,
                &["elasticsearch", "file", "kafka", "logstash"],
            )),
        }
    }
}

/// Where a beat ships events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BeatOutput {
    #[default]
    Elasticsearch,
    Logstash,
}

impl FromStr for BeatOutput {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elasticsearch" => Ok(BeatOutput::Elasticsearch),
            "logstash" => Ok(BeatOutput::Logstash),
            other => Err(invalid_choice("<beat>-output", other, &["elasticsearch", "logstash"])),
        }
    }
}

/// APM server internal queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QueueKind {
    #[default]
    Memory,
    File,
}

impl FromStr for QueueKind {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mem" => Ok(QueueKind::Memory),
            "file" => Ok(QueueKind::File),
            other => Err(invalid_choice("apm-server-queue", other, &["file", "mem"])),
        }
    }
}

/// Agent log level, as accepted on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentLogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl AgentLogLevel {
    /// The lowercase name most agents accept verbatim.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentLogLevel::Trace => "trace",
            AgentLogLevel::Debug => "debug",
            AgentLogLevel::Info => "info",
            AgentLogLevel::Warning => "warning",
            AgentLogLevel::Error => "error",
        }
    }
}

impl FromStr for AgentLogLevel {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(AgentLogLevel::Trace),
            "debug" => Ok(AgentLogLevel::Debug),
            "info" => Ok(AgentLogLevel::Info),
            "warning" => Ok(AgentLogLevel::Warning),
            "error" => Ok(AgentLogLevel::Error),
            other => Err(invalid_choice(
                "apm-log-level",
                other,
                &["trace", "debug", "info", "warning", "error"],
            )),
        }
    }
}

impl fmt::Display for AgentLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid_choice(option: &str, value: &str, choices: &[&str]) -> ProvisionError {
    ProvisionError::InvalidOption {
        option: option.to_string(),
        reason: format!("'{}' is not one of: {}.", value, choices.join(", ")),
    }
}

/// Per-service overrides of the stack-wide settings.
#[derive(Clone, Debug, Default)]
pub struct ServiceOverrides {
    /// Stack version for this service only.
    pub version: Option<String>,

    /// Build candidate id for this service only.
    pub bc: Option<String>,

    pub oss: bool,
    pub release: bool,
    pub snapshot: bool,
    pub ubi8: bool,

    /// External port override.
    pub port: Option<u16>,

    /// Extra `KEY=value` environment entries, appended after the service's own.
    pub env_vars: Vec<String>,
}

/// APM server settings.
#[derive(Clone, Debug)]
pub struct ApmServerOptions {
    /// Build from a git repository (`repo[@branch]`) instead of using a published image.
    pub build: Option<String>,
    pub ilm_disable: bool,
    pub output: ApmServerOutput,
    pub output_file: String,
    pub pipeline_path: Option<String>,
    pub enable_pipeline: bool,
    pub self_instrument: bool,
    pub profile: bool,
    pub elasticsearch_urls: Vec<String>,
    pub elasticsearch_username: Option<String>,
    pub elasticsearch_password: Option<String>,
    pub queue: QueueKind,
    pub queue_file_size: Option<String>,
    pub queue_file_page_size: Option<String>,
    pub queue_write_buffer_size: Option<String>,
    pub queue_write_flush_events: Option<String>,
    pub queue_write_flush_timeout: Option<String>,
    pub api_key_auth: bool,
    pub secret_token: Option<String>,
    pub jaeger: bool,
    pub enable_tls: bool,
    pub agent_config_poll: String,
    pub dashboards: bool,
    pub acm_disable: bool,
    pub kibana_url: String,
    pub index_refresh_interval: String,
    pub monitor_port: u16,

    /// Arbitrary `key=value` settings passed through with `-E`.
    pub opts: Vec<String>,
}

impl Default for ApmServerOptions {
    fn default() -> Self {
        Self {
            build: None,
            ilm_disable: false,
            output: ApmServerOutput::default(),
            output_file: "/dev/null".to_string(),
            pipeline_path: None,
            enable_pipeline: true,
            self_instrument: true,
            profile: true,
            elasticsearch_urls: Vec::new(),
            elasticsearch_username: None,
            elasticsearch_password: None,
            queue: QueueKind::default(),
            queue_file_size: None,
            queue_file_page_size: None,
            queue_write_buffer_size: None,
            queue_write_flush_events: None,
            queue_write_flush_timeout: None,
            api_key_auth: false,
            secret_token: None,
            jaeger: true,
            enable_tls: false,
            agent_config_poll: "30s".to_string(),
            dashboards: true,
            acm_disable: false,
            kibana_url: "kibana:5601".to_string(),
            index_refresh_interval: "1ms".to_string(),
            monitor_port: 6060,
            opts: Vec::new(),
        }
    }
}

/// Elasticsearch settings.
#[derive(Clone, Debug)]
pub struct ElasticsearchOptions {
    /// Data directory under `/usr/share/elasticsearch/data/`. Defaults to the stack version; an empty string is allowed.
    pub data_dir: Option<String>,
    pub heap: String,
    pub xpack_audit: bool,

    /// Extra `ES_JAVA_OPTS` entries keyed by option name. Later entries with the same key replace earlier ones.
    pub java_opts: BTreeMap<String, String>,
}

impl Default for ElasticsearchOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            heap: "1g".to_string(),
            xpack_audit: false,
            java_opts: BTreeMap::new(),
        }
    }
}

/// Kibana settings.
#[derive(Clone, Debug, Default)]
pub struct KibanaOptions {
    pub elasticsearch_urls: Vec<String>,
    pub no_apm_servicemaps: bool,
}

/// Settings for one beat.
#[derive(Clone, Debug, Default)]
pub struct BeatOptions {
    pub elasticsearch_urls: Vec<String>,
    pub elasticsearch_username: Option<String>,
    pub elasticsearch_password: Option<String>,
    pub output: BeatOutput,
}

/// Settings for one opbeans sample application.
#[derive(Clone, Debug)]
pub struct OpbeansServiceOptions {
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub service_environment: Option<String>,
    pub agent_branch: Option<String>,
    pub agent_repo: Option<String>,
    pub agent_local_repo: Option<String>,
    pub branch: Option<String>,
    pub repo: Option<String>,
    pub image: Option<String>,

    /// Tag of the base image (or, for .NET, the agent version).
    pub version: Option<String>,

    /// Transaction sample rate in percent, `1..=100`.
    pub sample_rate: u8,

    /// Disable inferred spans (Java only).
    pub no_infer_spans: bool,

    /// Exclude this service from the load generator.
    pub no_loadgen: bool,

    /// Requests per minute the load generator sends to this service.
    pub loadgen_rpm: u32,
}

impl Default for OpbeansServiceOptions {
    fn default() -> Self {
        Self {
            service_name: None,
            service_version: None,
            service_environment: None,
            agent_branch: None,
            agent_repo: None,
            agent_local_repo: None,
            branch: None,
            repo: None,
            image: None,
            version: None,
            sample_rate: 10,
            no_infer_spans: false,
            no_loadgen: false,
            loadgen_rpm: 100,
        }
    }
}

/// Settings shared by every opbeans service.
#[derive(Clone, Debug)]
pub struct OpbeansOptions {
    pub apm_js_server_url: String,
    pub dt_probability: f64,
    pub elasticsearch_urls: Vec<String>,
    pub rum_backend_service: String,
    pub rum_backend_port: u16,
    pub loadgen_no_ws: bool,
    pub disable_load_generator: bool,

    /// Per-service settings, keyed by service name.
    pub services: BTreeMap<String, OpbeansServiceOptions>,
}

impl Default for OpbeansOptions {
    fn default() -> Self {
        Self {
            apm_js_server_url: DEFAULT_APM_JS_SERVER_URL.to_string(),
            dt_probability: 0.5,
            elasticsearch_urls: Vec::new(),
            rum_backend_service: "opbeans-node".to_string(),
            rum_backend_port: 3000,
            loadgen_no_ws: false,
            disable_load_generator: false,
            services: BTreeMap::new(),
        }
    }
}

impl OpbeansOptions {
    /// Returns the settings for `service`, falling back to the defaults.
    pub fn service(&self, service: &str) -> OpbeansServiceOptions {
        self.services.get(service).cloned().unwrap_or_default()
    }
}

/// Settings for the agent test applications.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    pub rum_agent_branch: String,
    pub rum_agent_repo: String,
    pub go_agent_version: String,
    pub go_agent_repo: String,
    pub nodejs_agent_package: String,
    pub php_agent_version: String,
    pub php_agent_release: String,
    pub php_agent_repo: String,
    pub python_agent_package: String,
    pub ruby_agent_version: String,
    pub ruby_agent_version_state: String,
    pub ruby_agent_repo: String,
    pub ruby_version: String,
    pub java_agent_version: String,
    pub java_agent_release: String,
    pub java_agent_repo: String,
    pub java_m2_cache: bool,
    pub dotnet_agent_version: String,
    pub dotnet_agent_release: String,
    pub dotnet_agent_repo: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            rum_agent_branch: "master".to_string(),
            rum_agent_repo: "elastic/apm-agent-rum-js".to_string(),
            go_agent_version: "master".to_string(),
            go_agent_repo: "elastic/apm-agent-go".to_string(),
            nodejs_agent_package: "elastic-apm-node".to_string(),
            php_agent_version: "master".to_string(),
            php_agent_release: String::new(),
            php_agent_repo: "elastic/apm-agent-php".to_string(),
            python_agent_package: "elastic-apm".to_string(),
            ruby_agent_version: "latest".to_string(),
            ruby_agent_version_state: "release".to_string(),
            ruby_agent_repo: "elastic/apm-agent-ruby".to_string(),
            ruby_version: "latest".to_string(),
            java_agent_version: "master".to_string(),
            java_agent_release: String::new(),
            java_agent_repo: "elastic/apm-agent-java".to_string(),
            java_m2_cache: false,
            dotnet_agent_version: "master".to_string(),
            dotnet_agent_release: String::new(),
            dotnet_agent_repo: "elastic/apm-agent-dotnet".to_string(),
        }
    }
}

/// Everything a composition run needs to know about the user's intent.
#[derive(Clone, Debug)]
pub struct ProvisionOptions {
    /// Stack version after alias resolution.
    pub stack_version: String,

    /// Stack-wide build candidate id (`latest` or an explicit id).
    pub bc: Option<String>,
    pub release: bool,
    pub snapshot: bool,
    pub oss: bool,
    pub ubi8: bool,

    /// Explicit `--with-<svc>` (`true`) and `--no-<svc>` (`false`) choices.
    pub explicit: BTreeMap<String, bool>,

    /// `--all`.
    pub run_all: bool,

    /// `--all-opbeans`.
    pub run_all_opbeans: bool,

    /// `--dyno`: add the fault-injection proxy layer.
    pub dyno: bool,

    pub xpack_secure: bool,
    pub no_verify_server_cert: bool,
    pub apm_server_url: String,
    pub apm_api_key: Option<String>,
    pub apm_log_level: Option<AgentLogLevel>,
    pub apm_server_pprof_url: String,
    pub logstash_elasticsearch_urls: Vec<String>,

    pub overrides: BTreeMap<String, ServiceOverrides>,
    pub apm_server: ApmServerOptions,
    pub elasticsearch: ElasticsearchOptions,
    pub kibana: KibanaOptions,
    pub beats: BTreeMap<String, BeatOptions>,
    pub opbeans: OpbeansOptions,
    pub agents: AgentOptions,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_VERSION)
    }
}

impl ProvisionOptions {
    /// Creates options for the given (possibly aliased) stack version, with every other setting at its default.
    pub fn new(stack_version: &str) -> Self {
        Self {
            stack_version: resolve_stack_version(stack_version),
            bc: None,
            release: false,
            snapshot: false,
            oss: false,
            ubi8: false,
            explicit: BTreeMap::new(),
            run_all: false,
            run_all_opbeans: false,
            dyno: false,
            xpack_secure: true,
            no_verify_server_cert: false,
            apm_server_url: DEFAULT_APM_SERVER_URL.to_string(),
            apm_api_key: None,
            apm_log_level: None,
            apm_server_pprof_url: "apm-server:6060".to_string(),
            logstash_elasticsearch_urls: Vec::new(),
            overrides: BTreeMap::new(),
            apm_server: ApmServerOptions::default(),
            elasticsearch: ElasticsearchOptions::default(),
            kibana: KibanaOptions::default(),
            beats: BTreeMap::new(),
            opbeans: OpbeansOptions::default(),
            agents: AgentOptions::default(),
        }
    }

    /// Marks `service` as explicitly enabled or disabled.
    pub fn with_service(mut self, service: &str, enabled: bool) -> Self {
        self.explicit.insert(service.to_string(), enabled);
        self
    }

    /// Returns the explicit choice for `service`, if one was made.
    pub fn explicit_choice(&self, service: &str) -> Option<bool> {
        self.explicit.get(service).copied()
    }

    /// Returns the overrides for `service`, if any were given.
    pub fn overrides_for(&self, service: &str) -> Option<&ServiceOverrides> {
        self.overrides.get(service)
    }

    /// Returns the settings for `beat`, falling back to the defaults.
    pub fn beat(&self, beat: &str) -> BeatOptions {
        self.beats.get(beat).cloned().unwrap_or_default()
    }

    /// Value of `ELASTIC_APM_VERIFY_SERVER_CERT`.
    pub fn verify_server_cert(&self) -> &'static str {
        if self.no_verify_server_cert {
            "false"
        } else {
            "true"
        }
    }

    /// Validates option combinations that no single flag parser can check.
    ///
    /// # Errors
    ///
    /// If an opbeans sample rate is outside `1..=100`, or the distributed-tracing probability is outside `[0, 1]`,
    /// `InvalidOption` is returned.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        for (service, opts) in &self.opbeans.services {
            if !(1..=100).contains(&opts.sample_rate) {
                return Err(ProvisionError::InvalidOption {
                    option: format!("{}-sample-rate", service),
                    reason: format!("{} is outside 1..=100.", opts.sample_rate),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.opbeans.dt_probability) {
            return Err(ProvisionError::InvalidOption {
                option: "opbeans-dt-probability".to_string(),
                reason: format!("{} is outside [0, 1].", self.opbeans.dt_probability),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_resolves_aliases() {
        assert_eq!(ProvisionOptions::new("master").stack_version, "8.0.0");
        assert_eq!(ProvisionOptions::default().stack_version, "8.0");
    }

    #[test]
    fn parse_choices() {
        assert_eq!("yaml".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert_eq!("kafka".parse::<ApmServerOutput>().unwrap(), ApmServerOutput::Kafka);
        assert_eq!("WARNING".parse::<AgentLogLevel>().unwrap(), AgentLogLevel::Warning);

        let err = "xml".parse::<OutputFormat>().unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidOption { ref option, .. } if option == "output-format"));
    }

    #[test]
    fn validate_rejects_out_of_range_sample_rate() {
        let mut options = ProvisionOptions::default();
        options.opbeans.services.insert(
            "opbeans-go".to_string(),
            OpbeansServiceOptions {
                sample_rate: 0,
                ..Default::default()
            },
        );

        assert!(matches!(
            options.validate(),
            Err(ProvisionError::InvalidOption { ref option, .. }) if option == "opbeans-go-sample-rate"
        ));
    }

    #[test]
    fn defaults_validate() {
        assert!(ProvisionOptions::default().validate().is_ok());
    }
}
