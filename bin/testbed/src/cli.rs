use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use testbed_core::{options::OutputFormat, version::DEFAULT_STACK_VERSION};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about = "Provisions a local observability stack, its sample applications and a fault-injection layer.")]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Settings file (YAML).
    #[arg(global = true, long)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Compose the environment and start it.
    Start(StartArgs),

    /// Compose the environment and write the document without starting anything.
    Compose(ComposeArgs),

    /// List running containers that belong to a composed stack.
    Status,

    /// Stop the composed environment.
    Stop,

    /// List every service that can be composed.
    #[command(name = "list-services")]
    ListServices,

    /// Inspect and drive the fault-injection proxies.
    #[command(subcommand)]
    Proxy(ProxyAction),
}

/// Options shared by every subcommand that composes an environment.
///
/// Per-service options (`--with-<svc>`, `--no-<svc>`, `--<svc>-version`, ...) are generated from the catalogue and
/// are not part of this struct.
#[derive(Args, Clone, Debug)]
pub struct ComposeArgs {
    /// Stack version, or an alias such as `7.6` or `master`.
    #[arg(default_value = DEFAULT_STACK_VERSION)]
    pub stack_version: String,

    /// Build candidate id for every stack service, or `latest`.
    #[arg(long)]
    pub bc: Option<String>,

    /// Use released images instead of snapshots.
    #[arg(long)]
    pub release: bool,

    /// Use snapshot images, even with a build candidate.
    #[arg(long)]
    pub snapshot: bool,

    /// Use the OSS distribution of every stack service.
    #[arg(long)]
    pub oss: bool,

    /// Use UBI8-based images for every stack service.
    #[arg(long)]
    pub ubi8: bool,

    /// Start every service.
    #[arg(long = "all")]
    pub run_all: bool,

    /// Start every opbeans service.
    #[arg(long = "all-opbeans")]
    pub run_all_opbeans: bool,

    /// Put the opbeans services and their data stores behind the fault-injection proxy.
    #[arg(long)]
    pub dyno: bool,

    /// Disable x-pack security.
    #[arg(long = "no-xpack-secure")]
    pub no_xpack_secure: bool,

    /// Tell agents not to verify the APM server certificate.
    #[arg(long)]
    pub no_verify_server_cert: bool,

    /// URL agents use to reach the APM server.
    #[arg(long)]
    pub apm_server_url: Option<String>,

    /// API key agents present to the APM server.
    #[arg(long)]
    pub apm_api_key: Option<String>,

    /// Agent log level.
    #[arg(long)]
    pub apm_log_level: Option<String>,

    /// Address of the APM server profiling endpoint.
    #[arg(long)]
    pub apm_server_pprof_url: Option<String>,

    /// Output format of the composition document.
    #[arg(long, default_value = "json", value_parser = parse_output_format)]
    pub output_format: OutputFormat,

    /// Where to write the composition document, or `-` for standard output.
    #[arg(long)]
    pub docker_compose_path: Option<PathBuf>,

    /// JSON files of additional service definitions to merge into the document.
    #[arg(long)]
    pub with_services: Vec<PathBuf>,

    /// Do not start the opbeans load generator.
    #[arg(long = "no-opbeans-load-generator")]
    pub no_opbeans_load_generator: bool,

    /// Elasticsearch URLs logstash ships to.
    #[arg(long = "logstash-elasticsearch-url")]
    pub logstash_elasticsearch_urls: Vec<String>,

    #[command(flatten)]
    pub apm_server: ApmServerArgs,

    #[command(flatten)]
    pub elasticsearch: ElasticsearchArgs,

    #[command(flatten)]
    pub kibana: KibanaArgs,

    #[command(flatten)]
    pub opbeans: OpbeansArgs,

    #[command(flatten)]
    pub agents: AgentArgs,
}

fn parse_output_format(s: &str) -> Result<OutputFormat, String> {
    s.parse().map_err(|e| format!("{}", e))
}

#[derive(Args, Clone, Debug)]
pub struct ApmServerArgs {
    /// Build the APM server from `repo[@branch]` instead of using a published image.
    #[arg(long = "apm-server-build")]
    pub build: Option<String>,

    /// Disable index lifecycle management.
    #[arg(long = "apm-server-ilm-disable")]
    pub ilm_disable: bool,

    /// Where the APM server ships events: elasticsearch, file, kafka or logstash.
    #[arg(long = "apm-server-output")]
    pub output: Option<String>,

    /// File events are written to with the file output.
    #[arg(long = "apm-server-output-file")]
    pub output_file: Option<String>,

    /// Ingest pipeline definition file.
    #[arg(long = "apm-server-pipeline-path")]
    pub pipeline_path: Option<String>,

    /// Do not use the ingest pipeline.
    #[arg(long = "no-apm-server-pipeline")]
    pub no_pipeline: bool,

    /// Do not instrument the APM server itself.
    #[arg(long = "no-apm-server-self-instrument")]
    pub no_self_instrument: bool,

    /// Do not profile the APM server.
    #[arg(long = "no-apm-server-profile")]
    pub no_profile: bool,

    /// Elasticsearch URLs the APM server ships to.
    #[arg(id = "apm_server_elasticsearch_urls", long = "apm-server-elasticsearch-url")]
    pub elasticsearch_urls: Vec<String>,

    #[arg(long = "apm-server-elasticsearch-username")]
    pub elasticsearch_username: Option<String>,

    #[arg(long = "apm-server-elasticsearch-password")]
    pub elasticsearch_password: Option<String>,

    /// Internal queue: mem or file.
    #[arg(long = "apm-server-queue")]
    pub queue: Option<String>,

    #[arg(long = "apm-server-queue-file-size")]
    pub queue_file_size: Option<String>,

    #[arg(long = "apm-server-queue-file-page-size")]
    pub queue_file_page_size: Option<String>,

    #[arg(long = "apm-server-queue-write-buffer-size")]
    pub queue_write_buffer_size: Option<String>,

    #[arg(long = "apm-server-queue-write-flush-events")]
    pub queue_write_flush_events: Option<String>,

    #[arg(long = "apm-server-queue-write-flush-timeout")]
    pub queue_write_flush_timeout: Option<String>,

    /// Require API keys.
    #[arg(long = "apm-server-api-key-auth")]
    pub api_key_auth: bool,

    #[arg(long = "apm-server-secret-token")]
    pub secret_token: Option<String>,

    /// Disable the Jaeger endpoints.
    #[arg(long = "no-apm-server-jaeger")]
    pub no_jaeger: bool,

    /// Serve over TLS. Agents are pointed at the `https` URL.
    #[arg(long = "apm-server-enable-tls")]
    pub enable_tls: bool,

    #[arg(long = "apm-server-agent-config-poll")]
    pub agent_config_poll: Option<String>,

    /// Do not set up the dashboards.
    #[arg(long = "no-apm-server-dashboards")]
    pub no_dashboards: bool,

    /// Disable agent central configuration.
    #[arg(long = "apm-server-acm-disable")]
    pub acm_disable: bool,

    #[arg(long = "apm-server-kibana-url")]
    pub kibana_url: Option<String>,

    #[arg(long = "apm-server-index-refresh-interval")]
    pub index_refresh_interval: Option<String>,

    /// Port of the APM server debug endpoint.
    #[arg(long = "apm-server-monitor-port")]
    pub monitor_port: Option<u16>,

    /// Arbitrary `key=value` settings.
    #[arg(long = "apm-server-opt")]
    pub opts: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ElasticsearchArgs {
    /// Data directory, relative to the Elasticsearch data path.
    #[arg(long = "elasticsearch-data-dir")]
    pub data_dir: Option<String>,

    #[arg(long = "elasticsearch-heap")]
    pub heap: Option<String>,

    #[arg(long = "elasticsearch-xpack-audit")]
    pub xpack_audit: bool,

    /// Extra `ES_JAVA_OPTS` entries, as `key=value`.
    #[arg(long = "elasticsearch-java-opts", allow_hyphen_values = true)]
    pub java_opts: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct KibanaArgs {
    #[arg(id = "kibana_elasticsearch_urls", long = "kibana-elasticsearch-url")]
    pub elasticsearch_urls: Vec<String>,

    #[arg(long = "no-kibana-apm-servicemaps")]
    pub no_apm_servicemaps: bool,
}

#[derive(Args, Clone, Debug)]
pub struct OpbeansArgs {
    #[arg(long = "opbeans-apm-js-server-url")]
    pub apm_js_server_url: Option<String>,

    /// Distributed tracing probability, in `[0, 1]`.
    #[arg(long = "opbeans-dt-probability")]
    pub dt_probability: Option<f64>,

    #[arg(id = "opbeans_elasticsearch_urls", long = "opbeans-elasticsearch-url")]
    pub elasticsearch_urls: Vec<String>,

    /// Backend the browser front-end talks to.
    #[arg(long = "opbeans-rum-backend-service")]
    pub rum_backend_service: Option<String>,

    #[arg(long = "opbeans-rum-backend-port")]
    pub rum_backend_port: Option<u16>,

    /// Drive the opbeans services without websockets.
    #[arg(long = "loadgen-no-ws")]
    pub loadgen_no_ws: bool,
}

#[derive(Args, Clone, Debug)]
pub struct AgentArgs {
    #[arg(long = "rum-agent-branch")]
    pub rum_agent_branch: Option<String>,

    #[arg(long = "rum-agent-repo")]
    pub rum_agent_repo: Option<String>,

    #[arg(long = "go-agent-version")]
    pub go_agent_version: Option<String>,

    #[arg(long = "go-agent-repo")]
    pub go_agent_repo: Option<String>,

    #[arg(long = "nodejs-agent-package")]
    pub nodejs_agent_package: Option<String>,

    #[arg(long = "php-agent-version")]
    pub php_agent_version: Option<String>,

    #[arg(long = "php-agent-release")]
    pub php_agent_release: Option<String>,

    #[arg(long = "php-agent-repo")]
    pub php_agent_repo: Option<String>,

    #[arg(long = "python-agent-package")]
    pub python_agent_package: Option<String>,

    #[arg(long = "ruby-agent-version")]
    pub ruby_agent_version: Option<String>,

    #[arg(long = "ruby-agent-version-state")]
    pub ruby_agent_version_state: Option<String>,

    #[arg(long = "ruby-agent-repo")]
    pub ruby_agent_repo: Option<String>,

    #[arg(long = "ruby-version")]
    pub ruby_version: Option<String>,

    #[arg(long = "java-agent-version")]
    pub java_agent_version: Option<String>,

    #[arg(long = "java-agent-release")]
    pub java_agent_release: Option<String>,

    #[arg(long = "java-agent-repo")]
    pub java_agent_repo: Option<String>,

    /// Mount the local maven cache into the Java builds.
    #[arg(long = "java-m2-cache")]
    pub java_m2_cache: bool,

    #[arg(long = "dotnet-agent-version")]
    pub dotnet_agent_version: Option<String>,

    #[arg(long = "dotnet-agent-release")]
    pub dotnet_agent_release: Option<String>,

    #[arg(long = "dotnet-agent-repo")]
    pub dotnet_agent_repo: Option<String>,
}

/// `start` options on top of the composition options.
#[derive(Args, Clone, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub compose: ComposeArgs,

    /// Do not download build candidate images or pull published ones.
    #[arg(long)]
    pub skip_download: bool,

    /// Do not pull base images when building.
    #[arg(long)]
    pub skip_pull: bool,

    /// Build without the cache.
    #[arg(long)]
    pub force_build: bool,

    /// Build images in parallel.
    #[arg(long)]
    pub build_parallel: bool,

    /// Remove containers of services that are no longer composed.
    #[arg(long)]
    pub remove_orphans: bool,
}

#[derive(Subcommand)]
pub enum ProxyAction {
    /// List the proxies.
    List {
        /// Include each proxy's listen address.
        #[arg(long)]
        full: bool,
    },

    /// Show a proxy and its toxics.
    App {
        name: String,

        /// Report toxics as slider values keyed by toxic code.
        #[arg(long)]
        denorm: bool,
    },

    /// Enable a proxy.
    Enable { name: String },

    /// Disable a proxy.
    Disable { name: String },

    /// Apply a toxic at a slider position between 0 and 100.
    Slide {
        proxy: String,
        code: String,
        value: i64,
    },
}
