use testbed_core::options::ProvisionOptions;
use testbed_error::{GenericError, ProvisionError};

use crate::cli::{AgentArgs, ApmServerArgs, ComposeArgs, ElasticsearchArgs, KibanaArgs, OpbeansArgs};

impl ComposeArgs {
    /// Builds composition options from the static command line options.
    ///
    /// Per-service options are applied separately, see [`crate::services::apply`].
    ///
    /// # Errors
    ///
    /// If an option value cannot be parsed, an error is returned.
    pub fn to_options(&self) -> Result<ProvisionOptions, GenericError> {
        let mut options = ProvisionOptions::new(&self.stack_version);
        options.bc = self.bc.clone();
        options.release = self.release;
        options.snapshot = self.snapshot;
        options.oss = self.oss;
        options.ubi8 = self.ubi8;
        options.run_all = self.run_all;
        options.run_all_opbeans = self.run_all_opbeans;
        options.dyno = self.dyno;
        options.xpack_secure = !self.no_xpack_secure;
        options.no_verify_server_cert = self.no_verify_server_cert;
        options.apm_api_key = self.apm_api_key.clone();
        options.logstash_elasticsearch_urls = self.logstash_elasticsearch_urls.clone();
        set(&mut options.apm_server_url, &self.apm_server_url);
        set(&mut options.apm_server_pprof_url, &self.apm_server_pprof_url);
        if let Some(level) = &self.apm_log_level {
            options.apm_log_level = Some(level.parse()?);
        }

        self.apm_server.apply(&mut options)?;
        self.elasticsearch.apply(&mut options)?;
        self.kibana.apply(&mut options);
        self.opbeans.apply(&mut options);
        self.agents.apply(&mut options);
        options.opbeans.disable_load_generator = self.no_opbeans_load_generator;

        if options.apm_server.enable_tls {
            options.apm_server_url = options.apm_server_url.replacen("http:", "https:", 1);
            options.opbeans.apm_js_server_url = options.apm_server_url.clone();
        }

        Ok(options)
    }
}

impl ApmServerArgs {
    fn apply(&self, options: &mut ProvisionOptions) -> Result<(), GenericError> {
        let apm = &mut options.apm_server;
        apm.build = self.build.clone();
        apm.ilm_disable = self.ilm_disable;
        if let Some(output) = &self.output {
            apm.output = output.parse()?;
        }
        set(&mut apm.output_file, &self.output_file);
        apm.pipeline_path = self.pipeline_path.clone();
        apm.enable_pipeline = !self.no_pipeline;
        apm.self_instrument = !self.no_self_instrument;
        apm.profile = !self.no_profile;
        apm.elasticsearch_urls = self.elasticsearch_urls.clone();
        apm.elasticsearch_username = self.elasticsearch_username.clone();
        apm.elasticsearch_password = self.elasticsearch_password.clone();
        if let Some(queue) = &self.queue {
            apm.queue = queue.parse()?;
        }
        apm.queue_file_size = self.queue_file_size.clone();
        apm.queue_file_page_size = self.queue_file_page_size.clone();
        apm.queue_write_buffer_size = self.queue_write_buffer_size.clone();
        apm.queue_write_flush_events = self.queue_write_flush_events.clone();
        apm.queue_write_flush_timeout = self.queue_write_flush_timeout.clone();
        apm.api_key_auth = self.api_key_auth;
        apm.secret_token = self.secret_token.clone();
        apm.jaeger = !self.no_jaeger;
        apm.enable_tls = self.enable_tls;
        set(&mut apm.agent_config_poll, &self.agent_config_poll);
        apm.dashboards = !self.no_dashboards;
        apm.acm_disable = self.acm_disable;
        set(&mut apm.kibana_url, &self.kibana_url);
        set(&mut apm.index_refresh_interval, &self.index_refresh_interval);
        if let Some(port) = self.monitor_port {
            apm.monitor_port = port;
        }
        apm.opts = self.opts.clone();
        Ok(())
    }
}

impl ElasticsearchArgs {
    fn apply(&self, options: &mut ProvisionOptions) -> Result<(), ProvisionError> {
        let es = &mut options.elasticsearch;
        es.data_dir = self.data_dir.clone();
        set(&mut es.heap, &self.heap);
        es.xpack_audit = self.xpack_audit;

        // `Dfoo=bar` is stored as `Dfoo` => `=bar` and rendered back as `-Dfoo=bar`.
        for opt in &self.java_opts {
            let opt = opt.trim_start_matches('-');
            if opt.is_empty() {
                return Err(ProvisionError::InvalidOption {
                    option: "elasticsearch-java-opts".to_string(),
                    reason: "empty option".to_string(),
                });
            }
            let (key, value) = match opt.split_once('=') {
                Some((key, value)) => (key, format!("={}", value)),
                None => (opt, String::new()),
            };
            es.java_opts.insert(key.to_string(), value);
        }
        Ok(())
    }
}

impl KibanaArgs {
    fn apply(&self, options: &mut ProvisionOptions) {
        options.kibana.elasticsearch_urls = self.elasticsearch_urls.clone();
        options.kibana.no_apm_servicemaps = self.no_apm_servicemaps;
    }
}

impl OpbeansArgs {
    fn apply(&self, options: &mut ProvisionOptions) {
        let opbeans = &mut options.opbeans;
        set(&mut opbeans.apm_js_server_url, &self.apm_js_server_url);
        if let Some(probability) = self.dt_probability {
            opbeans.dt_probability = probability;
        }
        opbeans.elasticsearch_urls = self.elasticsearch_urls.clone();
        set(&mut opbeans.rum_backend_service, &self.rum_backend_service);
        if let Some(port) = self.rum_backend_port {
            opbeans.rum_backend_port = port;
        }
        opbeans.loadgen_no_ws = self.loadgen_no_ws;
    }
}

impl AgentArgs {
    fn apply(&self, options: &mut ProvisionOptions) {
        let agents = &mut options.agents;
        set(&mut agents.rum_agent_branch, &self.rum_agent_branch);
        set(&mut agents.rum_agent_repo, &self.rum_agent_repo);
        set(&mut agents.go_agent_version, &self.go_agent_version);
        set(&mut agents.go_agent_repo, &self.go_agent_repo);
        set(&mut agents.nodejs_agent_package, &self.nodejs_agent_package);
        set(&mut agents.php_agent_version, &self.php_agent_version);
        set(&mut agents.php_agent_release, &self.php_agent_release);
        set(&mut agents.php_agent_repo, &self.php_agent_repo);
        set(&mut agents.python_agent_package, &self.python_agent_package);
        set(&mut agents.ruby_agent_version, &self.ruby_agent_version);
        set(&mut agents.ruby_agent_version_state, &self.ruby_agent_version_state);
        set(&mut agents.ruby_agent_repo, &self.ruby_agent_repo);
        set(&mut agents.ruby_version, &self.ruby_version);
        set(&mut agents.java_agent_version, &self.java_agent_version);
        set(&mut agents.java_agent_release, &self.java_agent_release);
        set(&mut agents.java_agent_repo, &self.java_agent_repo);
        agents.java_m2_cache = self.java_m2_cache;
        set(&mut agents.dotnet_agent_version, &self.dotnet_agent_version);
        set(&mut agents.dotnet_agent_release, &self.dotnet_agent_release);
        set(&mut agents.dotnet_agent_repo, &self.dotnet_agent_repo);
    }
}

fn set(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        target.clone_from(value);
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use testbed_core::options::{ApmServerOutput, OutputFormat};

    use crate::cli::{Action, Cli};

    fn compose_options(args: &[&str]) -> Result<testbed_core::options::ProvisionOptions, testbed_error::GenericError> {
        let cli = Cli::try_parse_from(["testbed", "compose"].iter().chain(args)).unwrap();
        match cli.action {
            Action::Compose(args) => args.to_options(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn defaults() {
        let options = compose_options(&[]).unwrap();
        assert_eq!(options.stack_version, "8.0");
        assert!(options.xpack_secure);
        assert!(options.apm_server.enable_pipeline);
        assert_eq!(options.elasticsearch.heap, "1g");
        assert_eq!(options.opbeans.rum_backend_port, 3000);
    }

    #[test]
    fn aliases_and_flags() {
        let options = compose_options(&[
            "master",
            "--no-xpack-secure",
            "--apm-server-output",
            "kafka",
            "--no-apm-server-pipeline",
            "--elasticsearch-heap",
            "4g",
            "--opbeans-dt-probability",
            "0.1",
        ])
        .unwrap();

        assert_eq!(options.stack_version, "8.0.0");
        assert!(!options.xpack_secure);
        assert_eq!(options.apm_server.output, ApmServerOutput::Kafka);
        assert!(!options.apm_server.enable_pipeline);
        assert_eq!(options.elasticsearch.heap, "4g");
        assert_eq!(options.opbeans.dt_probability, 0.1);
    }

    #[test]
    fn java_opts_keep_their_value_separator() {
        let options = compose_options(&[
            "--elasticsearch-java-opts",
            "-Dfoo=bar",
            "--elasticsearch-java-opts",
            "XX:+UseG1GC",
        ])
        .unwrap();

        assert_eq!(options.elasticsearch.java_opts["Dfoo"], "=bar");
        assert_eq!(options.elasticsearch.java_opts["XX:+UseG1GC"], "");
    }

    #[test]
    fn tls_switches_agent_urls() {
        let options = compose_options(&["--apm-server-enable-tls"]).unwrap();
        assert_eq!(options.apm_server_url, "https://apm-server:8200");
        assert_eq!(options.opbeans.apm_js_server_url, "https://apm-server:8200");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(compose_options(&["--apm-server-queue", "disk"]).is_err());
        assert!(compose_options(&["--apm-log-level", "loud"]).is_err());
        assert!(Cli::try_parse_from(["testbed", "compose", "--output-format", "xml"]).is_err());

        let cli = Cli::try_parse_from(["testbed", "compose", "--output-format", "yaml"]).unwrap();
        assert!(matches!(cli.action, Action::Compose(ref args) if args.output_format == OutputFormat::Yaml));
    }
}
