//! Core stack content: APM server, Elasticsearch and Kibana.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use testbed_error::ProvisionError;

use super::{
    outputs::{add_elasticsearch_output, add_kafka_output, add_logstash_output, monitoring_prefix, ElasticsearchOutput, Settings},
    ServiceContext,
};
use crate::{
    fragment::{publish_port, Build, BuildArgs, Command, Environment, Healthcheck, ServiceFragment, Slot, Ulimit},
    options::{ApmServerOutput, QueueKind, DEFAULT_ELASTICSEARCH_URL},
};

const APM_SERVER_PORT: u16 = 8200;
const APM_MONITOR_PORT: u16 = 6060;
const JAEGER_HTTP_PORT: u16 = 14268;
const JAEGER_GRPC_PORT: u16 = 14250;
const APM_SERVER_USER: &str = "apm_server_user";
const APM_SERVER_REPO: &str = "https://github.com/elastic/apm-server.git";
const ELASTICSEARCH_PORT: u16 = 9200;
const KIBANA_PORT: u16 = 5601;

fn apm_server_settings(ctx: &ServiceContext<'_>) -> Result<Settings, ProvisionError> {
    let d = ctx.descriptor;
    let opts = &ctx.options.apm_server;
    let secure = ctx.options.xpack_secure;
    let mut settings = Settings::new();

    if d.at_least("6.5") {
        settings.push("apm-server.rum.enabled", "true");
        settings.push("apm-server.rum.event_rate.limit", "1000");
        if d.lower_than("7.0") {
            settings.push("apm-server.frontend.rate_limit", "100000");
        }
    } else {
        settings.push("apm-server.frontend.enabled", "true");
        settings.push("apm-server.frontend.rate_limit", "100000");
    }

    settings.push("apm-server.host", format!("0.0.0.0:{}", APM_SERVER_PORT));
    settings.push("apm-server.read_timeout", "1m");
    settings.push("apm-server.shutdown_timeout", "2m");
    settings.push("apm-server.write_timeout", "1m");
    settings.push("logging.json", "true");
    settings.push("logging.metrics.enabled", "false");
    settings.push("setup.template.settings.index.number_of_replicas", "0");
    settings.push("setup.template.settings.index.number_of_shards", "1");
    settings.push(
        "setup.template.settings.index.refresh_interval",
        opts.index_refresh_interval.as_str(),
    );
    let monitoring = monitoring_prefix(d.version());
    settings.push(format!("{}.elasticsearch", monitoring), "true");
    settings.push(format!("{}.enabled", monitoring), "true");

    if opts.self_instrument {
        settings.push("apm-server.instrumentation.enabled", "true");
        if d.at_least("7.6") && opts.profile {
            settings.push("apm-server.instrumentation.profiling.cpu.enabled", "true");
            settings.push("apm-server.instrumentation.profiling.heap.enabled", "true");
        }
    }

    if opts.ilm_disable {
        settings.push("apm-server.ilm.enabled", "false");
    } else if d.at_least("7.2") && d.lower_than("7.3") && !d.oss() {
        settings.push("apm-server.ilm.enabled", "true");
    }

    if opts.acm_disable {
        settings.push("apm-server.kibana.enabled", "false");
    } else if d.at_least("7.3") {
        settings.push("apm-server.kibana.enabled", "true");
        settings.push("apm-server.kibana.host", opts.kibana_url.as_str());
        settings.push("apm-server.agent.config.cache.expiration", opts.agent_config_poll.as_str());
        if secure {
            let username = opts.elasticsearch_username.as_deref().unwrap_or(APM_SERVER_USER);
            let password = opts.elasticsearch_password.as_deref().unwrap_or("changeme");
            settings.push("apm-server.kibana.username", username);
            settings.push("apm-server.kibana.password", password);
        }
    }

    if ctx.is_selected("kibana") && opts.dashboards && d.lower_than("7.0") && !secure {
        settings.push("setup.dashboards.enabled", "true");
    }

    if d.at_least("7.6") && opts.jaeger {
        settings.push("apm-server.jaeger.http.enabled", "true");
        settings.push("apm-server.jaeger.http.host", format!("0.0.0.0:{}", JAEGER_HTTP_PORT));
        settings.push("apm-server.jaeger.grpc.enabled", "true");
        settings.push("apm-server.jaeger.grpc.host", format!("0.0.0.0:{}", JAEGER_GRPC_PORT));
    }

    if opts.api_key_auth {
        settings.push("apm-server.api_key.enabled", "true");
    }
    if let Some(token) = opts.secret_token.as_deref() {
        settings.push("apm-server.secret_token", token);
    }

    if opts.enable_tls {
        settings.push("apm-server.ssl.enabled", "true");
        settings.push("apm-server.ssl.key", "/usr/share/apm-server/config/certs/tls.key");
        settings.push("apm-server.ssl.certificate", "/usr/share/apm-server/config/certs/tls.crt");
    }

    if opts.queue == QueueKind::File {
        settings.push("queue.spool", spool_queue(ctx));
    }

    let es_output = ElasticsearchOutput::new(&opts.elasticsearch_urls, DEFAULT_ELASTICSEARCH_URL)
        .credentials(opts.elasticsearch_username.as_deref(), opts.elasticsearch_password.as_deref())
        .secure_defaults(secure, APM_SERVER_USER);

    if opts.output == ApmServerOutput::Elasticsearch {
        add_elasticsearch_output(&mut settings, "output", &es_output);
        settings.push("output.elasticsearch.enabled", "true");
        if opts.enable_pipeline && d.at_least("6.5") {
            let pipeline = if d.at_least("7.2") { "apm" } else { "apm_user_agent" };
            settings.push("output.elasticsearch.pipelines", format!("[{{pipeline: '{}'}}]", pipeline));
            settings.push("apm-server.register.ingest.pipeline.enabled", "true");
            if opts.pipeline_path.is_some() {
                settings.push("apm-server.register.ingest.pipeline.overwrite", "true");
            }
        }
    } else {
        add_elasticsearch_output(&mut settings, monitoring, &es_output);
        settings.push("output.elasticsearch.enabled", "false");
        match opts.output {
            ApmServerOutput::Kafka => {
                add_kafka_output(&mut settings, "[{default: 'apm', topic: 'apm-%{[service.name]}'}]")
            }
            ApmServerOutput::Logstash => add_logstash_output(&mut settings),
            ApmServerOutput::File => {
                settings.push("output.file.enabled", "true");
                settings.push("output.file.path", opts.output_file.as_str());
            }
            ApmServerOutput::Elasticsearch => {}
        }
    }

    for opt in &opts.opts {
        let (key, value) = opt.split_once('=').ok_or_else(|| ProvisionError::InvalidOption {
            option: "apm-server-opt".to_string(),
            reason: format!("'{}' is not a key=value pair.", opt),
        })?;
        settings.push(key, value);
    }

    Ok(settings)
}

fn spool_queue(ctx: &ServiceContext<'_>) -> String {
    let opts = &ctx.options.apm_server;

    let mut file = serde_json::Map::new();
    file.insert("path".to_string(), "$${path.data}/spool.dat".into());
    if let Some(size) = &opts.queue_file_size {
        file.insert("size".to_string(), size.as_str().into());
    }
    if let Some(page_size) = &opts.queue_file_page_size {
        file.insert("page_size".to_string(), page_size.as_str().into());
    }

    let mut write = serde_json::Map::new();
    if let Some(size) = &opts.queue_write_buffer_size {
        write.insert("buffer_size".to_string(), size.as_str().into());
    }
    if let Some(events) = &opts.queue_write_flush_events {
        write.insert("flush.events".to_string(), events.as_str().into());
    }
    if let Some(timeout) = &opts.queue_write_flush_timeout {
        write.insert("flush.timeout".to_string(), timeout.as_str().into());
    }

    let mut queue = serde_json::Map::new();
    queue.insert("file".to_string(), file.into());
    if !write.is_empty() {
        queue.insert("write".to_string(), write.into());
    }
    serde_json::Value::Object(queue).to_string()
}

pub(super) fn apm_server(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let d = ctx.descriptor;
    let opts = &ctx.options.apm_server;
    let settings = apm_server_settings(ctx)?;

    let mut command = vec![
        "apm-server".to_string(),
        "-e".to_string(),
        "--httpprof".to_string(),
        format!(":{}", opts.monitor_port),
    ];
    command.extend(settings.to_args());

    let mut ports = vec![
        publish_port(d.port(), APM_SERVER_PORT, false),
        publish_port(opts.monitor_port, APM_MONITOR_PORT, false),
    ];
    if settings.contains("apm-server.jaeger.http.enabled", "true") {
        ports.push(publish_port(JAEGER_HTTP_PORT, JAEGER_HTTP_PORT, false));
    }
    if settings.contains("apm-server.jaeger.grpc.enabled", "true") {
        ports.push(publish_port(JAEGER_GRPC_PORT, JAEGER_GRPC_PORT, false));
    }

    let healthcheck_path = if d.at_least("6.5") { "/" } else { "/healthcheck" };

    let mut fragment = ServiceFragment {
        cap_add: ["CHOWN", "DAC_OVERRIDE", "SETGID", "SETUID"].map(String::from).to_vec(),
        cap_drop: vec!["ALL".to_string()],
        command: Some(Command::Args(command)),
        healthcheck: Some(Healthcheck::curl(APM_SERVER_PORT, "localhost", healthcheck_path)),
        labels: Slot::Set(d.default_labels()),
        ports,
        ..Default::default()
    };
    fragment.depends_on_healthy("elasticsearch");
    fragment.depends_on_healthy("kibana");

    if let Some(build) = &opts.build {
        let (repo, branch) = build.split_once('@').unwrap_or((build.as_str(), "master"));
        let repo = if repo.is_empty() { APM_SERVER_REPO } else { repo };
        let args = IndexMap::from([
            ("apm_server_base_image".to_string(), d.default_image()),
            ("apm_server_branch_or_commit".to_string(), branch.to_string()),
            ("apm_server_repo".to_string(), repo.to_string()),
        ]);
        fragment.build = Some(Build::context("docker/apm-server").with_args(BuildArgs::Map(args)));
        fragment.image = Slot::OptOut;
    }

    if opts.enable_tls {
        fragment.volumes.extend([
            "./scripts/tls/cert.crt:/usr/share/apm-server/config/certs/tls.crt".to_string(),
            "./scripts/tls/key.pem:/usr/share/apm-server/config/certs/tls.key".to_string(),
        ]);
        fragment.healthcheck = Some(
            Healthcheck::command([
                "CMD",
                "curl",
                "--write-out",
                "'HTTP %{http_code}'",
                "--fail",
                "--silent",
                "--output",
                "/dev/null",
                "-k",
                "https://localhost:8200/",
            ])
            .interval("10s")
            .retries(12),
        );
    }

    if let Some(path) = &opts.pipeline_path {
        fragment
            .volumes
            .push(format!("{}:/usr/share/apm-server/ingest/pipeline/definition.json", path));
    }

    Ok(fragment)
}

const ELASTICSEARCH_ENVIRONMENT: &[&str] = &[
    "bootstrap.memory_lock=true",
    "cluster.name=docker-cluster",
    "cluster.routing.allocation.disk.threshold_enabled=false",
    "discovery.type=single-node",
    "path.repo=/usr/share/elasticsearch/data/backups",
];

pub(super) fn elasticsearch(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let d = ctx.descriptor;
    let opts = &ctx.options.elasticsearch;
    let secure = ctx.options.xpack_secure;

    let mut java_opts = BTreeMap::from([
        ("Xms".to_string(), opts.heap.clone()),
        ("Xmx".to_string(), opts.heap.clone()),
    ]);
    java_opts.extend(opts.java_opts.clone());
    if d.at_least("6.4") {
        java_opts.insert("XX:UseAVX".to_string(), "=2".to_string());
    }
    let java_opts = java_opts
        .iter()
        .map(|(key, value)| format!("-{}{}", key, value))
        .collect::<Vec<_>>()
        .join(" ");

    let data_dir = opts.data_dir.clone().unwrap_or_else(|| d.version().to_string());

    let mut env: Vec<String> = ELASTICSEARCH_ENVIRONMENT.iter().map(|s| s.to_string()).collect();
    env.push(format!("ES_JAVA_OPTS={}", java_opts));
    env.push(format!("path.data=/usr/share/elasticsearch/data/{}", data_dir));
    if d.at_least("8.0") {
        env.push("indices.id_field_data.enabled=true".to_string());
    }

    if !d.oss() {
        if secure {
            if opts.xpack_audit {
                env.push("xpack.security.audit.enabled=true".to_string());
            }
            env.push("xpack.security.authc.anonymous.roles=remote_monitoring_collector".to_string());
            if d.at_least("7.0") {
                env.push("xpack.security.authc.realms.file.file1.order=0".to_string());
                env.push("xpack.security.authc.realms.native.native1.order=1".to_string());
            } else {
                env.push("xpack.security.authc.realms.file1.type=file".to_string());
                env.push("xpack.security.authc.realms.native1.type=native".to_string());
                env.push("xpack.security.authc.realms.native1.order=1".to_string());
            }
            if d.at_least("7.3") {
                env.push("xpack.security.authc.token.enabled=true".to_string());
                env.push("xpack.security.authc.api_key.enabled=true".to_string());
            }
        }
        env.push(format!("xpack.security.enabled={}", secure));
        env.push("xpack.license.self_generated.type=trial".to_string());
        if d.at_least("6.3") {
            env.push("xpack.monitoring.collection.enabled=true".to_string());
        }
    }

    let mut volumes = vec!["esdata:/usr/share/elasticsearch/data".to_string()];
    if secure {
        volumes.extend(
            [
                "./docker/elasticsearch/roles.yml:/usr/share/elasticsearch/config/roles.yml",
                "./docker/elasticsearch/users:/usr/share/elasticsearch/config/users",
                "./docker/elasticsearch/users_roles:/usr/share/elasticsearch/config/users_roles",
            ]
            .map(String::from),
        );
    }

    Ok(ServiceFragment {
        environment: Some(Environment::List(env)),
        healthcheck: Some(
            Healthcheck::command([
                "CMD-SHELL",
                "curl -s http://localhost:9200/_cluster/health | grep -vq '\"status\":\"red\"'",
            ])
            .interval("20")
            .retries(10),
        ),
        ports: vec![publish_port(d.port(), ELASTICSEARCH_PORT, false)],
        ulimits: Some(IndexMap::from([(
            "memlock".to_string(),
            Ulimit { hard: -1, soft: -1 },
        )])),
        volumes,
        ..Default::default()
    })
}

pub(super) fn kibana(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let d = ctx.descriptor;
    let mut env = Environment::default();
    env.set("SERVER_NAME", "kibana.example.org");

    if !d.oss() {
        env.set("XPACK_MONITORING_ENABLED", "true");
        if d.at_least("6.3") {
            env.set("XPACK_XPACK_MAIN_TELEMETRY_ENABLED", "false");
        }
        if ctx.options.xpack_secure {
            let (username, password) = ("kibana_system_user", "changeme");
            env.set("ELASTICSEARCH_PASSWORD", password);
            env.set("ELASTICSEARCH_USERNAME", username);
            env.set("STATUS_ALLOWANONYMOUS", "true");
            if d.at_least("7.6") {
                env.set(
                    "XPACK_SECURITY_LOGINASSISTANCEMESSAGE",
                    format!(
                        "Login&#32;details:&#32;`{}/{}`.&#32;Further&#32;details&#32;[here]({}).",
                        username, password, "https://github.com/elastic/apm-integration-testing#logging-in"
                    ),
                );
            }
        }
        if d.at_least("7.6") && !ctx.options.kibana.no_apm_servicemaps {
            env.set("XPACK_APM_SERVICEMAPENABLED", "true");
        }
    }

    let urls = &ctx.options.kibana.elasticsearch_urls;
    let urls = if urls.is_empty() {
        DEFAULT_ELASTICSEARCH_URL.to_string()
    } else {
        urls.join(",")
    };
    env.set("ELASTICSEARCH_URL", urls);

    let mut fragment = ServiceFragment {
        environment: Some(env),
        healthcheck: Some(Healthcheck::curl(KIBANA_PORT, "kibana", "/api/status").retries(20)),
        ports: vec![publish_port(d.port(), KIBANA_PORT, false)],
        ..Default::default()
    };
    fragment.depends_on_healthy("elasticsearch");
    Ok(fragment)
}
