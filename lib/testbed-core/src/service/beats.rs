//! Beat content: filebeat, heartbeat, metricbeat and packetbeat.

use testbed_error::ProvisionError;

use super::{
    outputs::{add_elasticsearch_output, add_logstash_output, monitoring_prefix, ElasticsearchOutput, Settings},
    ServiceContext,
};
use crate::{
    fragment::{Command, Environment, Healthcheck, ServiceFragment, Slot},
    options::{BeatOutput, DEFAULT_ELASTICSEARCH_URL},
};

const STACK_CA_PATH: &str = "/usr/share/beats/config/certs/stack-ca.crt";
const BEAT_MONITOR_PORT: u16 = 5066;

/// Shared layout of every beat container.
struct Beat<'c, 'a> {
    ctx: &'c ServiceContext<'a>,
    extra_args: &'static [&'static str],
    config: String,
    volumes: Vec<String>,
    dashboards: bool,
}

impl<'c, 'a> Beat<'c, 'a> {
    fn new(ctx: &'c ServiceContext<'a>, config: String) -> Self {
        Self {
            ctx,
            extra_args: &[],
            config,
            volumes: Vec::new(),
            dashboards: true,
        }
    }

    fn settings(&self) -> Settings {
        let d = self.ctx.descriptor;
        let name = d.name();
        let opts = self.ctx.options.beat(name);

        let es_output = ElasticsearchOutput::new(&opts.elasticsearch_urls, DEFAULT_ELASTICSEARCH_URL)
            .credentials(opts.elasticsearch_username.as_deref(), opts.elasticsearch_password.as_deref())
            .secure_defaults(self.ctx.options.xpack_secure, format!("{}_user", name));

        let mut settings = Settings::new();
        match opts.output {
            BeatOutput::Elasticsearch => {
                add_elasticsearch_output(&mut settings, "output", &es_output);
                settings.push("output.elasticsearch.enabled", "true");
            }
            BeatOutput::Logstash => {
                settings.push("output.elasticsearch.enabled", "false");
                add_elasticsearch_output(&mut settings, monitoring_prefix(d.version()), &es_output);
                add_logstash_output(&mut settings);
            }
        }
        settings
    }

    fn into_fragment(self) -> ServiceFragment {
        let name = self.ctx.descriptor.name();

        let mut command = vec![name.to_string(), "-e".to_string(), "--strict.perms=false".to_string()];
        command.extend(self.extra_args.iter().map(|arg| arg.to_string()));

        let mut fragment = ServiceFragment {
            environment: Some(Environment::default()),
            healthcheck: Some(Healthcheck::curl(BEAT_MONITOR_PORT, "localhost", "/?pretty")),
            labels: Slot::OptOut,
            user: Some("root".to_string()),
            ..Default::default()
        };
        fragment.depends_on_healthy("elasticsearch");

        if self.dashboards && self.ctx.is_selected("kibana") {
            command.extend(["-E".to_string(), "setup.dashboards.enabled=true".to_string()]);
            fragment.depends_on_healthy("kibana");
        }
        command.extend(self.settings().to_args());
        fragment.command = Some(Command::Args(command));

        fragment.volumes.push(format!("./docker/{}/{}:/usr/share/{}/{}.yml", name, self.config, name, name));
        fragment.volumes.extend(self.volumes);
        fragment.volumes.push(format!("./scripts/tls/ca/ca.crt:{}", STACK_CA_PATH));
        fragment
    }
}

fn docker_host_volumes() -> Vec<String> {
    vec![
        "/var/lib/docker/containers:/var/lib/docker/containers".to_string(),
        "/var/run/docker.sock:/var/run/docker.sock".to_string(),
    ]
}

fn compat_config(ctx: &ServiceContext<'_>, name: &str) -> String {
    if ctx.descriptor.at_least("7.2") {
        format!("{}.yml", name)
    } else {
        format!("{}.6.x-compat.yml", name)
    }
}

pub(super) fn filebeat(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let d = ctx.descriptor;
    let config = if d.at_least("7.2") {
        "filebeat.yml"
    } else if d.at_least("6.1") {
        "filebeat.6.x-compat.yml"
    } else {
        "filebeat.simple.yml"
    };

    let mut beat = Beat::new(ctx, config.to_string());
    beat.volumes = docker_host_volumes();
    Ok(beat.into_fragment())
}

pub(super) fn heartbeat(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let mut beat = Beat::new(ctx, "heartbeat.yml".to_string());
    beat.volumes = docker_host_volumes();
    beat.dashboards = false;
    Ok(beat.into_fragment())
}

pub(super) fn metricbeat(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let mut beat = Beat::new(ctx, compat_config(ctx, "metricbeat"));
    beat.volumes = vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()];

    let mut fragment = beat.into_fragment();
    fragment
        .environment
        .get_or_insert_with(Environment::default)
        .set("APM_SERVER_PPROF_HOST", ctx.options.apm_server_pprof_url.as_str());
    Ok(fragment)
}

pub(super) fn packetbeat(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let mut beat = Beat::new(ctx, compat_config(ctx, "packetbeat"));
    beat.extra_args = &["-E", "packetbeat.interfaces.device=eth0"];
    beat.volumes = vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()];

    let mut fragment = beat.into_fragment();
    fragment.privileged = Some(true);
    fragment.cap_add = vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()];
    fragment.network_mode = Some("service:apm-server".to_string());
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        options::{BeatOptions, ProvisionOptions},
        service::{Catalogue, ServiceDescriptor},
    };

    fn generate(name: &str, options: &ProvisionOptions, selected: &[&str]) -> ServiceFragment {
        let catalogue = Catalogue::standard();
        let selected: Vec<_> = selected
            .iter()
            .map(|s| ServiceDescriptor::new(catalogue.find(s).unwrap(), options).unwrap())
            .collect();
        let descriptor = ServiceDescriptor::new(catalogue.find(name).unwrap(), options).unwrap();
        ServiceContext {
            descriptor: &descriptor,
            options,
            selected: &selected,
        }
        .content()
        .unwrap()
    }

    fn args(fragment: &ServiceFragment) -> Vec<String> {
        match &fragment.command {
            Some(Command::Args(args)) => args.clone(),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn filebeat_config_follows_version() {
        let modern = generate("filebeat", &ProvisionOptions::new("7.6.2"), &[]);
        assert_eq!(modern.volumes[0], "./docker/filebeat/filebeat.yml:/usr/share/filebeat/filebeat.yml");

        let compat = generate("filebeat", &ProvisionOptions::new("6.8.0"), &[]);
        assert_eq!(
            compat.volumes[0],
            "./docker/filebeat/filebeat.6.x-compat.yml:/usr/share/filebeat/filebeat.yml"
        );

        let simple = generate("filebeat", &ProvisionOptions::new("6.0.0"), &[]);
        assert_eq!(
            simple.volumes[0],
            "./docker/filebeat/filebeat.simple.yml:/usr/share/filebeat/filebeat.yml"
        );
        assert_eq!(simple.volumes.last().unwrap(), "./scripts/tls/ca/ca.crt:/usr/share/beats/config/certs/stack-ca.crt");
    }

    #[test]
    fn dashboards_only_with_kibana() {
        let with = generate("metricbeat", &ProvisionOptions::new("7.6.2"), &["kibana"]);
        assert!(args(&with).contains(&"setup.dashboards.enabled=true".to_string()));
        assert!(with.depends_on.contains_key("kibana"));

        let heartbeat = generate("heartbeat", &ProvisionOptions::new("7.6.2"), &["kibana"]);
        assert!(!args(&heartbeat).contains(&"setup.dashboards.enabled=true".to_string()));
        assert!(!heartbeat.depends_on.contains_key("kibana"));
    }

    #[test]
    fn secure_defaults_use_beat_user() {
        let fragment = generate("filebeat", &ProvisionOptions::new("7.6.2"), &[]);
        let args = args(&fragment);
        assert!(args.contains(&"output.elasticsearch.username=filebeat_user".to_string()));
        assert!(args.contains(&"output.elasticsearch.enabled=true".to_string()));
        assert_eq!(fragment.labels, Slot::OptOut);
        assert_eq!(fragment.user.as_deref(), Some("root"));
    }

    #[test]
    fn logstash_output_keeps_monitoring() {
        let mut options = ProvisionOptions::new("7.1.1");
        options.beats.insert(
            "metricbeat".to_string(),
            BeatOptions {
                output: BeatOutput::Logstash,
                ..Default::default()
            },
        );
        let fragment = generate("metricbeat", &options, &[]);
        let args = args(&fragment);

        assert!(args.contains(&"output.elasticsearch.enabled=false".to_string()));
        assert!(args.contains(&"xpack.monitoring.elasticsearch.hosts=[\"http://elasticsearch:9200\"]".to_string()));
        assert!(args.contains(&"output.logstash.enabled=true".to_string()));
        assert_eq!(
            fragment.volumes[0],
            "./docker/metricbeat/metricbeat.6.x-compat.yml:/usr/share/metricbeat/metricbeat.yml"
        );
        assert_eq!(
            fragment.environment.unwrap().get("APM_SERVER_PPROF_HOST"),
            Some("apm-server:6060")
        );
    }

    #[test]
    fn packetbeat_shares_apm_server_network() {
        let fragment = generate("packetbeat", &ProvisionOptions::new("7.6.2"), &[]);
        assert_eq!(fragment.network_mode.as_deref(), Some("service:apm-server"));
        assert_eq!(fragment.privileged, Some(true));
        assert_eq!(&args(&fragment)[3..5], ["-E", "packetbeat.interfaces.device=eth0"]);
    }
}
