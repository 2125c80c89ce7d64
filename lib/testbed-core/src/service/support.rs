//! Supporting services: message brokers, databases, the fault-injection layer and the startup barrier.

use indexmap::IndexMap;
use testbed_error::ProvisionError;

use super::{Category, ServiceContext, LOAD_GENERATOR, WAIT_SERVICE};
use crate::{
    fragment::{publish_port, Build, BuildArgs, Command, DependsOn, Environment, Healthcheck, ServiceFragment, Slot},
    options::DEFAULT_ELASTICSEARCH_URL,
    proxy::topology::ProxyTopology,
    version::VersionVector,
};

const TOXI_API_PORT: u16 = 8474;

fn map_environment<const N: usize>(entries: [(&str, &str); N]) -> Environment {
    Environment::Map(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    )
}

fn wget_with_timeout(port: u16, path: &str) -> Healthcheck {
    let mut check = Healthcheck::wget(port, "localhost", path);
    check.test.splice(2..2, ["-T".to_string(), "3".to_string()]);
    check
}

fn local_build(context: &str) -> Build {
    Build::dockerfile(context).with_args(BuildArgs::List(Vec::new()))
}

pub(super) fn logstash(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let d = ctx.descriptor;

    let urls = &ctx.options.logstash_elasticsearch_urls;
    let urls = if urls.is_empty() {
        DEFAULT_ELASTICSEARCH_URL.to_string()
    } else {
        urls.join(",")
    };

    // The 7.3 pipeline layout follows whichever of logstash or apm-server is newer.
    let apm_server = ctx.options.overrides_for("apm-server");
    let modern_pipeline = d.at_least("7.3")
        || apm_server.is_some_and(|o| o.snapshot)
        || apm_server
            .and_then(|o| o.version.as_deref())
            .is_some_and(|v| VersionVector::parse_lenient(v).at_least("7.3"));
    let pipeline = if modern_pipeline { "pipeline" } else { "pipeline-6.x-compat" };

    let mut fragment = ServiceFragment {
        environment: Some(map_environment([("ELASTICSEARCH_URL", urls.as_str())])),
        healthcheck: Some(Healthcheck::curl(9600, "logstash", "/")),
        ports: vec![publish_port(d.port(), 5044, false), "9600".to_string()],
        volumes: vec![format!(
            "./docker/logstash/{}/:/usr/share/logstash/pipeline/",
            pipeline
        )],
        ..Default::default()
    };
    fragment.depends_on_healthy("elasticsearch");
    Ok(fragment)
}

pub(super) fn kafka(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    Ok(ServiceFragment {
        depends_on: IndexMap::from([("zookeeper".to_string(), DependsOn::STARTED)]),
        environment: Some(map_environment([
            ("KAFKA_ADVERTISED_LISTENERS", "PLAINTEXT://kafka:9092"),
            ("KAFKA_BROKER_ID", "1"),
            ("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", "1"),
            ("KAFKA_ZOOKEEPER_CONNECT", "zookeeper:2181"),
        ])),
        image: Slot::Set("confluentinc/cp-kafka:4.1.3".to_string()),
        labels: Slot::OptOut,
        logging: Slot::OptOut,
        ports: vec![publish_port(ctx.descriptor.port(), 9092, false)],
        ..Default::default()
    })
}

pub(super) fn zookeeper(_ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    Ok(ServiceFragment {
        environment: Some(map_environment([
            ("ZOOKEEPER_CLIENT_PORT", "2181"),
            ("ZOOKEEPER_TICK_TIME", "2000"),
        ])),
        image: Slot::Set("confluentinc/cp-zookeeper:latest".to_string()),
        labels: Slot::OptOut,
        logging: Slot::OptOut,
        ..Default::default()
    })
}

pub(super) fn postgres(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    Ok(ServiceFragment {
        environment: Some(Environment::List(vec![
            "POSTGRES_DB=opbeans".to_string(),
            "POSTGRES_PASSWORD=verysecure".to_string(),
        ])),
        healthcheck: Some(Healthcheck::command(["CMD", "pg_isready", "-h", "postgres", "-U", "postgres"]).interval("10s")),
        image: Slot::Set("postgres:10".to_string()),
        labels: Slot::OptOut,
        ports: vec![publish_port(ctx.descriptor.port(), 5432, true)],
        volumes: vec![
            "./docker/opbeans/sql:/docker-entrypoint-initdb.d".to_string(),
            "pgdata:/var/lib/postgresql/data".to_string(),
        ],
        ..Default::default()
    })
}

pub(super) fn redis(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    Ok(ServiceFragment {
        command: Some(Command::Shell("--save ''".to_string())),
        healthcheck: Some(Healthcheck::command(["CMD", "redis-cli", "ping"]).interval("10s")),
        image: Slot::Set("redis:4".to_string()),
        labels: Slot::OptOut,
        ports: vec![publish_port(ctx.descriptor.port(), 6379, true)],
        ..Default::default()
    })
}

pub(super) fn stats_d(_ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    Ok(ServiceFragment {
        build: Some(local_build("docker/statsd")),
        healthcheck: Some(Healthcheck::command(["CMD", "pidof", "node"]).interval("10s")),
        image: Slot::OptOut,
        labels: Slot::OptOut,
        ports: ["8125:8125/udp", "8126:8126", "8127:8127"].map(String::from).to_vec(),
        ..Default::default()
    })
}

pub(super) fn toxi(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let topology = ProxyTopology::from_selection(ctx.selected);
    topology.validate()?;

    let mut ports = vec![format!("{0}:{0}", TOXI_API_PORT)];
    for descriptor in topology.proxied_opbeans() {
        let published = format!("{0}:{0}", descriptor.port());
        if !ports.contains(&published) {
            ports.push(published);
        }
    }

    Ok(ServiceFragment {
        command: Some(Command::Args(vec![
            "-host=0.0.0.0".to_string(),
            "-config=/toxi/toxi.cfg".to_string(),
        ])),
        healthcheck: Some(wget_with_timeout(TOXI_API_PORT, "/proxies")),
        image: Slot::Set("shopify/toxiproxy".to_string()),
        labels: Slot::OptOut,
        ports,
        restart: Some("on-failure".to_string()),
        volumes: vec!["./docker/toxi/toxi.cfg:/toxi/toxi.cfg".to_string()],
        ..Default::default()
    })
}

pub(super) fn dyno(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    Ok(ServiceFragment {
        build: Some(local_build("docker/dyno")),
        container_name: Slot::Set("dyno".to_string()),
        environment: Some(map_environment([("TOXI_HOST", "toxi"), ("TOXI_PORT", "8474")])),
        healthcheck: Some(wget_with_timeout(8000, "/")),
        image: Slot::OptOut,
        labels: Slot::OptOut,
        logging: Slot::OptOut,
        ports: vec![format!("{}:8000", ctx.descriptor.port())],
        volumes: vec![
            "/var/run/docker.sock:/var/run/docker.sock".to_string(),
            "./docker/dyno:/dyno".to_string(),
        ],
        ..Default::default()
    })
}

/// The barrier service: a no-op container that waits on every other service becoming healthy.
pub(super) fn wait(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let mut waits_on: Vec<&str> = ctx
        .selected
        .iter()
        .filter(|d| !matches!(d.category(), Category::Barrier | Category::Fault))
        .map(|d| d.name())
        .filter(|name| *name != WAIT_SERVICE && *name != LOAD_GENERATOR)
        .collect();
    waits_on.sort_unstable();

    let mut fragment = ServiceFragment {
        container_name: Slot::Set("wait".to_string()),
        image: Slot::Set("busybox".to_string()),
        labels: Slot::OptOut,
        logging: Slot::OptOut,
        ..Default::default()
    };
    for name in waits_on {
        fragment.depends_on_healthy(name);
    }
    Ok(fragment)
}
