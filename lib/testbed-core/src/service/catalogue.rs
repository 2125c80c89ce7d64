use std::fmt;

use testbed_error::ProvisionError;

use super::{agents, beats, opbeans, stack, support, ServiceContext};
use crate::fragment::ServiceFragment;

/// Default registry for published stack images.
pub const DEFAULT_DOCKER_REGISTRY: &str = "docker.elastic.co";

/// Name of the synthetic completion barrier.
pub const WAIT_SERVICE: &str = "wait-service";

/// Name of the opbeans load generator side-car.
pub const LOAD_GENERATOR: &str = "opbeans-load-generator";

/// Produces the content fragment of a service.
pub type ContentFn = fn(&ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError>;

/// Broad grouping of service kinds, used by the aggregate toggles.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Category {
    /// Core observability stack.
    Stack,

    /// Beats shippers.
    Beat,

    /// Supporting infrastructure.
    Auxiliary,

    /// Opbeans sample applications and their load generator.
    Opbeans,

    /// Agent integration test applications.
    Agent,

    /// Fault-injection layer.
    Fault,

    /// The synthetic completion barrier.
    Barrier,
}

impl Category {
    /// Human-readable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Stack => "stack",
            Category::Beat => "beat",
            Category::Auxiliary => "auxiliary",
            Category::Opbeans => "opbeans",
            Category::Agent => "agent",
            Category::Fault => "fault-injection",
            Category::Barrier => "barrier",
        }
    }
}

/// Naming scheme used to find a service's docker image inside a build candidate manifest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactScheme {
    /// `<image>-<version>-docker-image.tar.gz` in the project named after the image.
    Stack,

    /// As `Stack`, falling back to `<image>-<version>-linux-amd64-docker-image.tar.gz`. The image name never carries
    /// the `-ubi8` suffix.
    ApmServer,

    /// The `beats` project, trying the plain, `-linux-amd64-docker-image` and `-docker-image-linux-amd64` keys in turn.
    Beats,

    /// `<image>-<version>-docker-image.tar.gz` in the `logstash-docker` project.
    Logstash,
}

/// Identity of a published stack image.
#[derive(Clone, Copy, Debug)]
pub struct ImageSpec {
    /// Path under the registry, such as `apm` or `beats`.
    pub docker_path: &'static str,

    /// Image name.
    pub docker_name: &'static str,

    /// Image suffix used by default-distribution releases older than the given version, as `(version, suffix)`.
    pub legacy_suffix: Option<(&'static str, &'static str)>,

    /// How build candidate artifacts are named.
    pub artifacts: ArtifactScheme,
}

/// A kind of service the catalogue knows how to compose.
pub struct ServiceKind {
    /// Stable kebab-case name, also the service key in the composition document.
    pub name: &'static str,

    pub category: Category,

    /// Default external port.
    pub port: Option<u16>,

    /// Whether the service is on unless `--no-<name>` is given.
    pub enabled_by_default: bool,

    /// Secondary instances (`opbeans-<lang>01`) are never pulled in by aggregate toggles.
    pub secondary: bool,

    /// Side-cars start automatically whenever any opbeans service does.
    pub opbeans_side_car: bool,

    /// Published stack image, for services that can be provisioned from build candidates.
    pub image: Option<ImageSpec>,

    /// Lowest stack version the service supports.
    pub min_version: Option<&'static str>,

    pub content: ContentFn,
}

impl ServiceKind {
    const fn new(name: &'static str, category: Category, content: ContentFn) -> Self {
        Self {
            name,
            category,
            port: None,
            enabled_by_default: false,
            secondary: false,
            opbeans_side_car: false,
            image: None,
            min_version: None,
            content,
        }
    }

    const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    const fn enabled(mut self) -> Self {
        self.enabled_by_default = true;
        self
    }

    const fn secondary(mut self) -> Self {
        self.secondary = true;
        self
    }

    const fn side_car(mut self) -> Self {
        self.opbeans_side_car = true;
        self
    }

    const fn image(mut self, image: ImageSpec) -> Self {
        self.image = Some(image);
        self
    }

    const fn min_version(mut self, version: &'static str) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Whether the user can toggle this kind with `--with-<name>`/`--no-<name>`.
    pub fn is_toggleable(&self) -> bool {
        !self.opbeans_side_car && !matches!(self.category, Category::Fault | Category::Barrier)
    }

    /// Whether stack-level overrides (`--<name>-version`, `--<name>-bc`, ...) apply.
    pub fn is_stack_component(&self) -> bool {
        self.image.is_some()
    }
}

impl fmt::Debug for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceKind")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

const fn stack_image(docker_path: &'static str, docker_name: &'static str) -> ImageSpec {
    ImageSpec {
        docker_path,
        docker_name,
        legacy_suffix: None,
        artifacts: ArtifactScheme::Stack,
    }
}

const fn beat_image(docker_name: &'static str) -> ImageSpec {
    ImageSpec {
        docker_path: "beats",
        docker_name,
        legacy_suffix: None,
        artifacts: ArtifactScheme::Beats,
    }
}

const OLDEST_STACK: &str = "6.0";

static KINDS: &[ServiceKind] = &[
    // stack
    ServiceKind::new("apm-server", Category::Stack, stack::apm_server)
        .port(8200)
        .enabled()
        .image(ImageSpec {
            docker_path: "apm",
            docker_name: "apm-server",
            legacy_suffix: None,
            artifacts: ArtifactScheme::ApmServer,
        })
        .min_version(OLDEST_STACK),
    ServiceKind::new("elasticsearch", Category::Stack, stack::elasticsearch)
        .port(9200)
        .enabled()
        .image(ImageSpec {
            legacy_suffix: Some(("6.3", "-platinum")),
            ..stack_image("elasticsearch", "elasticsearch")
        })
        .min_version(OLDEST_STACK),
    ServiceKind::new("kibana", Category::Stack, stack::kibana)
        .port(5601)
        .enabled()
        .image(ImageSpec {
            legacy_suffix: Some(("6.3", "-x-pack")),
            ..stack_image("kibana", "kibana")
        })
        .min_version(OLDEST_STACK),
    // beats
    ServiceKind::new("filebeat", Category::Beat, beats::filebeat)
        .image(beat_image("filebeat"))
        .min_version(OLDEST_STACK),
    ServiceKind::new("heartbeat", Category::Beat, beats::heartbeat)
        .image(beat_image("heartbeat"))
        .min_version(OLDEST_STACK),
    ServiceKind::new("metricbeat", Category::Beat, beats::metricbeat)
        .image(beat_image("metricbeat"))
        .min_version(OLDEST_STACK),
    ServiceKind::new("packetbeat", Category::Beat, beats::packetbeat)
        .image(beat_image("packetbeat"))
        .min_version(OLDEST_STACK),
    // supporting services
    ServiceKind::new("kafka", Category::Auxiliary, support::kafka).port(9092),
    ServiceKind::new("logstash", Category::Auxiliary, support::logstash)
        .port(5044)
        .image(ImageSpec {
            artifacts: ArtifactScheme::Logstash,
            ..stack_image("logstash", "logstash")
        })
        .min_version(OLDEST_STACK),
    ServiceKind::new("postgres", Category::Auxiliary, support::postgres)
        .port(5432)
        .side_car(),
    ServiceKind::new("redis", Category::Auxiliary, support::redis)
        .port(6379)
        .side_car(),
    ServiceKind::new("zookeeper", Category::Auxiliary, support::zookeeper).port(2181),
    // opbeans
    ServiceKind::new("opbeans-dotnet", Category::Opbeans, opbeans::dotnet).port(3004),
    ServiceKind::new("opbeans-dotnet01", Category::Opbeans, opbeans::dotnet)
        .port(3104)
        .secondary(),
    ServiceKind::new("opbeans-go", Category::Opbeans, opbeans::go).port(3003),
    ServiceKind::new("opbeans-go01", Category::Opbeans, opbeans::go)
        .port(3103)
        .secondary(),
    ServiceKind::new("opbeans-java", Category::Opbeans, opbeans::java).port(3002),
    ServiceKind::new("opbeans-java01", Category::Opbeans, opbeans::java)
        .port(3102)
        .secondary(),
    ServiceKind::new("opbeans-node", Category::Opbeans, opbeans::node).port(3000),
    ServiceKind::new("opbeans-node01", Category::Opbeans, opbeans::node)
        .port(3100)
        .secondary(),
    ServiceKind::new("opbeans-python", Category::Opbeans, opbeans::python).port(8000),
    ServiceKind::new("opbeans-python01", Category::Opbeans, opbeans::python)
        .port(8100)
        .secondary(),
    ServiceKind::new("opbeans-ruby", Category::Opbeans, opbeans::ruby).port(3001),
    ServiceKind::new("opbeans-ruby01", Category::Opbeans, opbeans::ruby)
        .port(3101)
        .secondary(),
    ServiceKind::new("opbeans-rum", Category::Opbeans, opbeans::rum).port(9222),
    ServiceKind::new(LOAD_GENERATOR, Category::Opbeans, opbeans::load_generator).side_car(),
    // agent test applications
    ServiceKind::new("agent-dotnet", Category::Agent, agents::dotnet).port(8100),
    ServiceKind::new("agent-go-net-http", Category::Agent, agents::go_net_http).port(8080),
    ServiceKind::new("agent-java-spring", Category::Agent, agents::java_spring).port(8090),
    ServiceKind::new("agent-nodejs-express", Category::Agent, agents::nodejs_express).port(8010),
    ServiceKind::new("agent-php-apache", Category::Agent, agents::php_apache).port(8030),
    ServiceKind::new("agent-python-django", Category::Agent, agents::python_django).port(8003),
    ServiceKind::new("agent-python-flask", Category::Agent, agents::python_flask).port(8001),
    ServiceKind::new("agent-ruby-rails", Category::Agent, agents::ruby_rails).port(8020),
    ServiceKind::new("agent-rumjs", Category::Agent, agents::rumjs).port(8000),
    // fault injection
    ServiceKind::new("toxi", Category::Fault, support::toxi).port(8474),
    ServiceKind::new("dyno", Category::Fault, support::dyno).port(9000),
    ServiceKind::new("stats-d", Category::Fault, support::stats_d).port(8125),
    // barrier
    ServiceKind::new(WAIT_SERVICE, Category::Barrier, support::wait),
];

/// The static registry of every service kind.
#[derive(Clone, Copy, Debug)]
pub struct Catalogue {
    kinds: &'static [ServiceKind],
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::standard()
    }
}

impl Catalogue {
    /// The built-in catalogue.
    pub const fn standard() -> Self {
        Self { kinds: KINDS }
    }

    /// Iterates over every kind, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &'static ServiceKind> {
        self.kinds.iter()
    }

    /// Looks up a kind by name.
    pub fn find(&self, name: &str) -> Option<&'static ServiceKind> {
        self.kinds.iter().find(|kind| kind.name == name)
    }

    /// Iterates over the kinds in `category`.
    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &'static ServiceKind> {
        self.kinds.iter().filter(move |kind| kind.category == category)
    }
}
