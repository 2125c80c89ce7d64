//! Agent integration test applications.
//!
//! Each application is a small web service instrumented with one language agent. They all report to the APM server,
//! are built locally, and answer on `/healthcheck`.

use indexmap::IndexMap;
use testbed_error::ProvisionError;
use tracing::warn;

use super::ServiceContext;
use crate::{
    fragment::{publish_port, Build, BuildArgs, Command, Environment, Healthcheck, ServiceFragment, Slot},
    options::{AgentLogLevel, DEFAULT_APM_LOG_LEVEL},
};

const HEALTHCHECK_PATH: &str = "/healthcheck";

/// Builds a locally built agent application that reports to the APM server.
struct AgentApp<'c, 'a> {
    ctx: &'c ServiceContext<'a>,
    container: &'static str,
    internal_port: u16,
    env: IndexMap<String, String>,
}

impl<'c, 'a> AgentApp<'c, 'a> {
    fn new(ctx: &'c ServiceContext<'a>, container: &'static str) -> Self {
        Self {
            ctx,
            container,
            internal_port: service_port(ctx),
            env: IndexMap::new(),
        }
    }

    fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    fn verify_server_cert(self) -> Self {
        let verify = self.ctx.options.verify_server_cert();
        self.env("ELASTIC_APM_VERIFY_SERVER_CERT", verify)
    }

    fn log_level(self) -> Self {
        let level = self.ctx.options.apm_log_level.map(|l| l.as_str()).unwrap_or(DEFAULT_APM_LOG_LEVEL);
        self.env("ELASTIC_APM_LOG_LEVEL", level)
    }

    /// Adds the API key when one was given and the stack supports it.
    fn api_key(self) -> Self {
        match self.ctx.api_key() {
            Some(key) => self.env("ELASTIC_APM_API_KEY", key),
            None => self,
        }
    }

    /// Adds the secret token, if any, then the APM server URL under `url_key`.
    fn server(self, url_key: Option<&str>) -> Self {
        let options = self.ctx.options;
        let app = match &options.apm_server.secret_token {
            Some(token) => self.env("ELASTIC_APM_SECRET_TOKEN", token.as_str()),
            None => self,
        };
        match url_key {
            Some(key) => app.env(key, options.apm_server_url.as_str()),
            None => app,
        }
    }

    fn into_fragment(self, build: Build, command: Option<String>, healthcheck: Healthcheck) -> ServiceFragment {
        let mut fragment = ServiceFragment {
            build: Some(build),
            command: command.map(Command::Shell),
            container_name: Slot::Set(self.container.to_string()),
            environment: Some(Environment::Map(self.env)),
            healthcheck: Some(healthcheck),
            image: Slot::OptOut,
            labels: Slot::OptOut,
            logging: Slot::OptOut,
            ports: vec![publish_port(self.ctx.descriptor.port(), self.internal_port, false)],
            ..Default::default()
        };
        fragment.depends_on_healthy("apm-server");
        fragment
    }
}

fn build_args<const N: usize>(args: [(&str, &str); N]) -> BuildArgs {
    BuildArgs::Map(args.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

/// Port the application listens on inside its container.
fn service_port(ctx: &ServiceContext<'_>) -> u16 {
    ctx.descriptor.kind().port.unwrap_or_default()
}

fn curl(ctx: &ServiceContext<'_>, host: &str) -> Healthcheck {
    Healthcheck::curl(service_port(ctx), host, HEALTHCHECK_PATH)
}

/// Python agents older than 5.2 reject the certificate verification switch.
fn python_accepts_verify_switch(package: &str) -> bool {
    !package.contains("elastic-apm==5.1") && !package.contains("elastic-apm==4.")
}

pub(super) fn rumjs(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let agents = &ctx.options.agents;
    let server_url = ctx.options.apm_server_url.as_str();

    let build = Build::dockerfile("docker/rum").with_args(BuildArgs::List(vec![
        format!("RUM_AGENT_BRANCH={}", agents.rum_agent_branch),
        format!("RUM_AGENT_REPO={}", agents.rum_agent_repo),
        format!("APM_SERVER_URL={}", server_url),
    ]));

    let app = AgentApp::new(ctx, "rum")
        .env("ELASTIC_APM_SERVICE_NAME", "rum")
        .env("ELASTIC_APM_SERVER_URL", server_url)
        .verify_server_cert()
        .log_level()
        .api_key();
    Ok(app.into_fragment(build, None, Healthcheck::curl(service_port(ctx), "rum", "/")))
}

pub(super) fn go_net_http(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let agents = &ctx.options.agents;
    let build = Build::dockerfile("docker/go/nethttp").with_args(build_args([
        ("GO_AGENT_BRANCH", agents.go_agent_version.as_str()),
        ("GO_AGENT_REPO", agents.go_agent_repo.as_str()),
    ]));

    let app = AgentApp::new(ctx, "gonethttpapp")
        .log_level()
        .env("ELASTIC_APM_API_REQUEST_TIME", "3s")
        .env("ELASTIC_APM_FLUSH_INTERVAL", "500ms")
        .env("ELASTIC_APM_SERVICE_NAME", "gonethttpapp")
        .env("ELASTIC_APM_TRANSACTION_IGNORE_NAMES", "healthcheck")
        .verify_server_cert()
        .api_key()
        .server(Some("ELASTIC_APM_SERVER_URL"));
    Ok(app.into_fragment(build, None, curl(ctx, "gonethttpapp")))
}

pub(super) fn nodejs_express(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let command = format!(
        "bash -c \"npm install {} && node app.js\"",
        ctx.options.agents.nodejs_agent_package
    );

    let app = AgentApp::new(ctx, "expressapp")
        .env("EXPRESS_PORT", service_port(ctx).to_string())
        .env("EXPRESS_SERVICE_NAME", "expressapp")
        .verify_server_cert()
        .log_level()
        .api_key()
        .server(Some("ELASTIC_APM_SERVER_URL"));
    Ok(app.into_fragment(
        Build::dockerfile("docker/nodejs/express"),
        Some(command),
        curl(ctx, "expressapp"),
    ))
}

pub(super) fn php_apache(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let agents = &ctx.options.agents;
    let build = Build::dockerfile("docker/php/apache").with_args(build_args([
        ("PHP_AGENT_BRANCH", agents.php_agent_version.as_str()),
        ("PHP_AGENT_VERSION", agents.php_agent_release.as_str()),
        ("PHP_AGENT_REPO", agents.php_agent_repo.as_str()),
    ]));

    let mut app = AgentApp::new(ctx, "phpapacheapp")
        .env("ELASTIC_APM_SERVICE_NAME", "phpapacheapp")
        .verify_server_cert()
        .server(Some("ELASTIC_APM_SERVER_URL"));
    app.internal_port = 80;
    Ok(app.into_fragment(build, None, Healthcheck::curl(80, "phpapacheapp", HEALTHCHECK_PATH)))
}

pub(super) fn python_django(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let package = ctx.options.agents.python_agent_package.as_str();
    let port = service_port(ctx);
    let command = format!(
        "bash -c \"pip install -q -U {} && python testapp/manage.py runserver 0.0.0.0:{}\"",
        package, port
    );

    let mut app = AgentApp::new(ctx, "djangoapp")
        .env("DJANGO_PORT", port.to_string())
        .env("DJANGO_SERVICE_NAME", "djangoapp")
        .api_key()
        .server(Some("APM_SERVER_URL"));
    if python_accepts_verify_switch(package) {
        app = app.verify_server_cert();
    }
    Ok(app.into_fragment(
        Build::dockerfile("docker/python/django"),
        Some(command),
        curl(ctx, "djangoapp"),
    ))
}

pub(super) fn python_flask(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let package = ctx.options.agents.python_agent_package.as_str();
    let command = format!("bash -c \"pip install -q -U {} && gunicorn app:app\"", package);

    let mut app = AgentApp::new(ctx, "flaskapp")
        .env("FLASK_SERVICE_NAME", "flaskapp")
        .env("GUNICORN_CMD_ARGS", format!("-w 4 -b 0.0.0.0:{}", service_port(ctx)));
    if let Some(level) = ctx.options.apm_log_level {
        app = app.env("ELASTIC_APM_LOG_LEVEL", level.as_str());
    }
    app = app.api_key().server(Some("APM_SERVER_URL"));
    if python_accepts_verify_switch(package) {
        app = app.verify_server_cert();
    }
    Ok(app.into_fragment(
        Build::dockerfile("docker/python/flask"),
        Some(command),
        curl(ctx, "flaskapp"),
    ))
}

/// The Ruby agent takes numeric logger severities.
fn ruby_log_level(level: Option<AgentLogLevel>) -> &'static str {
    match level.unwrap_or(AgentLogLevel::Info) {
        AgentLogLevel::Trace => {
            warn!("Trace log level is not supported by the Ruby agent; using debug.");
            "0"
        }
        AgentLogLevel::Debug => "0",
        AgentLogLevel::Info => "1",
        AgentLogLevel::Warning => "2",
        AgentLogLevel::Error => "3",
    }
}

pub(super) fn ruby_rails(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let agents = &ctx.options.agents;
    let server_url = ctx.options.apm_server_url.as_str();
    let port = service_port(ctx);

    let build = Build::dockerfile("docker/ruby/rails").with_args(build_args([
        ("RUBY_AGENT_VERSION", agents.ruby_agent_version.as_str()),
        ("RUBY_AGENT_REPO", agents.ruby_agent_repo.as_str()),
        ("RUBY_VERSION", agents.ruby_version.as_str()),
    ]));
    let command = format!(
        "bash -c \"bundle install && RAILS_ENV=production bundle exec rails s -b 0.0.0.0 -p {}\"",
        port
    );

    let app = AgentApp::new(ctx, "railsapp")
        .env("APM_SERVER_URL", server_url)
        .env("ELASTIC_APM_LOG_LEVEL", ruby_log_level(ctx.options.apm_log_level))
        .env("ELASTIC_APM_API_REQUEST_TIME", "3s")
        .env("ELASTIC_APM_SERVER_URL", server_url)
        .verify_server_cert()
        .env("ELASTIC_APM_SERVICE_NAME", "railsapp")
        .env("RAILS_PORT", port.to_string())
        .env("RAILS_SERVICE_NAME", "railsapp")
        .env("RUBY_AGENT_VERSION_STATE", agents.ruby_agent_version_state.as_str())
        .env("RUBY_AGENT_VERSION", agents.ruby_agent_version.as_str())
        .env("RUBY_AGENT_REPO", agents.ruby_agent_repo.as_str())
        .api_key()
        .server(None);
    Ok(app.into_fragment(build, Some(command), curl(ctx, "railsapp").retries(60)))
}

pub(super) fn java_spring(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let agents = &ctx.options.agents;
    let m2_cache = if agents.java_m2_cache { "true" } else { "false" };
    let build = Build::dockerfile("docker/java/spring").with_args(build_args([
        ("JAVA_AGENT_BRANCH", agents.java_agent_version.as_str()),
        ("JAVA_AGENT_BUILT_VERSION", agents.java_agent_release.as_str()),
        ("JAVA_AGENT_REPO", agents.java_agent_repo.as_str()),
        ("JAVA_M2_CACHE", m2_cache),
    ]));

    let app = AgentApp::new(ctx, "javaspring")
        .env("ELASTIC_APM_API_REQUEST_TIME", "3s")
        .env("ELASTIC_APM_SERVICE_NAME", "springapp")
        .verify_server_cert()
        .log_level()
        .api_key()
        .server(Some("ELASTIC_APM_SERVER_URL"));
    Ok(app.into_fragment(build, None, curl(ctx, "javaspring")))
}

pub(super) fn dotnet(ctx: &ServiceContext<'_>) -> Result<ServiceFragment, ProvisionError> {
    let agents = &ctx.options.agents;
    let build = Build::dockerfile("docker/dotnet").with_args(build_args([
        ("DOTNET_AGENT_BRANCH", agents.dotnet_agent_version.as_str()),
        ("DOTNET_AGENT_VERSION", agents.dotnet_agent_release.as_str()),
        ("DOTNET_AGENT_REPO", agents.dotnet_agent_repo.as_str()),
    ]));

    let level = match ctx.options.apm_log_level.unwrap_or(AgentLogLevel::Info) {
        AgentLogLevel::Trace => "Trace",
        AgentLogLevel::Debug => "Debug",
        AgentLogLevel::Info => "Info",
        AgentLogLevel::Warning => "Warning",
        AgentLogLevel::Error => "Error",
    };

    let app = AgentApp::new(ctx, "dotnetapp")
        .verify_server_cert()
        .env("ELASTIC_APM_API_REQUEST_TIME", "3s")
        .env("ELASTIC_APM_FLUSH_INTERVAL", "5")
        .env("ELASTIC_APM_SERVICE_NAME", "dotnetapp")
        .env("ELASTIC_APM_TRANSACTION_IGNORE_NAMES", "healthcheck")
        .env("ELASTIC_APM_LOG_LEVEL", level)
        .api_key()
        .server(Some("ELASTIC_APM_SERVER_URLS"));
    Ok(app.into_fragment(build, None, curl(ctx, "dotnetapp")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        options::ProvisionOptions,
        service::{Catalogue, ServiceDescriptor},
    };

    fn generate(name: &str, options: &ProvisionOptions) -> ServiceFragment {
        let descriptor = ServiceDescriptor::new(Catalogue::standard().find(name).unwrap(), options).unwrap();
        ServiceContext {
            descriptor: &descriptor,
            options,
            selected: &[],
        }
        .content()
        .unwrap()
    }

    fn env(fragment: &ServiceFragment) -> &IndexMap<String, String> {
        match fragment.environment.as_ref() {
            Some(Environment::Map(map)) => map,
            other => panic!("unexpected environment: {:?}", other),
        }
    }

    #[test]
    fn every_agent_reports_to_apm_server() {
        let options = ProvisionOptions::new("7.6.2");
        for kind in Catalogue::standard().in_category(crate::service::Category::Agent) {
            let fragment = generate(kind.name, &options);
            assert!(fragment.depends_on.contains_key("apm-server"), "{}", kind.name);
            assert_eq!(fragment.image, Slot::OptOut, "{}", kind.name);
            assert_eq!(fragment.logging, Slot::OptOut, "{}", kind.name);
            assert!(matches!(fragment.container_name, Slot::Set(_)), "{}", kind.name);
        }
    }

    #[test]
    fn api_key_requires_7_6() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.apm_api_key = Some("abc".to_string());
        let fragment = generate("agent-java-spring", &options);
        assert_eq!(env(&fragment).get("ELASTIC_APM_API_KEY").map(String::as_str), Some("abc"));

        let mut options = ProvisionOptions::new("7.5.0");
        options.apm_api_key = Some("abc".to_string());
        let fragment = generate("agent-java-spring", &options);
        assert!(!env(&fragment).contains_key("ELASTIC_APM_API_KEY"));
    }

    #[test]
    fn secret_token_precedes_server_url() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.apm_server.secret_token = Some("token".to_string());
        let fragment = generate("agent-go-net-http", &options);
        let keys: Vec<_> = env(&fragment).keys().map(String::as_str).collect();

        assert_eq!(&keys[keys.len() - 2..], ["ELASTIC_APM_SECRET_TOKEN", "ELASTIC_APM_SERVER_URL"]);
    }

    #[test]
    fn log_levels_are_mapped_per_agent() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.apm_log_level = Some(AgentLogLevel::Warning);

        let rails = generate("agent-ruby-rails", &options);
        assert_eq!(env(&rails)["ELASTIC_APM_LOG_LEVEL"], "2");

        let dotnet = generate("agent-dotnet", &options);
        assert_eq!(env(&dotnet)["ELASTIC_APM_LOG_LEVEL"], "Warning");

        let spring = generate("agent-java-spring", &options);
        assert_eq!(env(&spring)["ELASTIC_APM_LOG_LEVEL"], "warning");
    }

    #[test]
    fn old_python_agents_skip_verify_switch() {
        let mut options = ProvisionOptions::new("7.6.2");
        options.agents.python_agent_package = "elastic-apm==4.2.0".to_string();
        let fragment = generate("agent-python-flask", &options);
        assert!(!env(&fragment).contains_key("ELASTIC_APM_VERIFY_SERVER_CERT"));

        let fragment = generate("agent-python-django", &ProvisionOptions::new("7.6.2"));
        assert_eq!(env(&fragment)["ELASTIC_APM_VERIFY_SERVER_CERT"], "true");
        assert_eq!(
            fragment.command,
            Some(Command::Shell(
                "bash -c \"pip install -q -U elastic-apm && python testapp/manage.py runserver 0.0.0.0:8003\"".to_string()
            ))
        );
    }

    #[test]
    fn php_publishes_apache_port() {
        let fragment = generate("agent-php-apache", &ProvisionOptions::new("7.6.2"));
        assert_eq!(fragment.ports, ["127.0.0.1:8030:80"]);
        assert_eq!(
            fragment.healthcheck.unwrap().test.last().map(String::as_str),
            Some("http://phpapacheapp:80/healthcheck")
        );
    }
}
