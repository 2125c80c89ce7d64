//! Per-service command line options, generated from the catalogue.

use clap::{Arg, ArgAction, ArgMatches, Command};
use testbed_core::{
    options::{BeatOptions, OpbeansServiceOptions, ProvisionOptions, ServiceOverrides},
    service::{Catalogue, Category, ServiceKind, LOAD_GENERATOR},
};
use testbed_error::GenericError;

/// Adds the per-service options of every kind in `catalogue` to `command`.
pub fn augment(catalogue: &Catalogue, mut command: Command) -> Command {
    for kind in catalogue.iter() {
        for arg in service_args(kind) {
            command = command.arg(arg);
        }
    }
    command
}

fn service_args(kind: &ServiceKind) -> Vec<Arg> {
    let name = kind.name;
    let mut args = Vec::new();

    if kind.is_toggleable() {
        args.push(switch(format!("with-{}", name), format!("Start {}.", name)));
        args.push(
            switch(format!("no-{}", name), format!("Do not start {}.", name))
                .conflicts_with(format!("with-{}", name)),
        );
    }

    if matches!(kind.category, Category::Fault | Category::Barrier) {
        return args;
    }

    if kind.port.is_some() {
        args.push(
            option(format!("{}-port", name), "External port.")
                .value_parser(clap::value_parser!(u16)),
        );
    }
    args.push(
        option(format!("{}-env-var", name), "Extra `KEY=value` environment entry.").action(ArgAction::Append),
    );

    if kind.is_stack_component() {
        args.push(option(format!("{}-version", name), "Stack version override."));
        args.push(option(format!("{}-bc", name), "Build candidate id override."));
        for variant in ["oss", "release", "snapshot", "ubi8"] {
            args.push(switch(format!("{}-{}", name, variant), format!("Use the {} image.", variant)));
        }
    }

    if kind.category == Category::Beat {
        args.push(option(format!("{}-output", name), "Output: elasticsearch or logstash."));
        args.push(option(format!("{}-elasticsearch-url", name), "Elasticsearch URL.").action(ArgAction::Append));
        args.push(option(format!("{}-elasticsearch-username", name), "Elasticsearch user."));
        args.push(option(format!("{}-elasticsearch-password", name), "Elasticsearch password."));
    }

    if kind.category == Category::Opbeans && name != LOAD_GENERATOR {
        for (suffix, help) in OPBEANS_STRINGS {
            args.push(option(format!("{}-{}", name, suffix), *help));
        }
        args.push(
            option(format!("{}-sample-rate", name), "Transaction sample rate, in percent.")
                .value_parser(clap::value_parser!(u8)),
        );
        args.push(switch(format!("{}-no-infer-spans", name), "Disable inferred spans."));
        args.push(switch(format!("no-{}-loadgen", name), "Do not drive this service from the load generator."));
        args.push(
            option(format!("{}-loadgen-rpm", name), "Requests per minute from the load generator.")
                .value_parser(clap::value_parser!(u32)),
        );
    }

    args
}

const OPBEANS_STRINGS: &[(&str, &str)] = &[
    ("service-name", "Reported service name."),
    ("service-version", "Reported service version."),
    ("service-environment", "Reported service environment."),
    ("agent-branch", "Agent branch to build."),
    ("agent-repo", "Agent repository to build."),
    ("agent-local-repo", "Local agent checkout to install."),
    ("branch", "Application branch to build."),
    ("repo", "Application repository to build."),
    ("image", "Base image."),
    ("version", "Base image tag."),
];

fn switch(id: String, help: impl Into<String>) -> Arg {
    Arg::new(id.clone())
        .long(id)
        .action(ArgAction::SetTrue)
        .help(help.into())
}

fn option(id: String, help: impl Into<String>) -> Arg {
    Arg::new(id.clone()).long(id).help(help.into())
}

/// Applies the per-service options found in `matches` to `options`.
///
/// # Errors
///
/// If a beat output is not recognized, an error is returned.
pub fn apply(catalogue: &Catalogue, matches: &ArgMatches, options: &mut ProvisionOptions) -> Result<(), GenericError> {
    for kind in catalogue.iter() {
        let name = kind.name;

        if flag(matches, &format!("with-{}", name)) {
            options.explicit.insert(name.to_string(), true);
        }
        if flag(matches, &format!("no-{}", name)) {
            options.explicit.insert(name.to_string(), false);
        }

        let overrides = ServiceOverrides {
            version: value(matches, &format!("{}-version", name)).filter(|_| kind.is_stack_component()),
            bc: value(matches, &format!("{}-bc", name)),
            oss: flag(matches, &format!("{}-oss", name)),
            release: flag(matches, &format!("{}-release", name)),
            snapshot: flag(matches, &format!("{}-snapshot", name)),
            ubi8: flag(matches, &format!("{}-ubi8", name)),
            port: value(matches, &format!("{}-port", name)),
            env_vars: values(matches, &format!("{}-env-var", name)),
        };
        if is_set(&overrides) {
            options.overrides.insert(name.to_string(), overrides);
        }

        if kind.category == Category::Beat {
            let mut beat = BeatOptions {
                elasticsearch_urls: values(matches, &format!("{}-elasticsearch-url", name)),
                elasticsearch_username: value(matches, &format!("{}-elasticsearch-username", name)),
                elasticsearch_password: value(matches, &format!("{}-elasticsearch-password", name)),
                ..Default::default()
            };
            if let Some(output) = value::<String>(matches, &format!("{}-output", name)) {
                beat.output = output.parse()?;
            }
            options.beats.insert(name.to_string(), beat);
        }

        if kind.category == Category::Opbeans && name != LOAD_GENERATOR {
            let defaults = OpbeansServiceOptions::default();
            let string = |suffix: &str| value::<String>(matches, &format!("{}-{}", name, suffix));
            let service = OpbeansServiceOptions {
                service_name: string("service-name"),
                service_version: string("service-version"),
                service_environment: string("service-environment"),
                agent_branch: string("agent-branch"),
                agent_repo: string("agent-repo"),
                agent_local_repo: string("agent-local-repo"),
                branch: string("branch"),
                repo: string("repo"),
                image: string("image"),
                version: string("version"),
                sample_rate: value(matches, &format!("{}-sample-rate", name)).unwrap_or(defaults.sample_rate),
                no_infer_spans: flag(matches, &format!("{}-no-infer-spans", name)),
                no_loadgen: flag(matches, &format!("no-{}-loadgen", name)),
                loadgen_rpm: value(matches, &format!("{}-loadgen-rpm", name)).unwrap_or(defaults.loadgen_rpm),
            };
            options.opbeans.services.insert(name.to_string(), service);
        }
    }

    Ok(())
}

fn is_set(overrides: &ServiceOverrides) -> bool {
    overrides.version.is_some()
        || overrides.bc.is_some()
        || overrides.oss
        || overrides.release
        || overrides.snapshot
        || overrides.ubi8
        || overrides.port.is_some()
        || !overrides.env_vars.is_empty()
}

// Lookups go through the fallible accessors: an id that was never registered for a kind reads as unset.
fn flag(matches: &ArgMatches, id: &str) -> bool {
    matches.try_get_one::<bool>(id).ok().flatten().copied().unwrap_or(false)
}

fn value<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Option<T> {
    matches.try_get_one::<T>(id).ok().flatten().cloned()
}

fn values(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .try_get_many::<String>(id)
        .ok()
        .flatten()
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}
