use std::path::Path;

use clap::{ArgMatches, CommandFactory as _, FromArgMatches as _};
use testbed_app::prelude::*;
use testbed_core::{
    config::{Settings, SettingsLoader},
    options::ProvisionOptions,
    service::Catalogue,
};
use testbed_error::{generic_error, GenericError};
use tracing::{debug, error};

mod cli;
use self::cli::{Action, Cli, ComposeArgs};

mod options;

mod provision;

mod proxy;

mod runner;

mod services;

mod status;

#[tokio::main]
async fn main() {
    let catalogue = Catalogue::standard();
    let matches = command(&catalogue).get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    if let Err(e) = run(cli, &matches, &catalogue).await {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

/// The command line definition, with per-service options added to the composing subcommands.
fn command(catalogue: &Catalogue) -> clap::Command {
    Cli::command()
        .mut_subcommand("start", |cmd| services::augment(catalogue, cmd))
        .mut_subcommand("compose", |cmd| services::augment(catalogue, cmd))
}

async fn run(cli: Cli, matches: &ArgMatches, catalogue: &Catalogue) -> Result<(), GenericError> {
    let settings = load_settings(cli.config.as_deref())?;
    debug!(?settings, "Loaded settings.");

    match cli.action {
        Action::Start(args) => {
            let options = provision_options(&args.compose, catalogue, matches, "start")?;
            provision::run_start(catalogue, &settings, &args, options).await
        }
        Action::Compose(args) => {
            let options = provision_options(&args, catalogue, matches, "compose")?;
            provision::run_compose(catalogue, &settings, &args, options).await
        }
        Action::Status => status::run_status().await,
        Action::Stop => runner::ComposeRunner::new(&settings, &settings.compose_path).stop().await,
        Action::ListServices => {
            status::list_services(catalogue);
            Ok(())
        }
        Action::Proxy(action) => proxy::run_proxy(&settings, action).await,
    }
}

fn load_settings(config: Option<&Path>) -> Result<Settings, GenericError> {
    let mut loader = SettingsLoader::default();
    if let Some(path) = config {
        loader = loader.from_yaml(path);
    }
    Ok(loader.from_environment().load()?)
}

fn provision_options(
    args: &ComposeArgs, catalogue: &Catalogue, matches: &ArgMatches, subcommand: &str,
) -> Result<ProvisionOptions, GenericError> {
    let sub_matches = matches
        .subcommand_matches(subcommand)
        .ok_or_else(|| generic_error!("Missing arguments for '{}'.", subcommand))?;

    let mut options = args.to_options()?;
    services::apply(catalogue, sub_matches, &mut options)?;
    Ok(options)
}
