use serde::Serialize;
use testbed_core::{
    config::Settings,
    proxy::{ProxyController, ToxiproxyApi, ToxiproxyClient},
};
use testbed_error::{generic_error, ErrorContext as _, GenericError};

use crate::cli::ProxyAction;

/// Runs a `proxy` subcommand against the toxiproxy API named in the settings.
pub async fn run_proxy(settings: &Settings, action: ProxyAction) -> Result<(), GenericError> {
    let client = ToxiproxyClient::new(reqwest::Client::new(), settings.toxiproxy_url.clone());
    let controller = ProxyController::new(client, settings.range_table().await?);
    handle(&controller, action).await
}

async fn handle<A: ToxiproxyApi>(controller: &ProxyController<A>, action: ProxyAction) -> Result<(), GenericError> {
    match action {
        ProxyAction::List { full: false } => print_json(&controller.list().await?),
        ProxyAction::List { full: true } => print_json(&controller.list_full().await?),
        ProxyAction::App { name, denorm } => match controller.app(&name, denorm).await? {
            Some(status) => print_json(&status),
            None => Err(generic_error!("No proxy named '{}'.", name)),
        },
        ProxyAction::Enable { name } => controller.enable(&name).await,
        ProxyAction::Disable { name } => controller.disable(&name).await,
        ProxyAction::Slide { proxy, code, value } => Ok(controller.apply_toxic(&proxy, &code, value).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), GenericError> {
    let rendered = serde_json::to_string_pretty(value).error_context("Failed to serialize proxy state.")?;
    println!("{}", rendered);
    Ok(())
}
