use std::path::{Path, PathBuf};

use testbed_core::config::Settings;
use testbed_error::{generic_error, ErrorContext as _, GenericError};
use tokio::process::Command;
use tracing::{debug, info};

/// Build behavior for `start`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildFlags {
    pub pull: bool,
    pub no_cache: bool,
    pub parallel: bool,
}

/// Drives the container orchestrator against a written composition document.
pub struct ComposeRunner {
    program: String,
    leading_args: Vec<String>,
    compose_path: PathBuf,
}

impl ComposeRunner {
    pub fn new(settings: &Settings, compose_path: &Path) -> Self {
        let (program, leading_args) = settings.compose_program();
        Self {
            program,
            leading_args,
            compose_path: compose_path.to_path_buf(),
        }
    }

    fn args<'a>(&self, subcommand: &str, rest: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("-f".to_string());
        args.push(self.compose_path.display().to_string());
        args.push(subcommand.to_string());
        args.extend(rest.into_iter().map(str::to_string));
        args
    }

    fn build_args(&self, services: &[&str], flags: BuildFlags) -> Vec<String> {
        let mut rest = Vec::new();
        if flags.pull {
            rest.push("--pull");
        }
        if flags.no_cache {
            rest.push("--no-cache");
        }
        if flags.parallel {
            rest.push("--parallel");
        }
        rest.extend_from_slice(services);
        self.args("build", rest)
    }

    fn up_args(&self, remove_orphans: bool) -> Vec<String> {
        let mut rest = vec!["-d"];
        if remove_orphans {
            rest.push("--remove-orphans");
        }
        self.args("up", rest)
    }

    /// Builds the locally built services.
    pub async fn build(&self, services: &[&str], flags: BuildFlags) -> Result<(), GenericError> {
        if services.is_empty() {
            return Ok(());
        }
        self.run(self.build_args(services, flags)).await
    }

    /// Pulls published images for the given services.
    pub async fn pull(&self, services: &[&str]) -> Result<(), GenericError> {
        if services.is_empty() {
            return Ok(());
        }
        let args = self.args("pull", std::iter::once("--ignore-pull-failures").chain(services.iter().copied()));
        self.run(args).await
    }

    /// Starts every service in the background.
    pub async fn up(&self, remove_orphans: bool) -> Result<(), GenericError> {
        self.run(self.up_args(remove_orphans)).await
    }

    /// Stops every service.
    pub async fn stop(&self) -> Result<(), GenericError> {
        self.run(self.args("stop", std::iter::empty())).await
    }

    async fn run(&self, args: Vec<String>) -> Result<(), GenericError> {
        info!(command = %format!("{} {}", self.program, args.join(" ")), "Running orchestrator.");

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .await
            .with_error_context(|| format!("Failed to spawn '{}'.", self.program))?;

        debug!(%status, "Orchestrator exited.");
        if !status.success() {
            return Err(generic_error!("'{} {}' exited with {}.", self.program, args.join(" "), status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(command: &str) -> ComposeRunner {
        let settings = Settings {
            compose_command: command.to_string(),
            ..Default::default()
        };
        ComposeRunner::new(&settings, Path::new("out/docker-compose.yml"))
    }

    #[test]
    fn build_args_follow_flags() {
        let runner = runner("docker compose");
        assert_eq!(runner.program, "docker");

        let args = runner.build_args(
            &["opbeans-go", "agent-rumjs"],
            BuildFlags {
                pull: true,
                no_cache: false,
                parallel: true,
            },
        );
        assert_eq!(
            args,
            [
                "compose",
                "-f",
                "out/docker-compose.yml",
                "build",
                "--pull",
                "--parallel",
                "opbeans-go",
                "agent-rumjs"
            ]
        );
    }

    #[test]
    fn up_args() {
        let runner = runner("docker-compose");
        assert!(runner.leading_args.is_empty());
        assert_eq!(runner.up_args(false), ["-f", "out/docker-compose.yml", "up", "-d"]);
        assert_eq!(
            runner.up_args(true),
            ["-f", "out/docker-compose.yml", "up", "-d", "--remove-orphans"]
        );
    }
}
