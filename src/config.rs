use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

use crate::{
    command::SshCommand,
    error::{TetherError, TetherResult},
    forwarding::{Direction, ForwardingRule},
    manager::SupervisorOptions,
    options, ssh_config,
};

/// Prefix of environment variables that override settings, e.g. `TETHER_INTERVAL`
pub const ENV_PREFIX: &str = "TETHER";

/// Separator for list settings given in the environment. Commas belong to the
/// `SRC,DST` rule form, so lists split on spaces.
const ENV_LIST_SEPARATOR: &str = " ";

/// Settings for the tunnel and its supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Program to launch
    pub program: String,
    /// ServerAliveInterval in seconds
    pub interval: u32,
    /// ConnectTimeout in seconds
    pub connect_timeout: u32,
    /// StrictHostKeyChecking policy
    pub host_check: Option<String>,
    pub batch_mode: bool,
    /// Pass `-v` to ssh
    pub ssh_verbose: bool,
    /// Pass `-N` to ssh
    pub no_remote_command: bool,
    pub exit_on_forward_failure: Option<bool>,
    /// Local forwarding rules, e.g. `8080:localhost:80`
    pub forward_local: Vec<String>,
    /// Remote forwarding rules
    pub forward_remote: Vec<String>,
    /// Host tokens passed to ssh after the options
    pub hosts: Vec<String>,
    /// ssh_config-style file of extra options
    pub options_file: Option<PathBuf>,
    pub backoff_floor_ms: u64,
    pub backoff_max_ms: u64,
    pub read_timeout_ms: u64,
    /// Directory for log files (default: `~/.tether`)
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            interval: 5,
            connect_timeout: 10,
            host_check: None,
            batch_mode: true,
            ssh_verbose: true,
            no_remote_command: true,
            exit_on_forward_failure: None,
            forward_local: Vec::new(),
            forward_remote: Vec::new(),
            hosts: Vec::new(),
            options_file: None,
            backoff_floor_ms: 100,
            backoff_max_ms: 2000,
            read_timeout_ms: 100,
            log_dir: None,
        }
    }
}

fn parse_rules(specs: &[String]) -> TetherResult<Vec<ForwardingRule>> {
    specs.iter().map(|spec| ForwardingRule::parse(spec)).collect()
}

impl Settings {
    /// Load settings from an optional file, then `TETHER_*` environment variables
    pub fn load(path: Option<&Path>) -> TetherResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Load settings with an explicit environment in place of the process environment
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> TetherResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(ENV_LIST_SEPARATOR)
                .with_list_parse_key("forward_local")
                .with_list_parse_key("forward_remote")
                .with_list_parse_key("hosts")
                .source(env),
        );

        let source = builder.build().wrap_err_with(|| match path {
            Some(path) => format!("Failed to load settings from {}", path.display()),
            None => "Failed to load settings".to_string(),
        })?;

        let settings: Settings = source.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> TetherResult<()> {
        if self.program.trim().is_empty() {
            return Err(TetherError::Config("Program cannot be empty".to_string()));
        }

        if self.interval == 0 {
            return Err(TetherError::Config(
                "Interval must be greater than zero".to_string(),
            ));
        }

        if self.connect_timeout == 0 {
            return Err(TetherError::Config(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }

        if self.read_timeout_ms == 0 {
            return Err(TetherError::Config(
                "Read timeout must be greater than zero".to_string(),
            ));
        }

        if self.backoff_floor_ms > self.backoff_max_ms {
            return Err(TetherError::Config(format!(
                "Backoff floor ({} ms) exceeds backoff max ({} ms)",
                self.backoff_floor_ms, self.backoff_max_ms
            )));
        }

        parse_rules(&self.forward_local)?;
        parse_rules(&self.forward_remote)?;
        Ok(())
    }

    /// Build the ssh command line these settings describe.
    ///
    /// The options file is applied first, so settings override any registered
    /// option it also names.
    pub fn to_command(&self) -> TetherResult<SshCommand> {
        let mut cmd = SshCommand::new();
        cmd.set_program(self.program.as_str());

        if let Some(path) = &self.options_file {
            cmd.apply_config_values(ssh_config::parse_file(path)?)?;
        }

        cmd.set(options::INTERVAL, self.interval)?;
        cmd.set(options::CONNECT_TIMEOUT, self.connect_timeout)?;
        if let Some(policy) = &self.host_check {
            cmd.set(options::HOST_CHECK, policy.as_str())?;
        }
        cmd.set(options::BATCH_MODE, self.batch_mode)?;
        cmd.set(options::VERBOSE, self.ssh_verbose)?;
        cmd.set(options::NO_REMOTE_COMMAND, self.no_remote_command)?;
        if let Some(exit) = self.exit_on_forward_failure {
            cmd.set(options::EXIT_ON_FORWARD_FAILURE, exit)?;
        }

        cmd.forwards_mut(Direction::Local)?
            .extend(parse_rules(&self.forward_local)?);
        cmd.forwards_mut(Direction::Remote)?
            .extend(parse_rules(&self.forward_remote)?);

        cmd.set_hosts(self.hosts.iter().cloned());
        Ok(cmd)
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            backoff_floor: Duration::from_millis(self.backoff_floor_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}
