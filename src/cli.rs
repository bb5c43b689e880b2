use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};

use crate::{
    command::SshCommand,
    config::Settings,
    error::TetherResult,
    forwarding::{Direction, ForwardingRule, deduplicate},
};

const HOST_ARGS: &str = "host_args";

fn host_args() -> Arg {
    Arg::new(HOST_ARGS)
        .value_name("HOST_ARGS")
        .num_args(0..)
        .trailing_var_arg(true)
        .allow_hyphen_values(true)
        .help("Host to connect to, optionally preceded by extra ssh arguments after `--`")
}

fn switch(name: &'static str, long: &'static str, opposite: &'static str) -> Arg {
    Arg::new(name)
        .long(long)
        .action(ArgAction::SetTrue)
        .overrides_with(opposite)
}

/// Build the command line interface
pub fn build_cli() -> Command {
    Command::new("tether")
        .version(env!("CARGO_PKG_VERSION"))
        .author("akagi201")
        .about("Maintain a long-lived ssh connection, restarting it when it drops")
        .long_about(
            "Maintain a long-lived ssh connection, restarting it when it drops.\n\n\
             ssh output is logged to the log directory (default: ~/.tether).",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Settings file (toml, json, yaml, ...)"),
        )
        .arg(
            Arg::new("options_file")
                .long("options-file")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("ssh_config-style file of extra ssh options"),
        )
        .arg(
            Arg::new("interval")
                .short('k')
                .long("interval")
                .value_name("SECONDS")
                .value_parser(value_parser!(u32))
                .help("Interval for maintaining the ssh connection (see ServerAliveInterval) [default: 5]"),
        )
        .arg(
            Arg::new("connect_timeout")
                .long("connect-timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u32))
                .help("Timeout for starting ssh connections (see ConnectTimeout) [default: 10]"),
        )
        .arg(
            switch("accept_new", "connect-accept-new", "no_accept_new").help(
                "Allow connections to hosts which aren't in the known hosts file (see StrictHostKeyChecking)",
            ),
        )
        .arg(
            switch("no_accept_new", "no-connect-accept-new", "accept_new")
                .help("Only connect to hosts in the known hosts file (see StrictHostKeyChecking)"),
        )
        .arg(switch("ssh_verbose", "ssh-verbose", "no_ssh_verbose").hide(true))
        .arg(switch("no_ssh_verbose", "no-ssh-verbose", "ssh_verbose").hide(true))
        .arg(switch("batch_mode", "ssh-batch-mode", "no_batch_mode").hide(true))
        .arg(switch("no_batch_mode", "no-ssh-batch-mode", "batch_mode").hide(true))
        .arg(
            Arg::new("log_dir")
                .long("log-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Directory for log files"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase logging verbosity"),
        )
        .arg(
            Arg::new("debug_json")
                .long("debug-json")
                .action(ArgAction::SetTrue)
                .hide(true)
                .help("Print the ssh command line as JSON and exit"),
        )
        .subcommand(
            Command::new("run")
                .about("Run a continuous ssh connection to HOST")
                .arg(host_args()),
        )
        .subcommand(
            Command::new("forward")
                .about("Run an ssh tunnel over the given ports to HOST")
                .long_about(
                    "Run an ssh tunnel over the given ports to HOST.\n\n\
                     To forward ports 80 and 495 from myserver.com to localhost:\n\n    \
                     tether forward -p 80 -p 495 myserver.com\n\n\
                     Extra ssh arguments go after `--`:\n\n    \
                     tether forward -p 80 -- -i /path/to/key myserver.com",
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .action(ArgAction::Append)
                        .help("Port to forward. Pass `local,remote` or `local:remote` to forward to a different port"),
                )
                .arg(
                    Arg::new("remote")
                        .short('R')
                        .long("remote")
                        .action(ArgAction::SetTrue)
                        .overrides_with("local")
                        .help("Use remote forwarding (-R)"),
                )
                .arg(
                    Arg::new("local")
                        .short('L')
                        .long("local")
                        .action(ArgAction::SetTrue)
                        .overrides_with("remote")
                        .help("Use local forwarding (-L, the default)"),
                )
                .arg(host_args()),
        )
        .subcommand(
            Command::new("check")
                .about("Connect to HOST once in batch mode and report whether it worked")
                .arg(host_args()),
        )
}

/// What the invocation asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run,
    Forward {
        direction: Direction,
        rules: Vec<ForwardingRule>,
    },
    Check,
}

/// Settings given on the command line, each overriding the loaded settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub interval: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub host_check: Option<String>,
    pub ssh_verbose: Option<bool>,
    pub batch_mode: Option<bool>,
    pub options_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config: Option<PathBuf>,
    pub verbosity: u8,
    pub debug_json: bool,
    pub overrides: Overrides,
    pub host_args: Vec<String>,
    pub action: Action,
}

fn either(matches: &ArgMatches, on: &str, off: &str) -> Option<bool> {
    if matches.get_flag(on) {
        Some(true)
    } else if matches.get_flag(off) {
        Some(false)
    } else {
        None
    }
}

impl Invocation {
    pub fn from_matches(matches: &ArgMatches) -> TetherResult<Self> {
        let host_check = either(matches, "accept_new", "no_accept_new")
            .map(|accept_new| String::from(if accept_new { "accept-new" } else { "yes" }));

        let overrides = Overrides {
            interval: matches.get_one::<u32>("interval").copied(),
            connect_timeout: matches.get_one::<u32>("connect_timeout").copied(),
            host_check,
            ssh_verbose: either(matches, "ssh_verbose", "no_ssh_verbose"),
            batch_mode: either(matches, "batch_mode", "no_batch_mode"),
            options_file: matches.get_one::<PathBuf>("options_file").cloned(),
            log_dir: matches.get_one::<PathBuf>("log_dir").cloned(),
        };

        let (action, sub) = match matches.subcommand() {
            Some(("forward", sub)) => {
                let direction = if sub.get_flag("remote") {
                    Direction::Remote
                } else {
                    Direction::Local
                };
                let ports = sub
                    .get_many::<String>("port")
                    .into_iter()
                    .flatten()
                    .map(|port| ForwardingRule::parse(port))
                    .collect::<TetherResult<Vec<_>>>()?;
                let rules = deduplicate(ports)?;
                (Action::Forward { direction, rules }, Some(sub))
            }
            Some(("check", sub)) => (Action::Check, Some(sub)),
            Some(("run", sub)) => (Action::Run, Some(sub)),
            _ => (Action::Run, None),
        };

        let host_args = sub
            .and_then(|sub| sub.get_many::<String>(HOST_ARGS))
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        Ok(Self {
            config: matches.get_one::<PathBuf>("config").cloned(),
            verbosity: matches.get_count("verbose"),
            debug_json: matches.get_flag("debug_json"),
            overrides,
            host_args,
            action,
        })
    }

    /// Apply the command line on top of loaded settings
    pub fn apply(&self, settings: &mut Settings) {
        let o = &self.overrides;
        if let Some(interval) = o.interval {
            settings.interval = interval;
        }
        if let Some(timeout) = o.connect_timeout {
            settings.connect_timeout = timeout;
        }
        if let Some(policy) = &o.host_check {
            settings.host_check = Some(policy.clone());
        }
        if let Some(verbose) = o.ssh_verbose {
            settings.ssh_verbose = verbose;
        }
        if let Some(batch_mode) = o.batch_mode {
            settings.batch_mode = batch_mode;
        }
        if let Some(path) = &o.options_file {
            settings.options_file = Some(path.clone());
        }
        if let Some(dir) = &o.log_dir {
            settings.log_dir = Some(dir.clone());
        }
        if !self.host_args.is_empty() {
            settings.hosts = self.host_args.clone();
        }
    }

    /// The ssh command for this invocation, with any forwarded ports installed
    pub fn command(&self, settings: &Settings) -> TetherResult<SshCommand> {
        let mut cmd = settings.to_command()?;
        if let Action::Forward { direction, rules } = &self.action {
            cmd.forwards_mut(*direction)?.extend(rules.iter().cloned());
        }
        Ok(cmd)
    }
}

/// Numbered `local -> remote` lines describing forwarded ports
pub fn forward_listing(direction: Direction, rules: &[ForwardingRule]) -> Vec<String> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let (from, to) = match direction {
                Direction::Local => (rule.source_port(), rule.destination_port()),
                Direction::Remote => (rule.destination_port(), rule.source_port()),
            };
            format!("{}) {} -> {}", i + 1, from, to)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;

    fn parse(args: &[&str]) -> Invocation {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        Invocation::from_matches(&matches).unwrap()
    }

    fn arguments(args: &[&str]) -> Vec<String> {
        let invocation = parse(args);
        let mut settings = Settings::default();
        invocation.apply(&mut settings);
        invocation.command(&settings).unwrap().arguments().unwrap()
    }

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_forward_single_port_pair() {
        let args = arguments(&["tether", "forward", "-p80:90", "example.com"]);
        assert_eq!(args[args.len() - 3..], ["-L", "80:localhost:90", "example.com"]);
    }

    #[test]
    fn test_forward_remote_deduplicates() {
        let invocation = parse(&[
            "tether", "forward", "-R", "-p", "8080", "-p", "9000,22", "-p", "8080", "host",
        ]);
        assert_eq!(
            invocation.action,
            Action::Forward {
                direction: Direction::Remote,
                rules: vec![ForwardingRule::from(8080u16), ForwardingRule::new(9000, 22)],
            }
        );
        if let Action::Forward { direction, rules } = &invocation.action {
            assert_eq!(
                forward_listing(*direction, rules),
                vec!["1) 8080 -> 8080", "2) 22 -> 9000"]
            );
        }
    }

    #[test]
    fn test_forward_conflicting_ports() {
        let matches = build_cli()
            .try_get_matches_from(["tether", "forward", "-p", "80:90", "-p", "80:91", "host"])
            .unwrap();
        assert!(matches!(
            Invocation::from_matches(&matches),
            Err(TetherError::DuplicatePort { port: 80, .. })
        ));
    }

    #[test]
    fn test_global_overrides() {
        let args = arguments(&[
            "tether",
            "-k",
            "30",
            "--connect-timeout",
            "3",
            "--connect-accept-new",
            "--no-ssh-verbose",
            "--no-ssh-batch-mode",
            "run",
            "--",
            "-i",
            "/path/to/key",
            "host.example.com",
        ]);
        assert_eq!(
            args,
            vec![
                "ssh",
                "-N",
                "-o",
                "ServerAliveInterval 30",
                "-o",
                "ConnectTimeout 3",
                "-o",
                "StrictHostKeyChecking accept-new",
                "-o",
                "BatchMode no",
                "-i",
                "/path/to/key",
                "host.example.com",
            ]
        );
    }

    #[test]
    fn test_last_switch_wins() {
        let invocation = parse(&[
            "tether",
            "--connect-accept-new",
            "--no-connect-accept-new",
            "check",
            "host",
        ]);
        assert_eq!(invocation.overrides.host_check.as_deref(), Some("yes"));
        assert_eq!(invocation.action, Action::Check);
        assert_eq!(invocation.host_args, vec!["host"]);
    }

    #[test]
    fn test_flags() {
        let invocation = parse(&["tether", "-vv", "--debug-json", "run", "host"]);
        assert_eq!(invocation.verbosity, 2);
        assert!(invocation.debug_json);
        assert_eq!(invocation.overrides, Overrides::default());
    }

    #[test]
    fn test_invalid_port() {
        let matches = build_cli()
            .try_get_matches_from(["tether", "forward", "-p", "http", "host"])
            .unwrap();
        assert!(matches!(
            Invocation::from_matches(&matches),
            Err(TetherError::InvalidForwarding { .. })
        ));
    }
}
