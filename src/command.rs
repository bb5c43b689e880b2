use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{TetherError, TetherResult},
    forwarding::{Direction, ForwardingRule},
    options::{self, OptionKind, OptionRegistry, OptionSpec, OptionValue, ssh_registry},
    ssh_config::ConfigValue,
};

/// Configuration for arguments to the ssh command.
///
/// Each registered option lives in a three-state slot: untouched (the option's
/// default applies), cleared (renders nothing, overriding any default) or set.
///
/// The rendered argument vector is always
/// `program, options (registration order), extra args, hosts, remote command`.
/// Extra args precede the hosts so host tokens can override earlier `-o` options.
#[derive(Debug, Clone)]
pub struct SshCommand {
    program: String,
    registry: Arc<OptionRegistry>,
    values: HashMap<&'static str, Option<OptionValue>>,
    hosts: Vec<String>,
    args: Vec<String>,
    remote_command: Vec<String>,
}

impl Default for SshCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl SshCommand {
    /// An empty `ssh` command using the standard ssh option table
    pub fn new() -> Self {
        Self::with_registry("ssh", ssh_registry())
    }

    pub fn with_registry(program: impl Into<String>, registry: Arc<OptionRegistry>) -> Self {
        Self {
            program: program.into(),
            registry,
            values: HashMap::new(),
            hosts: Vec::new(),
            args: Vec::new(),
            remote_command: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn set_program(&mut self, program: impl Into<String>) {
        self.program = program.into();
    }

    fn spec(&self, key: &str) -> TetherResult<&OptionSpec> {
        self.registry
            .find(key)
            .ok_or_else(|| TetherError::UnknownOption(key.to_string()))
    }

    /// Current value of an option, falling back to its default when untouched
    pub fn get(&self, key: &str) -> TetherResult<Option<&OptionValue>> {
        let spec = self.spec(key)?;
        Ok(match self.values.get(spec.name) {
            Some(slot) => slot.as_ref(),
            None => spec.default.as_ref(),
        })
    }

    /// Current value of a flag or boolean option
    pub fn get_bool(&self, key: &str) -> TetherResult<Option<bool>> {
        match self.get(key)? {
            None => Ok(None),
            Some(OptionValue::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(TetherError::InvalidValue {
                option: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Set an option, checking the value against the option's declared kind
    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>) -> TetherResult<()> {
        let value = value.into();
        let spec = self.spec(key)?;
        if !spec.accepts(&value) {
            return Err(TetherError::InvalidValue {
                option: spec.name.to_string(),
                value: value.to_string(),
            });
        }
        let name = spec.name;
        self.values.insert(name, Some(value));
        Ok(())
    }

    /// Set an option from text, parsed per the option's declared type.
    ///
    /// Forwarding options append the parsed rule to the current list.
    pub fn set_str(&mut self, key: &str, text: &str) -> TetherResult<()> {
        let registry = Arc::clone(&self.registry);
        let spec = registry
            .find(key)
            .ok_or_else(|| TetherError::UnknownOption(key.to_string()))?;

        match (spec.parse_value(text)?, &spec.kind) {
            (OptionValue::Rules(rules), OptionKind::Forward { direction }) => {
                self.forwards_mut(*direction)?.extend(rules);
            }
            (value, _) => {
                self.values.insert(spec.name, Some(value));
            }
        }
        Ok(())
    }

    /// Explicitly unset an option so that it renders nothing, even if it has a default
    pub fn clear(&mut self, key: &str) -> TetherResult<()> {
        let name = self.spec(key)?.name;
        self.values.insert(name, None);
        Ok(())
    }

    /// Return an option to its untouched state, so its default applies again
    pub fn reset(&mut self, key: &str) -> TetherResult<()> {
        let name = self.spec(key)?.name;
        self.values.remove(name);
        Ok(())
    }

    /// Store a value without checking it against the declared kind.
    ///
    /// A mismatched value makes [`SshCommand::arguments`] fail.
    pub fn insert_raw(&mut self, key: &str, value: OptionValue) -> TetherResult<()> {
        let name = self.spec(key)?.name;
        self.values.insert(name, Some(value));
        Ok(())
    }

    fn forward_name(&self, direction: Direction) -> TetherResult<&'static str> {
        self.registry
            .iter()
            .find(|spec| spec.kind == OptionKind::Forward { direction })
            .map(|spec| spec.name)
            .ok_or_else(|| TetherError::UnknownOption(direction.to_ssh_flag().to_string()))
    }

    /// Forwarding rules configured for `direction`
    pub fn forwards(&self, direction: Direction) -> TetherResult<&[ForwardingRule]> {
        match self.get(self.forward_name(direction)?)? {
            Some(OptionValue::Rules(rules)) => Ok(rules),
            _ => Ok(&[]),
        }
    }

    /// Mutable forwarding rules for `direction`, materializing the default list
    pub fn forwards_mut(&mut self, direction: Direction) -> TetherResult<&mut Vec<ForwardingRule>> {
        let registry = Arc::clone(&self.registry);
        let name = self.forward_name(direction)?;
        let default = registry.find(name).and_then(|spec| spec.default.clone());

        let slot = self.values.entry(name).or_insert(default);
        if !matches!(slot, Some(OptionValue::Rules(_))) {
            *slot = Some(OptionValue::Rules(Vec::new()));
        }
        match slot {
            Some(OptionValue::Rules(rules)) => Ok(rules),
            _ => Err(TetherError::UnknownOption(name.to_string())),
        }
    }

    /// Replace the forwarding rules for `direction`
    pub fn set_forwards(
        &mut self,
        direction: Direction,
        rules: impl IntoIterator<Item = ForwardingRule>,
    ) -> TetherResult<()> {
        let name = self.forward_name(direction)?;
        self.values
            .insert(name, Some(OptionValue::Rules(rules.into_iter().collect())));
        Ok(())
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Set the host tokens, dropping echoed program names and `--` separators
    pub fn set_hosts<I, S>(&mut self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = self.program.clone();
        self.hosts = hosts
            .into_iter()
            .map(Into::into)
            .filter(|token: &String| token != "--" && *token != program && token != "ssh")
            .collect();
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Append raw ssh arguments, rendered after the options and before the hosts
    pub fn extend<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    pub fn remote_command(&self) -> &[String] {
        &self.remote_command
    }

    pub fn set_remote_command<I, S>(&mut self, command: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remote_command = command.into_iter().map(Into::into).collect();
    }

    /// Apply keyword/argument pairs read from an ssh_config-style file.
    ///
    /// Keywords naming a registered option are set through it; anything else is
    /// passed to ssh verbatim as `-o "keyword argument"`.
    pub fn apply_config_values<I>(&mut self, values: I) -> TetherResult<()>
    where
        I: IntoIterator<Item = ConfigValue>,
    {
        for value in values {
            if self.registry.find(&value.keyword).is_some() {
                self.set_str(&value.keyword, &value.argument)?;
            } else {
                self.extend(["-o".to_string(), format!("{} {}", value.keyword, value.argument)]);
            }
        }
        Ok(())
    }

    /// A copy prepared to run one remote command and exit
    pub fn single_command<I, S>(&self, command: I) -> TetherResult<SshCommand>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = self.clone();
        cmd.set(options::BATCH_MODE, true)?;
        cmd.set(options::NO_REMOTE_COMMAND, false)?;
        cmd.set(options::VERBOSE, false)?;
        cmd.set_forwards(Direction::Local, Vec::new())?;
        cmd.set_forwards(Direction::Remote, Vec::new())?;
        cmd.set_remote_command(command);
        Ok(cmd)
    }

    /// Construct the list of arguments to pass to ssh
    pub fn arguments(&self) -> TetherResult<Vec<String>> {
        let mut args = vec![self.program.clone()];
        for spec in self.registry.iter() {
            let value = match self.values.get(spec.name) {
                Some(slot) => slot.as_ref(),
                None => spec.default.as_ref(),
            };
            args.extend(spec.arguments(value)?);
        }

        args.extend(self.args.iter().cloned());
        // Host goes after the extra args to override previous options if necessary
        args.extend(self.hosts.iter().cloned());
        args.extend(self.remote_command.iter().cloned());
        Ok(args)
    }
}
