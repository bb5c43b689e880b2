//! Declared ssh options and how each one renders into argument tokens.
//!
//! Every option is an [`OptionSpec`] drawn from a closed set of kinds: a bare flag
//! (`-v`), a keyword option passed through `-o "Keyword value"`, or a repeated
//! forwarding rule (`-L` / `-R`). An [`OptionRegistry`] keeps the specs in
//! declaration order, which is the order they appear on the command line.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, LazyLock},
};

use crate::{
    error::{TetherError, TetherResult},
    forwarding::{Direction, ForwardingRule},
};

pub const NO_REMOTE_COMMAND: &str = "no_remote_command";
pub const VERBOSE: &str = "verbose";
pub const INTERVAL: &str = "interval";
pub const CONNECT_TIMEOUT: &str = "connect_timeout";
pub const HOST_CHECK: &str = "host_check";
pub const BATCH_MODE: &str = "batch_mode";
pub const EXIT_ON_FORWARD_FAILURE: &str = "exit_on_forward_failure";
pub const FORWARD_LOCAL: &str = "forward_local";
pub const FORWARD_REMOTE: &str = "forward_remote";

/// Value types accepted by keyword options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Str,
}

/// The closed set of renderable option kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKind {
    /// A bare token emitted only when the value is true
    Flag { flag: &'static str },
    /// `-o "Keyword value"`
    Value {
        keyword: &'static str,
        ty: ValueType,
    },
    /// Repeated forwarding rules
    Forward { direction: Direction },
}

impl OptionKind {
    fn describe(&self) -> String {
        match self {
            OptionKind::Flag { .. } => "flag".to_string(),
            OptionKind::Value { ty, .. } => format!("{ty:?}").to_lowercase(),
            OptionKind::Forward { .. } => "forward".to_string(),
        }
    }
}

/// A value held by a configuration for one option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Rules(Vec<ForwardingRule>),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Str(s) => write!(f, "{s:?}"),
            OptionValue::Rules(rules) => {
                let rules: Vec<String> = rules.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rules.join(", "))
            }
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<Vec<ForwardingRule>> for OptionValue {
    fn from(value: Vec<ForwardingRule>) -> Self {
        OptionValue::Rules(value)
    }
}

/// A typed, named specification of one renderable option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: OptionKind,
    pub default: Option<OptionValue>,
}

impl OptionSpec {
    pub fn flag(name: &'static str, flag: &'static str) -> Self {
        Self {
            name,
            aliases: &[],
            kind: OptionKind::Flag { flag },
            default: None,
        }
    }

    pub fn value(name: &'static str, keyword: &'static str, ty: ValueType) -> Self {
        Self {
            name,
            aliases: &[],
            kind: OptionKind::Value { keyword, ty },
            default: None,
        }
    }

    pub fn forward(name: &'static str, direction: Direction) -> Self {
        Self {
            name,
            aliases: &[],
            kind: OptionKind::Forward { direction },
            default: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_default(mut self, default: impl Into<OptionValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// True if `key` names this option by name, alias or ssh keyword (any case)
    pub fn matches(&self, key: &str) -> bool {
        let keyword = match &self.kind {
            OptionKind::Value { keyword, .. } => Some(*keyword),
            _ => None,
        };
        std::iter::once(self.name)
            .chain(self.aliases.iter().copied())
            .chain(keyword)
            .any(|candidate| candidate.eq_ignore_ascii_case(key))
    }

    /// Check that `value` fits this option's declared kind
    pub fn accepts(&self, value: &OptionValue) -> bool {
        matches!(
            (&self.kind, value),
            (OptionKind::Flag { .. }, OptionValue::Bool(_))
                | (
                    OptionKind::Value {
                        ty: ValueType::Bool,
                        ..
                    },
                    OptionValue::Bool(_)
                )
                | (
                    OptionKind::Value {
                        ty: ValueType::Int,
                        ..
                    },
                    OptionValue::Int(_)
                )
                | (
                    OptionKind::Value {
                        ty: ValueType::Str,
                        ..
                    },
                    OptionValue::Str(_)
                )
                | (OptionKind::Forward { .. }, OptionValue::Rules(_))
        )
    }

    /// Parse text into a value of this option's declared type.
    ///
    /// Forward options parse a single rule, returned as a one-element list.
    pub fn parse_value(&self, text: &str) -> TetherResult<OptionValue> {
        let invalid = || TetherError::InvalidValue {
            option: self.name.to_string(),
            value: text.to_string(),
        };
        let text = text.trim();
        match &self.kind {
            OptionKind::Flag { .. }
            | OptionKind::Value {
                ty: ValueType::Bool,
                ..
            } => parse_bool(text).map(OptionValue::Bool).ok_or_else(invalid),
            OptionKind::Value {
                ty: ValueType::Int, ..
            } => text.parse().map(OptionValue::Int).map_err(|_| invalid()),
            OptionKind::Value {
                ty: ValueType::Str, ..
            } => Ok(OptionValue::Str(text.to_string())),
            OptionKind::Forward { .. } => {
                ForwardingRule::parse(text).map(|rule| OptionValue::Rules(vec![rule]))
            }
        }
    }

    /// Render this option's tokens for `value` (`None` renders nothing).
    pub fn arguments(&self, value: Option<&OptionValue>) -> TetherResult<Vec<String>> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };

        match (&self.kind, value) {
            (OptionKind::Flag { flag }, OptionValue::Bool(enabled)) => Ok(if *enabled {
                vec![flag.to_string()]
            } else {
                Vec::new()
            }),
            (OptionKind::Value { keyword, ty }, value) if self.accepts(value) => {
                let rendered = match (ty, value) {
                    (ValueType::Bool, OptionValue::Bool(b)) => {
                        String::from(if *b { "yes" } else { "no" })
                    }
                    (ValueType::Int, OptionValue::Int(i)) => i.to_string(),
                    (ValueType::Str, OptionValue::Str(s)) => s.clone(),
                    _ => return Err(self.unsupported(value)),
                };
                Ok(vec!["-o".to_string(), format!("{keyword} {rendered}")])
            }
            (OptionKind::Forward { direction }, OptionValue::Rules(rules)) => {
                let mut seen: HashSet<&ForwardingRule> = HashSet::new();
                let mut args = Vec::with_capacity(rules.len() * 2);
                for rule in rules {
                    if seen.insert(rule) {
                        args.extend(rule.to_argument_tokens(*direction));
                    }
                }
                Ok(args)
            }
            _ => Err(self.unsupported(value)),
        }
    }

    fn unsupported(&self, value: &OptionValue) -> TetherError {
        TetherError::UnsupportedType {
            option: self.name.to_string(),
            kind: self.kind.describe(),
            value: value.to_string(),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Ordered list of option specs for one kind of configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionRegistry {
    specs: Vec<OptionSpec>,
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `spec` unless an equal spec is already registered.
    pub fn register(&mut self, spec: OptionSpec) -> &mut Self {
        if !self.specs.contains(&spec) {
            self.specs.push(spec);
        }
        self
    }

    pub fn with(mut self, spec: OptionSpec) -> Self {
        self.register(spec);
        self
    }

    /// Look up a spec by name, alias or ssh keyword
    pub fn find(&self, key: &str) -> Option<&OptionSpec> {
        self.specs.iter().find(|spec| spec.matches(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

static SSH_REGISTRY: LazyLock<Arc<OptionRegistry>> = LazyLock::new(|| {
    Arc::new(
        OptionRegistry::new()
            .with(OptionSpec::flag(NO_REMOTE_COMMAND, "-N"))
            .with(OptionSpec::flag(VERBOSE, "-v"))
            .with(OptionSpec::value(
                INTERVAL,
                "ServerAliveInterval",
                ValueType::Int,
            ))
            .with(
                OptionSpec::value(CONNECT_TIMEOUT, "ConnectTimeout", ValueType::Int)
                    .with_aliases(&["timeout"]),
            )
            .with(OptionSpec::value(
                HOST_CHECK,
                "StrictHostKeyChecking",
                ValueType::Str,
            ))
            .with(OptionSpec::value(BATCH_MODE, "BatchMode", ValueType::Bool))
            .with(OptionSpec::value(
                EXIT_ON_FORWARD_FAILURE,
                "ExitOnForwardFailure",
                ValueType::Bool,
            ))
            .with(OptionSpec::forward(FORWARD_LOCAL, Direction::Local))
            .with(OptionSpec::forward(FORWARD_REMOTE, Direction::Remote)),
    )
});

/// The options understood by `ssh`, in command-line order
pub fn ssh_registry() -> Arc<OptionRegistry> {
    Arc::clone(&SSH_REGISTRY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = OptionRegistry::new();
        registry
            .register(OptionSpec::flag(VERBOSE, "-v"))
            .register(OptionSpec::value(BATCH_MODE, "BatchMode", ValueType::Bool))
            .register(OptionSpec::flag(VERBOSE, "-v"));

        let names: Vec<&str> = registry.iter().map(|spec| spec.name).collect();
        assert_eq!(names, vec![VERBOSE, BATCH_MODE]);
    }

    #[test]
    fn test_ssh_registry_order() {
        let names: Vec<&str> = ssh_registry().iter().map(|spec| spec.name).collect();
        assert_eq!(
            names,
            vec![
                NO_REMOTE_COMMAND,
                VERBOSE,
                INTERVAL,
                CONNECT_TIMEOUT,
                HOST_CHECK,
                BATCH_MODE,
                EXIT_ON_FORWARD_FAILURE,
                FORWARD_LOCAL,
                FORWARD_REMOTE,
            ]
        );
    }

    #[test]
    fn test_find_by_alias_and_keyword() {
        let registry = ssh_registry();
        assert_eq!(registry.find("timeout").unwrap().name, CONNECT_TIMEOUT);
        assert_eq!(registry.find("connecttimeout").unwrap().name, CONNECT_TIMEOUT);
        assert_eq!(registry.find("BatchMode").unwrap().name, BATCH_MODE);
        assert!(registry.find("compression").is_none());
    }

    #[test]
    fn test_flag_arguments() {
        let spec = OptionSpec::flag(VERBOSE, "-v");
        assert!(spec.arguments(None).unwrap().is_empty());
        assert!(spec.arguments(Some(&false.into())).unwrap().is_empty());
        assert_eq!(spec.arguments(Some(&true.into())).unwrap(), vec!["-v"]);
    }

    #[test]
    fn test_value_arguments() {
        let batch = OptionSpec::value(BATCH_MODE, "BatchMode", ValueType::Bool);
        assert_eq!(
            batch.arguments(Some(&false.into())).unwrap(),
            vec!["-o", "BatchMode no"]
        );

        let interval = OptionSpec::value(INTERVAL, "ServerAliveInterval", ValueType::Int);
        assert_eq!(
            interval.arguments(Some(&OptionValue::Int(5))).unwrap(),
            vec!["-o", "ServerAliveInterval 5"]
        );

        let host_check = OptionSpec::value(HOST_CHECK, "StrictHostKeyChecking", ValueType::Str);
        assert_eq!(
            host_check.arguments(Some(&"accept-new".into())).unwrap(),
            vec!["-o", "StrictHostKeyChecking accept-new"]
        );
    }

    #[test]
    fn test_mismatched_value_is_unsupported() {
        let interval = OptionSpec::value(INTERVAL, "ServerAliveInterval", ValueType::Int);
        let err = interval.arguments(Some(&"often".into())).unwrap_err();
        assert!(matches!(err, TetherError::UnsupportedType { .. }));

        let flag = OptionSpec::flag(VERBOSE, "-v");
        assert!(flag.arguments(Some(&OptionValue::Int(1))).is_err());
    }

    #[test]
    fn test_forward_arguments_skip_repeats() {
        let spec = OptionSpec::forward(FORWARD_LOCAL, Direction::Local);
        let rules = vec![
            ForwardingRule::new(10, 20),
            ForwardingRule::new(10, 20),
            ForwardingRule::new(30, 40),
        ];
        assert_eq!(
            spec.arguments(Some(&rules.into())).unwrap(),
            vec!["-L", "10:localhost:20", "-L", "30:localhost:40"]
        );
    }

    #[test]
    fn test_parse_value() {
        let batch = OptionSpec::value(BATCH_MODE, "BatchMode", ValueType::Bool);
        assert_eq!(batch.parse_value("yes").unwrap(), OptionValue::Bool(true));
        assert_eq!(batch.parse_value("Off").unwrap(), OptionValue::Bool(false));
        assert!(matches!(
            batch.parse_value("maybe"),
            Err(TetherError::InvalidValue { .. })
        ));

        let timeout = OptionSpec::value(CONNECT_TIMEOUT, "ConnectTimeout", ValueType::Int);
        assert_eq!(timeout.parse_value(" 10 ").unwrap(), OptionValue::Int(10));
        assert!(timeout.parse_value("ten").is_err());

        let forward = OptionSpec::forward(FORWARD_LOCAL, Direction::Local);
        assert_eq!(
            forward.parse_value("80:90").unwrap(),
            OptionValue::Rules(vec![ForwardingRule::new(80, 90)])
        );
    }
}
