use std::{collections::HashMap, fmt, str::FromStr};

use crate::error::{TetherError, TetherResult};

/// Direction of a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Listen locally, connect from the remote side (`-L`)
    Local,
    /// Listen remotely, connect from the local side (`-R`)
    Remote,
}

impl Direction {
    /// Convert to SSH flag string
    pub fn to_ssh_flag(&self) -> &'static str {
        match self {
            Direction::Local => "-L",
            Direction::Remote => "-R",
        }
    }
}

/// A source/destination port mapping rendered as a tunnel directive
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardingRule {
    source_port: u16,
    source_host: Option<String>,
    destination_port: u16,
    destination_host: String,
}

impl ForwardingRule {
    /// Forward `source_port` to `destination_port` on `localhost`
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        Self {
            source_port,
            source_host: None,
            destination_port,
            destination_host: "localhost".to_string(),
        }
    }

    /// Set the bind address for the listening side. An empty host means local.
    pub fn with_source_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.source_host = (!host.is_empty()).then_some(host);
        self
    }

    pub fn with_destination_host(mut self, host: impl Into<String>) -> Self {
        self.destination_host = host.into();
        self
    }

    /// Parse a forwarding specification
    ///
    /// Supported formats:
    /// - "port" (e.g., "8888", same port on both sides)
    /// - "src,dst" (e.g., "8080,80")
    /// - "src:dst" (e.g., "8080:80")
    /// - "src:host:dst" (e.g., "8080:db.internal:5432")
    /// - "srchost:src:host:dst" (e.g., "0.0.0.0:8080:db.internal:5432")
    ///
    /// Colon fields are split at most four times, so extra colons end up in the
    /// last port field and fail to parse.
    pub fn parse(spec: &str) -> TetherResult<Self> {
        let invalid = |reason: String| TetherError::InvalidForwarding {
            input: spec.to_string(),
            reason,
        };
        let port = |field: &str| {
            field
                .trim()
                .parse::<u16>()
                .map_err(|_| invalid(format!("invalid port {field:?}")))
        };

        if let Some((src, dst)) = spec.split_once(',') {
            return Ok(Self::new(port(src)?, port(dst)?));
        }

        if spec.contains(':') {
            let parts: Vec<&str> = spec.splitn(4, ':').collect();
            let rule = match parts.as_slice() {
                [src, dst] => Self::new(port(src)?, port(dst)?),
                [src, host, dst] => {
                    Self::new(port(src)?, port(dst)?).with_destination_host(*host)
                }
                [src_host, src, host, dst] => Self::new(port(src)?, port(dst)?)
                    .with_source_host(*src_host)
                    .with_destination_host(*host),
                _ => return Err(invalid("expected at most four fields".to_string())),
            };
            if rule.destination_host.is_empty() {
                return Err(invalid("empty destination host".to_string()));
            }
            return Ok(rule);
        }

        let p = port(spec)?;
        Ok(Self::new(p, p))
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn source_host(&self) -> Option<&str> {
        self.source_host.as_deref()
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn destination_host(&self) -> &str {
        &self.destination_host
    }

    /// The listening half, `[host:]port`
    pub fn source(&self) -> String {
        match &self.source_host {
            Some(host) => format!("{}:{}", host, self.source_port),
            None => self.source_port.to_string(),
        }
    }

    /// The connecting half, `host:port`
    pub fn destination(&self) -> String {
        format!("{}:{}", self.destination_host, self.destination_port)
    }

    /// Convert to the two SSH tokens for this rule, e.g. `["-L", "80:localhost:90"]`
    pub fn to_argument_tokens(&self, direction: Direction) -> [String; 2] {
        [direction.to_ssh_flag().to_string(), self.to_string()]
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source(), self.destination())
    }
}

impl FromStr for ForwardingRule {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<u16> for ForwardingRule {
    fn from(port: u16) -> Self {
        Self::new(port, port)
    }
}

impl From<(u16, u16)> for ForwardingRule {
    fn from((source, destination): (u16, u16)) -> Self {
        Self::new(source, destination)
    }
}

impl TryFrom<&[u16]> for ForwardingRule {
    type Error = TetherError;

    fn try_from(ports: &[u16]) -> Result<Self, Self::Error> {
        match ports {
            [port] => Ok(Self::from(*port)),
            [source, destination] => Ok(Self::new(*source, *destination)),
            _ => Err(TetherError::InvalidForwarding {
                input: format!("{ports:?}"),
                reason: "expected one or two ports".to_string(),
            }),
        }
    }
}

/// Drop repeated port pairs and reject conflicting local ports.
///
/// Order of first occurrence is preserved. A source port that shows up again with a
/// different destination port is an error; an exact repeat is skipped.
pub fn deduplicate<I>(rules: I) -> TetherResult<Vec<ForwardingRule>>
where
    I: IntoIterator<Item = ForwardingRule>,
{
    let mut assigned: HashMap<u16, u16> = HashMap::new();
    let mut kept = Vec::new();

    for rule in rules {
        match assigned.get(&rule.source_port) {
            Some(&destination) if destination != rule.destination_port => {
                return Err(TetherError::DuplicatePort {
                    port: rule.source_port,
                    requested: rule.destination_port,
                    assigned: destination,
                });
            }
            Some(_) => continue,
            None => {
                assigned.insert(rule.source_port, rule.destination_port);
                kept.push(rule);
            }
        }
    }

    Ok(kept)
}
