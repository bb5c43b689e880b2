//! Reader for ssh_config-style `keyword argument` files.
//!
//! Lines starting with `#` and blank lines are comments. Keywords and arguments are
//! separated by whitespace or by a single `=`, and arguments may be wrapped in
//! double quotes.

use std::{fs::File, io::BufRead, io::BufReader, path::Path};

use crate::error::{TetherError, TetherResult};

/// One keyword/argument pair, with the keyword lower-cased
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub keyword: String,
    pub argument: String,
}

impl ConfigValue {
    pub fn new(keyword: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            argument: argument.into(),
        }
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse a single line; comments and blank lines give `None`
pub fn parse_line(line: &str) -> TetherResult<Option<ConfigValue>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let (keyword, argument) = match trimmed.split_once('=') {
        Some(pair) => pair,
        None => trimmed
            .split_once(char::is_whitespace)
            .ok_or_else(|| TetherError::Parse(format!("missing argument in {trimmed:?}")))?,
    };

    let keyword = keyword.trim();
    if keyword.is_empty() {
        return Err(TetherError::Parse(format!("missing keyword in {trimmed:?}")));
    }

    let argument = unquote(argument);
    if argument.is_empty() {
        return Err(TetherError::Parse(format!("missing argument in {trimmed:?}")));
    }

    Ok(Some(ConfigValue::new(keyword.to_lowercase(), argument)))
}

/// Parse every line of `reader`
pub fn parse_reader<R: BufRead>(reader: R) -> TetherResult<Vec<ConfigValue>> {
    let mut values = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        match parse_line(&line) {
            Ok(Some(value)) => values.push(value),
            Ok(None) => {}
            Err(e) => {
                return Err(TetherError::Parse(format!("line {}: {e}", index + 1)));
            }
        }
    }
    Ok(values)
}

/// Parse an options file from disk
pub fn parse_file<P: AsRef<Path>>(path: P) -> TetherResult<Vec<ConfigValue>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        TetherError::Config(format!("Failed to read options file {}: {e}", path.display()))
    })?;
    parse_reader(BufReader::new(file))
}
