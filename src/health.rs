use tracing::{debug, info};

use crate::{logging::SSH_TARGET, status::Style};

/// Prefix ssh puts on `-v` diagnostics
pub const DEBUG_PREFIX: &str = "debug1:";
/// Printed once authentication succeeds and the session is up
pub const CONNECTED_MARKER: &str = "Entering interactive session";
/// Printed when ServerAlive probes go unanswered
pub const DISCONNECTED_MARKER: &str = "not responding";

/// What one line of ssh output says about the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSignal {
    /// Nothing changed
    Continue,
    /// The session is established
    Connected,
    /// The peer stopped answering
    Disconnected,
}

/// Classify a line of ssh output
pub fn classify(line: &str) -> LineSignal {
    if line.contains(DISCONNECTED_MARKER) {
        LineSignal::Disconnected
    } else if line.contains(CONNECTED_MARKER) {
        LineSignal::Connected
    } else {
        LineSignal::Continue
    }
}

/// Log a line of ssh output to the `ssh` target and return the logged text.
///
/// Debug diagnostics lose their `debug1:` prefix and go out at DEBUG; everything
/// else goes out at INFO.
pub fn record_line(line: &str) -> &str {
    match line.strip_prefix(DEBUG_PREFIX) {
        Some(rest) => {
            let rest = rest.trim();
            debug!(target: SSH_TARGET, "{}", rest);
            rest
        }
        None => {
            info!(target: SSH_TARGET, "{}", line);
            line
        }
    }
}

/// Connection state of the supervised tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No process, or the process is going away
    Disconnected,
    /// Process launched, session not yet established
    Connecting,
    /// Session established
    Connected,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }

    pub fn style(&self) -> Style {
        match self {
            ConnectionState::Disconnected => Style::Red,
            ConnectionState::Connecting => Style::Yellow,
            ConnectionState::Connected => Style::Green,
        }
    }

    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the tunnel is down
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("Entering interactive session"),
            LineSignal::Connected
        );
        assert_eq!(
            classify("debug1: Entering interactive session."),
            LineSignal::Connected
        );
        assert_eq!(
            classify("Host example.com not responding"),
            LineSignal::Disconnected
        );
        assert_eq!(
            classify("debug1: Reading configuration"),
            LineSignal::Continue
        );
        assert_eq!(classify(""), LineSignal::Continue);
    }

    #[test]
    fn test_record_line_strips_debug_prefix() {
        assert_eq!(
            record_line("debug1: Reading configuration data"),
            "Reading configuration data"
        );
        assert_eq!(
            record_line("Warning: Permanently added host"),
            "Warning: Permanently added host"
        );
        assert_eq!(
            classify(record_line("debug1: Reading configuration data")),
            LineSignal::Continue
        );
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Disconnected.is_disconnected());
        assert!(!ConnectionState::Connected.is_disconnected());

        assert_eq!(ConnectionState::Connecting.label(), "connecting");
        assert_eq!(ConnectionState::Connected.style(), Style::Green);
    }
}
