//! A single replaceable status line on the operator's terminal.

use std::{
    io::{self, IsTerminal, Stdout, Write},
    time::{Duration, Instant},
};

use owo_colors::OwoColorize;
use tracing::debug;

/// Carriage return, clear to end of line, disable line wrap
const BEGIN_LINE: &str = "\r\x1b[K\x1b[?7l";
/// Re-enable line wrap
const END_LINE: &str = "\x1b[?7h";
const CLEAR_TO_EOL: &str = "\x1b[K";

/// Text styles understood by status displays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Plain,
    Red,
    Yellow,
    Green,
}

impl Style {
    fn paint(&self, text: &str) -> String {
        match self {
            Style::Plain => text.to_string(),
            Style::Red => text.red().to_string(),
            Style::Yellow => text.yellow().to_string(),
            Style::Green => text.green().to_string(),
        }
    }
}

/// Receiver of connection status and the latest output line.
///
/// `enter` and `exit` bracket the display's lifetime; `exit` must leave the
/// terminal clean.
pub trait StatusDisplay {
    fn status(&mut self, text: &str, style: Style);
    fn message(&mut self, text: &str, style: Style);
    fn enter(&mut self) {}
    fn exit(&mut self) {}
}

/// Format a duration as `H:MM:SS`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Renders `[status] H:MM:SS | message` in place on a terminal
pub struct StatusLine<W: Write> {
    out: W,
    enabled: bool,
    active: bool,
    status: String,
    message: String,
    changed: Instant,
    last: String,
}

impl StatusLine<Stdout> {
    /// A status line on stdout, enabled only when stdout is a capable terminal
    pub fn stdout() -> Self {
        let stdout = io::stdout();
        let dumb = std::env::var("TERM").is_ok_and(|term| term == "dumb");
        let enabled = stdout.is_terminal() && !dumb;
        Self::new(stdout, enabled)
    }
}

impl<W: Write> StatusLine<W> {
    pub fn new(out: W, enabled: bool) -> Self {
        Self {
            out,
            enabled,
            active: false,
            status: String::new(),
            message: String::new(),
            changed: Instant::now(),
            last: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The underlying writer
    pub fn get_ref(&self) -> &W {
        &self.out
    }

    fn build(&self) -> String {
        format!(
            "[{}] {} | {}",
            self.status,
            format_elapsed(self.changed.elapsed()),
            self.message
        )
    }

    fn update(&mut self) {
        if !self.enabled {
            return;
        }
        let line = self.build();
        if line == self.last {
            return;
        }
        if let Err(e) = write!(self.out, "{BEGIN_LINE}{line}{END_LINE}").and_then(|_| self.out.flush())
        {
            debug!("Failed to draw status line: {}", e);
        }
        self.last = line;
    }
}

impl<W: Write> StatusDisplay for StatusLine<W> {
    fn status(&mut self, text: &str, style: Style) {
        self.status = style.paint(text);
        self.update();
        self.changed = Instant::now();
    }

    fn message(&mut self, text: &str, style: Style) {
        self.message = style.paint(text);
        self.update();
    }

    fn enter(&mut self) {
        self.active = true;
        self.last.clear();
        self.update();
    }

    fn exit(&mut self) {
        if !std::mem::take(&mut self.active) || !self.enabled {
            return;
        }
        if let Err(e) = write!(self.out, "{CLEAR_TO_EOL}").and_then(|_| self.out.flush()) {
            debug!("Failed to clear status line: {}", e);
        }
    }
}

impl<W: Write> Drop for StatusLine<W> {
    fn drop(&mut self) {
        self.exit();
    }
}
