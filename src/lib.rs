//! tether - keep an ssh connection alive
//!
//! A Rust library and CLI tool that supervises a long-lived ssh process,
//! restarting it whenever the connection drops.
//!
//! # Features
//!
//! - Typed ssh options rendered into a stable argument vector
//! - Local and remote port forwarding rules with duplicate detection
//! - Connection state read from ssh's own diagnostics
//! - Automatic reconnection with exponential backoff
//! - Layered settings from files and `TETHER_*` environment variables
//! - Structured logging with tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use tether::{ForwardingRule, SshCommand, SshLauncher, SupervisorOptions, TunnelManager};
//! use tether::forwarding::Direction;
//! use tether::status::StatusLine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut command = SshCommand::new();
//!     command.set("interval", 5i64)?;
//!     command.set_forwards(Direction::Local, [ForwardingRule::new(8080, 80)])?;
//!     command.set_hosts(["myserver.com"]);
//!
//!     let mut manager = TunnelManager::new(
//!         command,
//!         SshLauncher,
//!         StatusLine::stdout(),
//!         SupervisorOptions::default(),
//!     )?;
//!     manager.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod health;
pub mod logging;
pub mod manager;
pub mod options;
pub mod ssh;
pub mod ssh_config;
pub mod status;

pub use command::SshCommand;
pub use config::Settings;
pub use error::{TetherError, TetherResult};
pub use forwarding::ForwardingRule;
pub use manager::{Backoff, SupervisorOptions, TunnelManager};
pub use ssh::SshLauncher;
