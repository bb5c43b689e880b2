use tether::{
    Settings, SshLauncher, TunnelManager,
    cli::{Action, Invocation, build_cli, forward_listing},
    logging::{default_log_dir, init_logging},
    ssh::run_command,
    status::StatusLine,
};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let matches = build_cli().get_matches();
    let invocation = Invocation::from_matches(&matches)?;

    let mut settings = Settings::load(invocation.config.as_deref())?;
    invocation.apply(&mut settings);
    settings.validate()?;
    if settings.hosts.is_empty() {
        eyre::bail!("No host given");
    }

    let command = invocation.command(&settings)?;
    if invocation.debug_json {
        println!("{}", serde_json::to_string(&command.arguments()?)?);
        return Ok(());
    }

    let log_dir = settings.log_dir.clone().unwrap_or_else(default_log_dir);
    let ssh_log = init_logging(invocation.verbosity, &log_dir)?;
    info!("Logging to {}", log_dir.display());

    match &invocation.action {
        Action::Check => {
            let once = command.single_command(["true"])?;
            let code = run_command(&once.arguments()?).await?;
            if code != 0 {
                eyre::bail!("ssh exited with code {code}");
            }
            println!("Connection OK");
            return Ok(());
        }
        Action::Forward { direction, rules } => {
            println!("Forwarding ports:");
            for line in forward_listing(*direction, rules) {
                println!("{line}");
            }
        }
        Action::Run => {}
    }

    let mut manager = TunnelManager::new(
        command,
        SshLauncher,
        StatusLine::stdout(),
        settings.supervisor_options(),
    )?
    .with_ssh_log(ssh_log);

    let shutdown = manager.shutdown_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                let _ = shutdown.send(()).await;
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    println!("^C to exit");
    manager.run().await?;
    println!("Done");
    Ok(())
}
