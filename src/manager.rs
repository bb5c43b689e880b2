use std::{io::Stdout, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Instant, sleep, timeout},
};
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{
    command::SshCommand,
    error::{TetherError, TetherResult},
    health::{ConnectionState, LineSignal, classify, record_line},
    logging::RotatingFile,
    options,
    ssh::{Launcher, SshLauncher, TunnelProcess},
    status::{StatusDisplay, StatusLine, Style},
};

/// Timing knobs for the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Shortest delay between attempts
    pub backoff_floor: Duration,
    /// Longest delay between attempts
    pub backoff_max: Duration,
    /// How long to wait for output before treating the child as idle
    pub read_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Exponential backoff between attempts that failed quickly.
///
/// An attempt that outlived the current delay resets it to the floor.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, max: Duration) -> Self {
        Self {
            floor,
            max: max.max(floor),
            current: floor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record how long an attempt ran and return how long to wait before the next
    pub fn record(&mut self, elapsed: Duration) -> Option<Duration> {
        if elapsed < self.current {
            let delay = self.current - elapsed;
            self.current = self.current.saturating_mul(2).min(self.max);
            Some(delay)
        } else {
            self.current = self.floor;
            None
        }
    }
}

/// Keeps one ssh tunnel alive, restarting it whenever it exits
pub struct TunnelManager<L: Launcher = SshLauncher, D: StatusDisplay = StatusLine<Stdout>> {
    command: SshCommand,
    launcher: L,
    display: D,
    backoff: Backoff,
    read_timeout: Duration,
    state: ConnectionState,
    ssh_log: Option<Arc<RotatingFile>>,
    /// Span of the attempt in flight, taken when it ends
    attempt: Option<Span>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl<L: Launcher, D: StatusDisplay> TunnelManager<L, D> {
    /// Create a new tunnel manager.
    ///
    /// Verbose output is forced on, since connection state is read from ssh's
    /// debug messages.
    pub fn new(
        mut command: SshCommand,
        launcher: L,
        display: D,
        options: SupervisorOptions,
    ) -> TetherResult<Self> {
        command.set(options::VERBOSE, true)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            command,
            launcher,
            display,
            backoff: Backoff::new(options.backoff_floor, options.backoff_max),
            read_timeout: options.read_timeout,
            state: ConnectionState::Disconnected,
            ssh_log: None,
            attempt: None,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        })
    }

    /// Rotate `log` after every attempt
    pub fn with_ssh_log(mut self, log: Arc<RotatingFile>) -> Self {
        self.ssh_log = Some(log);
        self
    }

    /// Sender that stops [`TunnelManager::run`]
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn command(&self) -> &SshCommand {
        &self.command
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run attempts until a shutdown signal arrives or an attempt fails
    pub async fn run(&mut self) -> TetherResult<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| TetherError::Other("tunnel manager is already running".to_string()))?;

        info!("Starting tunnel manager");
        self.display.enter();

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!("Received shutdown signal");
                    self.end_cancelled_attempt();
                    break Ok(());
                }
                result = self.run_with_backoff() => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown_rx = Some(shutdown_rx);
        self.set_state(ConnectionState::Disconnected);
        self.display.exit();
        info!("Tunnel manager stopped");
        result
    }

    async fn run_with_backoff(&mut self) -> TetherResult<()> {
        let started = Instant::now();
        self.run_once().await?;
        if let Some(delay) = self.backoff.record(started.elapsed()) {
            debug!("Restarting in {:?}", delay);
            sleep(delay).await;
        }
        Ok(())
    }

    /// Launch ssh once and supervise it until it exits
    pub async fn run_once(&mut self) -> TetherResult<()> {
        let args = self.command.arguments()?;
        let mut process = self.launcher.launch(&args)?;

        let span = info_span!("attempt", pid = process.id().unwrap_or_default());
        self.attempt = Some(span.clone());
        span.in_scope(|| {
            info!("Started {}", self.command.program());
            debug!("Command: {}", args.join(" "));
            self.set_state(ConnectionState::Connecting);
        });

        let result = self.supervise(&mut process).instrument(span.clone()).await;

        span.in_scope(|| {
            if process.exit_code().is_none()
                && let Err(e) = process.terminate()
            {
                warn!("Failed to terminate ssh: {}", e);
            }
            self.set_state(ConnectionState::Disconnected);
            debug!("Ended");
        });
        self.attempt = None;
        result
    }

    /// Finish the bookkeeping of an attempt whose future was dropped mid-run.
    ///
    /// The process itself is dropped with the future, which terminates it.
    fn end_cancelled_attempt(&mut self) {
        let Some(span) = self.attempt.take() else {
            return;
        };
        span.in_scope(|| {
            self.set_state(ConnectionState::Disconnected);
            info!("Stopped by shutdown");
            debug!("Ended");
            self.rotate_ssh_log();
        });
    }

    async fn supervise(&mut self, process: &mut L::Process) -> TetherResult<()> {
        loop {
            match timeout(self.read_timeout, process.next_line()).await {
                Ok(line) => match line? {
                    Some(line) => self.handle_line(process, &line)?,
                    None => break,
                },
                Err(_) => {
                    self.on_read_timeout();
                    if process.try_wait()?.is_some() {
                        break;
                    }
                }
            }
        }

        let code = process.wait().await?;
        debug!("ssh exited with code {}", code);
        self.set_state(ConnectionState::Disconnected);
        self.rotate_ssh_log();
        Ok(())
    }

    fn handle_line(&mut self, process: &mut L::Process, line: &str) -> TetherResult<()> {
        let text = record_line(line);
        match classify(text) {
            LineSignal::Connected if self.state == ConnectionState::Connecting => {
                self.set_state(ConnectionState::Connected);
            }
            LineSignal::Disconnected if !self.state.is_disconnected() => {
                warn!("Connection lost: {}", text);
                process.kill()?;
                self.set_state(ConnectionState::Disconnected);
            }
            _ => {}
        }
        self.display.message(text, Style::Plain);
        Ok(())
    }

    /// Called when ssh has been quiet for a full read timeout
    fn on_read_timeout(&mut self) {
        self.display.message("", Style::Plain);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Tunnel is {}", state.label());
        self.state = state;
        self.display.status(state.label(), state.style());
    }

    fn rotate_ssh_log(&self) {
        if let Some(log) = &self.ssh_log
            && let Err(e) = log.rotate()
        {
            warn!("Failed to rotate {}: {}", log.path().display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Events(Arc<Mutex<Vec<String>>>);

    impl Events {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }

        fn all(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, event: &str) -> usize {
            self.all().iter().filter(|e| *e == event).count()
        }

        fn statuses(&self) -> Vec<String> {
            self.all()
                .into_iter()
                .filter_map(|e| e.strip_prefix("status:").map(str::to_string))
                .collect()
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Line(&'static str),
        Hang,
        Fail,
    }

    struct Script {
        steps: Vec<Step>,
        running_polls: usize,
    }

    impl Script {
        fn lines(steps: Vec<Step>) -> Self {
            Self {
                steps,
                running_polls: 0,
            }
        }
    }

    struct FakeProcess {
        steps: VecDeque<Step>,
        running_polls: usize,
        killed: bool,
        exit_code: Option<i32>,
        events: Events,
    }

    impl TunnelProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn next_line(&mut self) -> io::Result<Option<String>> {
            if let Some(Step::Hang) = self.steps.front() {
                std::future::pending::<()>().await;
            }
            match self.steps.pop_front() {
                Some(Step::Line(line)) => Ok(Some(line.to_string())),
                Some(Step::Fail) => Err(io::Error::other("broken pipe")),
                Some(Step::Hang) | None => Ok(None),
            }
        }

        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            if self.exit_code.is_none() {
                if self.running_polls > 0 {
                    self.running_polls -= 1;
                } else {
                    self.exit_code = Some(0);
                }
            }
            Ok(self.exit_code)
        }

        async fn wait(&mut self) -> io::Result<i32> {
            let code = *self
                .exit_code
                .get_or_insert(if self.killed { -9 } else { 0 });
            Ok(code)
        }

        fn kill(&mut self) -> io::Result<()> {
            self.events.push("kill");
            self.killed = true;
            Ok(())
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.events.push("terminate");
            Ok(())
        }

        fn exit_code(&self) -> Option<i32> {
            self.exit_code
        }
    }

    impl Drop for FakeProcess {
        fn drop(&mut self) {
            self.events.push("dropped");
        }
    }

    struct FakeLauncher {
        scripts: Mutex<VecDeque<Script>>,
        events: Events,
    }

    impl Launcher for FakeLauncher {
        type Process = FakeProcess;

        fn launch(&self, args: &[String]) -> TetherResult<FakeProcess> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TetherError::Launch("no more scripts".to_string()))?;
            self.events.push(format!("launch:{}", args.join(" ")));
            Ok(FakeProcess {
                steps: script.steps.into(),
                running_polls: script.running_polls,
                killed: false,
                exit_code: None,
                events: self.events.clone(),
            })
        }
    }

    struct FakeDisplay {
        events: Events,
    }

    impl StatusDisplay for FakeDisplay {
        fn status(&mut self, text: &str, _style: Style) {
            self.events.push(format!("status:{text}"));
        }

        fn message(&mut self, text: &str, _style: Style) {
            self.events.push(format!("message:{text}"));
        }

        fn enter(&mut self) {
            self.events.push("enter");
        }

        fn exit(&mut self) {
            self.events.push("exit");
        }
    }

    fn manager(scripts: Vec<Script>) -> (TunnelManager<FakeLauncher, FakeDisplay>, Events) {
        let events = Events::default();
        let mut command = SshCommand::new();
        command.set_hosts(["host.example.com"]);

        let launcher = FakeLauncher {
            scripts: Mutex::new(scripts.into()),
            events: events.clone(),
        };
        let display = FakeDisplay {
            events: events.clone(),
        };
        let options = SupervisorOptions {
            backoff_floor: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            read_timeout: Duration::from_millis(10),
        };
        let manager = TunnelManager::new(command, launcher, display, options).unwrap();
        (manager, events)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        let quick = Duration::from_millis(10);

        assert_eq!(backoff.record(quick), Some(Duration::from_millis(90)));
        assert_eq!(backoff.current(), Duration::from_millis(200));
        assert_eq!(backoff.record(quick), Some(Duration::from_millis(190)));
        assert_eq!(backoff.record(quick), Some(Duration::from_millis(390)));
        assert_eq!(backoff.record(quick), Some(Duration::from_millis(790)));
        assert_eq!(backoff.record(quick), Some(Duration::from_millis(1590)));
        assert_eq!(backoff.current(), Duration::from_secs(2));
        assert_eq!(backoff.record(quick), Some(Duration::from_millis(1990)));
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_resets_after_long_attempt() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        backoff.record(Duration::ZERO);
        backoff.record(Duration::ZERO);
        assert_eq!(backoff.current(), Duration::from_millis(400));

        assert_eq!(backoff.record(Duration::from_secs(60)), None);
        assert_eq!(backoff.current(), Duration::from_millis(100));
        assert_eq!(
            backoff.record(Duration::from_millis(100)),
            None,
            "an attempt as long as the delay needs no wait"
        );
    }

    #[test]
    fn test_new_forces_verbose() {
        let (manager, _) = manager(Vec::new());
        assert_eq!(
            manager.command().get_bool(options::VERBOSE).unwrap(),
            Some(true)
        );
        assert!(manager.state().is_disconnected());
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let (mut manager, events) = manager(vec![Script::lines(vec![
            Step::Line("Entering interactive session"),
            Step::Line("debug1: x"),
            Step::Line("Host y not responding"),
        ])]);

        manager.run_once().await.unwrap();

        assert_eq!(
            events.statuses(),
            vec!["connecting", "connected", "disconnected"]
        );
        assert_eq!(events.count("kill"), 1);
        assert_eq!(events.count("terminate"), 0);

        let all = events.all();
        let kill = all.iter().position(|e| e == "kill").unwrap();
        let disconnected = all.iter().position(|e| e == "status:disconnected").unwrap();
        assert!(kill < disconnected);

        assert_eq!(all[0], "launch:ssh -v host.example.com");
        assert!(all.contains(&"message:x".to_string()));
        assert!(all.contains(&"message:Host y not responding".to_string()));
    }

    #[tokio::test]
    async fn test_quiet_child_is_polled_not_killed() {
        let (mut manager, events) = manager(vec![Script {
            steps: vec![Step::Line("Entering interactive session"), Step::Hang],
            running_polls: 2,
        }]);

        manager.run_once().await.unwrap();

        assert_eq!(
            events.statuses(),
            vec!["connecting", "connected", "disconnected"]
        );
        assert_eq!(events.count("message:"), 3);
        assert_eq!(events.count("kill"), 0);
        assert_eq!(events.count("terminate"), 0);
    }

    #[tokio::test]
    async fn test_read_error_cleans_up_and_propagates() {
        let (mut manager, events) = manager(vec![Script::lines(vec![
            Step::Line("debug1: Reading configuration data"),
            Step::Fail,
        ])]);

        let err = manager.run_once().await.unwrap_err();
        assert!(matches!(err, TetherError::Io(_)));

        assert_eq!(events.count("terminate"), 1);
        assert_eq!(events.statuses(), vec!["connecting", "disconnected"]);
        assert!(manager.state().is_disconnected());
    }

    #[tokio::test]
    async fn test_run_restarts_until_launch_fails() {
        let (mut manager, events) = manager(vec![
            Script::lines(vec![Step::Line("Entering interactive session")]),
            Script::lines(vec![Step::Line("Host y not responding")]),
        ]);

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, TetherError::Launch(_)));

        assert_eq!(
            events.statuses(),
            vec![
                "connecting",
                "connected",
                "disconnected",
                "connecting",
                "disconnected"
            ]
        );
        let all = events.all();
        assert_eq!(all.first().map(String::as_str), Some("enter"));
        assert_eq!(all.last().map(String::as_str), Some("exit"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_attempt() {
        let (mut manager, events) = manager(vec![Script {
            steps: vec![Step::Line("Entering interactive session"), Step::Hang],
            running_polls: usize::MAX,
        }]);

        let shutdown = manager.shutdown_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            shutdown.send(()).await.unwrap();
        });

        manager.run().await.unwrap();

        assert_eq!(
            events.statuses(),
            vec!["connecting", "connected", "disconnected"]
        );
        let all = events.all();
        let dropped = all.iter().position(|e| e == "dropped").unwrap();
        let disconnected = all.iter().position(|e| e == "status:disconnected").unwrap();
        assert!(dropped < disconnected);
        assert_eq!(all.last().map(String::as_str), Some("exit"));
        assert!(manager.state().is_disconnected());
    }

    #[tokio::test]
    async fn test_rotates_ssh_log_after_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RotatingFile::create(dir.path().join("ssh.log"), 0, 2).unwrap());
        let (manager, _) = manager(vec![Script::lines(vec![Step::Line("bye")])]);
        let mut manager = manager.with_ssh_log(Arc::clone(&log));

        manager.run_once().await.unwrap();
        assert!(log.backup_path(1).exists());
    }

    #[tokio::test]
    async fn test_shutdown_rotates_ssh_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RotatingFile::create(dir.path().join("ssh.log"), 0, 2).unwrap());
        let (manager, events) = manager(vec![Script {
            steps: vec![Step::Line("Entering interactive session"), Step::Hang],
            running_polls: usize::MAX,
        }]);
        let mut manager = manager.with_ssh_log(Arc::clone(&log));

        let shutdown = manager.shutdown_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            shutdown.send(()).await.unwrap();
        });
        manager.run().await.unwrap();

        assert!(log.backup_path(1).exists());
        assert!(!log.backup_path(2).exists(), "rotated once per attempt");
        assert_eq!(events.count("status:disconnected"), 1);
        assert!(manager.attempt.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_between_attempts_skips_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RotatingFile::create(dir.path().join("ssh.log"), 0, 2).unwrap());
        let (manager, _) = manager(Vec::new());
        let mut manager = manager.with_ssh_log(Arc::clone(&log));

        manager.shutdown_handle().send(()).await.unwrap();
        manager.run().await.unwrap();

        assert!(!log.backup_path(1).exists());
    }
}
