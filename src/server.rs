//! Lifecycle management for the external evaluation server.
//!
//! `ServerLifecycle` owns the backend process handle and a small state
//! machine (`stopped → starting → running | error`). Process creation is
//! delegated to a [`ProcessLauncher`] so hosts can substitute their own
//! terminal integration and tests can run without spawning anything.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::sinks::{OutputSink, StatusSink};

/// Interval between exit checks after the server is asked to stop
/// (ten checks before it is killed).
const GRACE_POLL_MS: u64 = 50;

/// Backend process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Error => "error",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while launching the backend.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No program was configured.
    #[error("No server command configured")]
    EmptyCommand,

    /// The OS refused to spawn the process.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process started but a stdio pipe was not available.
    #[error("Failed to capture {0} of server process")]
    MissingPipe(&'static str),
}

/// Program and arguments used to start the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// A running backend owned by `ServerLifecycle`.
pub trait ProcessHandle: Send {
    /// Check whether the process is still alive.
    fn is_alive(&mut self) -> bool;

    /// Stop the process. Must be safe to call on an already exited process.
    fn terminate(&mut self);
}

/// Trait for starting the backend.
///
/// This trait abstracts process creation to enable:
/// - Hosts that launch the server inside their own terminal
/// - Testing without spawning real processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        command: &ServerCommand,
        output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// Owns the backend process and tracks its state.
pub struct ServerLifecycle {
    launcher: Box<dyn ProcessLauncher>,
    command: ServerCommand,
    output: Arc<dyn OutputSink>,
    status: Option<Arc<dyn StatusSink>>,
    handle: Option<Box<dyn ProcessHandle>>,
    state: ServerState,
}

impl ServerLifecycle {
    pub fn new(
        launcher: Box<dyn ProcessLauncher>,
        command: ServerCommand,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            launcher,
            command,
            output,
            status: None,
            handle: None,
            state: ServerState::Stopped,
        }
    }

    /// Report every state change to `status`.
    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    /// Start the backend.
    ///
    /// Returns `true` immediately if a live process is already held. Launch
    /// failures leave the lifecycle in `ServerState::Error` and return `false`.
    pub fn start(&mut self) -> bool {
        if let Some(handle) = self.handle.as_mut() {
            if handle.is_alive() {
                debug!("Server already running");
                return true;
            }
            warn!("Server process exited; relaunching");
            self.handle = None;
        }

        self.set_state(ServerState::Starting);
        info!("Starting evaluation server: {}", self.command.program);

        match self.launcher.launch(&self.command, Arc::clone(&self.output)) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.set_state(ServerState::Running);
                true
            }
            Err(e) => {
                error!("Failed to start evaluation server: {}", e);
                self.set_state(ServerState::Error);
                false
            }
        }
    }

    /// Stop the backend. Safe to call when nothing is running.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            info!("Stopping evaluation server");
            handle.terminate();
        }
        self.set_state(ServerState::Stopped);
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    fn set_state(&mut self, state: ServerState) {
        if self.state == state {
            return;
        }
        debug!("Server state: {} -> {}", self.state, state);
        self.state = state;
        if let Some(status) = &self.status {
            status.show_status(&format!("server {}", state));
        }
    }
}

impl Drop for ServerLifecycle {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate();
        }
    }
}

// =============================================================================
// OS process launcher
// =============================================================================

/// Launches the backend as a child process with piped stdout/stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(
        &self,
        command: &ServerCommand,
        output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let program = command.program.trim();
        if program.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }

        let mut child = Command::new(program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Wrap first so the child is reaped if a pipe is missing.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut handle = ChildProcess { child, stdin };

        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            handle.terminate();
            return Err(LaunchError::MissingPipe("stdio"));
        };

        forward_lines("stdout", stdout, Arc::clone(&output));
        forward_lines("stderr", stderr, output);

        Ok(Box::new(handle))
    }
}

/// Spawn a reader thread that forwards each line of `stream` to `output`.
fn forward_lines<R>(name: &'static str, stream: R, output: Arc<dyn OutputSink>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => output.write_output(&line),
                Err(e) => {
                    warn!("Failed to read server {}: {}", name, e);
                    break;
                }
            }
        }
        debug!("Server {} closed", name);
    });
}

/// Child process handle with graceful-then-forced shutdown.
///
/// The server's stdin is held open for its whole life; closing it is the
/// request to exit.
struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ProcessHandle for ChildProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        // EOF on stdin asks the server to exit; give it a moment to comply.
        drop(self.stdin.take());
        for _ in 0..10 {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Server process exited: {}", status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(GRACE_POLL_MS)),
                Err(e) => {
                    warn!("Error waiting for server process: {}", e);
                    return;
                }
            }
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::sinks::TracingSink;

    struct MockHandle {
        alive: Arc<AtomicBool>,
        terminated: Arc<AtomicUsize>,
    }

    impl ProcessHandle for MockHandle {
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn terminate(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockLauncher {
        fail: bool,
        launches: Arc<AtomicUsize>,
        alive: Arc<AtomicBool>,
        terminated: Arc<AtomicUsize>,
    }

    impl ProcessLauncher for MockLauncher {
        fn launch(
            &self,
            _command: &ServerCommand,
            output: Arc<dyn OutputSink>,
        ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LaunchError::EmptyCommand);
            }
            output.write_output("server ready");
            self.alive.store(true, Ordering::SeqCst);
            Ok(Box::new(MockHandle {
                alive: Arc::clone(&self.alive),
                terminated: Arc::clone(&self.terminated),
            }))
        }
    }

    fn lifecycle(launcher: MockLauncher) -> ServerLifecycle {
        ServerLifecycle::new(
            Box::new(launcher),
            ServerCommand::new("mock-server"),
            Arc::new(TracingSink),
        )
    }

    #[test]
    fn test_starts_stopped() {
        let server = lifecycle(MockLauncher::default());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.is_running());
    }

    #[test]
    fn test_start_success() {
        let launcher = MockLauncher::default();
        let launches = Arc::clone(&launcher.launches);
        let mut server = lifecycle(launcher);

        assert!(server.start());
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.is_running());
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_twice_is_noop() {
        let launcher = MockLauncher::default();
        let launches = Arc::clone(&launcher.launches);
        let mut server = lifecycle(launcher);

        assert!(server.start());
        assert!(server.start());
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_relaunches_dead_process() {
        let launcher = MockLauncher::default();
        let launches = Arc::clone(&launcher.launches);
        let alive = Arc::clone(&launcher.alive);
        let mut server = lifecycle(launcher);

        assert!(server.start());
        alive.store(false, Ordering::SeqCst);
        assert!(server.start());
        assert_eq!(launches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_failure_sets_error() {
        let mut server = lifecycle(MockLauncher {
            fail: true,
            ..Default::default()
        });

        assert!(!server.start());
        assert_eq!(server.state(), ServerState::Error);
        assert!(!server.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let launcher = MockLauncher::default();
        let terminated = Arc::clone(&launcher.terminated);
        let mut server = lifecycle(launcher);

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);

        assert!(server.start());
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_after_error_returns_to_stopped() {
        let mut server = lifecycle(MockLauncher {
            fail: true,
            ..Default::default()
        });
        server.start();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_status_sink_sees_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let mut server = lifecycle(MockLauncher::default()).with_status_sink(Arc::new(
            move |s: &str| seen_clone.lock().unwrap().push(s.to_string()),
        ));

        server.start();
        server.stop();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["server starting", "server running", "server stopped"]
        );
    }

    #[test]
    fn test_drop_terminates_process() {
        let launcher = MockLauncher::default();
        let terminated = Arc::clone(&launcher.terminated);
        {
            let mut server = lifecycle(launcher);
            server.start();
        }
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_command_launcher_rejects_empty_command() {
        let result = CommandLauncher.launch(&ServerCommand::new("  "), Arc::new(TracingSink));
        assert!(matches!(result, Err(LaunchError::EmptyCommand)));
    }

    #[test]
    fn test_command_launcher_reports_spawn_failure() {
        let result = CommandLauncher.launch(
            &ServerCommand::new("/nonexistent/evalbridge-test-server"),
            Arc::new(TracingSink),
        );
        match result {
            Err(LaunchError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/evalbridge-test-server")
            }
            Err(other) => panic!("Expected Spawn error, got {}", other),
            Ok(_) => panic!("Expected Spawn error"),
        }
    }

    #[test]
    fn test_launch_error_display() {
        assert_eq!(
            LaunchError::EmptyCommand.to_string(),
            "No server command configured"
        );
        assert_eq!(
            LaunchError::MissingPipe("stdout").to_string(),
            "Failed to capture stdout of server process"
        );
    }
}
