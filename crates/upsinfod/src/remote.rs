//! Remote Shell Abstraction
//!
//! The poller only needs three things from SSH: open a session, run one
//! command, and let go of the session. This module puts those behind a trait
//! so the refresh cycle can be exercised without a NAS.
//!
//! ## Usage
//!
//! Production code uses `RusshShell`, which speaks SSH through `russh` with
//! password authentication. Test code uses `FakeRemoteShell` with scripted
//! responses.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::config::UpsConfig;
use crate::errors::PollError;

// ============================================================================
// Remote Shell Traits
// ============================================================================

/// Where and as whom to connect
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SshTarget {
    /// Target from accessory options. Fails only when no host is set.
    pub fn from_config(config: &UpsConfig) -> Result<Self, PollError> {
        let host = config.host.clone().ok_or(PollError::MissingHost)?;
        Ok(Self {
            host,
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Absent when the server closed the channel without reporting one
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn stdout(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: Some(0),
        }
    }

    pub fn stderr(stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_status: Some(1),
        }
    }
}

/// Opens sessions
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, PollError>;
}

/// One open session, valid for a single poll cycle
#[async_trait]
pub trait RemoteSession: Send {
    async fn execute_command(&mut self, command: &str) -> Result<CommandOutput, PollError>;

    /// Release the session. Dropping without calling this also releases it.
    async fn dispose(self: Box<Self>) -> Result<(), PollError>;
}

// ============================================================================
// russh implementation (Production)
// ============================================================================

/// SSH extended data stream carrying stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Client event handler. Host keys are not pinned.
struct AcceptingHandler;

#[async_trait]
impl russh::client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Accepting {} host key", server_public_key.name());
        Ok(true)
    }
}

/// SSH client over `russh`
#[derive(Clone)]
pub struct RusshShell {
    config: Arc<russh::client::Config>,
}

impl RusshShell {
    pub fn new() -> Self {
        Self {
            config: Arc::new(russh::client::Config::default()),
        }
    }
}

impl Default for RusshShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, PollError> {
        debug!("Connecting to {:?}", target);
        let mut handle = russh::client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            AcceptingHandler,
        )
        .await?;

        let authenticated = match handle
            .authenticate_password(target.username.clone(), target.password.clone())
            .await
        {
            Ok(authenticated) => authenticated,
            Err(e) => {
                release(&handle).await;
                return Err(e.into());
            }
        };
        if !authenticated {
            release(&handle).await;
            return Err(PollError::Authentication(target.username.clone()));
        }

        Ok(Box::new(RusshSession { handle }))
    }
}

/// Best-effort disconnect of a handle that never became a session
async fn release(handle: &russh::client::Handle<AcceptingHandler>) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "English")
        .await
    {
        debug!("Ignoring disconnect error after failed login: {}", e);
    }
}

struct RusshSession {
    handle: russh::client::Handle<AcceptingHandler>,
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn execute_command(&mut self, command: &str) -> Result<CommandOutput, PollError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| PollError::Execution(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| PollError::Execution(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                russh::ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    stderr.extend_from_slice(data)
                }
                russh::ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn dispose(self: Box<Self>) -> Result<(), PollError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

// ============================================================================
// Fake implementation (Tests)
// ============================================================================

/// Scripted outcome of one connect + execute
#[derive(Debug, Clone)]
pub enum FakeResponse {
    Output(CommandOutput),
    /// Fails before any handle exists
    ConnectError(String),
    /// Handshake completes, the password is refused
    AuthRejected,
    /// Handshake completes, the transport fails during login
    AuthError(String),
    ExecError(String),
}

impl FakeResponse {
    pub fn stdout(stdout: &str) -> Self {
        FakeResponse::Output(CommandOutput::stdout(stdout))
    }

    pub fn stderr(stderr: &str) -> Self {
        FakeResponse::Output(CommandOutput::stderr(stderr))
    }
}

#[derive(Debug, Default)]
struct FakeCounters {
    connects: AtomicUsize,
    executions: AtomicUsize,
    disposals: AtomicUsize,
    releases: AtomicUsize,
}

/// Remote shell that replays scripted responses in order.
///
/// Once the script is exhausted the last response repeats. Call counters are
/// shared between clones so a test can keep a handle after giving one to a
/// poller.
#[derive(Debug, Clone)]
pub struct FakeRemoteShell {
    script: Arc<Mutex<VecDeque<FakeResponse>>>,
    last: Arc<Mutex<FakeResponse>>,
    connect_delay: Option<Duration>,
    fail_dispose: bool,
    commands: Arc<Mutex<Vec<String>>>,
    targets: Arc<Mutex<Vec<SshTarget>>>,
    counters: Arc<FakeCounters>,
}

impl FakeRemoteShell {
    /// Fake that answers every connect the same way
    pub fn new_with(response: FakeResponse) -> Self {
        FakeRemoteShellBuilder::new().response(response).build()
    }

    /// Fake that always returns `stdout`
    pub fn with_stdout(stdout: &str) -> Self {
        Self::new_with(FakeResponse::stdout(stdout))
    }

    /// Fake whose connections always fail
    pub fn unreachable(message: &str) -> Self {
        Self::new_with(FakeResponse::ConnectError(message.to_string()))
    }

    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.counters.executions.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.counters.disposals.load(Ordering::SeqCst)
    }

    /// Handles released because login failed after the handshake
    pub fn release_count(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    /// Commands in the order they were run
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn targets(&self) -> Vec<SshTarget> {
        self.targets.lock().unwrap().clone()
    }

    fn next_response(&self) -> FakeResponse {
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = script.pop_front() {
            *last = next;
        }
        last.clone()
    }
}

#[async_trait]
impl RemoteShell for FakeRemoteShell {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, PollError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.clone());

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_response() {
            FakeResponse::ConnectError(message) => Err(PollError::Connection(message)),
            FakeResponse::AuthRejected => {
                self.counters.releases.fetch_add(1, Ordering::SeqCst);
                Err(PollError::Authentication(target.username.clone()))
            }
            FakeResponse::AuthError(message) => {
                self.counters.releases.fetch_add(1, Ordering::SeqCst);
                Err(PollError::Connection(message))
            }
            response => Ok(Box::new(FakeSession {
                response,
                fail_dispose: self.fail_dispose,
                commands: Arc::clone(&self.commands),
                counters: Arc::clone(&self.counters),
            })),
        }
    }
}

struct FakeSession {
    response: FakeResponse,
    fail_dispose: bool,
    commands: Arc<Mutex<Vec<String>>>,
    counters: Arc<FakeCounters>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn execute_command(&mut self, command: &str) -> Result<CommandOutput, PollError> {
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(command.to_string());

        match &self.response {
            FakeResponse::Output(output) => Ok(output.clone()),
            FakeResponse::ExecError(message) => Err(PollError::Execution(message.clone())),
            FakeResponse::ConnectError(message) | FakeResponse::AuthError(message) => {
                Err(PollError::Connection(message.clone()))
            }
            FakeResponse::AuthRejected => Err(PollError::Authentication(String::new())),
        }
    }

    async fn dispose(self: Box<Self>) -> Result<(), PollError> {
        self.counters.disposals.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispose {
            return Err(PollError::Connection("socket already closed".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Builder for FakeRemoteShell
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeRemoteShellBuilder {
    script: VecDeque<FakeResponse>,
    connect_delay: Option<Duration>,
    fail_dispose: bool,
}

impl FakeRemoteShellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a response; responses are consumed one per connect
    pub fn response(mut self, response: FakeResponse) -> Self {
        self.script.push_back(response);
        self
    }

    /// Sleep this long inside every connect
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Make every dispose return an error
    pub fn failing_dispose(mut self) -> Self {
        self.fail_dispose = true;
        self
    }

    pub fn build(self) -> FakeRemoteShell {
        FakeRemoteShell {
            script: Arc::new(Mutex::new(self.script)),
            last: Arc::new(Mutex::new(FakeResponse::Output(CommandOutput::default()))),
            connect_delay: self.connect_delay,
            fail_dispose: self.fail_dispose,
            commands: Arc::new(Mutex::new(Vec::new())),
            targets: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(FakeCounters::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "nas.local".to_string(),
            port: 22,
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_target_requires_host() {
        let config = UpsConfig::default();
        assert!(matches!(SshTarget::from_config(&config), Err(PollError::MissingHost)));
    }

    #[test]
    fn test_target_debug_hides_password() {
        let debug = format!("{:?}", target());
        assert_eq!(debug, "admin@nas.local:22");
    }

    #[tokio::test]
    async fn test_fake_replays_script_then_repeats_last() {
        let shell = FakeRemoteShellBuilder::new()
            .response(FakeResponse::ConnectError("refused".into()))
            .response(FakeResponse::stdout("battery.charge: 50"))
            .build();

        assert!(shell.connect(&target()).await.is_err());
        for _ in 0..2 {
            let mut session = shell.connect(&target()).await.unwrap();
            let output = session.execute_command("upsc ups@localhost").await.unwrap();
            assert_eq!(output.stdout, "battery.charge: 50");
            session.dispose().await.unwrap();
        }

        assert_eq!(shell.connect_count(), 3);
        assert_eq!(shell.execution_count(), 2);
        assert_eq!(shell.dispose_count(), 2);
        assert_eq!(shell.commands(), vec!["upsc ups@localhost"; 2]);
    }

    #[tokio::test]
    async fn test_fake_auth_rejection() {
        let shell = FakeRemoteShellBuilder::new().response(FakeResponse::AuthRejected).build();
        match shell.connect(&target()).await {
            Err(PollError::Authentication(user)) => assert_eq!(user, "admin"),
            other => panic!("expected auth failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(shell.release_count(), 1);
    }

    #[tokio::test]
    async fn test_fake_login_failures_release_handle() {
        let shell = FakeRemoteShellBuilder::new()
            .response(FakeResponse::ConnectError("no route to host".into()))
            .response(FakeResponse::AuthError("connection reset".into()))
            .build();

        assert!(matches!(shell.connect(&target()).await, Err(PollError::Connection(_))));
        assert_eq!(shell.release_count(), 0);

        assert!(matches!(shell.connect(&target()).await, Err(PollError::Connection(_))));
        assert_eq!(shell.release_count(), 1);
        assert_eq!(shell.dispose_count(), 0);
    }

    #[tokio::test]
    async fn test_fake_exec_error_after_connect() {
        let shell = FakeRemoteShellBuilder::new()
            .response(FakeResponse::ExecError("channel closed".into()))
            .failing_dispose()
            .build();
        let mut session = shell.connect(&target()).await.unwrap();
        assert!(session.execute_command("upsc").await.is_err());
        assert!(session.dispose().await.is_err());
    }
}
