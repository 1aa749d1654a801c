//! Service client - supervises one host subprocess.
//!
//! Flow:
//! 1. Spawn the host process via a [`HostLauncher`]
//! 2. Wait for `{"status":"ready"}`, then require a successful `ping`
//! 3. Serve calls: one request line out, one response line back
//! 4. On a channel fault (EOF, malformed line, deadline): tear the process
//!    down completely, relaunch once, and report the call as lost
//!
//! Calls are at-most-once: a request whose answer was lost is never re-sent.
//! A request that cannot be framed (reserved key, over the line limit) is
//! refused before anything is written, and the host keeps running.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{JsonLinesCodec, MalformedLine};
use crate::bridge::protocol::{Request, RequestError, Response};
use crate::config::ClientConfig;

/// Lifecycle state of a [`ServiceClient`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    /// No host process. Initial state, and terminal after a failed restart.
    #[default]
    Down,
    /// Host launched, waiting for the handshake.
    Starting,
    /// Handshake and ping succeeded; calls are accepted.
    Ready,
    /// A channel fault was detected; the host is being replaced.
    Degraded,
}

/// Why a round trip produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelFault {
    #[error("write to host failed: {0}")]
    Write(String),
    #[error("host closed its output (crashed?)")]
    Closed,
    #[error("host sent {0}")]
    Malformed(MalformedLine),
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    #[error("host output framing error: {0}")]
    Framing(String),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("an earlier call was cancelled before its answer arrived")]
    Interrupted,
}

/// Outcome of a call that did not take the service down.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `{"status":"ok"}` with its data.
    Data(Value),
    /// `{"status":"error"}`: the computation rejected this request.
    Error(String),
    /// The host died or hung during this call and was replaced. The request
    /// was not retried.
    Lost(ChannelFault),
}

impl Reply {
    pub fn into_data(self) -> Option<Value> {
        match self {
            Self::Data(data) => Some(data),
            Self::Error(_) | Self::Lost(_) => None,
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn host process: {0}")]
    Spawn(#[from] io::Error),
    #[error("failed to open diagnostics file {}: {source}", .path.display())]
    Diagnostics { path: PathBuf, source: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to launch host: {0}")]
    Launch(#[from] LaunchError),
    #[error("host handshake failed: {0}")]
    Handshake(String),
    #[error("service is down")]
    Down,
    /// Refused locally; nothing was sent and the host is untouched.
    #[error("request refused: {0}")]
    Rejected(#[from] RequestError),
    #[error("host restart after fault ({fault}) failed: {source}")]
    RestartFailed {
        fault: ChannelFault,
        #[source]
        source: Box<ClientError>,
    },
}

/// Extension point for different host spawn strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait HostLauncher: Send + Sync {
    fn launch(&self) -> Result<Child, LaunchError>;

    /// Short label for logs.
    fn describe(&self) -> String {
        "host".to_string()
    }
}

/// Where the host's stderr (its diagnostic stream) goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DiagnosticsTarget {
    #[default]
    Inherit,
    Null,
    /// Appended to, created if missing.
    File(PathBuf),
}

/// Launches a host by running a program.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    diagnostics: DiagnosticsTarget,
}

impl CommandLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            diagnostics: DiagnosticsTarget::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn diagnostics(mut self, target: DiagnosticsTarget) -> Self {
        self.diagnostics = target;
        self
    }

    fn stderr(&self) -> Result<Stdio, LaunchError> {
        match &self.diagnostics {
            DiagnosticsTarget::Inherit => Ok(Stdio::inherit()),
            DiagnosticsTarget::Null => Ok(Stdio::null()),
            DiagnosticsTarget::File(path) => std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Stdio::from)
                .map_err(|source| LaunchError::Diagnostics {
                    path: path.clone(),
                    source,
                }),
        }
    }
}

impl HostLauncher for CommandLauncher {
    fn launch(&self) -> Result<Child, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr()?)
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        Ok(command.spawn()?)
    }

    fn describe(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Live pipes to one host process.
struct Connection {
    child: Child,
    pid: Option<u32>,
    writer: FramedWrite<ChildStdin, JsonLinesCodec<Request>>,
    reader: FramedRead<ChildStdout, JsonLinesCodec<Response>>,
}

impl Connection {
    fn open(mut child: Child, max_line_bytes: usize) -> Result<Self, ClientError> {
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Handshake("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Handshake("stdout not captured".to_string()))?;

        Ok(Self {
            child,
            pid,
            writer: FramedWrite::new(stdin, JsonLinesCodec::with_max_line_bytes(max_line_bytes)),
            reader: FramedRead::new(stdout, JsonLinesCodec::with_max_line_bytes(max_line_bytes)),
        })
    }

    async fn handshake(&mut self, config: &ClientConfig) -> Result<(), ClientError> {
        let first = tokio::time::timeout(config.handshake_timeout, self.reader.next())
            .await
            .map_err(|_| {
                ClientError::Handshake(format!(
                    "no handshake within {:?}",
                    config.handshake_timeout
                ))
            })?;

        match first {
            Some(Ok(Ok(Response::Ready))) => {}
            Some(Ok(Ok(other))) => {
                return Err(ClientError::Handshake(format!(
                    "expected ready, got {} message",
                    other.status()
                )));
            }
            Some(Ok(Err(malformed))) => {
                return Err(ClientError::Handshake(format!(
                    "invalid handshake: {}",
                    malformed
                )));
            }
            Some(Err(e)) => {
                return Err(ClientError::Handshake(format!("framing error: {}", e)));
            }
            None => {
                let status = tokio::time::timeout(config.shutdown_grace, self.child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                return Err(ClientError::Handshake(match status {
                    Some(status) => format!("host exited before ready ({})", status),
                    None => "host closed its output before ready".to_string(),
                }));
            }
        }

        let ping_deadline = config
            .call_timeout
            .map_or(config.handshake_timeout, |limit| limit.min(config.handshake_timeout));
        match self.exchange(Request::ping(), Some(ping_deadline)).await {
            Ok(Response::Ok { .. }) => Ok(()),
            Ok(other) => Err(ClientError::Handshake(format!(
                "ping answered with {} status",
                other.status()
            ))),
            Err(fault) => Err(ClientError::Handshake(format!("ping failed: {}", fault))),
        }
    }

    /// One request line out, one response line back, under `deadline`.
    async fn exchange(
        &mut self,
        request: Request,
        deadline: Option<Duration>,
    ) -> Result<Response, ChannelFault> {
        let round_trip = async {
            self.writer
                .send(request)
                .await
                .map_err(|e| ChannelFault::Write(e.to_string()))?;
            match self.reader.next().await {
                Some(Ok(Ok(response))) => Ok(response),
                Some(Ok(Err(malformed))) => Err(ChannelFault::Malformed(malformed)),
                Some(Err(e)) => Err(ChannelFault::Framing(e.to_string())),
                None => Err(ChannelFault::Closed),
            }
        };

        match deadline {
            Some(limit) => tokio::time::timeout(limit, round_trip)
                .await
                .unwrap_or_else(|_| Err(ChannelFault::TimedOut(limit))),
            None => round_trip.await,
        }
    }

    /// Close the pipes, kill, and reap. Nothing from this process can be read
    /// afterwards.
    async fn teardown(self, worker: usize) {
        let Self {
            mut child,
            pid,
            writer,
            reader,
        } = self;
        drop(writer);
        drop(reader);

        // Already-exited children report an error here; the wait below reaps them.
        if let Err(e) = child.start_kill() {
            tracing::trace!(worker, ?pid, error = %e, "Kill skipped");
        }
        match child.wait().await {
            Ok(status) => tracing::debug!(worker, ?pid, %status, "Host reaped"),
            Err(e) => tracing::warn!(worker, ?pid, error = %e, "Failed to reap host"),
        }
    }

    async fn stop(self, worker: usize, grace: Duration) -> Option<ExitStatus> {
        let Self {
            mut child,
            pid,
            writer,
            reader,
        } = self;

        // EOF on stdin is the graceful shutdown request.
        drop(writer);
        drop(reader);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            tracing::info!(worker, ?pid, %status, "Host exited");
            return Some(status);
        }

        #[cfg(unix)]
        if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            tracing::debug!(worker, ?pid, "Host still running, sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                tracing::debug!(worker, ?pid, error = %e, "SIGTERM failed");
            }
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                tracing::info!(worker, ?pid, %status, "Host terminated");
                return Some(status);
            }
        }

        tracing::warn!(worker, ?pid, "Host ignored shutdown, killing");
        if let Err(e) = child.start_kill() {
            tracing::debug!(worker, ?pid, error = %e, "Kill failed");
        }
        child.wait().await.ok()
    }
}

/// Supervisor and proxy for one host process.
///
/// Not reentrant: every operation takes `&mut self`, so a client is driven by
/// one task at a time. Dropping a client kills its host (`kill_on_drop`).
pub struct ServiceClient {
    id: usize,
    launcher: Arc<dyn HostLauncher>,
    config: ClientConfig,
    state: ClientState,
    conn: Option<Connection>,
    restarts: u32,
    /// Set while a request is on the wire. Still set on the next call means
    /// that call's future was dropped and its answer may be waiting unread.
    in_flight: bool,
}

impl ServiceClient {
    /// Create a client in the `Down` state. Nothing is spawned until
    /// [`launch`](Self::launch).
    pub fn new(id: usize, launcher: Arc<dyn HostLauncher>, config: ClientConfig) -> Self {
        Self {
            id,
            launcher,
            config,
            state: ClientState::Down,
            conn: None,
            restarts: 0,
            in_flight: false,
        }
    }

    /// Create and launch.
    pub async fn start(
        id: usize,
        launcher: Arc<dyn HostLauncher>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let mut client = Self::new(id, launcher, config);
        client.launch().await?;
        Ok(client)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Successful restarts after channel faults.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn pid(&self) -> Option<u32> {
        self.conn.as_ref().and_then(|c| c.pid)
    }

    /// Start a host and complete the handshake. Any previous process is torn
    /// down first. On failure the client is left `Down`.
    pub async fn launch(&mut self) -> Result<(), ClientError> {
        if let Some(conn) = self.conn.take() {
            conn.teardown(self.id).await;
        }
        self.state = ClientState::Starting;

        match Self::connect(self.id, self.launcher.as_ref(), &self.config).await {
            Ok(conn) => {
                tracing::info!(worker = self.id, pid = ?conn.pid, "Host ready");
                self.conn = Some(conn);
                self.state = ClientState::Ready;
                self.in_flight = false;
                Ok(())
            }
            Err(e) => {
                tracing::error!(worker = self.id, error = %e, "Host launch failed");
                self.state = ClientState::Down;
                Err(e)
            }
        }
    }

    async fn connect(
        worker: usize,
        launcher: &dyn HostLauncher,
        config: &ClientConfig,
    ) -> Result<Connection, ClientError> {
        tracing::info!(worker, host = %launcher.describe(), "Launching host");
        let child = launcher.launch()?;
        let mut conn = Connection::open(child, config.max_line_bytes)?;

        match conn.handshake(config).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.teardown(worker).await;
                Err(e)
            }
        }
    }

    /// Send `command` with `payload` and wait for the answer.
    pub async fn call(
        &mut self,
        command: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<Reply, ClientError> {
        self.request(Request::new(command).with_payload(payload))
            .await
    }

    /// Send a prepared request and wait for the answer.
    ///
    /// `Ok(Reply::Lost)` means the host failed mid-call and was replaced;
    /// `Err(Rejected)` means the request was refused before sending and the
    /// client is unchanged; any other `Err` means the client is `Down`.
    ///
    /// Dropping the returned future mid-call is allowed. The host is then
    /// replaced at the start of the next request, since the dropped call's
    /// answer could otherwise be read as the next one's.
    pub async fn request(&mut self, request: Request) -> Result<Reply, ClientError> {
        if let Err(e) = request.check(self.config.max_line_bytes) {
            tracing::warn!(worker = self.id, command = %request.command, error = %e, "Refusing request");
            return Err(e.into());
        }
        match self.state {
            ClientState::Down => return Err(ClientError::Down),
            ClientState::Ready if !self.in_flight => {}
            // A cancelled call or relaunch left the channel in an unknown state.
            ClientState::Ready | ClientState::Starting | ClientState::Degraded => {
                self.recover(ChannelFault::Interrupted).await?;
            }
        }
        let deadline = self.config.call_timeout;
        let Some(conn) = self.conn.as_mut() else {
            self.state = ClientState::Down;
            return Err(ClientError::Down);
        };

        self.in_flight = true;
        let outcome = conn.exchange(request, deadline).await;
        self.in_flight = false;

        let fault = match outcome {
            Ok(Response::Ok { data }) => return Ok(Reply::Data(data)),
            Ok(Response::Error { error }) => return Ok(Reply::Error(error)),
            Ok(Response::Ready) => ChannelFault::Unexpected("ready"),
            Err(fault) => fault,
        };
        self.recover(fault).await
    }

    async fn recover(&mut self, fault: ChannelFault) -> Result<Reply, ClientError> {
        tracing::warn!(worker = self.id, %fault, "Host channel fault, restarting host");
        self.state = ClientState::Degraded;
        if let Some(conn) = self.conn.take() {
            conn.teardown(self.id).await;
        }

        match self.launch().await {
            Ok(()) => {
                self.restarts += 1;
                tracing::info!(
                    worker = self.id,
                    restarts = self.restarts,
                    "Host restarted, in-flight call dropped"
                );
                Ok(Reply::Lost(fault))
            }
            Err(e) => Err(ClientError::RestartFailed {
                fault,
                source: Box::new(e),
            }),
        }
    }

    /// Ask the host to exit, escalating to SIGTERM and then SIGKILL after
    /// `shutdown_grace` each. Returns the exit status if the host was running.
    pub async fn shutdown(&mut self) -> Option<ExitStatus> {
        self.state = ClientState::Down;
        let conn = self.conn.take()?;
        conn.stop(self.id, self.config.shutdown_grace).await
    }
}

/// Call surface the worker pool drives.
///
/// [`ServiceClient`] is the production implementation; the trait lets pools
/// run over in-process services in tests.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    async fn request(&mut self, request: Request) -> Result<Reply, ClientError>;

    fn state(&self) -> ClientState;

    async fn stop(&mut self);
}

#[async_trait::async_trait]
impl Service for ServiceClient {
    async fn request(&mut self, request: Request) -> Result<Reply, ClientError> {
        ServiceClient::request(self, request).await
    }

    fn state(&self) -> ClientState {
        self.state
    }

    async fn stop(&mut self) {
        self.shutdown().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    const READY: &str = r#"printf '{"status":"ready"}\n'; read -r _; printf '{"status":"ok","data":"pong"}\n'; "#;

    fn sh(body: &str) -> Arc<dyn HostLauncher> {
        Arc::new(
            CommandLauncher::new("sh")
                .arg("-c")
                .arg(format!("{}{}", READY, body))
                .diagnostics(DiagnosticsTarget::Null),
        )
    }

    fn raw_sh(script: &str) -> Arc<dyn HostLauncher> {
        Arc::new(
            CommandLauncher::new("sh")
                .arg("-c")
                .arg(script)
                .diagnostics(DiagnosticsTarget::Null),
        )
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_handshake_timeout(Duration::from_secs(10))
            .with_call_timeout(Some(Duration::from_secs(10)))
            .with_shutdown_grace(Duration::from_millis(200))
    }

    const ECHO_LOOP: &str =
        r#"while read -r _; do printf '{"status":"ok","data":"corrigé"}\n'; done"#;

    #[tokio::test]
    async fn new_client_is_down() {
        let mut client = ServiceClient::new(0, sh(ECHO_LOOP), fast_config());
        assert_eq!(client.state(), ClientState::Down);
        assert!(matches!(
            client.request(Request::ping()).await,
            Err(ClientError::Down)
        ));
    }

    #[tokio::test]
    async fn launch_then_call() {
        let mut client = ServiceClient::start(0, sh(ECHO_LOOP), fast_config())
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Ready);
        assert!(client.pid().is_some());

        let reply = client.call("correct_segment", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Data(Value::from("corrigé")));
        assert_eq!(client.restarts(), 0);

        let status = client.shutdown().await.unwrap();
        assert!(status.success());
        assert_eq!(client.state(), ClientState::Down);
    }

    #[tokio::test]
    async fn exit_before_ready_is_launch_failure() {
        let mut client = ServiceClient::new(0, raw_sh("exit 3"), fast_config());
        let err = client.launch().await.unwrap_err();
        assert!(matches!(err, ClientError::Handshake(_)), "{err}");
        assert_eq!(client.state(), ClientState::Down);
    }

    #[tokio::test]
    async fn noise_instead_of_handshake_is_launch_failure() {
        let mut client = ServiceClient::new(0, raw_sh("echo 'loading model...'"), fast_config());
        let err = client.launch().await.unwrap_err();
        assert!(err.to_string().contains("invalid handshake"), "{err}");
    }

    #[tokio::test]
    async fn handshake_is_bounded() {
        let config = fast_config().with_handshake_timeout(Duration::from_millis(200));
        let mut client = ServiceClient::new(0, raw_sh("exec sleep 30"), config);

        let started = Instant::now();
        let err = client.launch().await.unwrap_err();
        assert!(err.to_string().contains("no handshake"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failed_ping_is_launch_failure() {
        let script = r#"printf '{"status":"ready"}\n'; read -r _; printf '{"status":"error","error":"not loaded"}\n'; cat > /dev/null"#;
        let mut client = ServiceClient::new(0, raw_sh(script), fast_config());
        let err = client.launch().await.unwrap_err();
        assert!(err.to_string().contains("ping answered with error"), "{err}");
        assert_eq!(client.state(), ClientState::Down);
    }

    #[tokio::test]
    async fn ping_during_handshake_is_bounded_without_call_deadline() {
        let config = fast_config()
            .with_call_timeout(None)
            .with_handshake_timeout(Duration::from_millis(300));
        let script = r#"printf '{"status":"ready"}\n'; exec sleep 30"#;
        let mut client = ServiceClient::new(0, raw_sh(script), config);

        let started = Instant::now();
        let err = client.launch().await.unwrap_err();
        assert!(err.to_string().contains("ping failed"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), ClientState::Down);
    }

    #[tokio::test]
    async fn command_key_in_payload_is_refused_without_restart() {
        let mut client = ServiceClient::start(0, sh(ECHO_LOOP), fast_config())
            .await
            .unwrap();
        let pid = client.pid();

        let mut payload = Map::new();
        payload.insert("command".into(), Value::from("lower"));
        payload.insert("text".into(), Value::from("abc"));
        let err = client.call("upper", payload).await.unwrap_err();
        assert!(
            matches!(err, ClientError::Rejected(RequestError::ReservedField(_))),
            "{err}"
        );

        assert_eq!(client.restarts(), 0);
        assert_eq!(client.pid(), pid);
        assert_eq!(client.state(), ClientState::Ready);
        let reply = client.call("upper", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Data(Value::from("corrigé")));
    }

    #[tokio::test]
    async fn oversized_request_is_refused_without_restart() {
        let config = fast_config().with_max_line_bytes(64);
        let mut client = ServiceClient::start(0, sh(ECHO_LOOP), config).await.unwrap();
        let pid = client.pid();

        let mut payload = Map::new();
        payload.insert("text".into(), Value::from("é".repeat(200)));
        let err = client.call("upper", payload).await.unwrap_err();
        match err {
            ClientError::Rejected(RequestError::TooLarge { max, .. }) => assert_eq!(max, 64),
            other => panic!("expected TooLarge, got {other}"),
        }

        assert_eq!(client.restarts(), 0);
        assert_eq!(client.pid(), pid);
        let reply = client.call("upper", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Data(Value::from("corrigé")));
    }

    #[tokio::test]
    async fn cancelled_call_never_leaks_its_answer_into_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("slow-once");
        let body = format!(
            r#"if [ -e '{m}' ]; then while read -r _; do printf '{{"status":"ok","data":"frais"}}\n'; done; else touch '{m}'; read -r _; sleep 1; printf '{{"status":"ok","data":"périmé"}}\n'; cat > /dev/null; fi"#,
            m = marker.display(),
        );
        let mut client = ServiceClient::start(0, sh(&body), fast_config())
            .await
            .unwrap();
        let first_pid = client.pid();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), client.call("upper", Map::new()))
                .await;
        assert!(cancelled.is_err());

        let reply = client.call("upper", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Data(Value::from("frais")));
        assert_eq!(client.restarts(), 1);
        assert_ne!(client.pid(), first_pid);
    }

    #[tokio::test]
    async fn host_error_passes_through_without_restart() {
        let body = r#"while read -r _; do printf '{"status":"error","error":"mot inconnu"}\n'; done"#;
        let mut client = ServiceClient::start(0, sh(body), fast_config()).await.unwrap();

        let reply = client.call("correct_segment", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Error("mot inconnu".to_string()));
        assert_eq!(client.restarts(), 0);
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[tokio::test]
    async fn truncated_response_is_a_crash_not_an_answer() {
        let body = r#"read -r _; printf '{"status":"ok","data":"tr'; exit 1"#;
        let mut client = ServiceClient::start(0, sh(body), fast_config()).await.unwrap();
        let first_pid = client.pid();

        let reply = client.call("upper", Map::new()).await.unwrap();
        assert!(matches!(reply, Reply::Lost(ChannelFault::Malformed(_))), "{reply:?}");
        assert_eq!(client.restarts(), 1);
        assert_eq!(client.state(), ClientState::Ready);
        assert_ne!(client.pid(), first_pid);
    }

    #[tokio::test]
    async fn crash_mid_call_restarts_once_and_drops_the_call() {
        let body = r#"read -r _; exit 1"#;
        let mut client = ServiceClient::start(0, sh(body), fast_config()).await.unwrap();

        let reply = client.call("upper", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Lost(ChannelFault::Closed));
        assert_eq!(client.restarts(), 1);

        // The replacement host answers the next call fresh.
        let reply = client.call("upper", Map::new()).await.unwrap();
        assert_eq!(reply, Reply::Lost(ChannelFault::Closed));
        assert_eq!(client.restarts(), 2);
    }

    #[tokio::test]
    async fn wedged_host_hits_call_deadline() {
        let body = "read -r _; exec sleep 30";
        let config = fast_config().with_call_timeout(Some(Duration::from_millis(300)));
        let mut client = ServiceClient::start(0, sh(body), config).await.unwrap();

        let started = Instant::now();
        let reply = client.call("upper", Map::new()).await.unwrap();
        assert_eq!(
            reply,
            Reply::Lost(ChannelFault::TimedOut(Duration::from_millis(300)))
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[tokio::test]
    async fn failed_restart_leaves_client_down() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("launched");
        let script = format!(
            "if [ -e '{m}' ]; then exit 1; fi; touch '{m}'; {ready} read -r _; exit 1",
            m = marker.display(),
            ready = READY,
        );
        let mut client = ServiceClient::start(0, raw_sh(&script), fast_config())
            .await
            .unwrap();

        let err = client.call("upper", Map::new()).await.unwrap_err();
        match err {
            ClientError::RestartFailed { fault, .. } => assert_eq!(fault, ChannelFault::Closed),
            other => panic!("expected RestartFailed, got {other}"),
        }
        assert_eq!(client.state(), ClientState::Down);
        assert!(matches!(
            client.call("upper", Map::new()).await,
            Err(ClientError::Down)
        ));
    }

    #[tokio::test]
    async fn shutdown_escalates_when_host_ignores_eof() {
        let body = "exec sleep 30";
        let mut client = ServiceClient::start(0, sh(body), fast_config()).await.unwrap();

        let started = Instant::now();
        let status = client.shutdown().await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), ClientState::Down);
    }

    #[tokio::test]
    async fn shutdown_of_down_client_is_noop() {
        let mut client = ServiceClient::new(0, sh(ECHO_LOOP), fast_config());
        assert!(client.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn diagnostics_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("host.err");
        let launcher = Arc::new(
            CommandLauncher::new("sh")
                .arg("-c")
                .arg(format!("echo 'chargement du modèle' >&2; {}{}", READY, ECHO_LOOP))
                .diagnostics(DiagnosticsTarget::File(log.clone())),
        );
        let mut client = ServiceClient::start(0, launcher, fast_config()).await.unwrap();
        client.shutdown().await;

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("chargement du modèle"));
    }
}
