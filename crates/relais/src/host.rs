//! Service host - runs inside the host subprocess.
//!
//! This module provides the child side of the host protocol. The parent side
//! (spawning, supervision, restarts) is in client.rs.
//!
//! Lifecycle:
//! 1. Run `Computation::setup` with stdout diverted to stderr
//! 2. Send `{"status":"ready"}`
//! 3. For each request line: divert stdout, run the command, restore stdout,
//!    write exactly one response line
//! 4. Exit cleanly when the request stream closes

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{Request, Response};
use crate::fd_redirect::DiagnosticSink;

/// Setup phase errors.
///
/// These occur while the hosted computation initializes (model loading,
/// warm-up), before any request is served. The host process exits non-zero
/// and the client treats it as a launch failure.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Model or resource could not be loaded.
    #[error("failed to load: {message}")]
    Load { message: String },

    /// Initialization code raised an error.
    #[error("setup failed: {message}")]
    Setup { message: String },

    /// Internal error (e.g., setup panicked).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SetupError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// A single command failed. Reported to the client as `{"status":"error"}`;
/// the host keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("protocol stream error: {0}")]
    Io(#[from] io::Error),
}

/// The expensive, possibly noisy computation behind the protocol.
///
/// The host owns its computation exclusively and never calls it concurrently.
#[async_trait::async_trait]
pub trait Computation: Send + 'static {
    /// Initialize (load model, warm up). Runs once, before the handshake.
    async fn setup(&mut self) -> Result<(), SetupError>;

    /// Execute one command. `ping` never reaches this method.
    async fn call(
        &mut self,
        command: &str,
        payload: Map<String, Value>,
    ) -> Result<Value, CommandError>;
}

/// Serve `computation` over the process stdin/stdout.
pub async fn serve_stdio<C: Computation>(computation: C) -> Result<(), HostError> {
    serve(
        computation,
        tokio::io::stdin(),
        tokio::io::stdout(),
        DiagnosticSink::Stderr,
    )
    .await
}

/// Run the host event loop over arbitrary streams.
///
/// Returns `Ok(())` when the request stream ends or the client stops reading.
pub async fn serve<C, R, W>(
    mut computation: C,
    reader: R,
    writer: W,
    sink: DiagnosticSink,
) -> Result<(), HostError>
where
    C: Computation,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, JsonLinesCodec::<Request>::new());
    let mut responses = FramedWrite::new(writer, JsonLinesCodec::<Response>::new());

    tracing::info!("Host starting setup");
    let started = Instant::now();
    {
        let _diversion = sink.divert()?;
        match AssertUnwindSafe(computation.setup()).catch_unwind().await {
            Ok(result) => result?,
            Err(panic) => {
                return Err(SetupError::internal(panic_message(panic.as_ref())).into());
            }
        }
    }

    responses.send(Response::Ready).await?;
    tracing::info!(
        setup_secs = started.elapsed().as_secs_f64(),
        "Host ready, waiting for requests"
    );

    let mut handled: u64 = 0;
    loop {
        let request = match requests.next().await {
            Some(Ok(Ok(request))) => request,
            Some(Ok(Err(malformed))) => {
                tracing::warn!(error = %malformed, "Ignoring malformed request");
                continue;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Request stream error");
                return Err(e.into());
            }
            None => {
                tracing::info!(handled, "Request stream closed, host exiting");
                break;
            }
        };

        let command = request.command.clone();
        let response = {
            let _diversion = sink.divert()?;
            dispatch(&mut computation, request).await
        };
        tracing::debug!(%command, status = response.status(), "Request handled");

        match responses.send(response).await {
            Ok(()) => handled += 1,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::info!(handled, "Client stopped reading, host exiting");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

async fn dispatch<C: Computation>(computation: &mut C, request: Request) -> Response {
    if request.is_ping() {
        return Response::pong();
    }

    let Request { command, payload } = request;
    match AssertUnwindSafe(computation.call(&command, payload))
        .catch_unwind()
        .await
    {
        Ok(Ok(data)) => Response::ok(data),
        Ok(Err(e)) => {
            tracing::warn!(%command, error = %e, "Command failed");
            Response::error(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(%command, %message, "Command panicked");
            Response::error(format!("command panicked: {}", message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
