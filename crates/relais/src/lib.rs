//! relais: run expensive, crash-prone computations in their own processes and
//! fan ordered work out across a pool of them.

pub mod bridge;
pub mod chunk;
pub mod client;
pub mod config;
pub mod fd_redirect;
pub mod host;
pub mod logging;
pub mod pool;

pub use bridge::protocol::{Request, RequestError, Response};
pub use client::{
    ChannelFault, ClientError, ClientState, CommandLauncher, DiagnosticsTarget, HostLauncher,
    LaunchError, Reply, Service, ServiceClient,
};
pub use config::{ClientConfig, ConfigError, PoolConfig};
pub use fd_redirect::DiagnosticSink;
pub use host::{CommandError, Computation, HostError, SetupError, serve, serve_stdio};
pub use pool::{
    LineProcessor, PoolError, Processed, ProcessedText, RunStats, TextCommand, WorkerPool,
};
