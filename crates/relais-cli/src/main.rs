//! relais CLI: run a text file through a pool of host processes.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use relais::bridge::protocol::check_field;
use relais::{
    CommandLauncher, DiagnosticsTarget, PoolConfig, Reply, Request, ServiceClient,
    TextCommand, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "relais")]
#[command(version)]
#[command(about = "Fan line-oriented work out to isolated compute hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process a text file line by line through a worker pool
    Run(RunArgs),

    /// Launch one host, check it answers ping, and stop it
    Ping {
        #[command(flatten)]
        host: HostArgs,
    },
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Host program to launch
    #[arg(long)]
    host: PathBuf,

    /// Argument passed to the host program (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<OsString>,

    /// Append host diagnostics (stderr) to this file instead of inheriting
    #[arg(long)]
    diagnostics: Option<PathBuf>,
}

impl HostArgs {
    fn launcher(&self) -> CommandLauncher {
        let target = match &self.diagnostics {
            Some(path) => DiagnosticsTarget::File(path.clone()),
            None => DiagnosticsTarget::Inherit,
        };
        CommandLauncher::new(&self.host)
            .args(&self.args)
            .diagnostics(target)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    host: HostArgs,

    /// Command sent for each line
    #[arg(long)]
    command: String,

    /// Payload field carrying the line text
    #[arg(long, default_value = TextCommand::DEFAULT_FIELD)]
    field: String,

    /// Number of host processes
    #[arg(long)]
    workers: Option<usize>,

    /// Target chunks per worker
    #[arg(long)]
    fan_out: Option<usize>,

    /// Smallest chunk, in lines
    #[arg(long)]
    min_chunk: Option<usize>,

    /// Per-call deadline in milliseconds (0 disables it)
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Delay between host launches in milliseconds
    #[arg(long)]
    stagger_ms: Option<u64>,

    /// Print run statistics as JSON on stderr
    #[arg(long, default_value_t = false)]
    stats: bool,

    /// Input file, or `-` for stdin
    input: PathBuf,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    /// Environment overlay first, flags on top.
    fn pool_config(&self) -> Result<PoolConfig> {
        let mut config = PoolConfig::from_env().context("invalid RELAIS_* environment")?;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(fan_out) = self.fan_out {
            config.fan_out = fan_out;
        }
        if let Some(min_chunk) = self.min_chunk {
            config.min_chunk = min_chunk;
        }
        if let Some(ms) = self.stagger_ms {
            config.stagger = Duration::from_millis(ms);
        }
        if let Some(ms) = self.call_timeout_ms {
            config.client.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }

    fn processor(&self) -> Result<TextCommand> {
        check_field(&self.field).context("invalid --field")?;
        Ok(TextCommand::new(&self.command).with_field(&self.field))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    relais::logging::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Ping { host } => ping(host).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let text = read_input(&args.input)?;
    let config = args.pool_config()?;
    let processor = Arc::new(args.processor()?);

    let mut pool = WorkerPool::start(Arc::new(args.host.launcher()), config)
        .await
        .context("failed to start worker pool")?;

    let result = pool.process_text(&text, processor).await;
    pool.shutdown().await;
    let processed = result.context("run failed")?;

    match &args.output {
        Some(path) => tokio::fs::write(path, &processed.text)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{}", processed.text),
    }

    if args.stats {
        let stats = processed.stats;
        eprintln!(
            "{}",
            serde_json::json!({
                "lines": stats.lines,
                "chunks": stats.chunks,
                "fallbacks": stats.fallbacks,
                "requeued": stats.requeued,
                "lost_workers": stats.lost_workers,
            })
        );
    }
    Ok(())
}

async fn ping(host: HostArgs) -> Result<()> {
    let config = PoolConfig::from_env().context("invalid RELAIS_* environment")?;
    let mut client = ServiceClient::start(0, Arc::new(host.launcher()), config.client)
        .await
        .context("host did not start")?;
    let pid = client.pid();

    let reply = client.request(Request::ping()).await;
    let status = client.shutdown().await;
    tracing::debug!(?status, "Host stopped");

    match reply.context("ping failed")? {
        Reply::Data(data) => {
            let pid = pid.map_or_else(|| "?".to_string(), |p| p.to_string());
            println!("{} (pid {})", data.as_str().unwrap_or("ok"), pid);
            Ok(())
        }
        Reply::Error(error) => bail!("host rejected ping: {}", error),
        Reply::Lost(fault) => bail!("host lost the ping: {}", fault),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
