//! Run one project script on a kernel and print its output.
//!
//! Run with:
//!   cargo run -p run-script-demo -- --port 5000 --project . --script scripts/hello.groovy
//!
//! The exit code is the script's: 0 on success, 1 on a script error, 2 if the
//! connection was lost, 130 on Ctrl-C.

use std::{io::Write, path::PathBuf, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use kernel_link_core::SessionConfig;
use kernel_link_daemon::{DaemonConfig, KernelDaemon};
use kernel_link_session::{ClientContext, RunOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "run-script", version, about = "Run a project script on a kernel")]
struct Args {
    /// Kernel address
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Kernel port
    #[arg(short, long)]
    port: u16,

    /// Git project the script belongs to
    #[arg(long, value_name = "DIR", default_value = ".")]
    project: PathBuf,

    /// Script to run, inside the project
    #[arg(short, long, value_name = "FILE")]
    script: PathBuf,

    /// Start a local kernel under this discovery name first
    #[arg(long, value_name = "NAME")]
    local_kernel: Option<String>,

    /// Kernel CLI for --local-kernel
    #[arg(long, value_name = "COMMAND", requires = "local_kernel")]
    kernel_command: Option<String>,

    /// Bound for each disconnect phase, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    shutdown_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let daemon = args.local_kernel.as_ref().map(|name| {
        let mut config = DaemonConfig {
            name: name.clone(),
            ..DaemonConfig::default()
        };
        if let Some(command) = &args.kernel_command {
            config.command.clone_from(command);
        }
        KernelDaemon::new(config)
    });
    if let Some(daemon) = &daemon {
        daemon.ensure_started().await?;
    }

    let config = SessionConfig::default()
        .with_shutdown_timeout(Duration::from_millis(args.shutdown_timeout_ms));
    let ctx = ClientContext::new(config);
    ctx.connections().add_connection_listener(|endpoint| match endpoint {
        Some(endpoint) => tracing::info!("Kernel at {endpoint} is up"),
        None => tracing::info!("Kernel connection closed"),
    });

    let outcome = run(&ctx, &args).await;

    if let Err(e) = ctx.shutdown().await {
        tracing::error!("Failed to disconnect: {e}");
    }
    if let Some(daemon) = &daemon {
        if let Err(e) = daemon.ensure_stopped().await {
            tracing::error!("Failed to stop the local kernel: {e}");
        }
    }

    let outcome = outcome?;
    match &outcome {
        RunOutcome::Succeeded { output } => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output)?;
            stdout.flush()?;
        }
        RunOutcome::Failed { message } => eprintln!("Script failed: {message}"),
        RunOutcome::ConnectionLost => eprintln!("Connection to the kernel was lost"),
        RunOutcome::Cancelled => eprintln!("Cancelled"),
    }
    std::process::exit(outcome.exit_code());
}

async fn run(ctx: &ClientContext, args: &Args) -> anyhow::Result<RunOutcome> {
    ctx.connections()
        .connect(args.address.as_str(), args.port)
        .await
        .with_context(|| format!("connecting to {}:{}", args.address, args.port))?;

    let script = args.project.join(&args.script);
    let process = ctx
        .client()
        .run_script(&args.project, &script)
        .await
        .with_context(|| format!("submitting {}", script.display()))?;

    tokio::select! {
        outcome = process.wait_outcome() => Ok(outcome),
        _ = tokio::signal::ctrl_c() => {
            process.cancel();
            Ok(process.wait_outcome().await)
        }
    }
}
