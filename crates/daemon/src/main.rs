use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hb_daemon::paths::DataDir;

/// Hi-Boss daemon: durable envelope routing between humans, agents, and
/// chat adapters on a single host.
#[derive(Parser)]
#[command(name = "hibossd", version)]
struct Cli {
    /// Data directory (default: $HIBOSS_HOME or ~/hiboss).
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log to stderr only; skip the rotating file in the data directory.
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = DataDir::resolve(cli.data_dir);

    // Keep the rolling-file guard alive for the process lifetime.
    let _log_guard = init_tracing(&data_dir, cli.no_log_file)?;

    hb_daemon::daemon::run(data_dir).await
}

/// Env-filtered stderr logging plus a daily-rotated file under the data
/// directory's internal log dir.
fn init_tracing(
    data_dir: &DataDir,
    no_log_file: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_env("HIBOSS_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info,hb_daemon=debug"))
    };

    if no_log_file {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return Ok(None);
    }

    std::fs::create_dir_all(data_dir.log_dir())?;
    let file_appender = tracing_appender::rolling::daily(data_dir.log_dir(), "hibossd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(Some(guard))
}
