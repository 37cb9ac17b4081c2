//! Kiln CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::Commands;
use config::LogFormat;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Run CI jobs in sandboxes on a shared cluster", long_about = None)]
struct Cli {
    /// Engine configuration file (YAML)
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let engine = config::load_engine_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            path,
            dry_run,
            max_parallel,
            output,
            cluster,
        } => {
            let code = handlers::run(engine, &path, dry_run, max_parallel, output, &cluster).await?;
            return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
        }
        Commands::Resolve { labels, output } => handlers::resolve(&engine, labels, output)?,
        Commands::Reap { cluster } => handlers::reap(engine, &cluster).await?,
        Commands::Validate { path } => handlers::validate(&engine, &path)?,
        Commands::Schema { target } => handlers::schema(target)?,
    }

    Ok(ExitCode::SUCCESS)
}
