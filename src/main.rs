
use dp_console::{api, config, daemon_conf, metrics};

use clap::{Parser, Subcommand};
use tracing::{Level, warn};
use tracing_subscriber::EnvFilter;
use anyhow::{Context, Result};

#[derive(Parser, Debug)]
#[command(name = "dp_console", about = "Web control plane for the deeprotection daemon")]
struct Cli {
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Console settings (TOML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API, log stream and web UI
    Serve,
    /// Print the parsed daemon config as JSON
    Show,
    /// Print the time left on a temporary disable
    Remaining,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive(level.into()))
        .with_target(false)
        .compact()
        .init();

    // must run while the process is still single-threaded
    daemon_conf::capture_local_offset();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::Config::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve => {
            let prom = metrics::Metrics::try_new()?;
            api::serve(cfg, prom).await?;
        }
        Commands::Show => {
            let out = daemon_conf::ConfStore::new(cfg.daemon_config).load()?;
            for w in &out.warnings {
                warn!("{w}");
            }
            println!("{}", serde_json::to_string_pretty(&out.value)?);
        }
        Commands::Remaining => {
            let doc = daemon_conf::ConfStore::new(cfg.daemon_config).load()?.value;
            match doc.disable_remaining(daemon_conf::now_local()) {
                Some(r) => println!("{r}"),
                None => println!("protection enabled"),
            }
        }
    }
    Ok(())
}
