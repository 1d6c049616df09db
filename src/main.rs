mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use cairn::{app::App, config::Config, logging};

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(about = "Offline-first request gateway and write queue for clinical REST APIs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cairn/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overriding the config file
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override API URL if specified on command line
  if let Some(api_url) = args.api_url {
    config.api.base_url = api_url;
  }

  let _log_guard = logging::init(&config.log)?;

  let app = App::new(config).await?;
  commands::run(&app, args.command).await
}
