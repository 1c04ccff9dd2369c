use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fluxgate::{RootConfig, Supervisor};

#[derive(Parser, Debug)]
#[command(version, about = "multi-user, multi-protocol forward proxy", long_about = None)]
struct Args {
	/// Root configuration file.
	#[arg(short = 'c', long = "config", value_name = "file", default_value = "config.json")]
	config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let config = RootConfig::load(&args.config)?;
	let _supervisor = Supervisor::start(&config).await?;
	info!("fluxgate started");

	fluxgate_core::signal::Shutdown::new().wait().await;
	info!("shutdown complete");
	Ok(())
}
