use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use edge_core::{telemetry, version};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the configuration, then exit
	#[arg(long)]
	validate_only: bool,

	/// Print version
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();

	let Args {
		config,
		file,
		validate_only,
		version,
	} = Args::parse();

	if version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	let contents = match (config, file) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file"),
		(Some(config), None) => config,
		(None, Some(file)) => std::fs::read_to_string(&file)?,
		(None, None) => "{}".to_string(),
	};
	let config = edgerouter::config::parse_config(&contents)?;
	if validate_only {
		println!("configuration is valid");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(async move {
			info!("starting {}", version::BuildInfo::new());
			edgerouter::app::run(Arc::new(config))
				.await?
				.wait_termination()
				.await
		})
}
