use std::io::Read as _;
use std::net::SocketAddr;
use std::path::PathBuf;

use async_shutdown::ShutdownManager;
use clap::{Parser, Subcommand};
use rampart_rtp::config::Config;
use rampart_rtp::engine::Engine;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to configuration file. Falls back to built-in defaults if omitted.
	#[clap(long, short)]
	config: Option<PathBuf>,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,

	#[clap(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Bind locally and print decoded media payloads arriving from `peer`.
	Receive {
		/// Address the peer is expected to send from.
		peer: SocketAddr,
	},
	/// Bind locally and stream stdin to `peer`, one RTP payload per line.
	Send {
		/// Address of the receiving peer.
		peer: SocketAddr,
	},
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
	let args = Args::parse();

	let log_level = match i16::from(args.verbose) - i16::from(args.quiet) {
		..=-2 => "error",
		-1 => "warn",
		0 => "info",
		1 => "debug",
		2.. => "trace",
	};
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(log_level)).init();

	let config = match &args.config {
		Some(path) => Config::read_from_file(path).map_err(|_| std::process::exit(1))?,
		None => Config::default(),
	};
	tracing::debug!("using configuration:\n{config:#?}");

	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("failed to wait for ctrl-c: {e}");
				std::process::exit(1);
			}
			tracing::info!("received interrupt signal, shutting down");
			let _ = shutdown.trigger_shutdown(());
		}
	});

	let ssrc: u32 = rand::random();

	match args.command {
		Command::Receive { peer } => {
			let (_engine, mut decoded_rx) = Engine::bind(config, peer, ssrc, shutdown.clone()).await?;
			loop {
				tokio::select! {
					_ = shutdown.wait_shutdown_triggered() => break,
					payload = decoded_rx.recv() => {
						match payload {
							Some(payload) => println!("received {} bytes", payload.len()),
							None => break,
						}
					}
				}
			}
		}
		Command::Send { peer } => {
			let (engine, _decoded_rx) = Engine::bind(config, peer, ssrc, shutdown.clone()).await?;
			let mut stdin = std::io::stdin();
			let mut buffer = Vec::new();
			stdin.read_to_end(&mut buffer).map_err(|e| tracing::error!("failed to read stdin: {e}"))?;

			for (i, chunk) in buffer.chunks(1200).enumerate() {
				if shutdown.is_shutdown_triggered() {
					break;
				}
				let marker = (i + 1) * 1200 >= buffer.len();
				engine.send_media(bytes::Bytes::copy_from_slice(chunk), marker).await?;
			}
		}
	}

	shutdown.trigger_shutdown(()).ok();
	let () = shutdown.wait_shutdown_complete().await;
	tracing::trace!("successfully waited for shutdown to complete");

	Ok(())
}
