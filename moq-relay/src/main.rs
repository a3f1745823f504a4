use std::net;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use moq_relay::audience::AudienceRegistry;
use moq_relay::channel::ChannelRegistry;
use moq_relay::index::EntityTracerIndex;
use moq_relay::session::RouterState;
use moq_relay::tracer::TracerConfig;
use moq_relay::web::{Web, WebConfig};

#[derive(Parser, Clone)]
pub struct Cli {
	/// Listen for WebTransport/QUIC connections on the given address.
	#[arg(long, default_value = "[::]:443")]
	pub bind: net::SocketAddr,

	/// The TLS configuration (certificate/key, self-signed generation).
	#[command(flatten)]
	pub tls: moq_native::tls::Args,

	/// Directory to write per-connection tracer logs to (§6).
	#[arg(long, default_value = "log/metrics")]
	pub log_dir: PathBuf,

	/// Directory to write QUIC qlog traces to.
	#[arg(long, default_value = "log/qlog")]
	pub qlog_dir: PathBuf,

	/// How often a connection tracer re-evaluates its fluctuation analysis
	/// and the rate-adaptation trigger conditions (§4.5, §4.6).
	#[arg(long, default_value = "1000")]
	pub check_interval_ms: u64,

	/// The EMA smoothing factor used by the fluctuation analysis (§4.5).
	#[arg(long, default_value = "0.9")]
	pub ema_alpha: f64,

	/// Increase log verbosity (-v, -vv, ...).
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Decrease log verbosity (-q, -qq, ...).
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub quiet: u8,
}

impl Cli {
	fn log_level(&self) -> tracing::Level {
		let base = 2i8 + self.verbose as i8 - self.quiet as i8;
		match base {
			i8::MIN..=0 => tracing::Level::ERROR,
			1 => tracing::Level::WARN,
			2 => tracing::Level::INFO,
			3 => tracing::Level::DEBUG,
			_ => tracing::Level::TRACE,
		}
	}

	fn tracer_config(&self) -> TracerConfig {
		TracerConfig {
			log_dir: Some(self.log_dir.clone()),
			check_interval: Duration::from_millis(self.check_interval_ms),
			ema_alpha: self.ema_alpha,
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_max_level(cli.log_level())
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	std::fs::create_dir_all(&cli.log_dir).context("failed to create log directory")?;
	std::fs::create_dir_all(&cli.qlog_dir).context("failed to create qlog directory")?;

	let tls = cli.tls.load().context("failed to load TLS configuration")?;

	let channels = ChannelRegistry::new();
	let audiences = AudienceRegistry::new();
	let index = EntityTracerIndex::new();
	let state = RouterState::new(channels, audiences, index);

	let web = Web::new(WebConfig {
		bind: cli.bind,
		tls: tls.clone(),
	});

	let quic = moq_native::quic::Endpoint::new(moq_native::quic::Config {
		bind: cli.bind,
		tls,
	})
	.context("failed to bind QUIC endpoint")?;

	info!(bind = %cli.bind, "relay listening");

	tokio::select! {
		res = web.run() => res.context("web server error"),
		res = moq_relay::transport::quic::serve(quic, state, cli.tracer_config()) => res.context("quic accept loop error"),
	}
}
