use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use scout::config::{self, Config};
use scout::engine::{ProxyEngineAdapter, XrayEngine};
use scout::geoip::GeoipResolver;
use scout::ratelimit::RateLimiter;
use scout::shutdown::ShutdownManager;
use scout::sink::{LoggingNotificationSink, NotificationSink, PlainTextSubscriptionSink, SubscriptionSink};
use scout::types::TestResult;
use scout::Orchestrator;
use scout_core::metrics::Metrics;

/// Scans public proxy-config sources for working VMess/VLESS/Trojan/
/// Shadowsocks/TUIC/Hysteria2 endpoints behind a restrictive network.
#[derive(Parser, Debug)]
#[command(name = "scout", version, about)]
struct Cli {
	/// Run once to completion and exit, instead of waiting on a scheduler.
	#[arg(long)]
	cli: bool,

	/// Path to a JSON or YAML config file.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Caps the number of working configs found before stopping early.
	#[arg(long)]
	max_configs: Option<u32>,

	/// Raises the log level to debug regardless of the configured filter.
	#[arg(long)]
	debug: bool,

	/// Path to a newline-delimited file of extra source URLs, appended to
	/// whatever the config file already lists.
	#[arg(long)]
	sources: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let mut config = config::load(cli.config.as_deref())?.resolve();
	apply_cli_overrides(&mut config, &cli)?;

	scout::telemetry::init(&config.log_filter, cli.debug);
	tracing::info!(sources = config.sources.len(), max_concurrent_tests = config.max_concurrent_tests, "starting run");

	let http = reqwest::Client::builder()
		.timeout(Duration::from_secs(30))
		.build()?;

	let rate_limiter = Arc::new(RateLimiter::new());
	let geoip = Arc::new(GeoipResolver::new(config.geoip_db_path.as_deref(), http.clone(), rate_limiter.clone()));
	let engine: Arc<dyn ProxyEngineAdapter> = Arc::new(XrayEngine::new(config.engine_path.clone()));
	let shutdown = Arc::new(ShutdownManager::new());
	let metrics = Arc::new(Metrics::new());

	install_signal_handlers(shutdown.clone());

	let known_uris = load_known_uris(&config.output_dir);

	let subscription_sink: Arc<dyn SubscriptionSink> = Arc::new(PlainTextSubscriptionSink::new(config.output_dir.clone()));
	let notification_sink: Arc<dyn NotificationSink> = Arc::new(LoggingNotificationSink::new(rate_limiter.clone()));

	let orchestrator = Orchestrator::new(config, engine, rate_limiter, geoip, shutdown.clone(), metrics, http);

	let result = orchestrator.run(known_uris, subscription_sink, notification_sink).await;

	if let Err(e) = &result {
		tracing::error!(error = %e, "run failed");
	}
	result
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) -> anyhow::Result<()> {
	if let Some(max_configs) = cli.max_configs {
		config.max_success = max_configs;
	}
	if let Some(path) = &cli.sources {
		let text = std::fs::read_to_string(path)?;
		config.sources.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
	}
	let _ = cli.cli;
	Ok(())
}

fn load_known_uris(output_dir: &std::path::Path) -> HashSet<scout_core::Strng> {
	let path = output_dir.join("results.json");
	let Ok(text) = std::fs::read_to_string(path) else {
		return HashSet::new();
	};
	let Ok(results) = serde_json::from_str::<Vec<TestResult>>(&text) else {
		return HashSet::new();
	};
	results.into_iter().map(|r| scout_core::Strng::from(r.uri)).collect()
}

fn install_signal_handlers(shutdown: Arc<ShutdownManager>) {
	tokio::spawn(async move {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};
			let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
			let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
			tokio::select! {
				_ = sigterm.recv() => tracing::info!("received SIGTERM"),
				_ = sigint.recv() => tracing::info!("received SIGINT"),
			}
		}
		#[cfg(not(unix))]
		{
			let _ = tokio::signal::ctrl_c().await;
			tracing::info!("received ctrl-c");
		}
		shutdown.request();
	});
}
