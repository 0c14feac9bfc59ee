//! Orchestrator: owns the queue, worker pool, blacklist/failure tracking,
//! adaptive throughput control, and drives the pipeline phases end to end.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scout_core::metrics::Metrics;
use scout_core::Strng;
use tokio::sync::Notify;

use crate::config::Config;
use crate::configbuild::build_config;
use crate::engine::ProxyEngineAdapter;
use crate::fetch::SourceFetcher;
use crate::geoip::GeoipResolver;
use crate::netopt;
use crate::parse::parse;
use crate::probe::{probe, ProbeTargets};
use crate::ratelimit::{extract_domain, RateClass, RateLimiter};
use crate::shutdown::ShutdownManager;
use crate::sink::{write_blacklist, write_results_json, NotificationSink, SubscriptionSink};
use crate::types::TestResult;
use crate::validator::Validator;

pub struct Orchestrator {
	config: Config,
	rate_limiter: Arc<RateLimiter>,
	engine: Arc<dyn ProxyEngineAdapter>,
	geoip: Arc<GeoipResolver>,
	shutdown: Arc<ShutdownManager>,
	metrics: Arc<Metrics>,
	http: reqwest::Client,
}

struct Queue {
	items: Mutex<VecDeque<Strng>>,
}

impl Queue {
	fn new() -> Self {
		Self { items: Mutex::new(VecDeque::new()) }
	}

	fn push(&self, uri: Strng) {
		self.items.lock().push_back(uri);
	}

	fn pop(&self) -> Option<Strng> {
		self.items.lock().pop_front()
	}

	fn len(&self) -> usize {
		self.items.lock().len()
	}

	/// Drains the queue, sorts by protocol priority, and re-enqueues in
	/// that order. Performed once, between ingestion and testing.
	fn prioritize(&self) {
		let mut items = self.items.lock();
		let mut strs: Vec<String> = items.drain(..).map(|s| s.to_string()).collect();
		netopt::sort_by_priority(&mut strs);
		items.extend(strs.into_iter().map(Strng::from));
	}
}

struct SharedState {
	blacklist: Mutex<HashSet<Strng>>,
	failure_counts: Mutex<std::collections::HashMap<Strng, u32>>,
	known_uris: HashSet<Strng>,
	results: Mutex<Vec<TestResult>>,
	tested: AtomicU64,
	found: AtomicU64,
	failed: AtomicU64,
}

impl SharedState {
	fn new(known_uris: HashSet<Strng>) -> Self {
		Self {
			blacklist: Mutex::new(HashSet::new()),
			failure_counts: Mutex::new(std::collections::HashMap::new()),
			known_uris,
			results: Mutex::new(Vec::new()),
			tested: AtomicU64::new(0),
			found: AtomicU64::new(0),
			failed: AtomicU64::new(0),
		}
	}
}

impl Orchestrator {
	pub fn new(
		config: Config,
		engine: Arc<dyn ProxyEngineAdapter>,
		rate_limiter: Arc<RateLimiter>,
		geoip: Arc<GeoipResolver>,
		shutdown: Arc<ShutdownManager>,
		metrics: Arc<Metrics>,
		http: reqwest::Client,
	) -> Self {
		Self { config, rate_limiter, engine, geoip, shutdown, metrics, http }
	}

	fn probe_targets(&self) -> ProbeTargets {
		ProbeTargets {
			ping: self.config.test_url_ping.clone(),
			ping_fallback: self.config.test_url_ping_fallback.clone(),
			download: self.config.test_url_download.clone(),
			upload: self.config.test_url_upload.clone(),
			telegram: self.config.test_url_telegram.clone(),
			instagram: self.config.test_url_instagram.clone(),
			youtube: self.config.test_url_youtube.clone(),
			censorship_check: self.config.test_url_censorship_check.clone(),
		}
	}

	pub async fn run(
		&self,
		known_uris: HashSet<Strng>,
		subscription_sink: Arc<dyn SubscriptionSink>,
		notification_sink: Arc<dyn NotificationSink>,
	) -> anyhow::Result<()> {
		// Phase 0: network check.
		let status = netopt::check_network_status(&self.http).await;
		match status {
			crate::types::NetworkStatus::Outage => {
				tracing::error!("network outage detected before any testing, shutting down");
				self.shutdown.request();
				self.shutdown.execute(self.config.graceful_shutdown_timeout).await;
				return Ok(());
			}
			crate::types::NetworkStatus::Filtered => {
				tracing::warn!("regional filtering detected, bypass strategies will be used more aggressively");
				let clean_ips = netopt::fetch_clean_ips(&self.http).await;
				tracing::info!(count = clean_ips.len(), "prefetched clean IPs");
			}
			crate::types::NetworkStatus::Clear => {}
		}

		let state = Arc::new(SharedState::new(known_uris));
		let queue = Arc::new(Queue::new());
		let unique_uris: Arc<Mutex<HashSet<Strng>>> = Arc::new(Mutex::new(HashSet::new()));

		// Phase 1 + 2: ingestion, one task per source, all concurrent.
		let fetcher = Arc::new(SourceFetcher::new(self.http.clone(), self.config.network_retry_count));
		let ingest_tasks: Vec<_> = self
			.config
			.sources
			.iter()
			.cloned()
			.map(|url| {
				let fetcher = fetcher.clone();
				let rate_limiter = self.rate_limiter.clone();
				let queue = queue.clone();
				let unique_uris = unique_uris.clone();
				let validator_cfg = self.config.validator.clone();
				tokio::spawn(async move {
					let validator = Validator::new(validator_cfg);
					let domain = extract_domain(&url);
					if !rate_limiter.acquire_or_wait(&domain, RateClass::Fetch, 1.0).await {
						tracing::warn!(%url, "could not acquire fetch rate limit slot");
						return;
					}
					let uris = fetcher.fetch(&url).await;
					let mut accepted = 0usize;
					for uri in uris {
						if !validator.validate_uri(&uri) {
							continue;
						}
						let uri: Strng = Strng::from(uri);
						let mut seen = unique_uris.lock();
						if seen.insert(uri.clone()) {
							drop(seen);
							queue.push(uri);
							accepted += 1;
						}
					}
					tracing::info!(%url, accepted, "ingested source");
				})
			})
			.collect();
		futures::future::join_all(ingest_tasks).await;

		if crate::fetch::is_api_rate_limited() {
			tracing::warn!("a known API host rate-limited ingestion this run; some sources may have returned empty");
		}

		// Phase 2.5: prioritise.
		queue.prioritize();
		tracing::info!(queue_size = queue.len(), "prioritised queue");
		self.metrics.configs_queue_size.set(queue.len() as i64);

		if self.shutdown.is_requested() {
			self.shutdown.execute(self.config.graceful_shutdown_timeout).await;
			return self.finish(&state, subscription_sink).await;
		}

		// Phase 3: testing.
		let worker_count = (self.config.max_concurrent_tests as usize).min(queue.len().max(1));
		self.metrics.active_workers.set(worker_count as i64);

		let reporter_state = state.clone();
		let reporter = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(2));
			loop {
				ticker.tick().await;
				tracing::info!(
					tested = reporter_state.tested.load(Ordering::Relaxed),
					found = reporter_state.found.load(Ordering::Relaxed),
					failed = reporter_state.failed.load(Ordering::Relaxed),
					"progress"
				);
			}
		});

		let remaining = Arc::new(AtomicUsize::new(worker_count));
		let all_done = Arc::new(Notify::new());
		for worker_id in 0..worker_count {
			let port = 10800 + worker_id as u16;
			let this = self.clone_refs();
			let queue = queue.clone();
			let state = state.clone();
			let notification_sink = notification_sink.clone();
			let remaining = remaining.clone();
			let all_done = all_done.clone();
			let handle = tokio::spawn(async move {
				this.worker_loop(worker_id, port, queue, state, notification_sink).await;
				if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
					all_done.notify_waiters();
				}
			});
			self.shutdown.register_task(handle);
		}

		// Races the shutdown request against normal completion so a signal
		// arriving mid-run actually cancels in-flight workers instead of
		// waiting for them to drain the queue on their own.
		tokio::select! {
			_ = self.shutdown.wait_for_request() => {
				self.shutdown.execute(self.config.graceful_shutdown_timeout).await;
			}
			_ = all_done.notified() => {}
		}
		reporter.abort();

		self.finish(&state, subscription_sink).await
	}

	/// Cheap clone of the `Arc`-backed fields needed inside a worker task,
	/// avoiding a `Clone` bound on the whole `Orchestrator`.
	fn clone_refs(&self) -> WorkerContext {
		WorkerContext {
			config: self.config.clone(),
			validator_cfg: self.config.validator.clone(),
			rate_limiter: self.rate_limiter.clone(),
			engine: self.engine.clone(),
			geoip: self.geoip.clone(),
			shutdown: self.shutdown.clone(),
			metrics: self.metrics.clone(),
			probe_targets: Arc::new(self.probe_targets()),
		}
	}

	async fn finish(&self, state: &SharedState, subscription_sink: Arc<dyn SubscriptionSink>) -> anyhow::Result<()> {
		let results = state.results.lock().clone();
		let blacklist: Vec<String> = state.blacklist.lock().iter().map(|s| s.to_string()).collect();

		tracing::info!(
			tested = state.tested.load(Ordering::Relaxed),
			found = state.found.load(Ordering::Relaxed),
			failed = state.failed.load(Ordering::Relaxed),
			blacklisted = blacklist.len(),
			"test run complete"
		);

		std::fs::create_dir_all(&self.config.output_dir)?;
		if !results.is_empty() {
			subscription_sink.publish(&results).await?;
			write_results_json(&self.config.output_dir.join("results.json"), &results)?;
		}
		write_blacklist(&self.config.output_dir.join("blacklisted_configs.txt"), &blacklist, self.config.max_retries)?;
		std::fs::write(self.config.output_dir.join("metrics.txt"), self.metrics.export())?;

		Ok(())
	}
}

/// The subset of orchestrator state a worker needs, cloned cheaply per
/// worker since everything inside is an `Arc` or small value.
struct WorkerContext {
	config: Config,
	validator_cfg: crate::validator::ValidatorConfig,
	rate_limiter: Arc<RateLimiter>,
	engine: Arc<dyn ProxyEngineAdapter>,
	geoip: Arc<GeoipResolver>,
	shutdown: Arc<ShutdownManager>,
	metrics: Arc<Metrics>,
	probe_targets: Arc<ProbeTargets>,
}

const CONSECUTIVE_FAILURE_SLEEP_THRESHOLD: u32 = 5;

impl WorkerContext {
	async fn worker_loop(
		&self,
		_worker_id: usize,
		port: u16,
		queue: Arc<Queue>,
		state: Arc<SharedState>,
		notification_sink: Arc<dyn NotificationSink>,
	) {
		let validator = Validator::new(self.validator_cfg.clone());
		let mut consecutive_failures = 0u32;
		let mut batch_size = self.config.adaptive_batch_min;
		let mut adaptive_sleep = self.config.adaptive_sleep_max;
		let mut batch_completions = 0u32;
		let mut batch_successes = 0u32;

		loop {
			if self.shutdown.is_requested() {
				break;
			}
			let Some(uri) = queue.pop() else {
				break;
			};

			if state.blacklist.lock().contains(&uri) {
				state.tested.fetch_add(1, Ordering::Relaxed);
				state.failed.fetch_add(1, Ordering::Relaxed);
				continue;
			}

			let outcome = self.test_one(&uri, port, &validator).await;
			state.tested.fetch_add(1, Ordering::Relaxed);
			self.metrics.configs_tested_total.inc();
			let succeeded = outcome.is_some();

			match outcome {
				Some(mut result) => {
					consecutive_failures = 0;
					result.uri = uri.to_string();
					state.found.fetch_add(1, Ordering::Relaxed);
					state.failure_counts.lock().remove(&uri);
					let is_new = !state.known_uris.contains(&uri);
					{
						let mut results = state.results.lock();
						results.push(result.clone());
					}
					self.metrics
						.configs_found_total
						.get_or_create(&scout_core::metrics::ProtocolLabel { protocol: result.protocol.clone() })
						.inc();
					if is_new {
						let _ = notification_sink.notify(&result).await;
					}

					if self.config.max_success > 0 && state.found.load(Ordering::Relaxed) >= self.config.max_success as u64 {
						while queue.pop().is_some() {
							state.tested.fetch_add(1, Ordering::Relaxed);
						}
						break;
					}
				}
				None => {
					consecutive_failures += 1;
					state.failed.fetch_add(1, Ordering::Relaxed);
					let mut counts = state.failure_counts.lock();
					let count = counts.entry(uri.clone()).or_insert(0);
					*count += 1;
					if *count >= self.config.max_retries {
						state.blacklist.lock().insert(uri.clone());
					}
				}
			}

			batch_completions += 1;
			if succeeded {
				batch_successes += 1;
			}
			if batch_completions >= 10 {
				let success_rate = batch_successes as f64 / batch_completions as f64;
				if success_rate > 0.8 {
					batch_size = (batch_size + 10).min(self.config.adaptive_batch_max);
					adaptive_sleep = (adaptive_sleep - 0.05).max(self.config.adaptive_sleep_min);
				} else if success_rate < 0.2 {
					batch_size = batch_size.saturating_sub(10).max(self.config.adaptive_batch_min);
					adaptive_sleep = (adaptive_sleep + 0.1).min(self.config.adaptive_sleep_max);
				}
				tracing::debug!(success_rate, batch_size, adaptive_sleep, "adaptive parameters updated");
				batch_completions = 0;
				batch_successes = 0;
			}
			if adaptive_sleep > 0.0 {
				tokio::time::sleep(Duration::from_secs_f64(adaptive_sleep)).await;
			}

			if consecutive_failures >= CONSECUTIVE_FAILURE_SLEEP_THRESHOLD {
				tokio::time::sleep(Duration::from_secs(1)).await;
				consecutive_failures = 0;
			}
		}
	}

	async fn test_one(&self, uri: &Strng, port: u16, validator: &Validator) -> Option<TestResult> {
		let descriptor = match parse(uri) {
			Ok(d) => d,
			Err(e) => {
				tracing::debug!(%uri, error = %e, "parse failed, dropping (not retried)");
				return None;
			}
		};

		let host_key = extract_domain(&descriptor.address);
		if !self.rate_limiter.acquire_or_wait(&host_key, RateClass::Test, 1.0).await {
			return None;
		}

		let config = build_config(&descriptor, port);
		let is_blacklisted = |addr: &str| validator.is_blacklisted(addr);

		let mut result = self.run_probe(&descriptor, &config, port, &self.probe_targets, is_blacklisted, self.config.test_timeout).await;

		if result.is_none() && netopt::should_auto_fragment(uri) {
			let fragmented = netopt::inject_fragment(&config);
			if let Some(mut r) = self
				.run_probe(&descriptor, &fragmented, port, &self.probe_targets, is_blacklisted, self.config.test_timeout)
				.await
			{
				r.fragment_mode = Some(true);
				result = Some(r);
			}
		}

		if result.is_none() && (uri.contains("vless") || uri.contains("vmess")) {
			let sni = netopt::random_sni();
			let resniffed = netopt::inject_sni(&config, sni);
			if let Some(mut r) = self
				.run_probe(&descriptor, &resniffed, port, &self.probe_targets, is_blacklisted, Duration::from_secs(25))
				.await
			{
				r.custom_sni = Some(sni.to_string());
				result = Some(r);
			}
		}

		if let Some(ref mut r) = result {
			let geo = self.geoip.lookup(&r.address).await;
			r.ip = r.address.clone();
			r.country = geo.country;
			r.country_code = geo.country_code;
			r.city = geo.city;
			r.isp = geo.isp;
			self.rate_limiter.record_success(&host_key);
		} else {
			self.rate_limiter.record_failure(&host_key);
		}
		result
	}

	async fn run_probe(
		&self,
		descriptor: &crate::types::OutboundDescriptor,
		config: &serde_json::Value,
		port: u16,
		targets: &ProbeTargets,
		is_blacklisted: impl Fn(&str) -> bool + Copy,
		deadline: Duration,
	) -> Option<TestResult> {
		let config_path = std::env::temp_dir().join(format!("temp_config_{port}_{}.json", &uuid::Uuid::new_v4().to_string()[..8]));
		if let Err(e) = std::fs::write(&config_path, config.to_string()) {
			tracing::warn!(error = %e, "failed to write temp config");
			return None;
		}

		let handle = match self.engine.start(config_path.to_str().unwrap_or_default(), port).await {
			Ok(h) => h,
			Err(e) => {
				tracing::debug!(error = %e, port, "engine start failed");
				let _ = Self::cleanup_temp_file(&config_path).await;
				return None;
			}
		};
		if let Some(pid) = handle.pid {
			self.shutdown.register_child(pid);
		}

		let result = tokio::time::timeout(deadline, probe(descriptor, config, port, targets, is_blacklisted)).await;

		if let Some(pid) = handle.pid {
			self.shutdown.unregister_child(pid);
		}
		self.engine.stop(handle).await;
		let _ = Self::cleanup_temp_file(&config_path).await;

		match result {
			Ok(Ok(r)) => Some(r),
			Ok(Err(e)) => {
				tracing::debug!(error = %e, "probe failed");
				None
			}
			Err(_elapsed) => {
				tracing::debug!("probe timed out");
				None
			}
		}
	}

	async fn cleanup_temp_file(path: &std::path::Path) -> std::io::Result<()> {
		for attempt in 0..5 {
			match std::fs::remove_file(path) {
				Ok(()) => return Ok(()),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
				Err(_e) => tokio::time::sleep(Duration::from_millis(300 * (attempt as u64 + 1))).await,
			}
		}
		std::fs::remove_file(path)
	}
}
