//! Layered configuration: an all-`Option` `RawConfig` deserialised from
//! file, resolved into a concrete `Config` with defaults applied. Mirrors
//! the `RawConfig`/`Config` split used throughout the teacher's own
//! configuration loading.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;

use crate::validator::ValidatorConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub max_concurrent_tests: Option<u32>,
	pub test_timeout_secs: Option<f64>,
	pub network_retry_count: Option<u32>,
	pub adaptive_batch_min: Option<u32>,
	pub adaptive_batch_max: Option<u32>,
	pub adaptive_sleep_min: Option<f64>,
	pub adaptive_sleep_max: Option<f64>,
	pub max_uri_length: Option<usize>,
	pub protocol_whitelist: Option<HashSet<String>>,
	pub banned_payloads: Option<HashSet<String>>,
	pub ip_blacklist: Option<HashSet<String>>,
	pub domain_blacklist: Option<HashSet<String>>,
	pub test_url_ping: Option<String>,
	pub test_url_ping_fallback: Option<String>,
	pub test_url_download: Option<String>,
	pub test_url_upload: Option<String>,
	pub test_url_telegram: Option<String>,
	pub test_url_instagram: Option<String>,
	pub test_url_youtube: Option<String>,
	pub test_url_censorship_check: Option<String>,
	pub doh_resolver_url: Option<String>,
	pub geoip_db_path: Option<PathBuf>,
	pub engine_path: Option<String>,
	pub max_retries: Option<u32>,
	pub max_success: Option<u32>,
	pub graceful_shutdown_timeout_secs: Option<f64>,
	pub sources: Option<Vec<String>>,
	pub output_dir: Option<PathBuf>,
	pub logging: Option<RawLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawLogging {
	pub filter: Option<String>,
	pub fields: Option<RawLoggingFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawLoggingFields {
	pub with_target: Option<bool>,
	pub with_thread_ids: Option<bool>,
	pub json: Option<bool>,
}

/// The resolved, defaults-applied configuration the orchestrator actually
/// runs with.
#[derive(Debug, Clone)]
pub struct Config {
	pub max_concurrent_tests: u32,
	pub test_timeout: std::time::Duration,
	pub network_retry_count: u32,
	pub adaptive_batch_min: u32,
	pub adaptive_batch_max: u32,
	pub adaptive_sleep_min: f64,
	pub adaptive_sleep_max: f64,
	pub validator: ValidatorConfig,
	pub test_url_ping: String,
	pub test_url_ping_fallback: String,
	pub test_url_download: String,
	pub test_url_upload: String,
	pub test_url_telegram: String,
	pub test_url_instagram: String,
	pub test_url_youtube: String,
	pub test_url_censorship_check: String,
	pub doh_resolver_url: String,
	pub geoip_db_path: Option<PathBuf>,
	pub engine_path: String,
	pub max_retries: u32,
	pub max_success: u32,
	pub graceful_shutdown_timeout: std::time::Duration,
	pub sources: Vec<String>,
	pub output_dir: PathBuf,
	pub log_filter: String,
}

impl RawConfig {
	pub fn resolve(self) -> Config {
		let logging = self.logging.unwrap_or_default();
		Config {
			max_concurrent_tests: self.max_concurrent_tests.unwrap_or(50),
			test_timeout: std::time::Duration::from_secs_f64(self.test_timeout_secs.unwrap_or(30.0)),
			network_retry_count: self.network_retry_count.unwrap_or(3),
			adaptive_batch_min: self.adaptive_batch_min.unwrap_or(10),
			adaptive_batch_max: self.adaptive_batch_max.unwrap_or(100),
			adaptive_sleep_min: self.adaptive_sleep_min.unwrap_or(0.1),
			adaptive_sleep_max: self.adaptive_sleep_max.unwrap_or(2.0),
			validator: ValidatorConfig {
				max_uri_length: self.max_uri_length.unwrap_or(4096),
				protocol_whitelist: self.protocol_whitelist.unwrap_or_else(|| {
					["vmess", "vless", "trojan", "ss", "ssr", "tuic", "hysteria2"]
						.into_iter()
						.map(String::from)
						.collect()
				}),
				banned_payloads: self.banned_payloads.unwrap_or_else(|| {
					["exec", "system", "eval", "shutdown", "rm ", "del ", "format"]
						.into_iter()
						.map(String::from)
						.collect()
				}),
				ip_blacklist: self.ip_blacklist.unwrap_or_default(),
				domain_blacklist: self.domain_blacklist.unwrap_or_default(),
			},
			test_url_ping: self.test_url_ping.unwrap_or_else(|| "https://www.gstatic.com/generate_204".into()),
			test_url_ping_fallback: self
				.test_url_ping_fallback
				.unwrap_or_else(|| "https://www.cloudflare.com/cdn-cgi/trace".into()),
			test_url_download: self
				.test_url_download
				.unwrap_or_else(|| "https://speed.cloudflare.com/__down?bytes=10000000".into()),
			test_url_upload: self
				.test_url_upload
				.unwrap_or_else(|| "https://speed.cloudflare.com/__up".into()),
			test_url_telegram: self.test_url_telegram.unwrap_or_else(|| "https://telegram.org".into()),
			test_url_instagram: self.test_url_instagram.unwrap_or_else(|| "https://instagram.com".into()),
			test_url_youtube: self.test_url_youtube.unwrap_or_else(|| "https://youtube.com".into()),
			test_url_censorship_check: self
				.test_url_censorship_check
				.unwrap_or_else(|| "https://www.youtube.com".into()),
			doh_resolver_url: self
				.doh_resolver_url
				.unwrap_or_else(|| "https://cloudflare-dns.com/dns-query".into()),
			geoip_db_path: self.geoip_db_path,
			engine_path: self.engine_path.unwrap_or_else(|| "xray".into()),
			max_retries: self.max_retries.unwrap_or(3),
			max_success: self.max_success.unwrap_or(0),
			graceful_shutdown_timeout: std::time::Duration::from_secs_f64(
				self.graceful_shutdown_timeout_secs.unwrap_or(30.0),
			),
			sources: self.sources.unwrap_or_default(),
			output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from(".")),
			log_filter: logging.filter.unwrap_or_else(|| "info".to_string()),
		}
	}
}

pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<RawConfig> {
	let Some(path) = path else {
		return Ok(RawConfig::default());
	};
	let text = std::fs::read_to_string(path)?;
	let raw: RawConfig = if path.extension().and_then(|e| e.to_str()) == Some("json") {
		serde_json::from_str(&text)?
	} else {
		serde_yaml::from_str(&text)?
	};
	Ok(raw)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_applies_defaults() {
		let cfg = RawConfig::default().resolve();
		assert_eq!(cfg.max_concurrent_tests, 50);
		assert_eq!(cfg.max_retries, 3);
		assert!(cfg.validator.banned_payloads.contains("eval"));
	}

	#[test]
	fn resolve_honors_overrides() {
		let mut raw = RawConfig::default();
		raw.max_concurrent_tests = Some(10);
		let cfg = raw.resolve();
		assert_eq!(cfg.max_concurrent_tests, 10);
	}
}
