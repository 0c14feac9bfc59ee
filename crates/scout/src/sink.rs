//! Narrow output traits for publishing successful results: a plain-text
//! subscription sink and a rate-limited notification sink. Each has one
//! first-party implementation; neither claims to reproduce any particular
//! third-party client's subscription format.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ratelimit::{RateClass, RateLimiter};
use crate::types::TestResult;

#[async_trait::async_trait]
pub trait SubscriptionSink: Send + Sync {
	async fn publish(&self, results: &[TestResult]) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
	async fn notify(&self, result: &TestResult) -> anyhow::Result<()>;
}

/// Writes one plain-text file per protocol under `output_dir`, one URI
/// per line. The emitted line is the original URI, so it trivially
/// round-trips through the parser that produced the result.
pub struct PlainTextSubscriptionSink {
	output_dir: PathBuf,
}

impl PlainTextSubscriptionSink {
	pub fn new(output_dir: impl Into<PathBuf>) -> Self {
		Self { output_dir: output_dir.into() }
	}
}

#[async_trait::async_trait]
impl SubscriptionSink for PlainTextSubscriptionSink {
	async fn publish(&self, results: &[TestResult]) -> anyhow::Result<()> {
		use std::collections::BTreeMap;
		use tokio::io::AsyncWriteExt;

		fs_err::tokio::create_dir_all(&self.output_dir).await?;

		let mut by_protocol: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
		for result in results {
			by_protocol.entry(result.protocol.as_str()).or_default().push(result.uri.as_str());
		}

		for (protocol, uris) in by_protocol {
			let path: PathBuf = self.output_dir.join(format!("{protocol}.txt"));
			let mut file = tokio::fs::File::create(&path).await?;
			let body = uris.join("\n");
			file.write_all(body.as_bytes()).await?;
		}
		Ok(())
	}
}

/// Logs each found config via `tracing`, gated by the `notify` rate
/// class so a burst of discoveries doesn't spam whatever log sink is
/// downstream of tracing-subscriber.
pub struct LoggingNotificationSink {
	rate_limiter: Arc<RateLimiter>,
}

impl LoggingNotificationSink {
	pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
		Self { rate_limiter }
	}
}

#[async_trait::async_trait]
impl NotificationSink for LoggingNotificationSink {
	async fn notify(&self, result: &TestResult) -> anyhow::Result<()> {
		if !self
			.rate_limiter
			.acquire_or_wait("notify", RateClass::Notify, 1.0)
			.await
		{
			tracing::debug!(uri = %result.uri, "dropped notification: rate limited");
			return Ok(());
		}
		tracing::info!(
			uri = %result.uri,
			protocol = %result.protocol,
			ping_ms = result.ping_ms,
			download_mbps = result.download_mbps,
			country = %result.country,
			"found working config"
		);
		Ok(())
	}
}

pub fn write_results_json(path: &Path, results: &[TestResult]) -> anyhow::Result<()> {
	let file = fs_err::File::create(path)?;
	serde_json::to_writer_pretty(file, results)?;
	Ok(())
}

pub fn write_blacklist(path: &Path, blacklist: &[String], max_retries: u32) -> anyhow::Result<()> {
	use std::io::Write;
	if blacklist.is_empty() {
		return Ok(());
	}
	let mut file = fs_err::File::create(path)?;
	writeln!(file, "# Blacklisted configs (failed {max_retries}+ times)")?;
	for uri in blacklist {
		writeln!(file, "{uri}")?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::ConnectivityResult;

	fn sample_result(protocol: &str, uri: &str) -> TestResult {
		TestResult {
			uri: uri.to_string(),
			protocol: protocol.to_string(),
			address: "example.com".to_string(),
			ping_ms: 100,
			jitter_ms: 5,
			download_mbps: 10.0,
			upload_mbps: 2.0,
			bypass_ok: true,
			connectivity: ConnectivityResult::default(),
			ip: "1.2.3.4".to_string(),
			country: "Unknown".to_string(),
			country_code: "XX".to_string(),
			city: "Unknown".to_string(),
			isp: "Unknown".to_string(),
			fragment_mode: None,
			custom_sni: None,
		}
	}

	#[tokio::test]
	async fn publish_writes_one_file_per_protocol() {
		let dir = tempfile::tempdir().unwrap();
		let sink = PlainTextSubscriptionSink::new(dir.path());
		let results = vec![sample_result("vmess", "vmess://a"), sample_result("trojan", "trojan://b")];
		sink.publish(&results).await.unwrap();
		assert!(dir.path().join("vmess.txt").exists());
		assert!(dir.path().join("trojan.txt").exists());
	}

	#[test]
	fn blacklist_file_has_comment_header() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blacklisted_configs.txt");
		write_blacklist(&path, &["vmess://bad".to_string()], 3).unwrap();
		let content = std::fs::read_to_string(&path).unwrap();
		assert!(content.starts_with("# Blacklisted configs (failed 3+ times)"));
	}

	#[test]
	fn blacklist_file_skipped_when_empty() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("blacklisted_configs.txt");
		write_blacklist(&path, &[], 3).unwrap();
		assert!(!path.exists());
	}
}
