//! Test Probe: drives live traffic through a locally running proxy to
//! measure latency, jitter, throughput, connectivity, and bypass success.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::Value;

use crate::types::{ConnectivityResult, OutboundDescriptor, TestResult};

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
	#[error("no latency target responded")]
	Unreachable,
	#[error("resolved server address is blacklisted: {0}")]
	BlacklistedAddress(String),
	#[error("probe timed out")]
	Timeout,
	#[error(transparent)]
	Http(#[from] reqwest::Error),
}

pub struct ProbeTargets {
	pub ping: String,
	pub ping_fallback: String,
	pub download: String,
	pub upload: String,
	pub telegram: String,
	pub instagram: String,
	pub youtube: String,
	pub censorship_check: String,
}

const DOWNLOAD_CAP_BYTES: usize = 3_000_000;
const UPLOAD_BYTES: usize = 2_000_000;
const CHUNK_MIN: usize = 65_536;

fn proxied_client(port: u16) -> Result<reqwest::Client, reqwest::Error> {
	let proxy_url = format!("http://127.0.0.1:{port}");
	reqwest::Client::builder()
		.proxy(reqwest::Proxy::all(&proxy_url)?)
		.timeout(Duration::from_secs(30))
		.build()
}

async fn measure_latency(client: &reqwest::Client, targets: &ProbeTargets) -> Option<Vec<f64>> {
	for target in [&targets.ping, &targets.ping_fallback] {
		let mut samples = Vec::new();
		for _ in 0..2 {
			let start = Instant::now();
			let result = client
				.get(target)
				.timeout(Duration::from_secs(10))
				.send()
				.await;
			let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
			if let Ok(resp) = result {
				let status = resp.status().as_u16();
				if (status == 200 || status == 204) && elapsed_ms < 10_000.0 {
					samples.push(elapsed_ms);
				}
			}
		}
		if !samples.is_empty() {
			return Some(samples);
		}
	}
	None
}

fn mean(values: &[f64]) -> f64 {
	values.iter().sum::<f64>() / values.len() as f64
}

fn stdev(values: &[f64]) -> f64 {
	if values.len() < 2 {
		return 0.0;
	}
	let m = mean(values);
	let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
	variance.sqrt()
}

async fn download_speed(client: &reqwest::Client, url: &str, deadline: Duration) -> f64 {
	let start = Instant::now();
	let Ok(resp) = client.get(url).send().await else {
		return 0.0;
	};
	let mut stream = resp.bytes_stream();
	let mut received = 0usize;
	while let Some(chunk) = stream.next().await {
		let Ok(chunk) = chunk else { break };
		received += chunk.len();
		if received >= DOWNLOAD_CAP_BYTES || start.elapsed() >= deadline {
			break;
		}
		if chunk.len() < CHUNK_MIN && received >= DOWNLOAD_CAP_BYTES {
			break;
		}
	}
	let duration = start.elapsed().as_secs_f64();
	if duration <= 0.0 {
		return 0.0;
	}
	round2((received as f64 * 8.0) / duration / 1_000_000.0)
}

async fn upload_speed(client: &reqwest::Client, url: &str) -> f64 {
	let payload = vec![0u8; UPLOAD_BYTES];
	let start = Instant::now();
	let Ok(resp) = client.post(url).body(payload).send().await else {
		return 0.0;
	};
	let duration = start.elapsed().as_secs_f64();
	if resp.status().as_u16() != 200 || duration <= 0.0 {
		return 0.0;
	}
	round2((UPLOAD_BYTES as f64 * 8.0) / duration / 1_000_000.0)
}

fn round2(v: f64) -> f64 {
	(v * 100.0).round() / 100.0
}

async fn check_connectivity(client: &reqwest::Client, targets: &ProbeTargets) -> ConnectivityResult {
	let timeout = Duration::from_secs(5);
	let (telegram, instagram, youtube) = tokio::join!(
		probe_reachable(client, &targets.telegram, timeout),
		probe_reachable(client, &targets.instagram, timeout),
		probe_reachable(client, &targets.youtube, timeout),
	);
	ConnectivityResult { telegram, instagram, youtube }
}

async fn probe_reachable(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
	client
		.get(url)
		.timeout(timeout)
		.send()
		.await
		.map(|r| r.status().as_u16() < 400)
		.unwrap_or(false)
}

async fn check_bypass(client: &reqwest::Client, url: &str) -> bool {
	client
		.head(url)
		.timeout(Duration::from_secs(5))
		.send()
		.await
		.map(|r| r.status().as_u16() < 400)
		.unwrap_or(false)
}

/// Recovers the real server address from a synthesised engine config,
/// handling the TUIC/Hysteria2 wrapper shapes separately from the usual
/// vnext/servers shape.
pub fn extract_address(config: &Value, scheme: &str) -> Option<String> {
	let outbound = config
		.get("outbounds")?
		.as_array()?
		.iter()
		.find(|o| o.get("protocol").and_then(Value::as_str) != Some("freedom"))?;

	match scheme {
		"tuic" => outbound
			.pointer("/streamSettings/tuicSettings/server")
			.and_then(Value::as_str)
			.map(String::from),
		"hysteria2" => outbound
			.pointer("/streamSettings/hysteriaSettings/server")
			.and_then(Value::as_str)
			.map(String::from),
		"vmess" | "vless" => outbound
			.pointer("/settings/vnext/0/address")
			.and_then(Value::as_str)
			.map(String::from),
		_ => outbound
			.pointer("/settings/servers/0/address")
			.and_then(Value::as_str)
			.map(String::from),
	}
}

pub async fn probe(
	descriptor: &OutboundDescriptor,
	config: &Value,
	port: u16,
	targets: &ProbeTargets,
	is_blacklisted: impl Fn(&str) -> bool,
) -> Result<TestResult, ProbeError> {
	let client = proxied_client(port)?;

	let latencies = measure_latency(&client, targets).await.ok_or(ProbeError::Unreachable)?;
	let ping_ms = mean(&latencies).round() as i64;
	let jitter_ms = stdev(&latencies).round() as i64;

	let (download_mbps, upload_mbps) = tokio::join!(
		download_speed(&client, &targets.download, Duration::from_secs(30)),
		upload_speed(&client, &targets.upload),
	);

	let connectivity = check_connectivity(&client, targets).await;
	let bypass_ok = check_bypass(&client, &targets.censorship_check).await;

	let address = extract_address(config, &descriptor.scheme).unwrap_or_else(|| descriptor.address.clone());
	if is_blacklisted(&address) {
		return Err(ProbeError::BlacklistedAddress(address));
	}

	Ok(TestResult {
		uri: String::new(),
		protocol: descriptor.scheme.clone(),
		address,
		ping_ms,
		jitter_ms,
		download_mbps,
		upload_mbps,
		bypass_ok,
		connectivity,
		ip: String::new(),
		country: "Unknown".to_string(),
		country_code: "XX".to_string(),
		city: "Unknown".to_string(),
		isp: "Unknown".to_string(),
		fragment_mode: None,
		custom_sni: None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn jitter_is_zero_with_single_sample() {
		assert_eq!(stdev(&[120.0]), 0.0);
	}

	#[test]
	fn jitter_is_nonzero_with_multiple_samples() {
		assert!(stdev(&[100.0, 200.0, 300.0]) > 0.0);
	}

	#[test]
	fn extract_address_handles_tuic_wrapper() {
		let cfg = json!({
			"outbounds": [
				{ "protocol": "vless", "streamSettings": { "tuicSettings": { "server": "1.2.3.4" } } },
				{ "protocol": "freedom" }
			]
		});
		assert_eq!(extract_address(&cfg, "tuic").as_deref(), Some("1.2.3.4"));
	}

	#[test]
	fn extract_address_handles_vnext_shape() {
		let cfg = json!({
			"outbounds": [
				{ "protocol": "vmess", "settings": { "vnext": [{ "address": "example.com" }] } },
				{ "protocol": "freedom" }
			]
		});
		assert_eq!(extract_address(&cfg, "vmess").as_deref(), Some("example.com"));
	}
}
