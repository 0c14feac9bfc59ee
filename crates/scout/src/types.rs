//! The data model shared across every pipeline stage: candidate URIs,
//! outbound descriptors, and test jobs/results.

use std::time::Instant;

use scout_core::Strng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A proxy-server scheme this build knows how to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
	VMess,
	VLess,
	Trojan,
	Shadowsocks,
	ShadowsocksR,
	Tuic,
	Hysteria2,
}

impl Scheme {
	pub fn from_uri(uri: &str) -> Option<Self> {
		let (scheme, _) = uri.split_once("://")?;
		Some(match scheme.to_ascii_lowercase().as_str() {
			"vmess" => Scheme::VMess,
			"vless" => Scheme::VLess,
			"trojan" => Scheme::Trojan,
			"ss" => Scheme::Shadowsocks,
			"ssr" => Scheme::ShadowsocksR,
			"tuic" => Scheme::Tuic,
			"hysteria2" => Scheme::Hysteria2,
			_ => return None,
		})
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Scheme::VMess => "vmess",
			Scheme::VLess => "vless",
			Scheme::Trojan => "trojan",
			Scheme::Shadowsocks => "shadowsocks",
			Scheme::ShadowsocksR => "shadowsocksr",
			Scheme::Tuic => "tuic",
			Scheme::Hysteria2 => "hysteria2",
		}
	}
}

/// The transport layer carrying the protocol's frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
	Tcp,
	Ws,
	Grpc,
	Http,
	Quic,
	Tuic,
	Hysteria2,
}

impl Default for Transport {
	fn default() -> Self {
		Transport::Tcp
	}
}

/// The TLS-ish security layer, if any, wrapping the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
	None,
	Tls,
	Xtls,
	Reality,
}

impl Default for Security {
	fn default() -> Self {
		Security::None
	}
}

/// TLS/Reality parameters extracted from a URI's query string.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsParams {
	pub sni: Option<String>,
	pub alpn: Vec<String>,
	pub fingerprint: Option<String>,
	pub allow_insecure: bool,
	pub reality_public_key: Option<String>,
	pub reality_short_id: Option<String>,
	pub reality_spider_x: Option<String>,
}

/// Everything needed to synthesise an engine config file for one candidate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundDescriptor {
	pub scheme: String,
	pub address: String,
	pub port: u16,
	/// uuid / password / method:password / token, scheme-dependent.
	pub credential: String,
	pub transport: Transport,
	pub security: Security,
	pub tls: TlsParams,
	pub flow: Option<String>,
	pub network_path: Option<String>,
	pub network_host: Option<String>,
	pub service_name: Option<String>,
	pub shadowsocks_method: Option<String>,
	pub remark: Option<String>,
	/// Free-form extra fields used only by tuic/hysteria2 (congestion
	/// control, udp relay mode, zero-rtt, heartbeat, ...).
	pub extra: Value,
}

impl OutboundDescriptor {
	pub fn scheme(&self) -> Option<Scheme> {
		match self.scheme.as_str() {
			"vmess" => Some(Scheme::VMess),
			"vless" => Some(Scheme::VLess),
			"trojan" => Some(Scheme::Trojan),
			"shadowsocks" => Some(Scheme::Shadowsocks),
			"tuic" => Some(Scheme::Tuic),
			"hysteria2" => Some(Scheme::Hysteria2),
			_ => None,
		}
	}
}

/// State a Test Job moves through; terminal states never transition back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
	Pending,
	Running,
	Succeeded,
	Failed,
	Blacklisted,
}

/// One in-flight attempt to test a single candidate URI.
#[derive(Clone, Debug)]
pub struct TestJob {
	pub uri: Strng,
	pub assigned_port: u16,
	pub attempt_count: u32,
	pub state: JobState,
}

/// Per-host connectivity probe outcomes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectivityResult {
	pub telegram: bool,
	pub instagram: bool,
	pub youtube: bool,
}

/// A fully populated, successful measurement of one candidate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
	pub uri: String,
	pub protocol: String,
	pub address: String,
	pub ping_ms: i64,
	pub jitter_ms: i64,
	pub download_mbps: f64,
	pub upload_mbps: f64,
	pub bypass_ok: bool,
	pub connectivity: ConnectivityResult,
	pub ip: String,
	pub country: String,
	pub country_code: String,
	pub city: String,
	pub isp: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub fragment_mode: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub custom_sni: Option<String>,
}

/// Per-key token bucket backing the rate limiter.
#[derive(Debug)]
pub struct RateLimitBucket {
	pub capacity: f64,
	pub refill_per_second: f64,
	pub tokens: f64,
	pub last_refill_at: Instant,
	pub failures_since_success: u32,
	pub backoff_until: Option<Instant>,
}

impl RateLimitBucket {
	pub fn new(capacity: f64, refill_per_second: f64) -> Self {
		Self {
			capacity,
			refill_per_second,
			tokens: capacity,
			last_refill_at: Instant::now(),
			failures_since_success: 0,
			backoff_until: None,
		}
	}
}

/// Network-wide filtering classification from Phase 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
	/// Both domestic and international targets reachable.
	Clear,
	/// Domestic reachable, international is not: DPI filtering detected.
	Filtered,
	/// Neither reachable: treat as a local network outage.
	Outage,
}
