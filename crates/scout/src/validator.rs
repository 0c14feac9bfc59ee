//! URI Validator: rejects malformed, oversized, or hostile candidates
//! before any parsing or subprocess work is attempted.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

const SUSPICIOUS_PATTERNS: &[&str] = &[
	r"eval\s*\(",
	r"exec\s*\(",
	r"fromCharCode",
	r"base64_decode",
	r"[\x00-\x1F\x7F]",
	r"javascript:",
	r"data:",
	r"vbscript:",
	r"<script",
	r"</script",
	r"onerror",
	r"onload",
	r"\\u00",
	r"\\x",
];

const INFRA_BLOCKED: &[&str] = &[
	"arvancloud.ir",
	"arvancloud.com",
	"parsonline.com",
	"parsonline.ir",
	"asiatech.ir",
	"shatel.ir",
	"mci.ir",
	"irancell.ir",
	"rightel.ir",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorConfig {
	pub max_uri_length: usize,
	pub protocol_whitelist: HashSet<String>,
	pub banned_payloads: HashSet<String>,
	pub ip_blacklist: HashSet<String>,
	pub domain_blacklist: HashSet<String>,
}

impl Default for ValidatorConfig {
	fn default() -> Self {
		Self {
			max_uri_length: 4096,
			protocol_whitelist: [
				"vmess", "vless", "trojan", "ss", "ssr", "tuic", "hysteria2",
			]
			.into_iter()
			.map(String::from)
			.collect(),
			banned_payloads: ["exec", "system", "eval", "shutdown", "rm ", "del ", "format"]
				.into_iter()
				.map(String::from)
				.collect(),
			ip_blacklist: HashSet::new(),
			domain_blacklist: HashSet::new(),
		}
	}
}

pub struct Validator {
	config: ValidatorConfig,
	suspicious: Vec<Regex>,
}

impl Validator {
	pub fn new(config: ValidatorConfig) -> Self {
		let suspicious = SUSPICIOUS_PATTERNS
			.iter()
			.map(|p| Regex::new(&format!("(?i){p}")).expect("pattern is a compile-time constant"))
			.collect();
		Self { config, suspicious }
	}

	/// Normalizes the URI with NFKC before any substring checks, so
	/// confusable-character bypass attempts (full-width `ｅｖａｌ`, etc.)
	/// collapse to their canonical ASCII form.
	fn normalize(uri: &str) -> String {
		uri.nfkc().collect()
	}

	pub fn validate_uri(&self, uri: &str) -> bool {
		if uri.is_empty() || uri.len() > self.config.max_uri_length {
			tracing::debug!(len = uri.len(), "URI too long or empty");
			return false;
		}

		let Some((scheme, _)) = uri.split_once("://") else {
			return false;
		};
		let scheme = scheme.to_ascii_lowercase();
		if !self.config.protocol_whitelist.contains(scheme.as_str()) {
			tracing::debug!(%scheme, "protocol not allowed");
			return false;
		}

		let normalized = Self::normalize(uri);
		let lower = normalized.to_lowercase();
		for banned in &self.config.banned_payloads {
			if lower.contains(banned.as_str()) {
				tracing::warn!(%banned, "banned payload detected in URI");
				return false;
			}
		}

		for pattern in &self.suspicious {
			if pattern.is_match(&normalized) {
				tracing::warn!(pattern = pattern.as_str(), "suspicious pattern detected in URI");
				return false;
			}
		}

		true
	}

	/// Checks whether a resolved server address is blocked: explicit
	/// IP/domain blacklist, or a hard-coded infrastructure suffix used to
	/// avoid looping a test back through the network we're diagnosing.
	pub fn is_blacklisted(&self, address: &str) -> bool {
		if address.is_empty() {
			return false;
		}
		if self.config.ip_blacklist.contains(address) {
			return true;
		}
		if self
			.config
			.domain_blacklist
			.iter()
			.any(|d| address.ends_with(d.as_str()))
		{
			return true;
		}
		INFRA_BLOCKED
			.iter()
			.any(|d| address.ends_with(d) || address == *d)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn validator() -> Validator {
		Validator::new(ValidatorConfig::default())
	}

	#[test]
	fn accepts_known_schemes() {
		let v = validator();
		assert!(v.validate_uri("vmess://eyJhIjoxfQ=="));
		assert!(v.validate_uri("vless://uuid@host:443?type=tcp"));
	}

	#[test]
	fn rejects_unknown_scheme() {
		assert!(!validator().validate_uri("ftp://host:21"));
	}

	#[test]
	fn rejects_oversized_uri() {
		let mut cfg = ValidatorConfig::default();
		cfg.max_uri_length = 10;
		let v = Validator::new(cfg);
		assert!(!v.validate_uri("vmess://aaaaaaaaaaaaaaaaaaaaaa"));
	}

	#[test]
	fn rejects_script_payloads() {
		let v = validator();
		assert!(!v.validate_uri("vless://host?x=<script>alert(1)</script>"));
		assert!(!v.validate_uri("vmess://javascript:alert(1)"));
	}

	#[test]
	fn rejects_confusable_unicode_bypass() {
		// Full-width "eval(" should NFKC-normalize down to ASCII and get caught.
		let v = validator();
		assert!(!v.validate_uri("vless://host?x=ｅｖａｌ("));
	}

	#[test]
	fn blacklists_infra_suffixes() {
		let v = validator();
		assert!(v.is_blacklisted("edge.arvancloud.ir"));
		assert!(!v.is_blacklisted("example.com"));
	}
}
