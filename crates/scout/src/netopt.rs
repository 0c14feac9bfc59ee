//! Network Optimiser: regional filtering detection, bypass SNI selection,
//! protocol priority ordering, and the fragment/SNI injection bypass
//! strategies.

use rand::seq::SliceRandom;
use serde_json::{json, Value};

use crate::types::{NetworkStatus, OutboundDescriptor};

pub const BYPASS_SNIS: &[&str] = &[
	"www.speedtest.net",
	"www.zula.ir",
	"www.digikala.com",
	"update.microsoft.com",
	"www.google.com",
	"dl.google.com",
	"www.apple.com",
	"cdn.discordapp.com",
	"gateway.discord.gg",
	"www.cloudflare.com",
];

pub const DOMESTIC_TARGETS: &[&str] = &[
	"https://www.aparat.com",
	"https://www.digikala.com",
	"https://www.shaparak.ir",
];

pub const INTERNATIONAL_TARGETS: &[&str] = &[
	"https://1.1.1.1",
	"https://www.google.com/generate_204",
	"https://cp.cloudflare.com",
];

/// Community-maintained lists of pre-tested, currently-clean IPs, used as a
/// best-effort prefetch when regional filtering is detected.
const CLEAN_IP_SOURCES: &[&str] = &[
	"https://raw.githubusercontent.com/NiREvil/vless/main/sub/ip.txt",
	"https://raw.githubusercontent.com/bia-pain-bache/BPB-Worker-Panel/main/cf-ip.txt",
];

const CLEAN_IP_CAP: usize = 50;

/// Loads pre-tested IP lists from the hard-coded community sources, keeping
/// only well-formed, unique IPv4 addresses, capped at `CLEAN_IP_CAP`.
pub async fn fetch_clean_ips(client: &reqwest::Client) -> Vec<String> {
	let mut seen = std::collections::HashSet::new();
	let mut ips = Vec::new();

	for source in CLEAN_IP_SOURCES {
		let Ok(resp) = client.get(*source).timeout(std::time::Duration::from_secs(10)).send().await else {
			continue;
		};
		let Ok(text) = resp.text().await else { continue };
		for line in text.lines() {
			let candidate = line.split(['#', ',']).next().unwrap_or("").trim();
			if candidate.parse::<std::net::Ipv4Addr>().is_err() {
				continue;
			}
			if seen.insert(candidate.to_string()) {
				ips.push(candidate.to_string());
				if ips.len() >= CLEAN_IP_CAP {
					return ips;
				}
			}
		}
	}
	ips
}

pub fn random_sni() -> &'static str {
	BYPASS_SNIS
		.choose(&mut rand::rng())
		.copied()
		.unwrap_or("www.google.com")
}

/// Scores a candidate URI by the priority of the bypass technique it
/// already carries: Reality and XTLS evade DPI on their own and sort
/// highest, plain TLS protocols follow, everything else trails.
pub fn protocol_priority(uri: &str) -> i32 {
	let lower = uri.to_lowercase();
	if lower.contains("reality") || lower.contains("pbk=") {
		100
	} else if lower.contains("flow=xtls") {
		90
	} else if lower.starts_with("vless://") && (lower.contains("tls") || lower.contains("security=tls")) {
		70
	} else if lower.starts_with("vmess://") {
		60
	} else if lower.starts_with("trojan://") {
		50
	} else {
		10
	}
}

pub fn sort_by_priority(uris: &mut [String]) {
	uris.sort_by_key(|u| std::cmp::Reverse(protocol_priority(u)));
}

/// Reality and XTLS already carry their own DPI evasion; fragmenting them
/// on top is unnecessary. Plain-TLS VLESS/VMess/Trojan benefit from it.
pub fn should_auto_fragment(uri: &str) -> bool {
	let lower = uri.to_lowercase();
	if lower.contains("reality") || lower.contains("pbk=") || lower.contains("flow=xtls") {
		return false;
	}
	(lower.starts_with("vless://") && lower.contains("security=tls"))
		|| lower.starts_with("vmess://")
		|| lower.starts_with("trojan://")
}

/// Overwrites `serverName` wherever TLS/Reality/XTLS settings are found in
/// a synthesised engine config, without mutating the caller's copy.
pub fn inject_sni(config: &Value, sni: &str) -> Value {
	let mut cfg = config.clone();
	if let Some(outbounds) = cfg.get_mut("outbounds").and_then(Value::as_array_mut) {
		for outbound in outbounds {
			let Some(stream) = outbound.get_mut("streamSettings") else {
				continue;
			};
			for key in ["tlsSettings", "realitySettings", "xtlsSettings"] {
				if let Some(settings) = stream.get_mut(key) {
					settings["serverName"] = json!(sni);
				}
			}
		}
	}
	cfg
}

/// Appends a `fragment` freedom outbound and routes the primary outbound's
/// dialer through it. Only meaningful for TLS-bearing protocols; the
/// caller decides via `should_auto_fragment` whether to call this.
pub fn inject_fragment(config: &Value) -> Value {
	let mut cfg = config.clone();
	let fragmentable = ["vless", "vmess", "trojan", "shadowsocks"];

	if let Some(outbounds) = cfg.get_mut("outbounds").and_then(Value::as_array_mut) {
		if let Some(primary) = outbounds
			.iter_mut()
			.find(|o| o.get("protocol").and_then(Value::as_str).map(|p| fragmentable.contains(&p)).unwrap_or(false))
		{
			if primary.get("streamSettings").is_none() {
				primary["streamSettings"] = json!({ "network": "tcp" });
			}
			primary["streamSettings"]["sockopt"] = json!({
				"dialerProxy": "fragment",
				"tcpKeepAliveIdle": 100,
			});
		}
		outbounds.push(json!({
			"tag": "fragment",
			"protocol": "freedom",
			"settings": {
				"fragment": {
					"packets": "tlshello",
					"length": "100-200",
					"interval": "10-20",
				}
			},
			"streamSettings": { "sockopt": { "tcpKeepAliveIdle": 100 } },
		}));
	}

	cfg
}

pub fn classify_status(domestic_ok: bool, international_ok: bool) -> NetworkStatus {
	match (domestic_ok, international_ok) {
		(true, false) => NetworkStatus::Filtered,
		(false, false) => NetworkStatus::Outage,
		_ => NetworkStatus::Clear,
	}
}

/// Probes the domestic and international target sets via `GET`, any
/// status < 400 within 5s counting as reachable, and classifies the
/// result. Stops each set at the first successful probe.
pub async fn check_network_status(client: &reqwest::Client) -> NetworkStatus {
	let domestic_ok = probe_any(client, DOMESTIC_TARGETS).await;
	let international_ok = probe_any(client, INTERNATIONAL_TARGETS).await;
	classify_status(domestic_ok, international_ok)
}

async fn probe_any(client: &reqwest::Client, targets: &[&str]) -> bool {
	for target in targets {
		let result = client
			.get(*target)
			.timeout(std::time::Duration::from_secs(5))
			.send()
			.await;
		if let Ok(resp) = result {
			if resp.status().as_u16() < 400 {
				return true;
			}
		}
	}
	false
}

/// Real-world proxy-friendly outbound descriptor variant kept separate
/// from the JSON config builder, used by the orchestrator to decide
/// whether a bypass attempt is worth trying for a given descriptor.
pub fn descriptor_is_tls(descriptor: &OutboundDescriptor) -> bool {
	matches!(
		descriptor.security,
		crate::types::Security::Tls | crate::types::Security::Xtls | crate::types::Security::Reality
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn priority_orders_reality_highest() {
		assert!(protocol_priority("vless://a?pbk=abc&security=reality") > protocol_priority("vmess://a"));
		assert!(protocol_priority("vmess://a") > protocol_priority("trojan://a"));
	}

	#[test]
	fn sort_is_descending() {
		let mut uris = vec![
			"trojan://a".to_string(),
			"vless://a?pbk=x&security=reality".to_string(),
			"vmess://a".to_string(),
		];
		sort_by_priority(&mut uris);
		assert_eq!(protocol_priority(&uris[0]), 100);
	}

	#[test]
	fn reality_is_never_auto_fragmented() {
		assert!(!should_auto_fragment("vless://a?pbk=x&security=reality"));
		assert!(should_auto_fragment("vless://a?security=tls"));
	}

	#[test]
	fn sni_injection_is_idempotent() {
		let cfg = json!({
			"outbounds": [{ "streamSettings": { "tlsSettings": { "serverName": "old.example" } } }]
		});
		let once = inject_sni(&cfg, "a.example");
		let twice = inject_sni(&once, "b.example");
		assert_eq!(
			twice["outbounds"][0]["streamSettings"]["tlsSettings"]["serverName"],
			json!("b.example")
		);
	}

	#[test]
	fn fragment_injection_does_not_mutate_input() {
		let cfg = json!({ "outbounds": [{ "protocol": "vless", "tag": "proxy" }] });
		let fragmented = inject_fragment(&cfg);
		assert_eq!(cfg["outbounds"].as_array().unwrap().len(), 1);
		assert_eq!(fragmented["outbounds"].as_array().unwrap().len(), 2);
	}
}
