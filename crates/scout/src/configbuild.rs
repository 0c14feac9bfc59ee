//! Synthesises the external engine's JSON config file from an
//! [`OutboundDescriptor`] plus a loopback port.

use serde_json::{json, Value};

use crate::types::{OutboundDescriptor, Security, Transport};

fn transport_str(t: &Transport) -> &'static str {
	match t {
		Transport::Tcp => "tcp",
		Transport::Ws => "ws",
		Transport::Grpc => "grpc",
		Transport::Http => "http",
		Transport::Quic => "quic",
		Transport::Tuic => "tuic",
		Transport::Hysteria2 => "hysteria2",
	}
}

fn build_stream_settings(descriptor: &OutboundDescriptor) -> Value {
	let mut stream = json!({ "network": transport_str(&descriptor.transport) });

	match descriptor.security {
		Security::Tls => {
			stream["security"] = json!("tls");
			stream["tlsSettings"] = json!({
				"serverName": descriptor.tls.sni,
				"allowInsecure": descriptor.tls.allow_insecure,
				"fingerprint": descriptor.tls.fingerprint.clone().unwrap_or_else(|| "chrome".to_string()),
				"alpn": descriptor.tls.alpn,
			});
		}
		Security::Xtls => {
			stream["security"] = json!("xtls");
			stream["xtlsSettings"] = json!({
				"serverName": descriptor.tls.sni,
				"allowInsecure": descriptor.tls.allow_insecure,
				"fingerprint": descriptor.tls.fingerprint.clone().unwrap_or_else(|| "chrome".to_string()),
			});
		}
		Security::Reality => {
			stream["security"] = json!("reality");
			stream["realitySettings"] = json!({
				"show": false,
				"serverName": descriptor.tls.sni,
				"publicKey": descriptor.tls.reality_public_key,
				"shortId": descriptor.tls.reality_short_id,
				"spiderX": descriptor.tls.reality_spider_x,
				"fingerprint": descriptor.tls.fingerprint.clone().unwrap_or_else(|| "chrome".to_string()),
			});
		}
		Security::None => {
			stream["security"] = json!("none");
		}
	}

	match descriptor.transport {
		Transport::Ws => {
			stream["wsSettings"] = json!({
				"path": descriptor.network_path.clone().unwrap_or_else(|| "/".to_string()),
				"headers": { "Host": descriptor.network_host.clone().unwrap_or_default() },
			});
		}
		Transport::Grpc => {
			stream["grpcSettings"] = json!({
				"serviceName": descriptor.service_name.clone().unwrap_or_default(),
			});
		}
		Transport::Http => {
			stream["httpSettings"] = json!({
				"path": descriptor.network_path.clone().unwrap_or_else(|| "/".to_string()),
				"host": descriptor.network_host.clone().map(|h| vec![h]).unwrap_or_default(),
			});
		}
		Transport::Quic => {
			stream["quicSettings"] = json!({});
		}
		Transport::Tcp | Transport::Tuic | Transport::Hysteria2 => {}
	}

	stream
}

fn build_outbound(descriptor: &OutboundDescriptor) -> Value {
	match descriptor.scheme.as_str() {
		"vmess" => json!({
			"protocol": "vmess",
			"tag": "proxy",
			"settings": {
				"vnext": [{
					"address": descriptor.address,
					"port": descriptor.port,
					"users": [{
						"id": descriptor.credential,
						"alterId": descriptor.extra.get("alter_id").and_then(Value::as_u64).unwrap_or(0),
						"security": descriptor.extra.get("security").and_then(Value::as_str).unwrap_or("auto"),
					}],
				}],
			},
			"streamSettings": build_stream_settings(descriptor),
		}),
		"vless" => json!({
			"protocol": "vless",
			"tag": "proxy",
			"settings": {
				"vnext": [{
					"address": descriptor.address,
					"port": descriptor.port,
					"users": [{
						"id": descriptor.credential,
						"encryption": "none",
						"flow": descriptor.flow.clone().unwrap_or_default(),
					}],
				}],
			},
			"streamSettings": build_stream_settings(descriptor),
		}),
		"trojan" => json!({
			"protocol": "trojan",
			"tag": "proxy",
			"settings": {
				"servers": [{
					"address": descriptor.address,
					"port": descriptor.port,
					"password": descriptor.credential,
				}],
			},
			"streamSettings": build_stream_settings(descriptor),
		}),
		"shadowsocks" => json!({
			"protocol": "shadowsocks",
			"tag": "proxy",
			"settings": {
				"servers": [{
					"address": descriptor.address,
					"port": descriptor.port,
					"method": descriptor.shadowsocks_method,
					"password": descriptor.credential,
				}],
			},
			"streamSettings": { "network": "tcp" },
		}),
		"tuic" => json!({
			"protocol": "vless",
			"tag": "proxy",
			"streamSettings": {
				"network": "tuic",
				"security": "none",
				"tuicSettings": descriptor.extra,
			},
		}),
		"hysteria2" => json!({
			"protocol": "vless",
			"tag": "proxy",
			"streamSettings": {
				"network": "hysteria2",
				"security": "tls",
				"hysteriaSettings": descriptor.extra,
			},
		}),
		other => json!({ "protocol": other, "tag": "proxy" }),
	}
}

/// The base engine config: an HTTP inbound on `port`, the descriptor's
/// primary outbound, a `direct` fallback, and a routing rule that keeps
/// private IPs off the tunnel.
pub fn build_config(descriptor: &OutboundDescriptor, port: u16) -> Value {
	json!({
		"log": { "loglevel": "warning" },
		"inbounds": [{
			"listen": "127.0.0.1",
			"port": port,
			"protocol": "http",
			"settings": { "timeout": 0, "allowTransparent": false, "userLevel": 0 },
			"tag": "http-in",
		}],
		"outbounds": [
			build_outbound(descriptor),
			{ "protocol": "freedom", "tag": "direct" },
		],
		"routing": {
			"domainStrategy": "IPIfNonMatch",
			"rules": [{ "type": "field", "ip": ["geoip:private"], "outboundTag": "direct" }],
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::parse::parse;

	#[test]
	fn builds_inbound_on_requested_port() {
		let descriptor = parse("vless://uuid@host.example:443?security=tls&sni=host.example").unwrap();
		let cfg = build_config(&descriptor, 10801);
		assert_eq!(cfg["inbounds"][0]["port"], json!(10801));
	}

	#[test]
	fn vless_outbound_carries_flow() {
		let descriptor = parse("vless://uuid@host.example:443?security=xtls").unwrap();
		let cfg = build_config(&descriptor, 10801);
		assert_eq!(
			cfg["outbounds"][0]["settings"]["vnext"][0]["users"][0]["flow"],
			json!("xtls-rprx-direct")
		);
	}

	#[test]
	fn routing_sends_private_ips_direct() {
		let descriptor = parse("trojan://pass@host.example:443").unwrap();
		let cfg = build_config(&descriptor, 10801);
		assert_eq!(cfg["routing"]["rules"][0]["outboundTag"], json!("direct"));
	}
}
