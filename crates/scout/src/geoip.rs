//! GeoIP enrichment: a local MaxMind-format database first, falling back
//! to a short list of free HTTPS JSON providers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::ratelimit::{extract_domain, RateClass, RateLimiter};

#[derive(Clone, Debug, Default)]
pub struct GeoipInfo {
	pub country: String,
	pub country_code: String,
	pub city: String,
	pub isp: String,
}

impl GeoipInfo {
	fn unknown() -> Self {
		Self {
			country: "Unknown".to_string(),
			country_code: "XX".to_string(),
			city: "Unknown".to_string(),
			isp: "Unknown".to_string(),
		}
	}
}

pub struct GeoipResolver {
	reader: Option<maxminddb::Reader<Vec<u8>>>,
	client: reqwest::Client,
	rate_limiter: Arc<RateLimiter>,
}

impl GeoipResolver {
	pub fn new(db_path: Option<&Path>, client: reqwest::Client, rate_limiter: Arc<RateLimiter>) -> Self {
		let reader = db_path.and_then(|p| match maxminddb::Reader::open_readfile(p) {
			Ok(r) => {
				tracing::info!(path = %p.display(), "loaded GeoIP database");
				Some(r)
			}
			Err(e) => {
				tracing::warn!(path = %p.display(), error = %e, "failed to load GeoIP database");
				None
			}
		});
		Self { reader, client, rate_limiter }
	}

	pub async fn lookup(&self, ip: &str) -> GeoipInfo {
		if let Some(info) = self.lookup_local(ip) {
			return info;
		}
		self.lookup_online(ip).await.unwrap_or_else(GeoipInfo::unknown)
	}

	fn lookup_local(&self, ip: &str) -> Option<GeoipInfo> {
		let reader = self.reader.as_ref()?;
		let addr: std::net::IpAddr = ip.parse().ok()?;
		let city: maxminddb::geoip2::City = reader.lookup(addr).ok()??;
		Some(GeoipInfo {
			country: city
				.country
				.as_ref()
				.and_then(|c| c.names.as_ref())
				.and_then(|n| n.get("en"))
				.map(|s| s.to_string())
				.unwrap_or_else(|| "Unknown".to_string()),
			country_code: city
				.country
				.as_ref()
				.and_then(|c| c.iso_code)
				.map(String::from)
				.unwrap_or_else(|| "XX".to_string()),
			city: city
				.city
				.as_ref()
				.and_then(|c| c.names.as_ref())
				.and_then(|n| n.get("en"))
				.map(|s| s.to_string())
				.unwrap_or_else(|| "Unknown".to_string()),
			isp: "Unknown".to_string(),
		})
	}

	async fn lookup_online(&self, ip: &str) -> Option<GeoipInfo> {
		if let Some(info) = self.try_ipwho(ip).await {
			return Some(info);
		}
		self.try_ip_api(ip).await
	}

	async fn try_ipwho(&self, ip: &str) -> Option<GeoipInfo> {
		#[derive(Deserialize)]
		struct IpWhoIs {
			#[serde(default)]
			success: Option<bool>,
			#[serde(default)]
			country: Option<String>,
			#[serde(default)]
			country_code: Option<String>,
			#[serde(default)]
			city: Option<String>,
			#[serde(default)]
			connection: Option<IpWhoIsConnection>,
		}
		#[derive(Deserialize)]
		struct IpWhoIsConnection {
			#[serde(default)]
			isp: Option<String>,
		}

		let domain = extract_domain("https://ipwho.is/");
		if !self.rate_limiter.acquire_or_wait(&domain, RateClass::Geoip, 1.0).await {
			return None;
		}

		let resp = self
			.client
			.get(format!("https://ipwho.is/{ip}"))
			.timeout(Duration::from_secs(15))
			.send()
			.await
			.ok()?;
		let data: IpWhoIs = resp.json().await.ok()?;
		if data.success == Some(false) {
			return None;
		}
		Some(GeoipInfo {
			country: data.country.unwrap_or_else(|| "Unknown".to_string()),
			country_code: data.country_code.unwrap_or_else(|| "XX".to_string()),
			city: data.city.unwrap_or_else(|| "Unknown".to_string()),
			isp: data.connection.and_then(|c| c.isp).unwrap_or_else(|| "Unknown".to_string()),
		})
	}

	async fn try_ip_api(&self, ip: &str) -> Option<GeoipInfo> {
		#[derive(Deserialize)]
		struct IpApi {
			#[serde(default)]
			status: Option<String>,
			#[serde(default)]
			country: Option<String>,
			#[serde(default, rename = "countryCode")]
			country_code: Option<String>,
			#[serde(default)]
			city: Option<String>,
			#[serde(default)]
			isp: Option<String>,
		}

		let domain = extract_domain("http://ip-api.com/");
		if !self.rate_limiter.acquire_or_wait(&domain, RateClass::Geoip, 1.0).await {
			return None;
		}

		let resp = self
			.client
			.get(format!("http://ip-api.com/json/{ip}"))
			.timeout(Duration::from_secs(15))
			.send()
			.await
			.ok()?;
		let data: IpApi = resp.json().await.ok()?;
		if data.status.as_deref() == Some("fail") {
			return None;
		}
		Some(GeoipInfo {
			country: data.country.unwrap_or_else(|| "Unknown".to_string()),
			country_code: data.country_code.unwrap_or_else(|| "XX".to_string()),
			city: data.city.unwrap_or_else(|| "Unknown".to_string()),
			isp: data.isp.unwrap_or_else(|| "Unknown".to_string()),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_default_has_placeholder_fields() {
		let info = GeoipInfo::unknown();
		assert_eq!(info.country_code, "XX");
	}

	#[tokio::test]
	async fn missing_db_path_disables_local_lookup() {
		let resolver = GeoipResolver::new(None, reqwest::Client::new(), Arc::new(crate::ratelimit::RateLimiter::new()));
		assert!(resolver.lookup_local("1.1.1.1").is_none());
	}
}
