//! Shared low-level types used across the `scout` workspace.

use std::time::Duration;

/// An immutable, cheaply-cloneable string, used pervasively for hostnames,
/// URIs, and other small bits of text that get passed around workers.
pub type Strng = arcstr::ArcStr;

/// Parses a duration given either as a bare number of seconds or as a
/// `"30s"` / `"2m"`-style suffixed string. Mirrors the permissive duration
/// parsing used throughout the ambient config layer.
pub fn parse_duration(raw: &str) -> Result<Duration, DurationParseError> {
	let raw = raw.trim();
	if raw.is_empty() {
		return Err(DurationParseError(raw.to_string()));
	}
	if let Ok(secs) = raw.parse::<f64>() {
		if secs.is_finite() && secs >= 0.0 {
			return Ok(Duration::from_secs_f64(secs));
		}
	}
	let (num, suffix) = raw.split_at(
		raw.find(|c: char| !c.is_ascii_digit() && c != '.')
			.unwrap_or(raw.len()),
	);
	let value: f64 = num.parse().map_err(|_| DurationParseError(raw.to_string()))?;
	let mul = match suffix {
		"ms" => 0.001,
		"s" => 1.0,
		"m" => 60.0,
		"h" => 3600.0,
		_ => return Err(DurationParseError(raw.to_string())),
	};
	Ok(Duration::from_secs_f64(value * mul))
}

#[derive(thiserror::Error, Debug)]
#[error("invalid duration: {0}")]
pub struct DurationParseError(String);

/// A small counter/gauge registry, exported as Prometheus text exposition.
///
/// Kept intentionally narrow: this is not a general metrics framework, just
/// the handful of series the orchestrator needs to report.
pub mod metrics {
	use prometheus_client::encoding::text::encode;
	use prometheus_client::metrics::counter::Counter;
	use prometheus_client::metrics::family::Family;
	use prometheus_client::metrics::gauge::Gauge;
	use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
	use prometheus_client::registry::Registry;

	#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
	pub struct ProtocolLabel {
		pub protocol: String,
	}

	#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
	pub struct ComponentLabel {
		pub component: String,
	}

	pub struct Metrics {
		registry: Registry,
		pub configs_tested_total: Counter,
		pub configs_found_total: Family<ProtocolLabel, Counter>,
		pub configs_queue_size: Gauge,
		pub active_workers: Gauge,
		pub errors_total: Family<ComponentLabel, Counter>,
		pub test_duration_seconds: Histogram,
	}

	impl Metrics {
		pub fn new() -> Self {
			let mut registry = Registry::with_prefix("scout");
			let configs_tested_total = Counter::default();
			let configs_found_total = Family::default();
			let configs_queue_size = Gauge::default();
			let active_workers = Gauge::default();
			let errors_total = Family::default();
			let test_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 8));

			registry.register(
				"configs_tested_total",
				"Total number of configs tested",
				configs_tested_total.clone(),
			);
			registry.register(
				"configs_found_total",
				"Total number of working configs found",
				configs_found_total.clone(),
			);
			registry.register(
				"configs_queue_size",
				"Current size of the config queue",
				configs_queue_size.clone(),
			);
			registry.register(
				"active_workers",
				"Number of active worker tasks",
				active_workers.clone(),
			);
			registry.register("errors_total", "Total errors encountered", errors_total.clone());
			registry.register(
				"test_duration_seconds",
				"Time taken to test a config",
				test_duration_seconds.clone(),
			);

			Self {
				registry,
				configs_tested_total,
				configs_found_total,
				configs_queue_size,
				active_workers,
				errors_total,
				test_duration_seconds,
			}
		}

		pub fn export(&self) -> String {
			let mut buf = String::new();
			// encode() only fails on a formatting error into the String buffer.
			encode(&mut buf, &self.registry).expect("encoding metrics never fails");
			buf
		}
	}

	impl Default for Metrics {
		fn default() -> Self {
			Self::new()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_plain_seconds() {
		assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
		assert_eq!(parse_duration("2.5").unwrap(), Duration::from_secs_f64(2.5));
	}

	#[test]
	fn parses_suffixed() {
		assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
		assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
		assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse_duration("banana").is_err());
		assert!(parse_duration("").is_err());
	}
}
