//! Source Fetcher: retrieves a remote list, decodes it (plain text, a
//! base64-wrapped blob, or a ZIP of text members), and extracts candidate
//! URIs via regex.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;

/// Set when a known API host (e.g. GitHub) signals we've hit its rate
/// limit, so the orchestrator can observe and react without plumbing the
/// condition through every call site.
static API_RATE_LIMITED: AtomicBool = AtomicBool::new(false);

pub fn is_api_rate_limited() -> bool {
	API_RATE_LIMITED.load(Ordering::Relaxed)
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
	#[error("source temporarily rate-limited by its host")]
	UpstreamRateLimited,
	#[error(transparent)]
	Http(#[from] reqwest::Error),
}

static URI_REGEX: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r#"(?:vmess|vless|trojan|ss|ssr|tuic|hysteria2)://[^\s<>"']+"#).expect("static regex is valid")
});

pub struct SourceFetcher {
	client: reqwest::Client,
	retry_count: u32,
}

impl SourceFetcher {
	pub fn new(client: reqwest::Client, retry_count: u32) -> Self {
		Self { client, retry_count }
	}

	/// Fetches the body of `url` with retries, returning `None` if the
	/// remote host signalled it doesn't want more requests right now.
	async fn get_with_retry(&self, url: &str, binary: bool) -> Option<Vec<u8>> {
		for attempt in 0..self.retry_count.max(1) {
			let resp = match self.client.get(url).timeout(Duration::from_secs(15)).send().await {
				Ok(r) => r,
				Err(_e) => {
					if attempt + 1 < self.retry_count {
						tokio::time::sleep(Duration::from_secs_f64(0.5 + attempt as f64 * 1.5)).await;
					}
					continue;
				}
			};

			match resp.status().as_u16() {
				200 => {
					let body = if binary {
						resp.bytes().await.ok()?.to_vec()
					} else {
						resp.text().await.ok()?.into_bytes()
					};
					return Some(body);
				}
				403 if url.contains("github.com") => {
					tracing::warn!(%url, "github API rate limit reached");
					API_RATE_LIMITED.store(true, Ordering::Relaxed);
					return None;
				}
				429 => {
					tracing::warn!(%url, "rate limited, retrying");
					tokio::time::sleep(Duration::from_secs_f64(2f64.powi(attempt as i32))).await;
				}
				_ => {}
			}
		}
		None
	}

	pub async fn fetch(&self, url: &str) -> Vec<String> {
		let is_zip = url.to_lowercase().ends_with(".zip");
		let Some(content) = self.get_with_retry(url, is_zip).await else {
			return Vec::new();
		};

		let mut texts = Vec::new();
		if is_zip {
			if let Ok(mut archive) = zip::ZipArchive::new(std::io::Cursor::new(content)) {
				for i in 0..archive.len() {
					let Ok(mut entry) = archive.by_index(i) else { continue };
					if entry.is_dir() || entry.name().starts_with("__") {
						continue;
					}
					let mut buf = String::new();
					if entry.read_to_string(&mut buf).is_ok() {
						texts.push(buf);
					}
				}
			} else {
				tracing::warn!(%url, "invalid zip archive");
			}
		} else {
			texts.push(String::from_utf8_lossy(&content).into_owned());
		}

		let mut uris = Vec::new();
		for text in texts {
			let decoded = heuristic_base64_decode(&text).unwrap_or(text);
			uris.extend(URI_REGEX.find_iter(&decoded).map(|m| m.as_str().to_string()));
		}
		uris
	}
}

/// Subscriptions are commonly a single base64 blob; this guesses whether
/// the body looks like one (no whitespace in the first 100 bytes, long
/// enough to be worth trying) before committing to a decode attempt.
fn heuristic_base64_decode(text: &str) -> Option<String> {
	let head = &text[..text.len().min(100)];
	if head.contains(' ') || text.len() <= 10 {
		return None;
	}
	let decoded = base64::engine::general_purpose::STANDARD.decode(text.trim()).ok()?;
	String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_uris_from_plain_text() {
		let text = "vmess://abc\nnoise\nvless://def@host:443";
		let found: Vec<_> = URI_REGEX.find_iter(text).map(|m| m.as_str().to_string()).collect();
		assert_eq!(found, vec!["vmess://abc", "vless://def@host:443"]);
	}

	#[test]
	fn heuristic_skips_short_text() {
		assert_eq!(heuristic_base64_decode("vmess://a"), None);
	}

	#[test]
	fn heuristic_skips_text_with_spaces() {
		assert_eq!(heuristic_base64_decode("this has many spaces in it for sure"), None);
	}
}
