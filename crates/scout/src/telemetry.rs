//! Structured logging setup: a `tracing-subscriber` `EnvFilter` built from
//! the resolved config, with `--debug` raising the default level.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(filter: &str, debug: bool) {
	let directive = if debug { "debug" } else { filter };
	let env_filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

	let subscriber = fmt::Subscriber::builder().with_env_filter(env_filter).finish();

	if tracing::subscriber::set_global_default(subscriber).is_err() {
		tracing::debug!("global tracing subscriber already set");
	}
}
