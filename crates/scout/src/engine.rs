//! Proxy Engine Adapter: launches and tears down the external proxy
//! executable bound to a generated config file and a loopback port.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
	#[error("engine exited immediately on port {port}: {stderr}")]
	StartupFailed { port: u16, stderr: String },
	#[error("failed to spawn engine process: {0}")]
	SpawnFailed(#[source] std::io::Error),
}

/// A narrow trait so additional proxy engines can be supported by adding
/// another implementation; engine selection is a compile-time choice, not
/// a runtime plugin system.
#[async_trait::async_trait]
pub trait ProxyEngineAdapter: Send + Sync {
	async fn start(&self, config_path: &str, port: u16) -> Result<EngineHandle, EngineError>;
	async fn stop(&self, handle: EngineHandle);
	async fn version(&self) -> String;
}

pub struct EngineHandle {
	child: Child,
	pub pid: Option<u32>,
}

const STARTUP_SETTLE: Duration = Duration::from_millis(150);
const GRACEFUL_STOP: Duration = Duration::from_secs(2);

pub struct XrayEngine {
	executable: String,
}

impl XrayEngine {
	pub fn new(executable: impl Into<String>) -> Self {
		Self { executable: executable.into() }
	}

	fn command(&self, args: &[&str]) -> Command {
		let mut cmd = Command::new(&self.executable);
		cmd.args(args);
		#[cfg(unix)]
		{
			use std::os::unix::process::CommandExt;
			// Own process group so the shutdown manager can signal the
			// child without affecting our own process tree.
			unsafe {
				cmd.pre_exec(|| {
					libc::setpgid(0, 0);
					Ok(())
				});
			}
		}
		cmd
	}
}

#[async_trait::async_trait]
impl ProxyEngineAdapter for XrayEngine {
	async fn start(&self, config_path: &str, port: u16) -> Result<EngineHandle, EngineError> {
		let mut cmd = self.command(&["run", "-c", config_path]);
		cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

		let mut child = cmd.spawn().map_err(EngineError::SpawnFailed)?;
		let pid = child.id();

		match timeout(STARTUP_SETTLE, child.wait()).await {
			Ok(Ok(_status)) => {
				let mut stdout = String::new();
				if let Some(mut pipe) = child.stdout.take() {
					let _ = pipe.read_to_string(&mut stdout).await;
				}
				let mut stderr = String::new();
				if let Some(mut pipe) = child.stderr.take() {
					let _ = pipe.read_to_string(&mut stderr).await;
				}
				tracing::error!(port, %config_path, %stdout, %stderr, "engine exited immediately");
				Err(EngineError::StartupFailed { port, stderr })
			}
			Ok(Err(e)) => Err(EngineError::SpawnFailed(e)),
			Err(_elapsed) => {
				// Still running after the settle window: healthy start.
				Ok(EngineHandle { child, pid })
			}
		}
	}

	async fn stop(&self, mut handle: EngineHandle) {
		if let Ok(Some(_status)) = handle.child.try_wait() {
			return;
		}

		#[cfg(unix)]
		{
			if let Some(pid) = handle.pid {
				unsafe {
					libc::kill(pid as i32, libc::SIGTERM);
				}
			}
		}
		#[cfg(not(unix))]
		{
			let _ = handle.child.start_kill();
		}

		if timeout(GRACEFUL_STOP, handle.child.wait()).await.is_err() {
			tracing::warn!(pid = ?handle.pid, "engine did not terminate gracefully, killing");
			let _ = handle.child.start_kill();
			let _ = handle.child.wait().await;
		}
	}

	async fn version(&self) -> String {
		let Ok(output) = self.command(&["version"]).output().await else {
			return "Unknown".to_string();
		};
		String::from_utf8_lossy(&output.stdout)
			.lines()
			.next()
			.unwrap_or("Unknown")
			.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn start_reports_immediate_exit_as_failure() {
		// `false` exits non-zero immediately; `true` exits 0 immediately.
		// Either way it should be treated as a startup failure, since we
		// never see the process survive the settle window.
		let engine = XrayEngine::new("false");
		let result = engine.start("/dev/null", 10801).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn version_falls_back_to_unknown_on_missing_binary() {
		let engine = XrayEngine::new("/nonexistent/path/to/xray");
		assert_eq!(engine.version().await, "Unknown");
	}
}
