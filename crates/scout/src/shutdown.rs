//! Shutdown Manager: tracks live tasks and live child PIDs, and on
//! request cancels, reaps, and cleans up within a single budgeted
//! deadline.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub struct ShutdownManager {
	is_shutting_down: AtomicBool,
	notify: Notify,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	pids: Mutex<Vec<u32>>,
	cleanups: Mutex<Vec<CleanupFn>>,
}

impl Default for ShutdownManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ShutdownManager {
	pub fn new() -> Self {
		Self {
			is_shutting_down: AtomicBool::new(false),
			notify: Notify::new(),
			tasks: Mutex::new(Vec::new()),
			pids: Mutex::new(Vec::new()),
			cleanups: Mutex::new(Vec::new()),
		}
	}

	pub fn register_task(&self, handle: JoinHandle<()>) {
		self.tasks.lock().push(handle);
	}

	pub fn register_child(&self, pid: u32) {
		self.pids.lock().push(pid);
	}

	pub fn unregister_child(&self, pid: u32) {
		self.pids.lock().retain(|p| *p != pid);
	}

	pub fn register_cleanup<F, Fut>(&self, cleanup: F)
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		self.cleanups.lock().push(Box::new(move || Box::pin(cleanup())));
	}

	pub fn is_requested(&self) -> bool {
		self.is_shutting_down.load(Ordering::SeqCst)
	}

	/// Idempotent: a second call is a no-op so multiple signal handlers or
	/// error paths can all call it freely.
	pub fn request(&self) {
		if !self.is_shutting_down.swap(true, Ordering::SeqCst) {
			self.notify.notify_waiters();
		}
	}

	pub async fn wait_for_request(&self) {
		if self.is_requested() {
			return;
		}
		self.notify.notified().await;
	}

	pub async fn execute(&self, budget: Duration) {
		let per_phase = budget / 3;

		let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
		for task in &tasks {
			task.abort();
		}
		let joins = futures::future::join_all(tasks.into_iter().map(|t| async move {
			let _ = t.await;
		}));
		let _ = timeout(per_phase, joins).await;

		let pids: Vec<_> = std::mem::take(&mut *self.pids.lock());
		for pid in pids {
			kill_pid(pid);
		}

		let cleanups: Vec<_> = std::mem::take(&mut *self.cleanups.lock());
		if !cleanups.is_empty() {
			let per_cleanup = per_phase / cleanups.len() as u32;
			for cleanup in cleanups {
				if timeout(per_cleanup, cleanup()).await.is_err() {
					tracing::warn!("cleanup callback exceeded its shutdown budget, skipping");
				}
			}
		}
	}
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
	unsafe {
		libc::kill(pid as i32, libc::SIGTERM);
	}
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
	if let Err(e) = std::process::Command::new("taskkill").args(["/PID", &pid.to_string(), "/F"]).output() {
		tracing::warn!(pid, error = %e, "taskkill failed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn request_is_idempotent() {
		let mgr = ShutdownManager::new();
		mgr.request();
		mgr.request();
		assert!(mgr.is_requested());
	}

	#[tokio::test]
	async fn execute_runs_cleanup_callbacks() {
		let mgr = ShutdownManager::new();
		let (tx, rx) = tokio::sync::oneshot::channel();
		let tx = Mutex::new(Some(tx));
		mgr.register_cleanup(move || {
			let tx = tx.lock().take();
			async move {
				if let Some(tx) = tx {
					let _ = tx.send(());
				}
			}
		});
		mgr.execute(Duration::from_secs(1)).await;
		assert!(rx.await.is_ok());
	}
}
