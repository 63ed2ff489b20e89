use crate::config::CacheConfig;
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Bounded retry loop for reads that may observe a build in progress.
#[derive(Debug, Clone, Copy)]
pub struct RetryPoller {
	attempts: u32,
	interval: Duration,
}

impl RetryPoller {
	pub const fn new(attempts: u32, interval: Duration) -> Self {
		Self { attempts, interval }
	}

	pub const fn from_config(config: &CacheConfig) -> Self {
		Self::new(config.poll_attempts, config.poll_interval())
	}

	/// Calls `fetch` until `is_done` accepts its value or the attempts are used up.
	///
	/// Returns `None` once the budget is exhausted. At least one attempt is made. No
	/// lock may be held by `fetch` across the returned future's sleeps.
	pub async fn poll<T, F, Fut, D>(&self, mut fetch: F, is_done: D) -> Option<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = T>,
		D: Fn(&T) -> bool,
	{
		let attempts = self.attempts.max(1);
		for attempt in 1..=attempts {
			let value = fetch().await;
			if is_done(&value) {
				return Some(value);
			}
			if attempt < attempts {
				trace!(attempt, "Value is not ready yet");
				tokio::time::sleep(self.interval).await;
			}
		}
		None
	}
}
