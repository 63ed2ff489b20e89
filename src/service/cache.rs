use crate::manifest::Manifest;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug)]
struct CacheEntry {
	manifest: Arc<Manifest>,
	installed_at: Instant,
}

impl CacheEntry {
	fn new(manifest: Arc<Manifest>) -> Self {
		Self {
			manifest,
			installed_at: Instant::now(),
		}
	}

	fn is_expired(&self, ttl: Duration) -> bool {
		self.installed_at.elapsed() >= ttl
	}
}

/// Key-addressed manifest store.
///
/// Entries expire `ttl` after they were installed, whether their build finished or
/// not. Expired entries are invisible to readers and are dropped lazily or by
/// [`ManifestCache::spawn_sweeper`].
#[derive(Debug, Clone)]
pub struct ManifestCache {
	entries: Arc<DashMap<String, CacheEntry>>,
	ttl: Duration,
}

impl ManifestCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			entries: Arc::new(DashMap::new()),
			ttl,
		}
	}

	/// Installs `manifest` unless a live entry exists and returns the stored manifest.
	///
	/// The caller owns the build exactly if the returned manifest is the one it
	/// passed in ([`Arc::ptr_eq`]).
	pub fn put_if_absent(&self, key: &str, manifest: Arc<Manifest>) -> Arc<Manifest> {
		match self.entries.entry(key.to_owned()) {
			Entry::Occupied(mut occupied) => {
				if occupied.get().is_expired(self.ttl) {
					debug!(key, "Replaced expired entry");
					occupied.insert(CacheEntry::new(Arc::clone(&manifest)));
					manifest
				} else {
					Arc::clone(&occupied.get().manifest)
				}
			}
			Entry::Vacant(vacant) => {
				vacant.insert(CacheEntry::new(Arc::clone(&manifest)));
				manifest
			}
		}
	}

	/// Installs `manifest` unconditionally and restarts its time-to-live.
	pub fn put(&self, key: &str, manifest: Arc<Manifest>) -> Arc<Manifest> {
		self.entries
			.insert(key.to_owned(), CacheEntry::new(Arc::clone(&manifest)));
		manifest
	}

	/// Installs `manifest` only while the entry under `key` still holds `expected`
	/// and returns whether it did. The time-to-live restarts on success.
	pub fn replace(&self, key: &str, expected: &Arc<Manifest>, manifest: Arc<Manifest>) -> bool {
		match self.entries.get_mut(key) {
			Some(mut entry) if Arc::ptr_eq(&entry.manifest, expected) => {
				*entry = CacheEntry::new(manifest);
				true
			}
			_ => false,
		}
	}

	pub fn get(&self, key: &str) -> Option<Arc<Manifest>> {
		let entry = self.entries.get(key)?;
		if !entry.is_expired(self.ttl) {
			return Some(Arc::clone(&entry.manifest));
		}

		// The read guard must be released before the shard is locked for writing.
		drop(entry);
		if self
			.entries
			.remove_if(key, |_, entry| entry.is_expired(self.ttl))
			.is_some()
		{
			debug!(key, "Evicted expired entry");
		}
		None
	}

	pub fn remove(&self, key: &str) -> Option<Arc<Manifest>> {
		self.entries.remove(key).map(|(_, entry)| entry.manifest)
	}

	/// Returns a snapshot of all live entries.
	pub fn get_all(&self) -> Vec<(String, Arc<Manifest>)> {
		self.entries
			.iter()
			.filter(|entry| !entry.is_expired(self.ttl))
			.map(|entry| (entry.key().clone(), Arc::clone(&entry.manifest)))
			.collect()
	}

	pub fn remove_all(&self) {
		self.entries.clear();
	}

	/// Drops every expired entry and returns how many were dropped.
	pub fn evict_expired(&self) -> usize {
		let before = self.entries.len();
		self.entries.retain(|_, entry| !entry.is_expired(self.ttl));
		before.saturating_sub(self.entries.len())
	}

	/// Periodically drops expired entries for as long as the runtime is alive.
	pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
		let cache = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let evicted = cache.evict_expired();
				if evicted > 0 {
					debug!(evicted, "Swept expired manifests");
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::criteria::SearchCriteria;

	const TTL: Duration = Duration::from_secs(60);

	fn manifest() -> Arc<Manifest> {
		Arc::new(Manifest::new(SearchCriteria::default()))
	}

	#[tokio::test]
	async fn put_if_absent_keeps_existing_entry() {
		let cache = ManifestCache::new(TTL);
		let first = manifest();
		let second = manifest();

		let stored = cache.put_if_absent("key", Arc::clone(&first));
		assert!(Arc::ptr_eq(&stored, &first));

		let stored = cache.put_if_absent("key", Arc::clone(&second));
		assert!(Arc::ptr_eq(&stored, &first));
		assert!(Arc::ptr_eq(&cache.get("key").unwrap(), &first));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_put_if_absent_installs_exactly_one() {
		let cache = ManifestCache::new(TTL);
		let tasks: Vec<_> = (0..64)
			.map(|_| {
				let cache = cache.clone();
				tokio::spawn(async move {
					let placeholder = manifest();
					let stored = cache.put_if_absent("key", Arc::clone(&placeholder));
					(Arc::ptr_eq(&stored, &placeholder), stored)
				})
			})
			.collect();

		let mut results = Vec::with_capacity(tasks.len());
		for task in tasks {
			results.push(task.await.unwrap());
		}

		let builders = results.iter().filter(|(owned, _)| *owned).count();
		assert_eq!(builders, 1);
		let stored = cache.get("key").unwrap();
		assert!(results.iter().all(|(_, manifest)| Arc::ptr_eq(manifest, &stored)));
	}

	#[tokio::test]
	async fn put_replaces_entry() {
		let cache = ManifestCache::new(TTL);
		cache.put_if_absent("key", manifest());
		let replacement = manifest();
		cache.put("key", Arc::clone(&replacement));
		assert!(Arc::ptr_eq(&cache.get("key").unwrap(), &replacement));
	}

	#[tokio::test]
	async fn replace_requires_expected_entry() {
		let cache = ManifestCache::new(TTL);
		let placeholder = manifest();
		cache.put_if_absent("key", Arc::clone(&placeholder));

		let finished = manifest();
		assert!(cache.replace("key", &placeholder, Arc::clone(&finished)));
		assert!(Arc::ptr_eq(&cache.get("key").unwrap(), &finished));
		assert!(!cache.replace("key", &placeholder, manifest()));
		assert!(Arc::ptr_eq(&cache.get("key").unwrap(), &finished));

		cache.remove("key");
		assert!(!cache.replace("key", &finished, manifest()));
		assert!(cache.get("key").is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn entries_expire_after_ttl() {
		let cache = ManifestCache::new(TTL);
		let expired = manifest();
		cache.put("key", Arc::clone(&expired));

		tokio::time::advance(TTL - Duration::from_millis(1)).await;
		assert!(cache.get("key").is_some());

		tokio::time::advance(Duration::from_millis(1)).await;
		assert!(cache.get("key").is_none());
		assert!(cache.get_all().is_empty());

		let fresh = manifest();
		cache.put("key", Arc::clone(&expired));
		tokio::time::advance(TTL).await;
		let stored = cache.put_if_absent("key", Arc::clone(&fresh));
		assert!(Arc::ptr_eq(&stored, &fresh));
	}

	#[tokio::test(start_paused = true)]
	async fn put_restarts_ttl() {
		let cache = ManifestCache::new(TTL);
		cache.put_if_absent("key", manifest());
		tokio::time::advance(TTL / 2).await;
		cache.put("key", manifest());
		tokio::time::advance(TTL / 2).await;
		assert!(cache.get("key").is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn sweeper_drops_expired_entries() {
		let cache = ManifestCache::new(TTL);
		cache.put("old", manifest());
		tokio::time::advance(TTL / 2).await;
		cache.put("new", manifest());

		let sweeper = cache.spawn_sweeper(Duration::from_secs(1));
		tokio::time::sleep(TTL / 2 + Duration::from_secs(1)).await;

		let keys: Vec<String> = cache.get_all().into_iter().map(|(key, _)| key).collect();
		assert_eq!(keys, ["new"]);
		assert_eq!(cache.entries.len(), 1);
		sweeper.abort();
	}

	#[tokio::test]
	async fn administrative_operations() {
		let cache = ManifestCache::new(TTL);
		cache.put("a", manifest());
		cache.put("b", manifest());
		assert_eq!(cache.get_all().len(), 2);

		assert!(cache.remove("a").is_some());
		assert!(cache.remove("a").is_none());
		assert!(cache.get("a").is_none());

		cache.remove_all();
		assert!(cache.get_all().is_empty());
		assert!(cache.get("b").is_none());
	}
}
