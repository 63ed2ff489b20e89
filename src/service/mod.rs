//! The manifest build coordinator.
//!
//! A key moves from absent to building when a request installs an in-progress
//! placeholder, and from building to ready when the finished manifest replaces the
//! placeholder. Only the request whose placeholder got installed builds; every other
//! request polls the cache.

mod cache;
mod dispatcher;
mod poller;

pub use cache::ManifestCache;
pub use dispatcher::ConnectorDispatcher;
pub use poller::RetryPoller;

use crate::backend::{ConnectorRegistry, UnknownArchive};
use crate::criteria::SearchCriteria;
use crate::manifest::Manifest;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum BuildError {
	#[error(transparent)]
	UnknownArchive(#[from] UnknownArchive),
}

/// Handle to the manifest cache and the machinery that fills it.
#[derive(Clone)]
pub struct ManifestService {
	inner: Arc<Inner>,
}

struct Inner {
	cache: ManifestCache,
	dispatcher: ConnectorDispatcher,
	poller: RetryPoller,
}

impl ManifestService {
	pub fn new(cache: ManifestCache, registry: ConnectorRegistry, poller: RetryPoller) -> Self {
		Self {
			inner: Arc::new(Inner {
				cache,
				dispatcher: ConnectorDispatcher::new(registry),
				poller,
			}),
		}
	}

	pub fn cache(&self) -> &ManifestCache {
		&self.inner.cache
	}

	pub fn registry(&self) -> &ConnectorRegistry {
		self.inner.dispatcher.registry()
	}

	/// Makes sure a manifest for `criteria` exists or is being built and returns its
	/// cache key.
	///
	/// Unknown archive ids are rejected before anything is cached. A new build runs on
	/// a background task.
	#[instrument(skip_all)]
	pub fn trigger(&self, criteria: SearchCriteria) -> Result<String, BuildError> {
		self.registry().select(&criteria)?;
		let key = criteria.cache_key();

		let placeholder = Arc::new(Manifest::new(criteria));
		let stored = self.cache().put_if_absent(&key, Arc::clone(&placeholder));
		if Arc::ptr_eq(&stored, &placeholder) {
			info!(key, "Started manifest build");
			let service = self.clone();
			let build_key = key.clone();
			tokio::spawn(async move { service.build(&build_key, &placeholder).await });
		}
		Ok(key)
	}

	/// Runs the build owned by `placeholder` and commits its result.
	///
	/// The committed manifest is never in progress, even if the build failed or
	/// panicked. It only replaces `placeholder`: an entry removed or replaced in the
	/// meantime stays that way.
	async fn build(&self, key: &str, placeholder: &Arc<Manifest>) {
		let mut manifest = Manifest::clone(placeholder);
		let outcome = AssertUnwindSafe(self.inner.dispatcher.dispatch(&mut manifest))
			.catch_unwind()
			.await;
		match outcome {
			Ok(Ok(())) => {}
			Ok(Err(err)) => warn!(key, "Manifest build failed: {err}"),
			Err(_) => error!(key, "Manifest build panicked"),
		}

		let manifest = manifest.finish();
		let archives = manifest.arc_queries().len();
		let duration = manifest.build_duration();
		if self.cache().replace(key, placeholder, Arc::new(manifest)) {
			info!(key, archives, ?duration, "Finished manifest build");
		} else {
			info!(key, "Discarded manifest whose entry was removed during its build");
		}
	}

	/// Returns the manifest cached under `key`, waiting while it is being built.
	///
	/// An entry that disappears while it is awaited is rebuilt once from the criteria
	/// of its placeholder. Returns `None` for unknown keys and when the build outlasts
	/// the poll budget.
	pub async fn retrieve(&self, key: &str) -> Option<Arc<Manifest>> {
		let cache = self.cache();
		let mut retriggered = false;
		loop {
			let mut pending: Option<Arc<Manifest>> = None;
			let found = self
				.inner
				.poller
				.poll(
					|| {
						let manifest = cache.get(key);
						if let Some(placeholder) = manifest
							.as_ref()
							.filter(|manifest| manifest.is_build_in_progress())
						{
							pending = Some(Arc::clone(placeholder));
						}
						std::future::ready(manifest)
					},
					|manifest| {
						manifest
							.as_ref()
							.is_none_or(|manifest| !manifest.is_build_in_progress())
					},
				)
				.await?;

			match (found, pending) {
				(Some(manifest), _) => return Some(manifest),
				(None, Some(placeholder)) if !retriggered => {
					warn!(key, "Manifest was evicted during its build");
					retriggered = true;
					self.trigger(placeholder.search_criteria().clone()).ok()?;
				}
				(None, _) => return None,
			}
		}
	}
}
