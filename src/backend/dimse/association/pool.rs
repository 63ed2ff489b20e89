use super::client::{ClientAssociation, ClientAssociationOptions};
use super::AssociationError;
use crate::backend::dimse::cecho::EchoServiceClassUser;
use crate::config::DimseConfig;
use crate::types::{AE, UI};
use futures::TryFutureExt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out")]
	Timeout,
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	async fn create(&self, param: &Self::Parameter)
		-> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &Self::Object) -> Result<(), String>;
}

/// A bounded pool of objects keyed by a creation parameter.
///
/// Idle objects are reused when their parameter matches the requested one; stale
/// objects are recycled through [`Manager::recycle`] before they are handed out.
pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let acquire = async {
			let permit = self
				.inner
				.semaphore
				.acquire()
				.await
				.map_err(|_| PoolError::Timeout)?;

			let idle = {
				let mut slots = self
					.inner
					.slots
					.lock()
					.unwrap_or_else(PoisonError::into_inner);
				let matching = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));
				if matching.is_none() {
					// Make room for the object we are about to create.
					slots.pop_front();
				}
				matching
			};

			let recycled = match idle {
				Some(mut slot) => {
					if self.inner.manager.recycle(&slot.object).await.is_ok() {
						slot.metrics.recycle_count += 1;
						slot.metrics.last_used = Instant::now();
						Some(slot)
					} else {
						None
					}
				}
				None => None,
			};

			let slot = match recycled {
				Some(slot) => slot,
				None => {
					let object = self.inner.manager.create(&parameter).await?;
					ObjectInner::new(object, parameter)
				}
			};

			// Returned by `Object::drop`.
			permit.forget();
			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(slot),
			})
		};

		tokio::time::timeout(self.inner.timeout, acquire)
			.unwrap_or_else(|_| Err(PoolError::Timeout))
			.await
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		match &self.inner {
			Some(inner) => &inner.object,
			None => unreachable!("object is only taken on drop"),
		}
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			if let Some(object) = self.inner.take() {
				pool.slots
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.push_back(object);
			}
			pool.semaphore.add_permits(1);
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	metrics: Metrics,
}

impl<M: Manager> ObjectInner<M> {
	fn new(object: M::Object, parameter: M::Parameter) -> Self {
		let now = Instant::now();
		Self {
			object,
			parameter,
			metrics: Metrics {
				created: now,
				recycle_count: 0,
				last_used: now,
			},
		}
	}
}

#[derive(Debug)]
pub struct Metrics {
	pub created: Instant,
	pub recycle_count: usize,
	pub last_used: Instant,
}

pub struct AssociationManager {
	pub address: SocketAddr,
	pub calling_aet: AE,
	pub called_aet: AE,
}

pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		self.abstract_syntax_uid == other.abstract_syntax_uid
			&& self
				.transfer_syntax_uids
				.iter()
				.any(|ts| other.transfer_syntax_uids.contains(ts))
	}
}

impl Manager for AssociationManager {
	type Object = ClientAssociation;
	type Error = AssociationError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address: self.address,
		};

		match ClientAssociation::new(options).await {
			Ok(association) => {
				info!(
					backend_uuid = association.uuid().to_string(),
					called_aet = self.called_aet,
					"Created new client association"
				);
				Ok(association)
			}
			Err(err) => {
				warn!(called_aet = self.called_aet, "Failed to create client association: {err}");
				Err(PoolError::Backend(err))
			}
		}
	}

	async fn recycle(&self, association: &Self::Object) -> Result<(), String> {
		let successful = EchoServiceClassUser::new(association)
			.echo(Duration::from_secs(5))
			.await
			.map_err(|err| format!("Failed to recycle association: {err}"))?;

		if successful {
			Ok(())
		} else {
			warn!(
				backend_uuid = association.uuid().to_string(),
				"Recycling failed"
			);
			Err(String::from("C-ECHO returned non-successful status code"))
		}
	}
}

pub type AssociationPool = Pool<AssociationManager>;

impl AssociationPool {
	/// Creates the association pool towards the archive described by `config`.
	pub fn for_archive(calling_aet: &str, config: &DimseConfig) -> Self {
		let manager = AssociationManager {
			address: SocketAddr::from((config.host, config.port)),
			calling_aet: AE::from(calling_aet),
			called_aet: config.aet.clone(),
		};
		info!(
			called_aet = config.aet,
			pool_size = config.pool.size,
			"Created new association pool"
		);
		Self::new(
			manager,
			config.pool.size,
			Duration::from_millis(config.pool.timeout),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Default)]
	struct CountingManager {
		created: AtomicUsize,
	}

	impl Manager for CountingManager {
		type Object = usize;
		type Error = ();
		type Parameter = &'static str;

		async fn create(&self, _: &Self::Parameter) -> Result<usize, PoolError<()>> {
			Ok(self.created.fetch_add(1, Ordering::SeqCst))
		}

		async fn recycle(&self, _: &usize) -> Result<(), String> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn reuses_idle_objects_with_same_parameter() {
		let pool = Pool::new(CountingManager::default(), 2, Duration::from_secs(1));
		let first = *pool.get("find").await.unwrap();
		let second = *pool.get("find").await.unwrap();
		assert_eq!(first, second);

		let other = *pool.get("echo").await.unwrap();
		assert_ne!(first, other);
	}

	#[tokio::test(start_paused = true)]
	async fn times_out_when_exhausted() {
		let pool = Pool::new(CountingManager::default(), 1, Duration::from_millis(100));
		let _held = pool.get("find").await.unwrap();
		let result = pool.get("find").await;
		assert!(matches!(result, Err(PoolError::Timeout)));
	}
}
