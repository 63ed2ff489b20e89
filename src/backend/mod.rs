//! Archive access.
//!
//! Every configured connector is backed by a [`ManifestSource`], either the DICOM
//! network backend ([`dimse`]) or a relational database ([`database`]).

use crate::config::{AppConfig, BackendConfig, ConnectorConfig};
use crate::criteria::{IdentifierClass, SearchCriteria};
use crate::manifest::Patient;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub mod database;
pub mod dimse;

/// Resolves identifiers of one class into patient trees.
///
/// A source returns its own patients; merging them into a manifest is the
/// responsibility of the caller.
#[async_trait]
pub trait ManifestSource: Send + Sync {
	async fn build_from_patient_ids(
		&self,
		ids: &BTreeSet<String>,
		criteria: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError>;

	async fn build_from_accession_numbers(
		&self,
		ids: &BTreeSet<String>,
		criteria: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError>;

	async fn build_from_study_uids(
		&self,
		ids: &BTreeSet<String>,
		criteria: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError>;

	async fn build_from_series_uids(
		&self,
		ids: &BTreeSet<String>,
		criteria: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError>;

	async fn build_from_sop_uids(
		&self,
		ids: &BTreeSet<String>,
		criteria: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError>;

	async fn build_from(
		&self,
		class: IdentifierClass,
		ids: &BTreeSet<String>,
		criteria: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		match class {
			IdentifierClass::PatientId => self.build_from_patient_ids(ids, criteria).await,
			IdentifierClass::AccessionNumber => {
				self.build_from_accession_numbers(ids, criteria).await
			}
			IdentifierClass::StudyUid => self.build_from_study_uids(ids, criteria).await,
			IdentifierClass::SeriesUid => self.build_from_series_uids(ids, criteria).await,
			IdentifierClass::SopUid => self.build_from_sop_uids(ids, criteria).await,
		}
	}
}

#[derive(Debug, Error)]
pub enum SourceError {
	#[error(transparent)]
	Find(#[from] dimse::FindError),
	#[error(transparent)]
	Database(#[from] sqlx::Error),
	#[error("No statement is configured for {0}")]
	MissingStatement(IdentifierClass),
}

/// A configured archive together with the source that queries it.
pub struct Connector {
	pub config: ConnectorConfig,
	pub source: Arc<dyn ManifestSource>,
}

#[derive(Debug, Error)]
#[error("Unknown archive {0}")]
pub struct UnknownArchive(pub String);

/// Configured connectors in registry order.
#[derive(Clone)]
pub struct ConnectorRegistry {
	connectors: Arc<[Connector]>,
}

impl ConnectorRegistry {
	pub fn new(connectors: Vec<Connector>) -> Self {
		Self {
			connectors: connectors.into(),
		}
	}

	/// Creates a source for every configured connector.
	pub fn from_config(config: &AppConfig) -> Result<Self, sqlx::Error> {
		let mut connectors = Vec::with_capacity(config.connectors.len());
		for connector in &config.connectors {
			let source: Arc<dyn ManifestSource> = match &connector.backend {
				BackendConfig::Dimse(dimse) => {
					Arc::new(dimse::DimseSource::new(&config.server.aet, dimse))
				}
				BackendConfig::Database(database) => {
					Arc::new(database::DatabaseSource::new(database)?)
				}
			};
			info!(connector = connector.id, "Registered connector");
			connectors.push(Connector {
				config: connector.clone(),
				source,
			});
		}
		Ok(Self::new(connectors))
	}

	pub fn get(&self, id: &str) -> Option<&Connector> {
		self.connectors
			.iter()
			.find(|connector| connector.config.id == id)
	}

	/// Returns the connectors a request is dispatched to: the requested archives in
	/// request order, or every connector in registry order.
	pub fn select(&self, criteria: &SearchCriteria) -> Result<Vec<&Connector>, UnknownArchive> {
		if criteria.archives().is_empty() {
			return Ok(self.connectors.iter().collect());
		}

		criteria
			.archives()
			.iter()
			.map(|id| self.get(id).ok_or_else(|| UnknownArchive(id.clone())))
			.collect()
	}
}
