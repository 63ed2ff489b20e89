//! The relational backend.
//!
//! Every identifier class maps to one configured statement. A statement takes the
//! identifier as its only bind parameter and returns one flat row per instance, using
//! the column names below. Columns are read as nullable text; missing columns are
//! treated as NULL.

use crate::backend::{ManifestSource, SourceError};
use crate::config::DatabaseConfig;
use crate::criteria::{IdentifierClass, SearchCriteria};
use crate::manifest::{merge_patients, Instance, Patient, Series, Study};
use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

pub struct DatabaseSource {
	pool: AnyPool,
	config: DatabaseConfig,
}

impl DatabaseSource {
	/// Creates the connection pool. Connections are opened on first use.
	pub fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
		sqlx::any::install_default_drivers();
		let pool = AnyPoolOptions::new()
			.max_connections(config.max_connections)
			.connect_lazy(&config.url)?;
		Ok(Self {
			pool,
			config: config.clone(),
		})
	}

	#[instrument(skip_all, fields(%class))]
	async fn query(
		&self,
		class: IdentifierClass,
		ids: &BTreeSet<String>,
	) -> Result<Vec<Patient>, SourceError> {
		let statement = self
			.config
			.statement(class)
			.ok_or(SourceError::MissingStatement(class))?;

		let mut patients = Vec::new();
		for id in ids {
			let rows = sqlx::query(statement)
				.bind(id.as_str())
				.fetch_all(&self.pool)
				.await?;
			debug!(id, rows = rows.len(), "Executed statement");
			merge_patients(&mut patients, rows.iter().filter_map(patient_from_row).collect());
		}
		Ok(patients)
	}
}

#[async_trait]
impl ManifestSource for DatabaseSource {
	async fn build_from_patient_ids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.query(IdentifierClass::PatientId, ids).await
	}

	async fn build_from_accession_numbers(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.query(IdentifierClass::AccessionNumber, ids).await
	}

	async fn build_from_study_uids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.query(IdentifierClass::StudyUid, ids).await
	}

	async fn build_from_series_uids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.query(IdentifierClass::SeriesUid, ids).await
	}

	async fn build_from_sop_uids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.query(IdentifierClass::SopUid, ids).await
	}
}

fn text(row: &AnyRow, column: &str) -> Option<String> {
	row.try_get::<Option<String>, _>(column)
		.ok()
		.flatten()
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}

/// Turns one flat row into a single-branch patient tree.
///
/// Rows without patient id or study UID are dropped. Missing series or instance UIDs
/// end the branch at the level above.
fn patient_from_row(row: &AnyRow) -> Option<Patient> {
	let mut patient = Patient::new(text(row, "patient_id")?, text(row, "issuer_of_patient_id"));
	patient.patient_name = text(row, "patient_name");
	patient.patient_birth_date = text(row, "patient_birth_date");
	patient.patient_sex = text(row, "patient_sex");

	let mut study = Study::new(text(row, "study_instance_uid")?);
	study.study_date = text(row, "study_date");
	study.study_time = text(row, "study_time");
	study.accession_number = text(row, "accession_number");
	study.study_id = text(row, "study_id");
	study.study_description = text(row, "study_description");
	study.referring_physician_name = text(row, "referring_physician_name");

	if let Some(series_uid) = text(row, "series_instance_uid") {
		let mut series = Series::new(series_uid);
		series.modality = text(row, "modality");
		series.series_number = text(row, "series_number");
		series.series_description = text(row, "series_description");

		if let Some(sop_uid) = text(row, "sop_instance_uid") {
			let mut instance = Instance::new(sop_uid);
			instance.instance_number = text(row, "instance_number");
			series.instances.push(instance);
		}
		study.series.push(series);
	}

	patient.studies.push(study);
	Some(patient)
}
