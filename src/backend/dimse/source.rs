use super::association::pool::AssociationPool;
use super::cfind::{FindError, FindServiceClassUser, Finder};
use crate::backend::{ManifestSource, SourceError};
use crate::config::DimseConfig;
use crate::criteria::SearchCriteria;
use crate::manifest::{Instance, Patient, Series, Study};
use crate::types::QueryRetrieveLevel;
use async_trait::async_trait;
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp, AttributeSelector};
use dicom::core::{PrimitiveValue, Tag};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, trace, warn};

const PATIENT_TAGS: &[Tag] = &[
	tags::PATIENT_ID,
	tags::ISSUER_OF_PATIENT_ID,
	tags::PATIENT_NAME,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
];

const STUDY_TAGS: &[Tag] = &[
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::STUDY_ID,
	tags::STUDY_DESCRIPTION,
	tags::REFERRING_PHYSICIAN_NAME,
];

const SERIES_TAGS: &[Tag] = &[
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::MODALITY,
	tags::SERIES_NUMBER,
	tags::SERIES_DESCRIPTION,
];

const INSTANCE_TAGS: &[Tag] = &[
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::SOP_INSTANCE_UID,
	tags::INSTANCE_NUMBER,
];

/// Resolves identifiers with C-FIND against a DICOM archive using the Study Root
/// information model.
pub struct DimseSource {
	finder: Arc<dyn Finder>,
}

impl DimseSource {
	pub fn new(calling_aet: &str, config: &DimseConfig) -> Self {
		let pool = AssociationPool::for_archive(calling_aet, config);
		Self::with_finder(Arc::new(FindServiceClassUser::new(
			pool,
			Duration::from_millis(config.timeout),
		)))
	}

	pub fn with_finder(finder: Arc<dyn Finder>) -> Self {
		Self { finder }
	}

	async fn find(
		&self,
		level: QueryRetrieveLevel,
		matching: &[(Tag, &str)],
	) -> Result<Vec<InMemDicomObject>, FindError> {
		let results = self.finder.find(identifier(level, matching)).await?;
		trace!(%level, matches = results.len(), "C-FIND completed");
		Ok(results)
	}

	/// Finds studies matching one attribute and expands them down to the instances.
	async fn studies_matching(&self, tag: Tag, id: &str) -> Result<Vec<Patient>, FindError> {
		let mut patients = Vec::new();
		for dataset in self.find(QueryRetrieveLevel::Study, &[(tag, id)]).await? {
			let (Some(mut patient), Some(mut study)) = (patient_from(&dataset), study_from(&dataset))
			else {
				continue;
			};
			study.series = self.series_of(&study.study_instance_uid, None).await?;
			patient.studies.push(study);
			patients.push(patient);
		}
		Ok(patients)
	}

	/// Finds the series of a study, optionally restricted to one series UID.
	async fn series_of(
		&self,
		study_uid: &str,
		series_uid: Option<&str>,
	) -> Result<Vec<Series>, FindError> {
		let matching = [
			(tags::STUDY_INSTANCE_UID, study_uid),
			(tags::SERIES_INSTANCE_UID, series_uid.unwrap_or_default()),
		];
		let mut series = Vec::new();
		for dataset in self.find(QueryRetrieveLevel::Series, &matching).await? {
			let Some(mut entry) = series_from(&dataset) else {
				continue;
			};
			entry.instances = self
				.instances_of(study_uid, &entry.series_instance_uid)
				.await?;
			series.push(entry);
		}
		Ok(series)
	}

	async fn instances_of(
		&self,
		study_uid: &str,
		series_uid: &str,
	) -> Result<Vec<Instance>, FindError> {
		let matching = [
			(tags::STUDY_INSTANCE_UID, study_uid),
			(tags::SERIES_INSTANCE_UID, series_uid),
		];
		Ok(self
			.find(QueryRetrieveLevel::Image, &matching)
			.await?
			.iter()
			.filter_map(instance_from)
			.collect())
	}

	/// Resolves the patient and study a lower-level entity belongs to.
	async fn parent_study(&self, study_uid: &str) -> Result<Option<(Patient, Study)>, FindError> {
		let datasets = self
			.find(
				QueryRetrieveLevel::Study,
				&[(tags::STUDY_INSTANCE_UID, study_uid)],
			)
			.await?;
		Ok(datasets
			.iter()
			.find_map(|dataset| Some((patient_from(dataset)?, study_from(dataset)?))))
	}

	async fn series_matching(&self, series_uid: &str) -> Result<Vec<Patient>, FindError> {
		let mut patients = Vec::new();
		let datasets = self
			.find(
				QueryRetrieveLevel::Series,
				&[(tags::SERIES_INSTANCE_UID, series_uid)],
			)
			.await?;
		for dataset in datasets {
			let Some(study_uid) = string(&dataset, tags::STUDY_INSTANCE_UID) else {
				continue;
			};
			let Some((mut patient, mut study)) = self.parent_study(&study_uid).await? else {
				warn!(study_uid, "Parent study of series is not searchable");
				continue;
			};
			study.series = self.series_of(&study_uid, Some(series_uid)).await?;
			patient.studies.push(study);
			patients.push(patient);
		}
		Ok(patients)
	}

	async fn instance_matching(&self, sop_uid: &str) -> Result<Vec<Patient>, FindError> {
		let mut patients = Vec::new();
		let datasets = self
			.find(
				QueryRetrieveLevel::Image,
				&[(tags::SOP_INSTANCE_UID, sop_uid)],
			)
			.await?;
		for dataset in datasets {
			let (Some(study_uid), Some(series_uid), Some(instance)) = (
				string(&dataset, tags::STUDY_INSTANCE_UID),
				string(&dataset, tags::SERIES_INSTANCE_UID),
				instance_from(&dataset),
			) else {
				continue;
			};
			let Some((mut patient, mut study)) = self.parent_study(&study_uid).await? else {
				warn!(study_uid, "Parent study of instance is not searchable");
				continue;
			};

			let series = self
				.find(
					QueryRetrieveLevel::Series,
					&[
						(tags::STUDY_INSTANCE_UID, study_uid.as_str()),
						(tags::SERIES_INSTANCE_UID, series_uid.as_str()),
					],
				)
				.await?
				.iter()
				.find_map(series_from);
			let mut series = series.unwrap_or_else(|| Series::new(series_uid));
			series.instances.push(instance);

			study.series.push(series);
			patient.studies.push(study);
			patients.push(patient);
		}
		Ok(patients)
	}

	async fn resolve(
		&self,
		lookup: Lookup,
		ids: &BTreeSet<String>,
	) -> Result<Vec<Patient>, SourceError> {
		let mut patients = Vec::new();
		for id in ids {
			let found = match lookup {
				Lookup::Studies(tag) => self.studies_matching(tag, id).await?,
				Lookup::Series => self.series_matching(id).await?,
				Lookup::Instance => self.instance_matching(id).await?,
			};
			patients.extend(found);
		}
		Ok(patients)
	}
}

/// The entry point of the query hierarchy for an identifier class.
#[derive(Debug, Clone, Copy)]
enum Lookup {
	Studies(Tag),
	Series,
	Instance,
}

#[async_trait]
impl ManifestSource for DimseSource {
	#[instrument(skip_all)]
	async fn build_from_patient_ids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.resolve(Lookup::Studies(tags::PATIENT_ID), ids).await
	}

	#[instrument(skip_all)]
	async fn build_from_accession_numbers(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.resolve(Lookup::Studies(tags::ACCESSION_NUMBER), ids)
			.await
	}

	#[instrument(skip_all)]
	async fn build_from_study_uids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.resolve(Lookup::Studies(tags::STUDY_INSTANCE_UID), ids)
			.await
	}

	#[instrument(skip_all)]
	async fn build_from_series_uids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.resolve(Lookup::Series, ids).await
	}

	#[instrument(skip_all)]
	async fn build_from_sop_uids(
		&self,
		ids: &BTreeSet<String>,
		_: &SearchCriteria,
	) -> Result<Vec<Patient>, SourceError> {
		self.resolve(Lookup::Instance, ids).await
	}
}

/// Builds a C-FIND identifier requesting the return keys of `level`.
///
/// Matching keys with an empty value are universal matches.
fn identifier(level: QueryRetrieveLevel, matching: &[(Tag, &str)]) -> InMemDicomObject {
	let return_keys: Vec<Tag> = match level {
		QueryRetrieveLevel::Study => PATIENT_TAGS.iter().chain(STUDY_TAGS).copied().collect(),
		QueryRetrieveLevel::Series => SERIES_TAGS.to_vec(),
		QueryRetrieveLevel::Image => INSTANCE_TAGS.to_vec(),
	};

	let mut attributes = Vec::with_capacity(return_keys.len() + matching.len() + 1);
	attributes.push((tags::QUERY_RETRIEVE_LEVEL, PrimitiveValue::from(level)));
	for tag in return_keys {
		attributes.push((tag, PrimitiveValue::Empty));
	}
	for (tag, value) in matching {
		let value = if value.is_empty() {
			PrimitiveValue::Empty
		} else {
			PrimitiveValue::from(*value)
		};
		attributes.push((*tag, value));
	}

	let mut identifier = InMemDicomObject::new_empty();
	for (tag, value) in attributes {
		if let Err(err) = identifier.apply(AttributeOp::new(
			AttributeSelector::from(tag),
			AttributeAction::Set(value),
		)) {
			warn!("Skipped attribute operation: {err}");
		}
	}
	identifier
}

/// Reads a single-valued attribute as trimmed text. Empty values count as missing.
fn string(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
	let value = dataset.get(tag)?.to_str().ok()?;
	let value = value.trim_end_matches(['\0', ' ']).trim_start();
	(!value.is_empty()).then(|| value.to_owned())
}

fn patient_from(dataset: &InMemDicomObject) -> Option<Patient> {
	let mut patient = Patient::new(
		string(dataset, tags::PATIENT_ID)?,
		string(dataset, tags::ISSUER_OF_PATIENT_ID),
	);
	patient.patient_name = string(dataset, tags::PATIENT_NAME);
	patient.patient_birth_date = string(dataset, tags::PATIENT_BIRTH_DATE);
	patient.patient_sex = string(dataset, tags::PATIENT_SEX);
	Some(patient)
}

fn study_from(dataset: &InMemDicomObject) -> Option<Study> {
	let mut study = Study::new(string(dataset, tags::STUDY_INSTANCE_UID)?);
	study.study_date = string(dataset, tags::STUDY_DATE);
	study.study_time = string(dataset, tags::STUDY_TIME);
	study.accession_number = string(dataset, tags::ACCESSION_NUMBER);
	study.study_id = string(dataset, tags::STUDY_ID);
	study.study_description = string(dataset, tags::STUDY_DESCRIPTION);
	study.referring_physician_name = string(dataset, tags::REFERRING_PHYSICIAN_NAME);
	Some(study)
}

fn series_from(dataset: &InMemDicomObject) -> Option<Series> {
	let mut series = Series::new(string(dataset, tags::SERIES_INSTANCE_UID)?);
	series.modality = string(dataset, tags::MODALITY);
	series.series_number = string(dataset, tags::SERIES_NUMBER);
	series.series_description = string(dataset, tags::SERIES_DESCRIPTION);
	Some(series)
}

fn instance_from(dataset: &InMemDicomObject) -> Option<Instance> {
	let mut instance = Instance::new(string(dataset, tags::SOP_INSTANCE_UID)?);
	instance.instance_number = string(dataset, tags::INSTANCE_NUMBER);
	Some(instance)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use std::sync::Mutex;

	fn dataset(elements: &[(Tag, VR, &str)]) -> InMemDicomObject {
		InMemDicomObject::from_element_iter(
			elements
				.iter()
				.map(|(tag, vr, value)| DataElement::new(*tag, *vr, PrimitiveValue::from(*value))),
		)
	}

	#[test]
	fn study_identifier_requests_patient_and_study_keys() {
		let identifier = identifier(
			QueryRetrieveLevel::Study,
			&[(tags::ACCESSION_NUMBER, "ACC1")],
		);

		assert_eq!(
			string(&identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
			Some("STUDY")
		);
		assert_eq!(
			string(&identifier, tags::ACCESSION_NUMBER).as_deref(),
			Some("ACC1")
		);
		for tag in PATIENT_TAGS.iter().chain(STUDY_TAGS) {
			assert!(identifier.get(*tag).is_some(), "missing return key {tag}");
		}
		assert!(identifier.get(tags::SOP_INSTANCE_UID).is_none());
	}

	#[test]
	fn empty_matching_values_are_universal() {
		let identifier = identifier(
			QueryRetrieveLevel::Series,
			&[
				(tags::STUDY_INSTANCE_UID, "1.2.3"),
				(tags::SERIES_INSTANCE_UID, ""),
			],
		);
		assert_eq!(string(&identifier, tags::SERIES_INSTANCE_UID), None);
		assert!(identifier.get(tags::SERIES_INSTANCE_UID).is_some());
		assert!(identifier.get(tags::MODALITY).is_some());
	}

	#[test]
	fn reads_patient_and_study_attributes() {
		let dataset = dataset(&[
			(tags::PATIENT_ID, VR::LO, "P1 "),
			(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
			(tags::PATIENT_SEX, VR::CS, "F "),
			(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3\0"),
			(tags::ACCESSION_NUMBER, VR::SH, "ACC1"),
			(tags::STUDY_DESCRIPTION, VR::LO, ""),
		]);

		let patient = patient_from(&dataset).unwrap();
		assert_eq!(patient.patient_id, "P1");
		assert_eq!(patient.issuer_of_patient_id, None);
		assert_eq!(patient.patient_name.as_deref(), Some("DOE^JANE"));
		assert_eq!(patient.patient_sex.as_deref(), Some("F"));

		let study = study_from(&dataset).unwrap();
		assert_eq!(study.study_instance_uid, "1.2.3");
		assert_eq!(study.accession_number.as_deref(), Some("ACC1"));
		assert_eq!(study.study_description, None);
	}

	#[test]
	fn datasets_without_natural_key_are_dropped() {
		let dataset = dataset(&[
			(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
			(tags::MODALITY, VR::CS, "CT"),
		]);
		assert!(patient_from(&dataset).is_none());
		assert!(study_from(&dataset).is_none());
		assert!(series_from(&dataset).is_none());
		assert!(instance_from(&dataset).is_none());
	}

	#[test]
	fn reads_series_and_instance_attributes() {
		let dataset = dataset(&[
			(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4"),
			(tags::MODALITY, VR::CS, "MR"),
			(tags::SERIES_NUMBER, VR::IS, "3 "),
			(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4.5"),
			(tags::INSTANCE_NUMBER, VR::IS, "12"),
		]);

		let series = series_from(&dataset).unwrap();
		assert_eq!(series.modality.as_deref(), Some("MR"));
		assert_eq!(series.series_number.as_deref(), Some("3"));

		let instance = instance_from(&dataset).unwrap();
		assert_eq!(instance.sop_instance_uid, "1.2.3.4.5");
		assert_eq!(instance.instance_number.as_deref(), Some("12"));
	}

	const MATCHING_KEYS: [Tag; 5] = [
		tags::PATIENT_ID,
		tags::ACCESSION_NUMBER,
		tags::STUDY_INSTANCE_UID,
		tags::SERIES_INSTANCE_UID,
		tags::SOP_INSTANCE_UID,
	];

	/// Answers C-FIND requests from canned datasets and records the requested levels.
	#[derive(Default)]
	struct Archive {
		datasets: Vec<(QueryRetrieveLevel, InMemDicomObject)>,
		levels: Mutex<Vec<String>>,
	}

	impl Archive {
		fn levels(&self) -> Vec<String> {
			self.levels.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl Finder for Archive {
		async fn find(
			&self,
			identifier: InMemDicomObject,
		) -> Result<Vec<InMemDicomObject>, FindError> {
			let level = string(&identifier, tags::QUERY_RETRIEVE_LEVEL).unwrap_or_default();
			self.levels.lock().unwrap().push(level.clone());

			Ok(self
				.datasets
				.iter()
				.filter(|(dataset_level, _)| dataset_level.to_string() == level)
				.filter(|(_, dataset)| {
					MATCHING_KEYS.iter().all(|tag| match string(&identifier, *tag) {
						Some(value) => string(dataset, *tag).as_deref() == Some(value.as_str()),
						None => true,
					})
				})
				.map(|(_, dataset)| dataset.clone())
				.collect())
		}
	}

	/// One patient with study 1.2.3 holding a CT and an MR series of one image each,
	/// plus an image whose study is unknown to the archive.
	fn archive() -> Arc<Archive> {
		let image = |study: &str, series: &str, sop: &str| {
			(
				QueryRetrieveLevel::Image,
				dataset(&[
					(tags::STUDY_INSTANCE_UID, VR::UI, study),
					(tags::SERIES_INSTANCE_UID, VR::UI, series),
					(tags::SOP_INSTANCE_UID, VR::UI, sop),
					(tags::INSTANCE_NUMBER, VR::IS, "1"),
				]),
			)
		};
		let series = |uid: &str, modality: &str| {
			(
				QueryRetrieveLevel::Series,
				dataset(&[
					(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
					(tags::SERIES_INSTANCE_UID, VR::UI, uid),
					(tags::MODALITY, VR::CS, modality),
				]),
			)
		};

		Arc::new(Archive {
			datasets: vec![
				(
					QueryRetrieveLevel::Study,
					dataset(&[
						(tags::PATIENT_ID, VR::LO, "P1"),
						(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
						(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
						(tags::ACCESSION_NUMBER, VR::SH, "ACC1"),
					]),
				),
				series("1.2.3.1", "CT"),
				series("1.2.3.2", "MR"),
				image("1.2.3", "1.2.3.1", "1.2.3.1.1"),
				image("1.2.3", "1.2.3.2", "1.2.3.2.1"),
				image("9.9.9", "9.9.9.1", "9.9.9.1.1"),
			],
			levels: Mutex::default(),
		})
	}

	fn ids(values: &[&str]) -> BTreeSet<String> {
		values.iter().map(|value| String::from(*value)).collect()
	}

	#[tokio::test]
	async fn accession_lookup_descends_to_instances() {
		let archive = archive();
		let source = DimseSource::with_finder(Arc::clone(&archive) as Arc<dyn Finder>);

		let patients = source
			.build_from_accession_numbers(&ids(&["ACC1"]), &SearchCriteria::default())
			.await
			.unwrap();

		assert_eq!(archive.levels(), ["STUDY", "SERIES", "IMAGE", "IMAGE"]);
		assert_eq!(patients.len(), 1);
		assert_eq!(patients[0].patient_name.as_deref(), Some("DOE^JANE"));
		let study = patients[0].study("1.2.3").unwrap();
		assert_eq!(study.series.len(), 2);
		for series in &study.series {
			assert_eq!(series.instances.len(), 1);
		}
		assert_eq!(
			study.series("1.2.3.2").unwrap().instances[0].sop_instance_uid,
			"1.2.3.2.1"
		);
	}

	#[tokio::test]
	async fn series_lookup_resolves_parent_study() {
		let archive = archive();
		let source = DimseSource::with_finder(Arc::clone(&archive) as Arc<dyn Finder>);

		let patients = source
			.build_from_series_uids(&ids(&["1.2.3.2"]), &SearchCriteria::default())
			.await
			.unwrap();

		assert_eq!(archive.levels(), ["SERIES", "STUDY", "SERIES", "IMAGE"]);
		assert_eq!(patients.len(), 1);
		assert_eq!(patients[0].patient_id, "P1");
		let study = patients[0].study("1.2.3").unwrap();
		assert_eq!(study.accession_number.as_deref(), Some("ACC1"));
		assert_eq!(study.series.len(), 1);
		let series = study.series("1.2.3.2").unwrap();
		assert_eq!(series.modality.as_deref(), Some("MR"));
		assert_eq!(series.instances.len(), 1);
	}

	#[tokio::test]
	async fn instance_without_searchable_study_is_skipped() {
		let archive = archive();
		let source = DimseSource::with_finder(Arc::clone(&archive) as Arc<dyn Finder>);

		let patients = source
			.build_from_sop_uids(
				&ids(&["1.2.3.1.1", "9.9.9.1.1"]),
				&SearchCriteria::default(),
			)
			.await
			.unwrap();

		assert_eq!(
			archive.levels(),
			["IMAGE", "STUDY", "SERIES", "IMAGE", "STUDY"]
		);
		assert_eq!(patients.len(), 1);
		let study = patients[0].study("1.2.3").unwrap();
		assert_eq!(study.series.len(), 1);
		let series = study.series("1.2.3.1").unwrap();
		assert_eq!(series.modality.as_deref(), Some("CT"));
		let instances: Vec<&str> = series
			.instances
			.iter()
			.map(|instance| instance.sop_instance_uid.as_str())
			.collect();
		assert_eq!(instances, ["1.2.3.1.1"]);
	}
}
