use super::{ArcQuery, Manifest, Patient};
use crate::config::ConnectorConfig;
use std::collections::HashMap;
use std::hash::Hash;

/// A node of the manifest tree with a natural key.
pub(super) trait Entity {
	type Key: Eq + Hash;

	fn key(&self) -> Self::Key;

	/// Folds `other`, which has the same key, into `self`.
	fn absorb(&mut self, other: Self);
}

/// Sets `slot` to `value` unless it already holds a value.
pub(super) fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
	if slot.is_none() {
		*slot = value;
	}
}

/// Appends unknown entities and recursively merges known ones, keeping the position
/// of every existing entity.
pub(super) fn upsert<T: Entity>(existing: &mut Vec<T>, incoming: Vec<T>) {
	if incoming.is_empty() {
		return;
	}

	let mut positions: HashMap<T::Key, usize> = existing
		.iter()
		.enumerate()
		.map(|(position, entity)| (entity.key(), position))
		.collect();

	for entity in incoming {
		let key = entity.key();
		if let Some(&position) = positions.get(&key) {
			existing[position].absorb(entity);
		} else {
			positions.insert(key, existing.len());
			existing.push(entity);
		}
	}
}

/// Merges `incoming` patients into `existing` by patient identity.
pub fn merge_patients(existing: &mut Vec<Patient>, incoming: Vec<Patient>) {
	upsert(existing, incoming);
}

impl Manifest {
	/// Merges the patients an archive returned into this manifest.
	///
	/// The archive query of `connector` is created on first use; repeated calls with
	/// overlapping patients never duplicate a patient, study, series or instance.
	pub fn update(&mut self, patients: Vec<Patient>, connector: &ConnectorConfig) {
		if patients.is_empty() {
			return;
		}

		let position = if let Some(position) = self
			.arc_queries
			.iter()
			.position(|query| query.arc_id == connector.id)
		{
			position
		} else {
			self.arc_queries
				.push(ArcQuery::new(connector, &self.search_criteria));
			self.arc_queries.len() - 1
		};

		upsert(&mut self.arc_queries[position].patients, patients);
	}
}

#[cfg(test)]
mod tests {
	use super::super::tests::connector;
	use super::super::{Instance, Series, Study};
	use super::*;
	use crate::criteria::SearchCriteria;

	fn patient(id: &str, studies: &[(&str, &[&str])]) -> Patient {
		let mut patient = Patient::new(id, None);
		for (study_uid, series_uids) in studies {
			let mut study = Study::new(*study_uid);
			for series_uid in *series_uids {
				let mut series = Series::new(*series_uid);
				series.instances.push(Instance::new(format!("{series_uid}.1")));
				study.series.push(series);
			}
			patient.studies.push(study);
		}
		patient
	}

	fn manifest() -> Manifest {
		Manifest::new(SearchCriteria::default())
	}

	#[test]
	fn empty_update_is_noop() {
		let mut manifest = manifest();
		manifest.update(Vec::new(), &connector("A"));
		assert!(manifest.arc_queries().is_empty());
	}

	#[test]
	fn update_is_idempotent() {
		let pacs = connector("A");
		let patients = vec![patient("P1", &[("1", &["1.1", "1.2"])])];

		let mut once = manifest();
		once.update(patients.clone(), &pacs);

		let mut twice = manifest();
		twice.update(patients.clone(), &pacs);
		twice.update(patients, &pacs);

		assert_eq!(once.arc_queries(), twice.arc_queries());
		assert_eq!(twice.arc_queries()[0].patients.len(), 1);
		assert_eq!(twice.arc_queries()[0].patients[0].studies[0].series.len(), 2);
	}

	#[test]
	fn studies_of_same_patient_are_unioned() {
		let pacs = connector("A");
		let mut manifest = manifest();
		manifest.update(vec![patient("P1", &[("S1", &["S1.1"])])], &pacs);
		manifest.update(vec![patient("P1", &[("S2", &["S2.1"])])], &pacs);

		let query = manifest.arc_query("A").unwrap();
		assert_eq!(query.patients.len(), 1);
		let merged = query.patient("P1").unwrap();
		assert!(merged.study("S1").is_some());
		assert!(merged.study("S2").is_some());
	}

	#[test]
	fn series_and_instances_are_unioned() {
		let pacs = connector("A");
		let mut manifest = manifest();
		manifest.update(vec![patient("P1", &[("S1", &["S1.1"])])], &pacs);

		let mut incoming = patient("P1", &[("S1", &["S1.1", "S1.2"])]);
		incoming.studies[0].series[0]
			.instances
			.push(Instance::new("S1.1.2"));
		manifest.update(vec![incoming], &pacs);

		let study = manifest.arc_queries()[0].patients[0].study("S1").unwrap();
		assert_eq!(study.series.len(), 2);
		let series = study.series("S1.1").unwrap();
		assert!(series.instance("S1.1.1").is_some());
		assert!(series.instance("S1.1.2").is_some());
		assert_eq!(series.instances.len(), 2);
	}

	#[test]
	fn attributes_are_filled_not_overwritten() {
		let pacs = connector("A");
		let mut manifest = manifest();

		let mut first = patient("P1", &[]);
		first.patient_name = Some(String::from("DOE^JOHN"));
		manifest.update(vec![first], &pacs);

		let mut second = patient("P1", &[]);
		second.patient_name = Some(String::from("OTHER"));
		second.patient_sex = Some(String::from("M"));
		manifest.update(vec![second], &pacs);

		let merged = &manifest.arc_queries()[0].patients[0];
		assert_eq!(merged.patient_name.as_deref(), Some("DOE^JOHN"));
		assert_eq!(merged.patient_sex.as_deref(), Some("M"));
	}

	#[test]
	fn issuer_is_part_of_patient_identity() {
		let pacs = connector("A");
		let mut manifest = manifest();
		manifest.update(vec![Patient::new("P1", None)], &pacs);
		manifest.update(
			vec![Patient::new("P1", Some(String::from("HOSPITAL")))],
			&pacs,
		);
		assert_eq!(manifest.arc_queries()[0].patients.len(), 2);
	}

	#[test]
	fn one_arc_query_per_archive() {
		let a = connector("A");
		let b = connector("B");
		let mut manifest = manifest();
		for _ in 0..3 {
			manifest.update(vec![patient("P1", &[])], &a);
			manifest.update(vec![patient("P2", &[])], &b);
		}

		let ids: Vec<&str> = manifest
			.arc_queries()
			.iter()
			.map(|query| query.arc_id.as_str())
			.collect();
		assert_eq!(ids, ["A", "B"]);
	}

	#[test]
	fn arc_query_is_stamped_from_connector() {
		let mut manifest = manifest();
		manifest.update(vec![patient("P1", &[])], &connector("A"));

		let query = &manifest.arc_queries()[0];
		assert_eq!(query.base_url, "http://A/wado");
		// "user:pass"
		assert_eq!(query.web_login.as_deref(), Some("dXNlcjpwYXNz"));
		assert_eq!(query.override_dicom_tags.as_deref(), Some("0x00100010"));
		assert!(!query.require_only_sop_instance_uid);
	}
}
