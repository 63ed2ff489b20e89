use super::merge::{fill, upsert, Entity};
use super::study::Study;
use serde::Serialize;

/// A patient is identified by its id together with the issuer of that id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Patient {
	#[serde(rename = "@PatientID")]
	pub patient_id: String,
	#[serde(rename = "@IssuerOfPatientID", skip_serializing_if = "Option::is_none")]
	pub issuer_of_patient_id: Option<String>,
	#[serde(rename = "@PatientName", skip_serializing_if = "Option::is_none")]
	pub patient_name: Option<String>,
	#[serde(rename = "@PatientBirthDate", skip_serializing_if = "Option::is_none")]
	pub patient_birth_date: Option<String>,
	#[serde(rename = "@PatientSex", skip_serializing_if = "Option::is_none")]
	pub patient_sex: Option<String>,
	#[serde(rename = "Study")]
	pub studies: Vec<Study>,
}

impl Patient {
	pub fn new(patient_id: impl Into<String>, issuer_of_patient_id: Option<String>) -> Self {
		Self {
			patient_id: patient_id.into(),
			issuer_of_patient_id,
			patient_name: None,
			patient_birth_date: None,
			patient_sex: None,
			studies: Vec::new(),
		}
	}

	pub fn study(&self, study_instance_uid: &str) -> Option<&Study> {
		self.studies
			.iter()
			.find(|study| study.study_instance_uid == study_instance_uid)
	}
}

impl Entity for Patient {
	type Key = (String, Option<String>);

	fn key(&self) -> Self::Key {
		(self.patient_id.clone(), self.issuer_of_patient_id.clone())
	}

	fn absorb(&mut self, other: Self) {
		fill(&mut self.patient_name, other.patient_name);
		fill(&mut self.patient_birth_date, other.patient_birth_date);
		fill(&mut self.patient_sex, other.patient_sex);
		upsert(&mut self.studies, other.studies);
	}
}
