use super::merge::{fill, upsert, Entity};
use super::series::Series;
use crate::types::UI;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Study {
	#[serde(rename = "@StudyInstanceUID")]
	pub study_instance_uid: UI,
	#[serde(rename = "@StudyDescription", skip_serializing_if = "Option::is_none")]
	pub study_description: Option<String>,
	#[serde(rename = "@StudyDate", skip_serializing_if = "Option::is_none")]
	pub study_date: Option<String>,
	#[serde(rename = "@StudyTime", skip_serializing_if = "Option::is_none")]
	pub study_time: Option<String>,
	#[serde(rename = "@AccessionNumber", skip_serializing_if = "Option::is_none")]
	pub accession_number: Option<String>,
	#[serde(rename = "@StudyID", skip_serializing_if = "Option::is_none")]
	pub study_id: Option<String>,
	#[serde(rename = "@ReferringPhysicianName", skip_serializing_if = "Option::is_none")]
	pub referring_physician_name: Option<String>,
	#[serde(rename = "Series")]
	pub series: Vec<Series>,
}

impl Study {
	pub fn new(study_instance_uid: impl Into<UI>) -> Self {
		Self {
			study_instance_uid: study_instance_uid.into(),
			study_description: None,
			study_date: None,
			study_time: None,
			accession_number: None,
			study_id: None,
			referring_physician_name: None,
			series: Vec::new(),
		}
	}

	pub fn series(&self, series_instance_uid: &str) -> Option<&Series> {
		self.series
			.iter()
			.find(|series| series.series_instance_uid == series_instance_uid)
	}
}

impl Entity for Study {
	type Key = UI;

	fn key(&self) -> Self::Key {
		self.study_instance_uid.clone()
	}

	fn absorb(&mut self, other: Self) {
		fill(&mut self.study_description, other.study_description);
		fill(&mut self.study_date, other.study_date);
		fill(&mut self.study_time, other.study_time);
		fill(&mut self.accession_number, other.accession_number);
		fill(&mut self.study_id, other.study_id);
		fill(&mut self.referring_physician_name, other.referring_physician_name);
		upsert(&mut self.series, other.series);
	}
}
