use super::merge::{fill, upsert, Entity};
use crate::types::UI;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Series {
	#[serde(rename = "@SeriesInstanceUID")]
	pub series_instance_uid: UI,
	#[serde(rename = "@Modality", skip_serializing_if = "Option::is_none")]
	pub modality: Option<String>,
	#[serde(rename = "@SeriesNumber", skip_serializing_if = "Option::is_none")]
	pub series_number: Option<String>,
	#[serde(rename = "@SeriesDescription", skip_serializing_if = "Option::is_none")]
	pub series_description: Option<String>,
	#[serde(rename = "Instance")]
	pub instances: Vec<Instance>,
}

impl Series {
	pub fn new(series_instance_uid: impl Into<UI>) -> Self {
		Self {
			series_instance_uid: series_instance_uid.into(),
			modality: None,
			series_number: None,
			series_description: None,
			instances: Vec::new(),
		}
	}

	pub fn instance(&self, sop_instance_uid: &str) -> Option<&Instance> {
		self.instances
			.iter()
			.find(|instance| instance.sop_instance_uid == sop_instance_uid)
	}
}

impl Entity for Series {
	type Key = UI;

	fn key(&self) -> Self::Key {
		self.series_instance_uid.clone()
	}

	fn absorb(&mut self, other: Self) {
		fill(&mut self.modality, other.modality);
		fill(&mut self.series_number, other.series_number);
		fill(&mut self.series_description, other.series_description);
		upsert(&mut self.instances, other.instances);
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
	#[serde(rename = "@SOPInstanceUID")]
	pub sop_instance_uid: UI,
	#[serde(rename = "@InstanceNumber", skip_serializing_if = "Option::is_none")]
	pub instance_number: Option<String>,
}

impl Instance {
	pub fn new(sop_instance_uid: impl Into<UI>) -> Self {
		Self {
			sop_instance_uid: sop_instance_uid.into(),
			instance_number: None,
		}
	}
}

impl Entity for Instance {
	type Key = UI;

	fn key(&self) -> Self::Key {
		self.sop_instance_uid.clone()
	}

	fn absorb(&mut self, other: Self) {
		fill(&mut self.instance_number, other.instance_number);
	}
}
