//! The manifest document handed to the viewer.
//!
//! A [`Manifest`] owns one [`ArcQuery`] per contributing archive, which in turn owns a
//! tree of [`Patient`] → [`Study`] → [`Series`] → [`Instance`]. Children never point
//! back at their parents.

mod merge;
mod patient;
mod series;
mod study;

pub use merge::merge_patients;
pub use patient::Patient;
pub use series::{Instance, Series};
pub use study::Study;

use crate::auth::WadoAuthentication;
use crate::config::ConnectorConfig;
use crate::criteria::SearchCriteria;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const MANIFEST_NAMESPACE: &str = "http://www.weasis.org/xsd/2.5";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Debug, Clone)]
pub struct Manifest {
	uid: String,
	arc_queries: Vec<ArcQuery>,
	started_at: Instant,
	build_duration: Option<Duration>,
	build_in_progress: bool,
	search_criteria: SearchCriteria,
	access_token: Option<String>,
}

impl Manifest {
	/// Creates an empty manifest that is marked as being built.
	pub fn new(search_criteria: SearchCriteria) -> Self {
		Self {
			uid: Uuid::new_v4().to_string(),
			arc_queries: Vec::new(),
			started_at: Instant::now(),
			build_duration: None,
			build_in_progress: true,
			access_token: search_criteria.access_token().map(ToOwned::to_owned),
			search_criteria,
		}
	}

	/// Clears the in-progress flag and stamps the build duration.
	#[must_use]
	pub fn finish(mut self) -> Self {
		self.build_in_progress = false;
		self.build_duration = Some(self.started_at.elapsed());
		self
	}

	pub fn uid(&self) -> &str {
		&self.uid
	}

	pub fn arc_queries(&self) -> &[ArcQuery] {
		&self.arc_queries
	}

	pub fn arc_query(&self, arc_id: &str) -> Option<&ArcQuery> {
		self.arc_queries.iter().find(|query| query.arc_id == arc_id)
	}

	pub const fn started_at(&self) -> Instant {
		self.started_at
	}

	pub const fn build_duration(&self) -> Option<Duration> {
		self.build_duration
	}

	pub const fn is_build_in_progress(&self) -> bool {
		self.build_in_progress
	}

	pub const fn search_criteria(&self) -> &SearchCriteria {
		&self.search_criteria
	}

	pub fn access_token(&self) -> Option<&str> {
		self.access_token.as_deref()
	}

	pub fn is_empty(&self) -> bool {
		self.arc_queries.is_empty()
	}

	pub fn to_xml(&self) -> Result<String, quick_xml::SeError> {
		#[derive(Serialize)]
		struct Document<'a> {
			#[serde(rename = "@xmlns")]
			xmlns: &'static str,
			#[serde(rename = "@xmlns:xsi")]
			xmlns_xsi: &'static str,
			#[serde(rename = "@uid")]
			uid: &'a str,
			#[serde(rename = "arcQuery")]
			arc_queries: &'a [ArcQuery],
		}

		let document = Document {
			xmlns: MANIFEST_NAMESPACE,
			xmlns_xsi: XSI_NAMESPACE,
			uid: &self.uid,
			arc_queries: &self.arc_queries,
		};
		let body = quick_xml::se::to_string_with_root("manifest", &document)?;
		Ok(format!("{XML_DECLARATION}{body}"))
	}
}

/// The contribution of one archive to a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArcQuery {
	#[serde(rename = "@arcId")]
	pub arc_id: String,
	#[serde(rename = "@baseUrl")]
	pub base_url: String,
	#[serde(rename = "@webLogin", skip_serializing_if = "Option::is_none")]
	pub web_login: Option<String>,
	#[serde(rename = "@requireOnlySOPInstanceUID")]
	pub require_only_sop_instance_uid: bool,
	#[serde(rename = "@additionnalParameters", skip_serializing_if = "Option::is_none")]
	pub additional_parameters: Option<String>,
	#[serde(rename = "@overrideDicomTagsList", skip_serializing_if = "Option::is_none")]
	pub override_dicom_tags: Option<String>,
	#[serde(rename = "httpTag")]
	pub http_tags: Vec<HttpTag>,
	#[serde(rename = "Patient")]
	pub patients: Vec<Patient>,
}

impl ArcQuery {
	/// Creates an empty query stamped with the WADO settings of `connector` and the
	/// credentials matching `criteria`.
	pub fn new(connector: &ConnectorConfig, criteria: &SearchCriteria) -> Self {
		let wado = &connector.wado;
		let authentication = WadoAuthentication::resolve(
			wado,
			criteria.is_request_authenticated(),
			criteria.access_token(),
		);

		let mut http_tags: Vec<HttpTag> = Vec::with_capacity(wado.http_tags.len() + 1);
		let configured = wado
			.http_tags
			.iter()
			.map(|tag| HttpTag::new(&tag.key, &tag.value));
		for tag in configured.chain(authentication.http_tags()) {
			if !http_tags.contains(&tag) {
				http_tags.push(tag);
			}
		}

		Self {
			arc_id: connector.id.clone(),
			base_url: authentication.base_url().to_owned(),
			web_login: authentication.basic_token().map(ToOwned::to_owned),
			require_only_sop_instance_uid: wado.require_only_sop_instance_uid,
			additional_parameters: wado.additional_parameters.clone(),
			override_dicom_tags: wado.override_dicom_tags.clone(),
			http_tags,
			patients: Vec::new(),
		}
	}

	pub fn patient(&self, patient_id: &str) -> Option<&Patient> {
		self.patients
			.iter()
			.find(|patient| patient.patient_id == patient_id)
	}
}

/// An HTTP header the viewer sends with every request to an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HttpTag {
	#[serde(rename = "@key")]
	pub key: String,
	#[serde(rename = "@value")]
	pub value: String,
}

impl HttpTag {
	pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
		}
	}
}
