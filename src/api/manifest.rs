//! Launch and retrieval of viewer manifests.

use crate::criteria::{IdentifierClass, SearchCriteria};
use crate::service::BuildError;
use crate::AppState;
use axum::extract::{FromRef, FromRequestParts, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::{Query, QueryRejection};
use serde::Deserialize;
use tracing::{error, instrument};

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/launch", get(launch))
		.route("/manifest", get(manifest))
}

/// Query parameters of a launch request. Every list accepts repeated parameters as
/// well as comma-separated values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LaunchParameters {
	#[serde(rename = "archive")]
	pub archives: Vec<String>,
	#[serde(rename = "patientID")]
	pub patient_ids: Vec<String>,
	#[serde(rename = "accessionNumber")]
	pub accession_numbers: Vec<String>,
	#[serde(rename = "studyUID")]
	pub study_uids: Vec<String>,
	#[serde(rename = "seriesUID")]
	pub series_uids: Vec<String>,
	#[serde(rename = "objectUID")]
	pub sop_uids: Vec<String>,
	pub host: Option<String>,
	pub user: Option<String>,
	#[serde(rename = "cfg")]
	pub config_name: Option<String>,
}

fn split(values: &[String]) -> impl Iterator<Item = &str> {
	values.iter().flat_map(|value| value.split(','))
}

/// A normalized launch request.
#[derive(Debug)]
pub struct LaunchRequest {
	pub criteria: SearchCriteria,
}

impl<S> FromRequestParts<S> for LaunchRequest
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Query(params): Query<LaunchParameters> = Query::from_request_parts(parts, state)
			.await
			.map_err(QueryRejection::into_response)?;

		let mut builder = SearchCriteria::builder();
		for archive in split(&params.archives) {
			builder = builder.archive(archive);
		}
		for (class, values) in [
			(IdentifierClass::PatientId, &params.patient_ids),
			(IdentifierClass::AccessionNumber, &params.accession_numbers),
			(IdentifierClass::StudyUid, &params.study_uids),
			(IdentifierClass::SeriesUid, &params.series_uids),
			(IdentifierClass::SopUid, &params.sop_uids),
		] {
			builder = builder.identifiers(class, split(values));
		}
		if let Some(host) = params.host {
			builder = builder.host(host);
		}
		if let Some(user) = params.user {
			builder = builder.user(user);
		}
		if let Some(config_name) = params.config_name {
			builder = builder.config_name(config_name);
		}

		let token = parts
			.headers
			.get(AUTHORIZATION)
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.strip_prefix("Bearer "))
			.map(str::trim)
			.filter(|token| !token.is_empty());
		if let Some(token) = token {
			builder = builder.access_token(token);
		}

		let criteria = builder.build();
		if !criteria.has_identifiers() {
			return Err((StatusCode::BAD_REQUEST, "No identifier was requested").into_response());
		}
		Ok(Self { criteria })
	}
}

#[derive(Debug, Deserialize)]
struct ManifestParameters {
	#[serde(default)]
	key: String,
}

#[instrument(skip_all)]
async fn launch(State(state): State<AppState>, request: LaunchRequest) -> Response {
	match state.service.trigger(request.criteria) {
		Ok(key) => Json(serde_json::json!({ "key": key })).into_response(),
		Err(err @ BuildError::UnknownArchive(_)) => {
			(StatusCode::BAD_REQUEST, err.to_string()).into_response()
		}
	}
}

#[instrument(skip_all)]
async fn manifest(
	State(state): State<AppState>,
	Query(params): Query<ManifestParameters>,
) -> Response {
	let key = params.key.trim();
	if key.is_empty() {
		return (StatusCode::BAD_REQUEST, "Missing manifest key").into_response();
	}

	let Some(manifest) = state.service.retrieve(key).await else {
		return StatusCode::NO_CONTENT.into_response();
	};

	match manifest.to_xml() {
		Ok(xml) => ([(CONTENT_TYPE, "application/xml")], xml).into_response(),
		Err(err) => {
			error!("Failed to serialize manifest: {err}");
			(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
		}
	}
}
