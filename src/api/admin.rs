use crate::config::BackendConfig;
use crate::criteria::IdentifierClass;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/manifests", get(all_manifests).delete(remove_all_manifests))
		.route("/manifests/{key}", axum::routing::delete(remove_manifest))
		.route("/connectors", get(all_connectors))
}

#[derive(Debug, Serialize)]
struct CachedManifest {
	key: String,
	uid: String,
	#[serde(rename = "buildInProgress")]
	build_in_progress: bool,
	archives: Vec<String>,
}

async fn all_manifests(State(state): State<AppState>) -> impl IntoResponse {
	let manifests: Vec<CachedManifest> = state
		.service
		.cache()
		.get_all()
		.into_iter()
		.map(|(key, manifest)| CachedManifest {
			key,
			uid: manifest.uid().to_owned(),
			build_in_progress: manifest.is_build_in_progress(),
			archives: manifest
				.arc_queries()
				.iter()
				.map(|query| query.arc_id.clone())
				.collect(),
		})
		.collect();
	Json(manifests)
}

async fn remove_manifest(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> impl IntoResponse {
	if state.service.cache().remove(&key).is_some() {
		info!(key, "Removed manifest");
		StatusCode::NO_CONTENT
	} else {
		StatusCode::NOT_FOUND
	}
}

async fn remove_all_manifests(State(state): State<AppState>) -> impl IntoResponse {
	state.service.cache().remove_all();
	info!("Removed all manifests");
	StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct ConnectorSummary {
	id: String,
	#[serde(rename = "type")]
	kind: &'static str,
	identifiers: Vec<&'static str>,
}

/// Lists the configured connectors in registry order.
async fn all_connectors(State(state): State<AppState>) -> impl IntoResponse {
	let connectors: Vec<ConnectorSummary> = state
		.config
		.connectors
		.iter()
		.map(|connector| ConnectorSummary {
			id: connector.id.clone(),
			kind: match connector.backend {
				BackendConfig::Dimse(_) => "dimse",
				BackendConfig::Database(_) => "database",
			},
			identifiers: IdentifierClass::ALL
				.into_iter()
				.filter(|class| connector.identifiers.is_enabled(*class))
				.map(|class| class.as_str())
				.collect(),
		})
		.collect();
	Json(connectors)
}
