use crate::backend::{Connector, ConnectorRegistry, UnknownArchive};
use crate::criteria::{IdentifierClass, SearchCriteria};
use crate::manifest::{merge_patients, Manifest, Patient};
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Fans a request out to the selected connectors and merges their answers.
pub struct ConnectorDispatcher {
	registry: ConnectorRegistry,
}

impl ConnectorDispatcher {
	pub const fn new(registry: ConnectorRegistry) -> Self {
		Self { registry }
	}

	pub const fn registry(&self) -> &ConnectorRegistry {
		&self.registry
	}

	/// Queries every selected connector and merges the results into `manifest`.
	///
	/// Connectors are queried concurrently, each into its own partial result. The
	/// partial results are merged afterwards in connector order, which fixes the order
	/// of the archive queries. A connector that panics contributes an empty result.
	pub async fn dispatch(&self, manifest: &mut Manifest) -> Result<(), UnknownArchive> {
		let criteria = manifest.search_criteria().clone();
		let connectors = self.registry.select(&criteria)?;

		let partials = join_all(connectors.iter().map(|connector| {
			let criteria = &criteria;
			async move {
				AssertUnwindSafe(query_connector(connector, criteria))
					.catch_unwind()
					.await
					.unwrap_or_else(|_| {
						error!(connector = connector.config.id.as_str(), "Connector query panicked");
						Vec::new()
					})
			}
		}))
		.await;

		for (connector, patients) in connectors.iter().zip(partials) {
			manifest.update(patients, &connector.config);
		}
		Ok(())
	}
}

/// Runs one query per enabled, non-empty identifier class.
///
/// A failing class is logged and left out.
async fn query_connector(connector: &Connector, criteria: &SearchCriteria) -> Vec<Patient> {
	let id = connector.config.id.as_str();
	let mut patients = Vec::new();

	for class in IdentifierClass::ALL {
		let ids = criteria.identifiers(class);
		if ids.is_empty() {
			continue;
		}
		if !connector.config.identifiers.is_enabled(class) {
			debug!(connector = id, %class, "Identifier class is disabled");
			continue;
		}

		match connector.source.build_from(class, ids, criteria).await {
			Ok(found) => {
				info!(connector = id, %class, patients = found.len(), "Queried connector");
				merge_patients(&mut patients, found);
			}
			Err(err) => {
				warn!(connector = id, %class, "Failed to query connector: {err}");
			}
		}
	}
	patients
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::tests::{connector_config, registry, FakeSource};
	use std::sync::Arc;

	fn study_request(archives: &[&str], study_uid: &str) -> Manifest {
		let criteria = archives
			.iter()
			.fold(SearchCriteria::builder(), |builder, archive| builder.archive(*archive))
			.identifier(IdentifierClass::StudyUid, study_uid)
			.build();
		Manifest::new(criteria)
	}

	#[tokio::test]
	async fn queries_only_requested_archive() {
		let a = Arc::new(FakeSource::default());
		let b = Arc::new(FakeSource::default());
		let dispatcher = ConnectorDispatcher::new(registry(vec![
			(connector_config("A"), Arc::clone(&a)),
			(connector_config("B"), Arc::clone(&b)),
		]));

		let mut manifest = study_request(&["B"], "1.2.3");
		dispatcher.dispatch(&mut manifest).await.unwrap();

		assert!(a.calls().is_empty());
		assert_eq!(
			b.calls(),
			[(IdentifierClass::StudyUid, vec![String::from("1.2.3")])]
		);
		let ids: Vec<&str> = manifest
			.arc_queries()
			.iter()
			.map(|query| query.arc_id.as_str())
			.collect();
		assert_eq!(ids, ["B"]);
	}

	#[tokio::test]
	async fn arc_queries_follow_registry_order() {
		let dispatcher = ConnectorDispatcher::new(registry(vec![
			(connector_config("A"), Arc::default()),
			(connector_config("B"), Arc::default()),
			(connector_config("C"), Arc::default()),
		]));

		let mut manifest = study_request(&[], "1.2.3");
		dispatcher.dispatch(&mut manifest).await.unwrap();
		let ids: Vec<&str> = manifest
			.arc_queries()
			.iter()
			.map(|query| query.arc_id.as_str())
			.collect();
		assert_eq!(ids, ["A", "B", "C"]);

		let mut manifest = study_request(&["C", "A"], "1.2.3");
		dispatcher.dispatch(&mut manifest).await.unwrap();
		let ids: Vec<&str> = manifest
			.arc_queries()
			.iter()
			.map(|query| query.arc_id.as_str())
			.collect();
		assert_eq!(ids, ["C", "A"]);
	}

	#[tokio::test]
	async fn disabled_identifier_classes_are_skipped() {
		let source = Arc::new(FakeSource::default());
		let mut config = connector_config("A");
		config.identifiers.accession_number = false;
		let dispatcher =
			ConnectorDispatcher::new(registry(vec![(config, Arc::clone(&source))]));

		let criteria = SearchCriteria::builder()
			.identifier(IdentifierClass::AccessionNumber, "ACC1")
			.identifier(IdentifierClass::SeriesUid, "1.2.3.4")
			.build();
		let mut manifest = Manifest::new(criteria);
		dispatcher.dispatch(&mut manifest).await.unwrap();

		let classes: Vec<IdentifierClass> = source
			.calls()
			.into_iter()
			.map(|(class, _)| class)
			.collect();
		assert_eq!(classes, [IdentifierClass::SeriesUid]);
	}

	#[tokio::test]
	async fn failing_slices_are_omitted() {
		let failing = Arc::new(FakeSource {
			failing: Some(IdentifierClass::PatientId),
			..FakeSource::default()
		});
		let healthy = Arc::new(FakeSource::default());
		let dispatcher = ConnectorDispatcher::new(registry(vec![
			(connector_config("A"), Arc::clone(&failing)),
			(connector_config("B"), Arc::clone(&healthy)),
		]));

		let criteria = SearchCriteria::builder()
			.identifier(IdentifierClass::PatientId, "P1")
			.identifier(IdentifierClass::StudyUid, "1.2.3")
			.build();
		let mut manifest = Manifest::new(criteria);
		dispatcher.dispatch(&mut manifest).await.unwrap();

		assert_eq!(failing.calls().len(), 2);
		let a = manifest.arc_query("A").unwrap();
		let patient = a.patient("P1").unwrap();
		assert_eq!(patient.studies.len(), 1);
		assert!(patient.study("1.2.3").is_some());

		let b = manifest.arc_query("B").unwrap();
		let patient = b.patient("P1").unwrap();
		assert!(patient.study("P1").is_some());
		assert!(patient.study("1.2.3").is_some());
	}

	#[tokio::test]
	async fn panicking_connector_does_not_discard_others() {
		let panicking = Arc::new(FakeSource {
			panics: true,
			..FakeSource::default()
		});
		let dispatcher = ConnectorDispatcher::new(registry(vec![
			(connector_config("A"), Arc::clone(&panicking)),
			(connector_config("B"), Arc::default()),
		]));

		let mut manifest = study_request(&[], "1.2.3");
		dispatcher.dispatch(&mut manifest).await.unwrap();

		assert_eq!(panicking.calls().len(), 1);
		let ids: Vec<&str> = manifest
			.arc_queries()
			.iter()
			.map(|query| query.arc_id.as_str())
			.collect();
		assert_eq!(ids, ["B"]);
		let b = manifest.arc_query("B").unwrap();
		assert!(b.patient("P1").unwrap().study("1.2.3").is_some());
	}

	#[tokio::test]
	async fn unknown_archive_fails_before_any_query() {
		let source = Arc::new(FakeSource::default());
		let dispatcher =
			ConnectorDispatcher::new(registry(vec![(connector_config("A"), Arc::clone(&source))]));

		let mut manifest = study_request(&["A", "Z"], "1.2.3");
		let result = dispatcher.dispatch(&mut manifest).await;
		assert!(matches!(result, Err(UnknownArchive(id)) if id == "Z"));
		assert!(source.calls().is_empty());
		assert!(manifest.is_empty());
	}
}
