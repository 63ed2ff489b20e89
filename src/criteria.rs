//! Normalized launch request and the cache key derived from it.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// The axis along which a launch request selects data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentifierClass {
	PatientId,
	AccessionNumber,
	StudyUid,
	SeriesUid,
	SopUid,
}

impl IdentifierClass {
	/// All classes in dispatch order.
	pub const ALL: [Self; 5] = [
		Self::PatientId,
		Self::AccessionNumber,
		Self::StudyUid,
		Self::SeriesUid,
		Self::SopUid,
	];

	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::PatientId => "patientID",
			Self::AccessionNumber => "accessionNumber",
			Self::StudyUid => "studyUID",
			Self::SeriesUid => "seriesUID",
			Self::SopUid => "objectUID",
		}
	}
}

impl Display for IdentifierClass {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Describes which identifiers to resolve and against which archives.
///
/// Identifiers are kept in sorted sets, so two criteria with the same members
/// dispatch identical queries. The archive list keeps its insertion order because it
/// decides the order of the archive queries in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
	archives: Vec<String>,
	patient_ids: BTreeSet<String>,
	accession_numbers: BTreeSet<String>,
	study_uids: BTreeSet<String>,
	series_uids: BTreeSet<String>,
	sop_uids: BTreeSet<String>,
	host: Option<String>,
	user: Option<String>,
	config_name: Option<String>,
	access_token: Option<String>,
}

impl SearchCriteria {
	pub fn builder() -> SearchCriteriaBuilder {
		SearchCriteriaBuilder::default()
	}

	/// Requested archive ids. Empty means every configured archive.
	pub fn archives(&self) -> &[String] {
		&self.archives
	}

	pub const fn identifiers(&self, class: IdentifierClass) -> &BTreeSet<String> {
		match class {
			IdentifierClass::PatientId => &self.patient_ids,
			IdentifierClass::AccessionNumber => &self.accession_numbers,
			IdentifierClass::StudyUid => &self.study_uids,
			IdentifierClass::SeriesUid => &self.series_uids,
			IdentifierClass::SopUid => &self.sop_uids,
		}
	}

	pub fn has_identifiers(&self) -> bool {
		IdentifierClass::ALL
			.iter()
			.any(|class| !self.identifiers(*class).is_empty())
	}

	pub fn host(&self) -> Option<&str> {
		self.host.as_deref()
	}

	pub fn user(&self) -> Option<&str> {
		self.user.as_deref()
	}

	pub fn config_name(&self) -> Option<&str> {
		self.config_name.as_deref()
	}

	/// A request counts as authenticated when it carried an access token.
	pub const fn is_request_authenticated(&self) -> bool {
		self.access_token.is_some()
	}

	pub fn access_token(&self) -> Option<&str> {
		self.access_token.as_deref()
	}

	/// Derives the cache key of this request.
	///
	/// Identifiers are hashed exactly as they are queried, so their order is ignored
	/// but their case is not. The archive order is part of the key since it changes
	/// the resulting document.
	pub fn cache_key(&self) -> String {
		const FIELD: u8 = 0x1e;
		const ITEM: u8 = 0x1f;

		let mut hasher = Sha256::new();
		hasher.update(b"archives");
		for archive in &self.archives {
			hasher.update([ITEM]);
			hasher.update(archive.as_bytes());
		}

		for class in IdentifierClass::ALL {
			hasher.update([FIELD]);
			hasher.update(class.as_str().as_bytes());
			for id in self.identifiers(class) {
				hasher.update([ITEM]);
				hasher.update(id.as_bytes());
			}
		}

		for (name, value) in [
			("host", &self.host),
			("user", &self.user),
			("config", &self.config_name),
			("token", &self.access_token),
		] {
			hasher.update([FIELD]);
			hasher.update(name.as_bytes());
			if let Some(value) = value {
				hasher.update([ITEM]);
				hasher.update(value.as_bytes());
			}
		}

		hex::encode(hasher.finalize())
	}
}

#[derive(Debug, Default)]
pub struct SearchCriteriaBuilder {
	inner: SearchCriteria,
}

impl SearchCriteriaBuilder {
	/// Adds an archive id. Repeated ids keep their first position.
	pub fn archive(mut self, archive: impl Into<String>) -> Self {
		let archive = archive.into();
		let archive = archive.trim();
		if !archive.is_empty() && !self.inner.archives.iter().any(|a| a == archive) {
			self.inner.archives.push(archive.to_owned());
		}
		self
	}

	pub fn identifier(mut self, class: IdentifierClass, id: impl Into<String>) -> Self {
		let id = id.into();
		let id = id.trim();
		if !id.is_empty() {
			let set = match class {
				IdentifierClass::PatientId => &mut self.inner.patient_ids,
				IdentifierClass::AccessionNumber => &mut self.inner.accession_numbers,
				IdentifierClass::StudyUid => &mut self.inner.study_uids,
				IdentifierClass::SeriesUid => &mut self.inner.series_uids,
				IdentifierClass::SopUid => &mut self.inner.sop_uids,
			};
			set.insert(id.to_owned());
		}
		self
	}

	pub fn identifiers<I, S>(self, class: IdentifierClass, ids: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		ids.into_iter()
			.fold(self, |builder, id| builder.identifier(class, id))
	}

	pub fn host(mut self, host: impl Into<String>) -> Self {
		self.inner.host = Some(host.into());
		self
	}

	pub fn user(mut self, user: impl Into<String>) -> Self {
		self.inner.user = Some(user.into());
		self
	}

	pub fn config_name(mut self, config_name: impl Into<String>) -> Self {
		self.inner.config_name = Some(config_name.into());
		self
	}

	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.inner.access_token = Some(token.into());
		self
	}

	pub fn build(self) -> SearchCriteria {
		self.inner
	}
}
