use crate::criteria::IdentifierClass;
use crate::types::AE;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	Load(#[from] config::ConfigError),
	#[error("Connector id must not be empty")]
	EmptyConnectorId,
	#[error("Connector {0} is configured more than once")]
	DuplicateConnector(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub cache: CacheConfig,
	/// Configured archives. The order is significant: it is the default order of the
	/// archive queries inside a manifest.
	#[serde(default)]
	pub connectors: Vec<ConnectorConfig>,
}

impl AppConfig {
	pub fn new() -> Result<Self, ConfigError> {
		let config: Self = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("DICOM_MANIFEST").separator("__"))
			.build()?
			.try_deserialize()?;

		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		let mut seen = HashSet::with_capacity(self.connectors.len());
		for connector in &self.connectors {
			if connector.id.trim().is_empty() {
				return Err(ConfigError::EmptyConnectorId);
			}
			if !seen.insert(connector.id.as_str()) {
				return Err(ConfigError::DuplicateConnector(connector.id.clone()));
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Configurable logging level. `RUST_LOG` takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// DSN for Sentry. Sentry stays disabled if unset.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;
	Level::from_str(&value).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
	/// The calling AE title used for outgoing associations.
	pub aet: AE,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	/// Request timeout in milliseconds.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
	pub base_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
	/// Time-to-live of a cache entry in seconds, counted from its installation.
	pub ttl: u64,
	/// Seconds between two sweeps over expired entries.
	pub eviction_interval: u64,
	/// Upper bound of cache reads while a build is in progress.
	pub poll_attempts: u32,
	/// Pause between two cache reads in milliseconds.
	pub poll_interval: u64,
}

impl CacheConfig {
	pub const fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl)
	}

	pub const fn eviction_interval(&self) -> Duration {
		Duration::from_secs(self.eviction_interval)
	}

	pub const fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
	pub id: String,
	pub backend: BackendConfig,
	#[serde(default)]
	pub wado: WadoConfig,
	#[serde(default)]
	pub identifiers: IdentifierToggles,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
	Dimse(DimseConfig),
	Database(DatabaseConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseConfig {
	/// The called AE title of the archive.
	pub aet: AE,
	pub host: IpAddr,
	pub port: u16,
	/// Timeout for a single DIMSE message exchange in milliseconds.
	#[serde(default = "DimseConfig::default_timeout")]
	pub timeout: u64,
	#[serde(default)]
	pub pool: PoolConfig,
}

impl DimseConfig {
	const fn default_timeout() -> u64 {
		30_000
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
	pub size: usize,
	/// Milliseconds to wait for a free association.
	pub timeout: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			size: 16,
			timeout: 10_000,
		}
	}
}

/// A relational archive. Every statement takes a single bind parameter and returns
/// flat rows, one per instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
	pub url: String,
	#[serde(default = "DatabaseConfig::default_max_connections")]
	pub max_connections: u32,
	pub patient_query: Option<String>,
	pub accession_query: Option<String>,
	pub study_query: Option<String>,
	pub series_query: Option<String>,
	pub instance_query: Option<String>,
}

impl DatabaseConfig {
	const fn default_max_connections() -> u32 {
		5
	}

	pub fn statement(&self, class: IdentifierClass) -> Option<&str> {
		match class {
			IdentifierClass::PatientId => self.patient_query.as_deref(),
			IdentifierClass::AccessionNumber => self.accession_query.as_deref(),
			IdentifierClass::StudyUid => self.study_query.as_deref(),
			IdentifierClass::SeriesUid => self.series_query.as_deref(),
			IdentifierClass::SopUid => self.instance_query.as_deref(),
		}
	}
}

/// WADO settings stamped into every archive query of a manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WadoConfig {
	/// Always embed basic credentials, even for authenticated requests.
	pub force_basic_auth: bool,
	pub basic_url: String,
	pub oauth2_url: String,
	pub login: Option<String>,
	pub password: Option<String>,
	pub http_tags: Vec<HttpTagConfig>,
	pub override_dicom_tags: Option<String>,
	pub additional_parameters: Option<String>,
	pub require_only_sop_instance_uid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpTagConfig {
	pub key: String,
	pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdentifierToggles {
	pub patient_id: bool,
	pub accession_number: bool,
	pub study_uid: bool,
	pub series_uid: bool,
	pub sop_uid: bool,
}

impl Default for IdentifierToggles {
	fn default() -> Self {
		Self {
			patient_id: true,
			accession_number: true,
			study_uid: true,
			series_uid: true,
			sop_uid: true,
		}
	}
}

impl IdentifierToggles {
	pub const fn is_enabled(&self, class: IdentifierClass) -> bool {
		match class {
			IdentifierClass::PatientId => self.patient_id,
			IdentifierClass::AccessionNumber => self.accession_number,
			IdentifierClass::StudyUid => self.study_uid,
			IdentifierClass::SeriesUid => self.series_uid,
			IdentifierClass::SopUid => self.sop_uid,
		}
	}
}
