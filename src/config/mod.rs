use std::path::{Path, PathBuf};

use log::Level;
use serde::Deserialize;
use thiserror::Error;

/// Runtime configuration for a trialsync site.
///
/// Values are loaded from (in order): `/etc/trialsync/trialsync.json`, the
/// user and local config folders (optional), an explicit file passed on the
/// command line, and environment variables prefixed with `TRIALSYNC_`
/// (nested keys use `__`, e.g. `TRIALSYNC_RANDOMISING__BLOCK_SIZES`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	/// Directory holding the live store and extracted remote stores.
	pub data_dir: PathBuf,
	pub store_name: String,
	pub store_extension: String,
	/// Shared folders scanned read-only for other sites' archives.
	pub remote_dirs: Vec<PathBuf>,
	/// Where this site's archive is written. Defaults to the first remote dir.
	pub export_dir: Option<PathBuf>,
	/// Name stamped on enrolments and protocol violations.
	pub operator: String,
	#[serde(deserialize_with = "level_any_case")]
	pub log_level: Level,
	pub log_file: Option<PathBuf>,
	/// JSON list of sealed envelopes. Without it envelope randomising is off.
	pub envelopes_file: Option<PathBuf>,
	pub randomising: RandomisingSettings,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct RandomisingSettings {
	/// Birth weights at or above this fall in the heavier randomising band.
	pub weight_band_threshold_grams: i32,
	/// Upper eligibility limit for birth weight.
	pub max_birth_weight_grams: i32,
	/// Candidate sizes for new blocks. Each must be even.
	pub block_sizes: Vec<i32>,
}

/// Accepts `debug`, `Debug` or `DEBUG` alike, as log's own parser does.
fn level_any_case<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let raw = String::deserialize(deserializer)?;
	raw.trim()
		.parse::<Level>()
		.map_err(|_| serde::de::Error::custom(format!("unknown log level `{raw}`")))
}

impl Default for RandomisingSettings {
	fn default() -> Self {
		Self {
			weight_band_threshold_grams: 1000,
			max_birth_weight_grams: 2000,
			block_sizes: vec![4, 6, 8],
		}
	}
}

impl Default for Settings {
	fn default() -> Self {
		let operator = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "unknown".to_string());
		let data_dir = dirs::data_local_dir()
			.map(|d| d.join("trialsync"))
			.unwrap_or_else(|| PathBuf::from("trialsync-data"));

		Self {
			data_dir,
			store_name: "TrialData".to_string(),
			store_extension: "db".to_string(),
			remote_dirs: Vec::new(),
			export_dir: None,
			operator,
			log_level: Level::Info,
			log_file: None,
			envelopes_file: None,
			randomising: RandomisingSettings::default(),
		}
	}
}

impl Settings {
	pub fn store_file(&self) -> PathBuf {
		self.data_dir
			.join(format!("{}.{}", self.store_name, self.store_extension))
	}

	pub fn export_target(&self) -> Option<&Path> {
		self.export_dir
			.as_deref()
			.or_else(|| self.remote_dirs.first().map(PathBuf::as_path))
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	load_with(None)
}

pub fn load_with(extra_file: Option<&Path>) -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/trialsync/trialsync.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("trialsync").join("trialsync.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("trialsync").join("trialsync.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}
	if let Some(path) = extra_file {
		builder = builder.add_source(config::File::from(path).required(true));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("TRIALSYNC")
			.prefix_separator("_")
			.separator("__")
			.try_parsing(true)
			.list_separator(",")
			.with_list_parse_key("remote_dirs")
			.with_list_parse_key("randomising.block_sizes"),
	);

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Direct variables win over everything, whatever the `config` crate made
	// of them.
	if let Ok(d) = std::env::var("TRIALSYNC_DATA_DIR") {
		if !d.is_empty() {
			s.data_dir = PathBuf::from(d);
		}
	}
	if let Ok(n) = std::env::var("TRIALSYNC_STORE_NAME") {
		if !n.is_empty() {
			s.store_name = n;
		}
	}
	if let Ok(r) = std::env::var("TRIALSYNC_REMOTE_DIRS") {
		if !r.is_empty() {
			s.remote_dirs = r
				.split(',')
				.map(str::trim)
				.filter(|p| !p.is_empty())
				.map(PathBuf::from)
				.collect();
		}
	}
	if let Ok(e) = std::env::var("TRIALSYNC_EXPORT_DIR") {
		if !e.is_empty() {
			s.export_dir = Some(PathBuf::from(e));
		}
	}
	if let Ok(o) = std::env::var("TRIALSYNC_OPERATOR") {
		if !o.is_empty() {
			s.operator = o;
		}
	}
	if let Ok(f) = std::env::var("TRIALSYNC_ENVELOPES_FILE") {
		if !f.is_empty() {
			s.envelopes_file = Some(PathBuf::from(f));
		}
	}
	if let Ok(l) = std::env::var("TRIALSYNC_LOG_LEVEL") {
		if !l.is_empty() {
			if let Ok(parsed) = l.parse::<Level>() {
				s.log_level = parsed;
			}
		}
	}

	Ok(s)
}
