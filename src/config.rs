use std::path::{Path, PathBuf};

use serde::Deserialize;

fn default_cache_ttl() -> u64 {
	60
}

/// Root configuration, loaded from the JSON file given with `-c`.
#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
	/// System store path.
	pub db: PathBuf,
	/// Traffic statistics store path.
	pub statistic_db: PathBuf,
	/// Admin surface bind address; consumed by the (external) web layer.
	#[serde(default)]
	pub web_address: String,
	/// Admin token signing secret; consumed by the (external) web layer.
	#[serde(default)]
	pub web_secret: String,
	/// Directory holding `geosite.dat` / `geoip.dat` and other assets.
	pub static_path: PathBuf,
	#[serde(default)]
	pub mitm_ca_cert: Option<PathBuf>,
	#[serde(default)]
	pub mitm_ca_key: Option<PathBuf>,
	/// HTTP cache directory.
	#[serde(default, alias = "badger_dir")]
	pub cache_dir: Option<PathBuf>,
	/// Maximum number of cached responses; zero disables the cache.
	#[serde(default, alias = "badger_size")]
	pub cache_size: usize,
	/// Freshness fallback when a response carries neither `max-age` nor
	/// `Expires`.
	#[serde(default = "default_cache_ttl")]
	pub cache_default_ttl_secs: u64,
}

impl RootConfig {
	pub fn load(path: &Path) -> anyhow::Result<RootConfig> {
		let raw = std::fs::read(path)
			.map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
		Ok(serde_json::from_slice(&raw)?)
	}
}
