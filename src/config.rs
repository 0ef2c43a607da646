use crate::identity::DEFAULT_SCALAR_CACHE_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidstoreConfig {
    pub database: PathBuf,
    pub dbid: Option<String>,
    pub idle_timeout_ms: u64,
    pub idle_gc: bool,
    pub default_depth: i32,
    pub lazy_depth: i32,
    pub scalar_cache_limit: usize,
}

impl Default for OidstoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path_in(Path::new(".")),
            dbid: None,
            idle_timeout_ms: 1000,
            idle_gc: false,
            default_depth: 1,
            lazy_depth: 1,
            scalar_cache_limit: DEFAULT_SCALAR_CACHE_LIMIT,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("oidstore.toml")
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join(".oidstore").join("store.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<OidstoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: OidstoreConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &OidstoreConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
