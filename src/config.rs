use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};
use url::Url;

use crate::{batch::FailurePolicy, error::RecordError};

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "isorecord.toml";

/// Dotenv files read from the working directory, lowest precedence first.
pub const ENV_FILES: &[&str] = &[".env.shared", ".env.secret"];

pub const ENV_CATALOG_URL: &str = "GEONETWORK";
pub const ENV_API_PATH: &str = "API_PATH";
pub const ENV_USER: &str = "GEONETWORK_USER";
pub const ENV_PASSWORD: &str = "GEONETWORK_PASSWORD";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL of the GeoNetwork instance, e.g. `https://catalog.example.org/geonetwork`.
    pub url: Option<String>,
    pub api_path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_tls: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            url: None,
            api_path: "/srv/api".to_string(),
            username: None,
            password: None,
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub policy: FailurePolicy,
    pub output_dir: Option<PathBuf>,
}

/// Everything needed to talk to a catalog, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSettings {
    pub api: Url,
    pub username: String,
    pub password: String,
    pub verify_tls: bool,
    me: Url,
    records: Url,
    batch_editing: Url,
}

impl CatalogSettings {
    pub fn new(
        api: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        verify_tls: bool,
    ) -> Result<Self, RecordError> {
        let base = api.trim_end_matches('/');
        let route = |segment: &str| Url::parse(&format!("{base}/{segment}"));
        Ok(CatalogSettings {
            api: Url::parse(base)?,
            username: username.into(),
            password: password.into(),
            verify_tls,
            me: route("me")?,
            records: route("records")?,
            batch_editing: route("records/batchediting")?,
        })
    }

    /// `{api}/me`, used for the login handshake.
    pub fn me(&self) -> &Url {
        &self.me
    }

    pub fn records(&self) -> &Url {
        &self.records
    }

    pub fn batch_editing(&self) -> &Url {
        &self.batch_editing
    }
}

impl Config {
    /// Load the configuration the CLI runs with.
    ///
    /// Values come from, in increasing precedence: built-in defaults, the TOML file (a missing
    /// file is not an error), `.env.shared`, `.env.secret`, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, RecordError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let dotenv = read_env_files(Path::new("."))?;
        Config::load_with(&path, |key| {
            std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
        })
    }

    pub fn load_with(
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RecordError> {
        let mut config = if path.exists() {
            tracing::debug!("Reading configuration from {:?}", path);
            toml::from_str(&read_to_string(path)?)?
        } else {
            tracing::debug!("Config file {:?} not found, using defaults", path);
            Config::default()
        };
        config.apply_overrides(lookup);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_CATALOG_URL) {
            self.catalog.url = Some(url);
        }
        if let Some(api_path) = lookup(ENV_API_PATH) {
            self.catalog.api_path = api_path;
        }
        if let Some(user) = lookup(ENV_USER) {
            self.catalog.username = Some(user);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.catalog.password = Some(password);
        }
    }

    /// Validate the catalog section for commands that need a live catalog.
    pub fn require_catalog(&self) -> Result<CatalogSettings, RecordError> {
        let missing = |what: &str, env: &str| {
            RecordError::Config(format!(
                "catalog {what} is not configured (set catalog.{what} or {env})"
            ))
        };
        let url = self
            .catalog
            .url
            .as_deref()
            .ok_or_else(|| missing("url", ENV_CATALOG_URL))?;
        let username = self
            .catalog
            .username
            .as_deref()
            .ok_or_else(|| missing("username", ENV_USER))?;
        let password = self
            .catalog
            .password
            .as_deref()
            .ok_or_else(|| missing("password", ENV_PASSWORD))?;
        CatalogSettings::new(
            &format!("{}{}", url.trim_end_matches('/'), self.catalog.api_path),
            username,
            password,
            self.catalog.verify_tls,
        )
    }
}

/// Read the dotenv files of `dir` into one map. Later files override earlier ones.
pub fn read_env_files(dir: &Path) -> Result<BTreeMap<String, String>, RecordError> {
    let mut values = BTreeMap::new();
    for name in ENV_FILES {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        tracing::debug!("Reading environment from {:?}", path);
        let entries = dotenvy::from_path_iter(&path)
            .map_err(|e| RecordError::Config(format!("{name}: {e}")))?;
        for entry in entries {
            let (key, value) = entry.map_err(|e| RecordError::Config(format!("{name}: {e}")))?;
            values.insert(key, value);
        }
    }
    Ok(values)
}

pub fn get_content<P: AsRef<Path>>(path: P) -> Result<String, RecordError> {
    tracing::debug!("Reading {:?}", path.as_ref());
    Ok(read_to_string(path)?)
}

/// Write `text` to `path`, creating missing parent directories.
pub fn set_content<P: AsRef<Path>>(path: P, text: &str) -> Result<(), RecordError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)?;
    }
    Ok(write(path, text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(&dir.path().join("absent.toml"), no_env).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.catalog.api_path, "/srv/api");
        assert!(config.catalog.verify_tls);
        assert_eq!(config.batch.policy, FailurePolicy::Abort);
    }

    #[test]
    fn test_toml_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isorecord.toml");
        write(
            &path,
            "[catalog]\nurl = \"https://catalog.example.org/geonetwork\"\nusername = \"editor\"\nverify_tls = false\n\n[batch]\npolicy = \"continue\"\n",
        )
        .unwrap();
        let config = Config::load_with(&path, |key| match key {
            ENV_PASSWORD => Some("s3cret".to_string()),
            ENV_USER => Some("admin".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.batch.policy, FailurePolicy::Continue);
        assert_eq!(config.catalog.username.as_deref(), Some("admin"));

        let settings = config.require_catalog().unwrap();
        assert_eq!(
            settings.records().as_str(),
            "https://catalog.example.org/geonetwork/srv/api/records"
        );
        assert_eq!(
            settings.batch_editing().as_str(),
            "https://catalog.example.org/geonetwork/srv/api/records/batchediting"
        );
        assert_eq!(settings.me().as_str(), "https://catalog.example.org/geonetwork/srv/api/me");
        assert!(!settings.verify_tls);
    }

    #[test]
    fn test_require_catalog_reports_missing_values() {
        let mut config = Config::default();
        assert!(matches!(config.require_catalog(), Err(RecordError::Config(_))));
        config.catalog.url = Some("https://catalog.example.org".to_string());
        config.catalog.username = Some("admin".to_string());
        let err = config.require_catalog().unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_secret_env_file_overrides_shared() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path().join(".env.shared"),
            "GEONETWORK=https://shared.example.org\nGEONETWORK_USER=reader\n",
        )
        .unwrap();
        write(dir.path().join(".env.secret"), "GEONETWORK_USER=admin\n").unwrap();
        let values = read_env_files(dir.path()).unwrap();
        assert_eq!(values.get(ENV_CATALOG_URL).map(String::as_str), Some("https://shared.example.org"));
        assert_eq!(values.get(ENV_USER).map(String::as_str), Some("admin"));
    }

    #[test]
    fn test_set_content_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/records/doc-a.xml");
        set_content(&path, "<x/>").unwrap();
        assert_eq!(get_content(&path).unwrap(), "<x/>");
    }
}
