use std::path::{Path, PathBuf};
use std::time::Duration;

use roster_storage::{
    BackoffPolicy, CredentialsError, FirestoreConfig, ServiceAccountKey, MAX_WRITES_PER_COMMIT,
};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "roster.yaml";
pub const DEFAULT_CREDENTIALS_PATH: &str = "./serviceAccountKey.json";
pub const DEFAULT_COLLECTION: &str = "organizationMembers";
pub const DEFAULT_BATCH_CEILING: usize = 400;
pub const DEFAULT_EXAMPLE_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

/// Optional on-disk settings; every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    credentials: Option<PathBuf>,
    project_id: Option<String>,
    collection: Option<String>,
    emulator_host: Option<String>,
    http_timeout_secs: Option<u64>,
    batch_ceiling: Option<usize>,
    lookups_per_sec: Option<u32>,
    example_limit: Option<usize>,
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub credentials_path: PathBuf,
    pub project_id: Option<String>,
    pub collection: String,
    pub emulator_host: Option<String>,
    pub http_timeout_secs: u64,
    pub batch_ceiling: usize,
    pub lookups_per_sec: Option<u32>,
    pub example_limit: usize,
    pub report_dir: Option<PathBuf>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from(DEFAULT_CREDENTIALS_PATH),
            project_id: None,
            collection: DEFAULT_COLLECTION.to_string(),
            emulator_host: None,
            http_timeout_secs: 20,
            batch_ceiling: DEFAULT_BATCH_CEILING,
            lookups_per_sec: None,
            example_limit: DEFAULT_EXAMPLE_LIMIT,
            report_dir: None,
        }
    }
}

impl ReconcileConfig {
    /// Defaults, then `roster.yaml` under `workspace_root` if present, then
    /// process environment.
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_file(&workspace_root.join(CONFIG_FILE_NAME))?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.credentials {
            self.credentials_path = v;
        }
        if file.project_id.is_some() {
            self.project_id = file.project_id;
        }
        if let Some(v) = file.collection {
            self.collection = v;
        }
        if file.emulator_host.is_some() {
            self.emulator_host = file.emulator_host;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.batch_ceiling {
            self.batch_ceiling = v;
        }
        if file.lookups_per_sec.is_some() {
            self.lookups_per_sec = file.lookups_per_sec;
        }
        if let Some(v) = file.example_limit {
            self.example_limit = v;
        }
        if file.report_dir.is_some() {
            self.report_dir = file.report_dir;
        }
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // The dedicated variable wins over the ecosystem-wide one.
        if let Some(path) = var("ROSTER_CREDENTIALS").or_else(|| var("GOOGLE_APPLICATION_CREDENTIALS")) {
            self.credentials_path = PathBuf::from(path);
        }
        if let Some(project) = var("ROSTER_PROJECT_ID") {
            self.project_id = Some(project);
        }
        if let Some(collection) = var("ROSTER_COLLECTION") {
            self.collection = collection;
        }
        if let Some(host) = var("FIRESTORE_EMULATOR_HOST") {
            self.emulator_host = Some(host);
        }
        if let Some(raw) = var("ROSTER_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number("ROSTER_HTTP_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("ROSTER_BATCH_CEILING") {
            self.batch_ceiling = parse_number("ROSTER_BATCH_CEILING", &raw)?;
        }
        if let Some(raw) = var("ROSTER_LOOKUPS_PER_SEC") {
            self.lookups_per_sec = Some(parse_number("ROSTER_LOOKUPS_PER_SEC", &raw)?);
        }
        Ok(())
    }

    /// Batch ceiling clamped into what a single commit accepts.
    pub fn effective_batch_ceiling(&self) -> usize {
        self.batch_ceiling.clamp(1, MAX_WRITES_PER_COMMIT)
    }

    pub fn firestore_config(&self, key: &ServiceAccountKey) -> Result<FirestoreConfig, CredentialsError> {
        let project_id = self
            .project_id
            .clone()
            .or_else(|| key.project_id.clone())
            .ok_or(CredentialsError::MissingProject)?;
        Ok(FirestoreConfig {
            emulator_host: self.emulator_host.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            backoff: BackoffPolicy::default(),
            lookups_per_sec: self.lookups_per_sec.filter(|n| *n > 0),
            ..FirestoreConfig::new(project_id, self.collection.clone())
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}
