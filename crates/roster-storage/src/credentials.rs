//! Service-account key loading.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials file {} does not exist", .path.display())]
    Missing { path: PathBuf },
    #[error("reading credentials file {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing credentials file {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("credentials file {} is a {kind:?} key, expected a service_account key", .path.display())]
    WrongKind { path: PathBuf, kind: String },
    #[error("no project id in credentials and none configured")]
    MissingProject,
    #[error("signing token assertion: {0}")]
    Signing(String),
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub project_id: Option<String>,
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub fn load_service_account(path: &Path) -> Result<ServiceAccountKey, CredentialsError> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            CredentialsError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            CredentialsError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let key: ServiceAccountKey =
        serde_json::from_str(&text).map_err(|source| CredentialsError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    match key.kind.as_deref() {
        None | Some("service_account") => Ok(key),
        Some(other) => Err(CredentialsError::WrongKind {
            path: path.to_path_buf(),
            kind: other.to_string(),
        }),
    }
}
