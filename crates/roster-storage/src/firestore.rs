//! Firestore REST client authenticated with a service-account key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use roster_core::{MembershipRecord, MirrorRecord, Mutation, MIRROR_COLLECTION, MIRROR_ROOT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use crate::codec::{decode_member, decode_mirror, encode_write};
use crate::credentials::{CredentialsError, ServiceAccountKey};
use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, RecordStore, RetryDisposition,
    SimpleTokenBucket, StoreError, MAX_WRITES_PER_COMMIT,
};

const PRODUCTION_HOST: &str = "https://firestore.googleapis.com";
const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Refresh this long before the access token expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub collection: String,
    /// `host:port` of a local emulator; plain HTTP and the emulator owner token.
    pub emulator_host: Option<String>,
    pub timeout: Duration,
    pub page_size: u32,
    pub backoff: BackoffPolicy,
    pub lookups_per_sec: Option<u32>,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            collection: collection.into(),
            emulator_host: None,
            timeout: Duration::from_secs(20),
            page_size: 300,
            backoff: BackoffPolicy::default(),
            lookups_per_sec: None,
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

enum Auth {
    Emulator,
    ServiceAccount {
        key: ServiceAccountKey,
        token: Mutex<Option<AccessToken>>,
    },
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<JsonValue>,
    next_page_token: Option<String>,
}

pub struct FirestoreClient {
    http: reqwest::Client,
    config: FirestoreConfig,
    host: String,
    auth: Auth,
    lookup_bucket: Option<SimpleTokenBucket>,
}

impl std::fmt::Debug for FirestoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("auth", &"<present>")
            .finish()
    }
}

impl FirestoreClient {
    /// Build the client and obtain a first access token, so bad credentials
    /// surface before any collection work starts.
    pub async fn connect(config: FirestoreConfig, key: ServiceAccountKey) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let (host, auth) = match &config.emulator_host {
            Some(emulator) => (format!("http://{}", emulator.trim_end_matches('/')), Auth::Emulator),
            None => (
                PRODUCTION_HOST.to_string(),
                Auth::ServiceAccount {
                    key,
                    token: Mutex::new(None),
                },
            ),
        };
        let lookup_bucket = config.lookups_per_sec.map(SimpleTokenBucket::per_second);

        let client = Self {
            http,
            config,
            host,
            auth,
            lookup_bucket,
        };
        client.bearer().await?;
        Ok(client)
    }

    /// `projects/{p}/databases/(default)/documents`, as used in write names.
    pub fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/(default)/documents",
            self.config.project_id
        )
    }

    fn document_url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let base = format!("{}/v1/{}", self.host, self.documents_root());
        let mut url = Url::parse(&base)
            .map_err(|err| StoreError::Unavailable(format!("invalid store url {base}: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable(format!("store url {base} cannot take a path")))?
            .extend(segments);
        Ok(url)
    }

    async fn bearer(&self) -> Result<String, StoreError> {
        match &self.auth {
            Auth::Emulator => Ok("owner".to_string()),
            Auth::ServiceAccount { key, token } => {
                let mut cached = token.lock().await;
                if let Some(current) = cached.as_ref() {
                    if current.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                        return Ok(current.value.clone());
                    }
                }
                let fresh = self.exchange_assertion(key).await?;
                let value = fresh.value.clone();
                *cached = Some(fresh);
                Ok(value)
            }
        }
    }

    async fn exchange_assertion(&self, key: &ServiceAccountKey) -> Result<AccessToken, StoreError> {
        let issued_at = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: DATASTORE_SCOPE,
            aud: &key.token_uri,
            iat: issued_at,
            exp: issued_at + 3600,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|err| CredentialsError::Signing(err.to_string()))?;
        let assertion = jsonwebtoken::encode(&header, &claims, &signing_key)
            .map_err(|err| CredentialsError::Signing(err.to_string()))?;

        let resp = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncated_body(resp).await;
            return Err(StoreError::Unauthenticated(format!(
                "token exchange at {} returned {status}: {body}",
                key.token_uri
            )));
        }
        let token: TokenResponse = resp.json().await?;
        debug!(expires_in = token.expires_in, "obtained store access token");
        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    /// Send with retries per `backoff`. Returns success and 404 responses;
    /// everything else becomes an error.
    async fn execute<F>(
        &self,
        url: &Url,
        backoff: BackoffPolicy,
        build: F,
    ) -> Result<Response, StoreError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let bearer = self.bearer().await?;
            match build(&self.http).bearer_auth(bearer).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        return Ok(resp);
                    }
                    if status == StatusCode::UNAUTHORIZED {
                        let body = truncated_body(resp).await;
                        return Err(StoreError::Unauthenticated(format!("{url}: {body}")));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%url, %status, attempt, "retrying store request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body: truncated_body(resp).await,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%url, error = %err, attempt, "retrying store request");
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => StoreError::Request(err),
            None => StoreError::Unavailable(format!("{url}: retries exhausted")),
        })
    }
}

async fn truncated_body(resp: Response) -> String {
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl RecordStore for FirestoreClient {
    fn describe(&self) -> String {
        format!("{}/{}/{}", self.host, self.documents_root(), self.config.collection)
    }

    async fn list_members(&self) -> Result<Vec<MembershipRecord>, StoreError> {
        let url = self.document_url(&[self.config.collection.as_str()])?;
        let span = info_span!("list_members", collection = %self.config.collection);
        async {
            let mut records = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let page_size = self.config.page_size.to_string();
                let resp = self
                    .execute(&url, self.config.backoff, |http| {
                        let mut query = vec![("pageSize", page_size.as_str())];
                        if let Some(token) = page_token.as_deref() {
                            query.push(("pageToken", token));
                        }
                        http.get(url.clone()).query(&query)
                    })
                    .await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    break;
                }
                let page: ListDocumentsResponse = resp.json().await?;
                for doc in &page.documents {
                    let record = decode_member(doc).map_err(|source| StoreError::Codec {
                        name: doc
                            .get("name")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("<unnamed>")
                            .to_string(),
                        source,
                    })?;
                    records.push(record);
                }
                debug!(fetched = records.len(), "read membership page");
                match page.next_page_token.filter(|t| !t.is_empty()) {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }
            Ok::<_, StoreError>(records)
        }
        .instrument(span)
        .await
    }

    async fn get_mirror(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MirrorRecord>, StoreError> {
        if let Some(bucket) = &self.lookup_bucket {
            bucket.take().await;
        }
        let url = self.document_url(&[MIRROR_ROOT, organization_id, MIRROR_COLLECTION, user_id])?;
        let resp = self
            .execute(&url, self.config.backoff, |http| http.get(url.clone()))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: JsonValue = resp.json().await?;
        Ok(Some(decode_mirror(&doc)))
    }

    async fn commit(&self, writes: &[Mutation]) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        if writes.len() > MAX_WRITES_PER_COMMIT {
            return Err(StoreError::Rejected(format!(
                "{} writes exceed the per-commit limit of {MAX_WRITES_PER_COMMIT}",
                writes.len()
            )));
        }
        let root = self.documents_root();
        let body = json!({
            "writes": writes
                .iter()
                .map(|w| encode_write(w, &root, &self.config.collection))
                .collect::<Vec<_>>(),
        });
        let base = format!("{}/v1/{root}:commit", self.host);
        let url = Url::parse(&base)
            .map_err(|err| StoreError::Unavailable(format!("invalid store url {base}: {err}")))?;
        // Sent once: a commit that landed before a 5xx or timeout would fail
        // its `exists` preconditions on replay. The next run re-plans instead.
        let resp = self
            .execute(&url, self.config.backoff.without_retries(), |http| {
                http.post(url.clone()).json(&body)
            })
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::HttpStatus {
                status: StatusCode::NOT_FOUND.as_u16(),
                url: url.to_string(),
                body: truncated_body(resp).await,
            });
        }
        Ok(())
    }
}
