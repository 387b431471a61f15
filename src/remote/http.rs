//! HTTP remote store client
//!
//! Talks to a PostgREST-style REST endpoint:
//! - `POST /{table}` insert, `Prefer: resolution=merge-duplicates` for upsert
//! - `PATCH /{table}?id=eq.{id}` update
//! - `DELETE /{table}?id=eq.{id}` delete
//! - `GET /{table}?col=eq.val&order=col.asc&limit=n&offset=m` select

use super::{record_id, Record, RemoteError, RemoteStore, SelectQuery};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

/// Postgres unique_violation
const UNIQUE_VIOLATION_CODE: &str = "23505";

const RETURN_ROWS: &str = "return=representation";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRemoteConfig {
    /// REST root, e.g. `https://project.example.com/rest/v1`
    pub base_url: String,
    /// Sent as the `apikey` header
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    /// Session token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, RemoteError> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| RemoteError::InvalidRecord(format!("invalid base url '{}': {}", config.base_url, e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn set_token(&self, token: String) {
        *self.access_token.write().await = Some(token);
    }

    pub async fn clear_token(&self) {
        *self.access_token.write().await = None;
    }

    fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(&urlencoding::encode(table))
            .map_err(|e| RemoteError::InvalidRecord(format!("invalid table '{}': {}", table, e)))
    }

    fn id_url(&self, table: &str, id: &str) -> Result<Url, RemoteError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url, prefer: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, url).header("Prefer", prefer);

        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }

        let token = self.access_token.read().await.clone();
        if let Some(token) = token.or_else(|| self.api_key.clone()) {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Vec<Record>, RemoteError> {
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(handle_error(response).await);
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Record>(&text) {
            Ok(Record::Array(rows)) => Ok(rows),
            Ok(row @ Record::Object(_)) => Ok(vec![row]),
            Ok(other) => Err(RemoteError::InvalidResponse(format!("unexpected body: {}", other))),
            Err(e) => Err(RemoteError::InvalidResponse(e.to_string())),
        }
    }

    fn single(rows: Vec<Record>, context: &str) -> Result<Record, RemoteError> {
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse(format!("{} returned no rows", context)))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn insert(&self, table: &str, record: &Record) -> Result<Record, RemoteError> {
        record_id(record)?;
        let url = self.table_url(table)?;
        let rows = self.send(self.request(Method::POST, url, RETURN_ROWS).await.json(record)).await?;
        Self::single(rows, "insert")
    }

    async fn update(&self, table: &str, id: &str, fields: &Record) -> Result<Record, RemoteError> {
        let url = self.id_url(table, id)?;
        let rows = self.send(self.request(Method::PATCH, url, RETURN_ROWS).await.json(fields)).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", table, id)))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.id_url(table, id)?;
        self.send(self.request(Method::DELETE, url, RETURN_ROWS).await).await?;
        Ok(())
    }

    async fn upsert(&self, table: &str, record: &Record) -> Result<Record, RemoteError> {
        record_id(record)?;
        let url = self.table_url(table)?;
        let builder = self
            .request(Method::POST, url, "resolution=merge-duplicates,return=representation")
            .await
            .json(record);
        let rows = self.send(builder).await?;
        Self::single(rows, "upsert")
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Record>, RemoteError> {
        let mut url = self.table_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            for filter in &query.filters {
                pairs.append_pair(&filter.column, &format!("{}.{}", filter.op.as_str(), filter.value));
            }
            if let Some((column, ascending)) = &query.order_by {
                let direction = if *ascending { "asc" } else { "desc" };
                pairs.append_pair("order", &format!("{}.{}", column, direction));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = query.offset {
                pairs.append_pair("offset", &offset.to_string());
            }
        }
        self.send(self.request(Method::GET, url, RETURN_ROWS).await).await
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout(e.to_string())
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed.message.clone().unwrap_or_else(|| body.clone());

    if parsed.code.as_deref() == Some(UNIQUE_VIOLATION_CODE) {
        return RemoteError::ConstraintViolation(message);
    }

    match status {
        StatusCode::CONFLICT => RemoteError::ConstraintViolation(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout(message),
        s if s.is_server_error() => RemoteError::Server {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
