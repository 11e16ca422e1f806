//! Thin CouchDB HTTP client used as the primary document store.
//!
//! Logical collections are mapped onto document-id prefixes
//! (`content::`, `config::`, `log::`, `user::`), so prefix range scans over
//! `_all_docs` stand in for per-collection queries.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::info;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct CouchClient {
    client: Client,
    base_url: String,
    db_name: String,
    auth: (String, String),
}

#[derive(Debug, Deserialize)]
pub struct CouchResponse {
    pub ok: Option<bool>,
    pub id: Option<String>,
    pub rev: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDocResult {
    pub ok: Option<bool>,
    pub id: Option<String>,
    pub rev: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    pub doc: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum CouchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("CouchDB error: {error} - {reason}")]
    Couch { error: String, reason: String },
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl CouchClient {
    pub fn new(base_url: &str, db_name: &str, user: &str, password: &str) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            db_name: db_name.to_string(),
            auth: (user.to_string(), password.to_string()),
        }
    }

    fn db_url(&self) -> String {
        format!("{}/{}", self.base_url, self.db_name)
    }

    /// Liveness probe: fetch database metadata.
    pub async fn db_info(&self) -> Result<serde_json::Value, CouchError> {
        let resp = self
            .client
            .get(&self.db_url())
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(resp.json().await?)
        } else {
            let body: CouchResponse = resp.json().await?;
            Err(CouchError::Couch {
                error: body.error.unwrap_or_default(),
                reason: body.reason.unwrap_or_default(),
            })
        }
    }

    pub async fn ensure_db(&self) -> Result<(), CouchError> {
        let resp = self
            .client
            .put(&self.db_url())
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?;

        match resp.status().as_u16() {
            201 => {
                info!(db = %self.db_name, "Created database");
                Ok(())
            }
            412 => Ok(()),
            status => {
                let body: CouchResponse = resp.json().await?;
                Err(CouchError::Couch {
                    error: body.error.unwrap_or_else(|| format!("HTTP {status}")),
                    reason: body.reason.unwrap_or_default(),
                })
            }
        }
    }

    pub async fn get_document(&self, id: &str) -> Result<serde_json::Value, CouchError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.db_url(), urlencoding::encode(id)))
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => Ok(resp.json().await?),
            404 => Err(CouchError::NotFound(id.to_string())),
            _ => {
                let body: CouchResponse = resp.json().await?;
                Err(CouchError::Couch {
                    error: body.error.unwrap_or_default(),
                    reason: body.reason.unwrap_or_default(),
                })
            }
        }
    }

    pub async fn put_document(
        &self,
        id: &str,
        doc: &serde_json::Value,
    ) -> Result<CouchResponse, CouchError> {
        let resp = self
            .client
            .put(format!("{}/{}", self.db_url(), urlencoding::encode(id)))
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .json(doc)
            .send()
            .await?;

        match resp.status().as_u16() {
            201 | 202 => Ok(resp.json().await?),
            409 => Err(CouchError::Conflict(id.to_string())),
            _ => {
                let body: CouchResponse = resp.json().await?;
                Err(CouchError::Couch {
                    error: body.error.unwrap_or_default(),
                    reason: body.reason.unwrap_or_default(),
                })
            }
        }
    }

    pub async fn delete_document(&self, id: &str, rev: &str) -> Result<CouchResponse, CouchError> {
        let resp = self
            .client
            .delete(format!(
                "{}/{}?rev={}",
                self.db_url(),
                urlencoding::encode(id),
                urlencoding::encode(rev),
            ))
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 202 => Ok(resp.json().await?),
            404 => Err(CouchError::NotFound(id.to_string())),
            _ => {
                let body: CouchResponse = resp.json().await?;
                Err(CouchError::Couch {
                    error: body.error.unwrap_or_default(),
                    reason: body.reason.unwrap_or_default(),
                })
            }
        }
    }

    /// Bulk write. Documents posted without a `_rev` are insert-only: CouchDB
    /// reports a per-document `conflict` for ids that already exist, which is
    /// exactly the seed-without-overwrite behavior the repository needs.
    pub async fn bulk_docs(
        &self,
        docs: &[serde_json::Value],
    ) -> Result<Vec<BulkDocResult>, CouchError> {
        let payload = serde_json::json!({ "docs": docs });
        let resp = self
            .client
            .post(format!("{}/_bulk_docs", self.db_url()))
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .json(&payload)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(resp.json().await?)
        } else {
            let body: CouchResponse = resp.json().await?;
            Err(CouchError::Couch {
                error: body.error.unwrap_or_default(),
                reason: body.reason.unwrap_or_default(),
            })
        }
    }

    pub async fn all_docs_by_prefix(
        &self,
        prefix: &str,
        include_docs: bool,
        descending: bool,
        limit: Option<usize>,
    ) -> Result<AllDocsResponse, CouchError> {
        let low = serde_json::to_string(prefix).unwrap_or_default();
        let high =
            serde_json::to_string(&format!("{}\u{ffff}", prefix)).unwrap_or_default();
        // In descending order CouchDB expects startkey > endkey.
        let (startkey, endkey) = if descending { (&high, &low) } else { (&low, &high) };

        let mut url = format!(
            "{}/_all_docs?startkey={}&endkey={}",
            self.db_url(),
            urlencoding::encode(startkey),
            urlencoding::encode(endkey),
        );
        if include_docs {
            url.push_str("&include_docs=true");
        }
        if descending {
            url.push_str("&descending=true");
        }
        if let Some(n) = limit {
            url.push_str(&format!("&limit={n}"));
        }

        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.auth.0, Some(&self.auth.1))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(resp.json().await?)
        } else {
            let body: CouchResponse = resp.json().await?;
            Err(CouchError::Couch {
                error: body.error.unwrap_or_default(),
                reason: body.reason.unwrap_or_default(),
            })
        }
    }

    /// Create the Mango indexes the store queries rely on. Idempotent and
    /// safe to run on every startup; individual failures are logged and
    /// skipped so a partially-indexed database still serves requests.
    pub async fn create_indexes(&self) -> Result<(), CouchError> {
        let indexes = vec![
            ("idx-content-id", serde_json::json!({"fields": ["id"]})),
            ("idx-log-kind-at", serde_json::json!({"fields": ["kind", "at"]})),
            ("idx-user-ns", serde_json::json!({"fields": ["user_id", "namespace"]})),
        ];

        for (name, index) in indexes {
            let payload = serde_json::json!({
                "index": index,
                "ddoc": name,
                "name": name,
                "type": "json",
            });

            let resp = self
                .client
                .post(format!("{}/_index", self.db_url()))
                .basic_auth(&self.auth.0, Some(&self.auth.1))
                .json(&payload)
                .send()
                .await?;

            if !resp.status().is_success() {
                let body: CouchResponse = resp.json().await?;
                tracing::warn!(
                    index = name,
                    error = ?body.error,
                    reason = ?body.reason,
                    "Failed to create index"
                );
            }
        }

        Ok(())
    }
}
