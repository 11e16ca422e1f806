//! Remote read-only fallback source for the content catalog.
//!
//! A single unauthenticated HTTP GET against a fixed URL, returning either a
//! JSON array of items or an object whose values are items. Bounded timeout,
//! no retries: a failed fetch degrades that call to an empty result.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::documents::ContentItem;
use crate::error::{Result, StoreError};

const FETCH_TIMEOUT: Duration = Duration::from_secs(6);

#[async_trait]
pub trait FallbackSource: Send + Sync {
    /// The full catalog as served by the fallback, in source order.
    async fn fetch_catalog(&self) -> Result<Vec<ContentItem>>;
}

pub struct HttpFallback {
    client: Client,
    url: String,
}

impl HttpFallback {
    pub fn new(url: &str) -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl FallbackSource for HttpFallback {
    async fn fetch_catalog(&self) -> Result<Vec<ContentItem>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| StoreError::TransientFetch(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StoreError::TransientFetch(format!(
                "fallback source returned HTTP {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::TransientFetch(e.to_string()))?;
        parse_catalog(body)
    }
}

/// Stand-in when no fallback source is configured: every fetch is empty.
pub struct NoFallback;

#[async_trait]
impl FallbackSource for NoFallback {
    async fn fetch_catalog(&self) -> Result<Vec<ContentItem>> {
        Ok(Vec::new())
    }
}

/// Accepts `[item, ...]` or `{ "<anything>": item, ... }`. Entries that do
/// not deserialize as items (no string `id`) are dropped.
pub(crate) fn parse_catalog(body: Value) -> Result<Vec<ContentItem>> {
    let values: Vec<Value> = match body {
        Value::Array(items) => items,
        Value::Object(map) => map.into_values().collect(),
        other => {
            return Err(StoreError::TransientFetch(format!(
                "fallback source returned non-collection JSON ({})",
                type_name(&other)
            )))
        }
    };

    Ok(values
        .into_iter()
        .filter_map(|v| serde_json::from_value::<ContentItem>(v).ok())
        .collect())
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
