use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shared::domain::ThreadId;

/// Request/response collaborator for bulk loads: thread lists, history pages
/// and the polling fallback.
#[async_trait]
pub trait BulkFetcher: Send + Sync {
    async fn fetch(&self, path: &str, query: &[(String, String)]) -> Result<Value>;
}

pub struct MissingBulkFetcher;

#[async_trait]
impl BulkFetcher for MissingBulkFetcher {
    async fn fetch(&self, path: &str, _query: &[(String, String)]) -> Result<Value> {
        Err(anyhow!("bulk fetch unavailable for {path}: no endpoint configured"))
    }
}

pub struct HttpFetcher {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl BulkFetcher for HttpFetcher {
    async fn fetch(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.http.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let body: Value = request
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid json from {url}"))?;
        Ok(body)
    }
}

/// Pulls the item list out of a response that is either a bare array or an
/// envelope such as `{ "threads": [...] }` or `{ "data": [...] }`.
pub fn extract_items(body: Value, keys: &[&str]) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut object) => keys
            .iter()
            .chain(["items", "data"].iter())
            .find_map(|key| match object.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub async fn fetch_thread_summaries(fetcher: &dyn BulkFetcher) -> Result<Vec<Value>> {
    let body = fetcher.fetch("/threads", &[]).await?;
    Ok(extract_items(body, &["threads", "conversations"]))
}

/// The newest `limit` messages of a thread.
pub async fn fetch_thread_messages(
    fetcher: &dyn BulkFetcher,
    thread_id: &ThreadId,
    limit: u32,
) -> Result<Vec<Value>> {
    let query = [("limit".to_string(), limit.to_string())];
    let body = fetcher
        .fetch(&format!("/threads/{thread_id}/messages"), &query)
        .await?;
    Ok(extract_items(body, &["messages"]))
}

#[cfg(test)]
#[path = "tests/fetch_tests.rs"]
mod tests;
