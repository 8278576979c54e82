//! Secret store client.
//!
//! The proxy reads and writes opaque secrets with attached metadata under
//! flat string paths (`<tenant>/<secret-id>`, `<tenant>/cert`,
//! `<tenant>/key`). Production backend is HashiCorp Vault KV v2 over HTTP;
//! an in-memory implementation backs tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ProxyError;

/// Errors from the backing store. `NotFound` is distinct because the
/// certificate cache creates on miss while any other failure must surface.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend: {0}")]
    Backend(String),
}

/// A stored secret: opaque value plus the backend's metadata bag. Host
/// allowlists travel as a JSON-encoded string array under
/// `metadata.custom_metadata.hosts`.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub value: String,
    pub metadata: Value,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<SecretRecord, StoreError>;

    async fn put(&self, path: &str, value: &str, metadata: Option<Value>)
        -> Result<(), StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}

// ── Vault KV v2 backend ─────────────────────────────────────────────

/// HashiCorp Vault KV v2 client. Secrets live at
/// `<addr>/v1/<mount>/data/<path>` with the value under the `value` key;
/// custom metadata is managed through the `metadata` endpoint and comes back
/// inline on reads.
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    mount: String,
    token: String,
}

#[derive(Deserialize)]
struct VaultReadResponse {
    data: VaultReadData,
}

#[derive(Deserialize)]
struct VaultReadData {
    data: HashMap<String, Value>,
    #[serde(default)]
    metadata: Value,
}

impl VaultClient {
    pub fn new(addr: impl Into<String>, mount: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.into(),
            mount: mount.into(),
            token: token.into(),
        }
    }

    /// Build a client from `VAULT_ADDR` / `VAULT_TOKEN` / `VAULT_MOUNT`
    /// (mount defaults to `secret`). Missing address or token is a
    /// construction failure.
    pub fn from_env() -> Result<Self, ProxyError> {
        let addr = std::env::var("VAULT_ADDR")
            .map_err(|_| ProxyError::Config("VAULT_ADDR is not set".into()))?;
        let token = std::env::var("VAULT_TOKEN")
            .map_err(|_| ProxyError::Config("VAULT_TOKEN is not set".into()))?;
        let mount = std::env::var("VAULT_MOUNT").unwrap_or_else(|_| "secret".to_string());
        Ok(Self::new(addr, mount, token))
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/v1/{}/data/{}", self.addr.trim_end_matches('/'), self.mount, path)
    }

    fn metadata_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}",
            self.addr.trim_end_matches('/'),
            self.mount,
            path
        )
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn get(&self, path: &str) -> Result<SecretRecord, StoreError> {
        let resp = self
            .http
            .get(self.data_url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(StoreError::Backend(format!(
                "vault read {path}: status {}",
                resp.status()
            )));
        }

        let body: VaultReadResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("vault read {path}: {e}")))?;

        let value = match body.data.data.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(StoreError::Backend(format!("vault read {path}: no value key"))),
        };

        Ok(SecretRecord {
            value,
            metadata: body.data.metadata,
        })
    }

    async fn put(&self, path: &str, value: &str, metadata: Option<Value>)
        -> Result<(), StoreError> {
        let resp = self
            .http
            .post(self.data_url(path))
            .header("X-Vault-Token", &self.token)
            .json(&json!({ "data": { "value": value } }))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StoreError::Backend(format!(
                "vault write {path}: status {}",
                resp.status()
            )));
        }

        // Custom metadata (the host allowlist) lives on the metadata endpoint.
        if let Some(meta) = metadata {
            if let Some(custom) = meta.get("custom_metadata") {
                let resp = self
                    .http
                    .post(self.metadata_url(path))
                    .header("X-Vault-Token", &self.token)
                    .json(&json!({ "custom_metadata": custom }))
                    .send()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(StoreError::Backend(format!(
                        "vault metadata write {path}: status {}",
                        resp.status()
                    )));
                }
            }
        }

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let resp = self
            .http
            .delete(self.metadata_url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(StoreError::Backend(format!(
                "vault delete {path}: status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

// ── In-memory backend ───────────────────────────────────────────────

/// In-memory store backing the test suites. Counts reads and can be
/// switched into a failing mode to exercise error paths.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    entries: dashmap::DashMap<String, SecretRecord>,
    get_calls: std::sync::atomic::AtomicUsize,
    fail_reads: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls that reached this store (including misses).
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// When set, every read fails with a backend error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }
}

#[cfg(test)]
#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<SecretRecord, StoreError> {
        use std::sync::atomic::Ordering;

        self.get_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Backend("simulated read failure".into()));
        }
        self.entries
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, value: &str, metadata: Option<Value>)
        -> Result<(), StoreError> {
        self.entries.insert(
            path.to_string(),
            SecretRecord {
                value: value.to_string(),
                metadata: metadata.unwrap_or(Value::Null),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.entries
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}

/// Metadata bag carrying a host allowlist, in the shape the proxy reads it
/// back: `custom_metadata.hosts` is a JSON-encoded string array.
#[cfg(test)]
pub fn hosts_metadata(patterns: &[&str]) -> Value {
    json!({
        "custom_metadata": {
            "hosts": serde_json::to_string(patterns).unwrap_or_else(|_| "[]".into()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store
            .put("team/abc", "hunter2", Some(hosts_metadata(&["*"])))
            .await
            .unwrap();

        let rec = store.get("team/abc").await.unwrap();
        assert_eq!(rec.value, "hunter2");
        assert_eq!(
            rec.metadata["custom_metadata"]["hosts"].as_str(),
            Some(r#"["*"]"#)
        );

        store.delete("team/abc").await.unwrap();
        assert!(matches!(
            store.get("team/abc").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_counts_reads_and_fails_on_demand() {
        let store = MemoryStore::new();
        store.put("k", "v", None).await.unwrap();

        let _ = store.get("k").await;
        let _ = store.get("missing").await;
        assert_eq!(store.get_calls(), 2);

        store.set_fail_reads(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn memory_store_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.delete("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn vault_urls() {
        let client = VaultClient::new("http://127.0.0.1:8200/", "kv", "tok");
        assert_eq!(
            client.data_url("team/cert"),
            "http://127.0.0.1:8200/v1/kv/data/team/cert"
        );
        assert_eq!(
            client.metadata_url("team/cert"),
            "http://127.0.0.1:8200/v1/kv/metadata/team/cert"
        );
    }

    #[test]
    fn hosts_metadata_encodes_json_array() {
        let meta = hosts_metadata(&["*.example.com", "api.test"]);
        let hosts: Vec<String> = serde_json::from_str(
            meta["custom_metadata"]["hosts"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(hosts, vec!["*.example.com", "api.test"]);
    }
}
