//! Placeholder substitution in request headers.
//!
//! Placeholders are `e2b_` followed by a lowercase UUID v4. Each match is
//! resolved independently; a failed resolution leaves that occurrence
//! untouched and never blocks the rest of the request. Substitution is
//! single-pass: resolved values are not re-scanned for placeholders.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::proxy::secrets::SecretsCache;
use crate::store::StoreError;

/// Literal prefix in front of the secret id.
pub const SECRET_PREFIX: &str = "e2b_";

/// Canonical lowercase UUID v4, captured without the prefix.
const UUID_PATTERN: &str = r"([0-9a-f]{8}-(?:[0-9a-f]{4}-){3}[0-9a-f]{12})";

/// Why a single placeholder could not be substituted.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("metadata: {0}")]
    BadMetadata(String),

    #[error("host {host} does not match any allowed pattern")]
    HostNotAllowed { host: String },
}

/// Maps a secret id to its replacement value, or explains why it cannot.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<String, ResolveError>;
}

pub struct HeaderRewriter {
    pattern: Regex,
}

impl HeaderRewriter {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(&format!("{SECRET_PREFIX}{UUID_PATTERN}"))
                .expect("placeholder pattern is valid"),
        }
    }

    /// Substitute every resolvable placeholder in `headers`, in place.
    /// Header order is preserved; values without placeholders are untouched.
    pub async fn rewrite(&self, headers: &mut [(String, String)], resolver: &dyn SecretResolver) {
        for (_, value) in headers.iter_mut() {
            // (range of the full match, secret id)
            let matches: Vec<(std::ops::Range<usize>, String)> = self
                .pattern
                .captures_iter(value)
                .map(|cap| {
                    let full = cap.get(0).map(|m| m.range()).unwrap_or_default();
                    let id = cap.get(1).map(|m| m.as_str().to_owned()).unwrap_or_default();
                    (full, id)
                })
                .collect();
            if matches.is_empty() {
                continue;
            }

            let mut rewritten = String::with_capacity(value.len());
            let mut tail = 0;
            for (range, id) in matches {
                rewritten.push_str(&value[tail..range.start]);
                match resolver.resolve(&id).await {
                    Ok(replacement) => rewritten.push_str(&replacement),
                    Err(err) => {
                        debug!(id = %id, error = %err, "placeholder left unresolved");
                        rewritten.push_str(&value[range.clone()]);
                    }
                }
                tail = range.end;
            }
            rewritten.push_str(&value[tail..]);
            *value = rewritten;
        }
    }
}

impl Default for HeaderRewriter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Allowlist-enforcing resolver ────────────────────────────────────

/// The resolver the engine hands the rewriter: look the secret up in the
/// cache, decode the host allowlist from its metadata, and release the value
/// only when the request host matches a pattern (first match wins).
pub struct AllowlistResolver<'a> {
    pub secrets: &'a SecretsCache,
    pub tenant: &'a str,
    /// Request host, without port.
    pub host: &'a str,
}

#[async_trait]
impl SecretResolver for AllowlistResolver<'_> {
    async fn resolve(&self, id: &str) -> Result<String, ResolveError> {
        let record = self.secrets.get_secret(self.tenant, id).await?;

        let patterns = extract_hosts(&record.metadata)?;
        for pattern in &patterns {
            let pattern = pattern.trim();
            if let Ok(glob) = glob::Pattern::new(pattern) {
                if glob.matches(self.host) {
                    return Ok(record.value);
                }
            }
        }

        Err(ResolveError::HostNotAllowed {
            host: self.host.to_owned(),
        })
    }
}

/// Decode the allowlist from `metadata.custom_metadata.hosts`, a
/// JSON-encoded string array.
fn extract_hosts(metadata: &serde_json::Value) -> Result<Vec<String>, ResolveError> {
    let hosts_json = metadata
        .get("custom_metadata")
        .and_then(|cm| cm.get("hosts"))
        .and_then(|h| h.as_str())
        .ok_or_else(|| ResolveError::BadMetadata("missing custom_metadata.hosts".into()))?;

    serde_json::from_str(hosts_json)
        .map_err(|e| ResolveError::BadMetadata(format!("hosts is not a json array: {e}")))
}
