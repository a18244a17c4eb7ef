//! Homebrew JSON API client with verification and caching.
//!
//! [`Api`] answers two questions for the rest of the crate: "give me the full
//! package index" and "give me the JSON for endpoint X". It owns the fetch
//! client, the configuration and a handle on the shared [`MetadataCache`].
//!
//! # Fetch paths
//!
//! - [`Api::fetch`]: memoized in-memory fetch. Tries the configured domain, then
//!   the default domain exactly once if they differ.
//! - [`Api::fetch_json_api_file`]: disk-persisted fetch with mtime freshness,
//!   conditional download, default-domain fallback, bounded retry on corrupt
//!   content, and signature verification for `*.jws.json` endpoints.
//!
//! # Examples
//!
//! ```no_run
//! use brulary::api::Api;
//! use brulary::cache::MetadataCache;
//! use brulary::config::EnvConfig;
//! use brulary::fetch::HttpFetcher;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let api = Api::new(
//!         Arc::new(HttpFetcher::new()?),
//!         Arc::new(EnvConfig::from_env()),
//!         Arc::new(MetadataCache::new()),
//!     )?;
//!     let index = api.formula_index().await?;
//!     println!("{} formulae", index.len());
//!     Ok(())
//! }
//! ```

pub mod cask;
pub mod formula;
pub mod jws;

use crate::cache::{CachedValue, MetadataCache, PackageKind};
use crate::config::{DEFAULT_API_DOMAIN, EnvConfig};
use crate::error::{BruError, Result};
use crate::fetch::FetchClient;
use crate::platform::Platform;
use jws::TrustedKey;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Suffix marking an endpoint whose content is a signed envelope.
pub const SIGNED_ENDPOINT_SUFFIX: &str = ".jws.json";

/// Name-indexed view of a downloaded API file.
#[derive(Debug, Clone, Default)]
pub struct ApiIndex {
    /// Record per package name (formula) or token (cask).
    pub records: HashMap<String, Value>,
    /// Alias name to canonical name. Empty for casks.
    pub aliases: HashMap<String, String>,
    /// Whether this process downloaded the file rather than reusing the disk copy.
    pub freshly_downloaded: bool,
}

impl ApiIndex {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn record(&self, name: &str) -> Option<&Value> {
        self.records.get(name)
    }

    pub fn alias_target(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    /// Sorted names, as written to the names file.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Clone)]
pub struct Api {
    client: Arc<dyn FetchClient>,
    config: Arc<EnvConfig>,
    cache: Arc<MetadataCache>,
    trusted_key: TrustedKey,
}

impl Api {
    /// Client trusting the key embedded at build time.
    pub fn new(
        client: Arc<dyn FetchClient>,
        config: Arc<EnvConfig>,
        cache: Arc<MetadataCache>,
    ) -> Result<Self> {
        let trusted_key = TrustedKey::embedded().map_err(|source| BruError::Integrity {
            url: "embedded public key".to_string(),
            source,
        })?;
        Ok(Self::with_trusted_key(client, config, cache, trusted_key))
    }

    pub fn with_trusted_key(
        client: Arc<dyn FetchClient>,
        config: Arc<EnvConfig>,
        cache: Arc<MetadataCache>,
        trusted_key: TrustedKey,
    ) -> Self {
        Self {
            client,
            config,
            cache,
            trusted_key,
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn client(&self) -> &Arc<dyn FetchClient> {
        &self.client
    }

    /// Fetch and parse `endpoint`, memoized for the life of the cache.
    pub async fn fetch(&self, endpoint: &str) -> Result<Arc<Value>> {
        if let Some(CachedValue::Json(json)) = self.cache.endpoint(endpoint).await {
            return Ok(json);
        }

        let mut api_url = format!("{}/{}", self.config.api_domain, endpoint);
        let mut output = self.client.get(&api_url, None).await;
        if !output.success && self.config.api_domain != DEFAULT_API_DOMAIN {
            api_url = format!("{}/{}", DEFAULT_API_DOMAIN, endpoint);
            output = self.client.get(&api_url, None).await;
        }
        if !output.success {
            return Err(BruError::NoFileFound(api_url));
        }

        let json: Value =
            serde_json::from_slice(&output.body).map_err(|_| BruError::InvalidJson(api_url))?;
        let json = Arc::new(json);
        self.cache
            .put_endpoint(endpoint, CachedValue::Json(Arc::clone(&json)))
            .await;
        Ok(json)
    }

    /// Fetch `endpoint` into `target` and parse it.
    ///
    /// Returns the (verified, for signed endpoints) JSON and whether the file was
    /// downloaded during this call.
    pub async fn fetch_json_api_file(&self, endpoint: &str, target: &Path) -> Result<(Value, bool)> {
        let default_url = format!("{}/{}", DEFAULT_API_DOMAIN, endpoint);
        let mut url = format!("{}/{}", self.config.api_domain, endpoint);
        let as_root = self.config.running_as_root_but_not_owned_by_root;

        if as_root && !is_non_empty_file(target) {
            return Err(BruError::DownloadAsRootRefused(url));
        }

        let mut skip_download = is_non_empty_file(target)
            && (!self.config.auto_update_command
                || self.config.no_auto_update
                || self.is_fresh(target));
        skip_download |= as_root;

        let mut retry_count: u32 = 0;
        let json = loop {
            if !skip_download {
                let since = if is_non_empty_file(target) {
                    modified_time(target)
                } else {
                    None
                };

                tracing::info!("Downloading {}", url);
                if let Err(err) = self.client.download(&url, target, since).await {
                    if url == default_url {
                        if !is_non_empty_file(target) {
                            return Err(err);
                        }
                    } else if retry_count == 0 || !is_non_empty_file(target) {
                        tracing::debug!("{} failed ({}), trying {}", url, err, default_url);
                        url = default_url.clone();
                        if target.exists() && !is_non_empty_file(target) {
                            std::fs::remove_file(target)?;
                        }
                        continue;
                    }

                    tracing::warn!(
                        "{}: update failed, falling back to cached version.",
                        file_name(target)
                    );
                }

                touch(target)?;
            }

            let parsed = std::fs::read(target)
                .map_err(BruError::from)
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(BruError::from));
            match parsed {
                Ok(json) => break json,
                Err(err) => {
                    tracing::debug!("{} is corrupt: {}", target.display(), err);
                    if target.exists() {
                        std::fs::remove_file(target)?;
                    }
                    retry_count += 1;
                    skip_download = false;
                    if retry_count > self.config.curl_retries {
                        return Err(BruError::CannotDownload(url));
                    }
                }
            }
        };

        if endpoint.ends_with(SIGNED_ENDPOINT_SUFFIX) {
            match jws::verify_and_parse(&json, &self.trusted_key) {
                Ok(data) => Ok((data, !skip_download)),
                Err(source) => {
                    if target.exists() {
                        std::fs::remove_file(target)?;
                    }
                    Err(BruError::Integrity { url, source })
                }
            }
        } else {
            Ok((json, !skip_download))
        }
    }

    fn is_fresh(&self, target: &Path) -> bool {
        let Some(modified) = modified_time(target) else {
            return false;
        };
        let horizon = SystemTime::now()
            .checked_sub(Duration::from_secs(self.config.api_auto_update_secs))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        horizon < modified
    }

    /// Fetch the source text of a cask at a given tap commit.
    ///
    /// The raw-content host occasionally 404s, so the API domain's copy is tried
    /// second.
    pub async fn fetch_cask_source(
        &self,
        name: &str,
        path: &str,
        git_head: &str,
        sha256: Option<&str>,
    ) -> Result<Arc<str>> {
        let raw_endpoint = format!("{}/{}", git_head, path);
        if let Some(CachedValue::Text(text)) = self.cache.endpoint(&raw_endpoint).await {
            return Ok(text);
        }

        let raw_source_url = format!(
            "https://raw.githubusercontent.com/Homebrew/homebrew-cask/{}",
            raw_endpoint
        );
        let api_source_url = format!("{}/cask-source/{}.rb", DEFAULT_API_DOMAIN, name);

        let mut url = raw_source_url.clone();
        let mut output = self.client.get(&url, None).await;
        if !output.is_present() {
            url = api_source_url.clone();
            output = self.client.get(&url, None).await;
            if !output.is_present() {
                return Err(BruError::NoFileFound(format!(
                    "either of:\n{}\n{}",
                    raw_source_url, api_source_url
                )));
            }
        }

        let actual = format!("{:x}", Sha256::digest(&output.body));
        if let Some(expected) = sha256
            && actual != expected
        {
            return Err(BruError::Sha256Mismatch {
                expected: expected.to_string(),
                actual,
                url,
            });
        }

        let source: Arc<str> = Arc::from(String::from_utf8_lossy(&output.body).as_ref());
        self.cache
            .put_endpoint(&raw_endpoint, CachedValue::Text(Arc::clone(&source)))
            .await;
        Ok(source)
    }

    /// Write `<kind>_names.txt` unless it exists, or when `regenerate` is set.
    ///
    /// Returns whether the file was written.
    pub fn write_names_file(&self, names: &[String], kind: PackageKind, regenerate: bool) -> Result<bool> {
        let names_path = self
            .config
            .api_cache_dir()
            .join(format!("{}_names.txt", kind.as_str()));
        if !names_path.exists() || regenerate {
            if let Some(parent) = names_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&names_path, names.join("\n"))?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Download (or reuse) `endpoint` and index its records by `key`.
    async fn load_index(&self, kind: PackageKind, endpoint: &str, key: &str) -> Result<Arc<ApiIndex>> {
        if let Some(index) = self.cache.index(kind).await {
            return Ok(index);
        }

        let target = self.config.api_cache_dir().join(endpoint);
        let (json, updated) = self.fetch_json_api_file(endpoint, &target).await?;
        let index = Arc::new(index_records(json, key, updated)?);

        self.write_names_file(&index.names(), kind, updated)?;
        self.cache.put_index(kind, Arc::clone(&index)).await;
        Ok(index)
    }
}

/// Convert an API payload array into a name-indexed [`ApiIndex`].
pub fn index_records(json: Value, key: &str, freshly_downloaded: bool) -> Result<ApiIndex> {
    let Value::Array(records) = json else {
        return Err(BruError::InvalidApiRecord {
            name: key.to_string(),
            reason: "expected an array of records".to_string(),
        });
    };

    let mut index = ApiIndex {
        freshly_downloaded,
        ..ApiIndex::default()
    };
    for record in records {
        let Value::Object(mut fields) = record else {
            continue;
        };
        let Some(Value::String(name)) = fields.remove(key) else {
            continue;
        };
        if let Some(Value::Array(aliases)) = fields.get("aliases") {
            for alias in aliases.iter().filter_map(Value::as_str) {
                index.aliases.insert(alias.to_string(), name.clone());
            }
        }
        index.records.insert(name, Value::Object(fields));
    }
    Ok(index)
}

/// Overlay the variation for `platform` onto `json` and strip `variations`.
pub fn merge_variations(json: &Value, platform: &Platform) -> Value {
    let Value::Object(fields) = json else {
        return json.clone();
    };

    let mut merged: Map<String, Value> = fields.clone();
    let variation = merged
        .remove("variations")
        .and_then(|mut variations| variations.get_mut(platform.bottle_tag()).map(Value::take));

    if let Some(Value::Object(overrides)) = variation {
        for (key, value) in overrides {
            merged.insert(key, value);
        }
    }

    Value::Object(merged)
}

fn is_non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn touch(path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, MacOsVersion, Os};
    use serde_json::json;

    fn linux() -> Platform {
        Platform::new(Os::Linux, Arch::X86_64)
    }

    #[test]
    fn test_merge_variations_overlay_wins() {
        let record = json!({"a": 1, "b": 2, "variations": {"x86_64_linux": {"b": 3}}});
        assert_eq!(merge_variations(&record, &linux()), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_merge_variations_unmatched_tag_strips_variations() {
        let record = json!({"a": 1, "b": 2, "variations": {"arm64_sonoma": {"b": 3}}});
        assert_eq!(merge_variations(&record, &linux()), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_merge_variations_is_shallow() {
        let record = json!({
            "urls": {"stable": {"url": "a"}, "head": {"url": "h"}},
            "variations": {"sonoma": {"urls": {"stable": {"url": "b"}}}}
        });
        let intel = Platform::new(Os::MacOs(MacOsVersion::Sonoma), Arch::X86_64);
        assert_eq!(
            merge_variations(&record, &intel),
            json!({"urls": {"stable": {"url": "b"}}})
        );
    }

    #[test]
    fn test_merge_variations_leaves_input_untouched() {
        let record = json!({"a": 1, "variations": {"x86_64_linux": {"a": 2}}});
        let _ = merge_variations(&record, &linux());
        assert!(record.get("variations").is_some());
    }

    #[test]
    fn test_index_records_collects_aliases() {
        let payload = json!([
            {"name": "foo", "aliases": ["foo-alias", "f"]},
            {"name": "bar"},
            {"desc": "no name, skipped"}
        ]);
        let index = index_records(payload, "name", true).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.alias_target("f"), Some("foo"));
        assert!(index.record("foo").unwrap().get("name").is_none());
        assert_eq!(index.names(), ["bar", "foo"]);
        assert!(index.freshly_downloaded);
    }

    #[test]
    fn test_index_records_rejects_non_array() {
        assert!(index_records(json!({"name": "foo"}), "name", false).is_err());
    }
}
