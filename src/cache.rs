//! Process-wide metadata cache.
//!
//! One [`MetadataCache`] is created by the composition root and shared (behind an
//! `Arc`) by the API fetcher, the formulary, and the cask loader. It deduplicates
//! work within a single command run; it is not a performance LRU, so every
//! namespace is unbounded and entries only disappear through [`MetadataCache::clear`].
//!
//! Namespaces:
//! - **endpoint**: parsed JSON or raw text keyed by API endpoint
//! - **index**: the name-indexed view of a downloaded API file
//! - **path**: compiled definitions keyed by the source file they came from
//! - **api**: compiled definitions keyed by API name/token
//! - **factory**: formula instances keyed by the full factory request
//! - **tap files**: each tap's definition files by name, walked once per tap
//!
//! Compiled definitions can embed platform-dependent values. The path and api
//! namespaces are keyed by the platform they were compiled for, and switching
//! the simulated platform clears the path, api and factory namespaces
//! ([`MetadataCache::clear_compiled`]).

use crate::api::ApiIndex;
use crate::cask::Cask;
use crate::formula::{Formula, FormulaClass, SpecKind};
use crate::formulary::LoadOrigin;
use crate::platform::Platform;
use crate::tap::{FileIndex, Tap};
use moka::future::Cache;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which kind of package a key or index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    Formula,
    Cask,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageKind::Formula => "formula",
            PackageKind::Cask => "cask",
        }
    }
}

/// Raw endpoint content.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Json(Arc<Value>),
    Text(Arc<str>),
}

/// A compiled definition.
#[derive(Debug, Clone)]
pub enum Compiled {
    Formula(Arc<FormulaClass>),
    Cask(Arc<Cask>),
}

impl Compiled {
    pub fn as_formula(&self) -> Option<&Arc<FormulaClass>> {
        match self {
            Compiled::Formula(class) => Some(class),
            Compiled::Cask(_) => None,
        }
    }

    pub fn as_cask(&self) -> Option<&Arc<Cask>> {
        match self {
            Compiled::Cask(cask) => Some(cask),
            Compiled::Formula(_) => None,
        }
    }
}

/// Everything that distinguishes one factory request from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactoryKey {
    pub reference: String,
    pub spec: SpecKind,
    pub alias_path: Option<PathBuf>,
    pub from: Option<LoadOrigin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Endpoint,
    Index,
    Path,
    Api,
    Factory,
    TapFiles,
}

pub struct MetadataCache {
    endpoints: Cache<String, CachedValue>,
    indexes: Cache<PackageKind, Arc<ApiIndex>>,
    by_path: Cache<(PathBuf, Platform), Compiled>,
    by_api: Cache<(PackageKind, String, Platform), Compiled>,
    factory: Cache<FactoryKey, Formula>,
    tap_files: moka::sync::Cache<(PathBuf, PackageKind), Arc<FileIndex>>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCache {
    pub fn new() -> Self {
        Self {
            endpoints: Cache::builder().build(),
            indexes: Cache::builder().build(),
            by_path: Cache::builder().build(),
            by_api: Cache::builder().build(),
            factory: Cache::builder().build(),
            tap_files: moka::sync::Cache::builder().build(),
        }
    }

    pub async fn endpoint(&self, endpoint: &str) -> Option<CachedValue> {
        self.endpoints.get(endpoint).await
    }

    pub async fn put_endpoint(&self, endpoint: &str, value: CachedValue) {
        self.endpoints.insert(endpoint.to_string(), value).await;
    }

    pub async fn index(&self, kind: PackageKind) -> Option<Arc<ApiIndex>> {
        self.indexes.get(&kind).await
    }

    pub async fn put_index(&self, kind: PackageKind, index: Arc<ApiIndex>) {
        self.indexes.insert(kind, index).await;
    }

    pub async fn by_path(&self, path: &Path, platform: Platform) -> Option<Compiled> {
        self.by_path.get(&(path.to_path_buf(), platform)).await
    }

    pub async fn put_path(&self, path: &Path, platform: Platform, compiled: Compiled) {
        self.by_path
            .insert((path.to_path_buf(), platform), compiled)
            .await;
    }

    pub async fn by_api(
        &self,
        kind: PackageKind,
        name: &str,
        platform: Platform,
    ) -> Option<Compiled> {
        self.by_api.get(&(kind, name.to_string(), platform)).await
    }

    pub async fn put_api(
        &self,
        kind: PackageKind,
        name: &str,
        platform: Platform,
        compiled: Compiled,
    ) {
        self.by_api
            .insert((kind, name.to_string(), platform), compiled)
            .await;
    }

    pub async fn factory(&self, key: &FactoryKey) -> Option<Formula> {
        self.factory.get(key).await
    }

    pub async fn put_factory(&self, key: FactoryKey, formula: Formula) {
        self.factory.insert(key, formula).await;
    }

    /// The definition files of `kind` in `tap`, listed on first use.
    pub fn tap_files(&self, tap: &Tap, kind: PackageKind) -> Arc<FileIndex> {
        self.tap_files.get_with((tap.path.clone(), kind), || {
            tracing::debug!("listing {} files in {}", kind.as_str(), tap);
            Arc::new(match kind {
                PackageKind::Formula => tap.formula_files_by_name(),
                PackageKind::Cask => tap.cask_files_by_name(),
            })
        })
    }

    /// Drop one namespace, or all of them with `None`.
    pub fn clear(&self, namespace: Option<Namespace>) {
        match namespace {
            Some(Namespace::Endpoint) => self.endpoints.invalidate_all(),
            Some(Namespace::Index) => self.indexes.invalidate_all(),
            Some(Namespace::Path) => self.by_path.invalidate_all(),
            Some(Namespace::Api) => self.by_api.invalidate_all(),
            Some(Namespace::Factory) => self.factory.invalidate_all(),
            Some(Namespace::TapFiles) => self.tap_files.invalidate_all(),
            None => {
                self.endpoints.invalidate_all();
                self.indexes.invalidate_all();
                self.by_path.invalidate_all();
                self.by_api.invalidate_all();
                self.factory.invalidate_all();
                self.tap_files.invalidate_all();
            }
        }
    }

    /// Drop everything that was compiled under a particular platform context.
    pub fn clear_compiled(&self) {
        self.clear(Some(Namespace::Path));
        self.clear(Some(Namespace::Api));
        self.clear(Some(Namespace::Factory));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, MacOsVersion, Os};

    fn sonoma() -> Platform {
        Platform::new(Os::MacOs(MacOsVersion::Sonoma), Arch::Arm64)
    }

    #[tokio::test]
    async fn test_endpoint_overwrite_last_write_wins() {
        let cache = MetadataCache::new();
        cache
            .put_endpoint("formula.json", CachedValue::Text(Arc::from("one")))
            .await;
        cache
            .put_endpoint("formula.json", CachedValue::Text(Arc::from("two")))
            .await;

        match cache.endpoint("formula.json").await {
            Some(CachedValue::Text(text)) => assert_eq!(&*text, "two"),
            other => panic!("unexpected cache entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_single_namespace() {
        let cache = MetadataCache::new();
        cache
            .put_endpoint("cask.json", CachedValue::Text(Arc::from("{}")))
            .await;
        let class = Arc::new(FormulaClass::empty("Foo"));
        cache
            .put_api(PackageKind::Formula, "foo", sonoma(), Compiled::Formula(class))
            .await;

        cache.clear(Some(Namespace::Api));

        assert!(cache.by_api(PackageKind::Formula, "foo", sonoma()).await.is_none());
        assert!(cache.endpoint("cask.json").await.is_some());

        cache.clear(None);
        assert!(cache.endpoint("cask.json").await.is_none());
    }

    #[tokio::test]
    async fn test_api_namespace_is_keyed_by_kind() {
        let cache = MetadataCache::new();
        let class = Arc::new(FormulaClass::empty("Foo"));
        cache
            .put_api(PackageKind::Formula, "foo", sonoma(), Compiled::Formula(class))
            .await;

        assert!(cache.by_api(PackageKind::Cask, "foo", sonoma()).await.is_none());
        assert!(cache.by_api(PackageKind::Formula, "foo", sonoma()).await.is_some());
    }

    #[tokio::test]
    async fn test_shared_instance_is_returned() {
        let cache = MetadataCache::new();
        let class = Arc::new(FormulaClass::empty("Foo"));
        let path = PathBuf::from("/taps/homebrew/homebrew-core/Formula/foo.rb");
        cache
            .put_path(&path, sonoma(), Compiled::Formula(Arc::clone(&class)))
            .await;

        let cached = cache.by_path(&path, sonoma()).await.unwrap();
        assert!(Arc::ptr_eq(cached.as_formula().unwrap(), &class));
    }

    #[tokio::test]
    async fn test_compiled_entries_are_keyed_by_platform() {
        let cache = MetadataCache::new();
        let class = Arc::new(FormulaClass::empty("Foo"));
        let linux = Platform::new(Os::Linux, Arch::X86_64);
        cache
            .put_api(PackageKind::Formula, "foo", sonoma(), Compiled::Formula(Arc::clone(&class)))
            .await;
        let path = PathBuf::from("/taps/alice/homebrew-tools/Formula/foo.rb");
        cache
            .put_path(&path, sonoma(), Compiled::Formula(class))
            .await;

        assert!(cache.by_api(PackageKind::Formula, "foo", linux).await.is_none());
        assert!(cache.by_path(&path, linux).await.is_none());
        assert!(cache.by_path(&path, sonoma()).await.is_some());
    }
}
