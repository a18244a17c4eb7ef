//! Turning package references into [`Formula`] instances.
//!
//! A reference is whatever the user typed: a bare name, `user/repo/name`, a
//! path to a definition file, a URL, or a bottle file. [`Formulary::loader_for`]
//! picks a [`Loader`] for it by walking a fixed, first-match chain (see
//! `resolver.rs`); [`Formulary::load`] then compiles the definition the loader
//! points at, through the shared [`MetadataCache`](crate::cache::MetadataCache).
//!
//! [`Formulary::factory`] is the usual entry point and combines both. The rack
//! and keg helpers at the bottom answer questions about installed formulae.
//!
//! # Examples
//!
//! ```no_run
//! use brulary::api::Api;
//! use brulary::cache::MetadataCache;
//! use brulary::config::EnvConfig;
//! use brulary::fetch::HttpFetcher;
//! use brulary::formula::SpecKind;
//! use brulary::formulary::Formulary;
//! use brulary::platform::Platform;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let api = Api::new(
//!         Arc::new(HttpFetcher::new()?),
//!         Arc::new(EnvConfig::from_env()),
//!         Arc::new(MetadataCache::new()),
//!     )?;
//!     let formulary = Formulary::new(api, Platform::current());
//!     let wget = formulary.factory("wget", SpecKind::Stable, None, None).await?;
//!     println!("{} {}", wget.full_name, wget.version().unwrap_or("?"));
//!     Ok(())
//! }
//! ```

mod loader;
mod resolver;

pub use loader::{Loader, LoaderKind};
pub use resolver::MAX_RENAME_HOPS;
pub(crate) use resolver::{is_url, split_tap_reference};

use crate::api::Api;
use crate::cache::FactoryKey;
use crate::config::EnvConfig;
use crate::error::{BruError, Result};
use crate::formula::{BuildContext, Formula, SpecKind};
use crate::keg::{self, Keg, Tab};
use crate::platform::Platform;
use crate::tap::{self, Tap};
use std::fs;
use std::path::{Path, PathBuf};

/// Who is asking for a formula, when it matters to resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOrigin {
    /// Loading for an installed keg; rename warnings are suppressed.
    Keg,
    /// Loading for a rack with no usable keg.
    Rack,
    /// The installer itself, which may fetch formula files from URLs.
    FormulaInstaller,
}

impl LoadOrigin {
    /// Renames and migrations are reported unless the caller is looking at
    /// something already installed.
    pub(crate) fn warns(from: Option<LoadOrigin>) -> bool {
        !matches!(from, Some(LoadOrigin::Keg | LoadOrigin::Rack))
    }
}

pub struct Formulary {
    api: Api,
    platform: Platform,
    factory_cache: bool,
}

impl Formulary {
    pub fn new(api: Api, platform: Platform) -> Self {
        Self {
            api,
            platform,
            factory_cache: false,
        }
    }

    /// Reuse whole instances for identical factory requests.
    pub fn with_factory_cache(mut self) -> Self {
        self.factory_cache = true;
        self
    }

    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn config(&self) -> &EnvConfig {
        self.api.config()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Evaluate definitions for another platform from now on.
    ///
    /// Compiled definitions bake platform blocks and variations in, so they are
    /// dropped when the platform actually changes. Endpoint data is kept.
    pub fn set_platform(&mut self, platform: Platform) {
        if platform != self.platform {
            tracing::debug!("switching platform {} -> {}", self.platform, platform);
            self.platform = platform;
            self.api.cache().clear_compiled();
        }
    }

    pub(crate) fn build_context(&self) -> BuildContext {
        let config = self.config();
        BuildContext {
            platform: self.platform,
            prefix: config.prefix.clone(),
            bottle_domain: config.bottle_domain.clone(),
        }
    }

    /// API-sourced resolution is allowed.
    pub(crate) fn api_enabled(&self) -> bool {
        !self.config().no_install_from_api
    }

    pub fn core_tap(&self) -> Tap {
        Tap::core(&self.config().taps_dir())
    }

    /// Where the core tap keeps (or would keep) the definition for `name`.
    pub fn core_path(&self, name: &str) -> PathBuf {
        self.core_tap()
            .find_formula(self.api.cache(), &name.to_lowercase())
    }

    pub fn core_alias_path(&self, name: &str) -> PathBuf {
        self.core_tap().alias_dir().join(name.to_lowercase())
    }

    /// Definitions or aliases for `name` in every installed non-core tap.
    pub fn tap_paths(&self, name: &str) -> Result<Vec<(Tap, PathBuf)>> {
        let name = name.to_lowercase();
        let mut found = Vec::new();
        for tap in tap::list_taps(&self.config().taps_dir())? {
            if tap.is_core() {
                continue;
            }
            let definition = tap.find_formula(self.api.cache(), &name);
            if definition.is_file() {
                found.push((tap, definition));
                continue;
            }
            let alias = tap.alias_dir().join(&name);
            if alias.is_file() {
                found.push((tap, alias));
            }
        }
        Ok(found)
    }

    /// Resolve `reference` and compile it.
    pub async fn factory(
        &self,
        reference: &str,
        spec: SpecKind,
        alias_path: Option<&Path>,
        from: Option<LoadOrigin>,
    ) -> Result<Formula> {
        let key = FactoryKey {
            reference: reference.to_string(),
            spec,
            alias_path: alias_path.map(Path::to_path_buf),
            from,
        };
        if self.factory_cache
            && let Some(formula) = self.api.cache().factory(&key).await
        {
            return Ok(formula);
        }

        let loader = self.loader_for(reference, from).await?;
        let formula = self.load(&loader, spec, alias_path, from).await?;

        if self.factory_cache {
            self.api.cache().put_factory(key, formula.clone()).await;
        }
        Ok(formula)
    }

    /// Load a formula from a definition already in memory.
    pub async fn from_contents(
        &self,
        name: &str,
        path: &Path,
        contents: &str,
        spec: SpecKind,
    ) -> Result<Formula> {
        let loader = Loader::contents(name, path, contents);
        self.load(&loader, spec, None, None).await
    }

    /// Formula for an installed rack: its preferred keg, else the rack's name.
    pub async fn from_rack(
        &self,
        rack: &Path,
        spec: Option<SpecKind>,
        alias_path: Option<&Path>,
    ) -> Result<Formula> {
        match keg::preferred_keg(rack, &self.config().prefix) {
            Some(keg) => self.from_keg(&keg, spec, alias_path).await,
            None => {
                self.factory(
                    &file_name(rack),
                    spec.unwrap_or_default(),
                    alias_path,
                    Some(LoadOrigin::Rack),
                )
                .await
            }
        }
    }

    /// Formula for an installed keg, preferring the tap its receipt names.
    pub async fn from_keg(
        &self,
        keg: &Keg,
        spec: Option<SpecKind>,
        alias_path: Option<&Path>,
    ) -> Result<Formula> {
        let tab = Tab::for_keg(keg);
        let spec = spec.unwrap_or_else(|| tab.spec());
        let name = keg.name();
        let from = Some(LoadOrigin::Keg);

        let mut formula = match tab.tap() {
            Some(tap) => {
                let qualified = format!("{}/{}", tap, name);
                match self.factory(&qualified, spec, alias_path, from).await {
                    Ok(formula) => formula,
                    Err(e) if e.is_unavailable() => {
                        tracing::debug!("{} unavailable, trying {}", qualified, name);
                        self.factory(&name, spec, alias_path, from).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            None => self.factory(&name, spec, alias_path, from).await?,
        };

        formula.build = Some(tab);
        Ok(formula)
    }

    /// The rack a reference installs into.
    pub async fn to_rack(&self, reference: &str) -> Result<PathBuf> {
        // Fails early for a tap-qualified reference nothing can load.
        if reference.contains('/') {
            self.factory(reference, SpecKind::Stable, None, None).await?;
        }

        let cellar = &self.config().cellar;
        let base = file_name(Path::new(reference));
        let base = base.strip_suffix(".rb").unwrap_or(&base);
        let rack = cellar.join(base);
        if rack.is_dir() {
            return Ok(resolved(rack));
        }

        let name = self.canonical_name(reference).await?;
        Ok(resolved(cellar.join(name)))
    }

    /// The name `reference` resolves to, without compiling anything.
    pub async fn canonical_name(&self, reference: &str) -> Result<String> {
        match self.loader_for(reference, None).await {
            Ok(loader) => Ok(loader.name),
            Err(BruError::TapFormulaAmbiguity { .. }) => Ok(reference.to_lowercase()),
            Err(e) => Err(e),
        }
    }

    /// Definition file `reference` resolves to.
    pub async fn path(&self, reference: &str) -> Result<PathBuf> {
        Ok(self.loader_for(reference, None).await?.path)
    }

    /// Whether the formula installed in `rack` is keg-only. A rack whose
    /// formula cannot be identified is not.
    pub async fn keg_only(&self, rack: &Path) -> Result<bool> {
        match self.from_rack(rack, None, None).await {
            Ok(formula) => Ok(formula.is_keg_only()),
            Err(e) if e.is_unavailable() || e.is_ambiguity() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Formula for `name` as it is installed, if it is.
    ///
    /// Installed instances carry the keg's receipt and the spec it was built
    /// from, and never follow an installed alias.
    pub async fn resolve(&self, name: &str, spec: Option<SpecKind>) -> Result<Formula> {
        let mut formula = if name.contains('/') || Path::new(name).exists() {
            let mut formula = self
                .factory(name, spec.unwrap_or_default(), None, None)
                .await?;
            let rack = formula.rack(&self.config().cellar);
            if let Some(keg) = keg::preferred_keg(&rack, &self.config().prefix) {
                let tab = Tab::for_keg(&keg);
                let installed_spec = spec.unwrap_or_else(|| tab.spec());
                if let Err(e) = formula.set_active_spec(installed_spec) {
                    tracing::debug!("keeping {} spec: {}", formula.active_spec, e);
                }
                formula.build = Some(tab);
            }
            formula
        } else {
            let rack = self.to_rack(name).await?;
            let alias_path = self
                .factory(name, spec.unwrap_or_default(), None, None)
                .await
                .ok()
                .and_then(|formula| formula.alias_path);
            self.from_rack(&rack, spec, alias_path.as_deref()).await?
        };

        formula.follow_installed_alias = false;
        Ok(formula)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn resolved(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_warnings_skip_installed_origins() {
        assert!(LoadOrigin::warns(None));
        assert!(LoadOrigin::warns(Some(LoadOrigin::FormulaInstaller)));
        assert!(!LoadOrigin::warns(Some(LoadOrigin::Keg)));
        assert!(!LoadOrigin::warns(Some(LoadOrigin::Rack)));
    }

    #[test]
    fn test_file_name_of_rack() {
        assert_eq!(file_name(Path::new("/opt/homebrew/Cellar/foo")), "foo");
        assert_eq!(file_name(Path::new("/")), "");
    }
}
