//! Compiling the definition a [`Loader`] points at.

use super::{Formulary, LoadOrigin};
use crate::bottle::{self, BottleNames};
use crate::cache::{Compiled, PackageKind};
use crate::error::{BruError, Result};
use crate::formula::{Formula, FormulaClass, Origin, ResolvedSource, SpecKind, from_api, source};
use crate::tap::Tap;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// How a selected definition gets compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderKind {
    /// Definition stored inside a bottle; `url` is set when it has to be downloaded.
    Bottle { url: Option<String> },
    /// Formula file at a URL, copied or downloaded into the cache first.
    FromUrl { url: String },
    /// Named through a tap; failures are reported against the tap.
    Tap,
    /// An explicit path given by the caller.
    FromPath,
    /// A definition file found by name.
    Formula,
    Alias,
    /// A record from the formula API index.
    Api,
    /// The definition copy kept inside an installed keg.
    Keg,
    /// A previously downloaded formula file.
    Cached,
    /// Source text handed over by the caller.
    Contents { contents: String },
    /// Nothing matched.
    Null,
}

/// A resolved reference, ready to be compiled into a [`Formula`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loader {
    pub name: String,
    pub path: PathBuf,
    pub alias_path: Option<PathBuf>,
    pub tap: Option<Tap>,
    pub source: ResolvedSource,
    pub kind: LoaderKind,
}

impl Loader {
    pub fn new(name: impl Into<String>, path: PathBuf, source: ResolvedSource, kind: LoaderKind) -> Self {
        Self {
            name: name.into(),
            path,
            alias_path: None,
            tap: None,
            source,
            kind,
        }
    }

    pub fn in_tap(mut self, tap: impl Into<Option<Tap>>) -> Self {
        self.tap = tap.into();
        self
    }

    pub fn with_alias_path(mut self, alias_path: impl Into<Option<PathBuf>>) -> Self {
        self.alias_path = alias_path.into();
        self
    }

    pub fn null(name: &str) -> Self {
        Self::new(name, PathBuf::new(), ResolvedSource::NotFound, LoaderKind::Null)
    }

    pub(crate) fn contents(name: &str, path: &Path, contents: &str) -> Self {
        Self::new(
            name,
            path.to_path_buf(),
            ResolvedSource::LocalPath(path.to_path_buf()),
            LoaderKind::Contents {
                contents: contents.to_string(),
            },
        )
    }
}

fn github_commit_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| {
            Regex::new(
                r"githubusercontent\.com/[\w-]+/[\w-]+/[a-f0-9]{40}(?:/Formula)?/(?P<name>[\w+\-.@]+)\.rb",
            )
            .ok()
        })
        .as_ref()
}

impl Formulary {
    /// Compile what `loader` points at into an instance.
    pub async fn load(
        &self,
        loader: &Loader,
        spec: SpecKind,
        alias_path: Option<&Path>,
        from: Option<LoadOrigin>,
    ) -> Result<Formula> {
        tracing::debug!("loading {} from {}", loader.name, loader.source);

        let mut origin = Origin {
            name: loader.name.clone(),
            path: loader.path.clone(),
            tap: loader.tap.clone(),
            alias_path: alias_path
                .map(Path::to_path_buf)
                .or_else(|| loader.alias_path.clone()),
            source: loader.source.clone(),
        };
        let mut local_bottle_path = None;

        let class = match &loader.kind {
            LoaderKind::Null => return Err(BruError::FormulaUnavailable(loader.name.clone())),
            LoaderKind::Api => self.api_class(&loader.name).await?,
            LoaderKind::Tap => {
                let tap = loader.tap.as_ref().map(Tap::name).unwrap_or_default();
                self.path_class(&loader.name, &loader.path)
                    .await
                    .map_err(|e| e.into_tap_qualified(&tap))?
            }
            LoaderKind::FromUrl { url } => {
                self.fetch_formula_file(loader, url, from).await?;
                self.path_class(&loader.name, &loader.path).await?
            }
            LoaderKind::Bottle { url } => {
                let bottle = &loader.path;
                if let Some(url) = url
                    && !bottle.is_file()
                {
                    if let Some(parent) = bottle.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    tracing::info!("Downloading {}", url);
                    self.api.client().download(url, bottle, None).await?;
                }

                let names = bottle::resolve_formula_names(bottle)?;
                let definition = self.path(&names.full_name).await?;
                origin.name = names.name.clone();
                origin.tap = Tap::from_path(&self.config().taps_dir(), &definition);
                origin.path = definition.clone();
                local_bottle_path = Some(bottle.clone());
                self.bottle_class(bottle, &names, &definition).await?
            }
            LoaderKind::Contents { contents } => {
                Arc::new(self.compile_source(&loader.name, &loader.path, contents)?)
            }
            LoaderKind::FromPath
            | LoaderKind::Formula
            | LoaderKind::Alias
            | LoaderKind::Keg
            | LoaderKind::Cached => self.path_class(&loader.name, &loader.path).await?,
        };

        let mut formula = Formula::new(class, origin, spec)?;
        formula.local_bottle_path = local_bottle_path;
        Ok(formula)
    }

    /// Compiled class for the definition file at `path`, shared per path.
    pub(crate) async fn path_class(&self, name: &str, path: &Path) -> Result<Arc<FormulaClass>> {
        let cache = self.api.cache();
        if let Some(Compiled::Formula(class)) = cache.by_path(path, self.platform).await {
            return Ok(class);
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BruError::FormulaUnavailable(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let class = Arc::new(self.compile_source(name, path, &contents)?);
        cache
            .put_path(path, self.platform, Compiled::Formula(Arc::clone(&class)))
            .await;
        Ok(class)
    }

    /// Compiled class for an API record, shared per name.
    pub(crate) async fn api_class(&self, name: &str) -> Result<Arc<FormulaClass>> {
        let cache = self.api.cache();
        if let Some(Compiled::Formula(class)) =
            cache.by_api(PackageKind::Formula, name, self.platform).await
        {
            return Ok(class);
        }

        let record = self
            .api
            .formula_record(name)
            .await?
            .ok_or_else(|| BruError::FormulaUnavailable(name.to_string()))?;
        let class = Arc::new(from_api::build(name, &record, &self.build_context())?);
        cache
            .put_api(
                PackageKind::Formula,
                name,
                self.platform,
                Compiled::Formula(Arc::clone(&class)),
            )
            .await;
        Ok(class)
    }

    fn compile_source(&self, name: &str, path: &Path, contents: &str) -> Result<FormulaClass> {
        if self.config().disable_load_formula {
            return Err(BruError::LoadingDisabled);
        }
        tracing::debug!("compiling {}", path.display());
        source::compile(name, path, contents, &self.build_context())
    }

    /// Class from the definition inside `bottle`, or from `definition` when the
    /// bottle's copy is missing or broken.
    async fn bottle_class(
        &self,
        bottle: &Path,
        names: &BottleNames,
        definition: &Path,
    ) -> Result<Arc<FormulaClass>> {
        let cache = self.api.cache();
        if let Some(Compiled::Formula(class)) = cache.by_path(bottle, self.platform).await {
            return Ok(class);
        }

        let compiled = bottle::formula_contents(bottle, names)
            .and_then(|contents| self.compile_source(&names.name, bottle, &contents));
        match compiled {
            Ok(class) => {
                let class = Arc::new(class);
                cache
                    .put_path(bottle, self.platform, Compiled::Formula(Arc::clone(&class)))
                    .await;
                Ok(class)
            }
            Err(e @ BruError::BottleFormulaUnavailable(_)) => {
                tracing::warn!("{}\nFalling back to non-bottle formula.", e);
                self.path_class(&names.name, definition).await
            }
            Err(e) if e.is_unreadable() => {
                tracing::warn!("Unreadable formula in {}:\n{}", bottle.display(), e);
                self.path_class(&names.name, definition).await
            }
            Err(e) => Err(e),
        }
    }

    /// Put the formula file behind `url` at `loader.path`.
    async fn fetch_formula_file(
        &self,
        loader: &Loader,
        url: &str,
        from: Option<LoadOrigin>,
    ) -> Result<()> {
        if let Some(parent) = loader.path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Ok(parsed) = url::Url::parse(url)
            && parsed.scheme() == "file"
        {
            let local = parsed
                .to_file_path()
                .map_err(|_| BruError::FormulaUnavailable(loader.name.clone()))?;
            if !local.is_file() {
                return Err(BruError::FormulaUnavailable(loader.name.clone()));
            }
            fs::copy(&local, &loader.path)?;
            return Ok(());
        }

        if from != Some(LoadOrigin::FormulaInstaller) {
            if let Some(name) = github_commit_regex()
                .and_then(|re| re.captures(url))
                .and_then(|captures| captures.name("name"))
            {
                let name = name.as_str();
                return Err(BruError::UnsupportedInstallationMethod(format!(
                    "Installation of {} from a GitHub commit URL is unsupported! `brew extract {}` to a stable tap on GitHub instead.",
                    name, name
                )));
            }
            return Err(BruError::UnsupportedInstallationMethod(format!(
                "Non-checksummed download of {} formula file from an arbitrary URL is unsupported! Use `brew extract` or `brew create` and `brew tap-new` to create a formula file in a tap on GitHub instead.",
                loader.name
            )));
        }

        tracing::info!("Downloading {}", url);
        self.api.client().download(url, &loader.path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_commit_urls() {
        let re = github_commit_regex().unwrap();
        let url = "https://raw.githubusercontent.com/Homebrew/homebrew-core/0123456789abcdef0123456789abcdef01234567/Formula/wget.rb";
        let captures = re.captures(url).unwrap();
        assert_eq!(&captures["name"], "wget");

        let branch = "https://raw.githubusercontent.com/Homebrew/homebrew-core/master/Formula/wget.rb";
        assert!(re.captures(branch).is_none());
    }

    #[test]
    fn test_loader_builders() {
        let tap = Tap::fetch(Path::new("/taps"), "user", "repo");
        let loader = Loader::new(
            "foo",
            PathBuf::from("/taps/user/homebrew-repo/Formula/foo.rb"),
            ResolvedSource::TapQualified {
                tap: tap.name(),
                name: "foo".into(),
            },
            LoaderKind::Tap,
        )
        .in_tap(tap.clone())
        .with_alias_path(PathBuf::from("/taps/user/homebrew-repo/Aliases/bar"));

        assert_eq!(loader.tap, Some(tap));
        assert!(loader.alias_path.is_some());

        let null = Loader::null("nope");
        assert_eq!(null.kind, LoaderKind::Null);
        assert_eq!(null.source, ResolvedSource::NotFound);
    }
}
