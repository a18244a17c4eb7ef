//! Casks: compiled definitions, installed versions, and the cask loader chain.
//!
//! A cask is read either from the signed `cask.jws.json` index (with its
//! variation for the current platform merged in) or from a `cask "token" do`
//! block in a tap. Installed versions live under
//! `<Caskroom>/<token>/.metadata/<version>/<timestamp>/`.

use crate::api::{Api, merge_variations};
use crate::cache::{Compiled, PackageKind};
use crate::dsl::{Call, Document, Literal, StatementKind, active_statements};
use crate::error::{BruError, Result};
use crate::formula::ResolvedSource;
use crate::formulary::{is_url, split_tap_reference};
use crate::platform::Platform;
use crate::tap::{self, Tap};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const METADATA_DIR: &str = ".metadata";
const DOWNLOAD_SHA_FILE: &str = "LATEST_DOWNLOAD_SHA256";

/// Stanzas that install something, recorded verbatim as artifacts.
const ARTIFACT_STANZAS: [&str; 24] = [
    "app",
    "pkg",
    "binary",
    "suite",
    "artifact",
    "installer",
    "font",
    "manpage",
    "colorpicker",
    "dictionary",
    "input_method",
    "internet_plugin",
    "keyboard_layout",
    "mdimporter",
    "prefpane",
    "qlplugin",
    "screen_saver",
    "service",
    "audio_unit_plugin",
    "vst_plugin",
    "vst3_plugin",
    "stage_only",
    "uninstall",
    "zap",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Cask {
    pub token: String,
    /// Owning tap, e.g. `homebrew/cask`.
    pub tap: Option<String>,
    pub names: Vec<String>,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub url: Option<String>,
    /// `"latest"` for casks that are never versioned.
    pub version: Option<String>,
    /// `"no_check"` when the download is not checksummed.
    pub sha256: Option<String>,
    /// One `{stanza: [args...]}` object per artifact.
    pub artifacts: Vec<Value>,
    pub depends_on: Value,
    pub conflicts_with: Option<Value>,
    pub auto_updates: bool,
    pub caveats: Option<String>,
    pub loaded_from_api: bool,
    pub sourcefile_path: Option<PathBuf>,
    pub tap_git_head: Option<String>,
    pub ruby_source_path: Option<String>,
    pub ruby_source_checksum: Option<String>,
    /// `<Caskroom>/<token>`.
    pub caskroom_path: PathBuf,
    pub source: ResolvedSource,
}

/// Which kinds of cask count as outdated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutdatedOptions {
    pub greedy: bool,
    pub greedy_latest: bool,
    pub greedy_auto_updates: bool,
}

#[derive(Debug, Deserialize)]
struct CaskRecord {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    tap: Option<String>,
    #[serde(default)]
    name: Vec<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    artifacts: Vec<Value>,
    #[serde(default)]
    depends_on: Value,
    #[serde(default)]
    conflicts_with: Option<Value>,
    #[serde(default)]
    auto_updates: Option<bool>,
    #[serde(default)]
    caveats: Option<String>,
    #[serde(default)]
    tap_git_head: Option<String>,
    #[serde(default)]
    ruby_source_path: Option<String>,
    #[serde(default)]
    ruby_source_checksum: Option<Checksum>,
}

#[derive(Debug, Deserialize)]
struct Checksum {
    sha256: String,
}

impl Cask {
    fn empty(token: &str, caskroom: &Path, source: ResolvedSource) -> Self {
        Self {
            token: token.to_string(),
            tap: None,
            names: vec![],
            desc: None,
            homepage: None,
            url: None,
            version: None,
            sha256: None,
            artifacts: vec![],
            depends_on: Value::Object(Map::new()),
            conflicts_with: None,
            auto_updates: false,
            caveats: None,
            loaded_from_api: false,
            sourcefile_path: None,
            tap_git_head: None,
            ruby_source_path: None,
            ruby_source_checksum: None,
            caskroom_path: caskroom.join(token),
            source,
        }
    }

    /// Build from an index record, merged for `platform`.
    pub fn from_api(token: &str, record: &Value, platform: &Platform, caskroom: &Path) -> Result<Self> {
        let merged = merge_variations(record, platform);
        let record: CaskRecord = serde_json::from_value(merged).map_err(|e| BruError::CaskUnreadable {
            token: token.to_string(),
            reason: e.to_string(),
        })?;

        let token = record.token.unwrap_or_else(|| token.to_string());
        let mut cask = Self::empty(&token, caskroom, ResolvedSource::CoreApi(token.clone()));
        cask.tap = record.tap;
        cask.names = record.name;
        cask.desc = record.desc;
        cask.homepage = record.homepage;
        cask.url = record.url;
        cask.version = record.version;
        cask.sha256 = record.sha256;
        cask.artifacts = record.artifacts;
        if !record.depends_on.is_null() {
            cask.depends_on = record.depends_on;
        }
        cask.conflicts_with = record.conflicts_with;
        cask.auto_updates = record.auto_updates.unwrap_or(false);
        cask.caveats = record.caveats;
        cask.loaded_from_api = true;
        cask.tap_git_head = record.tap_git_head;
        cask.ruby_source_path = record.ruby_source_path;
        cask.ruby_source_checksum = record.ruby_source_checksum.map(|c| c.sha256);
        Ok(cask)
    }

    /// Build from a `cask "token" do ... end` definition.
    pub fn from_source(
        token: &str,
        path: &Path,
        contents: &str,
        platform: &Platform,
        caskroom: &Path,
    ) -> Result<Self> {
        let unreadable = |reason: String| BruError::CaskUnreadable {
            token: token.to_string(),
            reason,
        };

        let document = Document::parse(contents)
            .map_err(|e| unreadable(format!("{}:{}: {}", path.display(), e.line, e.message)))?;
        let casks = document.casks();
        let Some((_, body)) = casks.iter().find(|(declared, _)| *declared == token) else {
            return Err(unreadable(match casks.first() {
                Some((declared, _)) => format!(
                    "{} declares cask '{}' instead",
                    path.display(),
                    declared
                ),
                None => format!("{} does not define a cask", path.display()),
            }));
        };

        let mut cask = Self::empty(token, caskroom, ResolvedSource::LocalPath(path.to_path_buf()));
        cask.sourcefile_path = Some(path.to_path_buf());

        let mut depends_on = Map::new();
        for stmt in active_statements(body, platform) {
            let StatementKind::Call(call) = &stmt.kind else {
                continue;
            };
            if call.receiver.is_some() {
                continue;
            }
            let first_text = || call.arg(0).and_then(Literal::as_text).map(str::to_string);

            match call.method.as_str() {
                "version" => cask.version = first_text(),
                "sha256" => cask.sha256 = first_text(),
                "url" => cask.url = first_text(),
                "name" => cask.names.extend(call.strings().into_iter().map(str::to_string)),
                "desc" => cask.desc = first_text(),
                "homepage" => cask.homepage = first_text(),
                "auto_updates" => {
                    cask.auto_updates = matches!(call.arg(0), Some(Literal::Bool(true)))
                }
                "caveats" => cask.caveats = first_text(),
                "depends_on" => {
                    for (key, value) in &call.kwargs {
                        depends_on.insert(key.clone(), literal_json(value));
                    }
                }
                "conflicts_with" => cask.conflicts_with = Some(kwargs_json(call)),
                stanza if ARTIFACT_STANZAS.contains(&stanza) => {
                    cask.artifacts.push(artifact_json(call));
                }
                _ => {}
            }
        }
        cask.depends_on = Value::Object(depends_on);

        if let Some(version) = cask.version.clone() {
            let interpolate = |text: &mut String| *text = text.replace("#{version}", &version);
            cask.url.iter_mut().for_each(interpolate);
            cask.caveats.iter_mut().for_each(interpolate);
            for artifact in &mut cask.artifacts {
                interpolate_json(artifact, &version);
            }
        }

        tracing::debug!("compiled cask {} from {}", token, path.display());
        Ok(cask)
    }

    /// The token, qualified with its tap outside the official taps.
    pub fn full_name(&self) -> String {
        match &self.tap {
            Some(tap) if tap.split('/').next() != Some("homebrew") => format!("{}/{}", tap, self.token),
            _ => self.token.clone(),
        }
    }

    pub fn is_latest(&self) -> bool {
        self.version.as_deref() == Some("latest")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.caskroom_path.join(METADATA_DIR)
    }

    /// `(version, timestamp)` for every recorded installation, oldest first.
    pub fn timestamped_versions(&self) -> Vec<(String, String)> {
        let Ok(versions) = fs::read_dir(self.metadata_dir()) else {
            return vec![];
        };

        let mut found: Vec<(String, String)> = versions
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .flat_map(|version| {
                let name = version.file_name().to_string_lossy().to_string();
                fs::read_dir(version.path())
                    .into_iter()
                    .flatten()
                    .filter_map(|entry| entry.ok())
                    .map(move |timestamp| {
                        (name.clone(), timestamp.file_name().to_string_lossy().to_string())
                    })
            })
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1));
        found
    }

    /// Installed versions, each once, ordered by its latest installation.
    pub fn versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = Vec::new();
        for (version, _) in self.timestamped_versions() {
            versions.retain(|v| v != &version);
            versions.push(version);
        }
        versions
    }

    pub fn installed_version(&self) -> Option<String> {
        self.versions().pop()
    }

    pub fn is_installed(&self) -> bool {
        !self.versions().is_empty()
    }

    /// Checksum of the download the installed `latest` version came from.
    pub fn installed_download_sha(&self) -> Option<String> {
        fs::read_to_string(self.metadata_dir().join(DOWNLOAD_SHA_FILE))
            .ok()
            .map(|sha| sha.trim().to_string())
            .filter(|sha| !sha.is_empty())
    }

    fn outdated_download_sha(&self, new_download_sha: Option<&str>) -> bool {
        match self.installed_download_sha() {
            Some(installed) => Some(installed.as_str()) != new_download_sha,
            None => true,
        }
    }

    /// Installed versions that differ from the available one.
    ///
    /// `new_download_sha` is the checksum of the current download and only
    /// matters for `latest` casks.
    pub fn outdated_versions(&self, options: OutdatedOptions, new_download_sha: Option<&str>) -> Vec<String> {
        let Some(version) = &self.version else {
            return vec![];
        };

        if self.is_latest() {
            if (options.greedy || options.greedy_latest) && self.outdated_download_sha(new_download_sha) {
                return self.versions();
            }
            return vec![];
        }
        if self.auto_updates && !options.greedy && !options.greedy_auto_updates {
            return vec![];
        }

        let installed = self.versions();
        if installed.last() == Some(version) {
            return vec![];
        }
        installed.into_iter().filter(|v| v != version).collect()
    }

    pub fn is_outdated(&self, options: OutdatedOptions, new_download_sha: Option<&str>) -> bool {
        !self.outdated_versions(options, new_download_sha).is_empty()
    }

    /// App bundle names from the `app` artifacts.
    pub fn apps(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|artifact| artifact.get("app")?.as_array())
            .flatten()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect()
    }
}

fn literal_json(literal: &Literal) -> Value {
    match literal {
        Literal::Str(text) | Literal::Sym(text) | Literal::Expr(text) => Value::String(text.clone()),
        Literal::Int(n) => Value::from(*n),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Nil => Value::Null,
        Literal::Array(items) => Value::Array(items.iter().map(literal_json).collect()),
        Literal::Hash(pairs) => Value::Object(
            pairs
                .iter()
                .filter_map(|(key, value)| Some((key.as_text()?.to_string(), literal_json(value))))
                .collect(),
        ),
    }
}

fn kwargs_json(call: &Call) -> Value {
    Value::Object(
        call.kwargs
            .iter()
            .map(|(key, value)| (key.clone(), literal_json(value)))
            .collect(),
    )
}

fn artifact_json(call: &Call) -> Value {
    let mut args: Vec<Value> = call.args.iter().map(literal_json).collect();
    if !call.kwargs.is_empty() {
        args.push(kwargs_json(call));
    }
    let mut artifact = Map::new();
    artifact.insert(call.method.clone(), Value::Array(args));
    Value::Object(artifact)
}

fn interpolate_json(value: &mut Value, version: &str) {
    match value {
        Value::String(text) => *text = text.replace("#{version}", version),
        Value::Array(items) => items.iter_mut().for_each(|item| interpolate_json(item, version)),
        Value::Object(map) => map.values_mut().for_each(|item| interpolate_json(item, version)),
        _ => {}
    }
}

/// Resolves cask references, sharing compiled casks through the metadata cache.
pub struct CaskLoader {
    api: Api,
    platform: Platform,
}

impl CaskLoader {
    pub fn new(api: Api, platform: Platform) -> Self {
        Self { api, platform }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Switch the platform casks are compiled for, dropping compiled definitions.
    pub fn set_platform(&mut self, platform: Platform) {
        if platform != self.platform {
            tracing::debug!("switching platform {} -> {}", self.platform, platform);
            self.platform = platform;
            self.api.cache().clear_compiled();
        }
    }

    fn caskroom(&self) -> PathBuf {
        self.api.config().caskroom()
    }

    fn api_enabled(&self) -> bool {
        !self.api.config().no_install_from_api
    }

    /// Load the cask `reference` names.
    ///
    /// Tried in order: URL, `.rb`/`.json` path, `user/repo/token`, the cask API,
    /// the core cask tap, then any other tap defining the token.
    pub async fn load(&self, reference: &str) -> Result<Arc<Cask>> {
        if is_url(reference) {
            let path = self.fetch_cask_file(reference).await?;
            return self.from_path(&path, ResolvedSource::RemoteUrl(reference.to_string())).await;
        }

        let path = Path::new(reference);
        if (reference.ends_with(".rb") || reference.ends_with(".json")) && path.is_file() {
            let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            return self.from_path(&path, ResolvedSource::LocalPath(path.clone())).await;
        }

        let taps_dir = self.api.config().taps_dir();
        if let Some((user, repo, token)) = split_tap_reference(reference) {
            let tap = Tap::fetch(&taps_dir, user, repo);
            if tap.is_core_cask() && self.api_enabled() && self.api.has_cask(token).await? {
                return self.from_api(token).await;
            }
            let path = tap.find_cask(self.api.cache(), token);
            if !path.is_file() {
                return Err(BruError::CaskUnavailable(reference.to_string()));
            }
            let source = ResolvedSource::TapQualified {
                tap: tap.name(),
                name: token.to_string(),
            };
            return self.from_path(&path, source).await;
        }

        if self.api_enabled() && self.api.has_cask(reference).await? {
            return self.from_api(reference).await;
        }

        let core = Tap::core_cask(&taps_dir);
        let core_path = core.find_cask(self.api.cache(), reference);
        if core_path.is_file() {
            let source = ResolvedSource::TapQualified {
                tap: core.name(),
                name: reference.to_string(),
            };
            return self.from_path(&core_path, source).await;
        }

        let mut found: Vec<(Tap, PathBuf)> = tap::list_taps(&taps_dir)?
            .into_iter()
            .filter(|tap| !tap.is_core_cask())
            .filter_map(|tap| {
                let path = tap.find_cask(self.api.cache(), reference);
                path.is_file().then_some((tap, path))
            })
            .collect();
        if found.len() > 1 {
            return Err(BruError::CaskTapAmbiguity {
                token: reference.to_string(),
                candidates: found
                    .iter()
                    .map(|(tap, _)| format!("{}/{}", tap, reference))
                    .collect(),
            });
        }
        if let Some((tap, path)) = found.pop() {
            let source = ResolvedSource::TapQualified {
                tap: tap.name(),
                name: reference.to_string(),
            };
            return self.from_path(&path, source).await;
        }

        Err(BruError::CaskUnavailable(reference.to_string()))
    }

    async fn from_api(&self, token: &str) -> Result<Arc<Cask>> {
        let cache = self.api.cache();
        if let Some(Compiled::Cask(cask)) =
            cache.by_api(PackageKind::Cask, token, self.platform).await
        {
            return Ok(cask);
        }

        let record = self
            .api
            .cask_record(token)
            .await?
            .ok_or_else(|| BruError::CaskUnavailable(token.to_string()))?;
        let cask = Arc::new(Cask::from_api(token, &record, &self.platform, &self.caskroom())?);
        cache
            .put_api(
                PackageKind::Cask,
                token,
                self.platform,
                Compiled::Cask(Arc::clone(&cask)),
            )
            .await;
        Ok(cask)
    }

    async fn from_path(&self, path: &Path, source: ResolvedSource) -> Result<Arc<Cask>> {
        let cache = self.api.cache();
        if let Some(Compiled::Cask(cask)) = cache.by_path(path, self.platform).await {
            // The same file can be reached by path or through its tap.
            if cask.source == source {
                return Ok(cask);
            }
            return Ok(Arc::new(Cask {
                source,
                ..Cask::clone(&cask)
            }));
        }

        let token = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BruError::CaskUnavailable(token));
            }
            Err(e) => return Err(e.into()),
        };

        let mut cask = if path.extension().is_some_and(|ext| ext == "json") {
            let record: Value = serde_json::from_str(&contents).map_err(|e| BruError::CaskUnreadable {
                token: token.clone(),
                reason: e.to_string(),
            })?;
            let mut cask = Cask::from_api(&token, &record, &self.platform, &self.caskroom())?;
            cask.sourcefile_path = Some(path.to_path_buf());
            cask
        } else {
            Cask::from_source(&token, path, &contents, &self.platform, &self.caskroom())?
        };

        if cask.tap.is_none()
            && let Some(tap) = Tap::from_path(&self.api.config().taps_dir(), path)
        {
            cask.tap = Some(tap.name());
        }
        cask.source = source;

        let cask = Arc::new(cask);
        cache
            .put_path(path, self.platform, Compiled::Cask(Arc::clone(&cask)))
            .await;
        Ok(cask)
    }

    /// Copy or download the cask file at `url` into the cask cache.
    async fn fetch_cask_file(&self, url: &str) -> Result<PathBuf> {
        let parsed = url::Url::parse(url).map_err(|e| BruError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let basename = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| BruError::CaskUnavailable(url.to_string()))?
            .to_string();

        let dir = self.api.config().cask_cache_dir();
        fs::create_dir_all(&dir)?;
        let target = dir.join(&basename);

        if parsed.scheme() == "file" {
            let local = parsed
                .to_file_path()
                .map_err(|_| BruError::CaskUnavailable(url.to_string()))?;
            fs::copy(&local, &target)?;
        } else {
            tracing::info!("Downloading {}", url);
            self.api.client().download(url, &target, None).await?;
        }
        Ok(target)
    }

    /// Definition text of `cask`: its file when it has one, else the source
    /// recorded in the API at the tap's commit.
    pub async fn source(&self, cask: &Cask) -> Result<Arc<str>> {
        if let Some(path) = &cask.sourcefile_path {
            return Ok(Arc::from(fs::read_to_string(path)?));
        }

        let (Some(path), Some(git_head)) = (&cask.ruby_source_path, &cask.tap_git_head) else {
            return Err(BruError::CaskUnreadable {
                token: cask.token.clone(),
                reason: "no source location recorded".to_string(),
            });
        };
        self.api
            .fetch_cask_source(&cask.token, path, git_head, cask.ruby_source_checksum.as_deref())
            .await
    }
}
