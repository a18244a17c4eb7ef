//! Compiled formula definitions.
//!
//! A [`FormulaClass`] is the immutable result of compiling one definition,
//! either from an API record ([`from_api`]) or from source text ([`source`]).
//! Classes are shared behind an `Arc` through the metadata cache, so two
//! lookups of the same definition see the same class.
//!
//! A [`Formula`] is one instance of a class. It adds where the definition was
//! found, the requested and active spec, and the handful of fields the
//! installer sets after construction (`build`, `local_bottle_path`,
//! `follow_installed_alias`).

pub mod from_api;
pub mod source;

use crate::error::{BruError, Result};
use crate::keg::{self, Keg, Tab};
use crate::platform::{Os, Platform, macos_rank};
use crate::tap::Tap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which software spec of a formula is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecKind {
    #[default]
    Stable,
    Head,
}

impl SpecKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpecKind::Stable => "stable",
            SpecKind::Head => "head",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stable" => Some(SpecKind::Stable),
            "head" => Some(SpecKind::Head),
            _ => None,
        }
    }
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Runtime,
    Build,
    Test,
    Recommended,
    Optional,
}

impl DependencyKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "build" => Some(DependencyKind::Build),
            "test" => Some(DependencyKind::Test),
            "recommended" => Some(DependencyKind::Recommended),
            "optional" => Some(DependencyKind::Optional),
            "run" | "runtime" => Some(DependencyKind::Runtime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn new(name: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A dependency macOS provides itself, possibly only `since` some release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsesFromMacos {
    pub name: String,
    pub kind: DependencyKind,
    pub since: Option<String>,
}

impl UsesFromMacos {
    /// Whether the platform lacks the system copy, making this a real dependency.
    pub fn applies_to(&self, platform: &Platform) -> bool {
        match platform.os {
            Os::Linux => true,
            Os::MacOs(version) => match self.since.as_deref().and_then(macos_rank) {
                Some(since) => version.rank() < since,
                None => false,
            },
        }
    }
}

/// Declared dependencies plus the `uses_from_macos` entries the platform needs.
pub fn effective_dependencies(
    declared: &[Dependency],
    uses_from_macos: &[UsesFromMacos],
    platform: &Platform,
) -> Vec<Dependency> {
    let mut dependencies = declared.to_vec();
    for uses in uses_from_macos {
        if uses.applies_to(platform) && !dependencies.iter().any(|d| d.name == uses.name) {
            dependencies.push(Dependency::new(&uses.name, uses.kind));
        }
    }
    dependencies
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub name: String,
    pub version: Option<String>,
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoftwareSpec {
    pub url: String,
    pub tag: Option<String>,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub using: Option<String>,
    pub version: Option<String>,
    pub checksum: Option<String>,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BottleFile {
    pub cellar: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BottleSpec {
    pub root_url: String,
    pub rebuild: u32,
    pub files: BTreeMap<String, BottleFile>,
}

impl BottleSpec {
    /// File for a bottle tag, falling back to the `all` bottle.
    pub fn file_for(&self, tag: &str) -> Option<&BottleFile> {
        self.files.get(tag).or_else(|| self.files.get("all"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KegOnlyReason {
    pub reason: String,
    pub explanation: String,
}

/// `deprecate!`/`disable!` details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lifecycle {
    pub date: String,
    pub because: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub name: String,
    pub because: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub name: String,
    pub url: String,
    pub sha256: Option<String>,
}

/// A compiled definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormulaClass {
    /// Name of the construct the definition declares, e.g. `PythonAT312`.
    pub class_name: String,
    pub name: String,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub revision: u32,
    pub version_scheme: u32,
    pub stable: Option<SoftwareSpec>,
    pub head: Option<SoftwareSpec>,
    pub bottle: Option<BottleSpec>,
    pub keg_only: Option<KegOnlyReason>,
    pub deprecation: Option<Lifecycle>,
    pub disable: Option<Lifecycle>,
    pub uses_from_macos: Vec<UsesFromMacos>,
    pub requirements: Vec<Requirement>,
    pub conflicts: Vec<Conflict>,
    pub link_overwrite: Vec<String>,
    pub resources: Vec<Resource>,
    pub caveats: Option<String>,
    pub service: Option<Value>,
    pub tap_git_head: Option<String>,
    pub oldnames: Vec<String>,
    pub aliases: Vec<String>,
    pub versioned_formulae: Vec<String>,
    pub loaded_from_api: bool,
}

impl FormulaClass {
    /// A class with nothing but its name.
    pub fn empty(name: &str) -> Self {
        Self {
            class_name: class_s(name),
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn spec(&self, kind: SpecKind) -> Option<&SoftwareSpec> {
        match kind {
            SpecKind::Stable => self.stable.as_ref(),
            SpecKind::Head => self.head.as_ref(),
        }
    }
}

/// How a definition was located.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedSource {
    LocalPath(PathBuf),
    RemoteUrl(String),
    TapQualified { tap: String, name: String },
    CoreApi(String),
    Alias { name: String, target: String },
    Bottle(PathBuf),
    Keg(PathBuf),
    CachedFile(PathBuf),
    NotFound,
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSource::LocalPath(path) => write!(f, "path {}", path.display()),
            ResolvedSource::RemoteUrl(url) => write!(f, "URL {}", url),
            ResolvedSource::TapQualified { tap, name } => write!(f, "tap {}/{}", tap, name),
            ResolvedSource::CoreApi(name) => write!(f, "API {}", name),
            ResolvedSource::Alias { name, target } => write!(f, "alias {} -> {}", name, target),
            ResolvedSource::Bottle(path) => write!(f, "bottle {}", path.display()),
            ResolvedSource::Keg(path) => write!(f, "keg {}", path.display()),
            ResolvedSource::CachedFile(path) => write!(f, "cached {}", path.display()),
            ResolvedSource::NotFound => f.write_str("nothing"),
        }
    }
}

/// Where an instance came from, before the class is known.
#[derive(Debug, Clone)]
pub struct Origin {
    pub name: String,
    pub path: PathBuf,
    pub tap: Option<Tap>,
    pub alias_path: Option<PathBuf>,
    pub source: ResolvedSource,
}

/// Context an API record or source file is compiled under.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub platform: Platform,
    pub prefix: PathBuf,
    pub bottle_domain: String,
}

/// One instance of a compiled definition.
#[derive(Debug, Clone)]
pub struct Formula {
    pub name: String,
    /// `user/repo/name` outside the core tap, the bare name inside it.
    pub full_name: String,
    pub path: PathBuf,
    pub class: Arc<FormulaClass>,
    pub source: ResolvedSource,
    pub tap: Option<Tap>,
    pub alias_path: Option<PathBuf>,
    pub requested_spec: SpecKind,
    pub active_spec: SpecKind,
    /// Receipt of the keg this instance was loaded for.
    pub build: Option<Tab>,
    pub local_bottle_path: Option<PathBuf>,
    pub follow_installed_alias: bool,
}

impl Formula {
    pub fn new(class: Arc<FormulaClass>, origin: Origin, requested_spec: SpecKind) -> Result<Self> {
        let active_spec = determine_active_spec(&class, &origin.name, requested_spec)?;
        let full_name = match &origin.tap {
            Some(tap) if !tap.is_core() => format!("{}/{}", tap, origin.name),
            _ => origin.name.clone(),
        };

        Ok(Self {
            name: origin.name,
            full_name,
            path: origin.path,
            class,
            source: origin.source,
            tap: origin.tap,
            alias_path: origin.alias_path,
            requested_spec,
            active_spec,
            build: None,
            local_bottle_path: None,
            follow_installed_alias: true,
        })
    }

    pub fn spec(&self) -> Option<&SoftwareSpec> {
        self.class.spec(self.active_spec)
    }

    /// Switch the active spec. Fails when the formula does not define it.
    pub fn set_active_spec(&mut self, spec: SpecKind) -> Result<()> {
        if self.class.spec(spec).is_none() {
            return Err(BruError::SpecUnavailable {
                name: self.full_name.clone(),
                spec: spec.to_string(),
            });
        }
        self.active_spec = spec;
        Ok(())
    }

    pub fn is_head(&self) -> bool {
        self.active_spec == SpecKind::Head
    }

    pub fn version(&self) -> Option<&str> {
        self.spec().and_then(|spec| spec.version.as_deref())
    }

    /// Version with the `_<revision>` suffix when the revision is non-zero.
    pub fn pkg_version(&self) -> Option<String> {
        let version = self.version()?;
        Some(match self.class.revision {
            0 => version.to_string(),
            revision => format!("{}_{}", version, revision),
        })
    }

    pub fn dependencies(&self) -> &[Dependency] {
        self.spec()
            .map(|spec| spec.dependencies.as_slice())
            .unwrap_or_default()
    }

    pub fn loaded_from_api(&self) -> bool {
        self.class.loaded_from_api
    }

    pub fn is_keg_only(&self) -> bool {
        self.class.keg_only.is_some()
    }

    pub fn is_deprecated(&self) -> bool {
        self.class.deprecation.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.class.disable.is_some()
    }

    pub fn rack(&self, cellar: &Path) -> PathBuf {
        cellar.join(&self.name)
    }

    pub fn installed_kegs(&self, cellar: &Path) -> Vec<Keg> {
        keg::kegs(&self.rack(cellar))
    }

    pub fn any_version_installed(&self, cellar: &Path) -> bool {
        !self.installed_kegs(cellar).is_empty()
    }
}

fn determine_active_spec(class: &FormulaClass, name: &str, requested: SpecKind) -> Result<SpecKind> {
    [requested, SpecKind::Stable, SpecKind::Head]
        .into_iter()
        .find(|kind| class.spec(*kind).is_some())
        .ok_or_else(|| BruError::SpecUnavailable {
            name: name.to_string(),
            spec: requested.to_string(),
        })
}

/// Name of the construct a definition for `name` must declare.
///
/// `foo-bar` becomes `FooBar`, `libxml++` becomes `Libxmlxx`, and
/// `python@3.12` becomes `PythonAT312`.
pub fn class_s(name: &str) -> String {
    let mut chars = name.chars();
    let capitalized: Vec<char> = match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => return String::new(),
    };

    // A separator followed by an alphanumeric is dropped and the alphanumeric upcased.
    let mut class = String::with_capacity(capitalized.len());
    let mut i = 0;
    while i < capitalized.len() {
        let c = capitalized[i];
        let is_separator = matches!(c, '-' | '_' | '.') || c.is_whitespace();
        match capitalized.get(i + 1) {
            Some(next) if is_separator && next.is_ascii_alphanumeric() => {
                class.push(next.to_ascii_uppercase());
                i += 2;
            }
            _ => {
                class.push(if c == '+' { 'x' } else { c });
                i += 1;
            }
        }
    }

    let at = class.char_indices().find(|&(i, c)| {
        c == '@' && i > 0 && class[i + 1..].starts_with(|d: char| d.is_ascii_digit())
    });
    if let Some((at, _)) = at {
        class.replace_range(at..at + 1, "AT");
    }
    class
}

/// Interpolate `#{version}` in a URL or path.
pub(crate) fn interpolate_version(text: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => text.replace("#{version}", version),
        None => text.to_string(),
    }
}
