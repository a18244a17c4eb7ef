//! Picking a loader for a reference.
//!
//! The checks run in a fixed order and the first match wins:
//!
//! 1. bottle file or bottle URL
//! 2. any other URL
//! 3. `user/repo/name`
//! 4. an existing `.rb` path
//! 5. the formula API, by name then alias
//! 6. a core tap definition
//! 7. a core tap alias
//! 8. exactly one other tap defining the name
//! 9. a core tap rename
//! 10. exactly one other tap renaming the name
//! 11. the definition copy inside an installed keg
//! 12. a previously downloaded formula file
//! 13. nothing

use super::{Formulary, LoadOrigin, Loader, LoaderKind, resolved};
use crate::bottle;
use crate::error::{BruError, Result};
use crate::formula::ResolvedSource;
use crate::keg;
use crate::tap::{self, Tap};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Longest rename or migration chain followed before giving up.
pub const MAX_RENAME_HOPS: usize = 8;

fn url_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"(https?|ftp|file)://").ok())
        .as_ref()
}

fn tap_formula_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"^([\w-]+)/([\w-]+)/([\w+\-.@]+)$").ok())
        .as_ref()
}

pub(crate) fn is_url(reference: &str) -> bool {
    url_regex().is_some_and(|re| re.is_match(reference))
}

/// Split `user/repo/name`.
pub(crate) fn split_tap_reference(reference: &str) -> Option<(&str, &str, &str)> {
    let captures = tap_formula_regex()?.captures(reference)?;
    Some((
        captures.get(1)?.as_str(),
        captures.get(2)?.as_str(),
        captures.get(3)?.as_str(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameKind {
    Alias,
    Rename,
    Migration,
}

/// Where a name inside a tap ends up after aliases, renames and migrations.
#[derive(Debug, Clone)]
struct TapName {
    tap: Tap,
    name: String,
    kind: Option<NameKind>,
    alias: Option<String>,
}

impl Formulary {
    /// Select the loader for `reference`.
    pub async fn loader_for(&self, reference: &str, from: Option<LoadOrigin>) -> Result<Loader> {
        let loader = self.select_loader(reference, from).await?;
        tracing::debug!("{} resolves to {}", reference, loader.source);
        Ok(loader)
    }

    async fn select_loader(&self, reference: &str, from: Option<LoadOrigin>) -> Result<Loader> {
        if let Some(loader) = self.bottle_loader(reference) {
            return Ok(loader);
        }

        if is_url(reference) {
            return Ok(self.url_loader(reference));
        }

        if let Some((user, repo, name)) = split_tap_reference(reference) {
            let tap = Tap::fetch(&self.config().taps_dir(), user, repo);
            if tap.is_core()
                && self.api_enabled()
                && let Some(loader) = self.api_loader(name).await?
            {
                return Ok(loader);
            }
            return self.tap_loader(tap, name, from).await;
        }

        let path = Path::new(reference);
        if reference.ends_with(".rb") && path.is_file() {
            return Ok(self.path_loader(path));
        }

        if self.api_enabled()
            && let Some(loader) = self.api_loader(reference).await?
        {
            return Ok(loader);
        }

        let core = self.core_tap();
        let core_path = self.core_path(reference);
        if core_path.is_file() {
            let name = file_stem(&core_path);
            let source = ResolvedSource::TapQualified {
                tap: core.name(),
                name: name.clone(),
            };
            return Ok(Loader::new(name, core_path, source, LoaderKind::Formula).in_tap(core));
        }

        let (alias_name, alias_path) = if path.is_absolute() {
            let alias_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            (alias_name, path.to_path_buf())
        } else {
            (reference.to_string(), self.core_alias_path(reference))
        };
        if is_symlink(&alias_path) {
            let target = resolved(alias_path.clone());
            let name = file_stem(&target);
            let source = ResolvedSource::Alias {
                name: alias_name,
                target: name.clone(),
            };
            let tap = Tap::from_path(&self.config().taps_dir(), &alias_path).unwrap_or(core);
            return Ok(Loader::new(name, target, source, LoaderKind::Alias)
                .in_tap(tap)
                .with_alias_path(alias_path));
        }

        let mut candidates = self.tap_paths(reference)?;
        if candidates.len() > 1 {
            return Err(BruError::TapFormulaAmbiguity {
                name: reference.to_string(),
                candidates: candidates
                    .iter()
                    .map(|(tap, path)| format!("{}/{}", tap, file_stem(path)))
                    .collect(),
            });
        }
        if let Some((tap, path)) = candidates.pop() {
            let path = resolved(path);
            let name = file_stem(&path);
            let source = ResolvedSource::TapQualified {
                tap: tap.name(),
                name: name.clone(),
            };
            return Ok(Loader::new(name, path, source, LoaderKind::Formula).in_tap(tap));
        }

        if core.formula_renames()?.contains_key(reference) {
            return self.tap_loader(core, reference, from).await;
        }

        let mut renamed = Vec::new();
        for tap in tap::list_taps(&self.config().taps_dir())? {
            if tap.is_core() {
                continue;
            }
            if let Some(new_name) = tap.formula_renames()?.remove(reference) {
                renamed.push((tap, new_name));
            }
        }
        if renamed.len() > 1 {
            return Err(BruError::TapFormulaWithOldnameAmbiguity {
                name: reference.to_string(),
                candidates: renamed
                    .iter()
                    .map(|(tap, new_name)| format!("{}/{}", tap, new_name))
                    .collect(),
            });
        }
        if let Some((tap, _)) = renamed.pop() {
            return self.tap_loader(tap, reference, from).await;
        }

        if let Some(loader) = self.keg_loader(reference) {
            return Ok(loader);
        }

        let cached = self
            .config()
            .formula_cache_dir()
            .join(format!("{}.rb", reference));
        if cached.is_file() {
            let source = ResolvedSource::CachedFile(cached.clone());
            return Ok(Loader::new(reference, cached, source, LoaderKind::Cached));
        }

        Ok(Loader::null(reference))
    }

    /// Bottle files that exist locally, and bottle URLs.
    fn bottle_loader(&self, reference: &str) -> Option<Loader> {
        if !bottle::is_bottle_reference(reference) {
            return None;
        }

        if is_url(reference) {
            let name = bottle::name_from_url(reference)?;
            let path = bottle::cached_location(&self.config().downloads_dir(), reference);
            let source = ResolvedSource::Bottle(path.clone());
            let kind = LoaderKind::Bottle {
                url: Some(reference.to_string()),
            };
            return Some(Loader::new(name, path, source, kind));
        }

        let path = Path::new(reference);
        if !path.is_file() {
            return None;
        }
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let name = match bottle::resolve_formula_names(&path) {
            Ok(names) => names.name,
            Err(e) => {
                tracing::debug!("no receipt in {}: {}", path.display(), e);
                let file_name = path.file_name()?.to_string_lossy().to_string();
                file_name.split("--").next()?.to_string()
            }
        };
        let source = ResolvedSource::Bottle(path.clone());
        Some(Loader::new(name, path, source, LoaderKind::Bottle { url: None }))
    }

    fn url_loader(&self, url: &str) -> Loader {
        let basename = url::Url::parse(url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|segment| !segment.is_empty())
            .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url).to_string());
        let name = basename.strip_suffix(".rb").unwrap_or(&basename).to_string();
        let path = self.config().formula_cache_dir().join(&basename);
        let kind = LoaderKind::FromUrl {
            url: url.to_string(),
        };
        Loader::new(name, path, ResolvedSource::RemoteUrl(url.to_string()), kind)
    }

    fn path_loader(&self, path: &Path) -> Loader {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let tap = Tap::from_path(&self.config().taps_dir(), &path);
        let source = ResolvedSource::LocalPath(path.clone());
        Loader::new(file_stem(&path), path, source, LoaderKind::FromPath).in_tap(tap)
    }

    /// API record for `reference`, looked up by name and then by alias.
    async fn api_loader(&self, reference: &str) -> Result<Option<Loader>> {
        let (name, source, alias_path) = if self.api.has_formula(reference).await? {
            (
                reference.to_string(),
                ResolvedSource::CoreApi(reference.to_string()),
                None,
            )
        } else if let Some(target) = self.api.formula_alias(reference).await? {
            let source = ResolvedSource::Alias {
                name: reference.to_string(),
                target: target.clone(),
            };
            (target, source, Some(self.core_alias_path(reference)))
        } else {
            return Ok(None);
        };

        let path = self.core_path(&name);
        Ok(Some(
            Loader::new(name, path, source, LoaderKind::Api)
                .in_tap(self.core_tap())
                .with_alias_path(alias_path),
        ))
    }

    /// Loader for `name` inside `tap`, following its aliases, renames and
    /// migrations.
    async fn tap_loader(&self, tap: Tap, name: &str, from: Option<LoadOrigin>) -> Result<Loader> {
        let mut visited = Vec::new();
        let resolved =
            self.tap_formula_name(tap, &name.to_lowercase(), LoadOrigin::warns(from), &mut visited)?;

        if resolved.tap.is_core()
            && resolved.kind.is_some()
            && self.api_enabled()
            && let Some(loader) = self.api_loader(&resolved.name).await?
        {
            return Ok(loader);
        }

        let path = resolved.tap.find_formula(self.api.cache(), &resolved.name);
        let alias_path = resolved
            .alias
            .as_ref()
            .map(|alias| resolved.tap.alias_dir().join(alias));
        let source = ResolvedSource::TapQualified {
            tap: resolved.tap.name(),
            name: resolved.name.clone(),
        };
        Ok(Loader::new(resolved.name, path, source, LoaderKind::Tap)
            .in_tap(resolved.tap)
            .with_alias_path(alias_path))
    }

    fn tap_formula_name(
        &self,
        tap: Tap,
        name: &str,
        warn: bool,
        visited: &mut Vec<String>,
    ) -> Result<TapName> {
        let tapped_name = format!("{}/{}", tap, name);
        if visited.contains(&tapped_name) || visited.len() > MAX_RENAME_HOPS {
            visited.push(tapped_name);
            return Err(BruError::RenameCycle {
                name: visited.first().cloned().unwrap_or_default(),
                chain: visited.clone(),
            });
        }
        visited.push(tapped_name.clone());

        let alias_path = tap.alias_dir().join(name);
        if alias_path.exists()
            && let Some(target) = alias_target(&alias_path)
        {
            return Ok(TapName {
                tap,
                name: target,
                kind: Some(NameKind::Alias),
                alias: Some(name.to_string()),
            });
        }

        let renames = tap.formula_renames()?;
        if renames.contains_key(name) {
            let new_name = follow_renames(&renames, name, &tap)?;
            if warn {
                tracing::warn!(
                    "Use {} instead of deprecated {}",
                    display_name(&tap, &new_name),
                    display_name(&tap, name)
                );
            }
            return Ok(TapName {
                tap,
                name: new_name,
                kind: Some(NameKind::Rename),
                alias: None,
            });
        }

        let migrations = tap.tap_migrations()?;
        if let Some(destination) = migrations.get(name).filter(|d| !d.is_empty()) {
            let mut parts = destination.splitn(3, '/');
            let (Some(user), Some(repo)) = (parts.next(), parts.next()) else {
                return Err(BruError::InvalidTapName(destination.clone()));
            };
            let new_name = parts.next().unwrap_or(name).to_lowercase();
            let new_tap = Tap::fetch(&self.config().taps_dir(), user, repo);

            if new_tap.is_core_cask() {
                tracing::debug!("{} moved to {}, not a formula tap", tapped_name, new_tap);
            } else if new_tap != tap || new_name != name {
                let migrated = self.tap_formula_name(new_tap, &new_name, false, visited)?;
                if warn {
                    tracing::warn!(
                        "Use {} instead of deprecated {}",
                        display_name(&migrated.tap, &migrated.name),
                        display_name(&tap, name)
                    );
                }
                return Ok(TapName {
                    kind: Some(NameKind::Migration),
                    ..migrated
                });
            }
        }

        Ok(TapName {
            tap,
            name: name.to_string(),
            kind: None,
            alias: None,
        })
    }

    /// The definition copy an installed keg keeps under `.brew/`.
    fn keg_loader(&self, reference: &str) -> Option<Loader> {
        let config = self.config();
        let file_name = format!("{}.rb", reference);

        let opt = config.prefix.join("opt").join(reference);
        let definition = opt.join(".brew").join(&file_name);
        if definition.is_file() {
            let source = ResolvedSource::Keg(resolved(opt));
            return Some(Loader::new(reference, definition, source, LoaderKind::Keg));
        }

        let keg = keg::preferred_keg(&config.cellar.join(reference), &config.prefix)?;
        let definition = keg.path.join(".brew").join(&file_name);
        definition.is_file().then(|| {
            let source = ResolvedSource::Keg(keg.path.clone());
            Loader::new(reference, definition, source, LoaderKind::Keg)
        })
    }
}

/// Follow `name` through a rename table to its current name.
pub(crate) fn follow_renames(renames: &HashMap<String, String>, name: &str, tap: &Tap) -> Result<String> {
    let mut chain = vec![name.to_string()];
    let mut current = name;
    while let Some(next) = renames.get(current) {
        let looped = chain.contains(next);
        chain.push(next.clone());
        if looped || chain.len() > MAX_RENAME_HOPS + 1 {
            return Err(BruError::RenameCycle {
                name: format!("{}/{}", tap, name),
                chain,
            });
        }
        current = next;
    }
    Ok(current.to_string())
}

/// Core names are shown bare, everything else tap-qualified.
fn display_name(tap: &Tap, name: &str) -> String {
    if tap.is_core() {
        name.to_string()
    } else {
        format!("{}/{}", tap, name)
    }
}

fn alias_target(alias_path: &Path) -> Option<String> {
    let target = fs::canonicalize(alias_path).ok().or_else(|| {
        let link = fs::read_link(alias_path).ok()?;
        Some(alias_path.parent().map(|dir| dir.join(&link)).unwrap_or(link))
    })?;
    Some(file_stem(&target)).filter(|name| !name.is_empty())
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap() -> Tap {
        Tap::fetch(Path::new("/taps"), "user", "repo")
    }

    fn renames(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(old, new)| (old.to_string(), new.to_string()))
            .collect()
    }

    #[test]
    fn test_url_detection() {
        assert!(is_url("https://example.com/foo.rb"));
        assert!(is_url("file:///tmp/foo.rb"));
        assert!(is_url("ftp://mirror/foo.rb"));
        assert!(!is_url("foo"));
        assert!(!is_url("user/repo/foo"));
    }

    #[test]
    fn test_tap_reference_syntax() {
        assert_eq!(
            split_tap_reference("homebrew/core/python@3.12"),
            Some(("homebrew", "core", "python@3.12"))
        );
        assert_eq!(
            split_tap_reference("user/repo/libxml++"),
            Some(("user", "repo", "libxml++"))
        );
        assert!(split_tap_reference("user/repo").is_none());
        assert!(split_tap_reference("a/b/c/d").is_none());
        assert!(split_tap_reference("./Formula/foo.rb").is_none());
    }

    #[test]
    fn test_rename_chain_followed() {
        let table = renames(&[("a", "b"), ("b", "c")]);
        assert_eq!(follow_renames(&table, "a", &tap()).unwrap(), "c");
        assert_eq!(follow_renames(&table, "c", &tap()).unwrap(), "c");
    }

    #[test]
    fn test_rename_cycle_detected() {
        let table = renames(&[("a", "b"), ("b", "a")]);
        match follow_renames(&table, "a", &tap()) {
            Err(BruError::RenameCycle { chain, .. }) => assert_eq!(chain, ["a", "b", "a"]),
            other => panic!("expected a rename cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_rename_chain_length_capped() {
        let pairs: Vec<(String, String)> = (0..=MAX_RENAME_HOPS)
            .map(|i| (format!("n{}", i), format!("n{}", i + 1)))
            .collect();
        let table: HashMap<String, String> = pairs.into_iter().collect();
        assert!(matches!(
            follow_renames(&table, "n0", &tap()),
            Err(BruError::RenameCycle { .. })
        ));

        let short: HashMap<String, String> = (0..MAX_RENAME_HOPS)
            .map(|i| (format!("n{}", i), format!("n{}", i + 1)))
            .collect();
        assert_eq!(
            follow_renames(&short, "n0", &tap()).unwrap(),
            format!("n{}", MAX_RENAME_HOPS)
        );
    }

    #[test]
    fn test_display_name_bare_for_core() {
        let core = Tap::core(Path::new("/taps"));
        assert_eq!(display_name(&core, "foo"), "foo");
        assert_eq!(display_name(&tap(), "foo"), "user/repo/foo");
    }
}
