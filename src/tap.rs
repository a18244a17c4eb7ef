//! Taps on disk - the repositories package definitions are read from.
//!
//! A tap named `user/repo` lives at `<repository>/Library/Taps/user/homebrew-repo`.
//! Definitions sit in `Formula/` (possibly sharded by first letter),
//! `HomebrewFormula/`, or the tap root; casks in `Casks/`; alias symlinks in
//! `Aliases/`. Renames and cross-tap moves are recorded in
//! `formula_renames.json` and `tap_migrations.json`.

use crate::cache::{MetadataCache, PackageKind};
use crate::error::{BruError, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CORE_TAP: &str = "homebrew/core";
pub const CORE_CASK_TAP: &str = "homebrew/cask";

const RUBY_EXTENSION: &str = "rb";

/// Definition files of one kind in a tap, keyed by file name.
pub type FileIndex = HashMap<String, PathBuf>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tap {
    pub user: String,
    pub repo: String,
    pub path: PathBuf,
}

/// Parse a tap name into (user, repo) components.
/// `"User/homebrew-Repo"` becomes `("user", "repo")`.
pub fn parse_tap_name(name: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(BruError::InvalidTapName(name.to_string()));
    }

    let user = parts[0].to_lowercase();
    let repo = parts[1].to_lowercase();
    let repo = repo.strip_prefix("homebrew-").unwrap_or(&repo).to_string();

    Ok((user, repo))
}

impl Tap {
    pub fn fetch(taps_dir: &Path, user: &str, repo: &str) -> Self {
        let user = user.to_lowercase();
        let repo = repo.to_lowercase();
        let repo = repo.strip_prefix("homebrew-").unwrap_or(&repo).to_string();
        let path = taps_dir.join(&user).join(format!("homebrew-{}", repo));
        Self { user, repo, path }
    }

    pub fn from_name(taps_dir: &Path, name: &str) -> Result<Self> {
        let (user, repo) = parse_tap_name(name)?;
        Ok(Self::fetch(taps_dir, &user, &repo))
    }

    /// The tap a file under `taps_dir` belongs to.
    pub fn from_path(taps_dir: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(taps_dir).ok()?;
        let mut components = relative.components();
        let user = components.next()?.as_os_str().to_str()?;
        let repo = components.next()?.as_os_str().to_str()?;
        components.next()?;
        Some(Self::fetch(taps_dir, user, repo))
    }

    pub fn core(taps_dir: &Path) -> Self {
        Self::fetch(taps_dir, "homebrew", "core")
    }

    pub fn core_cask(taps_dir: &Path) -> Self {
        Self::fetch(taps_dir, "homebrew", "cask")
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.user, self.repo)
    }

    pub fn is_core(&self) -> bool {
        self.name() == CORE_TAP
    }

    pub fn is_core_cask(&self) -> bool {
        self.name() == CORE_CASK_TAP
    }

    pub fn is_installed(&self) -> bool {
        self.path.is_dir()
    }

    pub fn formula_dir(&self) -> PathBuf {
        ["Formula", "HomebrewFormula"]
            .iter()
            .map(|dir| self.path.join(dir))
            .find(|dir| dir.is_dir())
            .unwrap_or_else(|| self.path.clone())
    }

    pub fn cask_dir(&self) -> PathBuf {
        self.path.join("Casks")
    }

    pub fn alias_dir(&self) -> PathBuf {
        self.path.join("Aliases")
    }

    /// Old name to new name. Missing file means no renames.
    pub fn formula_renames(&self) -> Result<HashMap<String, String>> {
        read_string_map(&self.path.join("formula_renames.json"))
    }

    /// Package name to the tap it moved to.
    pub fn tap_migrations(&self) -> Result<HashMap<String, String>> {
        read_string_map(&self.path.join("tap_migrations.json"))
    }

    /// Every definition file under the formula directory, keyed by file name.
    ///
    /// Recurses so letter-sharded layouts (`Formula/f/foo.rb`) are found. The
    /// tap root layout is not recursed into, to keep `Casks/` and friends out.
    pub fn formula_files_by_name(&self) -> FileIndex {
        let dir = self.formula_dir();
        let max_depth = if dir == self.path { 1 } else { usize::MAX };
        ruby_files_by_name(&dir, max_depth)
    }

    pub fn cask_files_by_name(&self) -> FileIndex {
        ruby_files_by_name(&self.cask_dir(), usize::MAX)
    }

    /// Where the definition for `name` is, or would be.
    ///
    /// The directory listing is walked once per tap and kept in `cache`.
    pub fn find_formula(&self, cache: &MetadataCache, name: &str) -> PathBuf {
        let file_name = format!("{}.{}", name, RUBY_EXTENSION);
        cache
            .tap_files(self, PackageKind::Formula)
            .get(&file_name)
            .cloned()
            .unwrap_or_else(|| self.formula_dir().join(file_name))
    }

    pub fn find_cask(&self, cache: &MetadataCache, token: &str) -> PathBuf {
        let file_name = format!("{}.{}", token, RUBY_EXTENSION);
        cache
            .tap_files(self, PackageKind::Cask)
            .get(&file_name)
            .cloned()
            .unwrap_or_else(|| self.cask_dir().join(file_name))
    }
}

impl fmt::Display for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.repo)
    }
}

/// List all installed taps
pub fn list_taps(taps_dir: &Path) -> Result<Vec<Tap>> {
    if !taps_dir.exists() {
        return Ok(vec![]);
    }

    let mut taps = Vec::new();

    for user_entry in fs::read_dir(taps_dir)? {
        let user_entry = user_entry?;
        let user = user_entry.file_name().to_string_lossy().to_string();

        if user.starts_with('.') || !user_entry.path().is_dir() {
            continue;
        }

        for repo_entry in fs::read_dir(user_entry.path())? {
            let repo_entry = repo_entry?;
            let repo = repo_entry.file_name().to_string_lossy().to_string();

            if repo.starts_with('.') || !repo_entry.path().is_dir() {
                continue;
            }

            taps.push(Tap::fetch(taps_dir, &user, &repo));
        }
    }

    taps.sort_by_key(Tap::name);
    Ok(taps)
}

fn ruby_files_by_name(dir: &Path, max_depth: usize) -> FileIndex {
    WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some(RUBY_EXTENSION))
        .map(|entry| {
            let file_name = entry.file_name().to_string_lossy().to_string();
            (file_name, entry.into_path())
        })
        .collect()
}

fn read_string_map(path: &Path) -> Result<HashMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}
