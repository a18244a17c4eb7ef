//! Installed kegs and their install receipts.
//!
//! ```text
//! <cellar>/ripgrep/                    # rack
//!   13.0.0/                            # keg
//!     INSTALL_RECEIPT.json             # tab
//!     .brew/ripgrep.rb                 # definition copy made at install time
//! <prefix>/opt/ripgrep -> ../Cellar/ripgrep/13.0.0
//! <prefix>/var/homebrew/linked/ripgrep -> ../../../Cellar/ripgrep/13.0.0
//! ```

use crate::error::Result;
use crate::formula::SpecKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Where an installed keg came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub tap: Option<String>,
    #[serde(default)]
    pub spec: Option<String>,
}

/// Install receipt (`INSTALL_RECEIPT.json`), attached to formulae loaded from kegs.
///
/// Only the install source is read; other receipt fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    #[serde(default)]
    pub source: Option<SourceInfo>,
}

impl Tab {
    /// Parse a receipt from its JSON text.
    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Read `<keg>/INSTALL_RECEIPT.json`.
    pub fn read(keg_path: &Path) -> Result<Self> {
        let receipt_path = keg_path.join(RECEIPT_FILE);
        let contents = fs::read_to_string(&receipt_path)?;
        Self::from_json(&contents)
    }

    /// Tab for a keg, or an empty one when the receipt is absent or broken.
    pub fn for_keg(keg: &Keg) -> Self {
        match Self::read(&keg.path) {
            Ok(tab) => tab,
            Err(e) => {
                tracing::debug!("no usable receipt in {}: {}", keg.path.display(), e);
                Self::default()
            }
        }
    }

    /// Tap the keg was installed from, e.g. `homebrew/core`.
    pub fn tap(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|source| source.tap.as_deref())
            .filter(|tap| !tap.is_empty())
    }

    pub fn spec(&self) -> SpecKind {
        self.source
            .as_ref()
            .and_then(|source| source.spec.as_deref())
            .and_then(SpecKind::from_name)
            .unwrap_or_default()
    }
}

/// One installed version of a formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keg {
    pub path: PathBuf,
}

impl Keg {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn rack(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }

    pub fn name(&self) -> String {
        file_name(self.rack())
    }

    pub fn version(&self) -> String {
        file_name(&self.path)
    }

    /// `<prefix>/var/homebrew/linked/<name>` points at this keg.
    pub fn is_linked(&self, prefix: &Path) -> bool {
        let record = prefix.join("var/homebrew/linked").join(self.name());
        record.is_symlink() && record.is_dir() && self.resolves_to_self(&record)
    }

    /// `<prefix>/opt/<name>` points at this keg.
    pub fn is_optlinked(&self, prefix: &Path) -> bool {
        let record = prefix.join("opt").join(self.name());
        record.is_symlink() && self.resolves_to_self(&record)
    }

    fn resolves_to_self(&self, record: &Path) -> bool {
        match (fs::canonicalize(record), fs::canonicalize(&self.path)) {
            (Ok(target), Ok(own)) => target == own,
            _ => false,
        }
    }
}

/// Kegs under a rack, in directory order. A missing rack has none.
pub fn kegs(rack: &Path) -> Vec<Keg> {
    let Ok(entries) = fs::read_dir(rack) else {
        return vec![];
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| Keg::new(entry.path()))
        .collect()
}

/// Pick the keg a rack stands for: linked, then opt-linked, then newest.
pub fn preferred_keg(rack: &Path, prefix: &Path) -> Option<Keg> {
    let kegs = kegs(rack);
    if let Some(keg) = kegs.iter().find(|keg| keg.is_linked(prefix)) {
        return Some(keg.clone());
    }
    if let Some(keg) = kegs.iter().find(|keg| keg.is_optlinked(prefix)) {
        return Some(keg.clone());
    }
    kegs.into_iter()
        .max_by(|a, b| compare_versions(&a.version(), &b.version()))
}

/// Compare two version strings numerically, component by component.
///
/// The revision suffix (`1.2.3_1`) counts as a trailing component.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(['.', '_'])
            .filter_map(|s| s.parse::<u64>().ok())
            .collect()
    };
    let a_parts = parse(a);
    let b_parts = parse(b);

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    // Fall back to lexicographic
    a.cmp(b)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2.3_1", "1.2.3"), Ordering::Greater);
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn test_tab_source_fields() {
        let tab = Tab::from_json(
            r#"{
                "homebrew_version": "4.2.0",
                "poured_from_bottle": true,
                "runtime_dependencies": [{"full_name": "bar", "version": {"weird": 1}}],
                "source": {"tap": "homebrew/core", "spec": "head", "path": "/x/foo.rb"}
            }"#,
        )
        .unwrap();
        assert_eq!(tab.tap(), Some("homebrew/core"));
        assert_eq!(tab.spec(), SpecKind::Head);

        let empty = Tab::default();
        assert_eq!(empty.tap(), None);
        assert_eq!(empty.spec(), SpecKind::Stable);
    }

    #[test]
    fn test_preferred_keg_order() {
        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path();
        let rack = prefix.join("Cellar/foo");
        for version in ["1.0", "1.10", "1.9"] {
            fs::create_dir_all(rack.join(version)).unwrap();
        }

        let newest = preferred_keg(&rack, prefix).unwrap();
        assert_eq!(newest.version(), "1.10");

        fs::create_dir_all(prefix.join("opt")).unwrap();
        symlink(rack.join("1.9"), prefix.join("opt/foo")).unwrap();
        assert_eq!(preferred_keg(&rack, prefix).unwrap().version(), "1.9");

        fs::create_dir_all(prefix.join("var/homebrew/linked")).unwrap();
        symlink(rack.join("1.0"), prefix.join("var/homebrew/linked/foo")).unwrap();
        assert_eq!(preferred_keg(&rack, prefix).unwrap().version(), "1.0");
    }

    #[test]
    fn test_missing_rack_has_no_kegs() {
        let tmp = TempDir::new().unwrap();
        assert!(kegs(&tmp.path().join("Cellar/none")).is_empty());
        assert!(preferred_keg(&tmp.path().join("Cellar/none"), tmp.path()).is_none());
    }
}
