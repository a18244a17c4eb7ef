//! Bottle references and the definitions stored inside bottles.
//!
//! A bottle is a gzipped tarball of a keg:
//! ```text
//! foo--1.2.3.arm64_sonoma.bottle.1.tar.gz
//!   foo/1.2.3/INSTALL_RECEIPT.json
//!   foo/1.2.3/.brew/foo.rb
//!   foo/1.2.3/bin/...
//! ```
//!
//! Only the receipt and the `.brew` definition copy are read here; unpacking
//! bottles into the Cellar is the installer's job.

use crate::error::{BruError, Result};
use crate::keg::{RECEIPT_FILE, Tab};
use crate::tap::Tap;
use flate2::read::GzDecoder;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tar::Archive;

fn extname_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"\.([a-z0-9_]+)\.bottle\.(?:(\d+)\.)?tar\.gz$").ok())
        .as_ref()
}

/// Whether `reference` names a bottle file (local path or URL).
pub fn is_bottle_reference(reference: &str) -> bool {
    extname_regex().is_some_and(|re| re.is_match(reference))
}

/// Bottle tag and rebuild number from a bottle filename.
pub fn parse_extname(reference: &str) -> Option<(String, u32)> {
    let captures = extname_regex()?.captures(reference)?;
    let tag = captures.get(1)?.as_str().to_string();
    let rebuild = captures
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    Some((tag, rebuild))
}

/// Formula name from a bottle URL: the basename up to its last hyphen.
pub fn name_from_url(url: &str) -> Option<String> {
    let basename = url.rsplit('/').next()?;
    let (name, _) = basename.rsplit_once('-')?;
    // `foo--1.0.tar.gz` leaves a trailing hyphen on the name part.
    let name = name.trim_end_matches('-');
    (!name.is_empty()).then(|| name.to_string())
}

/// Where a downloaded file for `url` is kept: `<downloads>/<sha256(url)>--<basename>`.
pub fn cached_location(downloads_dir: &Path, url: &str) -> PathBuf {
    let basename = url.rsplit('/').next().unwrap_or(url);
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    downloads_dir.join(format!("{}--{}", digest, basename))
}

/// Identity recorded inside a bottle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottleNames {
    pub name: String,
    /// `user/repo/name` for non-core taps, the bare name otherwise.
    pub full_name: String,
    pub version: String,
}

/// Read the receipt inside `bottle` and derive the formula's names.
pub fn resolve_formula_names(bottle: &Path) -> Result<BottleNames> {
    let mut archive = open(bottle)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let parts: Vec<String> = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();

        if let [name, version, file] = parts.as_slice()
            && file == RECEIPT_FILE
        {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            let tab = Tab::from_json(&contents)?;

            let full_name = match tab.tap() {
                Some(tap) if !is_core_tap_name(tap) => format!("{}/{}", tap, name),
                _ => name.clone(),
            };
            return Ok(BottleNames {
                name: name.clone(),
                full_name,
                version: version.clone(),
            });
        }
    }

    Err(BruError::InvalidBottle {
        path: bottle.to_path_buf(),
        reason: format!("no {} found", RECEIPT_FILE),
    })
}

/// Definition text stored in the bottle at `<name>/<version>/.brew/<name>.rb`.
pub fn formula_contents(bottle: &Path, names: &BottleNames) -> Result<String> {
    let wanted = PathBuf::from(&names.name)
        .join(&names.version)
        .join(".brew")
        .join(format!("{}.rb", names.name));

    let mut archive = open(bottle)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()? == wanted {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(BruError::BottleFormulaUnavailable(bottle.join(wanted)))
}

fn open(bottle: &Path) -> Result<Archive<GzDecoder<fs::File>>> {
    let file = fs::File::open(bottle)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn is_core_tap_name(tap: &str) -> bool {
    Tap::from_name(Path::new(""), tap)
        .map(|tap| tap.is_core())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn write_bottle(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("foo--1.2.3.arm64_sonoma.bottle.tar.gz");
        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_bottle_reference_pattern() {
        assert!(is_bottle_reference("foo--1.0.arm64_sonoma.bottle.tar.gz"));
        assert!(is_bottle_reference("/tmp/foo--1.0.x86_64_linux.bottle.2.tar.gz"));
        assert!(!is_bottle_reference("foo-1.0.tar.gz"));
        assert!(!is_bottle_reference("foo.rb"));

        assert_eq!(
            parse_extname("foo--1.0.x86_64_linux.bottle.2.tar.gz"),
            Some(("x86_64_linux".to_string(), 2))
        );
        assert_eq!(
            parse_extname("foo--1.0.sonoma.bottle.tar.gz"),
            Some(("sonoma".to_string(), 0))
        );
    }

    #[test]
    fn test_name_from_url() {
        assert_eq!(
            name_from_url("https://example.com/b/foo--1.0.sonoma.bottle.tar.gz").as_deref(),
            Some("foo")
        );
        assert_eq!(
            name_from_url("https://example.com/b/foo-bar-1.0.sonoma.bottle.tar.gz").as_deref(),
            Some("foo-bar")
        );
    }

    #[test]
    fn test_cached_location_prefix() {
        let path = cached_location(Path::new("/cache/downloads"), "https://x.test/a/foo.rb");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let (digest, basename) = name.split_once("--").unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(basename, "foo.rb");
    }

    #[test]
    fn test_names_from_receipt() {
        let tmp = TempDir::new().unwrap();
        let bottle = write_bottle(
            tmp.path(),
            &[(
                "foo/1.2.3/INSTALL_RECEIPT.json",
                r#"{"source":{"tap":"user/tools","spec":"stable"}}"#,
            )],
        );

        let names = resolve_formula_names(&bottle).unwrap();
        assert_eq!(names.name, "foo");
        assert_eq!(names.version, "1.2.3");
        assert_eq!(names.full_name, "user/tools/foo");
    }

    #[test]
    fn test_core_bottle_full_name_is_bare() {
        let tmp = TempDir::new().unwrap();
        let bottle = write_bottle(
            tmp.path(),
            &[(
                "foo/1.2.3/INSTALL_RECEIPT.json",
                r#"{"source":{"tap":"homebrew/core"}}"#,
            )],
        );
        assert_eq!(resolve_formula_names(&bottle).unwrap().full_name, "foo");
    }

    #[test]
    fn test_formula_contents() {
        let tmp = TempDir::new().unwrap();
        let bottle = write_bottle(
            tmp.path(),
            &[
                ("foo/1.2.3/INSTALL_RECEIPT.json", "{}"),
                ("foo/1.2.3/.brew/foo.rb", "class Foo < Formula\nend\n"),
            ],
        );
        let names = resolve_formula_names(&bottle).unwrap();
        assert!(formula_contents(&bottle, &names).unwrap().contains("class Foo"));
    }

    #[test]
    fn test_missing_definition_in_bottle() {
        let tmp = TempDir::new().unwrap();
        let bottle = write_bottle(tmp.path(), &[("foo/1.2.3/INSTALL_RECEIPT.json", "{}")]);
        let names = resolve_formula_names(&bottle).unwrap();
        assert!(matches!(
            formula_contents(&bottle, &names),
            Err(BruError::BottleFormulaUnavailable(_))
        ));
    }

    #[test]
    fn test_bottle_without_receipt() {
        let tmp = TempDir::new().unwrap();
        let bottle = write_bottle(tmp.path(), &[("foo/1.2.3/bin/foo", "#!/bin/sh\n")]);
        assert!(matches!(
            resolve_formula_names(&bottle),
            Err(BruError::InvalidBottle { .. })
        ));
    }
}
