use std::path::PathBuf;
use thiserror::Error;

/// Why a signed API payload was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("key not found")]
    KeyNotFound,

    #[error("invalid algorithm")]
    UnsupportedAlgorithm,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

#[derive(Error, Debug)]
pub enum BruError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("No file found at {0}")]
    NoFileFound(String),

    #[error("Invalid JSON file: {0}")]
    InvalidJson(String),

    #[error("Cannot download non-corrupt {0}!")]
    CannotDownload(String),

    #[error(
        "Failed to verify integrity ({source}) of:\n  {url}\nPotential MITM attempt detected. Please run `brew update` and try again."
    )]
    Integrity {
        url: String,
        #[source]
        source: IntegrityError,
    },

    #[error("Need to download {0} but cannot as root! Run `brew update` without `sudo` first then try again.")]
    DownloadAsRootRefused(String),

    #[error("SHA256 mismatch\nExpected: {expected}\n  Actual: {actual}\n     URL: {url}")]
    Sha256Mismatch {
        expected: String,
        actual: String,
        url: String,
    },

    #[error("Invalid tap name '{0}'. Expected 'user/repo'")]
    InvalidTapName(String),

    #[error("Invalid API record for {name}: {reason}")]
    InvalidApiRecord { name: String, reason: String },

    #[error("No available formula with the name \"{0}\".")]
    FormulaUnavailable(String),

    #[error("No available formula with the name \"{tap}/{name}\".")]
    TapFormulaUnavailable { tap: String, name: String },

    #[error("{name}: {reason}")]
    FormulaUnreadable { name: String, reason: String },

    #[error("{tap}/{name}: {reason}")]
    TapFormulaUnreadable {
        tap: String,
        name: String,
        reason: String,
    },

    #[error("{}", class_unavailable_message(.name, .path, .class_name, .class_list))]
    FormulaClassUnavailable {
        name: String,
        path: PathBuf,
        class_name: String,
        class_list: Vec<String>,
    },

    #[error("{tap}/{}", class_unavailable_message(.name, .path, .class_name, .class_list))]
    TapFormulaClassUnavailable {
        tap: String,
        name: String,
        path: PathBuf,
        class_name: String,
        class_list: Vec<String>,
    },

    #[error("This bottle does not contain the formula file:\n  {}", .0.display())]
    BottleFormulaUnavailable(PathBuf),

    #[error("Invalid bottle {}: {reason}", .path.display())]
    InvalidBottle { path: PathBuf, reason: String },

    #[error("{0}")]
    UnsupportedInstallationMethod(String),

    #[error(
        "Formulae found in multiple taps: {}\nPlease use the fully-qualified name (e.g. {}) to refer to the formula.",
        .candidates.join(", "),
        .candidates.first().map(String::as_str).unwrap_or("user/repo/name")
    )]
    TapFormulaAmbiguity { name: String, candidates: Vec<String> },

    #[error(
        "Formulae with '{name}' old name found in multiple taps: {}\nPlease use the fully-qualified name (e.g. {}) to refer to the formula or use its new name.",
        .candidates.join(", "),
        .candidates.first().map(String::as_str).unwrap_or("user/repo/name")
    )]
    TapFormulaWithOldnameAmbiguity { name: String, candidates: Vec<String> },

    #[error("Formula rename chain for '{name}' does not terminate: {}", .chain.join(" -> "))]
    RenameCycle { name: String, chain: Vec<String> },

    #[error("Formula loading disabled by HOMEBREW_DISABLE_LOAD_FORMULA!")]
    LoadingDisabled,

    #[error("Cask '{0}' is unavailable: No Cask with this name exists.")]
    CaskUnavailable(String),

    #[error("Cask '{token}' is unreadable: {reason}")]
    CaskUnreadable { token: String, reason: String },

    #[error(
        "Cask '{token}' exists in multiple taps: {}",
        .candidates.join(", ")
    )]
    CaskTapAmbiguity { token: String, candidates: Vec<String> },

    #[error("Formula {name} has no {spec} specification")]
    SpecUnavailable { name: String, spec: String },
}

fn class_unavailable_message(
    name: &str,
    path: &std::path::Path,
    class_name: &str,
    class_list: &[String],
) -> String {
    let found = if class_list.is_empty() {
        "No formula classes were found.".to_string()
    } else {
        format!("The file defines these classes: {}", class_list.join(", "))
    };
    format!(
        "{name}: The formula file {} was found, but it does not define the expected class {class_name}.\n{found}",
        path.display()
    )
}

impl BruError {
    /// Nothing could be loaded for the reference; the spelling is the likely problem.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BruError::FormulaUnavailable(_)
                | BruError::TapFormulaUnavailable { .. }
                | BruError::CaskUnavailable(_)
        )
    }

    pub fn is_ambiguity(&self) -> bool {
        matches!(
            self,
            BruError::TapFormulaAmbiguity { .. }
                | BruError::TapFormulaWithOldnameAmbiguity { .. }
                | BruError::CaskTapAmbiguity { .. }
        )
    }

    /// The definition was found but its source is broken.
    pub fn is_unreadable(&self) -> bool {
        matches!(
            self,
            BruError::FormulaUnreadable { .. }
                | BruError::TapFormulaUnreadable { .. }
                | BruError::FormulaClassUnavailable { .. }
                | BruError::TapFormulaClassUnavailable { .. }
                | BruError::CaskUnreadable { .. }
        )
    }

    /// Re-tag a load failure with the tap that owns the definition.
    pub(crate) fn into_tap_qualified(self, tap: &str) -> Self {
        match self {
            BruError::FormulaUnavailable(name) => BruError::TapFormulaUnavailable {
                tap: tap.to_string(),
                name,
            },
            BruError::FormulaUnreadable { name, reason } => BruError::TapFormulaUnreadable {
                tap: tap.to_string(),
                name,
                reason,
            },
            BruError::FormulaClassUnavailable {
                name,
                path,
                class_name,
                class_list,
            } => BruError::TapFormulaClassUnavailable {
                tap: tap.to_string(),
                name,
                path,
                class_name,
                class_list,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, BruError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_qualification_keeps_kind() {
        let err = BruError::FormulaUnavailable("foo".into()).into_tap_qualified("user/repo");
        assert!(err.is_unavailable());
        assert_eq!(
            err.to_string(),
            "No available formula with the name \"user/repo/foo\"."
        );

        let err = BruError::FormulaUnreadable {
            name: "foo".into(),
            reason: "unterminated string".into(),
        }
        .into_tap_qualified("user/repo");
        assert!(err.is_unreadable());
        assert!(matches!(err, BruError::TapFormulaUnreadable { .. }));
    }

    #[test]
    fn test_ambiguity_lists_candidates() {
        let err = BruError::TapFormulaAmbiguity {
            name: "foo".into(),
            candidates: vec!["a/b/foo".into(), "c/d/foo".into()],
        };
        let message = err.to_string();
        assert!(message.contains("a/b/foo, c/d/foo"));
        assert!(err.is_ambiguity());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_class_unavailable_lists_defined_classes() {
        let err = BruError::FormulaClassUnavailable {
            name: "foo".into(),
            path: PathBuf::from("/tmp/foo.rb"),
            class_name: "Foo".into(),
            class_list: vec!["Bar".into(), "Baz".into()],
        };
        let message = err.to_string();
        assert!(message.contains("expected class Foo"));
        assert!(message.contains("Bar, Baz"));
    }
}
