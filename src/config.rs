//! Environment-derived configuration.
//!
//! Everything the resolver and API fetcher need to know about the host is read
//! once into an [`EnvConfig`] at startup and handed to the components that need
//! it. Nothing below this module reads the environment directly.

use std::path::{Path, PathBuf};

/// Base URL of the official metadata CDN. Fallback target for a custom `api_domain`.
pub const DEFAULT_API_DOMAIN: &str = "https://formulae.brew.sh/api";

/// Base URL bottles are served from when no mirror is configured.
pub const DEFAULT_BOTTLE_DOMAIN: &str = "https://ghcr.io/v2/homebrew/core";

const DEFAULT_API_AUTO_UPDATE_SECS: u64 = 450;
const DEFAULT_CURL_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Primary metadata CDN base URL.
    pub api_domain: String,
    pub bottle_domain: String,
    /// Disables API-sourced resolution entirely.
    pub no_install_from_api: bool,
    pub no_auto_update: bool,
    pub api_auto_update_secs: u64,
    /// Bounds the parse-failure retry loop when fetching API files.
    pub curl_retries: u32,
    /// Set by commands that are allowed to refresh stale API data.
    pub auto_update_command: bool,
    pub running_as_root_but_not_owned_by_root: bool,
    pub disable_load_formula: bool,
    pub prefix: PathBuf,
    pub repository: PathBuf,
    pub cellar: PathBuf,
    pub cache: PathBuf,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::for_prefix(detect_prefix())
    }
}

impl EnvConfig {
    /// Configuration rooted at `prefix` with every other setting at its default.
    pub fn for_prefix(prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        let repository = default_repository(&prefix);
        Self {
            api_domain: DEFAULT_API_DOMAIN.to_string(),
            bottle_domain: DEFAULT_BOTTLE_DOMAIN.to_string(),
            no_install_from_api: false,
            no_auto_update: false,
            api_auto_update_secs: DEFAULT_API_AUTO_UPDATE_SECS,
            curl_retries: DEFAULT_CURL_RETRIES,
            auto_update_command: false,
            running_as_root_but_not_owned_by_root: false,
            disable_load_formula: false,
            cellar: prefix.join("Cellar"),
            cache: default_cache_dir(),
            repository,
            prefix,
        }
    }

    /// Read the `HOMEBREW_*` environment.
    pub fn from_env() -> Self {
        let mut config = match std::env::var_os("HOMEBREW_PREFIX") {
            Some(prefix) => Self::for_prefix(prefix),
            None => Self::default(),
        };

        if let Some(repository) = std::env::var_os("HOMEBREW_REPOSITORY") {
            config.repository = PathBuf::from(repository);
        }
        if let Some(cellar) = std::env::var_os("HOMEBREW_CELLAR") {
            config.cellar = PathBuf::from(cellar);
        }
        if let Some(cache) = std::env::var_os("HOMEBREW_CACHE") {
            config.cache = PathBuf::from(cache);
        }
        if let Some(domain) = env_string("HOMEBREW_API_DOMAIN") {
            config.api_domain = domain.trim_end_matches('/').to_string();
        }
        if let Some(domain) = env_string("HOMEBREW_BOTTLE_DOMAIN") {
            config.bottle_domain = domain.trim_end_matches('/').to_string();
        }

        config.no_install_from_api = env_bool("HOMEBREW_NO_INSTALL_FROM_API");
        config.no_auto_update = env_bool("HOMEBREW_NO_AUTO_UPDATE");
        config.disable_load_formula = env_bool("HOMEBREW_DISABLE_LOAD_FORMULA");
        config.api_auto_update_secs =
            env_number("HOMEBREW_API_AUTO_UPDATE_SECS").unwrap_or(DEFAULT_API_AUTO_UPDATE_SECS);
        config.curl_retries =
            env_number("HOMEBREW_CURL_RETRIES").unwrap_or(DEFAULT_CURL_RETRIES);
        config.running_as_root_but_not_owned_by_root =
            running_as_root_but_not_owned_by_root(&config.repository);

        config
    }

    pub fn taps_dir(&self) -> PathBuf {
        self.repository.join("Library/Taps")
    }

    /// Directory holding one file per API endpoint plus the names lists.
    pub fn api_cache_dir(&self) -> PathBuf {
        self.cache.join("api")
    }

    /// Formula files downloaded from URLs.
    pub fn formula_cache_dir(&self) -> PathBuf {
        self.cache.join("Formula")
    }

    pub fn cask_cache_dir(&self) -> PathBuf {
        self.cache.join("Cask")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache.join("downloads")
    }

    pub fn caskroom(&self) -> PathBuf {
        self.prefix.join("Caskroom")
    }
}

/// Detect the Homebrew prefix on this system
pub fn detect_prefix() -> PathBuf {
    if let Ok(prefix) = std::env::var("HOMEBREW_PREFIX") {
        return PathBuf::from(prefix);
    }

    #[cfg(target_arch = "aarch64")]
    {
        PathBuf::from("/opt/homebrew")
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        PathBuf::from("/usr/local")
    }
}

fn default_repository(prefix: &Path) -> PathBuf {
    // Intel macOS keeps the git checkout one level below the prefix.
    if prefix == Path::new("/usr/local") {
        prefix.join("Homebrew")
    } else {
        prefix.to_path_buf()
    }
}

fn default_cache_dir() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    if cfg!(target_os = "macos") {
        if let Some(home) = home {
            return home.join("Library/Caches/Homebrew");
        }
    } else if let Some(cache_home) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(cache_home).join("Homebrew");
    } else if let Some(home) = home {
        return home.join(".cache/Homebrew");
    }
    PathBuf::from(".cache/Homebrew")
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Homebrew treats any non-empty value as set.
fn env_bool(key: &str) -> bool {
    env_string(key).is_some()
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| parse_number(&v))
}

/// Out-of-range or malformed values are ignored.
fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn running_as_root_but_not_owned_by_root(repository: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if !rustix::process::geteuid().is_root() {
            return false;
        }
        std::fs::metadata(repository)
            .map(|meta| meta.uid() != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = repository;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_prefix_layout() {
        let config = EnvConfig::for_prefix("/opt/homebrew");
        assert_eq!(config.cellar, PathBuf::from("/opt/homebrew/Cellar"));
        assert_eq!(config.repository, PathBuf::from("/opt/homebrew"));
        assert_eq!(
            config.taps_dir(),
            PathBuf::from("/opt/homebrew/Library/Taps")
        );
        assert_eq!(config.api_domain, DEFAULT_API_DOMAIN);
        assert_eq!(config.curl_retries, 3);
        assert_eq!(config.api_auto_update_secs, 450);
    }

    #[test]
    fn test_intel_repository_lives_below_prefix() {
        let config = EnvConfig::for_prefix("/usr/local");
        assert_eq!(config.repository, PathBuf::from("/usr/local/Homebrew"));
    }

    #[test]
    fn test_cache_subdirectories() {
        let mut config = EnvConfig::for_prefix("/opt/homebrew");
        config.cache = PathBuf::from("/tmp/cache");
        assert_eq!(config.api_cache_dir(), PathBuf::from("/tmp/cache/api"));
        assert_eq!(config.formula_cache_dir(), PathBuf::from("/tmp/cache/Formula"));
        assert_eq!(config.downloads_dir(), PathBuf::from("/tmp/cache/downloads"));
    }

    #[test]
    fn test_retry_count_out_of_range_is_ignored() {
        assert_eq!(parse_number::<u32>(" 5 "), Some(5));
        assert_eq!(parse_number::<u32>("4294967296"), None);
        assert_eq!(parse_number::<u32>("-1"), None);
        assert_eq!(
            parse_number::<u32>("4294967296").unwrap_or(DEFAULT_CURL_RETRIES),
            DEFAULT_CURL_RETRIES
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_privilege_check_requires_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let expected = rustix::process::geteuid().is_root()
            && std::fs::metadata(tmp.path())
                .map(|meta| std::os::unix::fs::MetadataExt::uid(&meta) != 0)
                .unwrap_or(false);
        assert_eq!(running_as_root_but_not_owned_by_root(tmp.path()), expected);
    }
}
