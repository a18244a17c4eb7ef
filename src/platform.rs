//! Platform context for bottle tags and variation overlays.
//!
//! API records carry per-platform overrides keyed by bottle tag, and definition
//! source text may contain `on_macos`/`on_linux`/`on_arm` blocks. Both are
//! evaluated against a [`Platform`], which is either the host platform or a
//! simulated one chosen by the caller.
//!
//! # Bottle Tag Format
//!
//! - Intel macOS: the bare OS name, e.g. `sonoma`
//! - Apple Silicon macOS: `arm64_<os>`, e.g. `arm64_sequoia`
//! - Linux: `<arch>_linux`, e.g. `x86_64_linux`, `arm64_linux`
//!
//! # Examples
//!
//! ```
//! use brulary::platform::{Arch, MacOsVersion, Os, Platform};
//!
//! let platform = Platform::new(Os::MacOs(MacOsVersion::Sonoma), Arch::Arm64);
//! assert_eq!(platform.bottle_tag(), "arm64_sonoma");
//! ```

#[cfg(target_os = "macos")]
use std::process::Command;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MacOsVersion {
    BigSur,
    Monterey,
    Ventura,
    Sonoma,
    Sequoia,
    Tahoe,
}

impl MacOsVersion {
    pub const ALL: [MacOsVersion; 6] = [
        MacOsVersion::BigSur,
        MacOsVersion::Monterey,
        MacOsVersion::Ventura,
        MacOsVersion::Sonoma,
        MacOsVersion::Sequoia,
        MacOsVersion::Tahoe,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MacOsVersion::BigSur => "big_sur",
            MacOsVersion::Monterey => "monterey",
            MacOsVersion::Ventura => "ventura",
            MacOsVersion::Sonoma => "sonoma",
            MacOsVersion::Sequoia => "sequoia",
            MacOsVersion::Tahoe => "tahoe",
        }
    }

    /// Marketing version number as used in API requirement records.
    pub fn number(self) -> &'static str {
        match self {
            MacOsVersion::BigSur => "11",
            MacOsVersion::Monterey => "12",
            MacOsVersion::Ventura => "13",
            MacOsVersion::Sonoma => "14",
            MacOsVersion::Sequoia => "15",
            MacOsVersion::Tahoe => "26",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }

    pub fn rank(self) -> usize {
        LEGACY_MACOS.len() + self as usize
    }

    /// Map a `sw_vers -productVersion` string to a release.
    pub fn from_product_version(version: &str) -> Self {
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        match major {
            26 | 16 => MacOsVersion::Tahoe,
            15 => MacOsVersion::Sequoia,
            14 => MacOsVersion::Sonoma,
            13 => MacOsVersion::Ventura,
            12 => MacOsVersion::Monterey,
            11 => MacOsVersion::BigSur,
            _ => MacOsVersion::Sonoma,
        }
    }
}

/// Releases older than the bottled range, oldest first. Only needed to read
/// version bounds in requirements and `on_<os>` blocks.
const LEGACY_MACOS: [(&str, &str); 5] = [
    ("el_capitan", "10.11"),
    ("sierra", "10.12"),
    ("high_sierra", "10.13"),
    ("mojave", "10.14"),
    ("catalina", "10.15"),
];

/// Release name for a marketing version number, e.g. `"10.15"` -> `"catalina"`.
pub fn macos_name_for_number(number: &str) -> Option<&'static str> {
    LEGACY_MACOS
        .iter()
        .find(|(_, n)| *n == number)
        .map(|(name, _)| *name)
        .or_else(|| {
            MacOsVersion::ALL
                .into_iter()
                .find(|v| v.number() == number)
                .map(MacOsVersion::name)
        })
}

/// Chronological position of a release name among all known releases.
pub fn macos_rank(name: &str) -> Option<usize> {
    if let Some(index) = LEGACY_MACOS.iter().position(|(n, _)| *n == name) {
        return Some(index);
    }
    MacOsVersion::from_name(name).map(MacOsVersion::rank)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    MacOs(MacOsVersion),
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Arm64,
    X86_64,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86_64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "arm64" | "arm" | "aarch64" => Some(Arch::Arm64),
            "x86_64" | "intel" => Some(Arch::X86_64),
            _ => None,
        }
    }
}

/// The platform definitions are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Detect the host platform.
    pub fn current() -> Self {
        let arch = match std::env::consts::ARCH {
            "aarch64" => Arch::Arm64,
            _ => Arch::X86_64,
        };

        #[cfg(target_os = "macos")]
        {
            let version = macos_version().unwrap_or_default();
            Self::new(Os::MacOs(MacOsVersion::from_product_version(&version)), arch)
        }

        #[cfg(not(target_os = "macos"))]
        {
            Self::new(Os::Linux, arch)
        }
    }

    pub fn is_macos(&self) -> bool {
        matches!(self.os, Os::MacOs(_))
    }

    pub fn is_linux(&self) -> bool {
        self.os == Os::Linux
    }

    pub fn os_name(&self) -> &'static str {
        match self.os {
            Os::MacOs(version) => version.name(),
            Os::Linux => "linux",
        }
    }

    /// Tag used for bottle files and API variation overlays.
    pub fn bottle_tag(&self) -> String {
        match (self.os, self.arch) {
            (Os::MacOs(version), Arch::X86_64) => version.name().to_string(),
            (os, arch) => {
                let os = match os {
                    Os::MacOs(version) => version.name(),
                    Os::Linux => "linux",
                };
                format!("{}_{}", arch.name(), os)
            }
        }
    }

    /// Parse a bottle tag back into a platform.
    pub fn from_bottle_tag(tag: &str) -> Option<Self> {
        if let Some(version) = MacOsVersion::from_name(tag) {
            return Some(Self::new(Os::MacOs(version), Arch::X86_64));
        }
        let (arch, os) = tag.split_once('_').and_then(|(arch, os)| {
            // "x86_64_linux" splits on the first underscore inside the arch.
            if arch == "x86" {
                os.strip_prefix("64_").map(|os| ("x86_64", os))
            } else {
                Some((arch, os))
            }
        })?;
        let arch = Arch::from_name(arch)?;
        let os = if os == "linux" {
            Os::Linux
        } else {
            Os::MacOs(MacOsVersion::from_name(os)?)
        };
        Some(Self::new(os, arch))
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bottle_tag())
    }
}

#[cfg(target_os = "macos")]
fn macos_version() -> Option<String> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()?;

    String::from_utf8(output.stdout)
        .ok()
        .map(|v| v.trim().to_string())
}
