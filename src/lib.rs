#![doc = include_str!("../README.md")]

use anyhow::Context as _;
pub use camino::{Utf8Path as Path, Utf8PathBuf as PathBuf};
use std::fmt;

pub mod cache;
pub mod catalog;
mod ctx;
mod error;
mod fetch;
pub mod manifest;
pub mod pipeline;
pub mod splat;
pub mod unpack;
pub mod util;

pub use cache::{ContentCache, DiskCache, MemoryCache};
pub use ctx::Ctx;
pub use error::Error;
pub use fetch::{FetchSource, RetryPolicy};
pub use pipeline::{execute, Cancel, ExecConfig, NullProgress, Ops, Progress, RunSummary, State};
pub use splat::SplatConfig;
pub use ureq;

/// Architecture an output tree targets, one per run
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86,
    X86_64,
    Aarch,
    Aarch64,
}

impl std::str::FromStr for Arch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Microsoft's own directory notation is accepted as well, payload
        // paths and users both speak it
        Ok(match s {
            "x86" => Self::X86,
            "x86_64" | "x64" => Self::X86_64,
            "aarch" | "arm" => Self::Aarch,
            "aarch64" | "arm64" => Self::Aarch64,
            o => anyhow::bail!("unknown architecture '{o}'"),
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Arch {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
            Self::Aarch => "aarch",
            Self::Aarch64 => "aarch64",
        }
    }

    /// The name Microsoft packaging uses for the architecture
    #[inline]
    pub fn as_ms_str(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X86_64 => "x64",
            Self::Aarch => "arm",
            Self::Aarch64 => "arm64",
        }
    }
}

/// CRT flavor, one per run. Every variant of the catalog also comes in a
/// spectre mitigated form.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Desktop,
    OneCore,
    Store,
    Spectre,
}

impl std::str::FromStr for Variant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "desktop" => Self::Desktop,
            "onecore" => Self::OneCore,
            "store" => Self::Store,
            "spectre" => Self::Spectre,
            o => anyhow::bail!("unknown variant '{o}'"),
        })
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::OneCore => "onecore",
            Self::Store => "store",
            Self::Spectre => "spectre",
        }
    }
}

/// The two package families a resolution always produces, the CRT taking
/// precedence over the SDK wherever their contents overlap
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Crt,
    Sdk,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Crt => "crt",
            Self::Sdk => "sdk",
        })
    }
}

/// What a payload contributes to the output tree, which also determines how
/// its container is unpacked and splatted
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    CrtHeaders,
    CrtLibs,
    SdkHeaders,
    SdkLibs,
    UcrtHeadersLibs,
}

impl PayloadKind {
    /// The package family a payload belongs to, UCRT payloads ride inside
    /// the SDK
    #[inline]
    pub fn package(self) -> PackageKind {
        match self {
            Self::CrtHeaders | Self::CrtLibs => PackageKind::Crt,
            Self::SdkHeaders | Self::SdkLibs | Self::UcrtHeadersLibs => PackageKind::Sdk,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrtHeaders => "crt-headers",
            Self::CrtLibs => "crt-libs",
            Self::SdkHeaders => "sdk-headers",
            Self::SdkLibs => "sdk-libs",
            Self::UcrtHeadersLibs => "ucrt-headers-libs",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(unix)]
#[inline]
fn symlink(original: &str, link: &Path) -> anyhow::Result<()> {
    std::os::unix::fs::symlink(original, link)
        .with_context(|| format!("unable to symlink from {link} to {original}"))
}

#[cfg(windows)]
#[inline]
fn symlink(_original: &str, _link: &Path) -> anyhow::Result<()> {
    // Creating symlinks requires elevation, the strategy probe never
    // observes one and falls through to hard links or copies
    Ok(())
}
