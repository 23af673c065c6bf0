//! Typed model of the package catalog and its resolution.
//!
//! The catalog arrives already parsed, a flat list of [`PackageRecord`]s.
//! Resolution narrows that list to exactly one CRT and one SDK package for
//! the requested target, payload filtering included, and is deliberately
//! pure so the same records and request always produce the same answer.

use crate::{unpack::ArchiveFormat, util::Sha256, Arch, Error, PackageKind, PayloadKind, Variant};
use std::cmp::Ordering;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    /// Stable identity within the catalog, eg `Microsoft.VC.14.38.CRT`
    pub id: String,
    pub version: String,
    pub kind: PackageKind,
    /// Absent means the package applies to every architecture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    /// Absent means the package applies to every variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    pub payloads: Vec<PayloadRecord>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRecord {
    pub file_name: String,
    pub sha256: Sha256,
    pub size: u64,
    pub url: String,
    pub kind: PayloadKind,
    pub format: ArchiveFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
}

/// What the caller asked to provision, one target per invocation
#[derive(Debug, Clone)]
pub struct Request {
    pub arch: Arch,
    pub variant: Variant,
    /// Pin the CRT to this exact catalog version instead of the latest
    pub crt_version: Option<String>,
    /// Pin the SDK to this exact catalog version instead of the latest
    pub sdk_version: Option<String>,
}

/// The concrete package set for a request, one CRT and one SDK package.
/// UCRT payloads ride inside the SDK package.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub crt: PackageRecord,
    pub sdk: PackageRecord,
}

impl Resolution {
    pub fn packages(&self) -> impl Iterator<Item = &PackageRecord> {
        [&self.crt, &self.sdk].into_iter()
    }

    pub fn payload_count(&self) -> usize {
        self.packages().map(|pkg| pkg.payloads.len()).sum()
    }
}

/// Orders loose version strings, parseable versions beat unparseable ones
/// and exact ties fall back to the lexicographically greatest string so the
/// outcome never depends on input order
fn cmp_version(a: &str, b: &str) -> Ordering {
    match (versions::Version::new(a), versions::Version::new(b)) {
        (Some(av), Some(bv)) => av.cmp(&bv).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

fn compatible(arch: Option<Arch>, variant: Option<Variant>, request: &Request) -> bool {
    arch.map_or(true, |a| a == request.arch) && variant.map_or(true, |v| v == request.variant)
}

fn resolve_kind(
    records: &[PackageRecord],
    request: &Request,
    kind: PackageKind,
    pin: Option<&str>,
) -> Result<PackageRecord, Error> {
    let unresolved = |detail: String| Error::UnresolvedRequest {
        kind,
        arch: request.arch,
        variant: request.variant,
        detail,
    };

    let mut candidates: Vec<_> = records
        .iter()
        .filter(|rec| rec.kind == kind && compatible(rec.arch, rec.variant, request))
        .collect();

    // Canonical order, also collapses records listed twice
    candidates.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.version.cmp(&b.version)));
    candidates.dedup_by(|a, b| a.id == b.id && a.version == b.version);

    if let Some(pin) = pin {
        candidates.retain(|rec| rec.version == pin);
        if candidates.is_empty() {
            return Err(unresolved(format!(
                "pinned version '{pin}' is not in the catalog"
            )));
        }
    }

    let winner = candidates
        .into_iter()
        .max_by(|a, b| cmp_version(&a.version, &b.version))
        .ok_or_else(|| unresolved("no candidate packages in the catalog".to_owned()))?;

    let mut pkg = winner.clone();
    pkg.payloads
        .retain(|pl| compatible(pl.arch, pl.variant, request));

    if pkg.payloads.is_empty() {
        return Err(unresolved(format!(
            "package '{}' has no payloads for the target",
            pkg.id
        )));
    }

    tracing::debug!(
        kind = %kind,
        id = %pkg.id,
        version = %pkg.version,
        payloads = pkg.payloads.len(),
        "resolved package",
    );

    Ok(pkg)
}

/// Narrows the catalog to exactly one CRT and one SDK package for the
/// request, highest version winning unless a pin says otherwise
pub fn resolve(records: &[PackageRecord], request: &Request) -> Result<Resolution, Error> {
    let crt = resolve_kind(records, request, PackageKind::Crt, request.crt_version.as_deref())?;
    let sdk = resolve_kind(records, request, PackageKind::Sdk, request.sdk_version.as_deref())?;

    Ok(Resolution { crt, sdk })
}
