//! Catalog acquisition.
//!
//! A catalog is a small JSON document listing every package a publisher
//! offers, each with its payload digests and URLs. It can live on disk or
//! behind an HTTP endpoint, both roads end in the same [`Catalog`] value
//! which [`crate::catalog::resolve`] then narrows to a concrete package
//! set. Catalogs carry no published digest of their own so they bypass the
//! content cache and are re read on every run.

use crate::{catalog::PackageRecord, Ctx, Error, Path};
use anyhow::Context as _;
use std::io::Read as _;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    /// Publisher supplied snapshot label, eg a date or channel name
    #[serde(default)]
    pub snapshot: Option<String>,
    pub packages: Vec<PackageRecord>,
}

/// Deserializes a catalog document, rejecting one that offers nothing
pub fn parse(contents: &[u8]) -> Result<Catalog, Error> {
    let catalog: Catalog =
        serde_json::from_slice(contents).context("unable to deserialize catalog")?;

    if catalog.packages.is_empty() {
        return Err(anyhow::anyhow!("catalog lists no packages").into());
    }

    tracing::debug!(
        snapshot = catalog.snapshot.as_deref().unwrap_or("unlabeled"),
        packages = catalog.packages.len(),
        "parsed catalog",
    );

    Ok(catalog)
}

/// Reads a catalog from disk
pub fn load(path: &Path) -> Result<Catalog, Error> {
    let contents = std::fs::read(path).with_context(|| format!("unable to read catalog {path}"))?;
    parse(&contents)
}

/// Retrieves a catalog over HTTP
pub fn fetch(ctx: &Ctx, url: &str) -> Result<Catalog, Error> {
    tracing::info!(url, "retrieving catalog");

    let response = ctx
        .agent
        .get(url)
        .call()
        .with_context(|| format!("unable to retrieve catalog from {url}"))?;

    let mut contents = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut contents)
        .with_context(|| format!("unable to read catalog body from {url}"))?;

    parse(&contents)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::Sha256;

    fn sample() -> String {
        format!(
            r#"{{
  "snapshot": "2024-07-09",
  "packages": [
    {{
      "id": "microsoft.vc.crt",
      "version": "14.40.33807",
      "kind": "crt",
      "payloads": [
        {{
          "fileName": "crt_headers.vsix",
          "sha256": "{}",
          "size": 1024,
          "url": "https://example.invalid/crt_headers.vsix",
          "kind": "crt-headers",
          "format": "vsix"
        }},
        {{
          "fileName": "crt_libs_x64.vsix",
          "sha256": "{}",
          "size": 4096,
          "url": "https://example.invalid/crt_libs_x64.vsix",
          "kind": "crt-libs",
          "format": "vsix",
          "arch": "x86_64",
          "variant": "desktop"
        }}
      ]
    }}
  ]
}}"#,
            Sha256::digest(b"headers"),
            Sha256::digest(b"libs"),
        )
    }

    #[test]
    fn parses_catalog_documents() {
        let catalog = parse(sample().as_bytes()).unwrap();

        assert_eq!(catalog.snapshot.as_deref(), Some("2024-07-09"));
        assert_eq!(catalog.packages.len(), 1);

        let pkg = &catalog.packages[0];
        assert_eq!(pkg.id, "microsoft.vc.crt");
        assert_eq!(pkg.kind, crate::PackageKind::Crt);
        assert_eq!(pkg.payloads.len(), 2);
        assert_eq!(pkg.payloads[1].arch, Some(crate::Arch::X86_64));
    }

    #[test]
    fn snapshot_is_optional() {
        let catalog = parse(
            sample()
                .replacen(r#""snapshot": "2024-07-09","#, "", 1)
                .as_bytes(),
        )
        .unwrap();

        assert!(catalog.snapshot.is_none());
    }

    #[test]
    fn empty_catalogs_are_rejected() {
        assert!(parse(br#"{"packages": []}"#).is_err());
        assert!(parse(b"not json").is_err());
    }

    #[test]
    fn loads_from_disk() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("catalog.json");
        std::fs::write(&path, sample()).unwrap();

        let catalog = load(&crate::PathBuf::from_path_buf(path).unwrap()).unwrap();
        assert_eq!(catalog.packages.len(), 1);
    }
}
